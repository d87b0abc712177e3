//! Guards, conflicts, bad references, and snapshot corners
//!
//! What it tests:
//! - Guard evaluation order, wildcard matching, failing guards
//! - Conflict resolution between nested sources (deeper wins)
//! - `UnknownState` surfacing from `transition`, structural errors at build
//! - `State::inert` / `State::from_value` / the detached matcher
//!
//! Why it matters:
//! - These are the paths a chart author hits the day the chart is wrong, so
//!   the failure mode has to be the documented one, not a panic.

use statechart::{
    action, stay, to, ChartError, Event, Guard, Machine, State, StateValue, TransitionConfig,
};

#[test]
fn guards_are_checked_in_document_order() {
    let machine = Machine::builder("gate", 5i64)
        .initial("idle")
        .state("idle", |s| {
            s.on(
                "CHECK",
                TransitionConfig::to("big").guard(Guard::new("over10", |ctx: &i64, _| *ctx > 10)),
            )
            .on(
                "CHECK",
                TransitionConfig::to("small").guard(Guard::new("under10", |ctx: &i64, _| *ctx <= 10)),
            )
        })
        .state("big", |s| s)
        .state("small", |s| s)
        .build()
        .unwrap();

    let initial = machine.initial_state().unwrap();
    let next = machine.transition(&initial, "CHECK").unwrap();
    assert!(next.matches("small"));
}

#[test]
fn failing_guard_skips_the_transition_without_aborting() {
    let machine = Machine::builder("gate", ())
        .initial("idle")
        .state("idle", |s| {
            s.on(
                "CHECK",
                TransitionConfig::to("never")
                    .guard(Guard::try_new("broken", |_, _| Err("guard blew up".to_string()))),
            )
            .on("CHECK", to("fallback"))
        })
        .state("never", |s| s)
        .state("fallback", |s| s)
        .build()
        .unwrap();

    let initial = machine.initial_state().unwrap();
    let next = machine.transition(&initial, "CHECK").unwrap();
    assert!(next.matches("fallback"));
}

#[test]
fn wildcard_matches_named_events_only() {
    let machine = Machine::builder("sink", ())
        .initial("idle")
        .state("idle", |s| s.on("KNOWN", to("known")).on("*", to("other")))
        .state("known", |s| s)
        .state("other", |s| s)
        .build()
        .unwrap();

    let initial = machine.initial_state().unwrap();
    assert!(machine.transition(&initial, "KNOWN").unwrap().matches("known"));
    assert!(machine.transition(&initial, "SURPRISE").unwrap().matches("other"));
    // The wildcard is excluded from next_events.
    assert_eq!(initial.next_events, vec!["KNOWN".to_string()]);
}

#[test]
fn deeper_source_wins_conflicts() {
    let machine = Machine::builder("nested", ())
        .initial("outer")
        .state("outer", |s| {
            s.initial("inner")
                .on("GO", to("#nested.by_outer"))
                .state("inner", |i| i.on("GO", to("#nested.by_inner")))
        })
        .state("by_outer", |s| s)
        .state("by_inner", |s| s)
        .build()
        .unwrap();

    let initial = machine.initial_state().unwrap();
    let next = machine.transition(&initial, "GO").unwrap();
    assert!(next.matches("by_inner"));
}

#[test]
fn unknown_target_errors_from_transition() {
    let machine = Machine::builder("typo", ())
        .initial("idle")
        .state("idle", |s| s.on("GO", to("nowhere")))
        .build()
        .unwrap();

    let initial = machine.initial_state().unwrap();
    let error = machine.transition(&initial, "GO").unwrap_err();
    assert_eq!(
        error,
        ChartError::UnknownState {
            id: "nowhere".to_string()
        }
    );
}

#[test]
fn structural_errors_surface_at_build_time() {
    let no_regions = Machine::builder("solo", ())
        .parallel()
        .state("only", |s| s)
        .build();
    assert!(matches!(no_regions, Err(ChartError::InvalidConfig(_))));

    let cyclic = Machine::builder("cyclic", ())
        .initial("a")
        .state("a", |s| s.initial("#cyclic.a").state("b", |b| b))
        .build();
    assert!(matches!(cyclic, Err(ChartError::InitialCycle { .. })));

    let unknown_initial = Machine::builder("missing", ())
        .initial("ghost")
        .state("real", |s| s)
        .build();
    assert!(matches!(unknown_initial, Err(ChartError::UnknownState { .. })));
}

#[test]
fn inert_strips_actions_and_is_identity_when_empty() {
    let machine = Machine::builder("door", ())
        .initial("closed")
        .state("closed", |s| {
            s.entry(action("creak", |_, _| {})).on("OPEN", to("open"))
        })
        .state("open", |s| s)
        .build()
        .unwrap();

    let initial = machine.initial_state().unwrap();
    assert!(!initial.actions.is_empty());
    let inert = initial.inert();
    assert!(inert.actions.is_empty());

    let naturally_inert = machine.transition(&inert, "NOPE").unwrap();
    assert!(naturally_inert.actions.is_empty());
    let value_before = naturally_inert.value.clone();
    let still_inert = naturally_inert.inert();
    assert!(still_inert.actions.is_empty());
    assert_eq!(still_inert.value, value_before);
}

#[test]
fn from_value_fabricates_a_usable_state() {
    let machine = Machine::builder("door", ())
        .initial("closed")
        .state("closed", |s| s.on("OPEN", to("open")))
        .state("open", |s| s.on("CLOSE", to("closed")))
        .build()
        .unwrap();

    let fabricated: State<()> = State::from_value("open", ());
    assert!(fabricated.actions.is_empty());
    let next = machine.transition(&fabricated, "CLOSE").unwrap();
    assert!(next.matches("closed"));
}

#[test]
fn detached_matcher_keeps_its_snapshot() {
    let machine = Machine::builder("door", ())
        .initial("closed")
        .state("closed", |s| s.on("OPEN", to("open")))
        .state("open", |s| s)
        .build()
        .unwrap();

    let initial = machine.initial_state().unwrap();
    let was_closed = initial.matcher();
    let opened = machine.transition(&initial, "OPEN").unwrap();
    drop(initial);
    assert!(was_closed("closed"));
    assert!(!was_closed("open"));
    assert!(opened.matches("open"));
}

#[test]
fn targetless_actionless_transitions_are_noops() {
    let machine = Machine::builder("quiet", ())
        .initial("idle")
        .state("idle", |s| s.on("PING", stay()))
        .build()
        .unwrap();

    let initial = machine.initial_state().unwrap();
    let next = machine.transition(&initial, "PING").unwrap();
    assert_eq!(next.changed, Some(false));
    assert!(next.actions.is_empty());
    assert_eq!(next.value, StateValue::leaf("idle"));
}

#[test]
fn event_payloads_reach_guards_and_actions() {
    let machine = Machine::builder("inbox", 0i64)
        .initial("empty")
        .state("empty", |s| {
            s.on(
                "RECEIVE",
                TransitionConfig::to("full")
                    .when(|_, ev: &Event| ev.data["count"].as_i64().unwrap_or(0) > 0)
                    .action(statechart::assign(|_, ev: &Event| {
                        ev.data["count"].as_i64().unwrap_or(0)
                    })),
            )
        })
        .state("full", |s| s)
        .build()
        .unwrap();

    let initial = machine.initial_state().unwrap();
    let ignored = machine
        .transition(&initial, Event::with_data("RECEIVE", serde_json::json!({ "count": 0 })))
        .unwrap();
    assert!(ignored.matches("empty"));

    let next = machine
        .transition(&initial, Event::with_data("RECEIVE", serde_json::json!({ "count": 7 })))
        .unwrap();
    assert!(next.matches("full"));
    assert_eq!(next.context, 7);
}
