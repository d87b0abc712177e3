//! State snapshots over the wire
//!
//! What it tests:
//! - The JSON shape (`value`, `context`, `event`, `_event`, `actions`,
//!   `children`, `historyValue`, `done`)
//! - `State::create` rehydrates a snapshot that transitions identically to
//!   the original, including through a stringify round trip
//! - History survives serialization; children rehydrate as null actors
//!
//! Why it matters:
//! - Snapshots are how callers persist and resume sessions; a lossy round
//!   trip corrupts every resumed machine.

use serde::{Deserialize, Serialize};
use statechart::{action, assign, to, Machine, State, StateValue};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct SessionCtx {
    visits: u32,
}

fn machine() -> Machine<SessionCtx> {
    Machine::builder("session", SessionCtx { visits: 0 })
        .initial("lobby")
        .state("lobby", |s| {
            s.on(
                "ENTER",
                to("room.bed").action(assign(|ctx: &SessionCtx, _| SessionCtx {
                    visits: ctx.visits + 1,
                })),
            )
        })
        .state("room", |s| {
            s.initial("bed")
                .on("LEAVE", to("#session.lobby"))
                .state("bed", |b| b.on("WAKE", to("desk")))
                .state("desk", |d| {
                    d.entry(action("lamp", |_, _| {}))
                })
                .state("hist", |h| h.shallow_history())
        })
        .build()
        .unwrap()
}

#[test]
fn wire_shape_has_the_documented_fields() {
    let machine = machine();
    let state = machine
        .transition(&machine.initial_state().unwrap(), "ENTER")
        .unwrap();
    let json = state.to_json().unwrap();

    assert_eq!(json["value"], serde_json::json!({ "room": "bed" }));
    assert_eq!(json["context"]["visits"], 1);
    assert_eq!(json["event"]["type"], "ENTER");
    assert_eq!(json["_event"]["name"], "ENTER");
    assert_eq!(json["_event"]["type"], "external");
    assert!(json["actions"].is_array());
    assert_eq!(json["done"], false);
}

#[test]
fn stringified_snapshot_transitions_like_the_original() {
    let machine = machine();
    let original = machine
        .transition(&machine.initial_state().unwrap(), "ENTER")
        .unwrap();

    let text = serde_json::to_string(&original.to_json().unwrap()).unwrap();
    let revived: State<SessionCtx> =
        State::create(serde_json::from_str(&text).unwrap()).unwrap();

    assert_eq!(revived.value, original.value);
    assert_eq!(revived.context, original.context);

    for event in ["WAKE", "LEAVE", "UNKNOWN"] {
        let from_original = machine.transition(&original, event).unwrap();
        let from_revived = machine.transition(&revived, event).unwrap();
        assert_eq!(from_original.value, from_revived.value, "event {event}");
        assert_eq!(from_original.context, from_revived.context);
        assert_eq!(from_original.actions, from_revived.actions);
        assert_eq!(from_original.changed, from_revived.changed);
        assert_eq!(from_original.next_events, from_revived.next_events);
    }
}

#[test]
fn history_survives_the_round_trip() {
    let machine = machine();
    let initial = machine.initial_state().unwrap();
    let desk = machine
        .transition(&machine.transition(&initial, "ENTER").unwrap(), "WAKE")
        .unwrap();
    let lobby = machine.transition(&desk, "LEAVE").unwrap();
    assert!(lobby.matches("lobby"));

    let revived: State<SessionCtx> = State::create(lobby.to_json().unwrap()).unwrap();
    let back = machine
        .transition(&revived, statechart::Event::new("ENTER"))
        .unwrap();
    // ENTER targets room.bed directly, so no history is consulted here; but
    // the recorded value must still be present on the snapshot.
    assert_eq!(
        revived.history_value.get("session.room"),
        Some(&StateValue::leaf("desk"))
    );
    assert!(back.matches("room.bed"));
}

#[test]
fn rehydrated_actions_are_inert_descriptors() {
    let machine = machine();
    let initial = machine.initial_state().unwrap();
    let entered = machine.transition(&initial, "ENTER").unwrap();
    let desk = machine.transition(&entered, "WAKE").unwrap();
    assert!(desk.actions.iter().any(|a| a.name() == "lamp"));

    let revived: State<SessionCtx> = State::create(desk.to_json().unwrap()).unwrap();
    let names: Vec<&str> = revived.actions.iter().map(|a| a.name()).collect();
    assert!(names.contains(&"lamp"));
    // Identity on descriptors, closure or not.
    assert_eq!(revived.actions, desk.actions);
}

#[test]
fn children_rehydrate_as_null_actors() {
    use statechart::{assign_with, ActorSource, SpawnOptions};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Ctx {
        #[serde(skip)]
        probe: Option<statechart::ActorRef>,
    }

    let machine = Machine::builder("host", Ctx { probe: None })
        .initial("holding")
        .state("holding", |s| {
            s.entry(assign_with(|_, _, spawner| Ctx {
                probe: Some(spawner.spawn_with(
                    ActorSource::promise(async { Ok(serde_json::Value::Null) }),
                    SpawnOptions::named("probe-1"),
                )),
            }))
        })
        .build()
        .unwrap();

    let initial = machine.initial_state().unwrap();
    let json = initial.to_json().unwrap();
    assert_eq!(json["children"], serde_json::json!(["probe-1"]));

    let revived: State<Ctx> = State::create(json).unwrap();
    let actor = revived.children.get("probe-1").unwrap();
    actor.send("PING");
    assert_eq!(actor.id(), "probe-1");
}
