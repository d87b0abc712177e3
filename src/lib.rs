//! Hierarchical, parallel statechart core with an actor-model interpreter.
//!
//! `statechart` splits the classic SCXML-style semantics into two halves:
//!
//! - A **pure transition engine**: `(state, event) -> next state`, over charts
//!   with nested (OR) and parallel (AND) regions, guarded transitions,
//!   internal/external transition semantics, history pseudo-states, and
//!   deterministic action ordering. No timers, no I/O — equal inputs give
//!   structurally equal outputs.
//! - A **side-effecting interpreter** that drives macrosteps over the engine:
//!   external event queue, raised internal events, eventless ("always")
//!   transitions, delayed sends on the tokio clock, and child actors spawned
//!   from machines, futures, callbacks, or streams.
//!
//! ## Quick start
//!
//! Charts are data, declared through a fluent builder; the pure machine is
//! usable on its own:
//!
//! ```rust
//! use statechart::{action, to, Machine};
//!
//! let machine = Machine::builder("door", ())
//!     .initial("closed")
//!     .state("closed", |s| s.on("OPEN", to("open")))
//!     .state("open", |s| {
//!         s.entry(action("ring", |_, _| {}))
//!             .on("CLOSE", to("closed"))
//!     })
//!     .build()?;
//!
//! let state = machine.initial_state()?;
//! assert!(state.matches("closed"));
//!
//! let state = machine.transition(&state, "OPEN")?;
//! assert!(state.matches("open"));
//! assert_eq!(state.changed, Some(true));
//! # Ok::<(), statechart::ChartError>(())
//! ```
//!
//! ## Running a service
//!
//! The interpreter owns the mailbox and the queue discipline: internal raised
//! events drain before the next external event, eventless transitions are
//! retried until the configuration is quiescent, and `send` from inside a
//! macrostep lands in the mailbox instead of re-entering.
//!
//! ```rust
//! use statechart::{assign, interpret, stay, Machine};
//!
//! #[derive(Clone, PartialEq)]
//! struct Counter {
//!     count: u32,
//! }
//!
//! let machine = Machine::builder("counter", Counter { count: 0 })
//!     .initial("active")
//!     .state("active", |s| {
//!         s.on(
//!             "INC",
//!             stay().action(assign(|ctx: &Counter, _| Counter {
//!                 count: ctx.count + 1,
//!             })),
//!         )
//!     })
//!     .build()?;
//!
//! let mut service = interpret(machine)?;
//! service.start()?;
//! service.send("INC")?;
//! service.send("INC")?;
//! assert_eq!(service.state().context.count, 2);
//! # Ok::<(), statechart::ChartError>(())
//! ```
//!
//! ## Actors
//!
//! An `assign` may spawn child actors — other machines, promises (futures),
//! callback workers, or observable streams. Outside a live interpreter the
//! returned [`ActorRef`] is a *null actor*: `send` is a callable no-op, so
//! reading `initial_state().context` never requires a running service. The
//! interpreter activates deferred actors when the transition commits; a
//! promise's resolution arrives as `done.invoke.<id>`, its rejection as
//! `error.execution`, and machine children report completion the same way.
//! Actors stop when their owning state exits, when the parent stops, or when
//! they complete on their own.
//!
//! Timers (delayed sends and `after` transitions) ride the tokio clock, so
//! tests can pause and advance time with `tokio::time`; `run` awaits the
//! mailbox and the next deadline, while `fire_due_timers` supports
//! cooperative polling hosts.

// Module declarations
pub mod action;
pub mod actor;
pub mod builder;
pub mod error;
pub mod event;
pub mod interpreter;
pub mod machine;
pub mod state;
pub mod value;

mod chart;
mod engine;
mod resolver;

// Re-export the main surface for convenience
pub use action::{
    action, assign, assign_with, cancel, log, log_expr, raise, send, send_parent, try_action,
    ActionDef, ActivityHandle, Guard, SendDef, SendTarget,
};
pub use actor::{ActorRef, ActorSource, CallbackEmitter, CallbackReceiver, SpawnOptions, Spawner};
pub use builder::{stay, to, MachineBuilder, StateBuilder, TransitionConfig};
pub use error::{ChartError, ChartResult};
pub use event::{Event, EventKind, ScxmlEvent};
pub use interpreter::{interpret, Interpreter, ServiceHandle, ServiceStatus};
pub use machine::{Machine, MachineContext};
pub use state::{HistoryValue, State};
pub use value::StateValue;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct LightCtx {
        cycles: u32,
    }

    fn light() -> Machine<LightCtx> {
        Machine::builder("light", LightCtx { cycles: 0 })
            .initial("green")
            .state("green", |s| s.on("TIMER", to("yellow")))
            .state("yellow", |s| s.on("TIMER", to("red")))
            .state("red", |s| {
                s.on(
                    "TIMER",
                    to("green").action(assign(|ctx: &LightCtx, _| LightCtx {
                        cycles: ctx.cycles + 1,
                    })),
                )
            })
            .build()
            .unwrap()
    }

    #[test]
    fn walks_through_the_cycle() {
        let machine = light();
        let state = machine.initial_state().unwrap();
        assert!(state.matches("green"));
        assert_eq!(state.changed, None);

        let state = machine.transition(&state, "TIMER").unwrap();
        assert!(state.matches("yellow"));
        let state = machine.transition(&state, "TIMER").unwrap();
        assert!(state.matches("red"));
        let state = machine.transition(&state, "TIMER").unwrap();
        assert!(state.matches("green"));
        assert_eq!(state.context.cycles, 1);
    }

    #[test]
    fn unhandled_events_leave_the_state_unchanged() {
        let machine = light();
        let state = machine.initial_state().unwrap();
        let state = machine.transition(&state, "NOT_A_THING").unwrap();
        assert!(state.matches("green"));
        assert_eq!(state.changed, Some(false));
        assert!(state.actions.is_empty());
    }

    #[test]
    fn next_events_lists_the_selectable_descriptors() {
        let machine = light();
        let state = machine.initial_state().unwrap();
        assert_eq!(state.next_events, vec!["TIMER".to_string()]);
    }
}
