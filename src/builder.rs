//! Fluent builder API for declaring charts
//!
//! The chart DSL is data: nested states, transition lists per event, entry
//! and exit actions, delay tables. `Machine::builder` starts a
//! [`MachineBuilder`]; child states are declared with closures so the nesting
//! in code mirrors the nesting in the chart:
//!
//! ```rust
//! use statechart::{to, stay, action, Machine};
//!
//! let machine = Machine::builder("door", ())
//!     .initial("closed")
//!     .state("closed", |s| {
//!         s.on("OPEN", to("open"))
//!             .on("KNOCK", stay().action(action("ring", |_, _| {})))
//!     })
//!     .state("open", |s| s.on("CLOSE", to("closed")))
//!     .build()
//!     .unwrap();
//! assert_eq!(machine.initial_state().unwrap().value, "closed".into());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{ActionDef, ActivityFn, ActivityHandle, Guard};
use crate::chart::{Chart, HistoryKind};
use crate::error::ChartResult;
use crate::machine::{Machine, MachineContext};

/// Node kind requested by the configuration; the chart infers
/// atomic/compound from the default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum ConfigKind {
    #[default]
    Default,
    Parallel,
    Final,
    History(HistoryKind),
}

/// Raw configuration of one state node.
pub(crate) struct StateConfig<C> {
    pub kind: ConfigKind,
    pub initial: Option<String>,
    pub states: Vec<(String, StateConfig<C>)>,
    pub on: Vec<(String, Vec<TransitionConfig<C>>)>,
    pub entry: Vec<ActionDef<C>>,
    pub exit: Vec<ActionDef<C>>,
    pub after: Vec<(u64, TransitionConfig<C>)>,
    pub on_done: Vec<TransitionConfig<C>>,
    pub activities: Vec<String>,
}

impl<C> Default for StateConfig<C> {
    fn default() -> Self {
        Self {
            kind: ConfigKind::Default,
            initial: None,
            states: Vec::new(),
            on: Vec::new(),
            entry: Vec::new(),
            exit: Vec::new(),
            after: Vec::new(),
            on_done: Vec::new(),
            activities: Vec::new(),
        }
    }
}

impl<C> StateConfig<C> {
    fn push_on(&mut self, event: String, transition: TransitionConfig<C>) {
        match self.on.iter_mut().find(|(name, _)| *name == event) {
            Some((_, list)) => list.push(transition),
            None => self.on.push((event, vec![transition])),
        }
    }
}

/// One transition in the configuration: targets, guard, actions, and the
/// internal/external flag.
pub struct TransitionConfig<C> {
    pub(crate) targets: Vec<String>,
    pub(crate) cond: Option<Guard<C>>,
    pub(crate) actions: Vec<ActionDef<C>>,
    pub(crate) internal: Option<bool>,
}

impl<C> TransitionConfig<C> {
    /// Transition to a single target selector.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            targets: vec![target.into()],
            cond: None,
            actions: Vec::new(),
            internal: None,
        }
    }

    /// Transition to several targets (orthogonal regions).
    pub fn to_many<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            cond: None,
            actions: Vec::new(),
            internal: None,
        }
    }

    /// Targetless transition: runs actions without leaving the state.
    pub fn stay() -> Self {
        Self {
            targets: Vec::new(),
            cond: None,
            actions: Vec::new(),
            internal: None,
        }
    }

    pub fn guard(mut self, guard: Guard<C>) -> Self {
        self.cond = Some(guard);
        self
    }

    /// Shorthand for an anonymous guard.
    pub fn when(
        self,
        predicate: impl Fn(&C, &crate::event::Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.guard(Guard::new("cond", predicate))
    }

    pub fn action(mut self, action: impl Into<ActionDef<C>>) -> Self {
        self.actions.push(action.into());
        self
    }

    pub fn actions<I, A>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ActionDef<C>>,
    {
        self.actions.extend(actions.into_iter().map(Into::into));
        self
    }

    /// Stay inside the source subtree: no exit/entry even for a self target.
    pub fn internal(mut self) -> Self {
        self.internal = Some(true);
        self
    }

    /// Exit and re-enter through the LCCA even when the default would be
    /// internal.
    pub fn external(mut self) -> Self {
        self.internal = Some(false);
        self
    }
}

impl<C> From<&str> for TransitionConfig<C> {
    fn from(target: &str) -> Self {
        TransitionConfig::to(target)
    }
}

impl<C> From<String> for TransitionConfig<C> {
    fn from(target: String) -> Self {
        TransitionConfig::to(target)
    }
}

/// Transition to a target selector.
pub fn to<C>(target: impl Into<String>) -> TransitionConfig<C> {
    TransitionConfig::to(target)
}

/// Targetless transition.
pub fn stay<C>() -> TransitionConfig<C> {
    TransitionConfig::stay()
}

/// Builder for one state node.
pub struct StateBuilder<C> {
    config: StateConfig<C>,
}

impl<C> StateBuilder<C> {
    fn new() -> Self {
        Self {
            config: StateConfig::default(),
        }
    }

    /// Initial child selector (key or dotted descendant path).
    pub fn initial(mut self, key: impl Into<String>) -> Self {
        self.config.initial = Some(key.into());
        self
    }

    /// Mark this node as a parallel state; every child becomes a region.
    pub fn parallel(mut self) -> Self {
        self.config.kind = ConfigKind::Parallel;
        self
    }

    /// Mark this node as a final state.
    pub fn final_state(mut self) -> Self {
        self.config.kind = ConfigKind::Final;
        self
    }

    /// Mark this node as a shallow history pseudo-state.
    pub fn shallow_history(mut self) -> Self {
        self.config.kind = ConfigKind::History(HistoryKind::Shallow);
        self
    }

    /// Mark this node as a deep history pseudo-state.
    pub fn deep_history(mut self) -> Self {
        self.config.kind = ConfigKind::History(HistoryKind::Deep);
        self
    }

    /// Declare a child state.
    pub fn state(mut self, key: impl Into<String>, f: impl FnOnce(Self) -> Self) -> Self {
        let child = f(Self::new());
        self.config.states.push((key.into(), child.config));
        self
    }

    /// Declare a transition for an event. Repeated calls for the same event
    /// append to its guarded transition list, in declaration order.
    pub fn on(mut self, event: impl Into<String>, transition: impl Into<TransitionConfig<C>>) -> Self {
        self.config.push_on(event.into(), transition.into());
        self
    }

    /// Transition taken when this state's `done.state` event fires.
    pub fn on_done(mut self, transition: impl Into<TransitionConfig<C>>) -> Self {
        self.config.on_done.push(transition.into());
        self
    }

    /// Delayed transition, scheduled on entry and canceled on exit.
    pub fn after(mut self, delay_ms: u64, transition: impl Into<TransitionConfig<C>>) -> Self {
        self.config.after.push((delay_ms, transition.into()));
        self
    }

    pub fn entry(mut self, action: impl Into<ActionDef<C>>) -> Self {
        self.config.entry.push(action.into());
        self
    }

    pub fn exit(mut self, action: impl Into<ActionDef<C>>) -> Self {
        self.config.exit.push(action.into());
        self
    }

    /// Attach a named activity, started on entry and stopped on exit. The
    /// implementation is registered on the machine builder.
    pub fn activity(mut self, name: impl Into<String>) -> Self {
        self.config.activities.push(name.into());
        self
    }
}

/// Builder for a whole machine.
pub struct MachineBuilder<C> {
    id: String,
    context: C,
    root: StateConfig<C>,
    activities: HashMap<String, ActivityFn<C>>,
}

impl<C: MachineContext> MachineBuilder<C> {
    pub(crate) fn new(id: impl Into<String>, context: C) -> Self {
        Self {
            id: id.into(),
            context,
            root: StateConfig::default(),
            activities: HashMap::new(),
        }
    }

    /// Initial top-level state.
    pub fn initial(mut self, key: impl Into<String>) -> Self {
        self.root.initial = Some(key.into());
        self
    }

    /// Make the machine root a parallel state.
    pub fn parallel(mut self) -> Self {
        self.root.kind = ConfigKind::Parallel;
        self
    }

    /// Declare a top-level state.
    pub fn state(
        mut self,
        key: impl Into<String>,
        f: impl FnOnce(StateBuilder<C>) -> StateBuilder<C>,
    ) -> Self {
        let child = f(StateBuilder::new());
        self.root.states.push((key.into(), child.config));
        self
    }

    /// Machine-level transition, reachable from every configuration.
    pub fn on(mut self, event: impl Into<String>, transition: impl Into<TransitionConfig<C>>) -> Self {
        self.root.push_on(event.into(), transition.into());
        self
    }

    pub fn entry(mut self, action: impl Into<ActionDef<C>>) -> Self {
        self.root.entry.push(action.into());
        self
    }

    pub fn exit(mut self, action: impl Into<ActionDef<C>>) -> Self {
        self.root.exit.push(action.into());
        self
    }

    /// Register the implementation of a named activity.
    pub fn register_activity(
        mut self,
        name: impl Into<String>,
        start: impl Fn(&C) -> Option<ActivityHandle> + Send + Sync + 'static,
    ) -> Self {
        self.activities.insert(name.into(), Arc::new(start));
        self
    }

    /// Parse and validate the chart.
    pub fn build(self) -> ChartResult<Machine<C>> {
        let chart = Chart::build(self.id, self.root)?;
        Ok(Machine::from_parts(chart, self.context, self.activities))
    }
}
