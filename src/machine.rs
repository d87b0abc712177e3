//! Machine: a chart plus its initial context
//!
//! `Machine` is the pure half of the library: `transition` computes the next
//! state for a `(state, event)` pair with no timers, no I/O, and no side
//! effects, so equal inputs always produce structurally equal outputs. The
//! side-effecting half lives in the [`crate::interpreter`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::action::ActivityFn;
use crate::builder::MachineBuilder;
use crate::chart::Chart;
use crate::engine;
use crate::error::ChartResult;
use crate::event::ScxmlEvent;
use crate::state::State;
use crate::value::StateValue;

/// Bound set for machine contexts: cheap to clone, comparable so `changed`
/// can detect effective assigns, and sendable across the actor runtime.
pub trait MachineContext: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> MachineContext for T {}

/// A parsed statechart and its initial context.
pub struct Machine<C: MachineContext> {
    chart: Arc<Chart<C>>,
    initial_context: C,
    activities: Arc<HashMap<String, ActivityFn<C>>>,
    // Shared across clones so initial-entry assigns (and their spawns) run
    // exactly once no matter how often the initial state is read.
    initial_cache: Arc<OnceLock<State<C>>>,
}

impl<C: MachineContext> Clone for Machine<C> {
    fn clone(&self) -> Self {
        Self {
            chart: Arc::clone(&self.chart),
            initial_context: self.initial_context.clone(),
            activities: Arc::clone(&self.activities),
            initial_cache: Arc::clone(&self.initial_cache),
        }
    }
}

impl<C: MachineContext> Machine<C> {
    /// Start declaring a machine.
    pub fn builder(id: impl Into<String>, context: C) -> MachineBuilder<C> {
        MachineBuilder::new(id, context)
    }

    pub(crate) fn from_parts(
        chart: Chart<C>,
        initial_context: C,
        activities: HashMap<String, ActivityFn<C>>,
    ) -> Self {
        Self {
            chart: Arc::new(chart),
            initial_context,
            activities: Arc::new(activities),
            initial_cache: Arc::new(OnceLock::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.chart.machine_id
    }

    pub(crate) fn chart(&self) -> &Chart<C> {
        &self.chart
    }

    pub(crate) fn initial_context(&self) -> &C {
        &self.initial_context
    }

    pub(crate) fn activity(&self, name: &str) -> Option<&ActivityFn<C>> {
        self.activities.get(name)
    }

    /// The state produced by entering the root from the synthetic initial
    /// event. Memoized: entry assigns run once.
    pub fn initial_state(&self) -> ChartResult<State<C>> {
        if let Some(state) = self.initial_cache.get() {
            return Ok(state.clone());
        }
        let state = engine::initial_state(self)?;
        let _ = self.initial_cache.set(state.clone());
        Ok(self
            .initial_cache
            .get()
            .cloned()
            .unwrap_or(state))
    }

    /// Pure transition: compute the next state for an event. Raw events are
    /// wrapped into an external envelope; pass a prebuilt [`ScxmlEvent`] to
    /// keep its routing metadata.
    pub fn transition(
        &self,
        state: &State<C>,
        event: impl Into<ScxmlEvent>,
    ) -> ChartResult<State<C>> {
        engine::microstep(self, state, event.into())
    }

    /// Convenience: transition from a bare state value (resolved against the
    /// chart with the machine's initial context).
    pub fn transition_value(
        &self,
        value: impl Into<StateValue>,
        event: impl Into<ScxmlEvent>,
    ) -> ChartResult<State<C>> {
        let from = self.state_from(value)?;
        self.transition(&from, event)
    }

    /// Resolve a possibly-truncated value into a full inert state carrying
    /// the initial context.
    pub fn state_from(&self, value: impl Into<StateValue>) -> ChartResult<State<C>> {
        let configuration = self.chart.configuration_of(&value.into())?;
        let resolved = self.chart.value_of(&configuration);
        let mut state = State::from_value(resolved, self.initial_context.clone());
        state.next_events = engine::next_events(self.chart(), &configuration);
        Ok(state)
    }
}

impl<C: MachineContext> std::fmt::Debug for Machine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.chart.machine_id)
            .field("states", &self.chart.len())
            .finish()
    }
}
