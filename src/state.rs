//! Transition results
//!
//! A [`State`] is the immutable outcome of one transition: the configuration
//! value, the context after assigns, the ordered list of actions still to be
//! executed, the spawned children, and bookkeeping (`changed`, history,
//! `next_events`). States serialize to the JSON shape
//! `{value, context, event, _event, actions, children, historyValue, done}`
//! and rehydrate into something `transition` accepts as its `from` argument;
//! closures do not survive the round trip, so rehydrated actions are inert
//! descriptors.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{ActionDef, ActionRepr};
use crate::actor::ActorRef;
use crate::error::{ChartError, ChartResult};
use crate::event::{Event, ScxmlEvent};
use crate::value::StateValue;

/// Recorded history: compound state id → the value below it when it was last
/// exited.
pub type HistoryValue = BTreeMap<String, StateValue>;

/// An immutable machine state snapshot.
pub struct State<C> {
    pub value: StateValue,
    pub context: C,
    /// The user event that produced this state.
    pub event: Event,
    /// The envelope around `event`.
    pub scxml_event: ScxmlEvent,
    /// Actions left for the interpreter; assigns are already folded into
    /// `context`.
    pub actions: Vec<ActionDef<C>>,
    /// Spawned child actors, by id.
    pub children: BTreeMap<String, ActorRef>,
    /// `None` for the synthetic initial state; otherwise whether the
    /// transition changed value, ran actions, or updated context.
    pub changed: Option<bool>,
    pub history_value: HistoryValue,
    /// The state this one was computed from, action-stripped.
    pub history: Option<Box<State<C>>>,
    /// Event names on transitions selectable from this configuration,
    /// wildcard and eventless excluded.
    pub next_events: Vec<String>,
    /// True when the machine reached its top-level final state.
    pub done: bool,
    /// Absolute ids of states exited by this transition.
    pub(crate) exited: Vec<String>,
}

impl<C: Clone> Clone for State<C> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            context: self.context.clone(),
            event: self.event.clone(),
            scxml_event: self.scxml_event.clone(),
            actions: self.actions.clone(),
            children: self.children.clone(),
            changed: self.changed,
            history_value: self.history_value.clone(),
            history: self.history.clone(),
            next_events: self.next_events.clone(),
            done: self.done,
            exited: self.exited.clone(),
        }
    }
}

impl<C> State<C> {
    /// Fabricate an inert state carrying only a value and context. The value
    /// is taken as-is; `Machine::state_from` resolves truncated values
    /// against a chart first.
    pub fn from_value(value: impl Into<StateValue>, context: C) -> Self {
        Self {
            value: value.into(),
            context,
            event: Event::new(crate::event::INIT_EVENT),
            scxml_event: ScxmlEvent::init(),
            actions: Vec::new(),
            children: BTreeMap::new(),
            changed: None,
            history_value: HistoryValue::new(),
            history: None,
            next_events: Vec::new(),
            done: false,
            exited: Vec::new(),
        }
    }

    /// Drop the pending action list. Identity when there are no actions.
    pub fn inert(mut self) -> Self {
        if !self.actions.is_empty() {
            self.actions.clear();
        }
        self
    }

    /// True iff every segment of `path` appears on the configuration branch
    /// in order.
    pub fn matches(&self, path: &str) -> bool {
        self.value.matches(path)
    }

    /// A detached matcher that keeps reflecting this state after the state
    /// itself moves on.
    pub fn matcher(&self) -> impl Fn(&str) -> bool + Send + Sync + 'static {
        let value = self.value.clone();
        move |path| value.matches(path)
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.value.to_strings()
    }

    /// Snapshot suitable for the `history` field: same data, no actions, no
    /// deeper history chain.
    pub(crate) fn history_snapshot(&self) -> Self
    where
        C: Clone,
    {
        let mut snapshot = self.clone();
        snapshot.actions = Vec::new();
        snapshot.history = None;
        snapshot
    }
}

impl<C: Serialize> State<C> {
    /// Serialize to the wire shape
    /// `{value, context, event, _event, actions, children, historyValue,
    /// done}`.
    pub fn to_json(&self) -> ChartResult<Value> {
        let repr = StateRepr {
            value: self.value.clone(),
            context: &self.context,
            event: self.event.clone(),
            scxml_event: self.scxml_event.clone(),
            actions: self.actions.iter().map(ActionDef::to_repr).collect(),
            children: self.children.keys().cloned().collect(),
            history_value: self.history_value.clone(),
            done: self.done,
        };
        serde_json::to_value(&repr).map_err(|e| ChartError::MalformedState(e.to_string()))
    }
}

impl<C: DeserializeOwned> State<C> {
    /// Rehydrate a serialized state. Children come back as null actors and
    /// opaque/assign actions as inert descriptors; the result is a valid
    /// `from` argument for the next `transition` call.
    pub fn create(json: Value) -> ChartResult<Self> {
        let repr: StateReprOwned<C> =
            serde_json::from_value(json).map_err(|e| ChartError::MalformedState(e.to_string()))?;
        Ok(Self {
            value: repr.value,
            context: repr.context,
            event: repr.event,
            scxml_event: repr.scxml_event,
            actions: repr.actions.into_iter().map(ActionDef::from_repr).collect(),
            children: repr
                .children
                .into_iter()
                .map(|id| (id.clone(), ActorRef::null(id)))
                .collect(),
            changed: None,
            history_value: repr.history_value,
            history: None,
            next_events: Vec::new(),
            done: repr.done,
            exited: Vec::new(),
        })
    }
}

impl<C> fmt::Debug for State<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("value", &self.value)
            .field("event", &self.event.name)
            .field("changed", &self.changed)
            .field("done", &self.done)
            .field("actions", &self.actions)
            .finish()
    }
}

#[derive(Serialize)]
struct StateRepr<'a, C> {
    value: StateValue,
    context: &'a C,
    event: Event,
    #[serde(rename = "_event")]
    scxml_event: ScxmlEvent,
    actions: Vec<ActionRepr>,
    children: Vec<String>,
    #[serde(rename = "historyValue", skip_serializing_if = "BTreeMap::is_empty")]
    history_value: HistoryValue,
    done: bool,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "C: DeserializeOwned"))]
struct StateReprOwned<C> {
    value: StateValue,
    context: C,
    event: Event,
    #[serde(rename = "_event")]
    scxml_event: ScxmlEvent,
    #[serde(default)]
    actions: Vec<ActionRepr>,
    #[serde(default)]
    children: Vec<String>,
    #[serde(rename = "historyValue", default)]
    history_value: HistoryValue,
    #[serde(default)]
    done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inert_empties_actions() {
        let mut state: State<u32> = State::from_value("one", 7);
        state.actions.push(crate::action::action("fx", |_, _| {}));
        let inert = state.inert();
        assert!(inert.actions.is_empty());
    }

    #[test]
    fn matcher_outlives_the_state() {
        let state: State<()> = State::from_value(
            StateValue::branch([("two", StateValue::branch([("deep", "foo")]))]),
            (),
        );
        let matches = state.matcher();
        drop(state);
        assert!(matches("two.deep.foo"));
        assert!(!matches("two.shallow"));
    }

    #[test]
    fn json_round_trip_keeps_value_and_context() {
        let state: State<u32> = State::from_value("one", 42);
        let json = state.to_json().unwrap();
        let back: State<u32> = State::create(json).unwrap();
        assert_eq!(back.value, state.value);
        assert_eq!(back.context, state.context);
        assert_eq!(back.event, state.event);
    }
}
