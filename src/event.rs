//! Events and the SCXML-style envelope that carries them
//!
//! Callers deal in [`Event`] — a name plus an optional JSON payload. The
//! engine and interpreter deal in [`ScxmlEvent`], the routing envelope that
//! records where an event came from (external sender, internal raise, or the
//! platform itself) together with send/invoke correlation ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Descriptor of the eventless ("always") transition.
pub const NULL_EVENT: &str = "";

/// Wildcard event descriptor, matching any named event.
pub const WILDCARD_EVENT: &str = "*";

/// Name of the synthetic event that enters the initial configuration.
pub const INIT_EVENT: &str = "xstate.init";

/// Name of the progress event a synced child actor sends to its parent.
pub const UPDATE_EVENT: &str = "xstate.update";

/// Name of the event raised when a user action fails.
pub const ERROR_EXECUTION_EVENT: &str = "error.execution";

/// Name of the event raised for platform-level failures.
pub const ERROR_PLATFORM_EVENT: &str = "error.platform";

/// Event sent to the parent when the actor with the given id reaches its
/// final state (or its promise resolves).
pub fn done_invoke_event(actor_id: &str) -> String {
    format!("done.invoke.{actor_id}")
}

/// Event raised when the compound state with the given absolute id reaches a
/// final child.
pub fn done_state_event(state_id: &str) -> String {
    format!("done.state.{state_id}")
}

/// Event name under which an `after` delayed transition is registered.
pub fn after_event(delay_ms: u64, state_id: &str) -> String {
    format!("xstate.after({delay_ms})#{state_id}")
}

/// A user-facing event: a name (`type` on the wire) and a JSON payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name. The empty string is the eventless descriptor.
    #[serde(rename = "type")]
    pub name: String,
    /// Arbitrary payload. `Null` when the event carries no data.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Event {
    /// Event with no payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Value::Null,
        }
    }

    /// Event carrying a JSON payload.
    pub fn with_data(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// The eventless ("always") event fed through the engine between
    /// microsteps.
    pub fn null() -> Self {
        Self::new(NULL_EVENT)
    }

    pub fn is_null(&self) -> bool {
        self.name == NULL_EVENT
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        Event::new(name)
    }
}

impl From<String> for Event {
    fn from(name: String) -> Self {
        Event::new(name)
    }
}

/// Origin class of an event, per the SCXML processor model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Sent from outside the machine (or by a child actor).
    External,
    /// Raised by the machine itself during a macrostep.
    Internal,
    /// Generated by the runtime (init, errors).
    Platform,
}

/// Routing envelope around an [`Event`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScxmlEvent {
    /// Equal to `data.name`.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Id of the `send` that produced this event, when delayed or cancelable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sendid: Option<String>,
    /// Id of the service that sent the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origintype: Option<String>,
    /// Id of the child actor this event relates to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invokeid: Option<String>,
    /// The user event itself.
    pub data: Event,
}

impl ScxmlEvent {
    pub fn external(event: Event) -> Self {
        Self::of_kind(event, EventKind::External)
    }

    pub fn internal(event: Event) -> Self {
        Self::of_kind(event, EventKind::Internal)
    }

    pub fn platform(event: Event) -> Self {
        Self::of_kind(event, EventKind::Platform)
    }

    fn of_kind(event: Event, kind: EventKind) -> Self {
        Self {
            name: event.name.clone(),
            kind,
            sendid: None,
            origin: None,
            origintype: None,
            invokeid: None,
            data: event,
        }
    }

    /// The synthetic initial event.
    pub fn init() -> Self {
        Self::platform(Event::new(INIT_EVENT))
    }

    /// The eventless envelope fed between microsteps.
    pub fn null() -> Self {
        Self::internal(Event::null())
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_sendid(mut self, sendid: impl Into<String>) -> Self {
        self.sendid = Some(sendid.into());
        self
    }

    pub fn with_invokeid(mut self, invokeid: impl Into<String>) -> Self {
        self.invokeid = Some(invokeid.into());
        self
    }
}

impl From<Event> for ScxmlEvent {
    fn from(event: Event) -> Self {
        ScxmlEvent::external(event)
    }
}

impl From<&str> for ScxmlEvent {
    fn from(name: &str) -> Self {
        ScxmlEvent::external(Event::new(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_from_str_shorthand() {
        let ev: Event = "PING".into();
        assert_eq!(ev.name, "PING");
        assert!(ev.data.is_null());
    }

    #[test]
    fn envelope_preserves_payload() {
        let ev = Event::with_data("CHANGE", json!({ "value": "x" }));
        let wrapped = ScxmlEvent::external(ev.clone());
        assert_eq!(wrapped.name, "CHANGE");
        assert_eq!(wrapped.kind, EventKind::External);
        assert_eq!(wrapped.data, ev);
    }

    #[test]
    fn reserved_names() {
        assert_eq!(done_invoke_event("my-promise"), "done.invoke.my-promise");
        assert_eq!(done_state_event("light.two"), "done.state.light.two");
        assert_eq!(after_event(1000, "light.red"), "xstate.after(1000)#light.red");
    }

    #[test]
    fn wire_shape_uses_type_field() {
        let ev = ScxmlEvent::init();
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["name"], "xstate.init");
        assert_eq!(json["type"], "platform");
        assert_eq!(json["data"]["type"], "xstate.init");
    }
}
