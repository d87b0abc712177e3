//! Declarative actions and guards
//!
//! Every executable attached to a chart is a tagged [`ActionDef`] variant —
//! one evaluator switch in the interpreter handles the built-ins, and user
//! code rides along as the `Opaque` variant. Assigns are the exception: the
//! engine folds them into the next context while computing a transition, so
//! by the time the interpreter sees an action list it contains no live
//! assigns.
//!
//! Equality and serialization operate on the action *descriptor* (kind,
//! names, event payloads); the wrapped closures are compared by identity
//! never, and do not survive a JSON round-trip.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::actor::Spawner;
use crate::event::Event;

/// Fallible guard predicate.
pub type GuardFn<C> = Arc<dyn Fn(&C, &Event) -> Result<bool, String> + Send + Sync>;

/// Functional context update. Receives the spawner so an assign may create
/// child actors.
pub type AssignFn<C> = Arc<dyn Fn(&C, &Event, &mut Spawner) -> C + Send + Sync>;

/// Side-effecting user action.
pub type ActionFn<C> = Arc<dyn Fn(&C, &Event) -> Result<(), String> + Send + Sync>;

/// Log message expression.
pub type LogFn<C> = Arc<dyn Fn(&C, &Event) -> String + Send + Sync>;

/// Starter for a named activity; returns the handle that stops it, or `None`
/// for fire-and-forget activities.
pub type ActivityFn<C> = Arc<dyn Fn(&C) -> Option<ActivityHandle> + Send + Sync>;

/// Handle to a running activity. Dropped handles keep running; `stop`
/// consumes the handle and runs the cleanup.
pub struct ActivityHandle {
    stop: Box<dyn FnOnce() + Send>,
}

impl ActivityHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Box::new(stop),
        }
    }

    pub(crate) fn stop(self) {
        (self.stop)();
    }
}

impl fmt::Debug for ActivityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActivityHandle")
    }
}

/// A named transition guard.
pub struct Guard<C> {
    name: String,
    predicate: GuardFn<C>,
}

impl<C> Guard<C> {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&C, &Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(move |ctx, ev| Ok(predicate(ctx, ev))),
        }
    }

    /// Guard whose predicate may fail. Failures are logged and the transition
    /// is not selected.
    pub fn try_new(
        name: impl Into<String>,
        predicate: impl Fn(&C, &Event) -> Result<bool, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self, context: &C, event: &Event) -> Result<bool, String> {
        (self.predicate)(context, event)
    }
}

impl<C> Clone for Guard<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<C> fmt::Debug for Guard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("name", &self.name).finish()
    }
}

/// Where a `send` action delivers its event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendTarget {
    /// The parent interpreter.
    Parent,
    /// A child actor, by id.
    Child(String),
}

/// A `send` action: event, destination, optional delay and cancel id.
#[derive(Clone, Debug, PartialEq)]
pub struct SendDef {
    pub event: Event,
    /// `None` sends to the owning service itself.
    pub to: Option<SendTarget>,
    /// Delay in milliseconds. `None` delivers within the current macrostep's
    /// queue discipline.
    pub delay: Option<u64>,
    /// Stable id for [`cancel`].
    pub id: Option<String>,
}

impl SendDef {
    pub fn new(event: impl Into<Event>) -> Self {
        Self {
            event: event.into(),
            to: None,
            delay: None,
            id: None,
        }
    }

    pub fn to_parent(mut self) -> Self {
        self.to = Some(SendTarget::Parent);
        self
    }

    pub fn to_child(mut self, id: impl Into<String>) -> Self {
        self.to = Some(SendTarget::Child(id.into()));
        self
    }

    pub fn delay(mut self, ms: u64) -> Self {
        self.delay = Some(ms);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl<C> From<SendDef> for ActionDef<C> {
    fn from(def: SendDef) -> Self {
        ActionDef::Send(def)
    }
}

/// Tagged action variant: the built-ins plus opaque user actions.
pub enum ActionDef<C> {
    /// Functional context update. Folded by the engine; the closure is absent
    /// on rehydrated snapshots.
    Assign {
        label: String,
        update: Option<AssignFn<C>>,
    },
    /// Enqueue an internal event, drained before the next external one.
    Raise(Event),
    /// Enqueue onto self, a child, the parent, or a delayed timer.
    Send(SendDef),
    /// Remove a pending delayed send by id.
    Cancel(String),
    /// Dispatch a message to the log observer.
    Log {
        label: Option<String>,
        message: Option<LogFn<C>>,
    },
    /// Start the named activity on entry.
    Start(String),
    /// Stop the named activity on exit.
    Stop(String),
    /// User-provided side effect. The closure is absent on rehydrated
    /// snapshots.
    Opaque {
        name: String,
        effect: Option<ActionFn<C>>,
    },
}

/// Kind tags used on the wire and in logs.
pub(crate) mod kinds {
    pub const ASSIGN: &str = "xstate.assign";
    pub const RAISE: &str = "xstate.raise";
    pub const SEND: &str = "xstate.send";
    pub const CANCEL: &str = "xstate.cancel";
    pub const LOG: &str = "xstate.log";
    pub const START: &str = "xstate.start";
    pub const STOP: &str = "xstate.stop";
    pub const PARENT_TARGET: &str = "#_parent";
}

impl<C> ActionDef<C> {
    /// The action's descriptor name: the kind tag for built-ins, the
    /// user-supplied name for opaque actions.
    pub fn name(&self) -> &str {
        match self {
            ActionDef::Assign { .. } => kinds::ASSIGN,
            ActionDef::Raise(_) => kinds::RAISE,
            ActionDef::Send(_) => kinds::SEND,
            ActionDef::Cancel(_) => kinds::CANCEL,
            ActionDef::Log { .. } => kinds::LOG,
            ActionDef::Start(_) => kinds::START,
            ActionDef::Stop(_) => kinds::STOP,
            ActionDef::Opaque { name, .. } => name,
        }
    }

    pub fn is_assign(&self) -> bool {
        matches!(self, ActionDef::Assign { .. })
    }

    pub(crate) fn to_repr(&self) -> ActionRepr {
        match self {
            ActionDef::Assign { label, .. } => ActionRepr {
                kind: kinds::ASSIGN.to_string(),
                label: Some(label.clone()),
                ..ActionRepr::default()
            },
            ActionDef::Raise(event) => ActionRepr {
                kind: kinds::RAISE.to_string(),
                event: Some(event.clone()),
                ..ActionRepr::default()
            },
            ActionDef::Send(def) => ActionRepr {
                kind: kinds::SEND.to_string(),
                event: Some(def.event.clone()),
                to: def.to.as_ref().map(|t| match t {
                    SendTarget::Parent => kinds::PARENT_TARGET.to_string(),
                    SendTarget::Child(id) => id.clone(),
                }),
                delay: def.delay,
                id: def.id.clone(),
                ..ActionRepr::default()
            },
            ActionDef::Cancel(id) => ActionRepr {
                kind: kinds::CANCEL.to_string(),
                id: Some(id.clone()),
                ..ActionRepr::default()
            },
            ActionDef::Log { label, .. } => ActionRepr {
                kind: kinds::LOG.to_string(),
                label: label.clone(),
                ..ActionRepr::default()
            },
            ActionDef::Start(activity) => ActionRepr {
                kind: kinds::START.to_string(),
                activity: Some(activity.clone()),
                ..ActionRepr::default()
            },
            ActionDef::Stop(activity) => ActionRepr {
                kind: kinds::STOP.to_string(),
                activity: Some(activity.clone()),
                ..ActionRepr::default()
            },
            ActionDef::Opaque { name, .. } => ActionRepr {
                kind: name.clone(),
                ..ActionRepr::default()
            },
        }
    }

    pub(crate) fn from_repr(repr: ActionRepr) -> Self {
        match repr.kind.as_str() {
            kinds::ASSIGN => ActionDef::Assign {
                label: repr.label.unwrap_or_else(|| kinds::ASSIGN.to_string()),
                update: None,
            },
            kinds::RAISE => ActionDef::Raise(repr.event.unwrap_or_else(Event::null)),
            kinds::SEND => ActionDef::Send(SendDef {
                event: repr.event.unwrap_or_else(Event::null),
                to: repr.to.map(|t| {
                    if t == kinds::PARENT_TARGET {
                        SendTarget::Parent
                    } else {
                        SendTarget::Child(t)
                    }
                }),
                delay: repr.delay,
                id: repr.id,
            }),
            kinds::CANCEL => ActionDef::Cancel(repr.id.unwrap_or_default()),
            kinds::LOG => ActionDef::Log {
                label: repr.label,
                message: None,
            },
            kinds::START => ActionDef::Start(repr.activity.unwrap_or_default()),
            kinds::STOP => ActionDef::Stop(repr.activity.unwrap_or_default()),
            _ => ActionDef::Opaque {
                name: repr.kind,
                effect: None,
            },
        }
    }
}

impl<C> Clone for ActionDef<C> {
    fn clone(&self) -> Self {
        match self {
            ActionDef::Assign { label, update } => ActionDef::Assign {
                label: label.clone(),
                update: update.clone(),
            },
            ActionDef::Raise(event) => ActionDef::Raise(event.clone()),
            ActionDef::Send(def) => ActionDef::Send(def.clone()),
            ActionDef::Cancel(id) => ActionDef::Cancel(id.clone()),
            ActionDef::Log { label, message } => ActionDef::Log {
                label: label.clone(),
                message: message.clone(),
            },
            ActionDef::Start(activity) => ActionDef::Start(activity.clone()),
            ActionDef::Stop(activity) => ActionDef::Stop(activity.clone()),
            ActionDef::Opaque { name, effect } => ActionDef::Opaque {
                name: name.clone(),
                effect: effect.clone(),
            },
        }
    }
}

impl<C> PartialEq for ActionDef<C> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ActionDef::Assign { label: a, .. }, ActionDef::Assign { label: b, .. }) => a == b,
            (ActionDef::Raise(a), ActionDef::Raise(b)) => a == b,
            (ActionDef::Send(a), ActionDef::Send(b)) => a == b,
            (ActionDef::Cancel(a), ActionDef::Cancel(b)) => a == b,
            (ActionDef::Log { label: a, .. }, ActionDef::Log { label: b, .. }) => a == b,
            (ActionDef::Start(a), ActionDef::Start(b)) => a == b,
            (ActionDef::Stop(a), ActionDef::Stop(b)) => a == b,
            (ActionDef::Opaque { name: a, .. }, ActionDef::Opaque { name: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl<C> fmt::Debug for ActionDef<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionDef::Raise(event) => f.debug_tuple("Raise").field(&event.name).finish(),
            ActionDef::Send(def) => f
                .debug_struct("Send")
                .field("event", &def.event.name)
                .field("to", &def.to)
                .field("delay", &def.delay)
                .field("id", &def.id)
                .finish(),
            ActionDef::Cancel(id) => f.debug_tuple("Cancel").field(id).finish(),
            ActionDef::Start(activity) => f.debug_tuple("Start").field(activity).finish(),
            ActionDef::Stop(activity) => f.debug_tuple("Stop").field(activity).finish(),
            ActionDef::Assign { label, .. } => f.debug_tuple("Assign").field(label).finish(),
            ActionDef::Log { label, .. } => f.debug_tuple("Log").field(label).finish(),
            ActionDef::Opaque { name, .. } => f.debug_tuple("Opaque").field(name).finish(),
        }
    }
}

/// Wire representation of an action descriptor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct ActionRepr {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Functional context update: `assign(|ctx, event| next_ctx)`.
pub fn assign<C>(
    update: impl Fn(&C, &Event) -> C + Send + Sync + 'static,
) -> ActionDef<C> {
    ActionDef::Assign {
        label: kinds::ASSIGN.to_string(),
        update: Some(Arc::new(move |ctx, ev, _spawner| update(ctx, ev))),
    }
}

/// Context update with access to the actor spawner:
/// `assign_with(|ctx, event, spawner| next_ctx)`.
pub fn assign_with<C>(
    update: impl Fn(&C, &Event, &mut Spawner) -> C + Send + Sync + 'static,
) -> ActionDef<C> {
    ActionDef::Assign {
        label: kinds::ASSIGN.to_string(),
        update: Some(Arc::new(update)),
    }
}

/// Raise an internal event.
pub fn raise<C>(event: impl Into<Event>) -> ActionDef<C> {
    ActionDef::Raise(event.into())
}

/// Send an event; chain [`SendDef`] builder methods before handing it to a
/// transition (`send("PING").to_child("c1").delay(100)`).
pub fn send(event: impl Into<Event>) -> SendDef {
    SendDef::new(event)
}

/// Send an event to the parent interpreter.
pub fn send_parent(event: impl Into<Event>) -> SendDef {
    SendDef::new(event).to_parent()
}

/// Cancel a pending delayed send.
pub fn cancel<C>(id: impl Into<String>) -> ActionDef<C> {
    ActionDef::Cancel(id.into())
}

/// Log a fixed label.
pub fn log<C>(label: impl Into<String>) -> ActionDef<C> {
    ActionDef::Log {
        label: Some(label.into()),
        message: None,
    }
}

/// Log a message computed from context and event.
pub fn log_expr<C>(
    message: impl Fn(&C, &Event) -> String + Send + Sync + 'static,
) -> ActionDef<C> {
    ActionDef::Log {
        label: None,
        message: Some(Arc::new(message)),
    }
}

/// Named opaque side effect.
pub fn action<C>(
    name: impl Into<String>,
    effect: impl Fn(&C, &Event) + Send + Sync + 'static,
) -> ActionDef<C> {
    ActionDef::Opaque {
        name: name.into(),
        effect: Some(Arc::new(move |ctx, ev| {
            effect(ctx, ev);
            Ok(())
        })),
    }
}

/// Named opaque side effect that may fail; failures become
/// `error.execution` events.
pub fn try_action<C>(
    name: impl Into<String>,
    effect: impl Fn(&C, &Event) -> Result<(), String> + Send + Sync + 'static,
) -> ActionDef<C> {
    ActionDef::Opaque {
        name: name.into(),
        effect: Some(Arc::new(effect)),
    }
}
