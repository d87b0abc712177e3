//! Child actors: spawn sources, handles, and lifecycle
//!
//! A statechart spawns children from four source kinds — another machine, a
//! promise (future), a callback worker, or an observable stream. Spawning
//! happens inside an `assign`, which runs in the pure engine, so the
//! [`ActorRef`] handed back starts *deferred*: a null actor whose `send` is a
//! callable no-op and which still holds its source. The interpreter activates
//! deferred cells after the transition commits; outside a live interpreter
//! they stay null forever, which keeps `initial_state().context` safe to
//! read.
//!
//! Machine children are driven synchronously through a mutex so parent/child
//! macrosteps interleave deterministically; promises, callbacks, and
//! observables are the genuinely asynchronous sources and run as tokio tasks
//! feeding the parent mailbox.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{done_invoke_event, Event, ScxmlEvent, ERROR_EXECUTION_EVENT};
use crate::interpreter::ServiceHandle;

static ANONYMOUS_IDS: AtomicU64 = AtomicU64::new(0);

fn next_anonymous_id() -> String {
    format!("actor:{}", ANONYMOUS_IDS.fetch_add(1, Ordering::Relaxed))
}

/// Cleanup returned by a callback source.
pub type CallbackCleanup = Box<dyn FnOnce() + Send>;

type CallbackFn = Box<dyn FnOnce(CallbackEmitter, CallbackReceiver) -> Option<CallbackCleanup> + Send>;

type CallbackListener = Box<dyn FnMut(Event) + Send>;

/// What a spawned actor runs.
pub enum ActorSource {
    /// A child statechart, driven by its own interpreter.
    Machine(Box<dyn SpawnableMachine>),
    /// A one-shot future: resolution enqueues `done.invoke.<id>`, rejection
    /// enqueues `error.execution`.
    Promise(BoxFuture<'static, Result<Value, Value>>),
    /// A worker invoked with `(emitter, receiver)`: the emitter routes events
    /// to the parent, the receiver registers a handler for events sent to
    /// this actor.
    Callback(CallbackFn),
    /// A stream whose emissions are enqueued on the parent.
    Observable(BoxStream<'static, Event>),
}

impl ActorSource {
    pub fn promise<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<Value, Value>> + Send + 'static,
    {
        ActorSource::Promise(Box::pin(future))
    }

    pub fn observable<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Event> + Send + 'static,
    {
        ActorSource::Observable(Box::pin(stream))
    }

    pub fn callback(
        f: impl FnOnce(CallbackEmitter, CallbackReceiver) -> Option<CallbackCleanup> + Send + 'static,
    ) -> Self {
        ActorSource::Callback(Box::new(f))
    }
}

impl fmt::Debug for ActorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ActorSource::Machine(_) => "Machine",
            ActorSource::Promise(_) => "Promise",
            ActorSource::Callback(_) => "Callback",
            ActorSource::Observable(_) => "Observable",
        };
        f.debug_tuple("ActorSource").field(&kind).finish()
    }
}

/// Type-erased machine that can be started as a child interpreter.
pub trait SpawnableMachine: Send {
    fn spawn_child(
        self: Box<Self>,
        id: String,
        parent: ServiceHandle,
        sync: bool,
    ) -> Box<dyn ActorBackend>;
}

/// Live actor implementation behind an activated [`ActorRef`].
pub trait ActorBackend: Send {
    fn deliver(&self, event: ScxmlEvent);
    fn halt(&mut self);
}

/// Options for [`Spawner::spawn_with`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Stable actor id; generated when omitted.
    pub id: Option<String>,
    /// Machine children only: emit `xstate.update` to the parent on every
    /// child transition.
    pub sync: bool,
    /// Machine children only: forward every external event the parent
    /// processes to this child, after parent processing.
    pub auto_forward: bool,
}

impl SpawnOptions {
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    pub fn auto_forward(mut self) -> Self {
        self.auto_forward = true;
        self
    }
}

enum BackendSlot {
    /// Not yet activated: a null actor still holding its source.
    Deferred(Option<ActorSource>),
    Live(Box<dyn ActorBackend>),
    Stopped,
}

struct ActorCell {
    id: String,
    options: SpawnOptions,
    /// Absolute id of the state whose assign spawned this actor; exit of that
    /// state stops it.
    owner: OnceLock<String>,
    slot: Mutex<BackendSlot>,
}

/// Clonable handle to a spawned actor. Equality is cell identity.
#[derive(Clone)]
pub struct ActorRef {
    cell: Arc<ActorCell>,
}

impl ActorRef {
    fn with_slot(id: String, options: SpawnOptions, slot: BackendSlot) -> Self {
        Self {
            cell: Arc::new(ActorCell {
                id,
                options,
                owner: OnceLock::new(),
                slot: Mutex::new(slot),
            }),
        }
    }

    /// A permanently-inert actor: `send` is a callable no-op. This is what
    /// deserialized children rehydrate as.
    pub fn null(id: impl Into<String>) -> Self {
        Self::with_slot(id.into(), SpawnOptions::default(), BackendSlot::Deferred(None))
    }

    pub fn id(&self) -> &str {
        &self.cell.id
    }

    /// Send an event to this actor. No-op while the actor is deferred or
    /// stopped.
    pub fn send(&self, event: impl Into<Event>) {
        self.send_envelope(ScxmlEvent::external(event.into()));
    }

    pub(crate) fn send_envelope(&self, event: ScxmlEvent) {
        match self.cell.slot.lock() {
            Ok(slot) => match &*slot {
                BackendSlot::Live(backend) => backend.deliver(event),
                BackendSlot::Deferred(_) | BackendSlot::Stopped => {
                    debug!(actor = %self.cell.id, event = %event.name, "dropping send to inactive actor");
                }
            },
            Err(_) => warn!(actor = %self.cell.id, "actor cell poisoned"),
        }
    }

    pub(crate) fn options(&self) -> &SpawnOptions {
        &self.cell.options
    }

    pub(crate) fn owner(&self) -> Option<&str> {
        self.cell.owner.get().map(String::as_str)
    }

    pub(crate) fn set_owner(&self, owner: &str) {
        let _ = self.cell.owner.set(owner.to_string());
    }

    /// Turn a deferred cell live under the given parent. Idempotent: already
    /// live or stopped cells are left alone.
    pub(crate) fn activate(&self, parent: &ServiceHandle) {
        let Ok(mut slot) = self.cell.slot.lock() else {
            warn!(actor = %self.cell.id, "actor cell poisoned");
            return;
        };
        let BackendSlot::Deferred(source) = &mut *slot else {
            return;
        };
        let Some(source) = source.take() else {
            // Null actor: nothing to run.
            *slot = BackendSlot::Stopped;
            return;
        };
        let id = self.cell.id.clone();
        debug!(actor = %id, "activating child actor");
        *slot = match source {
            ActorSource::Machine(machine) => BackendSlot::Live(machine.spawn_child(
                id,
                parent.clone(),
                self.cell.options.sync,
            )),
            ActorSource::Promise(future) => match spawn_promise(id, parent.clone(), future) {
                Some(backend) => BackendSlot::Live(backend),
                None => BackendSlot::Stopped,
            },
            ActorSource::Observable(stream) => match spawn_observable(id, parent.clone(), stream) {
                Some(backend) => BackendSlot::Live(backend),
                None => BackendSlot::Stopped,
            },
            ActorSource::Callback(f) => {
                let listener: Arc<Mutex<Option<CallbackListener>>> = Arc::new(Mutex::new(None));
                let cleanup = f(
                    CallbackEmitter {
                        parent: parent.clone(),
                        actor_id: self.cell.id.clone(),
                    },
                    CallbackReceiver {
                        listener: Arc::clone(&listener),
                    },
                );
                BackendSlot::Live(Box::new(CallbackBackend { listener, cleanup }))
            }
        };
    }

    pub(crate) fn stop(&self) {
        if let Ok(mut slot) = self.cell.slot.lock() {
            if let BackendSlot::Live(backend) = &mut *slot {
                backend.halt();
            }
            *slot = BackendSlot::Stopped;
        }
    }

    pub(crate) fn is_deferred(&self) -> bool {
        matches!(
            self.cell.slot.lock().as_deref(),
            Ok(BackendSlot::Deferred(_))
        )
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef").field("id", &self.cell.id).finish()
    }
}

impl Serialize for ActorRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.cell.id)
    }
}

impl<'de> Deserialize<'de> for ActorRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = String::deserialize(deserializer)?;
        if id.is_empty() {
            return Err(D::Error::custom("actor id must not be empty"));
        }
        Ok(ActorRef::null(id))
    }
}

/// Collects actors created by `assign` during a single transition.
#[derive(Debug, Default)]
pub struct Spawner {
    spawned: Vec<ActorRef>,
}

impl Spawner {
    /// Spawn with generated id and default options.
    pub fn spawn(&mut self, source: impl Into<ActorSource>) -> ActorRef {
        self.spawn_with(source, SpawnOptions::default())
    }

    pub fn spawn_with(&mut self, source: impl Into<ActorSource>, options: SpawnOptions) -> ActorRef {
        let id = options.id.clone().unwrap_or_else(next_anonymous_id);
        let actor = ActorRef::with_slot(id, options, BackendSlot::Deferred(Some(source.into())));
        self.spawned.push(actor.clone());
        actor
    }

    pub(crate) fn take(&mut self) -> Vec<ActorRef> {
        std::mem::take(&mut self.spawned)
    }
}

/// Routes callback-worker output to the parent interpreter.
#[derive(Clone)]
pub struct CallbackEmitter {
    parent: ServiceHandle,
    actor_id: String,
}

impl CallbackEmitter {
    pub fn send(&self, event: impl Into<Event>) {
        self.parent
            .forward(ScxmlEvent::external(event.into()).with_origin(self.actor_id.clone()));
    }
}

/// Registers the handler for events sent to a callback actor.
pub struct CallbackReceiver {
    listener: Arc<Mutex<Option<CallbackListener>>>,
}

impl CallbackReceiver {
    pub fn on_event(self, f: impl FnMut(Event) + Send + 'static) {
        if let Ok(mut listener) = self.listener.lock() {
            *listener = Some(Box::new(f));
        }
    }
}

struct CallbackBackend {
    listener: Arc<Mutex<Option<CallbackListener>>>,
    cleanup: Option<CallbackCleanup>,
}

impl ActorBackend for CallbackBackend {
    fn deliver(&self, event: ScxmlEvent) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(listener) = listener.as_mut() {
                listener(event.data);
            }
        }
    }

    fn halt(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

struct TaskBackend {
    task: tokio::task::JoinHandle<()>,
}

impl ActorBackend for TaskBackend {
    fn deliver(&self, event: ScxmlEvent) {
        debug!(event = %event.name, "task actor ignores incoming events");
    }

    fn halt(&mut self) {
        self.task.abort();
    }
}

fn spawn_promise(
    id: String,
    parent: ServiceHandle,
    future: BoxFuture<'static, Result<Value, Value>>,
) -> Option<Box<dyn ActorBackend>> {
    let runtime = runtime_handle(&id)?;
    let task = runtime.spawn(async move {
        let envelope = match future.await {
            Ok(value) => {
                ScxmlEvent::external(Event::with_data(done_invoke_event(&id), value))
            }
            Err(error) => {
                ScxmlEvent::external(Event::with_data(ERROR_EXECUTION_EVENT, error))
            }
        };
        parent.forward(envelope.with_origin(id.clone()).with_invokeid(id));
    });
    Some(Box::new(TaskBackend { task }))
}

fn spawn_observable(
    id: String,
    parent: ServiceHandle,
    mut stream: BoxStream<'static, Event>,
) -> Option<Box<dyn ActorBackend>> {
    let runtime = runtime_handle(&id)?;
    let task = runtime.spawn(async move {
        while let Some(event) = stream.next().await {
            parent.forward(ScxmlEvent::external(event).with_origin(id.clone()));
        }
    });
    Some(Box::new(TaskBackend { task }))
}

fn runtime_handle(id: &str) -> Option<tokio::runtime::Handle> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            warn!(actor = %id, "no async runtime available; actor stays inert");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_actor_send_is_callable() {
        let actor = ActorRef::null("ghost");
        actor.send("PING");
        actor.send(Event::with_data("PING", serde_json::json!(1)));
        assert_eq!(actor.id(), "ghost");
    }

    #[test]
    fn spawner_assigns_unique_anonymous_ids() {
        let mut spawner = Spawner::default();
        let a = spawner.spawn(ActorSource::promise(async { Ok(Value::Null) }));
        let b = spawner.spawn(ActorSource::promise(async { Ok(Value::Null) }));
        assert_ne!(a.id(), b.id());
        assert_eq!(spawner.take().len(), 2);
    }

    #[test]
    fn equality_is_cell_identity() {
        let mut spawner = Spawner::default();
        let a = spawner.spawn_with(
            ActorSource::promise(async { Ok(Value::Null) }),
            SpawnOptions::named("same"),
        );
        let b = spawner.spawn_with(
            ActorSource::promise(async { Ok(Value::Null) }),
            SpawnOptions::named("same"),
        );
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
