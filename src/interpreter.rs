//! Interpreter: the side-effecting service around a pure machine
//!
//! The interpreter owns a mailbox, an internal queue, and a timer heap, and
//! drives the machine through macrosteps: one external event, then raised
//! internal events (LIFO within a microstep, always before the next external
//! event), then eventless transitions, until the configuration is quiescent.
//! Listeners observe the state once per macrostep.
//!
//! `send` takes `&mut self`, so a macrostep can never re-enter: anything that
//! wants to send from inside — actions, child actors, timers — goes through
//! the mailbox and is drained FIFO afterwards. Machine children are driven
//! synchronously through their mutex; promises, callbacks, and observables
//! run as tasks and land in the mailbox like any other sender.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::action::{ActionDef, ActivityHandle, SendDef, SendTarget};
use crate::actor::{ActorBackend, ActorSource, SpawnableMachine};
use crate::engine;
use crate::error::{ChartError, ChartResult};
use crate::event::{
    done_invoke_event, Event, EventKind, ScxmlEvent, ERROR_EXECUTION_EVENT, UPDATE_EVENT,
};
use crate::machine::{Machine, MachineContext};
use crate::state::State;

/// Lifecycle of a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceStatus {
    NotStarted,
    Running,
    Stopped,
}

/// Clonable address of a running service: push events into its mailbox from
/// other tasks, child actors, or timers.
#[derive(Clone)]
pub struct ServiceHandle {
    id: String,
    tx: mpsc::UnboundedSender<ScxmlEvent>,
}

impl ServiceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send(&self, event: impl Into<Event>) {
        self.forward(ScxmlEvent::external(event.into()));
    }

    pub(crate) fn forward(&self, event: ScxmlEvent) {
        // The receiver half only disappears when the service is gone; late
        // events are dropped by design.
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle").field("id", &self.id).finish()
    }
}

struct Timer {
    deadline: Instant,
    seq: u64,
    id: String,
    event: ScxmlEvent,
    target: Option<SendTarget>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

type StateListener<C> = Box<dyn FnMut(&State<C>) + Send>;
type ErrorListener = Box<dyn FnMut(&str) + Send>;

/// Interpret a machine: the service starts in `NotStarted` and computes its
/// initial state eagerly so `state()` is readable before `start`.
pub fn interpret<C: MachineContext>(machine: Machine<C>) -> ChartResult<Interpreter<C>> {
    Interpreter::new(machine)
}

/// A running (or runnable) statechart service.
pub struct Interpreter<C: MachineContext> {
    machine: Machine<C>,
    id: String,
    state: State<C>,
    status: ServiceStatus,
    parent: Option<ServiceHandle>,
    /// `sync` spawn option: report `xstate.update` to the parent after every
    /// macrostep.
    report_updates: bool,
    tx: mpsc::UnboundedSender<ScxmlEvent>,
    rx: mpsc::UnboundedReceiver<ScxmlEvent>,
    internal_queue: VecDeque<ScxmlEvent>,
    timers: BinaryHeap<Reverse<Timer>>,
    /// Live delayed sends: id → seq of the latest schedule. `cancel` removes
    /// the entry; stale heap entries are skipped on pop.
    active_sends: HashMap<String, u64>,
    seq: u64,
    transition_listeners: Vec<StateListener<C>>,
    done_listeners: Vec<StateListener<C>>,
    error_listeners: Vec<ErrorListener>,
    activities: HashMap<String, Option<ActivityHandle>>,
}

impl<C: MachineContext> Interpreter<C> {
    pub fn new(machine: Machine<C>) -> ChartResult<Self> {
        let id = machine.id().to_string();
        Self::with_identity(machine, id, None, false)
    }

    pub(crate) fn child(
        machine: Machine<C>,
        id: String,
        parent: ServiceHandle,
        report_updates: bool,
    ) -> ChartResult<Self> {
        Self::with_identity(machine, id, Some(parent), report_updates)
    }

    fn with_identity(
        machine: Machine<C>,
        id: String,
        parent: Option<ServiceHandle>,
        report_updates: bool,
    ) -> ChartResult<Self> {
        let state = machine.initial_state()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            machine,
            id,
            state,
            status: ServiceStatus::NotStarted,
            parent,
            report_updates,
            tx,
            rx,
            internal_queue: VecDeque::new(),
            timers: BinaryHeap::new(),
            active_sends: HashMap::new(),
            seq: 0,
            transition_listeners: Vec::new(),
            done_listeners: Vec::new(),
            error_listeners: Vec::new(),
            activities: HashMap::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ServiceStatus {
        self.status
    }

    /// The most recent state. Before `start` this is the machine's initial
    /// state (entry assigns already folded, actions not yet executed).
    pub fn state(&self) -> &State<C> {
        &self.state
    }

    /// Address for cross-task sends into this service's mailbox.
    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            id: self.id.clone(),
            tx: self.tx.clone(),
        }
    }

    /// Observe every macrostep result.
    pub fn on_transition(&mut self, listener: impl FnMut(&State<C>) + Send + 'static) -> &mut Self {
        self.transition_listeners.push(Box::new(listener));
        self
    }

    /// Observe the final state when the machine reaches top-level completion.
    pub fn on_done(&mut self, listener: impl FnMut(&State<C>) + Send + 'static) -> &mut Self {
        self.done_listeners.push(Box::new(listener));
        self
    }

    /// Observe action failures and engine errors.
    pub fn on_error(&mut self, listener: impl FnMut(&str) + Send + 'static) -> &mut Self {
        self.error_listeners.push(Box::new(listener));
        self
    }

    /// Enter the initial configuration, execute its actions, and stabilize.
    pub fn start(&mut self) -> ChartResult<&mut Self> {
        if self.status != ServiceStatus::NotStarted {
            return Ok(self);
        }
        self.status = ServiceStatus::Running;
        debug!(service = %self.id, "starting");
        let initial = self.machine.initial_state()?;
        self.commit(initial)?;
        self.stabilize()?;
        self.notify_transition();
        if self.state.done {
            self.finalize_done();
        }
        self.drain()?;
        Ok(self)
    }

    /// Enqueue an external event and drain the queue. Events sent to a
    /// stopped service are dropped; sending before `start` is an error.
    pub fn send(&mut self, event: impl Into<Event>) -> ChartResult<&State<C>> {
        self.send_envelope(ScxmlEvent::external(event.into()))
    }

    /// Like [`send`](Self::send) but keeps a caller-built envelope.
    pub fn send_envelope(&mut self, event: ScxmlEvent) -> ChartResult<&State<C>> {
        match self.status {
            ServiceStatus::NotStarted => {
                return Err(ChartError::ServiceNotRunning {
                    id: self.id.clone(),
                })
            }
            ServiceStatus::Stopped => {
                debug!(service = %self.id, event = %event.name, "dropping event after stop");
                return Ok(&self.state);
            }
            ServiceStatus::Running => {}
        }
        self.forward_self(event);
        match self.drain() {
            Ok(()) => Ok(&self.state),
            Err(error) => {
                self.notify_error(&error.to_string());
                Err(error)
            }
        }
    }

    fn forward_self(&self, event: ScxmlEvent) {
        let _ = self.tx.send(event);
    }

    /// Process every queued external event.
    fn drain(&mut self) -> ChartResult<()> {
        while self.status == ServiceStatus::Running {
            match self.rx.try_recv() {
                Ok(event) => self.macrostep(event)?,
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// One macrostep: the external event, then raised internals, then
    /// eventless transitions until quiescent; listeners notified once.
    fn macrostep(&mut self, event: ScxmlEvent) -> ChartResult<()> {
        if self.status != ServiceStatus::Running {
            return Ok(());
        }
        debug!(service = %self.id, event = %event.name, "macrostep");
        let forwarded = event.clone();
        let next = self.machine.transition(&self.state, event)?;
        self.commit(next)?;
        self.stabilize()?;

        // autoForward: child machines flagged at spawn receive every external
        // event the parent processed, after parent processing. An event is
        // never echoed back to the child it originated from.
        if forwarded.kind == EventKind::External {
            let forward_to: Vec<crate::actor::ActorRef> = self
                .state
                .children
                .values()
                .filter(|child| {
                    child.options().auto_forward
                        && forwarded.origin.as_deref() != Some(child.id())
                })
                .cloned()
                .collect();
            for child in forward_to {
                child.send_envelope(forwarded.clone());
            }
        }

        self.notify_transition();
        if self.report_updates && self.status == ServiceStatus::Running {
            if let Some(parent) = &self.parent {
                parent.forward(
                    ScxmlEvent::internal(Event::new(UPDATE_EVENT))
                        .with_origin(self.id.clone())
                        .with_invokeid(self.id.clone()),
                );
            }
        }
        if self.state.done {
            self.finalize_done();
        }
        Ok(())
    }

    /// Drain raised internal events and eventless transitions.
    fn stabilize(&mut self) -> ChartResult<()> {
        loop {
            if self.status != ServiceStatus::Running {
                return Ok(());
            }
            if let Some(internal) = self.internal_queue.pop_front() {
                let next = self.machine.transition(&self.state, internal)?;
                self.commit(next)?;
                continue;
            }
            let next = self.machine.transition(&self.state, ScxmlEvent::null())?;
            if next.changed == Some(true) {
                self.commit(next)?;
                continue;
            }
            return Ok(());
        }
    }

    /// Commit a microstep result: adopt the state, stop actors owned by
    /// exited states, activate fresh spawns, and execute the action list.
    fn commit(&mut self, next: State<C>) -> ChartResult<()> {
        let actions = next.actions.clone();
        self.state = next;
        let exited: HashSet<String> = self.state.exited.iter().cloned().collect();

        // Stop children whose owning state just exited.
        if !exited.is_empty() {
            let doomed: Vec<String> = self
                .state
                .children
                .iter()
                .filter(|(_, child)| {
                    child
                        .owner()
                        .map(|owner| exited.contains(owner))
                        .unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in doomed {
                if let Some(child) = self.state.children.remove(&id) {
                    debug!(service = %self.id, actor = %id, "stopping actor with its owning state");
                    child.stop();
                }
            }
        }

        // Activate deferred spawns before running actions so sends inside
        // this very action list can reach them.
        let handle = self.handle();
        for child in self.state.children.values() {
            if child.is_deferred() {
                child.activate(&handle);
            }
        }

        let mut raised = Vec::new();
        for action in actions {
            self.run_action(action, &mut raised);
        }
        // Raised events drain LIFO within this microstep.
        for event in raised.into_iter().rev() {
            self.internal_queue.push_front(event);
        }
        Ok(())
    }

    fn run_action(&mut self, action: ActionDef<C>, raised: &mut Vec<ScxmlEvent>) {
        match action {
            // Assigns were folded by the engine.
            ActionDef::Assign { .. } => {}
            ActionDef::Raise(event) => {
                if self.status == ServiceStatus::Running {
                    raised.push(ScxmlEvent::internal(event));
                }
            }
            ActionDef::Send(def) => {
                if self.status == ServiceStatus::Running {
                    self.dispatch_send(def);
                }
            }
            ActionDef::Cancel(id) => {
                self.active_sends.remove(&id);
            }
            ActionDef::Log { label, message } => {
                let rendered = message
                    .as_ref()
                    .map(|expr| expr(&self.state.context, &self.state.event));
                match (label, rendered) {
                    (Some(label), Some(message)) => {
                        info!(service = %self.id, %label, "{message}")
                    }
                    (Some(label), None) => info!(service = %self.id, "{label}"),
                    (None, Some(message)) => info!(service = %self.id, "{message}"),
                    (None, None) => info!(service = %self.id, "log"),
                }
            }
            ActionDef::Start(name) => match self.machine.activity(&name) {
                Some(start) => {
                    let handle = start(&self.state.context);
                    self.activities.insert(name, handle);
                }
                None => warn!(service = %self.id, activity = %name, "unknown activity"),
            },
            ActionDef::Stop(name) => {
                if let Some(Some(handle)) = self.activities.remove(&name) {
                    handle.stop();
                }
            }
            ActionDef::Opaque { name, effect } => {
                let Some(effect) = effect else { return };
                if let Err(message) = effect(&self.state.context, &self.state.event) {
                    warn!(service = %self.id, action = %name, %message, "action failed");
                    self.notify_error(&message);
                    if self.status == ServiceStatus::Running {
                        raised.push(ScxmlEvent::internal(Event::with_data(
                            ERROR_EXECUTION_EVENT,
                            serde_json::Value::String(message),
                        )));
                    }
                }
            }
        }
    }

    fn dispatch_send(&mut self, def: SendDef) {
        let SendDef {
            event,
            to,
            delay,
            id,
        } = def;
        match delay {
            Some(delay_ms) => {
                self.seq += 1;
                let send_id = id.unwrap_or_else(|| format!("send:{}", self.seq));
                let envelope = ScxmlEvent::external(event)
                    .with_sendid(send_id.clone())
                    .with_origin(self.id.clone());
                self.active_sends.insert(send_id.clone(), self.seq);
                self.timers.push(Reverse(Timer {
                    deadline: Instant::now() + Duration::from_millis(delay_ms),
                    seq: self.seq,
                    id: send_id,
                    event: envelope,
                    target: to,
                }));
            }
            None => {
                let envelope = ScxmlEvent::external(event).with_origin(self.id.clone());
                self.route(envelope, to.as_ref());
            }
        }
    }

    fn route(&self, event: ScxmlEvent, target: Option<&SendTarget>) {
        match target {
            None => self.forward_self(event),
            Some(SendTarget::Parent) => match &self.parent {
                Some(parent) => parent.forward(event),
                None => warn!(service = %self.id, event = %event.name, "no parent to send to"),
            },
            Some(SendTarget::Child(child_id)) => match self.state.children.get(child_id) {
                Some(child) => child.send_envelope(event),
                None => {
                    warn!(service = %self.id, actor = %child_id, event = %event.name, "no such child actor")
                }
            },
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let head = match self.timers.peek() {
                Some(Reverse(timer)) => {
                    let live = self.active_sends.get(&timer.id) == Some(&timer.seq);
                    (live, timer.deadline)
                }
                None => return None,
            };
            match head {
                (true, deadline) => return Some(deadline),
                // Canceled or superseded: drop lazily.
                (false, _) => {
                    self.timers.pop();
                }
            }
        }
    }

    fn has_due_timer(&mut self) -> bool {
        self.next_deadline()
            .map(|deadline| deadline <= Instant::now())
            .unwrap_or(false)
    }

    /// Move every elapsed delayed send into the mailbox and drain. Equal
    /// deadlines fire in scheduling order.
    pub fn fire_due_timers(&mut self) -> ChartResult<()> {
        let now = Instant::now();
        loop {
            let due = matches!(self.timers.peek(), Some(Reverse(timer)) if timer.deadline <= now);
            if !due {
                break;
            }
            let Some(Reverse(timer)) = self.timers.pop() else {
                break;
            };
            if self.active_sends.get(&timer.id) != Some(&timer.seq) {
                continue;
            }
            self.active_sends.remove(&timer.id);
            debug!(service = %self.id, send_id = %timer.id, event = %timer.event.name, "delayed send fired");
            self.route(timer.event, timer.target.as_ref());
        }
        self.drain()
    }

    /// Drive the service until it stops (final state reached or `stop`
    /// called): waits on the mailbox and the next timer deadline.
    pub async fn run(&mut self) -> ChartResult<State<C>> {
        if self.status == ServiceStatus::NotStarted {
            self.start()?;
        }
        while self.status == ServiceStatus::Running {
            let deadline = self.next_deadline();
            tokio::select! {
                maybe_event = self.rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.macrostep(event)?;
                            self.drain()?;
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_due_timers()?;
                }
            }
        }
        Ok(self.state.clone())
    }

    /// Drain the mailbox and due timers, yielding so actor tasks can push,
    /// until two consecutive rounds make no progress.
    pub async fn run_until_idle(&mut self) -> ChartResult<&State<C>> {
        let mut idle_rounds = 0;
        while idle_rounds < 2 {
            self.fire_due_timers()?;
            self.drain()?;
            if self.rx.is_empty() && !self.has_due_timer() {
                idle_rounds += 1;
            } else {
                idle_rounds = 0;
            }
            tokio::task::yield_now().await;
        }
        Ok(&self.state)
    }

    /// Halt: exit actions for the whole configuration bottom-up, stop every
    /// child actor, cancel pending timers. Later events are dropped.
    pub fn stop(&mut self) {
        if self.status != ServiceStatus::Running {
            self.status = ServiceStatus::Stopped;
            return;
        }
        self.status = ServiceStatus::Stopped;
        debug!(service = %self.id, "stopping");
        match engine::stop_actions(&self.machine, &self.state) {
            Ok(actions) => {
                let mut raised = Vec::new();
                for action in actions {
                    self.run_action(action, &mut raised);
                }
                // Raised events after stop are dropped with the queues.
            }
            Err(error) => self.notify_error(&error.to_string()),
        }
        let children = std::mem::take(&mut self.state.children);
        for (_, child) in children {
            child.stop();
        }
        for (_, handle) in self.activities.drain() {
            if let Some(handle) = handle {
                handle.stop();
            }
        }
        self.timers.clear();
        self.active_sends.clear();
        self.internal_queue.clear();
        while self.rx.try_recv().is_ok() {}
    }

    fn finalize_done(&mut self) {
        debug!(service = %self.id, "reached final state");
        let mut listeners = std::mem::take(&mut self.done_listeners);
        for listener in &mut listeners {
            listener(&self.state);
        }
        self.done_listeners = listeners;
        if let Some(parent) = &self.parent {
            parent.forward(
                ScxmlEvent::external(Event::new(done_invoke_event(&self.id)))
                    .with_origin(self.id.clone())
                    .with_invokeid(self.id.clone()),
            );
        }
        self.stop();
    }

    fn notify_transition(&mut self) {
        let state = &self.state;
        for listener in &mut self.transition_listeners {
            listener(state);
        }
    }

    fn notify_error(&mut self, message: &str) {
        for listener in &mut self.error_listeners {
            listener(message);
        }
    }
}

impl<C: MachineContext> Drop for Interpreter<C> {
    fn drop(&mut self) {
        if self.status == ServiceStatus::Running {
            self.stop();
        }
    }
}

impl<C: MachineContext> std::fmt::Debug for Interpreter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("value", &self.state.value)
            .finish()
    }
}

// Machine actors: a child interpreter behind a mutex, driven synchronously
// by whoever sends to it.

impl<C: MachineContext> SpawnableMachine for Machine<C> {
    fn spawn_child(
        self: Box<Self>,
        id: String,
        parent: ServiceHandle,
        sync: bool,
    ) -> Box<dyn ActorBackend> {
        match Interpreter::child(*self, id.clone(), parent, sync) {
            Ok(mut service) => {
                if let Err(error) = service.start().map(|_| ()) {
                    warn!(actor = %id, %error, "child machine failed to start");
                    return Box::new(DeadBackend);
                }
                Box::new(MachineBackend {
                    inner: Mutex::new(service),
                })
            }
            Err(error) => {
                warn!(actor = %id, %error, "child machine failed to spawn");
                Box::new(DeadBackend)
            }
        }
    }
}

impl<C: MachineContext> From<Machine<C>> for ActorSource {
    fn from(machine: Machine<C>) -> Self {
        ActorSource::Machine(Box::new(machine))
    }
}

struct MachineBackend<C: MachineContext> {
    inner: Mutex<Interpreter<C>>,
}

impl<C: MachineContext> ActorBackend for MachineBackend<C> {
    fn deliver(&self, event: ScxmlEvent) {
        match self.inner.lock() {
            Ok(mut service) => {
                let outcome = service.send_envelope(event).map(|_| ());
                if let Err(error) = outcome {
                    warn!(actor = %service.id(), %error, "child machine rejected event");
                }
            }
            Err(_) => warn!("child machine mutex poisoned"),
        }
    }

    fn halt(&mut self) {
        if let Ok(mut service) = self.inner.lock() {
            service.stop();
        }
    }
}

struct DeadBackend;

impl ActorBackend for DeadBackend {
    fn deliver(&self, event: ScxmlEvent) {
        debug!(event = %event.name, "dropping event to dead actor");
    }

    fn halt(&mut self) {}
}
