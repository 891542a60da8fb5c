//! Target-backed bindings driven by the read/write state machine
//!
//! `AsyncBindValue` owns a `StateMachine` and a `Target`. Reads and writes run as
//! local tasks (`tokio::task::spawn_local`), so bindings must be used from inside
//! a `tokio::task::LocalSet`. Tasks hold only a weak reference: dropping the
//! binding detaches any in-flight result.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use async_trait::async_trait;
use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture};
use serde_json::Value;
use tracing::{debug, warn};

use super::base::{BindCore, ValueChange};
use super::lookup::LookupIndex;
use super::machine::{Action, Context, MachineEvent, Qualifier, State, StateMachine};
use super::{BindValue, Disconnectable, LookupKind, Lookupable, Qualifiable, Refreshable};
use crate::error::Result;
use crate::events::{EventKind, Listener};
use crate::progress::Progress;
use crate::script_log::{NoopEmitter, ScriptLogEmitter, ScriptLogEvent};
use crate::status::Status;
use crate::value::ValueType;

/// An external value source that only supports asynchronous reads and writes.
///
/// `index` is the binding's current lookup index tuple (empty for plain bindings).
#[async_trait(?Send)]
pub trait Target: 'static {
    async fn read_value(&self, index: &[Value]) -> Result<Value>;
    async fn write_value(&self, value: Value, index: &[Value]) -> Result<()>;

    fn is_connected(&self) -> bool {
        true
    }

    /// Lookup kind when the target is indexed (`regs[3]`, `fields.name`).
    fn lookup_kind(&self) -> Option<LookupKind> {
        None
    }

    fn value_type(&self) -> Option<ValueType> {
        None
    }
}

pub struct AsyncBindValue<T: Target> {
    core: BindCore,
    target: Rc<T>,
    machine: RefCell<StateMachine>,
    lookup: LookupIndex,
    has_listeners: Cell<bool>,
    /// Progress of the outstanding read or write
    op_progress: RefCell<Option<Progress>>,
    /// Progress of the buffered delayed write
    delayed_progress: RefCell<Option<Progress>>,
    /// Status set by the last failed operation, cleared by the next success
    failure: RefCell<Option<Status>>,
    settle_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    emitter: RefCell<Rc<dyn ScriptLogEmitter>>,
    ignore_writes_when_disconnected: Cell<bool>,
    self_ref: Weak<Self>,
}

impl<T: Target> AsyncBindValue<T> {
    pub fn new(target: T) -> Rc<Self> {
        Self::from_rc(Rc::new(target))
    }

    /// Create a binding over a shared target.
    pub fn from_rc(target: Rc<T>) -> Rc<Self> {
        let value_type = target.value_type();
        Rc::new_cyclic(|self_ref| {
            let core = BindCore::new(Value::Null, value_type);
            // nothing has been read yet
            core.set_stale(true);
            Self {
                core,
                target,
                machine: RefCell::new(StateMachine::default()),
                lookup: LookupIndex::new(),
                has_listeners: Cell::new(false),
                op_progress: RefCell::new(None),
                delayed_progress: RefCell::new(None),
                failure: RefCell::new(None),
                settle_waiters: RefCell::new(Vec::new()),
                emitter: RefCell::new(Rc::new(NoopEmitter)),
                ignore_writes_when_disconnected: Cell::new(false),
                self_ref: self_ref.clone(),
            }
        })
    }

    pub fn with_emitter(self: Rc<Self>, emitter: Rc<dyn ScriptLogEmitter>) -> Rc<Self> {
        *self.emitter.borrow_mut() = emitter;
        self
    }

    pub fn set_emitter(&self, emitter: Rc<dyn ScriptLogEmitter>) {
        *self.emitter.borrow_mut() = emitter;
    }

    pub fn set_ignore_writes_when_disconnected(&self, ignore: bool) {
        self.ignore_writes_when_disconnected.set(ignore);
    }

    pub fn target(&self) -> &Rc<T> {
        &self.target
    }

    pub fn state(&self) -> State {
        self.machine.borrow().state()
    }

    pub fn is_busy(&self) -> bool {
        self.machine.borrow().is_busy()
    }

    pub fn has_listeners(&self) -> bool {
        self.has_listeners.get()
    }

    fn context(&self) -> Context {
        let connected = self.target.is_connected();
        Context {
            connected,
            deferred: self.core.is_deferred(),
            deferred_write_pending: self.core.is_deferred_write_pending(),
            has_listeners: self.has_listeners.get(),
            write_allowed: connected || !self.ignore_writes_when_disconnected.get(),
        }
    }

    /// Feed one event to the machine and start whatever operation it asks for.
    /// `progress` is attached to a started operation.
    fn dispatch(&self, event: MachineEvent, progress: Option<Progress>) -> Action {
        let ctx = self.context();
        let action = self.machine.borrow_mut().transition(event, &ctx);
        match action {
            Action::Read | Action::Write => {
                if let Some(progress) = &progress {
                    progress.wait(1);
                }
                *self.op_progress.borrow_mut() = progress;
                if action == Action::Read {
                    self.start_read();
                } else {
                    self.start_write();
                }
            }
            _ => {}
        }
        action
    }

    fn start_read(&self) {
        let target = Rc::clone(&self.target);
        let index = self.lookup.get();
        let this = self.self_ref.clone();
        debug!(name = %self.core.name(), "reading target");
        tokio::task::spawn_local(async move {
            let result = target.read_value(&index).await;
            if let Some(this) = this.upgrade() {
                this.on_read_done(result);
            }
        });
    }

    fn start_write(&self) {
        let target = Rc::clone(&self.target);
        let index = self.lookup.get();
        let value = self.core.committed();
        let this = self.self_ref.clone();
        debug!(name = %self.core.name(), %value, "writing target");
        tokio::task::spawn_local(async move {
            let result = target.write_value(value, &index).await;
            if let Some(this) = this.upgrade() {
                this.on_write_done(result);
            }
        });
    }

    fn on_read_done(&self, result: Result<Value>) {
        let finished = self.op_progress.borrow_mut().take();
        match result {
            Ok(value) => {
                self.clear_failure();
                if self.dispatch_completion(MachineEvent::ReadCompleted) == Action::Commit {
                    self.core.update(value, &Progress::null(), false);
                }
            }
            Err(err) => self.on_failed(err),
        }
        if let Some(progress) = finished {
            progress.done(1);
        }
        self.settle_if_idle();
    }

    fn on_write_done(&self, result: Result<()>) {
        let finished = self.op_progress.borrow_mut().take();
        match result {
            Ok(()) => {
                self.clear_failure();
                self.dispatch_completion(MachineEvent::WriteCompleted);
            }
            Err(err) => self.on_failed(err),
        }
        if let Some(progress) = finished {
            progress.done(1);
        }
        self.settle_if_idle();
    }

    fn on_failed(&self, err: crate::error::BindError) {
        warn!(name = %self.core.name(), error = %err, "target operation failed");
        let status = Status::from(&err);
        *self.failure.borrow_mut() = Some(status.clone());
        self.core.set_status(Some(status));
        self.dispatch_completion(MachineEvent::OperationFailed);
    }

    /// Deliver a completion or failure. A buffered delayed write goes out next
    /// and carries the job its progress counter was given when buffered.
    fn dispatch_completion(&self, event: MachineEvent) -> Action {
        let delayed = if self.state() == State::DelayedWrite {
            self.delayed_progress.borrow_mut().take()
        } else {
            None
        };
        let action = self.dispatch(event, None);
        if action == Action::Write {
            *self.op_progress.borrow_mut() = delayed;
        } else if let Some(progress) = delayed {
            progress.done(1);
        }
        action
    }

    fn clear_failure(&self) {
        if let Some(failure) = self.failure.borrow_mut().take() {
            if self.core.status().as_ref() == Some(&failure) {
                self.core.set_status(None);
            }
        }
    }

    /// Once nothing is outstanding, confirm the cache and wake `settled()` waiters.
    fn settle_if_idle(&self) {
        if self.is_busy() {
            return;
        }
        if !self.core.is_deferred_write_pending() {
            self.core.set_stale(false);
        }
        for waiter in self.settle_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Resolves once no read or write is outstanding.
    pub fn settled(&self) -> LocalBoxFuture<'static, ()> {
        if !self.is_busy() {
            return future::ready(()).boxed_local();
        }
        let (tx, rx) = oneshot::channel();
        self.settle_waiters.borrow_mut().push(tx);
        rx.map(|_| ()).boxed_local()
    }

    /// Start the initial read of a binding that is not polled.
    pub fn kick_start_read(&self, force: bool) {
        self.dispatch(MachineEvent::KickStart { force }, None);
    }

    /// Refresh and record a `read` script-log event.
    pub fn refresh_and_log(&self, progress: &Progress) -> LocalBoxFuture<'static, ()> {
        self.emitter.borrow().emit(ScriptLogEvent::Read {
            name: self.core.name(),
        });
        self.refresh(progress, true)
    }

    /// Report (`Some`) or clear (`None`) a critical error. While reported, the
    /// binding does no reads or writes.
    pub fn report_critical_error(&self, status: Option<Status>) {
        if status.is_some() {
            self.dispatch(MachineEvent::CriticalError, None);
        } else {
            self.dispatch(MachineEvent::CriticalErrorCleared, None);
        }
        self.core.set_status(status);
    }

    fn on_value_changed(&self, change: &ValueChange, progress: &Progress) {
        let ctx = self.context();
        let writable = self.machine.borrow().capabilities().writable;
        if writable && !ctx.deferred && ctx.write_allowed {
            self.emitter.borrow().emit(ScriptLogEvent::Write {
                name: self.core.name(),
                value: change.new_value.clone(),
            });
        }
        match self.dispatch(MachineEvent::ValueChanged, Some(progress.clone())) {
            Action::Buffer => {
                if let Some(superseded) = self.delayed_progress.borrow_mut().take() {
                    superseded.done(1);
                }
                progress.wait(1);
                *self.delayed_progress.borrow_mut() = Some(progress.clone());
            }
            Action::Ignored => self.core.set_stale(false),
            _ => {}
        }
    }

    fn update_listener_state(&self) {
        let events = self.core.events();
        let listening = events.has_listeners(EventKind::ValueChanged)
            || events.has_listeners(EventKind::StreamingData);
        let was = self.has_listeners.replace(listening);
        if listening && !was && self.is_refreshable() {
            self.kick_start_read(true);
        }
    }
}

impl<T: Target> BindValue for AsyncBindValue<T> {
    fn name(&self) -> String {
        self.core.name()
    }

    fn set_name(&self, name: &str) {
        self.core.set_name(name)
    }

    fn value(&self) -> Value {
        self.core.value()
    }

    fn set_value(&self, value: Value, progress: &Progress, force: bool) {
        if let Some(change) = self.core.begin_set(value, force) {
            self.on_value_changed(&change, progress);
            self.core.notify_value_changed(&change, progress, false);
        }
    }

    fn update_value(&self, value: Value, progress: &Progress, skip_streaming: bool) {
        self.core.update(value, progress, skip_streaming)
    }

    fn value_type(&self) -> Option<ValueType> {
        self.core.value_type()
    }

    fn set_default_type(&self, value_type: ValueType) {
        if self.core.value_type().is_none() {
            self.core.set_value_type(Some(value_type));
        }
    }

    fn is_read_only(&self) -> bool {
        !self.machine.borrow().capabilities().writable
    }

    fn is_stale(&self) -> bool {
        self.core.is_stale()
    }

    fn status(&self) -> Option<Status> {
        self.core.status()
    }

    fn set_status(&self, status: Option<Status>) {
        self.core.set_status(status);
    }

    fn set_deferred_mode(&self, deferred: bool, progress: &Progress, force: bool) {
        if let Some(change) = self.core.set_deferred(deferred, force) {
            self.on_value_changed(&change, progress);
        }
    }

    fn is_deferred_mode(&self) -> bool {
        self.core.is_deferred()
    }

    fn committed_value(&self) -> Value {
        self.core.committed()
    }

    fn clear_deferred_write(&self) {
        self.core.clear_deferred_write(&Progress::null())
    }

    fn is_deferred_write_pending(&self) -> bool {
        self.core.is_deferred_write_pending()
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) {
        self.core.add_listener(kind, listener);
        self.update_listener_state();
    }

    fn remove_listener(&self, kind: EventKind, listener: &Listener) {
        self.core.remove_listener(kind, listener);
        self.update_listener_state();
    }

    fn as_lookup(&self) -> Option<&dyn Lookupable> {
        self.target.lookup_kind().map(|_| self as &dyn Lookupable)
    }

    fn as_refreshable(&self) -> Option<&dyn Refreshable> {
        Some(self)
    }

    fn as_disconnectable(&self) -> Option<&dyn Disconnectable> {
        Some(self)
    }

    fn as_qualifiable(&self) -> Option<&dyn Qualifiable> {
        Some(self)
    }
}

impl<T: Target> Refreshable for AsyncBindValue<T> {
    fn refresh(&self, progress: &Progress, force: bool) -> LocalBoxFuture<'static, ()> {
        self.dispatch(MachineEvent::Refresh { force }, Some(progress.clone()));
        self.settled()
    }

    fn is_refreshable(&self) -> bool {
        self.machine.borrow().is_refreshable(&self.context())
    }
}

impl<T: Target> Lookupable for AsyncBindValue<T> {
    fn set_index(&self, indices: &[Value]) {
        if self.lookup.set(indices) {
            self.dispatch(MachineEvent::IndexChanged, None);
        }
    }

    fn index(&self) -> Vec<Value> {
        self.lookup.get()
    }

    fn lookup_kind(&self) -> LookupKind {
        self.target.lookup_kind().unwrap_or(LookupKind::Array)
    }
}

impl<T: Target> Disconnectable for AsyncBindValue<T> {
    fn on_disconnected(&self) {
        self.report_critical_error(None);
        self.kick_start_read(false);
    }
}

impl<T: Target> Qualifiable for AsyncBindValue<T> {
    fn set_qualifier(&self, qualifier: Qualifier) {
        let name = self.core.name();
        let (valid, kick) = self.machine.borrow_mut().set_qualifier(qualifier, &name);
        if !valid {
            self.core.set_status(Some(Status::error(format!(
                "Invalid qualifier .${} added to binding \"{}\" that already has an existing .${} or .${} qualifier.",
                Qualifier::WriteOnly,
                name,
                Qualifier::ReadOnly,
                Qualifier::Const
            ))));
        }
        if kick {
            self.kick_start_read(false);
        }
    }
}

impl<T: Target> fmt::Debug for AsyncBindValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBindValue")
            .field("core", &self.core)
            .field("machine", &*self.machine.borrow())
            .field("has_listeners", &self.has_listeners.get())
            .finish()
    }
}
