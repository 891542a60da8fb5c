//! In-memory bindings: settable variables and read-only constants

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use super::base::{delegate_bind_core, BindCore, ValueChange};
use super::{BindValue, StreamingSink};
use crate::events::{EventKind, Listener};
use crate::progress::Progress;
use crate::status::Status;
use crate::value::ValueType;

/// Receiver for every value streamed into a binding.
pub type StreamingFn = Rc<dyn Fn(Value)>;

/// A binding whose target is its own cache. Writes are confirmed immediately.
///
/// With a streaming receiver attached the binding is a streaming sink: binders
/// hand it every value their source receives instead of syncing changes.
pub struct VariableBindValue {
    core: BindCore,
    read_only: Cell<bool>,
    exclude_from_storage: Cell<bool>,
    streaming: RefCell<Option<StreamingFn>>,
}

impl VariableBindValue {
    pub fn new(initial: Value) -> Rc<Self> {
        Self::with_type(initial, None)
    }

    pub fn with_type(initial: Value, value_type: Option<ValueType>) -> Rc<Self> {
        Rc::new(Self {
            core: BindCore::new(initial, value_type),
            read_only: Cell::new(false),
            exclude_from_storage: Cell::new(false),
            streaming: RefCell::new(None),
        })
    }

    /// Attach (or detach) the streaming receiver. Binders pick the sync mode
    /// when they are created, so attach before binding.
    pub fn set_streaming_receiver(&self, receiver: Option<StreamingFn>) {
        *self.streaming.borrow_mut() = receiver;
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.set(read_only);
    }

    pub fn set_exclude_from_storage(&self, exclude: bool) {
        self.exclude_from_storage.set(exclude);
    }

    fn on_value_changed(&self, _change: &ValueChange, _progress: &Progress) {
        self.core.set_stale(false);
    }
}

impl BindValue for VariableBindValue {
    delegate_bind_core!();

    fn set_default_type(&self, value_type: ValueType) {
        if self.core.value_type().is_none() {
            self.core.set_value_type(Some(value_type));
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only.get()
    }

    fn exclude_from_storage(&self) -> bool {
        self.exclude_from_storage.get()
    }

    fn as_streaming_sink(&self) -> Option<&dyn StreamingSink> {
        self.streaming
            .borrow()
            .is_some()
            .then_some(self as &dyn StreamingSink)
    }
}

impl StreamingSink for VariableBindValue {
    fn on_streaming_data_received(&self, data: Value) {
        let receiver = self.streaming.borrow().clone();
        if let Some(receiver) = receiver {
            receiver(data);
        }
    }
}

impl fmt::Debug for VariableBindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableBindValue")
            .field("core", &self.core)
            .field("read_only", &self.read_only.get())
            .field("streaming", &self.streaming.borrow().is_some())
            .finish()
    }
}

/// A read-only literal. Also used to hold an error status in place of a binding
/// that could not be created.
pub struct ConstantBindValue {
    core: BindCore,
}

impl ConstantBindValue {
    pub fn new(value: Value) -> Rc<Self> {
        Self::with_type(value, None)
    }

    pub fn with_type(value: Value, value_type: Option<ValueType>) -> Rc<Self> {
        Rc::new(Self {
            core: BindCore::new(value, value_type),
        })
    }

    /// A null constant carrying `status`.
    pub fn with_status(status: Status) -> Rc<Self> {
        let constant = Self::new(Value::Null);
        constant.core.set_status(Some(status));
        constant
    }
}

impl BindValue for ConstantBindValue {
    fn name(&self) -> String {
        self.core.name()
    }

    fn set_name(&self, name: &str) {
        self.core.set_name(name)
    }

    fn value(&self) -> Value {
        self.core.value()
    }

    fn set_value(&self, _value: Value, _progress: &Progress, _force: bool) {}

    fn update_value(&self, _value: Value, _progress: &Progress, _skip_streaming: bool) {}

    fn value_type(&self) -> Option<ValueType> {
        self.core.value_type()
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn is_stale(&self) -> bool {
        false
    }

    fn status(&self) -> Option<Status> {
        self.core.status()
    }

    fn set_status(&self, status: Option<Status>) {
        self.core.set_status(status);
    }

    fn set_deferred_mode(&self, _deferred: bool, _progress: &Progress, _force: bool) {}

    fn is_deferred_mode(&self) -> bool {
        false
    }

    fn committed_value(&self) -> Value {
        self.core.value()
    }

    fn clear_deferred_write(&self) {}

    fn is_deferred_write_pending(&self) -> bool {
        false
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) {
        self.core.add_listener(kind, listener);
    }

    fn remove_listener(&self, kind: EventKind, listener: &Listener) {
        self.core.remove_listener(kind, listener);
    }

    fn exclude_from_storage(&self) -> bool {
        true
    }
}

impl fmt::Debug for ConstantBindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantBindValue")
            .field("value", &self.core.value())
            .field("status", &self.core.status())
            .finish()
    }
}
