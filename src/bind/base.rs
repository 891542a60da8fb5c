//! Common binding state: cache, committed value, staleness, deferred mode, status

use std::cell::{Cell, RefCell};
use std::fmt;

use serde_json::Value;

use crate::events::{BindEvent, EventKind, Events, Listener};
use crate::progress::Progress;
use crate::status::Status;
use crate::value::{same_value, ValueType};

/// A local value change handed to the `on_value_changed` hook
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub old_value: Value,
    pub new_value: Value,
}

struct CoreState {
    cached: Value,
    committed: Value,
    status: Option<Status>,
    value_type: Option<ValueType>,
}

/// State shared by every concrete binding.
///
/// Outside deferred mode `committed` follows `cached`; in deferred mode local
/// writes only touch `cached` until the mode is left.
pub struct BindCore {
    name: RefCell<String>,
    state: RefCell<CoreState>,
    stale: Cell<bool>,
    deferred: Cell<bool>,
    events: Events,
}

impl BindCore {
    pub fn new(initial: Value, value_type: Option<ValueType>) -> Self {
        Self {
            name: RefCell::new(String::new()),
            state: RefCell::new(CoreState {
                committed: initial.clone(),
                cached: initial,
                status: None,
                value_type,
            }),
            stale: Cell::new(false),
            deferred: Cell::new(false),
            events: Events::new(),
        }
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_string();
    }

    pub fn value(&self) -> Value {
        self.state.borrow().cached.clone()
    }

    pub fn committed(&self) -> Value {
        self.state.borrow().committed.clone()
    }

    /// Explicit type, or the type of the current value.
    pub fn value_type(&self) -> Option<ValueType> {
        let state = self.state.borrow();
        state
            .value_type
            .clone()
            .or_else(|| ValueType::of(&state.cached))
    }

    pub fn set_value_type(&self, value_type: Option<ValueType>) {
        self.state.borrow_mut().value_type = value_type;
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn add_listener(&self, kind: EventKind, listener: Listener) -> bool {
        self.events.add(kind, listener)
    }

    pub fn remove_listener(&self, kind: EventKind, listener: &Listener) -> bool {
        self.events.remove(kind, listener)
    }

    pub fn is_stale(&self) -> bool {
        self.stale.get()
    }

    pub fn set_stale(&self, stale: bool) {
        if self.stale.replace(stale) != stale {
            self.events.fire(&BindEvent::StaleChanged { stale });
        }
    }

    pub fn status(&self) -> Option<Status> {
        self.state.borrow().status.clone()
    }

    /// Replace the status. Returns true (and notifies) only on a semantic change.
    pub fn set_status(&self, status: Option<Status>) -> bool {
        let old_status = {
            let mut state = self.state.borrow_mut();
            if state.status == status {
                return false;
            }
            std::mem::replace(&mut state.status, status.clone())
        };
        self.events.fire(&BindEvent::StatusChanged {
            old_status,
            new_status: status,
        });
        true
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.get()
    }

    pub fn is_deferred_write_pending(&self) -> bool {
        let state = self.state.borrow();
        self.deferred.get() && !same_value(&state.cached, &state.committed)
    }

    /// Apply a local write. Returns the change when the value changed (or `force`).
    pub fn begin_set(&self, value: Value, force: bool) -> Option<ValueChange> {
        let change = {
            let mut state = self.state.borrow_mut();
            if !force && same_value(&state.cached, &value) {
                return None;
            }
            let old_value = std::mem::replace(&mut state.cached, value.clone());
            if !self.deferred.get() {
                state.committed = value.clone();
            }
            ValueChange {
                old_value,
                new_value: value,
            }
        };
        self.set_stale(true);
        Some(change)
    }

    /// Overwrite the committed value only (buffered delayed writes).
    pub fn set_committed(&self, value: Value) {
        self.state.borrow_mut().committed = value;
    }

    pub fn notify_value_changed(&self, change: &ValueChange, progress: &Progress, skip_streaming: bool) {
        self.events.fire(&BindEvent::ValueChanged {
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            progress: progress.clone(),
        });
        if !skip_streaming {
            self.events.fire(&BindEvent::StreamingData {
                data: change.new_value.clone(),
            });
        }
    }

    /// Commit an externally observed value. Value listeners only hear about real
    /// changes; streaming listeners hear every value unless skipped.
    pub fn update(&self, value: Value, progress: &Progress, skip_streaming: bool) {
        let old_value = {
            let mut state = self.state.borrow_mut();
            if !self.deferred.get() {
                state.committed = value.clone();
            }
            std::mem::replace(&mut state.cached, value.clone())
        };
        if !same_value(&old_value, &value) {
            self.events.fire(&BindEvent::ValueChanged {
                old_value,
                new_value: value.clone(),
                progress: progress.clone(),
            });
        }
        if !skip_streaming {
            self.events.fire(&BindEvent::StreamingData { data: value });
        }
    }

    /// Enter or leave deferred mode. Leaving returns the buffered change that must
    /// be written once (when it differs from committed, or `force`).
    pub fn set_deferred(&self, deferred: bool, force: bool) -> Option<ValueChange> {
        let change = {
            let mut state = self.state.borrow_mut();
            let do_write = !deferred && (force || !same_value(&state.cached, &state.committed));
            self.deferred.set(deferred);
            if !do_write {
                return None;
            }
            let cached = state.cached.clone();
            let old_value = std::mem::replace(&mut state.committed, cached.clone());
            ValueChange {
                old_value,
                new_value: cached,
            }
        };
        self.set_stale(true);
        Some(change)
    }

    /// Revert buffered local writes to the committed value.
    pub fn clear_deferred_write(&self, progress: &Progress) {
        if !self.is_deferred_write_pending() {
            return;
        }
        let change = {
            let mut state = self.state.borrow_mut();
            let committed = state.committed.clone();
            ValueChange {
                old_value: std::mem::replace(&mut state.cached, committed.clone()),
                new_value: committed,
            }
        };
        self.notify_value_changed(&change, progress, false);
    }
}

/// Status owned by an operator or decorator node. It shadows the operands'
/// statuses; only `StatusChanged` listeners are kept here, everything else is
/// forwarded to the operands by the node.
#[derive(Default)]
pub struct StatusSlot {
    status: RefCell<Option<Status>>,
    events: Events,
}

impl StatusSlot {
    pub fn get(&self) -> Option<Status> {
        self.status.borrow().clone()
    }

    pub fn set(&self, status: Option<Status>) {
        let old_status = {
            let mut slot = self.status.borrow_mut();
            if *slot == status {
                return;
            }
            std::mem::replace(&mut *slot, status.clone())
        };
        self.events.fire(&BindEvent::StatusChanged {
            old_status,
            new_status: status,
        });
    }

    pub fn add_listener(&self, kind: EventKind, listener: &Listener) {
        if kind == EventKind::StatusChanged {
            self.events.add(kind, std::rc::Rc::clone(listener));
        }
    }

    pub fn remove_listener(&self, kind: EventKind, listener: &Listener) {
        self.events.remove(kind, listener);
    }
}

impl fmt::Debug for StatusSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatusSlot").field(&*self.status.borrow()).finish()
    }
}

impl fmt::Debug for BindCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("BindCore")
            .field("name", &self.name.borrow())
            .field("cached", &state.cached)
            .field("committed", &state.committed)
            .field("stale", &self.stale.get())
            .field("deferred", &self.deferred.get())
            .field("status", &state.status)
            .finish()
    }
}

/// Implements the `BindValue` methods that only touch a `core: BindCore` field.
///
/// The implementing type provides `fn on_value_changed(&self, &ValueChange, &Progress)`
/// plus `is_read_only` and any capability accessors.
macro_rules! delegate_bind_core {
    () => {
        fn name(&self) -> String {
            self.core.name()
        }

        fn set_name(&self, name: &str) {
            self.core.set_name(name)
        }

        fn value(&self) -> serde_json::Value {
            self.core.value()
        }

        fn set_value(&self, value: serde_json::Value, progress: &$crate::progress::Progress, force: bool) {
            if let Some(change) = self.core.begin_set(value, force) {
                self.on_value_changed(&change, progress);
                self.core.notify_value_changed(&change, progress, false);
            }
        }

        fn update_value(&self, value: serde_json::Value, progress: &$crate::progress::Progress, skip_streaming: bool) {
            self.core.update(value, progress, skip_streaming)
        }

        fn value_type(&self) -> Option<$crate::value::ValueType> {
            self.core.value_type()
        }

        fn is_stale(&self) -> bool {
            self.core.is_stale()
        }

        fn status(&self) -> Option<$crate::status::Status> {
            self.core.status()
        }

        fn set_status(&self, status: Option<$crate::status::Status>) {
            self.core.set_status(status);
        }

        fn set_deferred_mode(&self, deferred: bool, progress: &$crate::progress::Progress, force: bool) {
            if let Some(change) = self.core.set_deferred(deferred, force) {
                self.on_value_changed(&change, progress);
            }
        }

        fn is_deferred_mode(&self) -> bool {
            self.core.is_deferred()
        }

        fn committed_value(&self) -> serde_json::Value {
            self.core.committed()
        }

        fn clear_deferred_write(&self) {
            self.core.clear_deferred_write(&$crate::progress::Progress::null())
        }

        fn is_deferred_write_pending(&self) -> bool {
            self.core.is_deferred_write_pending()
        }

        fn add_listener(&self, kind: $crate::events::EventKind, listener: $crate::events::Listener) {
            self.core.add_listener(kind, listener);
        }

        fn remove_listener(&self, kind: $crate::events::EventKind, listener: &$crate::events::Listener) {
            self.core.remove_listener(kind, listener);
        }
    };
}

pub(crate) use delegate_bind_core;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::rc::Rc;

    #[test]
    fn begin_set_marks_stale_and_commits() {
        let core = BindCore::new(json!(1), None);
        assert!(core.begin_set(json!(1), false).is_none());
        let change = core.begin_set(json!(2), false).unwrap();
        assert_eq!(change.old_value, json!(1));
        assert!(core.is_stale());
        assert_eq!(core.committed(), json!(2));
        assert!(core.begin_set(json!(2), true).is_some());
    }

    #[test]
    fn deferred_writes_buffer_until_mode_left() {
        let core = BindCore::new(json!(0), None);
        assert!(core.set_deferred(true, false).is_none());
        core.begin_set(json!(5), false);
        assert_eq!(core.committed(), json!(0));
        assert!(core.is_deferred_write_pending());

        let change = core.set_deferred(false, false).unwrap();
        assert_eq!(change.new_value, json!(5));
        assert_eq!(core.committed(), json!(5));
        assert!(!core.is_deferred_write_pending());
        // nothing buffered, nothing to write
        assert!(core.set_deferred(false, false).is_none());
        assert!(core.set_deferred(false, true).is_some());
    }

    #[test]
    fn clear_deferred_write_reverts() {
        let core = BindCore::new(json!("a"), None);
        core.set_deferred(true, false);
        core.begin_set(json!("b"), false);
        core.clear_deferred_write(&Progress::null());
        assert_eq!(core.value(), json!("a"));
        assert!(!core.is_deferred_write_pending());
    }

    #[test]
    fn status_notifies_only_on_semantic_change() {
        let core = BindCore::new(Value::Null, None);
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        core.add_listener(
            EventKind::StatusChanged,
            crate::events::listener(move |_| h.set(h.get() + 1)),
        );
        assert!(core.set_status(Some(Status::error("x"))));
        assert!(!core.set_status(Some(Status::error("x"))));
        assert!(core.set_status(None));
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn update_fires_streaming_for_equal_values() {
        let core = BindCore::new(json!(1), None);
        let values = Rc::new(Cell::new(0));
        let streams = Rc::new(Cell::new(0));
        let (v, s) = (values.clone(), streams.clone());
        core.add_listener(
            EventKind::ValueChanged,
            crate::events::listener(move |_| v.set(v.get() + 1)),
        );
        core.add_listener(
            EventKind::StreamingData,
            crate::events::listener(move |_| s.set(s.get() + 1)),
        );
        core.update(json!(1), &Progress::null(), false);
        core.update(json!(2), &Progress::null(), false);
        core.update(json!(3), &Progress::null(), true);
        assert_eq!(values.get(), 2);
        assert_eq!(streams.get(), 2);
    }

    #[test]
    fn value_type_falls_back_to_value() {
        let core = BindCore::new(json!("s"), None);
        assert_eq!(core.value_type(), Some(ValueType::String));
        core.set_value_type(Some(ValueType::Number));
        assert_eq!(core.value_type(), Some(ValueType::Number));
    }
}
