//! Late-bound alias that forwards to whichever binding it currently resolves to

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use tracing::warn;

use super::variable::ConstantBindValue;
use super::{Bind, BindValue, Refreshable};
use crate::error::{BindError, Result};
use crate::events::{BindEvent, EventKind, Events, Listener};
use crate::progress::Progress;
use crate::status::Status;
use crate::value::{same_value, ValueType};

/// A binding whose operand can be swapped at runtime (`&name` in a model's
/// calculated bindings). Listeners follow the operand across swaps and see
/// value/status/stale events for any difference between old and new operand.
pub struct ReferenceBindValue {
    name: RefCell<String>,
    operand: RefCell<Bind>,
    expression: RefCell<Option<String>>,
    /// Listeners registered through this reference, re-attached on every swap
    listeners: Events,
}

impl ReferenceBindValue {
    /// A reference that is not yet resolved.
    pub fn new(name: &str) -> Rc<Self> {
        let reference = Rc::new(Self {
            name: RefCell::new(name.to_string()),
            operand: RefCell::new(ConstantBindValue::new(Value::Null)),
            expression: RefCell::new(None),
            listeners: Events::new(),
        });
        reference.retarget(None, Err(reference.undefined()));
        reference
    }

    pub fn expression(&self) -> Option<String> {
        self.expression.borrow().clone()
    }

    pub fn operand(&self) -> Bind {
        Rc::clone(&self.operand.borrow())
    }

    fn undefined(&self) -> BindError {
        BindError::syntax(format!(
            "The calculated binding \"{}\" is not defined for this device.",
            self.name.borrow()
        ))
    }

    /// Point the reference at the result of resolving `expression`. A failed
    /// resolution installs a null constant carrying the error status.
    pub fn retarget(&self, expression: Option<&str>, resolved: Result<Bind>) {
        *self.expression.borrow_mut() = expression.map(str::to_string);
        let new_bind: Bind = match resolved {
            Ok(bind) => bind,
            Err(err) => {
                let status = Status::from(&err);
                if expression.is_some() {
                    warn!(name = %self.name.borrow(), error = %err, "reference binding unresolved");
                }
                ConstantBindValue::with_status(status)
            }
        };

        let old_bind = self.operand.replace(Rc::clone(&new_bind));
        let old_value = old_bind.value();
        let old_stale = old_bind.is_stale();
        let old_status = old_bind.status();

        for (kind, listener) in self.listeners.take_all() {
            old_bind.remove_listener(kind, &listener);
            new_bind.add_listener(kind, Rc::clone(&listener));
            self.listeners.add(kind, listener);
        }

        let new_value = new_bind.value();
        let new_stale = new_bind.is_stale();
        let new_status = new_bind.status();

        if old_status != new_status {
            self.listeners.fire(&BindEvent::StatusChanged {
                old_status,
                new_status,
            });
        }
        if old_stale != new_stale {
            self.listeners
                .fire(&BindEvent::StaleChanged { stale: new_stale });
        }
        if !same_value(&old_value, &new_value) {
            self.listeners.fire(&BindEvent::ValueChanged {
                old_value,
                new_value,
                progress: Progress::null(),
            });
        }
    }
}

impl BindValue for ReferenceBindValue {
    fn name(&self) -> String {
        self.name.borrow().clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_string();
    }

    fn value(&self) -> Value {
        self.operand().value()
    }

    fn set_value(&self, value: Value, progress: &Progress, force: bool) {
        self.operand().set_value(value, progress, force);
    }

    fn update_value(&self, value: Value, progress: &Progress, skip_streaming: bool) {
        self.operand().update_value(value, progress, skip_streaming);
    }

    fn value_type(&self) -> Option<ValueType> {
        self.operand().value_type()
    }

    fn is_read_only(&self) -> bool {
        self.operand().is_read_only()
    }

    fn is_stale(&self) -> bool {
        self.operand().is_stale()
    }

    fn status(&self) -> Option<Status> {
        self.operand().status()
    }

    fn set_status(&self, status: Option<Status>) {
        self.operand().set_status(status);
    }

    fn set_deferred_mode(&self, deferred: bool, progress: &Progress, force: bool) {
        self.operand().set_deferred_mode(deferred, progress, force);
    }

    fn is_deferred_mode(&self) -> bool {
        self.operand().is_deferred_mode()
    }

    fn committed_value(&self) -> Value {
        self.operand().committed_value()
    }

    fn clear_deferred_write(&self) {
        self.operand().clear_deferred_write();
    }

    fn is_deferred_write_pending(&self) -> bool {
        self.operand().is_deferred_write_pending()
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) {
        self.listeners.add(kind, Rc::clone(&listener));
        self.operand().add_listener(kind, listener);
    }

    fn remove_listener(&self, kind: EventKind, listener: &Listener) {
        self.listeners.remove(kind, listener);
        self.operand().remove_listener(kind, listener);
    }

    fn as_refreshable(&self) -> Option<&dyn Refreshable> {
        Some(self)
    }

    fn exclude_from_storage(&self) -> bool {
        true
    }

    fn dispose(&self) {
        let operand = self.operand();
        for (kind, listener) in self.listeners.take_all() {
            operand.remove_listener(kind, &listener);
        }
    }
}

impl Refreshable for ReferenceBindValue {
    fn refresh(&self, progress: &Progress, force: bool) -> futures::future::LocalBoxFuture<'static, ()> {
        use futures::FutureExt;
        let operand = self.operand();
        let refresh = operand
            .as_refreshable()
            .map(|refreshable| refreshable.refresh(progress, force));
        async move {
            if let Some(refresh) = refresh {
                refresh.await;
            }
        }
        .boxed_local()
    }

    fn is_refreshable(&self) -> bool {
        self.operand()
            .as_refreshable()
            .is_some_and(|refreshable| refreshable.is_refreshable())
    }
}

impl fmt::Debug for ReferenceBindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceBindValue")
            .field("name", &*self.name.borrow())
            .field("expression", &*self.expression.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::VariableBindValue;
    use crate::events::listener;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn unresolved_reference_carries_error_status() {
        let reference = ReferenceBindValue::new("calc");
        assert_eq!(reference.value(), Value::Null);
        let status = reference.status().unwrap();
        assert!(status.is_error());
        assert_eq!(
            status.message,
            "The calculated binding \"calc\" is not defined for this device."
        );
    }

    #[test]
    fn retarget_moves_listeners_and_fires_differences() {
        let reference = ReferenceBindValue::new("calc");
        let changes = Rc::new(Cell::new(0));
        let c = changes.clone();
        reference.add_listener(
            EventKind::ValueChanged,
            listener(move |_| c.set(c.get() + 1)),
        );

        let first = VariableBindValue::new(json!(3));
        reference.retarget(Some("a"), Ok(first.clone()));
        assert_eq!(changes.get(), 1);
        assert!(reference.status().is_none());

        first.set_value(json!(4), &Progress::null(), false);
        assert_eq!(changes.get(), 2);

        let second = VariableBindValue::new(json!(4));
        reference.retarget(Some("b"), Ok(second.clone()));
        // same value, no event
        assert_eq!(changes.get(), 2);

        first.set_value(json!(5), &Progress::null(), false);
        assert_eq!(changes.get(), 2);
        second.set_value(json!(6), &Progress::null(), false);
        assert_eq!(changes.get(), 3);
        assert_eq!(reference.expression().as_deref(), Some("b"));
    }

    #[test]
    fn writes_go_to_operand() {
        let reference = ReferenceBindValue::new("calc");
        let target = VariableBindValue::new(json!(0));
        reference.retarget(Some("x"), Ok(target.clone()));
        reference.set_value(json!(9), &Progress::null(), false);
        assert_eq!(target.value(), json!(9));
        assert!(reference.exclude_from_storage());
    }
}
