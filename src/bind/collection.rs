//! A named group of bindings exposed as one object-valued binding

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde_json::{Map, Value};

use super::{Bind, BindValue, Disconnectable};
use crate::converter::DataConverter;
use crate::events::{EventKind, Listener};
use crate::progress::Progress;
use crate::status::Status;
use crate::value::ValueType;

/// Object-valued binding over `name -> binding` members. Listeners are forwarded
/// to every member; reading produces `{name: value}`.
pub struct CollectionBindValue {
    name: RefCell<String>,
    members: Vec<(String, Bind)>,
    converter: Rc<DataConverter>,
    status: RefCell<Option<Status>>,
}

impl CollectionBindValue {
    pub fn new(members: Vec<(String, Bind)>, converter: Rc<DataConverter>) -> Rc<Self> {
        Rc::new(Self {
            name: RefCell::new(String::new()),
            members,
            converter,
            status: RefCell::new(None),
        })
    }

    pub fn members(&self) -> &[(String, Bind)] {
        &self.members
    }

    fn collect(&self, read: impl Fn(&Bind) -> Value) -> Value {
        let values: Map<String, Value> = self
            .members
            .iter()
            .map(|(name, bind)| (name.clone(), read(bind)))
            .collect();
        Value::Object(values)
    }

    /// Members that have an entry in `value`, with the entry converted to the member's type.
    fn each_entry(&self, value: &Value, mut apply: impl FnMut(&Bind, Value)) {
        let Some(fields) = value.as_object() else {
            return;
        };
        for (name, bind) in &self.members {
            if let Some(field) = fields.get(name) {
                let converted = self
                    .converter
                    .convert(field, None, bind.value_type().as_ref(), None);
                apply(bind, converted);
            }
        }
    }
}

impl BindValue for CollectionBindValue {
    fn name(&self) -> String {
        self.name.borrow().clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_string();
    }

    fn value(&self) -> Value {
        self.collect(|bind| bind.value())
    }

    fn set_value(&self, value: Value, progress: &Progress, force: bool) {
        self.each_entry(&value, |bind, v| bind.set_value(v, progress, force));
    }

    fn update_value(&self, value: Value, progress: &Progress, skip_streaming: bool) {
        self.each_entry(&value, |bind, v| bind.update_value(v, progress, skip_streaming));
    }

    fn value_type(&self) -> Option<ValueType> {
        Some(ValueType::Object)
    }

    fn is_read_only(&self) -> bool {
        self.members.iter().any(|(_, bind)| bind.is_read_only())
    }

    fn is_stale(&self) -> bool {
        self.members.iter().any(|(_, bind)| bind.is_stale())
    }

    fn status(&self) -> Option<Status> {
        self.status
            .borrow()
            .clone()
            .or_else(|| self.members.iter().find_map(|(_, bind)| bind.status()))
    }

    fn set_status(&self, status: Option<Status>) {
        *self.status.borrow_mut() = status;
    }

    fn set_deferred_mode(&self, deferred: bool, progress: &Progress, force: bool) {
        for (_, bind) in &self.members {
            bind.set_deferred_mode(deferred, progress, force);
        }
    }

    fn is_deferred_mode(&self) -> bool {
        self.members.iter().any(|(_, bind)| bind.is_deferred_mode())
    }

    fn committed_value(&self) -> Value {
        self.collect(|bind| bind.committed_value())
    }

    fn clear_deferred_write(&self) {
        for (_, bind) in &self.members {
            bind.clear_deferred_write();
        }
    }

    fn is_deferred_write_pending(&self) -> bool {
        self.members
            .iter()
            .any(|(_, bind)| bind.is_deferred_write_pending())
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) {
        for (_, bind) in &self.members {
            bind.add_listener(kind, Rc::clone(&listener));
        }
    }

    fn remove_listener(&self, kind: EventKind, listener: &Listener) {
        for (_, bind) in &self.members {
            bind.remove_listener(kind, listener);
        }
    }

    fn as_disconnectable(&self) -> Option<&dyn Disconnectable> {
        Some(self)
    }
}

impl Disconnectable for CollectionBindValue {
    fn on_disconnected(&self) {
        for (_, bind) in &self.members {
            if let Some(member) = bind.as_disconnectable() {
                member.on_disconnected();
            }
        }
    }
}

impl fmt::Debug for CollectionBindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.members.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("CollectionBindValue")
            .field("members", &names)
            .finish()
    }
}
