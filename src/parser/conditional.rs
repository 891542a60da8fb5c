//! Conditional `cond ? a : b`

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::Value;

use super::{BindResolver, ExpressionParser};
use crate::bind::{Bind, BindValue, Disconnectable, Lookupable, Refreshable, StreamingSink};
use crate::error::{BindError, Result};
use crate::events::{listener, EventKind, Listener};
use crate::progress::Progress;
use crate::status::Status;
use crate::value::{self, ValueType};

pub(super) fn parse(
    parser: &ExpressionParser,
    uri: &str,
    precedence: usize,
    resolver: &dyn BindResolver,
) -> Result<Option<Bind>> {
    let Some(pos) = parser.find_first_index_of(uri, "?", 0) else {
        return Ok(None);
    };
    if pos == 0 {
        return Err(BindError::syntax(format!(
            "I found a '?' operator but nothing in front of it.  To be honest, I was expecting to find \
             something before the '?' in the following text: {uri}"
        )));
    }
    let remaining = &uri[pos + 1..];
    let Some(colon) = parser.find_matching_brace(remaining, "?", ":") else {
        return Err(BindError::syntax(format!(
            "I found a '?' operator, but I couldn't find the matching ':' operator.  To be honest I was \
             expecting one in the following text: {remaining}"
        )));
    };
    if colon == 0 {
        return Err(BindError::syntax(
            "I found a ':' imediately following a '?' operator.  To be honest, I was expecting to find \
             something between them.",
        ));
    }
    if colon + 1 >= remaining.len() {
        return Err(BindError::syntax(format!(
            "I found a '?' operator a with matching ':', but nothing after the ':' operator.  To be honest, \
             I was expecting to find something after the ':' in the following text: {remaining}"
        )));
    }

    let condition = parser.parse(&uri[..pos], Some(precedence), false, resolver)?;
    let when_true = parser.parse(&remaining[..colon], Some(precedence), false, resolver)?;
    let when_false = parser.parse(&remaining[colon + 1..], Some(precedence), false, resolver)?;
    match (condition, when_true, when_false) {
        (Some(condition), Some(when_true), Some(when_false)) => {
            Ok(Some(ConditionalOperator::new(condition, when_true, when_false)))
        }
        _ => Err(BindError::MissingOperands {
            operator: "conditional (?:)".to_string(),
        }),
    }
}

/// Selects one of two branches by the truthiness of the condition. Reads,
/// writes and capabilities all go through the selected branch.
pub struct ConditionalOperator {
    condition: Bind,
    when_true: Bind,
    when_false: Bind,
    name: RefCell<String>,
    /// Streaming listeners and the branch each is currently attached to
    streaming: RefCell<Vec<(Listener, Bind)>>,
    branch_watcher: Listener,
}

impl ConditionalOperator {
    pub fn new(condition: Bind, when_true: Bind, when_false: Bind) -> Rc<Self> {
        Rc::new_cyclic(|self_ref: &Weak<Self>| {
            let weak = self_ref.clone();
            Self {
                condition,
                when_true,
                when_false,
                name: RefCell::new(String::new()),
                streaming: RefCell::new(Vec::new()),
                branch_watcher: listener(move |_| {
                    if let Some(node) = weak.upgrade() {
                        node.reattach_streaming();
                    }
                }),
            }
        })
    }

    fn branch(&self) -> &Bind {
        if value::is_truthy(&self.condition.value()) {
            &self.when_true
        } else {
            &self.when_false
        }
    }

    fn operands(&self) -> [&Bind; 3] {
        [&self.condition, &self.when_true, &self.when_false]
    }

    /// Move streaming listeners onto the branch the condition now selects.
    fn reattach_streaming(&self) {
        let branch = Rc::clone(self.branch());
        let mut streaming = self.streaming.borrow_mut();
        for (listener, attached) in streaming.iter_mut() {
            if Rc::ptr_eq(attached, &branch) {
                continue;
            }
            attached.remove_listener(EventKind::StreamingData, listener);
            branch.add_listener(EventKind::StreamingData, Rc::clone(listener));
            *attached = Rc::clone(&branch);
        }
    }
}

impl BindValue for ConditionalOperator {
    fn name(&self) -> String {
        self.name.borrow().clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_string();
    }

    fn value(&self) -> Value {
        self.branch().value()
    }

    fn set_value(&self, value: Value, progress: &Progress, force: bool) {
        self.branch().set_value(value, progress, force);
    }

    fn update_value(&self, _value: Value, _progress: &Progress, _skip_streaming: bool) {}

    fn value_type(&self) -> Option<ValueType> {
        self.branch().value_type()
    }

    fn is_read_only(&self) -> bool {
        self.branch().is_read_only()
    }

    fn is_stale(&self) -> bool {
        self.condition.is_stale() || self.branch().is_stale()
    }

    fn status(&self) -> Option<Status> {
        self.condition.status().or_else(|| self.branch().status())
    }

    fn set_status(&self, status: Option<Status>) {
        self.branch().set_status(status);
    }

    fn set_deferred_mode(&self, deferred: bool, progress: &Progress, force: bool) {
        self.branch().set_deferred_mode(deferred, progress, force);
    }

    fn is_deferred_mode(&self) -> bool {
        self.branch().is_deferred_mode()
    }

    fn committed_value(&self) -> Value {
        self.branch().committed_value()
    }

    fn clear_deferred_write(&self) {
        self.branch().clear_deferred_write();
    }

    fn is_deferred_write_pending(&self) -> bool {
        self.branch().is_deferred_write_pending()
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) {
        if kind == EventKind::StreamingData {
            let branch = Rc::clone(self.branch());
            let first = {
                let mut streaming = self.streaming.borrow_mut();
                streaming.push((Rc::clone(&listener), Rc::clone(&branch)));
                streaming.len() == 1
            };
            branch.add_listener(kind, listener);
            if first {
                self.condition
                    .add_listener(EventKind::ValueChanged, Rc::clone(&self.branch_watcher));
            }
            return;
        }
        for operand in self.operands() {
            operand.add_listener(kind, Rc::clone(&listener));
        }
    }

    fn remove_listener(&self, kind: EventKind, listener: &Listener) {
        if kind == EventKind::StreamingData {
            let (removed, empty) = {
                let mut streaming = self.streaming.borrow_mut();
                let removed = streaming
                    .iter()
                    .position(|(l, _)| crate::events::same_listener(l, listener))
                    .map(|i| streaming.remove(i));
                (removed, streaming.is_empty())
            };
            if let Some((listener, attached)) = removed {
                attached.remove_listener(kind, &listener);
                if empty {
                    self.condition
                        .remove_listener(EventKind::ValueChanged, &self.branch_watcher);
                }
            }
            return;
        }
        for operand in self.operands() {
            operand.remove_listener(kind, listener);
        }
    }

    fn as_lookup(&self) -> Option<&dyn Lookupable> {
        self.branch().as_lookup()
    }

    fn as_refreshable(&self) -> Option<&dyn Refreshable> {
        self.branch().as_refreshable()
    }

    fn as_streaming_sink(&self) -> Option<&dyn StreamingSink> {
        self.branch().as_streaming_sink()
    }

    fn as_disconnectable(&self) -> Option<&dyn Disconnectable> {
        self.branch().as_disconnectable()
    }

    fn exclude_from_storage(&self) -> bool {
        true
    }

    fn dispose(&self) {
        for (listener, attached) in self.streaming.borrow_mut().drain(..) {
            attached.remove_listener(EventKind::StreamingData, &listener);
        }
        self.condition
            .remove_listener(EventKind::ValueChanged, &self.branch_watcher);
        for operand in self.operands() {
            operand.dispose();
        }
    }
}

impl fmt::Debug for ConditionalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalOperator")
            .field("condition", &self.condition.name())
            .field("when_true", &self.when_true.name())
            .field("when_false", &self.when_false.name())
            .finish()
    }
}
