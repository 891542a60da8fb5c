//! Array `[]`, function `()` and field `.` lookups
//!
//! A lookup node owns the lookup binding (a fresh, uncached instance of the
//! model binding) and its index bindings. Whenever an index changes the node
//! pushes the index values, followed by any values from an enclosing lookup,
//! into the lookup binding with `set_index`. While an index is stale the push
//! waits for the index to settle.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::Value;

use super::{BindResolver, ExpressionParser};
use crate::bind::{
    Bind, BindValue, ConstantBindValue, Disconnectable, LookupKind, Lookupable, Refreshable,
    StreamingSink,
};
use crate::error::{BindError, Result};
use crate::events::{listener, EventKind, Listener};
use crate::progress::Progress;
use crate::status::Status;
use crate::value::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOp {
    Array,
    Function,
    Dot,
}

impl LookupOp {
    pub fn token(&self) -> &'static str {
        match self {
            LookupOp::Array => "[]",
            LookupOp::Function => "()",
            LookupOp::Dot => ".",
        }
    }

    fn braces(&self) -> (&'static str, &'static str) {
        match self {
            LookupOp::Array => ("[", "]"),
            LookupOp::Function => ("(", ")"),
            LookupOp::Dot => (".", "."),
        }
    }

    fn kind(&self) -> LookupKind {
        match self {
            LookupOp::Array => LookupKind::Array,
            LookupOp::Function => LookupKind::Function,
            LookupOp::Dot => LookupKind::Object,
        }
    }
}

/// Fail unless `bind` supports index lookups.
pub fn test_lookup_binding(bind: &Bind, op: LookupOp, text: &str) -> Result<()> {
    if bind.as_lookup().is_none() {
        return Err(BindError::NotLookupType {
            name: text.to_string(),
            kind: op.kind().article(),
            operator: op.token().to_string(),
        });
    }
    Ok(())
}

/// Parse a trailing `[...]` or `(...)`, or hand over to the dot operator when
/// the last lookup is followed by `.field`.
pub(super) fn parse(
    parser: &ExpressionParser,
    uri: &str,
    precedence: usize,
    resolver: &dyn BindResolver,
) -> Result<Option<Bind>> {
    let square = parser.find_last_index_of(uri, "]", true);
    let round = parser.find_last_index_of(uri, ")", true);
    let (op, end) = match (square, round) {
        (Some(s), Some(r)) if r > s => (LookupOp::Function, r),
        (Some(s), _) => (LookupOp::Array, s),
        (None, Some(r)) => (LookupOp::Function, r),
        (None, None) => return Ok(None),
    };
    let (opening, closing) = op.braces();

    if end + 1 == uri.len() {
        let Some(pos) = parser.find_last_index_of(uri, opening, false) else {
            return Err(BindError::syntax(format!(
                "I found a '{closing}' operator, but I couldn't find the matching '{opening}' operator.  \
                 To be honest I was expecting one in the following text: {}",
                &uri[..=end]
            )));
        };
        if pos == 0 {
            let inner = &uri[1..end];
            return match op {
                LookupOp::Array => parse_array_literal(parser, inner).map(Some),
                _ => parser.parse(inner, Some(0), false, resolver),
            };
        }
        if pos + 1 == end {
            return Err(BindError::syntax(format!(
                "I found an empty operator '{}'.  To be honest, I was expecting to find something inside.",
                op.token()
            )));
        }

        let mut array_text = &uri[..pos];
        let index_text = &uri[pos + 1..end];
        let mut precedence = precedence;
        while array_text.len() >= 2 && array_text.starts_with('(') && array_text.ends_with(')') {
            precedence = 0;
            array_text = &array_text[1..array_text.len() - 1];
        }

        let Some(lookup) = parser.parse(array_text, Some(precedence), true, resolver)? else {
            return Err(BindError::syntax(format!(
                "Array binding '{array_text}[] does not exist."
            )));
        };
        test_lookup_binding(&lookup, op, array_text)?;

        let mut indices = Vec::new();
        for parameter in parser.split_parameters(index_text) {
            if parameter.is_empty() {
                return Err(BindError::syntax(format!(
                    "Empty array index or function parameter.  To be honest, I was expecting one or more \
                     parameters separated by commas, but found that one of the parameters was empty in: {index_text}"
                )));
            }
            let Some(index) = parser.parse(parameter, Some(0), false, resolver)? else {
                return Err(BindError::syntax(format!(
                    "Index binding \"{parameter}\" does not exist"
                )));
            };
            indices.push(index);
        }
        return Ok(Some(LookupOperator::new(op, lookup, indices)));
    }

    if uri[end + 1..].starts_with('.') && end + 2 < uri.len() {
        return parse_dot(parser, uri, precedence, resolver);
    }
    Err(BindError::syntax(format!(
        "I found an operator '{}' with unexpected characters following it.  To be honest, I was not \
         expecting to find another operator after the last '{closing}' in the following text: {}",
        op.token(),
        &uri[end + 1..]
    )))
}

/// `[1, 'a', true]`: elements must be literals.
fn parse_array_literal(parser: &ExpressionParser, inner: &str) -> Result<Bind> {
    let mut items = Vec::new();
    if !inner.is_empty() {
        for element in parser.split_parameters(inner) {
            match super::literal::parse_literal(element)? {
                Some(item) => items.push(item),
                None => {
                    return Err(BindError::syntax(format!(
                        "Array literal elements must be literals, found: {element}"
                    )))
                }
            }
        }
    }
    Ok(ConstantBindValue::with_type(Value::Array(items), Some(ValueType::Array)))
}

/// `expr].field` or `expr).field`, with optional qualifiers on the field.
fn parse_dot(
    parser: &ExpressionParser,
    uri: &str,
    precedence: usize,
    resolver: &dyn BindResolver,
) -> Result<Option<Bind>> {
    let Some(pos) = parser
        .find_last_index_of(uri, "].", true)
        .or_else(|| parser.find_last_index_of(uri, ").", true))
        .filter(|pos| *pos > 0 && *pos + 1 < uri.len())
    else {
        return Ok(None);
    };
    let dot = pos + 1;
    let left_text = &uri[..dot];
    let Some(left) = parser.parse(left_text, Some(precedence), true, resolver)? else {
        return Ok(None);
    };
    test_lookup_binding(&left, LookupOp::Dot, left_text)?;
    let field = &uri[dot + 1..];
    if field.is_empty() || field.contains(|c: char| !super::is_identifier_char(c)) {
        return Err(BindError::UnrecognizedIdentifier {
            text: format!("{field} in dot operator field name"),
        });
    }
    parse_field_qualifiers(parser, left, field).map(Some)
}

fn parse_field_qualifiers(parser: &ExpressionParser, left: Bind, field: &str) -> Result<Bind> {
    let found = parser.qualifiers().get_field_qualifier(&format!(".{field}"));
    if let Some(qualifier) = found.qualifier {
        let rest = found.bind_name.get(1..).unwrap_or_default();
        let inner = parse_field_qualifiers(parser, left, rest)?;
        return qualifier(inner, found.param);
    }
    if field.is_empty() {
        return Ok(left);
    }
    let name: Bind = ConstantBindValue::new(Value::String(field.to_string()));
    Ok(LookupOperator::new(LookupOp::Dot, left, vec![name]))
}

pub struct LookupOperator {
    op: LookupOp,
    lookup: Bind,
    indices: Vec<Bind>,
    name: RefCell<String>,
    /// Values from an enclosing lookup, replayed once a stale index settles
    pending_args: RefCell<Vec<Value>>,
    /// Index binding we are waiting on and the one-shot listener registered on it
    stale_wait: RefCell<Option<(Bind, Listener)>>,
    index_listener: Listener,
    self_ref: Weak<Self>,
}

impl LookupOperator {
    pub fn new(op: LookupOp, lookup: Bind, indices: Vec<Bind>) -> Rc<Self> {
        let node = Rc::new_cyclic(|self_ref: &Weak<Self>| {
            let weak = self_ref.clone();
            Self {
                op,
                lookup,
                indices,
                name: RefCell::new(String::new()),
                pending_args: RefCell::new(Vec::new()),
                stale_wait: RefCell::new(None),
                index_listener: listener(move |_| {
                    if let Some(node) = weak.upgrade() {
                        node.set_index(&[]);
                    }
                }),
                self_ref: self_ref.clone(),
            }
        });
        for index in &node.indices {
            index.add_listener(EventKind::ValueChanged, Rc::clone(&node.index_listener));
        }
        node
    }

    pub fn op(&self) -> LookupOp {
        self.op
    }

    pub fn lookup(&self) -> &Bind {
        &self.lookup
    }

    fn wait_for(&self, index: &Bind) {
        if self.stale_wait.borrow().is_some() {
            return;
        }
        let weak = self.self_ref.clone();
        let once = listener(move |_| {
            let Some(node) = weak.upgrade() else {
                return;
            };
            if let Some((index, me)) = node.stale_wait.borrow_mut().take() {
                index.remove_listener(EventKind::StaleChanged, &me);
            }
            let args = node.pending_args.borrow().clone();
            node.set_index(&args);
        });
        index.add_listener(EventKind::StaleChanged, Rc::clone(&once));
        *self.stale_wait.borrow_mut() = Some((Rc::clone(index), once));
    }
}

impl Lookupable for LookupOperator {
    fn set_index(&self, args: &[Value]) {
        let mut values = Vec::with_capacity(self.indices.len() + args.len());
        for index in &self.indices {
            if index.is_stale() {
                self.wait_for(index);
                *self.pending_args.borrow_mut() = args.to_vec();
                return;
            }
            values.push(index.value());
        }
        values.extend_from_slice(args);
        if let Some(lookup) = self.lookup.as_lookup() {
            lookup.set_index(&values);
        }
    }

    fn index(&self) -> Vec<Value> {
        self.lookup
            .as_lookup()
            .map(|lookup| lookup.index())
            .unwrap_or_default()
    }

    fn lookup_kind(&self) -> LookupKind {
        self.lookup
            .as_lookup()
            .map_or(self.op.kind(), |lookup| lookup.lookup_kind())
    }
}

impl BindValue for LookupOperator {
    fn name(&self) -> String {
        self.name.borrow().clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_string();
    }

    fn value(&self) -> Value {
        self.lookup.value()
    }

    fn set_value(&self, value: Value, progress: &Progress, force: bool) {
        self.lookup.set_value(value, progress, force);
    }

    fn update_value(&self, value: Value, progress: &Progress, skip_streaming: bool) {
        self.lookup.update_value(value, progress, skip_streaming);
    }

    fn value_type(&self) -> Option<ValueType> {
        self.lookup.value_type()
    }

    fn is_read_only(&self) -> bool {
        self.lookup.is_read_only()
    }

    fn is_stale(&self) -> bool {
        self.lookup.is_stale() || self.indices.iter().any(|index| index.is_stale())
    }

    fn status(&self) -> Option<Status> {
        self.lookup
            .status()
            .or_else(|| self.indices.iter().find_map(|index| index.status()))
    }

    fn set_status(&self, status: Option<Status>) {
        self.lookup.set_status(status);
    }

    fn set_deferred_mode(&self, deferred: bool, progress: &Progress, force: bool) {
        self.lookup.set_deferred_mode(deferred, progress, force);
    }

    fn is_deferred_mode(&self) -> bool {
        self.lookup.is_deferred_mode()
    }

    fn committed_value(&self) -> Value {
        self.lookup.committed_value()
    }

    fn clear_deferred_write(&self) {
        self.lookup.clear_deferred_write();
    }

    fn is_deferred_write_pending(&self) -> bool {
        self.lookup.is_deferred_write_pending()
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) {
        self.lookup.add_listener(kind, listener);
    }

    fn remove_listener(&self, kind: EventKind, listener: &Listener) {
        self.lookup.remove_listener(kind, listener);
    }

    fn as_lookup(&self) -> Option<&dyn Lookupable> {
        Some(self)
    }

    fn as_refreshable(&self) -> Option<&dyn Refreshable> {
        self.lookup.as_refreshable()
    }

    fn as_streaming_sink(&self) -> Option<&dyn StreamingSink> {
        self.lookup.as_streaming_sink()
    }

    fn as_disconnectable(&self) -> Option<&dyn Disconnectable> {
        self.lookup.as_disconnectable()
    }

    fn exclude_from_storage(&self) -> bool {
        true
    }

    fn dispose(&self) {
        if let Some((index, once)) = self.stale_wait.borrow_mut().take() {
            index.remove_listener(EventKind::StaleChanged, &once);
        }
        self.lookup.dispose();
        for index in &self.indices {
            index.remove_listener(EventKind::ValueChanged, &self.index_listener);
            index.dispose();
        }
    }
}

impl fmt::Debug for LookupOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupOperator")
            .field("op", &self.op.token())
            .field("lookup", &self.lookup.name())
            .field("indices", &self.indices.len())
            .finish()
    }
}
