//! Infix operators and their precedence levels

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use super::unary::to_int32;
use super::{is_identifier_char, BindResolver, ExpressionParser};
use crate::bind::{Bind, BindValue, StatusSlot};
use crate::converter::DataConverter;
use crate::error::{BindError, Result};
use crate::events::{EventKind, Listener};
use crate::progress::Progress;
use crate::status::Status;
use crate::value::{self, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Binary operators grouped by precedence, lowest first. Level `n` of the
/// parser is `LEVELS[n - 1]`; level 0 is the conditional operator.
pub const LEVELS: [&[BinaryOp]; 10] = [
    &[BinaryOp::Or],
    &[BinaryOp::And],
    &[BinaryOp::BitOr],
    &[BinaryOp::BitXor],
    &[BinaryOp::BitAnd],
    &[BinaryOp::Eq, BinaryOp::Ne],
    &[BinaryOp::Lt, BinaryOp::Gt, BinaryOp::Le, BinaryOp::Ge],
    &[BinaryOp::Shl, BinaryOp::Shr],
    &[BinaryOp::Add, BinaryOp::Sub],
    &[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Rem],
];

const ALL: [BinaryOp; 18] = [
    BinaryOp::Or,
    BinaryOp::And,
    BinaryOp::BitOr,
    BinaryOp::BitXor,
    BinaryOp::BitAnd,
    BinaryOp::Eq,
    BinaryOp::Ne,
    BinaryOp::Lt,
    BinaryOp::Gt,
    BinaryOp::Le,
    BinaryOp::Ge,
    BinaryOp::Shl,
    BinaryOp::Shr,
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::Div,
    BinaryOp::Rem,
];

/// Characters after which `+`/`-` is a sign rather than an operator.
const SIGN_CONTEXT: &str = "+-*/%&|^!~<>=?:,([";

type Eval = std::result::Result<Value, String>;

impl BinaryOp {
    pub fn token(&self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitAnd => "&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }

    fn unsupported(&self, kind: &str) -> String {
        format!("Operator '{}' does not support {kind} types", self.token())
    }

    fn supports_boolean(&self) -> bool {
        matches!(
            self,
            BinaryOp::Or
                | BinaryOp::And
                | BinaryOp::BitOr
                | BinaryOp::BitXor
                | BinaryOp::BitAnd
                | BinaryOp::Eq
                | BinaryOp::Ne
        )
    }

    fn supports_string(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Gt
                | BinaryOp::Le
                | BinaryOp::Ge
        )
    }

    fn supports_array(&self) -> bool {
        !matches!(self, BinaryOp::Or | BinaryOp::And)
    }

    fn eval_boolean(&self, l: bool, r: bool) -> Eval {
        let result = match self {
            BinaryOp::Or => l || r,
            BinaryOp::And => l && r,
            BinaryOp::BitOr => l | r,
            BinaryOp::BitXor => l ^ r,
            BinaryOp::BitAnd => l & r,
            BinaryOp::Eq => l == r,
            BinaryOp::Ne => l != r,
            _ => return Err(self.unsupported("boolean")),
        };
        Ok(Value::Bool(result))
    }

    fn eval_number(&self, l: f64, r: f64) -> Eval {
        match self {
            BinaryOp::Or => Ok(Value::Bool(l != 0.0 || r != 0.0)),
            BinaryOp::And => Ok(Value::Bool(l != 0.0 && r != 0.0)),
            BinaryOp::BitOr => Ok(Value::from(to_int32(l) | to_int32(r))),
            BinaryOp::BitXor => Ok(Value::from(to_int32(l) ^ to_int32(r))),
            BinaryOp::BitAnd => Ok(Value::from(to_int32(l) & to_int32(r))),
            BinaryOp::Shl => Ok(Value::from(to_int32(l).wrapping_shl(to_int32(r) as u32 & 31))),
            BinaryOp::Shr => Ok(Value::from(to_int32(l).wrapping_shr(to_int32(r) as u32 & 31))),
            BinaryOp::Eq => Ok(Value::Bool(l == r)),
            BinaryOp::Ne => Ok(Value::Bool(l != r)),
            BinaryOp::Lt => Ok(Value::Bool(l < r)),
            BinaryOp::Gt => Ok(Value::Bool(l > r)),
            BinaryOp::Le => Ok(Value::Bool(l <= r)),
            BinaryOp::Ge => Ok(Value::Bool(l >= r)),
            BinaryOp::Add => Ok(value::number(l + r)),
            BinaryOp::Sub => Ok(value::number(l - r)),
            BinaryOp::Mul => Ok(value::number(l * r)),
            BinaryOp::Div => Ok(value::number(l / r)),
            BinaryOp::Rem => Ok(value::number(l % r)),
        }
    }

    fn eval_string(&self, l: &str, r: &str) -> Eval {
        let ordering = l.cmp(r);
        let result = match self {
            BinaryOp::Add => return Ok(Value::String(format!("{l}{r}"))),
            BinaryOp::Eq => ordering == Ordering::Equal,
            BinaryOp::Ne => ordering != Ordering::Equal,
            BinaryOp::Lt => ordering == Ordering::Less,
            BinaryOp::Gt => ordering == Ordering::Greater,
            BinaryOp::Le => ordering != Ordering::Greater,
            BinaryOp::Ge => ordering != Ordering::Less,
            _ => return Err(self.unsupported("string")),
        };
        Ok(Value::Bool(result))
    }

    /// Element-wise, with a single element broadcast against the other side.
    /// Equality compares whole arrays.
    fn eval_array(&self, l: &[Value], r: &[Value]) -> Eval {
        match self {
            BinaryOp::Eq => return Ok(Value::Bool(arrays_equal(l, r))),
            BinaryOp::Ne => return Ok(Value::Bool(!arrays_equal(l, r))),
            _ if !self.supports_array() => return Err(self.unsupported("array")),
            _ => {}
        }
        let len = match (l.len(), r.len()) {
            (1, n) | (n, 1) => n,
            (a, b) => a.min(b),
        };
        let pick = |side: &[Value], i: usize| {
            if side.len() == 1 {
                side[0].clone()
            } else {
                side[i].clone()
            }
        };
        (0..len)
            .map(|i| self.eval_values(&pick(l, i), &pick(r, i)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array)
    }

    fn eval_object(&self, l: &Value, r: &Value) -> Eval {
        match self {
            BinaryOp::Eq => Ok(Value::Bool(l == r)),
            BinaryOp::Ne => Ok(Value::Bool(l != r)),
            _ => Err(self.unsupported("object")),
        }
    }

    /// Type dispatch on plain values, used for array elements.
    fn eval_values(&self, l: &Value, r: &Value) -> Eval {
        self.eval(l, r, ValueType::of(l), ValueType::of(r))
    }

    /// Dispatch on the operand types: booleans, arrays, strings, numbers, mixed
    /// number/boolean, then a string fallback and finally objects.
    fn eval(&self, l: &Value, r: &Value, lt: Option<ValueType>, rt: Option<ValueType>) -> Eval {
        use ValueType::{Array, Boolean, Number, Object};
        if l.is_null() || r.is_null() {
            return Ok(Value::Null);
        }
        let as_array = |v: &Value| match v {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        let text = value::to_display_string;
        match (&lt, &rt) {
            (Some(Boolean), Some(Boolean)) => {
                if self.supports_boolean() {
                    self.eval_boolean(value::is_truthy(l), value::is_truthy(r))
                } else {
                    Err(self.unsupported("boolean"))
                }
            }
            (Some(Array), _) | (_, Some(Array)) => self.eval_array(&as_array(l), &as_array(r)),
            (Some(ValueType::String), _) | (_, Some(ValueType::String)) => {
                if self.supports_string() {
                    self.eval_string(&text(l), &text(r))
                } else {
                    Err(self.unsupported("string"))
                }
            }
            (Some(Number), Some(Number)) => self.eval_number(value::to_number(l), value::to_number(r)),
            (Some(Number), Some(Boolean)) | (Some(Boolean), Some(Number)) => {
                self.eval_number(value::to_number(l), value::to_number(r))
            }
            _ if self.supports_string() => self.eval_string(&text(l), &text(r)),
            (Some(Object), Some(Object)) => self.eval_object(l, r),
            _ => {
                let mut kind = "object";
                if !self.supports_boolean() && (lt == Some(Boolean) || rt == Some(Boolean)) {
                    kind = "boolean";
                }
                Err(self.unsupported(kind))
            }
        }
    }

    /// Value the writable operand needs so the expression reads `target`.
    fn inverse(&self, target: f64, other: f64, writing_left: bool) -> Eval {
        let n = match (self, writing_left) {
            (BinaryOp::Add, _) => target - other,
            (BinaryOp::Sub, true) => target + other,
            (BinaryOp::Sub, false) => other - target,
            (BinaryOp::Mul, _) => target / other,
            (BinaryOp::Div, true) => target * other,
            (BinaryOp::Div, false) => other / target,
            _ => {
                return Err(format!(
                    "Operator '{}' does not support setting values",
                    self.token()
                ))
            }
        };
        Ok(value::number(n))
    }
}

fn arrays_equal(l: &[Value], r: &[Value]) -> bool {
    l.len() == r.len() && l.iter().zip(r).all(|(a, b)| value::loose_eq(a, b))
}

/// `1e-5`: the sign belongs to a numeric literal's exponent.
fn is_exponent_sign(text: &str, pos: usize) -> bool {
    let before = &text[..pos];
    if !before.ends_with(|c: char| c == 'e' || c == 'E') {
        return false;
    }
    let start = before
        .char_indices()
        .rev()
        .find(|(_, c)| !is_identifier_char(*c))
        .map_or(0, |(i, c)| i + c.len_utf8());
    let literal = &before[start..];
    literal.starts_with(|c: char| c.is_ascii_digit())
        && !literal.starts_with("0x")
        && !literal.starts_with("0X")
}

/// Reject `op` at `pos` when it is part of a longer operator token or is a sign.
fn accepts(text: &str, pos: usize, op: BinaryOp) -> bool {
    let token = op.token();
    let overlaps_longer = ALL.iter().any(|other| {
        let long = other.token();
        long.len() > token.len()
            && long.match_indices(token).any(|(offset, _)| {
                pos >= offset
                    && text
                        .get(pos - offset..)
                        .is_some_and(|rest| rest.starts_with(long))
            })
    });
    if overlaps_longer {
        return false;
    }
    if matches!(op, BinaryOp::Add | BinaryOp::Sub) {
        let prev = text[..pos].chars().next_back();
        if prev.is_some_and(|c| SIGN_CONTEXT.contains(c)) || is_exponent_sign(text, pos) {
            return false;
        }
    }
    true
}

/// Rightmost unbracketed position of `op` that is a real binary operator.
fn find_operator(parser: &ExpressionParser, text: &str, op: BinaryOp) -> Option<usize> {
    let token = op.token();
    let mut limit = text.len();
    loop {
        let pos = parser.find_last_index_of(&text[..limit], token, false)?;
        if pos == 0 {
            return None;
        }
        if accepts(text, pos, op) {
            return Some(pos);
        }
        limit = pos + token.len() - 1;
    }
}

/// Split `uri` around the rightmost operator of this level. The left side
/// keeps the level, the right side starts one level higher.
pub(super) fn parse(
    parser: &ExpressionParser,
    uri: &str,
    precedence: usize,
    resolver: &dyn BindResolver,
) -> Result<Option<Bind>> {
    let Some(ops) = precedence.checked_sub(1).and_then(|i| LEVELS.get(i)) else {
        return Ok(None);
    };
    let found = ops
        .iter()
        .filter_map(|op| find_operator(parser, uri, *op).map(|pos| (pos, *op)))
        .max_by(|(a_pos, a_op), (b_pos, b_op)| {
            a_pos
                .cmp(b_pos)
                .then(a_op.token().len().cmp(&b_op.token().len()))
        });
    let Some((pos, op)) = found else {
        return Ok(None);
    };
    if pos + 1 >= uri.len() {
        return Ok(None);
    }
    let left = parser.parse(&uri[..pos], Some(precedence), false, resolver)?;
    let right = parser.parse(&uri[pos + op.token().len()..], Some(precedence + 1), false, resolver)?;
    match (left, right) {
        (Some(left), Some(right)) => Ok(Some(BinaryOperator::new(
            op,
            left,
            right,
            Rc::clone(parser.converter()),
        ))),
        _ => Err(BindError::MissingOperands {
            operator: op.token().to_string(),
        }),
    }
}

pub struct BinaryOperator {
    op: BinaryOp,
    left: Bind,
    right: Bind,
    converter: Rc<DataConverter>,
    name: RefCell<String>,
    status: StatusSlot,
}

impl BinaryOperator {
    pub fn new(op: BinaryOp, left: Bind, right: Bind, converter: Rc<DataConverter>) -> Rc<Self> {
        Rc::new(Self {
            op,
            left,
            right,
            converter,
            name: RefCell::new(String::new()),
            status: StatusSlot::default(),
        })
    }

    pub fn op(&self) -> BinaryOp {
        self.op
    }

    fn evaluate(&self, l: Value, r: Value) -> Value {
        if l.is_null() || r.is_null() {
            return Value::Null;
        }
        let lt = self.left.value_type().or_else(|| ValueType::of(&l));
        let rt = self.right.value_type().or_else(|| ValueType::of(&r));
        match self.op.eval(&l, &r, lt, rt) {
            Ok(result) => {
                self.status.set(None);
                result
            }
            Err(message) => {
                self.status.set(Some(Status::error(message)));
                Value::Null
            }
        }
    }

    fn write(&self, value: &Value, progress: &Progress, force: bool) -> std::result::Result<(), String> {
        let target = value::to_number(value);
        let (writable, other, writing_left) = if self.left.is_read_only() {
            (&self.right, &self.left, false)
        } else {
            (&self.left, &self.right, true)
        };
        let result = self
            .op
            .inverse(target, value::to_number(&other.value()), writing_left)?;
        let converted = self
            .converter
            .convert(&result, None, writable.value_type().as_ref(), None);
        writable.set_value(converted, progress, force);
        Ok(())
    }
}

impl BindValue for BinaryOperator {
    fn name(&self) -> String {
        self.name.borrow().clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_string();
    }

    fn value(&self) -> Value {
        self.evaluate(self.left.value(), self.right.value())
    }

    /// Writes go to the one writable operand, solved for the new value.
    fn set_value(&self, value: Value, progress: &Progress, force: bool) {
        if self.is_read_only() {
            return;
        }
        if let Err(message) = self.write(&value, progress, force) {
            self.status.set(Some(Status::error(message)));
        }
    }

    fn update_value(&self, _value: Value, _progress: &Progress, _skip_streaming: bool) {}

    fn value_type(&self) -> Option<ValueType> {
        if let Some(value_type) = ValueType::of(&self.value()) {
            return Some(value_type);
        }
        let lt = self.left.value_type();
        let rt = self.right.value_type();
        if lt == rt {
            return lt;
        }
        let either = |t: ValueType| lt.as_ref() == Some(&t) || rt.as_ref() == Some(&t);
        [ValueType::Array, ValueType::String, ValueType::Number]
            .into_iter()
            .find(|t| either(t.clone()))
            .or(Some(ValueType::Object))
    }

    /// Writable only when exactly one operand is.
    fn is_read_only(&self) -> bool {
        self.left.is_read_only() == self.right.is_read_only()
    }

    fn is_stale(&self) -> bool {
        self.left.is_stale() || self.right.is_stale()
    }

    fn status(&self) -> Option<Status> {
        self.status
            .get()
            .or_else(|| self.left.status())
            .or_else(|| self.right.status())
    }

    fn set_status(&self, status: Option<Status>) {
        self.status.set(status);
    }

    fn set_deferred_mode(&self, deferred: bool, progress: &Progress, force: bool) {
        self.left.set_deferred_mode(deferred, progress, force);
        self.right.set_deferred_mode(deferred, progress, force);
    }

    fn is_deferred_mode(&self) -> bool {
        self.left.is_deferred_mode() || self.right.is_deferred_mode()
    }

    fn committed_value(&self) -> Value {
        self.evaluate(self.left.committed_value(), self.right.committed_value())
    }

    fn clear_deferred_write(&self) {
        self.left.clear_deferred_write();
        self.right.clear_deferred_write();
    }

    fn is_deferred_write_pending(&self) -> bool {
        self.left.is_deferred_write_pending() || self.right.is_deferred_write_pending()
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) {
        self.status.add_listener(kind, &listener);
        self.left.add_listener(kind, Rc::clone(&listener));
        self.right.add_listener(kind, listener);
    }

    fn remove_listener(&self, kind: EventKind, listener: &Listener) {
        self.status.remove_listener(kind, listener);
        self.left.remove_listener(kind, listener);
        self.right.remove_listener(kind, listener);
    }

    fn exclude_from_storage(&self) -> bool {
        true
    }

    fn dispose(&self) {
        self.left.dispose();
        self.right.dispose();
    }
}

impl fmt::Debug for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryOperator")
            .field("op", &self.op.token())
            .field("left", &self.left.name())
            .field("right", &self.right.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::{ConstantBindValue, VariableBindValue};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn eval(op: BinaryOp, l: Value, r: Value) -> Value {
        let node = BinaryOperator::new(
            op,
            ConstantBindValue::new(l),
            ConstantBindValue::new(r),
            Rc::new(DataConverter::new()),
        );
        node.value()
    }

    #[test]
    fn numeric_operators() {
        assert_eq!(eval(BinaryOp::Add, json!(1), json!(2)), json!(3));
        assert_eq!(eval(BinaryOp::Div, json!(7), json!(2)), json!(3.5));
        assert_eq!(eval(BinaryOp::Rem, json!(7), json!(4)), json!(3));
        assert_eq!(eval(BinaryOp::Shl, json!(1), json!(4)), json!(16));
        assert_eq!(eval(BinaryOp::Shr, json!(-16), json!(2)), json!(-4));
        assert_eq!(eval(BinaryOp::BitAnd, json!(12), json!(10)), json!(8));
        assert_eq!(eval(BinaryOp::Le, json!(2), json!(2)), json!(true));
        assert_eq!(eval(BinaryOp::And, json!(2), json!(0)), json!(false));
    }

    #[test]
    fn mixed_types() {
        assert_eq!(eval(BinaryOp::Add, json!("a"), json!(1)), json!("a1"));
        assert_eq!(eval(BinaryOp::Add, json!(1), json!(true)), json!(2));
        assert_eq!(eval(BinaryOp::Eq, json!(true), json!(true)), json!(true));
        assert_eq!(eval(BinaryOp::Add, json!([1, 2]), json!(10)), json!([11, 12]));
        assert_eq!(eval(BinaryOp::Eq, json!([1, 2]), json!([1, 2])), json!(true));
        assert_eq!(eval(BinaryOp::Eq, json!({"a": 1}), json!({"a": 1})), json!(true));
    }

    #[test]
    fn unsupported_types_report_status() {
        let node = BinaryOperator::new(
            BinaryOp::Mul,
            ConstantBindValue::new(json!("a")),
            ConstantBindValue::new(json!(2)),
            Rc::new(DataConverter::new()),
        );
        assert_eq!(node.value(), Value::Null);
        assert_eq!(
            node.status().unwrap().message,
            "Operator '*' does not support string types"
        );

        let booleans = BinaryOperator::new(
            BinaryOp::Sub,
            ConstantBindValue::new(json!(true)),
            ConstantBindValue::new(json!(false)),
            Rc::new(DataConverter::new()),
        );
        assert_eq!(booleans.value(), Value::Null);
        assert_eq!(
            booleans.status().unwrap().message,
            "Operator '-' does not support boolean types"
        );
    }

    #[test]
    fn null_operand_is_null() {
        assert_eq!(eval(BinaryOp::Add, Value::Null, json!(1)), Value::Null);
    }

    #[test]
    fn writes_solve_for_the_writable_side() {
        let var = VariableBindValue::with_type(json!(1), Some(ValueType::Number));
        let node = BinaryOperator::new(
            BinaryOp::Sub,
            ConstantBindValue::new(json!(10)),
            var.clone(),
            Rc::new(DataConverter::new()),
        );
        assert!(!node.is_read_only());
        node.set_value(json!(4), &Progress::null(), false);
        assert_eq!(var.value(), json!(6));
        assert_eq!(node.value(), json!(4));

        let both = BinaryOperator::new(
            BinaryOp::Add,
            var.clone(),
            VariableBindValue::new(json!(1)),
            Rc::new(DataConverter::new()),
        );
        assert!(both.is_read_only());
    }

    #[test]
    fn comparison_writes_are_errors() {
        let var = VariableBindValue::new(json!(1));
        let node = BinaryOperator::new(
            BinaryOp::Lt,
            var,
            ConstantBindValue::new(json!(3)),
            Rc::new(DataConverter::new()),
        );
        node.set_value(json!(true), &Progress::null(), false);
        assert!(node.status().unwrap().is_error());
    }

    #[test]
    fn operator_tokens_inside_longer_tokens_are_skipped() {
        assert!(!accepts("a<<b", 1, BinaryOp::Lt));
        assert!(!accepts("a<<b", 2, BinaryOp::Lt));
        assert!(accepts("a<<b", 1, BinaryOp::Shl));
        assert!(!accepts("a&&b", 2, BinaryOp::BitAnd));
        assert!(!accepts("a*-b", 2, BinaryOp::Sub));
        assert!(!accepts("1e-5", 2, BinaryOp::Sub));
        assert!(accepts("xe-5", 2, BinaryOp::Sub));
        assert!(accepts("0x1e-5", 4, BinaryOp::Sub));
    }
}
