//! Prefix operators `!`, `~` and `-`

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use super::{BindResolver, ExpressionParser};
use crate::bind::{Bind, BindValue, StatusSlot};
use crate::error::Result;
use crate::events::{EventKind, Listener};
use crate::progress::Progress;
use crate::status::Status;
use crate::value::{self, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    BitNot,
    Negate,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 3] = [UnaryOp::Not, UnaryOp::BitNot, UnaryOp::Negate];

    pub fn token(&self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
            UnaryOp::Negate => "-",
        }
    }

    /// Apply the operator. The operators are their own inverse, so `write`
    /// only matters where the read and write value types differ.
    fn eval(&self, value: &Value, value_type: Option<&ValueType>, write: bool) -> std::result::Result<Value, String> {
        let unsupported = |kind: &str| Err(format!("Operator '{}' does not support {kind} types", self.token()));
        match (self, value_type) {
            (UnaryOp::Not, Some(ValueType::Boolean)) => Ok(Value::Bool(!value::is_truthy(value))),
            (UnaryOp::Not, Some(ValueType::Number)) if write => {
                Ok(Value::from(u8::from(!value::is_truthy(value))))
            }
            (UnaryOp::Not, Some(ValueType::Number)) => Ok(Value::Bool(value::to_number(value) == 0.0)),
            (UnaryOp::BitNot, Some(ValueType::Number)) => {
                Ok(Value::from(!to_int32(value::to_number(value))))
            }
            (UnaryOp::Negate, Some(ValueType::Number)) => Ok(value::number(-value::to_number(value))),
            (_, Some(ValueType::Boolean)) => unsupported("boolean"),
            (_, Some(ValueType::Array)) => unsupported("array"),
            (_, Some(ValueType::String)) => unsupported("string"),
            (_, Some(ValueType::Object)) => unsupported("object"),
            (_, Some(ValueType::Custom(name))) => unsupported(name),
            (_, None) => unsupported("object"),
        }
    }
}

/// ECMAScript ToInt32.
pub(crate) fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64 & 0xFFFF_FFFF) as u32 as i32
}

/// Prefix operators only match at the very start of the text.
pub(super) fn parse(
    parser: &ExpressionParser,
    uri: &str,
    precedence: usize,
    resolver: &dyn BindResolver,
) -> Result<Option<Bind>> {
    for op in UnaryOp::ALL {
        let Some(operand_text) = uri.strip_prefix(op.token()) else {
            continue;
        };
        if let Some(operand) = parser.parse(operand_text, Some(precedence), false, resolver)? {
            return Ok(Some(UnaryOperator::new(op, operand)));
        }
    }
    Ok(None)
}

pub struct UnaryOperator {
    op: UnaryOp,
    operand: Bind,
    name: RefCell<String>,
    status: StatusSlot,
}

impl UnaryOperator {
    pub fn new(op: UnaryOp, operand: Bind) -> Rc<Self> {
        Rc::new(Self {
            op,
            operand,
            name: RefCell::new(String::new()),
            status: StatusSlot::default(),
        })
    }

    fn operand_type(&self, value: &Value) -> Option<ValueType> {
        self.operand.value_type().or_else(|| ValueType::of(value))
    }

    fn evaluate(&self, value: Value) -> Value {
        if value.is_null() {
            return value;
        }
        match self.op.eval(&value, self.operand_type(&value).as_ref(), false) {
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
}

impl BindValue for UnaryOperator {
    fn name(&self) -> String {
        self.name.borrow().clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_string();
    }

    fn value(&self) -> Value {
        self.evaluate(self.operand.value())
    }

    fn set_value(&self, value: Value, progress: &Progress, force: bool) {
        if value.is_null() {
            return;
        }
        let operand_type = self.operand_type(&self.operand.value());
        match self.op.eval(&value, operand_type.as_ref(), true) {
            Ok(result) => self.operand.set_value(result, progress, force),
            Err(message) => self.status.set(Some(Status::error(message))),
        }
    }

    /// Expressions have no target to observe.
    fn update_value(&self, _value: Value, _progress: &Progress, _skip_streaming: bool) {}

    fn value_type(&self) -> Option<ValueType> {
        match self.op {
            UnaryOp::Not => Some(ValueType::Boolean),
            _ => self.operand.value_type(),
        }
    }

    fn is_read_only(&self) -> bool {
        self.operand.is_read_only()
    }

    fn is_stale(&self) -> bool {
        self.operand.is_stale()
    }

    fn status(&self) -> Option<Status> {
        self.status.get().or_else(|| self.operand.status())
    }

    fn set_status(&self, status: Option<Status>) {
        self.status.set(status);
    }

    fn set_deferred_mode(&self, deferred: bool, progress: &Progress, force: bool) {
        self.operand.set_deferred_mode(deferred, progress, force);
    }

    fn is_deferred_mode(&self) -> bool {
        self.operand.is_deferred_mode()
    }

    fn committed_value(&self) -> Value {
        self.evaluate(self.operand.committed_value())
    }

    fn clear_deferred_write(&self) {
        self.operand.clear_deferred_write();
    }

    fn is_deferred_write_pending(&self) -> bool {
        self.operand.is_deferred_write_pending()
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) {
        self.status.add_listener(kind, &listener);
        self.operand.add_listener(kind, listener);
    }

    fn remove_listener(&self, kind: EventKind, listener: &Listener) {
        self.status.remove_listener(kind, listener);
        self.operand.remove_listener(kind, listener);
    }

    fn exclude_from_storage(&self) -> bool {
        true
    }

    fn dispose(&self) {
        self.operand.dispose();
    }
}

impl fmt::Debug for UnaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryOperator")
            .field("op", &self.op.token())
            .field("operand", &self.operand.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::VariableBindValue;
    use serde_json::json;

    #[test]
    fn negate_reads_and_writes_inverse() {
        let var = VariableBindValue::with_type(json!(5), Some(ValueType::Number));
        let neg = UnaryOperator::new(UnaryOp::Negate, var.clone());
        assert_eq!(neg.value(), json!(-5));
        neg.set_value(json!(3), &Progress::null(), false);
        assert_eq!(var.value(), json!(-3));
        // null writes are ignored
        neg.set_value(Value::Null, &Progress::null(), false);
        assert_eq!(var.value(), json!(-3));
    }

    #[test]
    fn not_and_bitwise_not() {
        let flag = VariableBindValue::new(json!(true));
        assert_eq!(UnaryOperator::new(UnaryOp::Not, flag).value(), json!(false));
        let n = VariableBindValue::new(json!(0));
        assert_eq!(UnaryOperator::new(UnaryOp::BitNot, n.clone()).value(), json!(-1));
        assert_eq!(UnaryOperator::new(UnaryOp::Not, n).value(), json!(true));
    }

    #[test]
    fn unsupported_type_sets_error_status() {
        let text = VariableBindValue::new(json!("abc"));
        let neg = UnaryOperator::new(UnaryOp::Negate, text);
        assert_eq!(neg.value(), Value::Null);
        assert_eq!(
            neg.status().unwrap().message,
            "Operator '-' does not support string types"
        );
    }

    #[test]
    fn every_operator_accepts_numbers() {
        for op in UnaryOp::ALL {
            let n = VariableBindValue::with_type(json!(2), Some(ValueType::Number));
            let unary = UnaryOperator::new(op, n);
            assert!(unary.value().is_number() || unary.value().is_boolean());
            assert!(unary.status().is_none(), "{} rejected a number", op.token());
        }
    }

    #[test]
    fn null_operand_reads_null() {
        let var = VariableBindValue::new(Value::Null);
        let not = UnaryOperator::new(UnaryOp::Not, var);
        assert_eq!(not.value(), Value::Null);
        assert!(not.status().is_none());
    }

    #[test]
    fn int32_wraps() {
        assert_eq!(to_int32(4_294_967_295.0), -1);
        assert_eq!(to_int32(-1.5), -1);
        assert_eq!(to_int32(f64::NAN), 0);
    }
}
