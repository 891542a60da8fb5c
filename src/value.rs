//! Dynamic binding values
//!
//! Bindings carry `serde_json::Value`. This module holds the type tags and the
//! loose (script-style) coercions used by converters, operators and index checks.

use std::fmt;

use serde_json::Value;

/// Declared type tag of a binding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Number,
    String,
    Boolean,
    Array,
    Object,
    /// Formatter types like `hex` or `binary`, or model specific types
    Custom(String),
}

impl ValueType {
    /// Type tag of a concrete value (`None` for null)
    pub fn of(value: &Value) -> Option<ValueType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ValueType::Boolean),
            Value::Number(_) => Some(ValueType::Number),
            Value::String(_) => Some(ValueType::String),
            Value::Array(_) => Some(ValueType::Array),
            Value::Object(_) => Some(ValueType::Object),
        }
    }

    pub fn parse(name: &str) -> ValueType {
        match name {
            "number" => ValueType::Number,
            "string" => ValueType::String,
            "boolean" => ValueType::Boolean,
            "array" => ValueType::Array,
            "object" => ValueType::Object,
            other => ValueType::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Boolean => "boolean",
            ValueType::Array => "array",
            ValueType::Object => "object",
            ValueType::Custom(name) => name,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a number value, keeping integers integral. NaN and infinities become null.
pub fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// Numeric coercion: `true` is 1, `""` is 0, hex strings are accepted.
pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => parse_number(s),
        Value::Array(items) => match items.as_slice() {
            [] => 0.0,
            [single] => to_number(single),
            _ => f64::NAN,
        },
        Value::Object(_) => f64::NAN,
    }
}

/// Parse a numeric string, `NaN` when it is not a number.
pub fn parse_number(text: &str) -> f64 {
    let text = text.trim();
    if text.is_empty() {
        return 0.0;
    }
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let radix = [("0x", 16), ("0X", 16), ("0b", 2), ("0B", 2), ("0o", 8), ("0O", 8)]
        .iter()
        .find_map(|(prefix, radix)| digits.strip_prefix(prefix).map(|rest| (rest, *radix)));
    let magnitude = match radix {
        Some((rest, radix)) => match u64::from_str_radix(rest, radix) {
            Ok(n) => n as f64,
            Err(_) => return f64::NAN,
        },
        None => match digits {
            "Infinity" => f64::INFINITY,
            _ if digits.chars().all(|c| c.is_ascii_digit() || "eE.-+".contains(c)) => {
                digits.parse::<f64>().unwrap_or(f64::NAN)
            }
            _ => return f64::NAN,
        },
    };
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// Truthiness: null, false, 0, NaN and "" are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String coercion: strings unquoted, arrays comma-joined.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) => format_float(f),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => to_display_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e21 {
        format!("{}", f as i128)
    } else {
        f.to_string()
    }
}

/// Strict equality, except that numbers compare by numeric value (`1 == 1.0`).
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| same_value(a, b))
        }
        _ => a == b,
    }
}

/// Loose equality: numbers compare numerically against numeric strings and
/// booleans; everything else compares structurally.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => to_number(a) == to_number(b),
        (Value::Number(_), Value::String(_) | Value::Bool(_))
        | (Value::String(_) | Value::Bool(_), Value::Number(_))
        | (Value::Bool(_), Value::String(_))
        | (Value::String(_), Value::Bool(_)) => to_number(a) == to_number(b),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_tags() {
        assert_eq!(ValueType::of(&json!(1)), Some(ValueType::Number));
        assert_eq!(ValueType::of(&json!([1])), Some(ValueType::Array));
        assert_eq!(ValueType::of(&Value::Null), None);
        assert_eq!(ValueType::parse("hex"), ValueType::Custom("hex".into()));
        assert_eq!(ValueType::parse("boolean").as_str(), "boolean");
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(to_number(&json!("42")), 42.0);
        assert_eq!(to_number(&json!("0x1F")), 31.0);
        assert_eq!(to_number(&json!("-0b101")), -5.0);
        assert_eq!(to_number(&json!(true)), 1.0);
        assert_eq!(to_number(&json!("")), 0.0);
        assert!(to_number(&json!("abc")).is_nan());
        assert!(to_number(&json!({})).is_nan());
    }

    #[test]
    fn number_keeps_integers_integral() {
        assert_eq!(number(3.0), json!(3));
        assert_eq!(number(2.5), json!(2.5));
        assert_eq!(number(f64::NAN), Value::Null);
    }

    #[test]
    fn display_strings() {
        assert_eq!(to_display_string(&json!(5)), "5");
        assert_eq!(to_display_string(&json!(5.0)), "5");
        assert_eq!(to_display_string(&json!([1, 2, 3])), "1,2,3");
        assert_eq!(to_display_string(&json!("x")), "x");
    }

    #[test]
    fn loose_equality() {
        assert!(loose_eq(&json!(1), &json!("1")));
        assert!(loose_eq(&json!(1), &json!(true)));
        assert!(loose_eq(&json!(2), &json!(2.0)));
        assert!(!loose_eq(&json!("a"), &json!("b")));
        assert!(!loose_eq(&Value::Null, &json!(0)));
    }

    #[test]
    fn same_value_is_numeric_for_numbers() {
        assert!(same_value(&json!(1), &json!(1.0)));
        assert!(same_value(&json!([1, 2]), &json!([1.0, 2])));
        assert!(!same_value(&json!(1), &json!("1")));
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!([])));
    }
}
