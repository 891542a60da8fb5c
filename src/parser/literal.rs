//! Number, boolean and string literals

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{BindError, Result};
use crate::value;

static DECIMAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").expect("valid regex"));

/// Try number, then boolean, then string. `Ok(None)` means `text` is not a literal.
pub fn parse_literal(text: &str) -> Result<Option<Value>> {
    if let Some(number) = parse_number(text)? {
        return Ok(Some(number));
    }
    if let Some(boolean) = parse_boolean(text) {
        return Ok(Some(boolean));
    }
    Ok(parse_string(text))
}

pub fn starts_with_digit(text: &str) -> bool {
    text.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn looks_numeric(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('.') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

fn parse_number(text: &str) -> Result<Option<Value>> {
    if !looks_numeric(text) {
        return Ok(None);
    }
    let invalid = || BindError::InvalidLiteral {
        text: text.to_string(),
    };
    let radix = [("0x", 16), ("0X", 16), ("0b", 2), ("0B", 2)]
        .iter()
        .find_map(|(prefix, radix)| text.strip_prefix(prefix).map(|digits| (digits, *radix)));
    if let Some((digits, radix)) = radix {
        let n = u64::from_str_radix(digits, radix).map_err(|_| invalid())?;
        return Ok(Some(Value::from(n)));
    }
    if !DECIMAL.is_match(text) {
        return Err(invalid());
    }
    let n: f64 = text.parse().map_err(|_| invalid())?;
    Ok(Some(value::number(n)))
}

fn parse_boolean(text: &str) -> Option<Value> {
    match text {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => None,
    }
}

fn parse_string(text: &str) -> Option<Value> {
    let inner = text.strip_prefix('\'')?.strip_suffix('\'')?;
    if inner.contains('\'') && !inner.contains("\\'") {
        return None;
    }
    Some(Value::String(inner.replace("\\'", "'")))
}
