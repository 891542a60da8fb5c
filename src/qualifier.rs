//! Binding qualifiers (v0.1)
//!
//! A qualifier is a `.$name` suffix on a binding expression, optionally followed
//! by a numeric parameter (`reg.$hex4`, `reg.$dec2`). Two families exist:
//! - formatters (`hex`, `dec`, `exp`, `binary`, custom): decorate the binding
//!   with a `FormattedBindValue` that formats on read and unformats on write
//! - capability qualifiers (`readonly`, `writeonly`, `nonvolatile`, `const`,
//!   `interrupt`, `noverify`): restrict a target-backed binding in place
//!
//! A model owns a `QualifierFactoryMap` whose parent is the registry's default
//! map; model entries win over defaults.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::bind::{Bind, BindValue, Qualifier, StatusSlot};
use crate::converter::DataConverter;
use crate::error::{BindError, Result};
use crate::events::{EventKind, Listener};
use crate::progress::Progress;
use crate::status::Status;
use crate::value::{self, ValueType};

pub const QUALIFIER_PREFIX: &str = ".$";

static QUALIFIER_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+$").expect("valid regex"));

/// Creates the qualified binding from the unqualified one and the optional parameter.
pub type QualifierFn = Rc<dyn Fn(Bind, Option<u32>) -> Result<Bind>>;

/// Result of splitting a qualifier suffix off a binding name
pub struct QualifierMatch {
    /// Name with the qualifier suffix removed (unchanged when none matched)
    pub bind_name: String,
    pub qualifier: Option<QualifierFn>,
    pub param: Option<u32>,
}

impl fmt::Debug for QualifierMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualifierMatch")
            .field("bind_name", &self.bind_name)
            .field("qualifier", &self.qualifier.is_some())
            .field("param", &self.param)
            .finish()
    }
}

#[derive(Default)]
pub struct QualifierFactoryMap {
    factories: RefCell<FxHashMap<String, QualifierFn>>,
    parent: Option<Rc<QualifierFactoryMap>>,
}

impl QualifierFactoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map whose lookups fall back to `parent`.
    pub fn with_parent(parent: Rc<QualifierFactoryMap>) -> Self {
        Self {
            factories: RefCell::new(FxHashMap::default()),
            parent: Some(parent),
        }
    }

    /// Map with the built-in formatters and capability qualifiers. Formatter
    /// conversions are registered into `converter`.
    pub fn with_defaults(converter: &Rc<DataConverter>) -> Self {
        let map = Self::new();
        for formatter in builtin_formatters() {
            map.add_formatter(formatter, converter);
        }
        for qualifier in Qualifier::ALL {
            map.add(qualifier.name(), move |bind: Bind, _| {
                match bind.as_qualifiable() {
                    Some(target) => target.set_qualifier(qualifier),
                    None => {
                        return Err(BindError::QualifierNotApplicable {
                            name: qualifier.name().to_string(),
                            binding: bind.name(),
                        })
                    }
                }
                Ok(bind)
            });
        }
        map
    }

    /// Register a qualifier by name, without the `.$` prefix.
    pub fn add(&self, name: &str, factory: impl Fn(Bind, Option<u32>) -> Result<Bind> + 'static) {
        self.factories
            .borrow_mut()
            .insert(format!("{QUALIFIER_PREFIX}{}", name.to_lowercase()), Rc::new(factory));
    }

    /// Register a formatter as a qualifier and its conversions with `converter`.
    pub fn add_formatter(&self, formatter: Rc<dyn DataFormatter>, converter: &Rc<DataConverter>) {
        let operator = formatter.operator().to_string();
        let formatted = ValueType::Custom(operator.clone());

        let format = Rc::clone(&formatter);
        converter.register(formatted.clone(), None, move |input, param| {
            format.format_value(input, param)
        });
        if formatter.can_unformat() {
            let unformat = Rc::clone(&formatter);
            converter.register(
                formatter.unformatted_type().unwrap_or(ValueType::Number),
                Some(formatted),
                move |input, param| unformat.unformat_value(input, param).unwrap_or(Value::Null),
            );
        }

        let converter = Rc::clone(converter);
        self.add(&operator, move |bind, precision| {
            Ok(FormattedBindValue::new(
                bind,
                Rc::clone(&formatter),
                precision,
                Rc::clone(&converter),
            ) as Bind)
        });
    }

    /// Look up a factory by its full key (`.$name`).
    pub fn get(&self, key: &str) -> Option<QualifierFn> {
        self.factories
            .borrow()
            .get(key)
            .cloned()
            .or_else(|| self.parent.as_ref().and_then(|parent| parent.get(key)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(&format!("{QUALIFIER_PREFIX}{}", name.to_lowercase()))
            .is_some()
    }

    /// Split the last `.$name[digits]` suffix off `name`. The suffix must not start
    /// the name and must be registered; otherwise the name is returned unchanged.
    pub fn get_qualifier(&self, name: &str) -> QualifierMatch {
        self.split_qualifier(name, 1)
    }

    /// Like [`get_qualifier`](Self::get_qualifier) but the suffix may start the
    /// name. Used for `.field.$hex` after a lookup, where the name is `.field.$hex`.
    pub fn get_field_qualifier(&self, name: &str) -> QualifierMatch {
        self.split_qualifier(name, 0)
    }

    fn split_qualifier(&self, name: &str, min_pos: usize) -> QualifierMatch {
        let unqualified = || QualifierMatch {
            bind_name: name.to_string(),
            qualifier: None,
            param: None,
        };
        let Some(pos) = name.rfind(QUALIFIER_PREFIX).filter(|pos| *pos >= min_pos) else {
            return unqualified();
        };
        let mut key = name[pos..].to_lowercase();
        let mut param = None;
        if let Some(digits) = QUALIFIER_PARAM.find(&key) {
            param = digits.as_str().parse::<u32>().ok();
            let start = digits.start();
            key.truncate(start);
        }
        match self.get(&key) {
            Some(qualifier) => QualifierMatch {
                bind_name: name[..pos].to_string(),
                qualifier: Some(qualifier),
                param,
            },
            None => unqualified(),
        }
    }

    /// Resolve a possibly qualified name: strip qualifiers from the right, resolve
    /// the base name with `base`, then apply the qualifiers innermost first.
    pub fn resolve(
        &self,
        name: &str,
        base: &mut dyn FnMut(&str) -> Result<Option<Bind>>,
    ) -> Result<Option<Bind>> {
        let QualifierMatch {
            bind_name,
            qualifier,
            param,
        } = self.get_qualifier(name);
        let Some(qualifier) = qualifier else {
            return base(name);
        };
        match self.resolve(&bind_name, base)? {
            Some(bind) => qualifier(bind, param).map(Some),
            None => Ok(None),
        }
    }

    /// Registered names, without prefix, including the parent's.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .parent
            .as_ref()
            .map(|parent| parent.names())
            .unwrap_or_default();
        for key in self.factories.borrow().keys() {
            let name = key.trim_start_matches(QUALIFIER_PREFIX).to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.sort();
        names
    }
}

impl fmt::Debug for QualifierFactoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualifierFactoryMap")
            .field("names", &self.names())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════
// Formatters
// ═══════════════════════════════════════════════════════════════

/// Display formatting applied by a formatter qualifier.
pub trait DataFormatter {
    /// Qualifier name, also the formatted value type (`hex`)
    fn operator(&self) -> &str;

    fn formatted_type(&self) -> ValueType {
        ValueType::String
    }

    /// Type produced by `unformat_value`
    fn unformatted_type(&self) -> Option<ValueType> {
        None
    }

    fn format_value(&self, value: &Value, precision: Option<u32>) -> Value;

    /// Inverse of `format_value`. `None` means writes are converted with the
    /// `DataConverter` to the operand's type instead.
    fn unformat_value(&self, _value: &Value, _precision: Option<u32>) -> Option<Value> {
        None
    }

    fn can_unformat(&self) -> bool {
        false
    }
}

/// Keep the last `precision` characters, or left-pad with zeros up to it.
fn do_precision(text: String, precision: Option<u32>) -> String {
    match precision {
        Some(precision) if precision > 0 => {
            let precision = precision as usize;
            let len = text.chars().count();
            if len > precision {
                text.chars().skip(len - precision).collect()
            } else {
                format!("{}{text}", "0".repeat(precision - len))
            }
        }
        _ => text,
    }
}

/// Integer part, with negatives mapped into the unsigned 32-bit range.
fn to_register(n: f64) -> i64 {
    let n = n.trunc() as i64;
    if n < 0 {
        n + (1i64 << 32)
    } else {
        n
    }
}

fn radix_string(n: i64, radix: u32) -> String {
    let digits = if n < 0 { n.unsigned_abs() } else { n as u64 };
    let text = match radix {
        2 => format!("{digits:b}"),
        16 => format!("{digits:X}"),
        _ => digits.to_string(),
    };
    if n < 0 {
        format!("-{text}")
    } else {
        text
    }
}

/// `1.5e+3` style exponential notation.
fn exponential(n: f64, precision: Option<u32>) -> String {
    let text = match precision {
        Some(precision) => format!("{:.*e}", precision as usize, n),
        None => format!("{n:e}"),
    };
    match text.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
        _ => text,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HexFormatter;

impl DataFormatter for HexFormatter {
    fn operator(&self) -> &str {
        "hex"
    }

    fn format_value(&self, value: &Value, precision: Option<u32>) -> Value {
        let n = value::to_number(value);
        if n.is_nan() {
            return Value::String("0xNaN".to_string());
        }
        let digits = radix_string(to_register(n), 16);
        Value::String(format!("0x{}", do_precision(digits, precision)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecimalFormatter;

impl DataFormatter for DecimalFormatter {
    fn operator(&self) -> &str {
        "dec"
    }

    fn format_value(&self, value: &Value, precision: Option<u32>) -> Value {
        let n = value::to_number(value);
        match precision {
            _ if n.is_nan() => Value::String("NaN".to_string()),
            None => Value::String(value::to_display_string(&value::number(n))),
            Some(precision) => Value::String(format!("{:.*}", precision as usize, n)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScientificFormatter;

impl DataFormatter for ScientificFormatter {
    fn operator(&self) -> &str {
        "exp"
    }

    fn format_value(&self, value: &Value, precision: Option<u32>) -> Value {
        let n = value::to_number(value);
        if n.is_nan() {
            return Value::String("NaN".to_string());
        }
        Value::String(exponential(n, precision))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryFormatter;

impl DataFormatter for BinaryFormatter {
    fn operator(&self) -> &str {
        "binary"
    }

    fn unformatted_type(&self) -> Option<ValueType> {
        Some(ValueType::Number)
    }

    fn format_value(&self, value: &Value, precision: Option<u32>) -> Value {
        let n = value::to_number(value);
        if n.is_nan() {
            return Value::String("NaN".to_string());
        }
        Value::String(do_precision(radix_string(to_register(n), 2), precision))
    }

    fn unformat_value(&self, value: &Value, _precision: Option<u32>) -> Option<Value> {
        let text = value::to_display_string(value);
        let digits: String = text
            .trim()
            .chars()
            .take_while(|c| *c == '0' || *c == '1')
            .collect();
        Some(
            i64::from_str_radix(&digits, 2)
                .map(Value::from)
                .unwrap_or(Value::Null),
        )
    }

    fn can_unformat(&self) -> bool {
        true
    }
}

pub fn builtin_formatters() -> Vec<Rc<dyn DataFormatter>> {
    vec![
        Rc::new(HexFormatter),
        Rc::new(DecimalFormatter),
        Rc::new(ScientificFormatter),
        Rc::new(BinaryFormatter),
    ]
}

/// Registry of custom formatters, feeding a qualifier map and its converter.
#[derive(Debug)]
pub struct FormatterRegistry {
    qualifiers: Rc<QualifierFactoryMap>,
    converter: Rc<DataConverter>,
}

impl FormatterRegistry {
    pub fn new(qualifiers: Rc<QualifierFactoryMap>, converter: Rc<DataConverter>) -> Self {
        Self {
            qualifiers,
            converter,
        }
    }

    /// Make `formatter` available as `.$<operator>` on every binding.
    pub fn add(&self, formatter: impl DataFormatter + 'static) {
        self.qualifiers
            .add_formatter(Rc::new(formatter), &self.converter);
    }
}

/// Formatter decorator: reads format the operand's value, writes are unformatted
/// (or converted to the operand's type) and passed through.
pub struct FormattedBindValue {
    name: RefCell<String>,
    operand: Bind,
    formatter: Rc<dyn DataFormatter>,
    precision: Option<u32>,
    converter: Rc<DataConverter>,
    status: StatusSlot,
}

impl FormattedBindValue {
    pub fn new(
        operand: Bind,
        formatter: Rc<dyn DataFormatter>,
        precision: Option<u32>,
        converter: Rc<DataConverter>,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: RefCell::new(String::new()),
            operand,
            formatter,
            precision,
            converter,
            status: StatusSlot::default(),
        })
    }

    pub fn operand(&self) -> &Bind {
        &self.operand
    }

    fn format(&self, value: Value) -> Value {
        if value.is_null() {
            return value;
        }
        self.formatter.format_value(&value, self.precision)
    }

    fn unformat(&self, value: &Value) -> Value {
        self.formatter
            .unformat_value(value, self.precision)
            .unwrap_or_else(|| {
                self.converter
                    .convert(value, None, self.operand.value_type().as_ref(), None)
            })
    }
}

impl BindValue for FormattedBindValue {
    fn name(&self) -> String {
        self.name.borrow().clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_string();
    }

    fn value(&self) -> Value {
        self.format(self.operand.value())
    }

    fn set_value(&self, value: Value, progress: &Progress, force: bool) {
        if value.is_null() {
            return;
        }
        let unformatted = self.unformat(&value);
        self.operand.set_value(unformatted, progress, force);
    }

    fn update_value(&self, value: Value, progress: &Progress, skip_streaming: bool) {
        let unformatted = self.unformat(&value);
        self.operand.update_value(unformatted, progress, skip_streaming);
    }

    fn value_type(&self) -> Option<ValueType> {
        Some(self.formatter.formatted_type())
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
        self.format(self.operand.committed_value())
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

    fn as_refreshable(&self) -> Option<&dyn crate::bind::Refreshable> {
        self.operand.as_refreshable()
    }

    fn as_disconnectable(&self) -> Option<&dyn crate::bind::Disconnectable> {
        self.operand.as_disconnectable()
    }

    fn exclude_from_storage(&self) -> bool {
        self.operand.exclude_from_storage()
    }
}

impl fmt::Debug for FormattedBindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormattedBindValue")
            .field("operator", &self.formatter.operator())
            .field("precision", &self.precision)
            .finish()
    }
}
