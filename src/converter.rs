//! Pairwise type conversion registry
//!
//! Converters are keyed by destination type, then by source type with an `any`
//! fallback. An unknown destination converts nothing.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::value::{self, ValueType};

/// Conversion function; the optional parameter is a precision or width.
pub type ConvertFn = Rc<dyn Fn(&Value, Option<u32>) -> Value>;

/// Source key: a concrete type or `any`
type SourceKey = Option<ValueType>;

pub struct DataConverter {
    converters: RefCell<FxHashMap<ValueType, FxHashMap<SourceKey, ConvertFn>>>,
}

impl Default for DataConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl DataConverter {
    /// Create a converter table with the built-in string/boolean/number/array rules.
    pub fn new() -> Self {
        let table = Self {
            converters: RefCell::new(FxHashMap::default()),
        };

        table.register(ValueType::String, None, |input, _| {
            Value::String(value::to_display_string(input))
        });
        table.register(ValueType::String, Some(ValueType::Object), |input, _| {
            Value::String(serde_json::to_string(input).unwrap_or_else(|_| value::to_display_string(input)))
        });
        table.register(ValueType::Boolean, None, |input, _| {
            Value::Bool(value::is_truthy(input))
        });
        table.register(ValueType::Boolean, Some(ValueType::String), |input, _| {
            let text = value::to_display_string(input);
            let n = value::parse_number(&text);
            if n.is_nan() {
                Value::Bool(text.trim().eq_ignore_ascii_case("true"))
            } else {
                Value::Bool(n != 0.0)
            }
        });
        table.register(ValueType::Number, None, |input, _| {
            value::number(value::to_number(input))
        });
        table.register(ValueType::Array, None, |input, _| {
            if !value::is_truthy(input) {
                return Value::Array(Vec::new());
            }
            Value::Array(
                value::to_display_string(input)
                    .split(',')
                    .map(|part| value::number(value::parse_number(part)))
                    .collect(),
            )
        });
        table
    }

    /// Register a converter for `dest`, from `src` (or from any type when `None`).
    pub fn register(
        &self,
        dest: ValueType,
        src: Option<ValueType>,
        convert: impl Fn(&Value, Option<u32>) -> Value + 'static,
    ) {
        self.register_fn(dest, src, Rc::new(convert));
    }

    pub fn register_fn(&self, dest: ValueType, src: Option<ValueType>, convert: ConvertFn) {
        self.converters
            .borrow_mut()
            .entry(dest)
            .or_default()
            .insert(src, convert);
    }

    /// Look up a converter. `None` means no conversion applies.
    pub fn get_converter(&self, src: Option<&ValueType>, dest: &ValueType) -> Option<ConvertFn> {
        let converters = self.converters.borrow();
        let by_source = converters.get(dest)?;
        src.and_then(|src| by_source.get(&Some(src.clone())))
            .or_else(|| by_source.get(&None))
            .cloned()
    }

    /// Convert `data` to `dest`. Null passes through; `src` defaults to the
    /// value's own type and equal types are left untouched.
    pub fn convert(
        &self,
        data: &Value,
        src: Option<&ValueType>,
        dest: Option<&ValueType>,
        param: Option<u32>,
    ) -> Value {
        if data.is_null() {
            return Value::Null;
        }
        let own_type = ValueType::of(data);
        let src = src.or(own_type.as_ref());
        let Some(dest) = dest else {
            return data.clone();
        };
        if src == Some(dest) {
            return data.clone();
        }
        match self.get_converter(src, dest) {
            Some(convert) => convert(data, param),
            None => data.clone(),
        }
    }
}

impl fmt::Debug for DataConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let converters = self.converters.borrow();
        let mut dests: Vec<_> = converters.keys().map(ValueType::as_str).collect();
        dests.sort_unstable();
        f.debug_struct("DataConverter").field("destinations", &dests).finish()
    }
}
