//! Index tuples and index guards for lookup bindings

use std::cell::RefCell;

use serde_json::{Map, Value};

use crate::error::{BindError, Result};
use crate::value::{loose_eq, to_display_string, to_number};

/// Multi-dimensional index tuple of a lookup binding.
#[derive(Debug, Default)]
pub struct LookupIndex {
    values: RefCell<Vec<Value>>,
}

impl LookupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `indices`, growing the tuple when needed. Returns true when any
    /// component changed (loose equality) or was added.
    pub fn set(&self, indices: &[Value]) -> bool {
        let mut values = self.values.borrow_mut();
        let mut changed = false;
        for (i, index) in indices.iter().enumerate() {
            match values.get_mut(i) {
                Some(old) if loose_eq(old, index) => {}
                Some(old) => {
                    *old = index.clone();
                    changed = true;
                }
                None => {
                    values.push(index.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn get(&self) -> Vec<Value> {
        self.values.borrow().clone()
    }

    pub fn component(&self, i: usize) -> Option<Value> {
        self.values.borrow().get(i).cloned()
    }
}

pub fn assert_not_null(index: &Value) -> Result<()> {
    if index.is_null() {
        return Err(BindError::IndexNull);
    }
    Ok(())
}

/// Validate an array index against `start..start + size`.
pub fn assert_valid_array_index(index: &Value, size: usize, start: i64) -> Result<i64> {
    assert_not_null(index)?;
    let n = to_number(index);
    if n.is_nan() {
        return Err(BindError::IndexNotInteger {
            index: to_display_string(index),
        });
    }
    let end = size as i64 + start - 1;
    if n < start as f64 || n > end as f64 {
        return Err(BindError::IndexOutOfBounds {
            index: n as i64,
            start,
            end,
        });
    }
    Ok(n as i64)
}

/// Validate a field name against the keys of `fields`.
pub fn assert_valid_field_name(field: &Value, fields: Option<&Map<String, Value>>) -> Result<String> {
    assert_not_null(field)?;
    let name = to_display_string(field);
    match fields {
        Some(fields) if fields.contains_key(&name) => Ok(name),
        _ => Err(BindError::FieldNotFound { field: name }),
    }
}

/// Validate that a lookup produced data.
pub fn assert_valid_data<'a>(index: &Value, data: Option<&'a Value>) -> Result<&'a Value> {
    assert_not_null(index)?;
    data.ok_or_else(|| BindError::FieldNotFound {
        field: to_display_string(index),
    })
}
