//! Persisting binding values
//!
//! The saved shape is one flat object per model: `{model: {binding: value}}`.
//! Read-only bindings and bindings that opt out of storage are skipped.

use std::fmt;

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::progress::Progress;
use crate::registry::Model;

#[derive(Default)]
pub struct DataStorageProvider {
    models: FxHashMap<String, Model>,
}

impl DataStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data_model(&mut self, model: Model) {
        self.models.insert(model.id().to_string(), model);
    }

    pub fn remove_data_model(&mut self, id: &str) {
        self.models.remove(id);
    }

    /// Values of every storable binding, grouped by model.
    pub fn read_data_for_save(&self) -> Value {
        let mut data = Map::new();
        for (id, model) in &self.models {
            let mut values = Map::new();
            for (name, bind) in model.all_bindings() {
                if bind.is_read_only() || bind.exclude_from_storage() {
                    continue;
                }
                values.insert(name, bind.value());
            }
            data.insert(id.clone(), Value::Object(values));
        }
        Value::Object(data)
    }

    /// Set saved values on bindings that exist; unknown models and names are skipped.
    pub fn write_data_for_load(&self, data: &Value) {
        for (id, model) in &self.models {
            let Some(values) = data.get(id).and_then(Value::as_object) else {
                continue;
            };
            let bindings: FxHashMap<String, _> = model.all_bindings().into_iter().collect();
            for (name, value) in values {
                match bindings.get(name) {
                    Some(bind) => bind.set_value(value.clone(), &Progress::null(), false),
                    None => debug!(model = %id, name = %name, "Skipping saved value for unknown binding"),
                }
            }
        }
    }
}

impl fmt::Debug for DataStorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut models: Vec<&String> = self.models.keys().collect();
        models.sort();
        f.debug_struct("DataStorageProvider")
            .field("models", &models)
            .finish()
    }
}
