//! JSON-backed model
//!
//! Serves bindings over an in-memory `serde_json::Value` document. A binding
//! name is a dotted path into the document (`motor.speed`, `regs.3`); lookup
//! operators index into whatever the path points at (`regs[i]`, `motor.field`).
//!
//! Reads and writes go through the async target machinery like any device
//! model, with an optional simulated latency.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::bind::{
    assert_valid_array_index, assert_valid_data, assert_valid_field_name, AsyncBindValue, Bind,
    LookupKind, Target,
};
use crate::error::{BindError, Result};
use crate::factory::{BindContext, BindFactory, BindFactoryCore};
use crate::value::ValueType;

/// Shared document handle
pub type Document = Rc<RefCell<Value>>;

pub struct JsonModel {
    core: BindFactoryCore,
    document: Document,
    connected: Rc<Cell<bool>>,
    latency: Option<Duration>,
    ignore_writes_when_disconnected: bool,
}

impl JsonModel {
    pub fn new(id: impl Into<String>, document: Value, context: &BindContext) -> Self {
        Self {
            core: BindFactoryCore::new(id, context),
            document: Rc::new(RefCell::new(document)),
            connected: Rc::new(Cell::new(false)),
            latency: None,
            ignore_writes_when_disconnected: false,
        }
    }

    /// Delay every read and write by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_ignore_writes_when_disconnected(mut self, ignore: bool) -> Self {
        self.ignore_writes_when_disconnected = ignore;
        self
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Snapshot of the whole document.
    pub fn snapshot(&self) -> Value {
        self.document.borrow().clone()
    }

    pub fn connect(&self) {
        self.connected.set(true);
        self.on_connect();
    }

    pub fn disconnect(&self) {
        self.connected.set(false);
        self.on_disconnect();
    }
}

impl BindFactory for JsonModel {
    fn core(&self) -> &BindFactoryCore {
        &self.core
    }

    fn create_new_bind(&self, name: &str) -> Result<Option<Bind>> {
        let path = split_path(name);
        let (exists, kind, value_type) = {
            let document = self.document.borrow();
            match resolve(&document, &path) {
                Some(value) => (true, lookup_kind_of(value), ValueType::of(value)),
                None => (parent_is_object(&document, &path), None, None),
            }
        };
        if !exists {
            debug!(model = %self.id(), name, "No such path in document");
            return Ok(None);
        }
        let target = JsonTarget {
            document: Rc::clone(&self.document),
            path,
            kind,
            value_type,
            connected: Rc::clone(&self.connected),
            latency: self.latency,
        };
        let bind = AsyncBindValue::new(target).with_emitter(self.core.emitter());
        bind.set_ignore_writes_when_disconnected(self.ignore_writes_when_disconnected);
        Ok(Some(bind as Bind))
    }
}

impl fmt::Debug for JsonModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonModel")
            .field("core", &self.core)
            .field("connected", &self.connected.get())
            .field("latency", &self.latency)
            .finish()
    }
}

fn split_path(name: &str) -> Vec<String> {
    name.split('.')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn step_mut<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    }
}

fn resolve<'a>(document: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(document, |value, segment| step(value, segment))
}

fn parent_is_object(document: &Value, path: &[String]) -> bool {
    match path.split_last() {
        Some((_, parent)) => resolve(document, parent).is_some_and(Value::is_object),
        None => false,
    }
}

fn lookup_kind_of(value: &Value) -> Option<LookupKind> {
    match value {
        Value::Array(_) => Some(LookupKind::Array),
        Value::Object(_) => Some(LookupKind::Object),
        _ => None,
    }
}

/// Apply one runtime index to `value`.
fn index_into<'a>(value: &'a Value, index: &Value) -> Result<&'a Value> {
    match value {
        Value::Array(items) => {
            let i = assert_valid_array_index(index, items.len(), 0)?;
            assert_valid_data(index, items.get(i as usize))
        }
        Value::Object(map) => {
            let field = assert_valid_field_name(index, Some(map))?;
            assert_valid_data(index, map.get(&field))
        }
        _ => assert_valid_data(index, None),
    }
}

fn index_into_mut<'a>(value: &'a mut Value, index: &Value) -> Result<&'a mut Value> {
    match value {
        Value::Array(items) => {
            let i = assert_valid_array_index(index, items.len(), 0)?;
            items.get_mut(i as usize).ok_or(BindError::FieldNotFound {
                field: i.to_string(),
            })
        }
        Value::Object(map) => {
            let field = assert_valid_field_name(index, Some(map))?;
            map.get_mut(&field).ok_or(BindError::FieldNotFound { field })
        }
        _ => Err(assert_valid_data(index, None).map_or_else(|err| err, |_| BindError::IndexNull)),
    }
}

/// A path (plus runtime indices) inside a shared JSON document.
pub struct JsonTarget {
    document: Document,
    path: Vec<String>,
    kind: Option<LookupKind>,
    value_type: Option<ValueType>,
    connected: Rc<Cell<bool>>,
    latency: Option<Duration>,
}

impl JsonTarget {
    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn missing_path(&self) -> BindError {
        BindError::target(format!("Path '{}' does not exist.", self.path.join(".")))
    }
}

#[async_trait(?Send)]
impl Target for JsonTarget {
    async fn read_value(&self, index: &[Value]) -> Result<Value> {
        self.simulate_latency().await;
        let document = self.document.borrow();
        let mut value = resolve(&document, &self.path).ok_or_else(|| self.missing_path())?;
        for component in index {
            value = index_into(value, component)?;
        }
        Ok(value.clone())
    }

    async fn write_value(&self, value: Value, index: &[Value]) -> Result<()> {
        self.simulate_latency().await;
        let mut document = self.document.borrow_mut();
        let Some((last, parent)) = self.path.split_last() else {
            *document = value;
            return Ok(());
        };
        let parent_value = parent
            .iter()
            .try_fold(&mut *document, |value, segment| step_mut(value, segment))
            .ok_or_else(|| self.missing_path())?;
        let mut slot = match parent_value {
            Value::Object(map) => map.entry(last.clone()).or_insert(Value::Null),
            other => step_mut(other, last).ok_or_else(|| self.missing_path())?,
        };
        for component in index {
            slot = index_into_mut(slot, component)?;
        }
        *slot = value;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn lookup_kind(&self) -> Option<LookupKind> {
        self.kind
    }

    fn value_type(&self) -> Option<ValueType> {
        self.value_type.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::{BindValue, Refreshable};
    use crate::progress::Progress;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::task::LocalSet;

    fn model() -> JsonModel {
        let model = JsonModel::new(
            "plant",
            json!({"motor": {"speed": 10, "name": "m1"}, "regs": [1, 2, 3]}),
            &BindContext::new(),
        );
        model.connect();
        model
    }

    async fn read(bind: &Bind) -> Value {
        if let Some(refreshable) = bind.as_refreshable() {
            refreshable.refresh(&Progress::null(), true).await;
        }
        bind.value()
    }

    #[tokio::test]
    async fn reads_paths() {
        LocalSet::new()
            .run_until(async {
                let model = model();
                let speed = model.get_binding("motor.speed").ok().flatten().expect("exists");
                assert_eq!(read(&speed).await, json!(10));
                let reg = model.get_binding("regs.1").ok().flatten().expect("exists");
                assert_eq!(read(&reg).await, json!(2));
                assert!(matches!(model.get_binding("motor.torque.x"), Ok(None)));
            })
            .await;
    }

    #[tokio::test]
    async fn writes_land_in_document() {
        LocalSet::new()
            .run_until(async {
                let model = model();
                model
                    .script_write("motor.speed", json!(25))
                    .await
                    .expect("write succeeds");
                assert_eq!(model.snapshot()["motor"]["speed"], json!(25));

                // new field under an existing object
                model
                    .script_write("motor.torque", json!(3))
                    .await
                    .expect("write succeeds");
                assert_eq!(model.snapshot()["motor"]["torque"], json!(3));
            })
            .await;
    }

    #[tokio::test]
    async fn indexed_reads_and_writes() {
        LocalSet::new()
            .run_until(async {
                let model = model();
                let regs = model
                    .get_model_binding("regs", true)
                    .ok()
                    .flatten()
                    .expect("exists");
                let lookup = regs.as_lookup().expect("arrays are lookups");
                assert_eq!(lookup.lookup_kind(), LookupKind::Array);
                lookup.set_index(&[json!(2)]);
                assert_eq!(read(&regs).await, json!(3));

                let progress = Progress::new();
                regs.set_value(json!(30), &progress, false);
                progress.done(1);
                progress.finished().await;
                assert_eq!(model.snapshot()["regs"], json!([1, 2, 30]));
            })
            .await;
    }

    #[tokio::test]
    async fn bad_index_sets_error_status() {
        LocalSet::new()
            .run_until(async {
                let model = model();
                let regs = model
                    .get_model_binding("regs", true)
                    .ok()
                    .flatten()
                    .expect("exists");
                regs.as_lookup().expect("lookup").set_index(&[json!(7)]);
                read(&regs).await;
                let status = regs.status().expect("error status");
                assert!(status.is_error());
                assert_eq!(
                    status.message,
                    "The index 7 is out of bounds.  It must be between 0 and 2"
                );
            })
            .await;
    }

    #[test]
    fn scalars_are_not_lookups() {
        let model = model();
        let speed = model.get_binding("motor.speed").ok().flatten().expect("exists");
        assert!(speed.as_lookup().is_none());
        let motor = model
            .get_model_binding("motor", true)
            .ok()
            .flatten()
            .expect("exists");
        assert_eq!(
            motor.as_lookup().map(|lookup| lookup.lookup_kind()),
            Some(LookupKind::Object)
        );
    }
}
