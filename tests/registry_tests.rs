//! # Registry Integration Tests
//!
//! End-to-end behavior through the public API:
//! - expressions over a JSON-backed model (lookups, fields, writes)
//! - binding files loaded from disk and bound to widget properties
//! - saving binding files and persisted values

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use databind::events::listener;
use databind::registry::{FsBindingFileIo, WidgetBindingOptions};
use databind::{
    Bind, BindFactory, BindValue, Binder, BindingFile, BindingRegistry, DataStorageProvider,
    EventKind, JsonModel, Progress, WidgetBinding,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::LocalSet;

// ============================================================================
// TEST HELPERS
// ============================================================================

fn plant_registry(io_root: Option<&TempDir>) -> (BindingRegistry, Rc<JsonModel>) {
    let mut registry = BindingRegistry::new();
    if let Some(root) = io_root {
        registry = registry.with_file_io(Rc::new(FsBindingFileIo::new(root.path())));
    }
    let plant = Rc::new(JsonModel::new(
        "plant",
        json!({
            "speed": 10,
            "idx": 1,
            "regs": [100, 200, 300],
            "motors": [{"name": "m0", "speed": 5}, {"name": "m1", "speed": 7}]
        }),
        registry.context(),
    ));
    plant.connect();
    registry.register_model(plant.clone(), false, None);
    (registry, plant)
}

fn expr(registry: &BindingRegistry, text: &str) -> Bind {
    registry
        .get_binding(text)
        .expect("expression parses")
        .expect("expression resolves")
}

/// Listen to `bind` so it starts reading, and keep the listener alive.
fn watch(bind: &Bind) {
    bind.add_listener(EventKind::ValueChanged, listener(|_| {}));
}

/// Poll until `bind` holds `expected`.
async fn eventually(bind: &Bind, expected: Value) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while bind.value() != expected {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "'{}' stayed at {} instead of {}",
        bind.name(),
        bind.value(),
        expected
    );
}

async fn refresh(bind: &Bind) {
    if let Some(refreshable) = bind.as_refreshable() {
        refreshable.refresh(&Progress::null(), true).await;
    }
}

// ============================================================================
// EXPRESSIONS OVER A JSON MODEL
// ============================================================================

#[tokio::test]
async fn test_arithmetic_over_model_bindings() {
    LocalSet::new()
        .run_until(async {
            let (registry, _plant) = plant_registry(None);
            let doubled = expr(&registry, "plant.speed * 2 + 1");
            watch(&doubled);
            eventually(&doubled, json!(21)).await;
        })
        .await;
}

#[tokio::test]
async fn test_lookup_follows_index_binding() {
    LocalSet::new()
        .run_until(async {
            let (registry, plant) = plant_registry(None);
            let idx = expr(&registry, "plant.idx");
            refresh(&idx).await;

            let reg = expr(&registry, "plant.regs[plant.idx]");
            watch(&reg);
            eventually(&reg, json!(200)).await;

            let progress = Progress::new();
            idx.set_value(json!(2), &progress, false);
            progress.done(1);
            progress.finished().await;
            eventually(&reg, json!(300)).await;
            assert_eq!(plant.snapshot()["idx"], json!(2));
        })
        .await;
}

#[tokio::test]
async fn test_field_after_lookup() {
    LocalSet::new()
        .run_until(async {
            let (registry, _plant) = plant_registry(None);
            let name = expr(&registry, "plant.motors[1].name");
            watch(&name);
            eventually(&name, json!("m1")).await;
        })
        .await;
}

#[tokio::test]
async fn test_write_through_lookup_lands_in_document() {
    LocalSet::new()
        .run_until(async {
            let (registry, plant) = plant_registry(None);
            let speed = expr(&registry, "plant.motors[0].speed");
            watch(&speed);
            eventually(&speed, json!(5)).await;

            let progress = Progress::new();
            speed.set_value(json!(9), &progress, false);
            progress.done(1);
            progress.finished().await;
            assert_eq!(plant.snapshot()["motors"][0]["speed"], json!(9));
        })
        .await;
}

#[tokio::test]
async fn test_hex_qualifier_on_model_binding() {
    LocalSet::new()
        .run_until(async {
            let (registry, plant) = plant_registry(None);
            let hex = expr(&registry, "plant.speed.$hex");
            watch(&hex);
            eventually(&hex, json!("0xA")).await;

            let progress = Progress::new();
            hex.set_value(json!("0x20"), &progress, false);
            progress.done(1);
            progress.finished().await;
            assert_eq!(plant.snapshot()["speed"], json!(32));
        })
        .await;
}

#[tokio::test]
async fn test_connected_binding_per_model() {
    LocalSet::new()
        .run_until(async {
            let (registry, plant) = plant_registry(None);
            let connected = expr(&registry, "plant.$target_connected");
            assert_eq!(connected.value(), json!(true));
            plant.disconnect();
            assert_eq!(connected.value(), json!(false));
            plant.when_connected().await;
        })
        .await;
}

#[tokio::test]
async fn test_streaming_widget_gets_every_read() {
    LocalSet::new()
        .run_until(async {
            let (registry, _plant) = plant_registry(None);
            let samples = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&samples);
            registry.widgets().set_streaming_receiver(
                "chart.samples",
                Rc::new(move |data| sink.borrow_mut().push(data)),
            );
            let binder = registry.bind("widget.chart.samples", "plant.speed", None, None);
            assert!(binder.is_enabled());

            let speed = expr(&registry, "plant.speed");
            tokio::time::timeout(Duration::from_secs(2), async {
                while samples.borrow().is_empty() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .expect("first sample");

            // re-reading the same value still streams it
            refresh(&speed).await;
            refresh(&speed).await;
            assert_eq!(*samples.borrow(), vec![json!(10), json!(10), json!(10)]);
        })
        .await;
}

// ============================================================================
// BINDING FILES
// ============================================================================

#[tokio::test]
async fn test_load_binding_file_binds_widgets() {
    LocalSet::new()
        .run_until(async {
            let root = TempDir::new().unwrap();
            std::fs::write(
                root.path().join("index.json"),
                json!({"widgetBindings": [
                    {"widgetId": "gauge", "propertyName": "value", "serverBindName": "plant.speed"},
                    {"widgetId": "gauge", "propertyName": "label", "serverBindName": "plant.motors[0].name",
                     "options": {"dataType": "string"}},
                    {"serverBindName": "plant.idx", "options": {"defaultValue": 0}}
                ]})
                .to_string(),
            )
            .unwrap();

            let (registry, plant) = plant_registry(Some(&root));
            let binder = registry.load_bindings_from_file(None).await;
            assert!(binder.is_enabled());

            let gauge = expr(&registry, "widget.gauge.value");
            eventually(&gauge, json!(10)).await;
            let label = expr(&registry, "widget.gauge.label");
            eventually(&label, json!("m0")).await;

            // widget edits flow back into the model
            gauge.set_value(json!(12), &Progress::null(), false);
            let speed = expr(&registry, "plant.speed");
            eventually(&speed, json!(12)).await;
            tokio::time::timeout(Duration::from_secs(2), async {
                while plant.snapshot()["speed"] != json!(12) || plant.snapshot()["idx"] != json!(0) {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .expect("document updated");

            // unloading stops the sync; loading again reuses the same binders
            registry.unload_bindings_from_file(None);
            assert!(!binder.is_enabled());
            let again = registry.load_bindings_from_file(None).await;
            assert!(again.is_enabled());
            assert!(binder.is_enabled());
        })
        .await;
}

#[tokio::test]
async fn test_missing_binding_file_gives_null_binder() {
    LocalSet::new()
        .run_until(async {
            let root = TempDir::new().unwrap();
            let (registry, _plant) = plant_registry(Some(&root));
            let binder = registry.load_bindings_from_file(Some("nope.json")).await;
            assert!(!binder.is_enabled());
        })
        .await;
}

#[tokio::test]
async fn test_save_bindings_as_yaml() {
    LocalSet::new()
        .run_until(async {
            let root = TempDir::new().unwrap();
            let (registry, _plant) = plant_registry(Some(&root));
            let bindings = vec![WidgetBinding {
                widget_id: "gauge".into(),
                property_name: "value".into(),
                server_bind_name: "plant.speed".into(),
                options: Some(WidgetBindingOptions {
                    data_type: Some("double".into()),
                    default_value: None,
                }),
            }];
            registry
                .save_bindings_to_file(Some("ui/bindings.yaml"), &bindings)
                .await
                .unwrap();

            let path = root.path().join("ui").join("bindings.yaml");
            let text = std::fs::read_to_string(&path).unwrap();
            assert!(text.contains("widgetBindings"));
            assert_eq!(BindingFile::read(&path).unwrap().widget_bindings, bindings);
        })
        .await;
}

// ============================================================================
// STORAGE
// ============================================================================

#[tokio::test]
async fn test_storage_round_trip_through_model() {
    LocalSet::new()
        .run_until(async {
            let (registry, plant) = plant_registry(None);
            let speed = expr(&registry, "plant.speed");
            refresh(&speed).await;

            let mut storage = DataStorageProvider::new();
            storage.add_data_model(plant.clone());
            let saved = storage.read_data_for_save();
            assert_eq!(saved["plant"]["speed"], json!(10));
            assert!(saved["plant"].get("$target_connected").is_none());

            storage.write_data_for_load(&json!({"plant": {"speed": 15}}));
            eventually(&speed, json!(15)).await;
            tokio::time::timeout(Duration::from_secs(2), async {
                while plant.snapshot()["speed"] != json!(15) {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .expect("write reached the document");
        })
        .await;
}
