//! Binding registry (v0.1)
//!
//! The registry is the entry point for binding expressions. It maps model ids
//! to [`BindFactory`] instances and resolves fully qualified expressions such
//! as `plant.motor.speed.$hex + 1`:
//!
//! | Prefix                | Model                                  |
//! |-----------------------|----------------------------------------|
//! | `plant.`              | model registered as `plant`            |
//! | `widget.plant.` / `$.plant.` | model `plant` when registered   |
//! | none / unknown        | the default model                      |
//!
//! It also loads and saves binding files: JSON (or YAML) documents of the form
//! `{"widgetBindings": [{widgetId, propertyName, serverBindName, options}]}`.

use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, FutureExt, LocalBoxFuture};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::bind::{Bind, BindValue, ConstantBindValue, CollectionBindValue, RefreshInterval};
use crate::binder::{Binder, BinderCollection, ComputeFn, DataBinder, NullBinder};
use crate::config::EngineConfig;
use crate::error::{BindError, Result};
use crate::factory::{BindContext, BindFactory};
use crate::parser::{BindResolver, ExpressionParser};
use crate::progress::Progress;
use crate::property_model::PropertyModel;
use crate::status::Status;
use crate::value::ValueType;

pub const WIDGET_MODEL: &str = "widget";
pub const WIDGET_MODEL_ALIAS: &str = "$";
pub const DEFAULT_BINDING_FILE: &str = "index.json";

pub type Model = Rc<dyn BindFactory>;

// ═══════════════════════════════════════════════════════════════
// Binding files
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetBinding {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub widget_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub property_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_bind_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<WidgetBindingOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetBindingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingFile {
    pub widget_bindings: Vec<WidgetBinding>,
}

impl BindingFile {
    /// Parse a binding document, naming `path` in errors.
    pub fn from_value(path: &str, data: Value) -> Result<Self> {
        serde_json::from_value(data).map_err(|e| BindError::InvalidBindingFile {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Read a JSON or YAML binding file from disk.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let data: Value = if is_yaml(path) {
            serde_yaml::from_str(&text)?
        } else {
            serde_json::from_str(&text)?
        };
        Self::from_value(&path.display().to_string(), data)
    }
}

/// Numeric data types of binding files all map to `number`.
fn normalize_data_type(data_type: &str) -> ValueType {
    let data_type = data_type.to_lowercase();
    match data_type.as_str() {
        "long" | "short" | "int" | "double" | "float" => ValueType::Number,
        other => ValueType::parse(other),
    }
}

/// Reads and writes the JSON documents behind binding files.
pub trait BindingFileIo {
    fn read_json(&self, path: &str) -> LocalBoxFuture<'static, Result<Value>>;
    fn write_json(&self, path: &str, data: Value) -> LocalBoxFuture<'static, Result<()>>;
}

/// Waits until a widget named in a binding file exists.
pub trait ReadyAwaiter {
    fn when_ready(&self, widget_id: &str) -> LocalBoxFuture<'static, ()>;
}

/// Widgets that exist from the start.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

impl ReadyAwaiter for AlwaysReady {
    fn when_ready(&self, _widget_id: &str) -> LocalBoxFuture<'static, ()> {
        future::ready(()).boxed_local()
    }
}

/// Binding files on disk, relative to `root`. `.yaml`/`.yml` files are YAML,
/// everything else JSON.
#[derive(Debug, Clone)]
pub struct FsBindingFileIo {
    root: PathBuf,
}

impl FsBindingFileIo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Default for FsBindingFileIo {
    fn default() -> Self {
        Self::new(".")
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl BindingFileIo for FsBindingFileIo {
    fn read_json(&self, path: &str) -> LocalBoxFuture<'static, Result<Value>> {
        let path = self.resolve(path);
        async move {
            let text = tokio::fs::read_to_string(&path).await?;
            if is_yaml(&path) {
                Ok(serde_yaml::from_str(&text)?)
            } else {
                Ok(serde_json::from_str(&text)?)
            }
        }
        .boxed_local()
    }

    fn write_json(&self, path: &str, data: Value) -> LocalBoxFuture<'static, Result<()>> {
        let path = self.resolve(path);
        async move {
            let text = if is_yaml(&path) {
                serde_yaml::to_string(&data)?
            } else {
                serde_json::to_string_pretty(&data)?
            };
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(&path, text).await?;
            Ok(())
        }
        .boxed_local()
    }
}

// ═══════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════

/// One side of [`BindingRegistry::bind`]: an expression, or named expressions
/// combined into one object-valued binding.
#[derive(Debug, Clone)]
pub enum BindingRef {
    Expr(String),
    Collection(Vec<(String, String)>),
}

impl From<&str> for BindingRef {
    fn from(expr: &str) -> Self {
        BindingRef::Expr(expr.to_string())
    }
}

impl From<String> for BindingRef {
    fn from(expr: String) -> Self {
        BindingRef::Expr(expr)
    }
}

impl From<Vec<(String, String)>> for BindingRef {
    fn from(members: Vec<(String, String)>) -> Self {
        BindingRef::Collection(members)
    }
}

struct RegistryResolver<'a> {
    registry: &'a BindingRegistry,
}

impl BindResolver for RegistryResolver<'_> {
    fn bind_value(&self, name: &str, is_lookup: bool) -> Result<Option<Bind>> {
        let (model, bind_name) = self.registry.parse_model_from_binding(name)?;
        model.get_model_binding(&bind_name, is_lookup)
    }
}

pub struct BindingRegistry {
    config: EngineConfig,
    context: BindContext,
    models: RefCell<FxHashMap<String, Model>>,
    default_model: RefCell<Option<String>>,
    waiters: Rc<RefCell<FxHashMap<String, Vec<oneshot::Sender<Model>>>>>,
    expressions: ExpressionParser,
    collections: RefCell<FxHashMap<String, Rc<BinderCollection>>>,
    io: Rc<dyn BindingFileIo>,
    ready: Rc<dyn ReadyAwaiter>,
    refresh: RefCell<Option<Rc<RefreshInterval>>>,
    widgets: Rc<PropertyModel>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Registry with the `widget` property model (alias `$`) registered as default.
    pub fn with_config(config: EngineConfig) -> Self {
        let context = BindContext::new();
        let widgets = Rc::new(PropertyModel::new(WIDGET_MODEL, &context));
        let expressions =
            ExpressionParser::new(Rc::clone(&context.qualifiers), Rc::clone(&context.converter));
        let registry = Self {
            config,
            context,
            models: RefCell::new(FxHashMap::default()),
            default_model: RefCell::new(None),
            waiters: Rc::new(RefCell::new(FxHashMap::default())),
            expressions,
            collections: RefCell::new(FxHashMap::default()),
            io: Rc::new(FsBindingFileIo::default()),
            ready: Rc::new(AlwaysReady),
            refresh: RefCell::new(None),
            widgets,
        };
        registry.register_model(registry.widgets.clone(), true, Some(WIDGET_MODEL_ALIAS));
        registry
    }

    /// The `widget` property model, e.g. to attach streaming receivers.
    pub fn widgets(&self) -> &Rc<PropertyModel> {
        &self.widgets
    }

    pub fn with_file_io(mut self, io: Rc<dyn BindingFileIo>) -> Self {
        self.io = io;
        self
    }

    pub fn with_ready_awaiter(mut self, ready: Rc<dyn ReadyAwaiter>) -> Self {
        self.ready = ready;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Converter and default qualifiers to build models with.
    pub fn context(&self) -> &BindContext {
        &self.context
    }

    /// Shared refresh provider polling at the configured interval.
    pub fn refresh_provider(&self) -> Rc<RefreshInterval> {
        let mut slot = self.refresh.borrow_mut();
        let provider =
            slot.get_or_insert_with(|| RefreshInterval::new(self.config.refresh_interval_ms));
        Rc::clone(provider)
    }

    // ─────────────────────────────────────────────────────────────
    // Models
    // ─────────────────────────────────────────────────────────────

    fn add_model(&self, name: &str, model: &Model) {
        self.models
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(model));
        let waiters = self.waiters.borrow_mut().remove(name);
        if let Some(waiters) = waiters {
            info!(model = name, "Model is ready");
            for waiter in waiters {
                let _ = waiter.send(Rc::clone(model));
            }
        }
    }

    /// Register `model` under its id, and under `alias` unless that names a
    /// registered model already. The first model registered becomes the
    /// default, as does the configured default model.
    pub fn register_model(&self, model: Model, make_default: bool, alias: Option<&str>) {
        let name = model.id().to_string();
        {
            let mut default = self.default_model.borrow_mut();
            let configured = self.config.default_model.as_deref() == Some(name.as_str());
            if default.is_none() || make_default || configured {
                *default = Some(name.clone());
            }
        }
        debug!(model = %name, alias, make_default, "Registering model");
        self.add_model(&name, &model);
        if let Some(alias) = alias {
            if !self.models.borrow().contains_key(alias) {
                self.add_model(alias, &model);
            }
        }
    }

    /// Model by name; `None` asks for the default model.
    pub fn get_model(&self, name: Option<&str>) -> Option<Model> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.default_model.borrow().clone()?,
        };
        self.models.borrow().get(&name).cloned()
    }

    pub fn default_model(&self) -> Option<String> {
        self.default_model.borrow().clone()
    }

    pub fn set_default_model(&self, name: Option<&str>) {
        *self.default_model.borrow_mut() = name.map(str::to_string);
    }

    /// Resolves with the model once it is registered. `timeout` bounds the wait.
    pub fn wait_for_model_ready(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> LocalBoxFuture<'static, Result<Model>> {
        if let Some(model) = self.get_model(Some(name)) {
            return future::ready(Ok(model)).boxed_local();
        }
        let (tx, rx) = oneshot::channel();
        self.waiters
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push(tx);
        let name = name.to_string();
        let waiters = Rc::downgrade(&self.waiters);
        async move {
            let registered = match timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(registered) => registered,
                    Err(_) => {
                        // the receiver is gone; drop its sender and any other closed ones
                        if let Some(waiters) = waiters.upgrade() {
                            let mut waiters = waiters.borrow_mut();
                            if let Some(pending) = waiters.get_mut(&name) {
                                pending.retain(|tx| !tx.is_canceled());
                                if pending.is_empty() {
                                    waiters.remove(&name);
                                }
                            }
                        }
                        return Err(BindError::ModelNotReady {
                            name,
                            timeout_ms: limit.as_millis() as u64,
                        })
                    }
                },
                None => rx.await,
            };
            registered.map_err(|_| BindError::ModelNotFound { name })
        }
        .boxed_local()
    }

    /// Split the model prefix off `uri`. Unknown prefixes fall back to the
    /// default model with the whole `uri` as binding name.
    pub fn parse_model_from_binding(&self, uri: &str) -> Result<(Model, String)> {
        let mut model = None;
        let mut bind_name = uri;
        if let Some(mut pos) = uri.find('.').filter(|pos| *pos > 0) {
            let mut model_name = &uri[..pos];
            if model_name == WIDGET_MODEL || model_name == WIDGET_MODEL_ALIAS {
                if let Some(end) = uri[pos + 1..].find('.').map(|end| end + pos + 1) {
                    let widget_model = &uri[pos + 1..end];
                    if self.get_model(Some(widget_model)).is_some() {
                        model_name = widget_model;
                        pos = end;
                    }
                }
            }
            model = self.get_model(Some(model_name));
            if model.is_some() {
                bind_name = &uri[pos + 1..];
            }
        }
        let model = model
            .or_else(|| self.get_model(None))
            .ok_or(BindError::NoDefaultModel)?;
        Ok((model, bind_name.to_string()))
    }

    // ─────────────────────────────────────────────────────────────
    // Bindings
    // ─────────────────────────────────────────────────────────────

    /// Parse a binding expression. `Ok(None)` when a name resolves to nothing.
    pub fn get_binding(&self, expression: &str) -> Result<Option<Bind>> {
        let resolver = RegistryResolver { registry: self };
        self.expressions.parse_expression(expression, &resolver)
    }

    /// Like [`get_binding`](Self::get_binding), but failures come back as a
    /// constant binding carrying an error status, for display.
    pub fn get_binding_or_status(&self, expression: &str) -> Bind {
        let err = match self.get_binding(expression) {
            Ok(Some(bind)) => return bind,
            Ok(None) => BindError::BindingNotFound {
                name: expression.to_string(),
            },
            Err(err) => err,
        };
        let constant = ConstantBindValue::with_status(Status::from(&err));
        constant.set_name(expression);
        constant
    }

    fn create_binding_collection(&self, binding: &BindingRef) -> Result<Bind> {
        let resolve = |expr: &str| -> Result<Bind> {
            match self.get_binding(expr) {
                Ok(Some(bind)) => Ok(bind),
                Ok(None) => Err(BindError::syntax(format!(
                    "Binding \"{expr}\" could not be found."
                ))),
                Err(err) => Err(BindError::syntax(format!(
                    "Can't parse binding \"{expr}\".\n{}",
                    err.plain_message()
                ))),
            }
        };
        match binding {
            BindingRef::Expr(expr) => resolve(expr),
            BindingRef::Collection(members) => {
                let members = members
                    .iter()
                    .map(|(name, expr)| Ok((name.clone(), resolve(expr)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(CollectionBindValue::new(members, Rc::clone(&self.context.converter)) as Bind)
            }
        }
    }

    /// Bind `target` to `model`. On failure the error is set as status on
    /// whichever side could be created and a disabled null binder is returned.
    pub fn bind(
        &self,
        target: impl Into<BindingRef>,
        model: impl Into<BindingRef>,
        getter: Option<ComputeFn>,
        setter: Option<ComputeFn>,
    ) -> Rc<dyn Binder> {
        let target = target.into();
        let model = model.into();
        let target_bind = match self.create_binding_collection(&target) {
            Ok(bind) => bind,
            Err(err) => {
                error!(target_ref = ?target, model_ref = ?model, error = %err.plain_message(), "Failed to bind");
                if let Ok(model_bind) = self.create_binding_collection(&model) {
                    model_bind.set_status(Some(Status::from(&err)));
                }
                return Rc::new(NullBinder);
            }
        };
        let model_bind = match self.create_binding_collection(&model) {
            Ok(bind) => bind,
            Err(err) => {
                error!(target_ref = ?target, model_ref = ?model, error = %err.plain_message(), "Failed to bind");
                target_bind.set_status(Some(Status::from(&err)));
                return Rc::new(NullBinder);
            }
        };
        Rc::new(DataBinder::new(
            target_bind,
            model_bind,
            getter,
            setter,
            false,
            Rc::clone(&self.context.converter),
        ))
    }

    pub fn unbind(&self, binder: &dyn Binder) {
        binder.set_enabled(false);
    }

    // ─────────────────────────────────────────────────────────────
    // Binding files
    // ─────────────────────────────────────────────────────────────

    /// Model id a binding file entry depends on, if any.
    async fn model_for_entry(&self, server_bind_name: &str) -> Option<String> {
        let mut segments = server_bind_name.split('.');
        let first = segments.next()?;
        let second = segments.next()?;
        if first == WIDGET_MODEL || first == WIDGET_MODEL_ALIAS {
            self.ready.when_ready(second).await;
            if self.get_model(Some(second)).is_some() {
                return Some(second.to_string());
            }
        }
        Some(first.to_string())
    }

    async fn load_binding(&self, entry: &WidgetBinding, file: &str) -> Option<Rc<dyn Binder>> {
        if !entry.widget_id.is_empty() {
            self.ready.when_ready(&entry.widget_id).await;
        }
        if let Some(model_id) = self.model_for_entry(&entry.server_bind_name).await {
            let ready = self.wait_for_model_ready(&model_id, Some(self.config.connect_timeout()));
            if let Err(err) = ready.await {
                error!(
                    binding = %entry.server_bind_name,
                    "{} for binding {}.", err.plain_message(), entry.server_bind_name
                );
            }
        }

        let widget_bind_name = format!("{WIDGET_MODEL}.{}.{}", entry.widget_id, entry.property_name);
        let options = entry.options.clone().unwrap_or_default();
        if let Some(data_type) = &options.data_type {
            match self.get_binding(&widget_bind_name) {
                Ok(Some(bind)) => bind.set_default_type(normalize_data_type(data_type)),
                _ => error!(
                    "Cannot set default type on binding \"{widget_bind_name}\" because it does not exist."
                ),
            }
        }

        match options.default_value {
            Some(default) if entry.widget_id.is_empty() && !entry.server_bind_name.is_empty() => {
                match self.get_binding(&entry.server_bind_name) {
                    Ok(Some(bind)) => bind.set_value(default, &Progress::null(), false),
                    _ => error!(
                        "Cannot set default binding value because the binding \"{}\" does not exist.",
                        entry.server_bind_name
                    ),
                }
                None
            }
            _ => {
                debug!(file, widget = %widget_bind_name, model = %entry.server_bind_name, "Binding");
                Some(self.bind(widget_bind_name.as_str(), entry.server_bind_name.as_str(), None, None))
            }
        }
    }

    /// Load (or re-enable) the bindings of a binding file. Failures are logged
    /// and give a null binder.
    pub async fn load_bindings_from_file(&self, file: Option<&str>) -> Rc<dyn Binder> {
        let file = file.unwrap_or(DEFAULT_BINDING_FILE);
        let existing = self.collections.borrow().get(file).cloned();
        if let Some(collection) = existing {
            collection.set_enabled(true);
            return collection;
        }

        let data = self.io.read_json(file).await;
        let parsed = data.and_then(|data| BindingFile::from_value(file, data));
        let bindings = match parsed {
            Ok(bindings) => bindings,
            Err(err) => {
                error!(file, error = %err, "Failed to load binding file");
                return Rc::new(NullBinder);
            }
        };

        let collection = Rc::new(BinderCollection::new());
        self.collections
            .borrow_mut()
            .insert(file.to_string(), Rc::clone(&collection));
        let binders = future::join_all(
            bindings
                .widget_bindings
                .iter()
                .map(|entry| self.load_binding(entry, file)),
        )
        .await;
        for binder in binders.into_iter().flatten() {
            collection.add(binder);
        }
        info!(file, binders = collection.len(), "Loaded binding file");
        collection.set_enabled(true);
        collection
    }

    pub fn unload_bindings_from_file(&self, file: Option<&str>) {
        let file = file.unwrap_or(DEFAULT_BINDING_FILE);
        if let Some(collection) = self.collections.borrow().get(file) {
            collection.set_enabled(false);
        }
    }

    pub async fn save_bindings_to_file(&self, file: Option<&str>, bindings: &[WidgetBinding]) -> Result<()> {
        let file = file.unwrap_or(DEFAULT_BINDING_FILE);
        let document = serde_json::to_value(BindingFile {
            widget_bindings: bindings.to_vec(),
        })?;
        self.io.write_json(file, document).await
    }

    /// Dispose every model and forget all state.
    pub fn dispose(&self) {
        let collections: Vec<Rc<BinderCollection>> =
            self.collections.borrow_mut().drain().map(|(_, c)| c).collect();
        for collection in collections {
            collection.dispose();
        }
        let models: Vec<(String, Model)> = self.models.borrow_mut().drain().collect();
        for (name, model) in models {
            // aliases share the instance
            if name == model.id() {
                model.dispose();
            }
        }
        self.waiters.borrow_mut().clear();
        *self.default_model.borrow_mut() = None;
        if let Some(refresh) = self.refresh.borrow_mut().take() {
            refresh.dispose();
        }
        self.expressions.dispose();
    }
}

impl Default for BindingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut models: Vec<String> = self.models.borrow().keys().cloned().collect();
        models.sort();
        f.debug_struct("BindingRegistry")
            .field("models", &models)
            .field("default_model", &self.default_model.borrow())
            .field("binding_files", &self.collections.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_model::JsonModel;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::task::LocalSet;

    fn registry_with_plant() -> (BindingRegistry, Rc<JsonModel>) {
        let registry = BindingRegistry::new();
        let plant = Rc::new(JsonModel::new(
            "plant",
            json!({"speed": 10, "limits": [5, 50]}),
            registry.context(),
        ));
        plant.connect();
        registry.register_model(plant.clone(), false, None);
        (registry, plant)
    }

    #[test]
    fn first_model_is_default() {
        let registry = BindingRegistry::new();
        assert_eq!(registry.default_model().as_deref(), Some(WIDGET_MODEL));
        let (registry, _) = registry_with_plant();
        assert_eq!(registry.default_model().as_deref(), Some(WIDGET_MODEL));
    }

    #[test]
    fn parses_model_prefixes() {
        let (registry, _) = registry_with_plant();
        let (model, name) = registry.parse_model_from_binding("plant.speed").unwrap();
        assert_eq!((model.id(), name.as_str()), ("plant", "speed"));

        let (model, name) = registry.parse_model_from_binding("$.plant.speed").unwrap();
        assert_eq!((model.id(), name.as_str()), ("plant", "speed"));

        let (model, name) = registry.parse_model_from_binding("widget.gauge.value").unwrap();
        assert_eq!((model.id(), name.as_str()), ("widget", "gauge.value"));

        let (model, name) = registry.parse_model_from_binding("other.thing").unwrap();
        assert_eq!((model.id(), name.as_str()), ("widget", "other.thing"));
    }

    #[test]
    fn alias_does_not_shadow_model() {
        let (registry, plant) = registry_with_plant();
        registry.register_model(plant, false, Some(WIDGET_MODEL));
        assert_eq!(
            registry.get_model(Some(WIDGET_MODEL)).map(|m| m.id().to_string()),
            Some(WIDGET_MODEL.to_string())
        );
    }

    #[test]
    fn no_default_model_is_an_error() {
        let registry = BindingRegistry::new();
        registry.set_default_model(None);
        assert!(matches!(
            registry.parse_model_from_binding("speed"),
            Err(BindError::NoDefaultModel)
        ));
    }

    #[test]
    fn parse_errors_become_status() {
        let registry = BindingRegistry::new();
        let bind = registry.get_binding_or_status("a +");
        assert_eq!(bind.value(), Value::Null);
        assert!(bind.status().is_some_and(|status| status.is_error()));
    }

    #[test]
    fn widget_to_widget_binding() {
        let registry = BindingRegistry::new();
        let source = registry.get_binding("widget.slider.value").unwrap().unwrap();
        source.set_value(json!(4), &Progress::null(), false);
        let binder = registry.bind("widget.label.text", "widget.slider.value * 2", None, None);
        assert!(binder.is_enabled());
        let label = registry.get_binding("widget.label.text").unwrap().unwrap();
        assert_eq!(label.value(), json!(8));

        source.set_value(json!(5), &Progress::null(), false);
        assert_eq!(label.value(), json!(10));

        label.set_value(json!(20), &Progress::null(), false);
        assert_eq!(source.value(), json!(10));
    }

    #[test]
    fn failed_bind_sets_status_on_target() {
        let registry = BindingRegistry::new();
        let binder = registry.bind("widget.label.text", "1 +", None, None);
        assert!(!binder.is_enabled());
        let label = registry.get_binding("widget.label.text").unwrap().unwrap();
        let status = label.status().expect("error status");
        assert!(status.message.starts_with("Can't parse binding \"1 +\"."));
    }

    #[test]
    fn collections_bind_objects() {
        let registry = BindingRegistry::new();
        let x = registry.get_binding("widget.pos.x").unwrap().unwrap();
        x.set_value(json!(1), &Progress::null(), false);
        let binder = registry.bind(
            "widget.view.pos",
            vec![("x".to_string(), "widget.pos.x".to_string())],
            None,
            None,
        );
        assert!(binder.is_enabled());
        let view = registry.get_binding("widget.view.pos").unwrap().unwrap();
        assert_eq!(view.value(), json!({"x": 1}));
    }

    #[tokio::test]
    async fn waits_for_late_models() {
        LocalSet::new()
            .run_until(async {
                let registry = BindingRegistry::new();
                let pending = registry.wait_for_model_ready("late", None);
                let plant = JsonModel::new("late", json!({}), registry.context());
                registry.register_model(Rc::new(plant), false, None);
                let model = pending.await.unwrap();
                assert_eq!(model.id(), "late");
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_model_times_out() {
        let registry = BindingRegistry::new();
        let err = registry
            .wait_for_model_ready("never", Some(Duration::from_millis(50)))
            .await
            .err()
            .expect("should time out");
        assert_eq!(err.plain_message(), "Model 'never' was not ready within 50ms");
        assert!(registry.waiters.borrow().is_empty());
    }

    #[test]
    fn data_types_normalize_to_number() {
        assert_eq!(normalize_data_type("Double"), ValueType::Number);
        assert_eq!(normalize_data_type("string"), ValueType::String);
    }

    #[test]
    fn binding_file_shape() {
        let file = BindingFile::from_value(
            "index.json",
            json!({"widgetBindings": [
                {"widgetId": "gauge", "propertyName": "value", "serverBindName": "plant.speed"},
                {"serverBindName": "plant.speed", "options": {"defaultValue": 3}}
            ]}),
        )
        .unwrap();
        assert_eq!(file.widget_bindings.len(), 2);
        assert_eq!(file.widget_bindings[0].widget_id, "gauge");
        assert_eq!(
            file.widget_bindings[1].options.as_ref().and_then(|o| o.default_value.clone()),
            Some(json!(3))
        );

        let err = BindingFile::from_value("bad.json", json!({"widgetBindings": 3})).unwrap_err();
        assert!(matches!(err, BindError::InvalidBindingFile { .. }));
    }

    #[test]
    fn dispose_forgets_models() {
        let (registry, _) = registry_with_plant();
        registry.dispose();
        assert!(registry.get_model(Some("plant")).is_none());
        assert!(registry.default_model().is_none());
    }
}
