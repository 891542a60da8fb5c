//! Binding factories (v0.1)
//!
//! A model is a namespace of bindings (`model.path.$qualifier`). Each model
//! implements [`BindFactory`]: it only has to create a binding for an unknown
//! name, the provided methods handle memoization, qualifiers, the connected
//! state and model-specific expressions.
//!
//! Every model also owns two special bindings:
//! - `$target_connected`: read-only boolean that follows the connection state
//! - `this`: variable used by getter/setter expressions in
//!   [`BindFactory::get_converted_value`]

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::bind::{Bind, BindValue, VariableBindValue};
use crate::converter::DataConverter;
use crate::error::{BindError, Result};
use crate::parser::{BindResolver, ExpressionParser};
use crate::progress::Progress;
use crate::qualifier::QualifierFactoryMap;
use crate::script_log::{NoopEmitter, ScriptLogEmitter};

pub const TARGET_CONNECTED_BINDNAME: &str = "$target_connected";
pub const THIS_BINDNAME: &str = "this";

/// Shared converter and default qualifiers, handed to every model of a registry.
#[derive(Clone)]
pub struct BindContext {
    pub converter: Rc<DataConverter>,
    pub qualifiers: Rc<QualifierFactoryMap>,
}

impl BindContext {
    pub fn new() -> Self {
        let converter = Rc::new(DataConverter::new());
        let qualifiers = Rc::new(QualifierFactoryMap::with_defaults(&converter));
        Self {
            converter,
            qualifiers,
        }
    }
}

impl Default for BindContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BindContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindContext")
            .field("qualifiers", &self.qualifiers.names())
            .finish()
    }
}

/// State shared by every model.
pub struct BindFactoryCore {
    id: String,
    bindings: RefCell<FxHashMap<String, Bind>>,
    qualifiers: Rc<QualifierFactoryMap>,
    converter: Rc<DataConverter>,
    connected: Rc<VariableBindValue>,
    /// Flips to true on the first connect and stays there
    ever_connected: watch::Sender<bool>,
    this: Rc<VariableBindValue>,
    expressions: RefCell<Option<Rc<ExpressionParser>>>,
    emitter: RefCell<Rc<dyn ScriptLogEmitter>>,
}

impl BindFactoryCore {
    pub fn new(id: impl Into<String>, context: &BindContext) -> Self {
        let connected = VariableBindValue::new(Value::Bool(false));
        connected.set_read_only(true);
        connected.set_name(TARGET_CONNECTED_BINDNAME);
        let this = VariableBindValue::new(Value::Null);
        this.set_name(THIS_BINDNAME);

        let mut bindings: FxHashMap<String, Bind> = FxHashMap::default();
        bindings.insert(TARGET_CONNECTED_BINDNAME.to_string(), connected.clone());

        let (ever_connected, _) = watch::channel(false);
        Self {
            id: id.into(),
            bindings: RefCell::new(bindings),
            qualifiers: Rc::new(QualifierFactoryMap::with_parent(Rc::clone(&context.qualifiers))),
            converter: Rc::clone(&context.converter),
            connected,
            ever_connected,
            this,
            expressions: RefCell::new(None),
            emitter: RefCell::new(Rc::new(NoopEmitter)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn qualifiers(&self) -> &Rc<QualifierFactoryMap> {
        &self.qualifiers
    }

    pub fn converter(&self) -> &Rc<DataConverter> {
        &self.converter
    }

    pub fn emitter(&self) -> Rc<dyn ScriptLogEmitter> {
        Rc::clone(&self.emitter.borrow())
    }

    pub fn set_emitter(&self, emitter: Rc<dyn ScriptLogEmitter>) {
        *self.emitter.borrow_mut() = emitter;
    }

    fn cached(&self, name: &str) -> Option<Bind> {
        self.bindings.borrow().get(name).cloned()
    }

    fn remember(&self, name: &str, bind: &Bind) {
        self.bindings
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(bind));
    }

    fn expression_parser(&self) -> Rc<ExpressionParser> {
        let mut slot = self.expressions.borrow_mut();
        let parser = slot.get_or_insert_with(|| {
            Rc::new(ExpressionParser::new(
                Rc::clone(&self.qualifiers),
                Rc::clone(&self.converter),
            ))
        });
        Rc::clone(parser)
    }
}

impl fmt::Debug for BindFactoryCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindFactoryCore")
            .field("id", &self.id)
            .field("bindings", &self.bindings.borrow().len())
            .field("connected", &self.connected.value())
            .finish()
    }
}

/// Resolves identifiers of model-specific expressions: `this` plus the
/// model's own bindings, without a model prefix.
struct ModelResolver<'a, F: ?Sized> {
    factory: &'a F,
}

impl<F: BindFactory + ?Sized> BindResolver for ModelResolver<'_, F> {
    fn bind_value(&self, name: &str, is_lookup: bool) -> Result<Option<Bind>> {
        if name == THIS_BINDNAME {
            return Ok(Some(self.factory.core().this.clone() as Bind));
        }
        self.factory.get_model_binding(name, is_lookup)
    }
}

/// A model: a named namespace of bindings.
pub trait BindFactory {
    fn core(&self) -> &BindFactoryCore;

    /// Create the binding for `name` (qualifiers already stripped). `Ok(None)`
    /// when the model has no such binding.
    fn create_new_bind(&self, name: &str) -> Result<Option<Bind>>;

    fn id(&self) -> &str {
        self.core().id()
    }

    /// Memoized binding for `name`, with `.$qualifier` suffixes applied.
    fn get_binding(&self, name: &str) -> Result<Option<Bind>> {
        self.get_model_binding(name, false)
    }

    /// Like [`get_binding`](Self::get_binding); `is_lookup` asks for a fresh,
    /// unshared instance that a lookup operator may index.
    fn get_model_binding(&self, name: &str, is_lookup: bool) -> Result<Option<Bind>> {
        let core = self.core();
        if !is_lookup {
            if let Some(bind) = core.cached(name) {
                return Ok(Some(bind));
            }
        }
        let qualifiers = Rc::clone(core.qualifiers());
        let mut base = |base_name: &str| -> Result<Option<Bind>> {
            if !is_lookup {
                if let Some(bind) = core.cached(base_name) {
                    return Ok(Some(bind));
                }
            }
            let created = self.create_new_bind(base_name)?;
            if let Some(bind) = &created {
                bind.set_name(base_name);
                if !is_lookup {
                    debug!(model = %core.id(), name = base_name, "Created binding");
                    core.remember(base_name, bind);
                }
            }
            Ok(created)
        };
        let bind = qualifiers.resolve(name, &mut base)?;
        if let Some(bind) = &bind {
            if bind.name().is_empty() {
                bind.set_name(name);
            }
            if !is_lookup {
                core.remember(name, bind);
            }
        }
        Ok(bind)
    }

    fn has_binding(&self, name: &str) -> bool {
        self.core().bindings.borrow().contains_key(name)
    }

    /// Every binding created so far, sorted by name.
    fn all_bindings(&self) -> Vec<(String, Bind)> {
        let mut bindings: Vec<(String, Bind)> = self
            .core()
            .bindings
            .borrow()
            .iter()
            .map(|(name, bind)| (name.clone(), Rc::clone(bind)))
            .collect();
        bindings.sort_by(|a, b| a.0.cmp(&b.0));
        bindings
    }

    /// Register a model-specific qualifier; it shadows a default of the same name.
    fn add_qualifier(&self, name: &str, factory: impl Fn(Bind, Option<u32>) -> Result<Bind> + 'static)
    where
        Self: Sized,
    {
        self.core().qualifiers.add(name, factory);
    }

    fn set_connected_state(&self, connected: bool) {
        let core = self.core();
        core.connected
            .update_value(Value::Bool(connected), &Progress::null(), false);
        if connected {
            core.ever_connected.send_replace(true);
        }
    }

    fn is_connected(&self) -> bool {
        self.core().connected.value() == Value::Bool(true)
    }

    /// Resolves on the first connect. Later disconnects do not reset it.
    fn when_connected(&self) -> LocalBoxFuture<'static, ()> {
        let mut rx = self.core().ever_connected.subscribe();
        async move {
            // the sender lives as long as the model; a dropped model never connects
            if rx.wait_for(|connected| *connected).await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
        .boxed_local()
    }

    fn on_connect(&self) {
        info!(model = %self.id(), "Model connected");
        self.set_connected_state(true);
    }

    /// Mark the model disconnected and let every binding recover from errors.
    fn on_disconnect(&self) {
        info!(model = %self.id(), "Model disconnected");
        self.set_connected_state(false);
        for (_, bind) in self.all_bindings() {
            if let Some(target) = bind.as_disconnectable() {
                target.on_disconnected();
            }
        }
    }

    fn script_read(&self, uri: &str) -> Result<Value> {
        match self.get_binding(uri)? {
            Some(bind) => Ok(bind.value()),
            None => Err(BindError::target(format!(
                "Failed to read value since bind \"{uri}\" does not exist."
            ))),
        }
    }

    /// Force-write `value` and resolve once every resulting write completed.
    fn script_write(&self, uri: &str, value: Value) -> LocalBoxFuture<'static, Result<()>> {
        let bind = match self.get_binding(uri) {
            Ok(Some(bind)) => bind,
            Ok(None) => {
                let err = BindError::target(format!(
                    "Failed to write value since bind \"{uri}\" does not exist."
                ));
                return futures::future::ready(Err(err)).boxed_local();
            }
            Err(err) => return futures::future::ready(Err(err)).boxed_local(),
        };
        let progress = Progress::new();
        bind.set_value(value, &progress, true);
        progress.done(1);
        let finished = progress.finished();
        async move {
            finished.await;
            Ok(())
        }
        .boxed_local()
    }

    /// Parse an expression over this model's bindings (no model prefix) and `this`.
    fn parse_model_specific_expression(&self, expression: &str) -> Result<Option<Bind>> {
        let parser = self.core().expression_parser();
        let resolver = ModelResolver { factory: self };
        parser.parse_expression(expression, &resolver)
    }

    fn clear_model_specific_expressions(&self) {
        if let Some(parser) = self.core().expressions.borrow_mut().take() {
            parser.dispose();
        }
    }

    /// Run `value` through a getter expression, or solve a setter expression
    /// for `this`. Without either the value is returned unchanged.
    fn get_converted_value(&self, value: Value, getter: Option<&str>, setter: Option<&str>) -> Result<Value> {
        let this = Rc::clone(&self.core().this);
        if let Some(getter) = getter {
            let expr = self.parse_model_specific_expression(getter)?;
            this.set_value(value, &Progress::null(), false);
            return Ok(expr.map_or(Value::Null, |expr| expr.value()));
        }
        if let Some(setter) = setter {
            let Some(expr) = self.parse_model_specific_expression(setter)? else {
                return Ok(Value::Null);
            };
            this.set_value(Value::Null, &Progress::null(), false);
            expr.set_value(value, &Progress::null(), false);
            return Ok(this.value());
        }
        Ok(value)
    }

    fn dispose(&self) {
        self.clear_model_specific_expressions();
        let bindings: Vec<Bind> = self
            .core()
            .bindings
            .borrow_mut()
            .drain()
            .map(|(_, bind)| bind)
            .collect();
        for bind in bindings {
            bind.dispose();
        }
    }
}
