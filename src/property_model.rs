//! In-memory property model
//!
//! Every name is a settable variable, created null on first use. The registry
//! registers one as `widget` (alias `$`) for the `widget.<id>.<property>`
//! bindings of binding files.
//!
//! A property with a streaming receiver is a streaming sink: binders hand it
//! every value their source receives, the way a chart takes every sample.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::bind::{Bind, StreamingFn, VariableBindValue};
use crate::error::Result;
use crate::factory::{BindContext, BindFactory, BindFactoryCore};

pub struct PropertyModel {
    core: BindFactoryCore,
    properties: RefCell<FxHashMap<String, Rc<VariableBindValue>>>,
    receivers: RefCell<FxHashMap<String, StreamingFn>>,
}

impl PropertyModel {
    /// A property model is always connected.
    pub fn new(id: impl Into<String>, context: &BindContext) -> Self {
        let model = Self {
            core: BindFactoryCore::new(id, context),
            properties: RefCell::new(FxHashMap::default()),
            receivers: RefCell::new(FxHashMap::default()),
        };
        model.set_connected_state(true);
        model
    }

    /// Route streamed values for property `name` to `receiver`. Takes effect for
    /// binders created afterwards.
    pub fn set_streaming_receiver(&self, name: &str, receiver: StreamingFn) {
        if let Some(property) = self.properties.borrow().get(name) {
            property.set_streaming_receiver(Some(Rc::clone(&receiver)));
        }
        self.receivers.borrow_mut().insert(name.to_string(), receiver);
    }

    pub fn clear_streaming_receiver(&self, name: &str) {
        if let Some(property) = self.properties.borrow().get(name) {
            property.set_streaming_receiver(None);
        }
        self.receivers.borrow_mut().remove(name);
    }
}

impl BindFactory for PropertyModel {
    fn core(&self) -> &BindFactoryCore {
        &self.core
    }

    fn create_new_bind(&self, name: &str) -> Result<Option<Bind>> {
        let property = VariableBindValue::new(Value::Null);
        property.set_streaming_receiver(self.receivers.borrow().get(name).cloned());
        self.properties
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&property));
        Ok(Some(property as Bind))
    }
}

impl fmt::Debug for PropertyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let receivers = self.receivers.borrow();
        let mut streaming: Vec<&String> = receivers.keys().collect();
        streaming.sort();
        f.debug_struct("PropertyModel")
            .field("core", &self.core)
            .field("streaming", &streaming)
            .finish()
    }
}
