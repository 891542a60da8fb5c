//! databind - asynchronous data-binding engine
//!
//! Bindings are cached values backed by models (devices, documents, widget
//! properties). Binding expressions combine them with operators, lookups and
//! qualifiers; binders keep two bindings in sync.
//!
//! Everything is single-threaded: bindings are `Rc` handles and target reads
//! and writes run on a `tokio::task::LocalSet`.

pub mod bind;
pub mod binder;
pub mod config;
pub mod converter;
pub mod error;
pub mod events;
pub mod factory;
pub mod json_model;
pub mod parser;
pub mod progress;
pub mod property_model;
pub mod qualifier;
pub mod registry;
pub mod script_log;
pub mod status;
pub mod storage;
pub mod trigger;
pub mod value;

pub use bind::{AsyncBindValue, Bind, BindValue, ConstantBindValue, Target, VariableBindValue};
pub use binder::{Binder, BinderCollection, DataBinder};
pub use config::EngineConfig;
pub use converter::DataConverter;
pub use error::{BindError, FixSuggestion, Result};
pub use events::{BindEvent, EventKind};
pub use factory::{BindContext, BindFactory, BindFactoryCore};
pub use json_model::JsonModel;
pub use progress::Progress;
pub use property_model::PropertyModel;
pub use registry::{BindingFile, BindingRegistry, WidgetBinding};
pub use status::{Status, StatusKind};
pub use storage::DataStorageProvider;
pub use trigger::Trigger;
