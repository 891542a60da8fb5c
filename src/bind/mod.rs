//! Bind values (v0.1)
//!
//! A bind value is a cached, possibly asynchronously backed value with status,
//! staleness and deferred-write metadata. The contract is split into:
//! - `BindValue`: the valued + deferrable core every binding implements
//! - `Lookupable`, `Refreshable`, `StreamingSink`, `Disconnectable`, `Qualifiable`:
//!   optional capabilities reached through the `as_*()` accessors
//!
//! Concrete bindings keep their common state in a [`BindCore`].

mod async_value;
mod base;
mod collection;
mod lookup;
mod machine;
mod reference;
mod refresh;
mod variable;

use std::rc::Rc;

use futures::future::LocalBoxFuture;
use serde_json::Value;

use crate::events::{EventKind, Listener};
use crate::progress::Progress;
use crate::status::Status;
use crate::value::ValueType;

pub use async_value::{AsyncBindValue, Target};
pub use base::{BindCore, StatusSlot, ValueChange};
pub use collection::CollectionBindValue;
pub use lookup::{
    assert_not_null, assert_valid_array_index, assert_valid_data, assert_valid_field_name,
    LookupIndex,
};
pub use machine::{Action, Capabilities, Context, MachineEvent, Qualifier, State, StateMachine};
pub use reference::ReferenceBindValue;
pub use refresh::{RefreshInterval, RefreshListener, DEFAULT_REFRESH_INTERVAL_MS};
pub use variable::{ConstantBindValue, StreamingFn, VariableBindValue};

/// Shared handle to any binding
pub type Bind = Rc<dyn BindValue>;

/// The value contract every binding implements.
pub trait BindValue {
    /// Binding name (the URI it was created for), used in messages.
    fn name(&self) -> String;
    fn set_name(&self, name: &str);

    fn value(&self) -> Value;
    /// Set a new local value. Writes through to the target unless unchanged and
    /// `force` is false.
    fn set_value(&self, value: Value, progress: &Progress, force: bool);
    /// Commit an externally observed value without triggering a write.
    fn update_value(&self, value: Value, progress: &Progress, skip_streaming: bool);
    fn value_type(&self) -> Option<ValueType>;
    /// Type to assume until the binding has one of its own.
    fn set_default_type(&self, _value_type: ValueType) {}
    fn is_read_only(&self) -> bool;
    fn is_stale(&self) -> bool;

    fn status(&self) -> Option<Status>;
    fn set_status(&self, status: Option<Status>);

    fn set_deferred_mode(&self, deferred: bool, progress: &Progress, force: bool);
    fn is_deferred_mode(&self) -> bool;
    fn committed_value(&self) -> Value;
    fn clear_deferred_write(&self);
    fn is_deferred_write_pending(&self) -> bool;

    fn add_listener(&self, kind: EventKind, listener: Listener);
    fn remove_listener(&self, kind: EventKind, listener: &Listener);

    fn as_lookup(&self) -> Option<&dyn Lookupable> {
        None
    }

    fn as_refreshable(&self) -> Option<&dyn Refreshable> {
        None
    }

    fn as_streaming_sink(&self) -> Option<&dyn StreamingSink> {
        None
    }

    fn as_disconnectable(&self) -> Option<&dyn Disconnectable> {
        None
    }

    fn as_qualifiable(&self) -> Option<&dyn Qualifiable> {
        None
    }

    /// Bindings that storage providers must not persist.
    fn exclude_from_storage(&self) -> bool {
        false
    }

    /// Detach from operands and providers.
    fn dispose(&self) {}
}

/// Bindings parameterized by runtime index values.
pub trait Lookupable {
    /// Store a new index tuple; only reacts when a component changed.
    fn set_index(&self, indices: &[Value]);
    fn index(&self) -> Vec<Value>;
    /// Kind of lookup this binding supports, for operator validation.
    fn lookup_kind(&self) -> LookupKind {
        LookupKind::Array
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Array,
    Object,
    Function,
}

impl LookupKind {
    pub fn article(&self) -> &'static str {
        match self {
            LookupKind::Array => "an array",
            LookupKind::Object => "an object",
            LookupKind::Function => "a function",
        }
    }
}

/// Bindings that can be re-read from their target.
pub trait Refreshable {
    /// Re-read the target. Resolves when the binding has settled.
    fn refresh(&self, progress: &Progress, force: bool) -> LocalBoxFuture<'static, ()>;
    fn is_refreshable(&self) -> bool;
}

/// Destinations that want every received value, equal or not.
pub trait StreamingSink {
    fn on_streaming_data_received(&self, data: Value);
}

/// Bindings that react to their model losing the target connection.
pub trait Disconnectable {
    fn on_disconnected(&self);
}

/// Bindings whose read/write capabilities can be restricted by qualifiers.
pub trait Qualifiable {
    fn set_qualifier(&self, qualifier: Qualifier);
}
