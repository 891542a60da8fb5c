//! Data binders: keep a target binding in sync with a model binding
//!
//! A [`DataBinder`] owns one or two sync directions. Each direction listens to
//! its source binding and pushes converted values and status into its
//! destination:
//! - destinations that accept streaming data get every value the source sees
//! - everything else gets value changes, held back while the source is stale
//!   and skipped when the destination already holds an equivalent value

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::{debug, error};

use crate::bind::Bind;
use crate::converter::DataConverter;
use crate::events::{listener, BindEvent, EventKind, Listener};
use crate::progress::Progress;
use crate::value;

/// Transform applied to values flowing through a binder (a getter or setter).
pub type ComputeFn = Rc<dyn Fn(Value) -> Value>;

/// Anything that can be switched on and off like a binder.
pub trait Binder {
    fn set_enabled(&self, enable: bool);
    fn is_enabled(&self) -> bool;

    fn dispose(&self) {
        self.set_enabled(false);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncMode {
    Streaming,
    ValueChanged,
}

/// One direction of a binder: `src` to `dest`.
struct SyncDirection {
    src: Bind,
    dest: Bind,
    compute: Option<ComputeFn>,
    converter: Rc<DataConverter>,
    mode: SyncMode,
    on_status: Listener,
    on_data: Listener,
    on_stale: Listener,
    /// `on_stale` is registered on `src`
    waiting: Cell<bool>,
}

impl SyncDirection {
    fn new(src: Bind, dest: Bind, compute: Option<ComputeFn>, converter: Rc<DataConverter>) -> Rc<Self> {
        let mode = if dest.as_streaming_sink().is_some() {
            SyncMode::Streaming
        } else {
            SyncMode::ValueChanged
        };
        Rc::new_cyclic(|weak: &Weak<Self>| {
            let status = weak.clone();
            let data = weak.clone();
            let stale = weak.clone();
            Self {
                src,
                dest,
                compute,
                converter,
                mode,
                on_status: listener(move |_| {
                    if let Some(sync) = status.upgrade() {
                        sync.sync_status();
                    }
                }),
                on_data: listener(move |event| {
                    let Some(sync) = data.upgrade() else {
                        return;
                    };
                    match event {
                        BindEvent::ValueChanged { progress, .. } => sync.sync_value(progress),
                        BindEvent::StreamingData { data } => sync.forward_streaming(data.clone()),
                        _ => {}
                    }
                }),
                on_stale: listener(move |_| {
                    if let Some(sync) = stale.upgrade() {
                        sync.on_stale_changed();
                    }
                }),
                waiting: Cell::new(false),
            }
        })
    }

    fn data_kind(&self) -> EventKind {
        match self.mode {
            SyncMode::Streaming => EventKind::StreamingData,
            SyncMode::ValueChanged => EventKind::ValueChanged,
        }
    }

    fn enable(&self) {
        self.src
            .add_listener(EventKind::StatusChanged, Rc::clone(&self.on_status));
        self.src.add_listener(self.data_kind(), Rc::clone(&self.on_data));
    }

    fn disable(&self) {
        self.src.remove_listener(EventKind::StatusChanged, &self.on_status);
        self.src.remove_listener(self.data_kind(), &self.on_data);
        if self.waiting.replace(false) {
            self.src.remove_listener(EventKind::StaleChanged, &self.on_stale);
        }
    }

    fn sync_status(&self) {
        self.dest.set_status(self.src.status());
    }

    /// Source value after the compute function. A computed value has no
    /// declared type.
    fn source_value(&self, value: Value) -> (Value, Option<crate::value::ValueType>) {
        match &self.compute {
            Some(compute) => (compute(value), None),
            None => (value, self.src.value_type()),
        }
    }

    fn forward_streaming(&self, data: Value) {
        let (value, src_type) = self.source_value(data);
        let value = self
            .converter
            .convert(&value, src_type.as_ref(), self.dest.value_type().as_ref(), None);
        if let Some(sink) = self.dest.as_streaming_sink() {
            sink.on_streaming_data_received(value);
        }
    }

    fn sync_value(&self, progress: &Progress) {
        if self.mode == SyncMode::Streaming {
            return;
        }
        if self.src.is_stale() {
            if !self.waiting.replace(true) {
                self.src
                    .add_listener(EventKind::StaleChanged, Rc::clone(&self.on_stale));
            }
            return;
        }
        let (new_value, src_type) = self.source_value(self.src.value());
        let dest_type = self.dest.value_type();
        let old_value = self.dest.value();
        // values that only differ by a round trip through conversion are not written back
        let round_trip = self
            .converter
            .convert(&old_value, dest_type.as_ref(), src_type.as_ref(), None);
        if value::loose_eq(&new_value, &round_trip) {
            return;
        }
        let converted = self
            .converter
            .convert(&new_value, src_type.as_ref(), dest_type.as_ref(), None);
        debug!(src = %self.src.name(), dest = %self.dest.name(), value = %converted, "Syncing binding");
        self.dest.set_value(converted, progress, false);
    }

    fn on_stale_changed(&self) {
        if self.src.is_stale() {
            return;
        }
        if self.waiting.replace(false) {
            self.src.remove_listener(EventKind::StaleChanged, &self.on_stale);
        }
        self.sync_value(&Progress::null());
    }
}

/// Keeps a target and a model binding in sync.
///
/// - only a getter, or `one_way`: model to target
/// - only a setter: target to model, and the model starts from the target
/// - both or neither: two way, model wins on enable
pub struct DataBinder {
    target_sync: Option<Rc<SyncDirection>>,
    model_sync: Rc<SyncDirection>,
    enabled: Cell<bool>,
}

impl DataBinder {
    pub fn new(
        target: Bind,
        model: Bind,
        getter: Option<ComputeFn>,
        setter: Option<ComputeFn>,
        one_way: bool,
        converter: Rc<DataConverter>,
    ) -> Self {
        let (target_sync, model_sync) = if one_way || (getter.is_some() && setter.is_none()) {
            (None, SyncDirection::new(model, target, getter, converter))
        } else if setter.is_some() && getter.is_none() {
            (None, SyncDirection::new(target, model, setter, converter))
        } else {
            (
                Some(SyncDirection::new(
                    Rc::clone(&target),
                    Rc::clone(&model),
                    setter,
                    Rc::clone(&converter),
                )),
                SyncDirection::new(model, target, getter, converter),
            )
        };
        let binder = Self {
            target_sync,
            model_sync,
            enabled: Cell::new(false),
        };
        binder.set_enabled(true);
        binder
    }

    /// Bind two optional bindings; `None` when either is missing.
    pub fn bind(
        target: Option<Bind>,
        model: Option<Bind>,
        getter: Option<ComputeFn>,
        setter: Option<ComputeFn>,
        converter: Rc<DataConverter>,
    ) -> Option<Self> {
        match (target, model) {
            (Some(target), Some(model)) => Some(Self::new(target, model, getter, setter, false, converter)),
            _ => {
                error!("Cannot bind target and model bindings together because one of them is missing");
                None
            }
        }
    }

    fn directions(&self) -> impl Iterator<Item = &Rc<SyncDirection>> {
        self.target_sync.iter().chain(std::iter::once(&self.model_sync))
    }
}

impl Binder for DataBinder {
    /// Enabling always re-syncs the model value and status once, even when the
    /// binder is already enabled.
    fn set_enabled(&self, enable: bool) {
        let was = self.enabled.replace(enable);
        if !enable {
            if was {
                for sync in self.directions() {
                    sync.disable();
                }
            }
            return;
        }
        if !was {
            for sync in self.directions() {
                sync.enable();
            }
        }
        self.model_sync.sync_value(&Progress::null());
        self.model_sync.sync_status();
    }

    fn is_enabled(&self) -> bool {
        self.enabled.get()
    }
}

impl fmt::Debug for DataBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBinder")
            .field("model", &self.model_sync.src.name())
            .field("target", &self.model_sync.dest.name())
            .field("two_way", &self.target_sync.is_some())
            .field("enabled", &self.enabled.get())
            .finish()
    }
}

/// Stand-in returned when a binding could not be created. Never enabled.
#[derive(Debug, Default)]
pub struct NullBinder;

impl Binder for NullBinder {
    fn set_enabled(&self, _enable: bool) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

/// A group of binders enabled and disabled together (one binding file).
#[derive(Default)]
pub struct BinderCollection {
    binders: RefCell<Vec<Rc<dyn Binder>>>,
    enabled: Cell<bool>,
}

impl BinderCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binder; it takes on the collection's enabled state.
    pub fn add(&self, binder: Rc<dyn Binder>) {
        binder.set_enabled(self.enabled.get());
        self.binders.borrow_mut().push(binder);
    }

    pub fn len(&self) -> usize {
        self.binders.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.binders.borrow().is_empty()
    }
}

impl Binder for BinderCollection {
    fn set_enabled(&self, enable: bool) {
        if self.enabled.replace(enable) == enable {
            return;
        }
        let binders = self.binders.borrow().clone();
        for binder in binders {
            binder.set_enabled(enable);
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.get()
    }
}

impl fmt::Debug for BinderCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinderCollection")
            .field("binders", &self.len())
            .field("enabled", &self.enabled.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::{AsyncBindValue, BindValue, Target, VariableBindValue};
    use crate::status::Status;
    use tokio::task::LocalSet;
    use crate::value::ValueType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn converter() -> Rc<DataConverter> {
        Rc::new(DataConverter::new())
    }

    fn set(bind: &Rc<VariableBindValue>, value: Value) {
        bind.set_value(value, &Progress::null(), false);
    }

    #[test]
    fn two_way_sync_with_model_first() {
        let target = VariableBindValue::new(json!(0));
        let model = VariableBindValue::new(json!(5));
        let binder = DataBinder::new(target.clone(), model.clone(), None, None, false, converter());
        assert!(binder.is_enabled());
        assert_eq!(target.value(), json!(5));

        set(&target, json!(7));
        assert_eq!(model.value(), json!(7));
        set(&model, json!(9));
        assert_eq!(target.value(), json!(9));
    }

    #[test]
    fn getter_only_is_one_way() {
        let target = VariableBindValue::new(Value::Null);
        let model = VariableBindValue::new(json!(2));
        let double: ComputeFn = Rc::new(|v| json!(value::to_number(&v) * 2.0));
        let _binder = DataBinder::new(target.clone(), model.clone(), Some(double), None, false, converter());
        assert_eq!(target.value(), json!(4.0));

        set(&target, json!(100));
        assert_eq!(model.value(), json!(2));
    }

    #[test]
    fn setter_only_initializes_model_from_target() {
        let target = VariableBindValue::new(json!("3"));
        let model = VariableBindValue::with_type(json!(0), Some(ValueType::Number));
        let parse: ComputeFn = Rc::new(|v| v);
        let _binder = DataBinder::new(target.clone(), model.clone(), None, Some(parse), false, converter());
        assert_eq!(model.value(), json!(3));
    }

    #[test]
    fn conversion_round_trip_is_not_written_back() {
        let target = VariableBindValue::with_type(json!("5"), Some(ValueType::String));
        let model = VariableBindValue::with_type(json!(5), Some(ValueType::Number));
        let _binder = DataBinder::new(target.clone(), model.clone(), None, None, false, converter());
        assert_eq!(target.value(), json!("5"));

        set(&target, json!("6"));
        assert_eq!(model.value(), json!(6));
    }

    #[test]
    fn status_follows_model() {
        let target = VariableBindValue::new(json!(0));
        let model = VariableBindValue::new(json!(0));
        let _binder = DataBinder::new(target.clone(), model.clone(), None, None, true, converter());
        model.set_status(Some(Status::warning("low battery")));
        assert_eq!(target.status(), Some(Status::warning("low battery")));
        model.set_status(None);
        assert_eq!(target.status(), None);
    }

    #[test]
    fn disabled_binder_resyncs_on_enable() {
        let target = VariableBindValue::new(json!(0));
        let model = VariableBindValue::new(json!(1));
        let binder = DataBinder::new(target.clone(), model.clone(), None, None, true, converter());
        binder.set_enabled(false);
        set(&model, json!(2));
        assert_eq!(target.value(), json!(1));

        binder.set_enabled(true);
        assert_eq!(target.value(), json!(2));
    }

    #[test]
    fn enabling_twice_resyncs_once() {
        let target = VariableBindValue::new(json!(0));
        let model = VariableBindValue::new(json!(1));
        let writes = Rc::new(Cell::new(0));
        let counter = Rc::clone(&writes);
        target.add_listener(
            EventKind::ValueChanged,
            listener(move |_| counter.set(counter.get() + 1)),
        );
        let binder = DataBinder::new(target.clone(), model.clone(), None, None, true, converter());
        assert_eq!(writes.get(), 1);

        // the target drifted without the model changing
        target.update_value(json!(8), &Progress::null(), true);
        writes.set(0);
        binder.set_enabled(true);
        assert_eq!(writes.get(), 1);
        assert_eq!(target.value(), json!(1));
    }

    #[test]
    fn streaming_sink_receives_every_value() {
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        let target = VariableBindValue::new(Value::Null);
        target.set_streaming_receiver(Some(Rc::new(move |data| sink.borrow_mut().push(data))));
        let model = VariableBindValue::new(json!(0));
        let _binder = DataBinder::new(target.clone(), model.clone(), None, None, true, converter());

        model.update_value(json!(1), &Progress::null(), false);
        model.update_value(json!(1), &Progress::null(), false);
        model.update_value(json!(2), &Progress::null(), false);
        // values skipping streaming do not reach the sink
        model.update_value(json!(3), &Progress::null(), true);

        assert_eq!(*received.borrow(), vec![json!(1), json!(1), json!(2)]);
        // a streaming target is not synced by value
        assert_eq!(target.value(), Value::Null);
    }

    #[test]
    fn streaming_values_go_through_getter() {
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        let target = VariableBindValue::new(Value::Null);
        target.set_streaming_receiver(Some(Rc::new(move |data| sink.borrow_mut().push(data))));
        let model = VariableBindValue::new(json!(0));
        let double: ComputeFn = Rc::new(|v| json!(value::to_number(&v) * 2.0));
        let _binder = DataBinder::new(target.clone(), model.clone(), Some(double), None, false, converter());

        model.update_value(json!(4), &Progress::null(), false);
        assert_eq!(*received.borrow(), vec![json!(8.0)]);
    }

    #[test]
    fn collection_toggles_members() {
        let target = VariableBindValue::new(json!(0));
        let model = VariableBindValue::new(json!(1));
        let collection = BinderCollection::new();
        let binder = Rc::new(DataBinder::new(target.clone(), model.clone(), None, None, true, converter()));
        collection.add(binder.clone());
        assert!(!binder.is_enabled());

        collection.set_enabled(true);
        assert!(binder.is_enabled());
        collection.dispose();
        assert!(!binder.is_enabled());
        assert!(!NullBinder.is_enabled());
    }

    /// Target whose single read resolves when the test sends the value.
    #[derive(Default)]
    struct PendingRead {
        reply: RefCell<Option<futures::channel::oneshot::Sender<Value>>>,
    }

    #[async_trait::async_trait(?Send)]
    impl Target for PendingRead {
        async fn read_value(&self, _index: &[Value]) -> crate::error::Result<Value> {
            let (tx, rx) = futures::channel::oneshot::channel();
            *self.reply.borrow_mut() = Some(tx);
            Ok(rx.await.unwrap_or(Value::Null))
        }

        async fn write_value(&self, _value: Value, _index: &[Value]) -> crate::error::Result<()> {
            Ok(())
        }
    }

    async fn run_tasks() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn stale_source_is_held_back_until_settled() {
        LocalSet::new()
            .run_until(async {
                let device = Rc::new(PendingRead::default());
                let model = AsyncBindValue::from_rc(Rc::clone(&device));
                let target = VariableBindValue::new(json!(0));
                let writes = Rc::new(RefCell::new(Vec::new()));
                let seen = Rc::clone(&writes);
                target.add_listener(
                    EventKind::ValueChanged,
                    listener(move |event| {
                        if let BindEvent::ValueChanged { new_value, .. } = event {
                            seen.borrow_mut().push(new_value.clone());
                        }
                    }),
                );

                let _binder = DataBinder::new(target.clone(), model.clone(), None, None, true, converter());
                run_tasks().await;
                assert!(model.is_stale());
                assert!(writes.borrow().is_empty());
                assert_eq!(target.value(), json!(0));

                let reply = device.reply.borrow_mut().take().expect("read in flight");
                reply.send(json!(42)).ok();
                run_tasks().await;

                assert!(!model.is_stale());
                assert_eq!(*writes.borrow(), vec![json!(42)]);
                assert_eq!(target.value(), json!(42));
            })
            .await;
    }
}
