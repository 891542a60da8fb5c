//! Polling timer shared by the bindings of one model
//!
//! A `RefreshInterval` is itself a variable binding holding the poll delay in
//! milliseconds; a negative delay disables polling. Each tick fires the
//! pre-refresh listeners, waits for them, then refreshes every subscribed binding
//! under one shared `Progress` and re-arms the timer once all of them settle.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use super::base::{delegate_bind_core, BindCore, ValueChange};
use super::{Bind, BindValue, Disconnectable};
use crate::progress::Progress;
use crate::value::{self, ValueType};

/// Callback invoked with the progress counter of a refresh cycle. Callers that
/// start more work call `progress.wait(1)` and later `progress.done(1)`.
pub type RefreshListener = Rc<dyn Fn(&Progress)>;

pub const DEFAULT_REFRESH_INTERVAL_MS: i64 = 100;

pub struct RefreshInterval {
    core: BindCore,
    exclude_from_storage: Cell<bool>,
    pre_refresh: RefCell<Vec<RefreshListener>>,
    on_refresh: RefCell<Vec<RefreshListener>>,
    subscribers: RefCell<Vec<Weak<dyn BindValue>>>,
    timer: RefCell<Option<JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl RefreshInterval {
    pub fn new(interval_ms: i64) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            core: BindCore::new(Value::from(interval_ms), Some(ValueType::Number)),
            exclude_from_storage: Cell::new(true),
            pre_refresh: RefCell::new(Vec::new()),
            on_refresh: RefCell::new(Vec::new()),
            subscribers: RefCell::new(Vec::new()),
            timer: RefCell::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Current delay; negative means polling is off.
    pub fn interval_ms(&self) -> i64 {
        let delay = value::to_number(&self.core.value());
        if delay.is_nan() {
            -1
        } else {
            delay as i64
        }
    }

    /// Poll `bind` on every tick. Only a weak reference is kept.
    pub fn subscribe(&self, bind: &Bind) {
        self.subscribers.borrow_mut().push(Rc::downgrade(bind));
        self.reset_timer();
    }

    pub fn unsubscribe(&self, bind: &Bind) {
        self.subscribers
            .borrow_mut()
            .retain(|weak| weak.upgrade().is_some_and(|live| !Rc::ptr_eq(&live, bind)));
    }

    pub fn add_pre_refresh_listener(&self, listener: RefreshListener) {
        self.pre_refresh.borrow_mut().push(listener);
    }

    pub fn add_refresh_listener(&self, listener: RefreshListener) {
        self.on_refresh.borrow_mut().push(listener);
        self.reset_timer();
    }

    pub fn remove_refresh_listener(&self, listener: &RefreshListener) {
        let same = |l: &RefreshListener| std::ptr::addr_eq(Rc::as_ptr(l), Rc::as_ptr(listener));
        self.on_refresh.borrow_mut().retain(|l| !same(l));
        self.pre_refresh.borrow_mut().retain(|l| !same(l));
    }

    pub fn is_timer_pending(&self) -> bool {
        self.timer.borrow().is_some()
    }

    fn live_subscribers(&self) -> Vec<Bind> {
        let mut subscribers = self.subscribers.borrow_mut();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.iter().filter_map(Weak::upgrade).collect()
    }

    fn has_listeners(&self) -> bool {
        !self.on_refresh.borrow().is_empty()
            || self
                .subscribers
                .borrow()
                .iter()
                .any(|weak| weak.strong_count() > 0)
    }

    fn fire(listeners: &RefCell<Vec<RefreshListener>>, progress: &Progress) {
        let snapshot: Vec<RefreshListener> = listeners.borrow().clone();
        for listener in snapshot {
            listener(progress);
        }
    }

    /// Run one refresh cycle now. With `progress` supplied the caller owns the
    /// cycle and the timer is not re-armed when it completes. Resolves with the
    /// number of jobs the cycle waited on.
    pub fn refresh_now(&self, progress: Option<Progress>) -> LocalBoxFuture<'static, usize> {
        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.abort();
        }
        let this = self.self_ref.clone();
        async move {
            let Some(strong) = this.upgrade() else {
                return 0;
            };
            let pre = Progress::new();
            Self::fire(&strong.pre_refresh, &pre);
            pre.done(1);
            let pre_finished = pre.finished();
            drop(strong);
            pre_finished.await;

            let Some(strong) = this.upgrade() else {
                return 0;
            };
            let progress = progress.unwrap_or_else(|| {
                let rearm = this.clone();
                Progress::with_callback(move |_| {
                    if let Some(interval) = rearm.upgrade() {
                        interval.reset_timer();
                    }
                })
            });
            Self::fire(&strong.on_refresh, &progress);
            for bind in strong.live_subscribers() {
                if let Some(refreshable) = bind.as_refreshable() {
                    // completion is tracked through `progress`
                    drop(refreshable.refresh(&progress, false));
                }
            }
            progress.done(1);
            let finished = progress.finished();
            drop(strong);
            finished.await
        }
        .boxed_local()
    }

    /// Arm the timer if something listens, no tick is pending and polling is on.
    fn reset_timer(&self) {
        if self.timer.borrow().is_some() || !self.has_listeners() {
            return;
        }
        let delay = self.interval_ms();
        if delay < 0 {
            return;
        }
        let this = self.self_ref.clone();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            let Some(interval) = this.upgrade() else {
                return;
            };
            // detach our own handle so refresh_now does not abort this task
            interval.timer.borrow_mut().take();
            let cycle = interval.refresh_now(None);
            drop(interval);
            let jobs = cycle.await;
            debug!(jobs, "refresh cycle finished");
        });
        *self.timer.borrow_mut() = Some(handle);
    }

    fn on_value_changed(&self, _change: &ValueChange, _progress: &Progress) {
        self.core.set_stale(false);
        self.exclude_from_storage.set(false);
        self.reset_timer();
    }
}

impl BindValue for RefreshInterval {
    delegate_bind_core!();

    fn is_read_only(&self) -> bool {
        false
    }

    fn as_disconnectable(&self) -> Option<&dyn Disconnectable> {
        Some(self)
    }

    fn exclude_from_storage(&self) -> bool {
        self.exclude_from_storage.get()
    }

    fn dispose(&self) {
        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.abort();
        }
    }
}

impl Disconnectable for RefreshInterval {
    /// When not polling, queue one refresh so bindings read on the next connect.
    fn on_disconnected(&self) {
        if self.timer.borrow().is_none() && self.has_listeners() && self.interval_ms() < 0 {
            tokio::task::spawn_local(self.refresh_now(None).map(|_| ()));
        }
    }
}

impl fmt::Debug for RefreshInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshInterval")
            .field("interval_ms", &self.interval_ms())
            .field("subscribers", &self.subscribers.borrow().len())
            .field("timer_pending", &self.is_timer_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::{AsyncBindValue, Target};
    use crate::error::Result;
    use crate::events::{listener, EventKind};
    use async_trait::async_trait;
    use tokio::task::LocalSet;

    struct Counter {
        reads: Cell<i64>,
    }

    #[async_trait(?Send)]
    impl Target for Counter {
        async fn read_value(&self, _index: &[Value]) -> Result<Value> {
            self.reads.set(self.reads.get() + 1);
            Ok(Value::from(self.reads.get()))
        }

        async fn write_value(&self, _value: Value, _index: &[Value]) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_subscribed_bindings() {
        LocalSet::new()
            .run_until(async {
                let interval = RefreshInterval::new(50);
                let bind = AsyncBindValue::new(Counter { reads: Cell::new(0) });
                bind.add_listener(EventKind::ValueChanged, listener(|_| {}));
                let handle: Bind = bind.clone();
                interval.subscribe(&handle);
                assert!(interval.is_timer_pending());

                tokio::time::sleep(Duration::from_millis(175)).await;
                // one kick-start read plus three ticks
                assert_eq!(bind.target().reads.get(), 4);
                assert_eq!(bind.value(), Value::from(4));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn negative_interval_disables_polling() {
        LocalSet::new()
            .run_until(async {
                let interval = RefreshInterval::new(-1);
                let ticks = Rc::new(Cell::new(0));
                let t = ticks.clone();
                interval.add_refresh_listener(Rc::new(move |_| t.set(t.get() + 1)));
                assert!(!interval.is_timer_pending());

                interval.set_value(Value::from(10), &Progress::null(), false);
                assert!(interval.is_timer_pending());
                assert!(!interval.exclude_from_storage());
                tokio::time::sleep(Duration::from_millis(35)).await;
                assert_eq!(ticks.get(), 3);
            })
            .await;
    }

    #[tokio::test]
    async fn pre_refresh_runs_before_refresh() {
        LocalSet::new()
            .run_until(async {
                let interval = RefreshInterval::new(-1);
                let order = Rc::new(RefCell::new(Vec::new()));
                let o = order.clone();
                interval.add_pre_refresh_listener(Rc::new(move |_| o.borrow_mut().push("pre")));
                let o = order.clone();
                interval.add_refresh_listener(Rc::new(move |progress| {
                    progress.wait(1);
                    o.borrow_mut().push("refresh");
                    progress.done(1);
                }));
                let jobs = interval.refresh_now(Some(Progress::new())).await;
                assert_eq!(jobs, 1);
                assert_eq!(*order.borrow(), vec!["pre", "refresh"]);
            })
            .await;
    }
}
