//! Edge-triggered callbacks on binding expressions
//!
//! A [`Trigger`] watches a condition expression and calls back each time it
//! turns truthy. Staying truthy does not fire again; it has to go falsy first.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::bind::Bind;
use crate::error::Result;
use crate::events::{listener, BindEvent, EventKind, Listener};
use crate::progress::Progress;
use crate::registry::BindingRegistry;
use crate::value::is_truthy;

pub type TriggerFn = Rc<dyn Fn(&Progress)>;

struct TriggerState {
    callback: TriggerFn,
    condition: RefCell<Option<Bind>>,
    last: Cell<bool>,
    enabled: Cell<bool>,
}

impl TriggerState {
    fn on_value_changed(&self, event: &BindEvent) {
        let Some(condition) = self.condition.borrow().clone() else {
            return;
        };
        let now = is_truthy(&condition.value());
        if self.last.replace(now) == now || !now || !self.enabled.get() {
            return;
        }
        let progress = match event {
            BindEvent::ValueChanged { progress, .. } => progress.clone(),
            _ => Progress::null(),
        };
        (self.callback)(&progress);
    }
}

pub struct Trigger {
    state: Rc<TriggerState>,
    on_changed: Listener,
}

impl Trigger {
    /// Trigger on `condition`, resolved through `registry`. Starts enabled.
    pub fn new(
        registry: &BindingRegistry,
        condition: &str,
        callback: impl Fn(&Progress) + 'static,
    ) -> Result<Self> {
        let state = Rc::new(TriggerState {
            callback: Rc::new(callback),
            condition: RefCell::new(None),
            last: Cell::new(false),
            enabled: Cell::new(true),
        });
        let weak = Rc::downgrade(&state);
        let trigger = Self {
            state,
            on_changed: listener(move |event| {
                if let Some(state) = weak.upgrade() {
                    state.on_value_changed(event);
                }
            }),
        };
        trigger.set_condition(registry, condition)?;
        Ok(trigger)
    }

    /// Watch a new condition. An empty condition never fires.
    pub fn set_condition(&self, registry: &BindingRegistry, condition: &str) -> Result<()> {
        let bind = if condition.trim().is_empty() {
            None
        } else {
            registry.get_binding(condition)?
        };
        self.detach();
        if let Some(bind) = &bind {
            if self.state.enabled.get() {
                bind.add_listener(EventKind::ValueChanged, Rc::clone(&self.on_changed));
            }
        }
        let truthy = bind.as_ref().is_some_and(|bind| is_truthy(&bind.value()));
        self.state.last.set(truthy);
        *self.state.condition.borrow_mut() = bind;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.state.enabled.replace(enabled) == enabled {
            return;
        }
        if let Some(bind) = self.state.condition.borrow().as_ref() {
            if enabled {
                bind.add_listener(EventKind::ValueChanged, Rc::clone(&self.on_changed));
            } else {
                bind.remove_listener(EventKind::ValueChanged, &self.on_changed);
            }
        }
    }

    fn detach(&self) {
        if let Some(bind) = self.state.condition.borrow().as_ref() {
            bind.remove_listener(EventKind::ValueChanged, &self.on_changed);
        }
    }

    pub fn dispose(&self) {
        self.detach();
        self.state.condition.borrow_mut().take();
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field(
                "condition",
                &self.state.condition.borrow().as_ref().map(|bind| bind.name()),
            )
            .field("enabled", &self.state.enabled.get())
            .finish()
    }
}
