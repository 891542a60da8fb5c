//! Binding change events and listener sets
//!
//! Listeners are `Rc` closures compared by identity, so a composite node can
//! forward the same listener to each of its operands and later remove it again.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::progress::Progress;
use crate::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ValueChanged,
    StatusChanged,
    StaleChanged,
    StreamingData,
}

#[derive(Debug, Clone)]
pub enum BindEvent {
    ValueChanged {
        old_value: Value,
        new_value: Value,
        progress: Progress,
    },
    StatusChanged {
        old_status: Option<Status>,
        new_status: Option<Status>,
    },
    StaleChanged {
        stale: bool,
    },
    StreamingData {
        data: Value,
    },
}

impl BindEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BindEvent::ValueChanged { .. } => EventKind::ValueChanged,
            BindEvent::StatusChanged { .. } => EventKind::StatusChanged,
            BindEvent::StaleChanged { .. } => EventKind::StaleChanged,
            BindEvent::StreamingData { .. } => EventKind::StreamingData,
        }
    }
}

pub type Listener = Rc<dyn Fn(&BindEvent)>;

/// Wrap a closure as a listener.
pub fn listener(f: impl Fn(&BindEvent) + 'static) -> Listener {
    Rc::new(f)
}

/// Identity comparison of two listeners.
pub fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

/// Listener set for one binding
#[derive(Default)]
pub struct Events {
    listeners: RefCell<Vec<(EventKind, Listener)>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Returns true when it is the first listener of its kind.
    /// Adding the same listener twice is a no-op.
    pub fn add(&self, kind: EventKind, listener: Listener) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        if listeners
            .iter()
            .any(|(k, l)| *k == kind && same_listener(l, &listener))
        {
            return false;
        }
        let first = !listeners.iter().any(|(k, _)| *k == kind);
        listeners.push((kind, listener));
        first
    }

    /// Remove a listener. Returns true when the last listener of its kind was removed.
    pub fn remove(&self, kind: EventKind, listener: &Listener) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(k, l)| !(*k == kind && same_listener(l, listener)));
        before != listeners.len() && !listeners.iter().any(|(k, _)| *k == kind)
    }

    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.listeners.borrow().iter().any(|(k, _)| *k == kind)
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Notify listeners of the event's kind. Listeners may add or remove
    /// listeners while being notified.
    pub fn fire(&self, event: &BindEvent) {
        let kind = event.kind();
        let snapshot: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Remove and return every listener.
    pub fn take_all(&self) -> Vec<(EventKind, Listener)> {
        std::mem::take(&mut *self.listeners.borrow_mut())
    }

    pub fn clear(&self) {
        self.listeners.borrow_mut().clear();
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}
