//! Script log - recording of binding reads and writes (v0.1)
//!
//! Every local write to a target-backed binding emits a `write` event and every
//! explicit logged refresh emits a `read` event. Models own an emitter:
//! - `ScriptLogEmitter`: trait for emitting events
//! - `ScriptLog`: append-only in-memory recorder
//! - `NoopEmitter`: discards everything

use std::cell::{Cell, RefCell};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single recorded binding operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ScriptLogEvent {
    Write { name: String, value: Value },
    Read { name: String },
}

impl ScriptLogEvent {
    pub fn name(&self) -> &str {
        match self {
            ScriptLogEvent::Write { name, .. } | ScriptLogEvent::Read { name } => name,
        }
    }
}

/// Envelope with sequence id and time since the log was created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptLogEntry {
    pub id: u64,
    pub timestamp_ms: u64,
    pub event: ScriptLogEvent,
}

/// Trait for emitting script log events
///
/// Real `ScriptLog` in production, `NoopEmitter` or a custom mock in tests.
pub trait ScriptLogEmitter {
    /// Emit an event and return its ID
    fn emit(&self, event: ScriptLogEvent) -> u64;
}

/// Append-only script log
#[derive(Debug)]
pub struct ScriptLog {
    entries: RefCell<Vec<ScriptLogEntry>>,
    next_id: Cell<u64>,
    start: Instant,
}

impl Default for ScriptLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptLog {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            start: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn entries(&self) -> Vec<ScriptLogEntry> {
        self.entries.borrow().clone()
    }

    /// Events only, in emission order.
    pub fn events(&self) -> Vec<ScriptLogEvent> {
        self.entries
            .borrow()
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(&*self.entries.borrow()).unwrap_or(Value::Null)
    }
}

impl ScriptLogEmitter for ScriptLog {
    fn emit(&self, event: ScriptLogEvent) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.borrow_mut().push(ScriptLogEntry {
            id,
            timestamp_ms: self.start.elapsed().as_millis() as u64,
            event,
        });
        id
    }
}

/// No-op emitter (always returns 0)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEmitter;

impl ScriptLogEmitter for NoopEmitter {
    fn emit(&self, _event: ScriptLogEvent) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emitter_trait_is_object_safe() {
        fn accepts_emitter(_: &dyn ScriptLogEmitter) {}
        accepts_emitter(&ScriptLog::new());
        accepts_emitter(&NoopEmitter);
    }

    #[test]
    fn log_assigns_monotonic_ids() {
        let log = ScriptLog::new();
        let a = log.emit(ScriptLogEvent::Write {
            name: "reg".into(),
            value: json!(1),
        });
        let b = log.emit(ScriptLogEvent::Read { name: "reg".into() });
        assert_eq!((a, b), (0, 1));
        assert_eq!(log.len(), 2);
        assert_eq!(log.events()[1].name(), "reg");
    }

    #[test]
    fn events_serialize_with_command_tag() {
        let event = ScriptLogEvent::Write {
            name: "x".into(),
            value: json!(3),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"command": "write", "name": "x", "value": 3})
        );
    }

    #[test]
    fn noop_emitter_always_returns_zero() {
        assert_eq!(NoopEmitter.emit(ScriptLogEvent::Read { name: "a".into() }), 0);
    }
}
