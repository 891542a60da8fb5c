//! Status value objects attached to bindings
//!
//! Statuses are immutable; equality is semantic (kind, message, id) so that
//! re-reporting the same problem does not fire a `StatusChanged` event.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BindError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Status {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            id: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StatusKind::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(StatusKind::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(StatusKind::Info, message)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Build an optional status; no message means no status.
    pub fn create(kind: StatusKind, message: Option<&str>, id: Option<&str>) -> Option<Self> {
        message.map(|message| Self {
            kind,
            message: message.to_string(),
            id: id.map(str::to_string),
        })
    }

    pub fn is_error(&self) -> bool {
        self.kind == StatusKind::Error
    }
}

impl From<&BindError> for Status {
    fn from(err: &BindError) -> Self {
        Status::error(err.plain_message())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            StatusKind::Error => "error",
            StatusKind::Warning => "warning",
            StatusKind::Info => "info",
        };
        write!(f, "{}: {}", kind, self.message)
    }
}
