//! Error types with fix suggestions (v0.1)
//!
//! Parse, index, qualifier and registry failures are programmer/config errors and
//! surface as `BindError`. Runtime problems on a target are `Status` values on the
//! binding instead (see `status.rs`).

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

pub type Result<T, E = BindError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum BindError {
    // ─────────────────────────────────────────────────────────────
    // Expression parse errors (BIND-010 to BIND-019)
    // ─────────────────────────────────────────────────────────────
    #[error("BIND-010: Missing operands for the {operator} operator.")]
    MissingOperands { operator: String },

    #[error("BIND-011: Missing the left operand for the {operator} operator.")]
    MissingLeftOperand { operator: String },

    #[error("BIND-012: Unrecognized identifier '{text}'.")]
    UnrecognizedIdentifier { text: String },

    #[error("BIND-013: Invalid literal '{text}'.")]
    InvalidLiteral { text: String },

    #[error("BIND-014: {message}")]
    Syntax { message: String },

    #[error("BIND-015: '{name}' is not {kind} type.  It cannot be used with the {operator} operator.")]
    NotLookupType {
        name: String,
        kind: &'static str,
        operator: String,
    },

    #[error("BIND-016: Empty binding expression.")]
    EmptyExpression,

    // ─────────────────────────────────────────────────────────────
    // Index errors (BIND-030 to BIND-033)
    // ─────────────────────────────────────────────────────────────
    #[error("BIND-030: The index value is null.")]
    IndexNull,

    #[error("BIND-031: The index is not valid. Cannot convert '{index}' to an integer.")]
    IndexNotInteger { index: String },

    #[error("BIND-032: The index {index} is out of bounds.  It must be between {start} and {end}")]
    IndexOutOfBounds { index: i64, start: i64, end: i64 },

    #[error("BIND-033: The index '{field}' was not found.")]
    FieldNotFound { field: String },

    // ─────────────────────────────────────────────────────────────
    // Qualifier errors (BIND-040 to BIND-041)
    // ─────────────────────────────────────────────────────────────
    #[error("BIND-040: Unknown qualifier '{name}'")]
    UnknownQualifier { name: String },

    #[error("BIND-041: Qualifier '{name}' cannot be applied to binding '{binding}'")]
    QualifierNotApplicable { name: String, binding: String },

    // ─────────────────────────────────────────────────────────────
    // Registry errors (BIND-050 to BIND-054)
    // ─────────────────────────────────────────────────────────────
    #[error("BIND-050: There is no default model for bindings")]
    NoDefaultModel,

    #[error("BIND-051: Model '{name}' is not registered")]
    ModelNotFound { name: String },

    #[error("BIND-052: Model '{name}' was not ready within {timeout_ms}ms")]
    ModelNotReady { name: String, timeout_ms: u64 },

    #[error("BIND-053: Binding '{name}' could not be created")]
    BindingNotFound { name: String },

    #[error("BIND-054: Binding '{name}' is read-only")]
    ReadOnly { name: String },

    // ─────────────────────────────────────────────────────────────
    // Binding file errors (BIND-060 to BIND-063)
    // ─────────────────────────────────────────────────────────────
    #[error("BIND-060: IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("BIND-061: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("BIND-062: YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("BIND-063: Invalid binding file '{path}': {reason}")]
    InvalidBindingFile { path: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Config and target errors (BIND-070 to BIND-080)
    // ─────────────────────────────────────────────────────────────
    #[error("BIND-070: Config error: {reason}")]
    ConfigError { reason: String },

    #[error("BIND-080: Target error: {message}")]
    Target { message: String },
}

impl BindError {
    pub fn syntax(message: impl Into<String>) -> Self {
        BindError::Syntax {
            message: message.into(),
        }
    }

    pub fn target(message: impl Into<String>) -> Self {
        BindError::Target {
            message: message.into(),
        }
    }

    /// Message without the `BIND-0xx: ` code prefix, for display in a `Status`.
    pub fn plain_message(&self) -> String {
        let text = self.to_string();
        match text.split_once(": ") {
            Some((code, rest)) if code.starts_with("BIND-") => rest.to_string(),
            _ => text,
        }
    }
}

impl FixSuggestion for BindError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            BindError::MissingOperands { .. } | BindError::MissingLeftOperand { .. } => {
                Some("Provide an expression on both sides of the operator")
            }
            BindError::UnrecognizedIdentifier { .. } => {
                Some("Identifiers may contain letters, digits, '$' and '_' and must not start with a digit")
            }
            BindError::InvalidLiteral { .. } => Some("Check numeric literal syntax (e.g. 12, 0x1F, 1.5e3)"),
            BindError::Syntax { .. } => Some("Check brackets and operators in the binding expression"),
            BindError::NotLookupType { .. } => {
                Some("Only array, object or function bindings can be indexed")
            }
            BindError::EmptyExpression => Some("Provide a non-empty binding expression"),
            BindError::IndexNull => Some("Make sure the index binding has a value"),
            BindError::IndexNotInteger { .. } => Some("Use an integer index for arrays"),
            BindError::IndexOutOfBounds { .. } => Some("Use an index within the array bounds"),
            BindError::FieldNotFound { .. } => Some("Check the field name exists on the object"),
            BindError::UnknownQualifier { .. } => {
                Some("Use one of: hex, dec, exp, binary, readonly, writeonly, nonvolatile, const, interrupt, noverify")
            }
            BindError::QualifierNotApplicable { .. } => {
                Some("Capability qualifiers only apply to target-backed bindings")
            }
            BindError::NoDefaultModel => Some("Register a model with make_default = true"),
            BindError::ModelNotFound { .. } => Some("Register the model before binding to it"),
            BindError::ModelNotReady { .. } => Some("Increase the timeout or check the model registration"),
            BindError::BindingNotFound { .. } => Some("Check the binding name against the model"),
            BindError::ReadOnly { .. } => Some("Remove the .$readonly/.$const qualifier or write another binding"),
            BindError::Io(_) => Some("Check file path and permissions"),
            BindError::Json(_) => Some("Check JSON syntax of the binding file"),
            BindError::Yaml(_) => Some("Check YAML syntax: indentation and quoting"),
            BindError::InvalidBindingFile { .. } => {
                Some("Binding files need a top-level 'widgetBindings' array")
            }
            BindError::ConfigError { .. } => Some("Check the config file syntax (TOML)"),
            BindError::Target { .. } => None,
        }
    }
}
