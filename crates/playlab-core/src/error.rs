//! Error types for PlayLab core.
//!
//! Every error carries a stable machine-readable code (see [`CoreError::code`])
//! that CLI wrappers map 1-to-1 to process exit codes.

use thiserror::Error;

/// Core error type for PlayLab operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown structure type '{name}'\n\nAvailable types: {}\n\nFix: use one of the available types above", .available.join(", "))]
    UnknownStructureType { name: String, available: Vec<String> },

    #[error("Structure '{detector}' has no output '{key}'\n\nAvailable outputs: {}\n\nFix: use one of the available output keys above", .valid.join(", "))]
    UnknownOutputKey {
        detector: String,
        key: String,
        valid: Vec<String>,
    },

    #[error("Structure '{key}' depends on '{dep}' which is not yet defined\n\nDefined structures: {}\n\nFix: declare '{dep}' before '{key}' in the same timeframe", .defined.join(", "))]
    DependencyNotDefined {
        key: String,
        dep: String,
        defined: Vec<String>,
    },

    #[error("Duplicate structure key '{0}' (keys must be unique per timeframe)")]
    DuplicateKey(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Data not available: {0}")]
    DataNotAvailable(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Order book full (max {0} orders)")]
    OrderBookFull(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Stable machine-readable error code for the CLI exit-code mapping.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) | CoreError::DuplicateKey(_) => "VALIDATION_FAILED",
            CoreError::UnknownStructureType { .. } => "REGISTRY_UNKNOWN_TYPE",
            CoreError::UnknownOutputKey { .. } | CoreError::DependencyNotDefined { .. } => {
                "VALIDATION_FAILED"
            }
            CoreError::Data(_) | CoreError::DataNotAvailable(_) => "DATA_NOT_AVAILABLE",
            CoreError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            CoreError::OrderBookFull(_) => "VALIDATION_FAILED",
            CoreError::Io(_) | CoreError::Json(_) => "DATA_NOT_AVAILABLE",
        }
    }
}

/// Result type alias for PlayLab core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
