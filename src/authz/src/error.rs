//! Error types for the ABAC decision engine

use std::time::Duration;
use thiserror::Error;

/// ABAC engine errors
///
/// Only `InvalidInput`, `Serialization` and `Io` ever reach a caller of the
/// public API as hard failures. Everything raised on the decision path is
/// converted into a `DENY` decision with a trace entry.
#[derive(Debug, Error)]
pub enum AbacError {
    /// Malformed catalog item (empty rule set, unknown attribute code, bad regex, ...)
    #[error("Configuration error in {item}: {message}")]
    Configuration { item: String, message: String },

    /// Upstream attribute data missing for this request
    #[error("Attribute resolution failed: {0}")]
    AttributeResolution(String),

    /// Upstream attribute source transiently unavailable
    #[error("Attribute source unavailable: {0}")]
    SourceUnavailable(String),

    /// Request deadline exceeded
    #[error("Evaluation timed out after {0:?}")]
    EvaluationTimeout(Duration),

    /// Persisting an audit record failed
    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AbacError {
    /// Build a configuration error for a catalog item
    pub fn configuration(item: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            item: item.into(),
            message: message.into(),
        }
    }

    /// Whether the failed operation may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_) | Self::Io(_))
    }

    /// Short machine-readable name used in traces and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::AttributeResolution(_) | Self::SourceUnavailable(_) => "attribute_resolution",
            Self::EvaluationTimeout(_) => "timeout",
            Self::AuditWrite(_) => "audit_write",
            Self::InvalidInput(_) => "invalid_input",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type for ABAC operations
pub type Result<T> = std::result::Result<T, AbacError>;
