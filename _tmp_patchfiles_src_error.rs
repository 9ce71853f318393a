//! Error types for tokenshield-core.

use thiserror::Error;

/// Result type alias using tokenshield-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during TokenShield operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A request was rejected by admission control (breaker, guard, or budget).
    #[error("blocked: {reason}")]
    Blocked { reason: String, estimated_cost: f64 },

    /// The supplied generator function (`doGenerate`/`doStream`) failed.
    #[error("downstream generator failed: {0}")]
    DownstreamFailure(String),

    /// Persistent storage failed. Never fails the parent operation; surfaced
    /// only via `storage:error` events and optional callbacks.
    #[error("storage error in {module} during {operation}: {message}")]
    StorageError {
        module: String,
        operation: String,
        message: String,
    },

    /// The cost estimator saw a model id it has no pricing entry for.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Construction-time configuration error (e.g. MinHash `numHashes % bands != 0`).
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a Blocked error.
    pub fn blocked(reason: impl Into<String>, estimated_cost: f64) -> Self {
        Self::Blocked {
            reason: reason.into(),
            estimated_cost,
        }
    }

    /// Create a DownstreamFailure error.
    pub fn downstream(message: impl Into<String>) -> Self {
        Self::DownstreamFailure(message.into())
    }

    /// Create a StorageError.
    pub fn storage(
        module: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::StorageError {
            module: module.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an UnknownModel error.
    pub fn unknown_model(model_id: impl Into<String>) -> Self {
        Self::UnknownModel(model_id.into())
    }

    /// Create a ConfigError.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error represents a rejected admission (vs. a hard failure).
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageError {
            module: "persistence".to_string(),
            operation: "sqlite".to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_carries_reason_and_cost() {
        let e = Error::blocked("Debounced", 0.002);
        assert!(e.is_blocked());
        assert!(e.to_string().contains("Debounced"));
    }

    #[test]
    fn storage_error_is_not_blocked() {
        let e = Error::storage("cache", "store", "disk full");
        assert!(!e.is_blocked());
    }
}


