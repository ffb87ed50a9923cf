use std::path::PathBuf;

use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::unit::FailureRecord;

/// Errors raised by the engine itself.
///
/// A unit of work's own failures are not engine errors: they are recorded as
/// [`FailureRecord`]s and only surface here as [`EngineError::ExecutionFailed`]
/// when a recorded failure is replayed to the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Input '{name}' cannot be hashed: {reason}")]
    UnhashableInput { name: String, reason: String },

    #[error("Fingerprint {fingerprint} is already running (owner {owner}, {age_secs}s old)")]
    AlreadyRunning {
        fingerprint: Fingerprint,
        owner: String,
        age_secs: i64,
    },

    #[error("Input '{name}' cannot be exported: {reason}")]
    UnserializableState { name: String, reason: String },

    #[error("Unknown implementation: {0}")]
    UnknownImplementation(String),

    #[error("Integrity error: artifact declares fingerprint {expected}, reconstructed unit hashes to {actual}")]
    Integrity {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("Invalid artifact {}: {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("Invalid inputs for {interface}: {reason}")]
    InvalidInputs { interface: String, reason: String },

    #[error("{0}")]
    ExecutionFailed(Box<FailureRecord>),

    #[error("Store error during {operation} at {}: {source}", path.display())]
    Store {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Isolated runner error: {0}")]
    Runner(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Build a store error from an I/O failure on `path`
    pub fn store(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Store {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Only contention on a reservation is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::AlreadyRunning { .. })
    }

    /// Short machine-readable name, used in runner error payloads
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnhashableInput { .. } => "unhashable_input",
            EngineError::AlreadyRunning { .. } => "already_running",
            EngineError::UnserializableState { .. } => "unserializable_state",
            EngineError::UnknownImplementation(_) => "unknown_implementation",
            EngineError::Integrity { .. } => "integrity",
            EngineError::InvalidArtifact { .. } => "invalid_artifact",
            EngineError::InvalidInputs { .. } => "invalid_inputs",
            EngineError::ExecutionFailed(_) => "execution_failed",
            EngineError::Store { .. } => "store",
            EngineError::Serialization(_) => "serialization",
            EngineError::Runner(_) => "runner",
            EngineError::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_already_running_is_retryable() {
        let fp = Fingerprint::from_hex(&"a".repeat(64)).unwrap();
        let busy = EngineError::AlreadyRunning {
            fingerprint: fp.clone(),
            owner: "host:1".to_string(),
            age_secs: 3,
        };
        assert!(busy.is_retryable());

        let integrity = EngineError::Integrity {
            expected: fp.clone(),
            actual: fp,
        };
        assert!(!integrity.is_retryable());
        assert!(!EngineError::UnknownImplementation("x@1".into()).is_retryable());
    }

    #[test]
    fn test_store_error_mentions_path() {
        let err = EngineError::store(
            "write entry",
            "/tmp/store/entries",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let message = err.to_string();
        assert!(message.contains("write entry"));
        assert!(message.contains("/tmp/store/entries"));
        assert_eq!(err.kind(), "store");
    }
}
