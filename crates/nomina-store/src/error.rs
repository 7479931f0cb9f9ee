//! Error types for nomina-store

use thiserror::Error;

/// Errors that can occur in the result store.
///
/// Every variant other than `RunNotFound` means the store could not be
/// written or read at all; the coordinator treats those as fatal for the
/// run that hit them.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection error
    #[error("store connection failed: {0}")]
    Connection(String),

    /// Query or write failure inside the backend
    #[error("store backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Run not found
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// A run record with this id was already written
    #[error("run already recorded: {run_id}")]
    DuplicateRun { run_id: String },

    /// Stored digest is not a valid SHA-256 hex string
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// Schema setup error
    #[error("schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_run_names_the_run() {
        let err = StorageError::DuplicateRun {
            run_id: "run-42".to_string(),
        };
        assert!(err.to_string().contains("run-42"));
    }

    #[test]
    fn serde_errors_convert() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StorageError = bad.into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
