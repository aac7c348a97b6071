use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("resource {resource} is busy (waited {waited:?})")]
    Busy { resource: String, waited: Duration },

    #[error("lock on {0} is no longer held by this process")]
    LockLost(String),

    #[error("incompatible record at {path}: found {found}, expected {expected}")]
    IncompatibleSchema {
        path: String,
        found: String,
        expected: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },
}

impl StoreError {
    pub(crate) fn io(context: impl std::fmt::Display, e: std::io::Error) -> Self {
        StoreError::Io(format!("{context}: {e}"))
    }

    /// Contention a caller may retry.
    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Busy { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
