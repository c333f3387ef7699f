//! Error types for workspace storage operations.

/// Error type for workspace storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot not found: {name}")]
    SnapshotNotFound { name: String },

    #[error("import failed: {message}")]
    ImportFailed { message: String },

    #[error("provider error: {message}")]
    Provider { message: String },
}

impl Error {
    /// Create a new snapshot-not-found error.
    pub fn snapshot_not_found<S: Into<String>>(name: S) -> Self {
        Self::SnapshotNotFound { name: name.into() }
    }

    /// Create a new import error.
    pub fn import_failed<S: Into<String>>(message: S) -> Self {
        Self::ImportFailed {
            message: message.into(),
        }
    }

    /// Create a new provider error.
    pub fn provider<S: Into<String>>(message: S) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }
}
