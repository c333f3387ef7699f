//! Error types for command launching.

/// Error type for launcher operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn command: {message}")]
    Spawn { message: String },

    #[error("launcher failure: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new spawn error.
    pub fn spawn<S: Into<String>>(message: S) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }

    /// Create a new internal launcher error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
