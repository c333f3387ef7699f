//! The protocol-agnostic error taxonomy.
//!
//! Every kind except `Internal` is a user error: its message is safe to show
//! to callers. `Internal` messages are for logs; the front door replaces
//! them with an opaque reason before anything leaves the process.

/// Error type shared by all sandbox services.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("session is being destroyed: {id}")]
    SessionDestroying { id: String },

    #[error("path escapes the session workspace: {path}")]
    PathEscape { path: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("snapshot not found: {name}")]
    SnapshotNotFound { name: String },

    #[error("import failed: {message}")]
    ImportFailed { message: String },

    #[error("file too large: {path} is {size} bytes, cap is {cap}")]
    FileTooLarge { path: String, size: u64, cap: u64 },

    #[error("failed to spawn command: {message}")]
    SpawnFailed { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new session-not-found error.
    pub fn session_not_found<S: Into<String>>(id: S) -> Self {
        Self::SessionNotFound { id: id.into() }
    }

    /// Create a new session-destroying error.
    pub fn session_destroying<S: Into<String>>(id: S) -> Self {
        Self::SessionDestroying { id: id.into() }
    }

    /// Create a new path-escape error.
    pub fn path_escape<S: Into<String>>(path: S) -> Self {
        Self::PathEscape { path: path.into() }
    }

    /// Create a new invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable wire name for this kind, used by both protocol edges.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound { .. } => "SessionNotFound",
            Self::SessionDestroying { .. } => "SessionDestroying",
            Self::PathEscape { .. } => "PathEscape",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::SnapshotNotFound { .. } => "SnapshotNotFound",
            Self::ImportFailed { .. } => "ImportFailed",
            Self::FileTooLarge { .. } => "FileTooLarge",
            Self::SpawnFailed { .. } => "SpawnFailed",
            Self::Internal { .. } => "InternalError",
        }
    }

    /// Whether the message may be shown to callers verbatim.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, Self::Internal { .. })
    }
}

impl From<sbx_workspaces::Error> for Error {
    fn from(e: sbx_workspaces::Error) -> Self {
        match e {
            sbx_workspaces::Error::SnapshotNotFound { name } => Self::SnapshotNotFound { name },
            sbx_workspaces::Error::ImportFailed { message } => Self::ImportFailed { message },
            sbx_workspaces::Error::Io(e) => Self::internal(format!("workspace I/O: {}", e)),
            sbx_workspaces::Error::Provider { message } => {
                Self::internal(format!("workspace provider: {}", message))
            }
        }
    }
}

impl From<sbx_launcher::Error> for Error {
    fn from(e: sbx_launcher::Error) -> Self {
        match e {
            sbx_launcher::Error::Spawn { message } => Self::SpawnFailed { message },
            sbx_launcher::Error::Internal { message } => {
                Self::internal(format!("launcher: {}", message))
            }
        }
    }
}
