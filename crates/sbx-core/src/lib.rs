//! Session lifecycle and command-execution engine for the sandbox server.
//!
//! The registry owns every live session; sessions own their mutable
//! shell-like state; the services here are the protocol-agnostic adapters
//! both front-door surfaces share. The session id is the sole capability:
//! holding it is the only way to reach session state.

pub mod error;
pub mod exec;
pub mod files;
pub mod paths;
pub mod registry;
pub mod session;
pub mod snapshots;

/// Result type for sandbox service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for sandbox service operations.
pub use error::Error;

pub use exec::{CommandOverrides, CommandService};
pub use files::{DirEntryInfo, EntryKind, FileService};
pub use registry::{spawn_sweeper, RegistryConfig, SessionRegistry};
pub use session::{generate_session_id, is_valid_env_name, Lifecycle, Session};
pub use snapshots::{is_valid_snapshot_name, SnapshotService};
