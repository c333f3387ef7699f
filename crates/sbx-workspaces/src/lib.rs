//! Workspace storage for sandbox sessions.
//!
//! Owns the on-disk layout of live workspaces, named snapshots, and exported
//! archives. Snapshots are cheap subvolume snapshots on btrfs and recursive
//! copies everywhere else, behind one provider contract.

pub mod archive;
pub mod btrfs;
pub mod copydir;
pub mod error;
pub mod provider;
pub mod store;

/// Result type for workspace storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for workspace storage operations.
pub use error::Error;

pub use archive::{ArchiveSummary, ARCHIVE_TOP_LEVEL};
pub use provider::{detect_provider, ProviderKind, VolumeProvider};
pub use store::{ExportManifest, SnapshotInfo, StoreLayout, WorkspaceStore};
