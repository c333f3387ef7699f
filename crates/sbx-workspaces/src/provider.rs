//! Volume provider abstraction: how workspaces and snapshot backings are
//! created, copied, and removed on the underlying filesystem.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::btrfs::BtrfsProvider;
use crate::copydir::CopyProvider;
use crate::Result;

/// Provider kinds for workspace volumes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderKind {
    /// Btrfs subvolumes; snapshots are O(metadata).
    Btrfs,
    /// Plain directories; snapshots are recursive copies.
    Copy,
}

/// Core trait for workspace volume providers.
///
/// A "volume" is a directory tree the provider owns end to end: live
/// workspaces and snapshot backings are both volumes. Providers never decide
/// *where* volumes live; the store does.
#[async_trait]
pub trait VolumeProvider: Send + Sync {
    /// Return the kind of this provider.
    fn kind(&self) -> ProviderKind;

    /// Create an empty volume at `path`. The parent directory exists.
    async fn create_volume(&self, path: &Path) -> Result<()>;

    /// Remove the volume at `path` and everything inside it. Idempotent.
    async fn remove_volume(&self, path: &Path) -> Result<()>;

    /// Create a point-in-time copy of `src` at `dst`. `dst` does not exist.
    async fn snapshot_volume(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Turn `staged` (a plain directory populated by an import) into a
    /// volume at `dst`, consuming the staged contents. `dst` does not exist.
    async fn adopt_directory(&self, staged: &Path, dst: &Path) -> Result<()>;
}

/// Pick the best provider for volumes rooted under `base`.
///
/// Btrfs wins when the pool probe passes; everything else falls back to
/// recursive copies with the same contract at O(size) cost.
pub fn detect_provider(base: &Path) -> Box<dyn VolumeProvider> {
    match BtrfsProvider::probe_pool(base) {
        Ok(()) => {
            info!(base = %base.display(), "using btrfs subvolume provider");
            Box::new(BtrfsProvider::new())
        }
        Err(reason) => {
            info!(base = %base.display(), %reason, "using copy provider");
            Box::new(CopyProvider::new())
        }
    }
}
