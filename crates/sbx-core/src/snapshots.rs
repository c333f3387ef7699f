//! Snapshot service: thin policy layer over the workspace store.
//!
//! Mutating operations (create, restore, delete, import) take the session's
//! workspace gate exclusively: live commands finish first, the mutation runs
//! alone, then new commands proceed. Listing and export run concurrently
//! with commands since snapshot backings never change after creation.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use sbx_workspaces::{ExportManifest, SnapshotInfo};

use crate::registry::SessionRegistry;
use crate::{Error, Result};

/// Snapshot names are single path components:
/// `[A-Za-z0-9._-]{1,64}`, excluding the `.` and `..` specials.
pub fn is_valid_snapshot_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[derive(Clone)]
pub struct SnapshotService {
    registry: Arc<SessionRegistry>,
}

impl SnapshotService {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Create a named snapshot of the live workspace, silently replacing an
    /// existing snapshot of the same name.
    pub async fn create(&self, session_id: &str, name: &str) -> Result<()> {
        validate_name(name)?;
        let session = self.registry.get(session_id).await?;
        let _gate = session.gate().write().await;
        self.registry.store().snapshot(session_id, name).await?;
        session.touch().await;
        info!(session_id, name, "snapshot created");
        Ok(())
    }

    /// Replace the live workspace with a snapshot's contents.
    pub async fn restore(&self, session_id: &str, name: &str) -> Result<()> {
        validate_name(name)?;
        let session = self.registry.get(session_id).await?;
        let _gate = session.gate().write().await;
        self.registry.store().restore(session_id, name).await?;
        session.touch().await;
        info!(session_id, name, "workspace restored from snapshot");
        Ok(())
    }

    /// Delete a snapshot. Idempotent.
    pub async fn delete(&self, session_id: &str, name: &str) -> Result<()> {
        validate_name(name)?;
        let session = self.registry.get(session_id).await?;
        let _gate = session.gate().write().await;
        self.registry.store().delete_snapshot(session_id, name).await?;
        session.touch().await;
        Ok(())
    }

    /// List snapshots, oldest first. Shares the gate with live commands, so
    /// it never observes a mutation in progress.
    pub async fn list(&self, session_id: &str) -> Result<Vec<SnapshotInfo>> {
        let session = self.registry.get(session_id).await?;
        let _gate = session.gate().read().await;
        let snapshots = self.registry.store().list_snapshots(session_id).await?;
        session.touch().await;
        Ok(snapshots)
    }

    /// Export a snapshot to a gzip tar archive on disk. Runs concurrently
    /// with commands; the archive reflects the state at snapshot creation.
    pub async fn export(&self, session_id: &str, name: &str) -> Result<ExportManifest> {
        validate_name(name)?;
        let session = self.registry.get(session_id).await?;
        let _gate = session.gate().read().await;
        let manifest = self.registry.store().export(session_id, name).await?;
        session.touch().await;
        info!(session_id, name, archive = %manifest.name, "snapshot exported");
        Ok(manifest)
    }

    /// Import a snapshot from an archive produced by [`Self::export`].
    pub async fn import(&self, session_id: &str, name: &str, archive: &Path) -> Result<()> {
        validate_name(name)?;
        let session = self.registry.get(session_id).await?;
        let _gate = session.gate().write().await;
        self.registry.store().import(session_id, name, archive).await?;
        session.touch().await;
        info!(session_id, name, "snapshot imported");
        Ok(())
    }

    /// Empty the live workspace without touching snapshots.
    pub async fn wipe(&self, session_id: &str) -> Result<()> {
        let session = self.registry.get(session_id).await?;
        let _gate = session.gate().write().await;
        self.registry.store().wipe(session_id).await?;
        session.touch().await;
        info!(session_id, "workspace wiped");
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if is_valid_snapshot_name(name) {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "invalid snapshot name: {:?}",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_name_grammar() {
        assert!(is_valid_snapshot_name("snap-1"));
        assert!(is_valid_snapshot_name("v1.2.3_rc"));
        assert!(!is_valid_snapshot_name(""));
        assert!(!is_valid_snapshot_name("."));
        assert!(!is_valid_snapshot_name(".."));
        assert!(!is_valid_snapshot_name("has space"));
        assert!(!is_valid_snapshot_name("a/b"));
        assert!(!is_valid_snapshot_name(&"x".repeat(65)));
    }
}
