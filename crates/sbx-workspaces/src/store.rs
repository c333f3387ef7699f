//! The workspace store: owner of every byte on disk belonging to sessions.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::archive;
use crate::provider::{detect_provider, ProviderKind, VolumeProvider};
use crate::{Error, Result};

/// On-disk roots the store operates under.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    /// Live session workspaces, one volume per session id.
    pub workspaces: PathBuf,
    /// Snapshot backings, `<snapshots>/<session_id>/<name>`.
    pub snapshots: PathBuf,
    /// Exported archives, `<exports>/<session_id>/<file>`.
    pub exports: PathBuf,
}

impl StoreLayout {
    /// Standard layout under a single data root.
    pub fn under(root: &Path) -> Self {
        Self {
            workspaces: root.join("workspaces"),
            snapshots: root.join("snapshots"),
            exports: root.join("exports"),
        }
    }
}

/// A snapshot as reported to clients.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Result of exporting a snapshot to an archive on disk.
#[derive(Debug, Clone)]
pub struct ExportManifest {
    /// Archive file name inside the session's exports directory.
    pub name: String,
    /// Full path of the archive.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Per-session rooted filesystems with named snapshots and tarball
/// export/import. All destructive operations are idempotent.
pub struct WorkspaceStore {
    layout: StoreLayout,
    provider: Box<dyn VolumeProvider>,
}

impl WorkspaceStore {
    /// Open a store, auto-detecting the best volume provider for the
    /// workspace root (btrfs subvolumes when available, copies otherwise).
    pub fn open(layout: StoreLayout) -> Result<Self> {
        Self::create_roots(&layout)?;
        let provider = detect_provider(&layout.workspaces);
        info!(kind = ?provider.kind(), "workspace store ready");
        Ok(Self { layout, provider })
    }

    /// Open a store with an explicit provider.
    pub fn with_provider(layout: StoreLayout, provider: Box<dyn VolumeProvider>) -> Result<Self> {
        Self::create_roots(&layout)?;
        Ok(Self { layout, provider })
    }

    fn create_roots(layout: &StoreLayout) -> Result<()> {
        std::fs::create_dir_all(&layout.workspaces)?;
        std::fs::create_dir_all(&layout.snapshots)?;
        std::fs::create_dir_all(&layout.exports)?;
        Ok(())
    }

    /// The provider kind in use.
    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Root path of a session's live workspace.
    pub fn workspace_path(&self, session_id: &str) -> PathBuf {
        self.layout.workspaces.join(session_id)
    }

    /// Directory holding a session's exported archives.
    pub fn exports_dir(&self, session_id: &str) -> PathBuf {
        self.layout.exports.join(session_id)
    }

    fn snapshots_dir(&self, session_id: &str) -> PathBuf {
        self.layout.snapshots.join(session_id)
    }

    fn backing_path(&self, session_id: &str, name: &str) -> PathBuf {
        self.snapshots_dir(session_id).join(name)
    }

    /// Create a fresh empty workspace for a session.
    pub async fn materialize(&self, session_id: &str) -> Result<PathBuf> {
        let path = self.workspace_path(session_id);
        self.provider.create_volume(&path).await?;
        debug!(session_id, path = %path.display(), "workspace materialized");
        Ok(path)
    }

    /// Remove a session's workspace, snapshots, and exports. Idempotent.
    pub async fn destroy(&self, session_id: &str) -> Result<()> {
        self.provider.remove_volume(&self.workspace_path(session_id)).await?;

        let snapshots_dir = self.snapshots_dir(session_id);
        if snapshots_dir.exists() {
            for entry in std::fs::read_dir(&snapshots_dir)? {
                let entry = entry?;
                self.provider.remove_volume(&entry.path()).await?;
            }
            if let Err(e) = std::fs::remove_dir(&snapshots_dir) {
                warn!(session_id, "could not remove snapshots dir: {}", e);
            }
        }

        match std::fs::remove_dir_all(self.exports_dir(session_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        debug!(session_id, "workspace destroyed");
        Ok(())
    }

    /// Empty a session's live workspace without touching its snapshots.
    pub async fn wipe(&self, session_id: &str) -> Result<()> {
        let root = self.workspace_path(session_id);
        tokio::task::spawn_blocking(move || -> Result<()> {
            for entry in std::fs::read_dir(&root)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    std::fs::remove_dir_all(entry.path())?;
                } else {
                    std::fs::remove_file(entry.path())?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::provider(format!("wipe task failed: {}", e)))?
    }

    /// Create (or silently replace) a named snapshot of the live workspace.
    pub async fn snapshot(&self, session_id: &str, name: &str) -> Result<()> {
        std::fs::create_dir_all(self.snapshots_dir(session_id))?;
        let backing = self.backing_path(session_id, name);
        if backing.exists() {
            debug!(session_id, name, "replacing existing snapshot");
            self.provider.remove_volume(&backing).await?;
        }
        self.provider.snapshot_volume(&self.workspace_path(session_id), &backing).await?;
        debug!(session_id, name, "snapshot created");
        Ok(())
    }

    /// Replace the live workspace with a snapshot's contents.
    pub async fn restore(&self, session_id: &str, name: &str) -> Result<()> {
        let backing = self.backing_path(session_id, name);
        if !backing.exists() {
            return Err(Error::snapshot_not_found(name));
        }
        let workspace = self.workspace_path(session_id);
        self.provider.remove_volume(&workspace).await?;
        self.provider.snapshot_volume(&backing, &workspace).await?;
        debug!(session_id, name, "workspace restored");
        Ok(())
    }

    /// List a session's snapshots, oldest first.
    pub async fn list_snapshots(&self, session_id: &str) -> Result<Vec<SnapshotInfo>> {
        let dir = self.snapshots_dir(session_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            snapshots.push(SnapshotInfo {
                created_at: change_time(&entry.path())?,
                name,
            });
        }
        snapshots.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name))
        });
        Ok(snapshots)
    }

    /// Delete a named snapshot. Idempotent.
    pub async fn delete_snapshot(&self, session_id: &str, name: &str) -> Result<()> {
        let backing = self.backing_path(session_id, name);
        if backing.exists() {
            self.provider.remove_volume(&backing).await?;
            debug!(session_id, name, "snapshot deleted");
        }
        Ok(())
    }

    /// Export a snapshot as a gzip tar in the session's exports directory.
    pub async fn export(&self, session_id: &str, name: &str) -> Result<ExportManifest> {
        let backing = self.backing_path(session_id, name);
        if !backing.exists() {
            return Err(Error::snapshot_not_found(name));
        }

        let exports_dir = self.exports_dir(session_id);
        std::fs::create_dir_all(&exports_dir)?;
        let file_name = format!("{}_{}.tar.gz", name, Utc::now().timestamp());
        let path = exports_dir.join(&file_name);

        let archive_path = path.clone();
        let summary = tokio::task::spawn_blocking(move || {
            archive::write_archive(&backing, &archive_path)
        })
        .await
        .map_err(|e| Error::provider(format!("export task failed: {}", e)))?;

        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };

        debug!(session_id, name, size = summary.size_bytes, "snapshot exported");
        Ok(ExportManifest {
            name: file_name,
            path,
            size_bytes: summary.size_bytes,
            sha256: summary.sha256,
        })
    }

    /// Materialize a snapshot named `name` from an archive produced by
    /// [`WorkspaceStore::export`]. A rejected archive leaves no trace.
    pub async fn import(&self, session_id: &str, name: &str, archive_file: &Path) -> Result<()> {
        let staging_root = self.layout.snapshots.join(".staging");
        std::fs::create_dir_all(&staging_root)?;
        let staging = staging_root.join(unique_suffix());

        let archive_file = archive_file.to_path_buf();
        let staging_clone = staging.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            archive::extract_archive(&archive_file, &staging_clone)
        })
        .await
        .map_err(|e| Error::provider(format!("import task failed: {}", e)))?;

        if let Err(e) = extracted {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        std::fs::create_dir_all(self.snapshots_dir(session_id))?;
        let backing = self.backing_path(session_id, name);
        if backing.exists() {
            self.provider.remove_volume(&backing).await?;
        }

        if let Err(e) = self.provider.adopt_directory(&staging, &backing).await {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        debug!(session_id, name, "snapshot imported");
        Ok(())
    }
}

/// Creation timestamp of a snapshot backing (inode change time).
fn change_time(path: &Path) -> Result<DateTime<Utc>> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path)?;
    DateTime::from_timestamp(meta.ctime(), meta.ctime_nsec() as u32)
        .ok_or_else(|| Error::provider("snapshot timestamp out of range"))
}

/// Unique suffix for staging directories, stable across concurrent imports.
fn unique_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(
        "import_{}_{}_{}",
        std::process::id(),
        timestamp,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
