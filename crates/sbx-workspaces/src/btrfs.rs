//! Btrfs subvolume provider.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::provider::{ProviderKind, VolumeProvider};
use crate::{Error, Result};

/// Btrfs-backed volumes: workspaces and snapshot backings are subvolumes,
/// and a snapshot is `btrfs subvolume snapshot`, sharing blocks with the
/// source until either side is modified.
#[derive(Default)]
pub struct BtrfsProvider;

impl BtrfsProvider {
    /// Create a new btrfs provider.
    pub fn new() -> Self {
        Self
    }

    /// Probe whether the shared pool root at `base` can host
    /// subvolume-backed volumes. Every session's workspace and snapshot
    /// backing will live under this one root, so the decision is made once
    /// at server startup: the btrfs tool must actually run here, and `base`
    /// must sit on a btrfs filesystem. Returns the reason when it cannot,
    /// for the startup log.
    pub fn probe_pool(base: &Path) -> std::result::Result<(), String> {
        if !cfg!(target_os = "linux") {
            return Err("btrfs subvolumes are linux-only".to_string());
        }

        match std::process::Command::new("btrfs")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(_) => return Err("btrfs tool is present but not functional".to_string()),
            Err(e) => return Err(format!("btrfs tool not runnable: {}", e)),
        }

        let output = std::process::Command::new("stat")
            .args(["-f", "-c", "%T"])
            .arg(base)
            .stderr(Stdio::null())
            .output()
            .map_err(|e| format!("cannot stat pool root: {}", e))?;
        if !output.status.success() {
            return Err(format!(
                "cannot determine the filesystem under {}",
                base.display()
            ));
        }
        let fs_type = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if fs_type == "btrfs" {
            Ok(())
        } else {
            Err(format!("pool root is on {}, not btrfs", fs_type))
        }
    }

    /// Execute a btrfs subcommand.
    async fn execute(&self, args: &[&str]) -> Result<()> {
        debug!("btrfs {}", args.join(" "));
        let output = Command::new("btrfs")
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::provider(format!(
                "btrfs {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }

        Ok(())
    }

    fn path_str(path: &Path) -> Result<&str> {
        path.to_str()
            .ok_or_else(|| Error::provider(format!("non-UTF-8 path: {}", path.display())))
    }
}

#[async_trait]
impl VolumeProvider for BtrfsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Btrfs
    }

    async fn create_volume(&self, path: &Path) -> Result<()> {
        self.execute(&["subvolume", "create", Self::path_str(path)?]).await
    }

    async fn remove_volume(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        if self.execute(&["subvolume", "delete", Self::path_str(path)?]).await.is_ok() {
            return Ok(());
        }
        // Not a subvolume (e.g. a plain directory left by a crashed import).
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        })
        .await
        .map_err(|e| Error::provider(format!("remove task failed: {}", e)))?
    }

    async fn snapshot_volume(&self, src: &Path, dst: &Path) -> Result<()> {
        self.execute(&[
            "subvolume",
            "snapshot",
            Self::path_str(src)?,
            Self::path_str(dst)?,
        ])
        .await
    }

    async fn adopt_directory(&self, staged: &Path, dst: &Path) -> Result<()> {
        // A rename cannot turn a directory into a subvolume; create the
        // subvolume and move the staged entries into it, the same shape the
        // extraction-then-move import has always had.
        self.create_volume(dst).await?;
        let staged = staged.to_path_buf();
        let dst = dst.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for entry in std::fs::read_dir(&staged)? {
                let entry = entry?;
                std::fs::rename(entry.path(), dst.join(entry.file_name()))?;
            }
            std::fs::remove_dir(&staged)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::provider(format!("adopt task failed: {}", e)))?
    }
}
