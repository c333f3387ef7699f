//! File service: read/write/list routed into a session's workspace.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::registry::SessionRegistry;
use crate::{paths, Error, Result};

/// Kind of a directory entry as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
            Self::Symlink => "symlink",
            Self::Other => "other",
        }
    }
}

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Session-scoped file operations with workspace confinement.
#[derive(Clone)]
pub struct FileService {
    registry: Arc<SessionRegistry>,
    read_cap: u64,
}

impl FileService {
    pub fn new(registry: Arc<SessionRegistry>, read_cap: u64) -> Self {
        Self { registry, read_cap }
    }

    /// Write a file, creating parent directories as needed. The write goes
    /// to a temporary sibling first and is renamed into place, so readers
    /// never observe a truncated file.
    pub async fn write_file(&self, session_id: &str, path: &str, bytes: Vec<u8>) -> Result<()> {
        let session = self.registry.get(session_id).await?;
        let _gate = session.gate().read().await;
        let (cwd, _) = session.shell_state().await;
        let dest = paths::resolve_file_path(session.workspace_root(), &cwd, path)?;

        let byte_count = bytes.len();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = dest.with_file_name(format!(
                ".{}.tmp-{}",
                dest.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
                std::process::id()
            ));
            std::fs::write(&tmp, &bytes)?;
            match std::fs::rename(&tmp, &dest) {
                Ok(()) => Ok(()),
                Err(e) => {
                    let _ = std::fs::remove_file(&tmp);
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| Error::internal(format!("write task failed: {}", e)))?
        .map_err(|e| io_to_error(e, path))?;

        session.touch().await;
        debug!(session_id, path, bytes = byte_count, "file written");
        Ok(())
    }

    /// Read a file fully into memory, capped at the configured size.
    pub async fn read_file(&self, session_id: &str, path: &str) -> Result<Vec<u8>> {
        let session = self.registry.get(session_id).await?;
        let _gate = session.gate().read().await;
        let (cwd, _) = session.shell_state().await;
        let source = paths::resolve_file_path(session.workspace_root(), &cwd, path)?;

        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|e| io_to_error(e, path))?;
        if meta.len() > self.read_cap {
            return Err(Error::FileTooLarge {
                path: path.to_string(),
                size: meta.len(),
                cap: self.read_cap,
            });
        }

        let bytes = tokio::fs::read(&source).await.map_err(|e| io_to_error(e, path))?;
        session.touch().await;
        Ok(bytes)
    }

    /// List a directory inside the workspace, entries sorted by name.
    pub async fn list_dir(&self, session_id: &str, path: &str) -> Result<Vec<DirEntryInfo>> {
        let session = self.registry.get(session_id).await?;
        let _gate = session.gate().read().await;
        let (cwd, _) = session.shell_state().await;
        let dir = paths::resolve_file_path(session.workspace_root(), &cwd, path)?;

        let entries = tokio::task::spawn_blocking(move || list_blocking(dir))
            .await
            .map_err(|e| Error::internal(format!("list task failed: {}", e)))?
            .map_err(|e| io_to_error(e, path))?;

        session.touch().await;
        Ok(entries)
    }
}

fn list_blocking(dir: PathBuf) -> std::io::Result<Vec<DirEntryInfo>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let file_type = entry.file_type()?;
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        entries.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind,
            size: meta.len(),
            modified_at: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn io_to_error(e: std::io::Error, path: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::invalid_argument(format!("no such file or directory: {}", path))
        }
        std::io::ErrorKind::NotADirectory => {
            Error::invalid_argument(format!("not a directory: {}", path))
        }
        _ => Error::internal(format!("file operation on {} failed: {}", path, e)),
    }
}
