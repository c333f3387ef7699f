//! Plain-directory provider: the portable fallback when no copy-on-write
//! filesystem is available. Snapshots cost O(workspace size).

use std::io;
use std::path::Path;

use async_trait::async_trait;

use crate::provider::{ProviderKind, VolumeProvider};
use crate::{Error, Result};

#[derive(Default)]
pub struct CopyProvider;

impl CopyProvider {
    /// Create a new copy provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VolumeProvider for CopyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Copy
    }

    async fn create_volume(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        run_blocking(move || std::fs::create_dir(&path)).await
    }

    async fn remove_volume(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        run_blocking(move || match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        })
        .await
    }

    async fn snapshot_volume(&self, src: &Path, dst: &Path) -> Result<()> {
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        // Copy into a sibling first so `dst` never holds a half-written tree.
        let tmp = dst.with_file_name(format!(
            ".tmp-{}-{}",
            std::process::id(),
            dst.file_name().and_then(|n| n.to_str()).unwrap_or("snap")
        ));
        run_blocking(move || {
            if tmp.exists() {
                std::fs::remove_dir_all(&tmp)?;
            }
            match copy_tree(&src, &tmp) {
                Ok(()) => std::fs::rename(&tmp, &dst),
                Err(e) => {
                    let _ = std::fs::remove_dir_all(&tmp);
                    Err(e)
                }
            }
        })
        .await
    }

    async fn adopt_directory(&self, staged: &Path, dst: &Path) -> Result<()> {
        let staged = staged.to_path_buf();
        let dst = dst.to_path_buf();
        run_blocking(move || std::fs::rename(&staged, &dst)).await
    }
}

async fn run_blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::provider(format!("blocking task failed: {}", e)))?
        .map_err(Error::Io)
}

/// Recursively copy a directory tree, preserving permissions and symlinks.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    std::fs::set_permissions(dst, std::fs::symlink_metadata(src)?.permissions())?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_preserves_contents_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.txt"), "one").unwrap();
        std::fs::write(src.join("nested/b.txt"), "two").unwrap();
        std::os::unix::fs::symlink("a.txt", src.join("link")).unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "one");
        assert_eq!(
            std::fs::read_to_string(dst.join("nested/b.txt")).unwrap(),
            "two"
        );
        assert_eq!(
            std::fs::read_link(dst.join("link")).unwrap(),
            std::path::PathBuf::from("a.txt")
        );
    }
}
