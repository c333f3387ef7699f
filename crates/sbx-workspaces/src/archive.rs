//! Gzip tar export/import for snapshot backings.
//!
//! Exports place every file under one literal `workspace` top-level entry,
//! walk the tree in sorted order, and digest the compressed stream as it is
//! written, so exporting the same snapshot twice produces byte-identical
//! archives with the same sha256. Imports refuse absolute paths, parent
//! traversal, device/fifo entries, and any link — hard or symbolic — whose
//! target leaves the archive; a crafted symlink followed by a write through
//! it would otherwise land files outside the staging directory.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tar::EntryType;

use crate::{Error, Result};

/// Name of the single top-level directory inside every exported archive.
pub const ARCHIVE_TOP_LEVEL: &str = "workspace";

/// Size and digest of a finished archive.
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub size_bytes: u64,
    pub sha256: String,
}

/// Write a gzip tar of `src` to `dest`, all entries under `workspace/`.
///
/// Memory use is bounded by the codec buffers regardless of tree size.
pub fn write_archive(src: &Path, dest: &Path) -> Result<ArchiveSummary> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(HashingWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    builder.append_dir(ARCHIVE_TOP_LEVEL, src)?;
    append_tree(&mut builder, src, Path::new(ARCHIVE_TOP_LEVEL))?;

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    Ok(writer.finish())
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            builder.append_dir(&name, &path)?;
            append_tree(builder, &path, &name)?;
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&path)?;
            let mut header = tar::Header::new_gnu();
            header.set_metadata(&meta);
            header.set_size(0);
            builder.append_link(&mut header, &name, &target)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }
    Ok(())
}

/// Extract a gzip tar produced by [`write_archive`] into `staging`.
///
/// Every entry is validated before anything is written for it; the caller
/// discards the staging directory wholesale if this returns an error, so a
/// rejected archive leaves no partial snapshot behind.
pub fn extract_archive(archive: &Path, staging: &Path) -> Result<()> {
    let file = File::open(archive)
        .map_err(|e| Error::import_failed(format!("cannot open archive: {}", e)))?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));
    std::fs::create_dir_all(staging)?;

    let entries = tarball
        .entries()
        .map_err(|e| Error::import_failed(format!("not a gzip tar archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::import_failed(format!("corrupt archive: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| Error::import_failed(format!("unreadable entry path: {}", e)))?
            .into_owned();

        let Some(rel) = validate_entry_path(&path)? else {
            // the workspace/ directory itself
            continue;
        };
        let dest = staging.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory => {
                entry
                    .unpack(&dest)
                    .map_err(|e| Error::import_failed(format!(
                        "failed to unpack {}: {}",
                        path.display(),
                        e
                    )))?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| Error::import_failed(format!("unreadable link target: {}", e)))?
                    .ok_or_else(|| Error::import_failed("symlink without a target"))?
                    .into_owned();
                // Later entries unpack through symlinks that already exist,
                // so a target reaching outside the staging directory turns
                // into an arbitrary host write. Refuse it up front.
                validate_symlink_target(&rel, &target)?;
                entry
                    .unpack(&dest)
                    .map_err(|e| Error::import_failed(format!(
                        "failed to unpack {}: {}",
                        path.display(),
                        e
                    )))?;
            }
            EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|e| Error::import_failed(format!("unreadable link target: {}", e)))?
                    .ok_or_else(|| Error::import_failed("hard link without a target"))?
                    .into_owned();
                let target_rel = validate_entry_path(&target)?.ok_or_else(|| {
                    Error::import_failed(format!(
                        "hard link target outside the archive: {}",
                        target.display()
                    ))
                })?;
                std::fs::hard_link(staging.join(&target_rel), &dest).map_err(|e| {
                    Error::import_failed(format!(
                        "failed to link {} -> {}: {}",
                        path.display(),
                        target.display(),
                        e
                    ))
                })?;
            }
            other => {
                return Err(Error::import_failed(format!(
                    "unsupported entry type {:?} for {}",
                    other,
                    path.display()
                )));
            }
        }
    }

    Ok(())
}

/// Check an archive path: must live under `workspace/`, contain no absolute
/// or parent components. Returns the path relative to the top-level entry,
/// or `None` for the top-level entry itself.
fn validate_entry_path(path: &Path) -> Result<Option<PathBuf>> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == ARCHIVE_TOP_LEVEL => {}
        _ => {
            return Err(Error::import_failed(format!(
                "entry outside the {} directory: {}",
                ARCHIVE_TOP_LEVEL,
                path.display()
            )));
        }
    }

    let mut rel = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::import_failed(format!(
                    "illegal path component in {}",
                    path.display()
                )));
            }
        }
    }

    if rel.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(rel))
    }
}

/// Check a symlink target: it must be relative and, resolved against the
/// link's own directory, stay inside the archive. `link_rel` is the link's
/// path relative to the top-level entry.
fn validate_symlink_target(link_rel: &Path, target: &Path) -> Result<()> {
    let reject = || {
        Error::import_failed(format!(
            "symlink target escapes the archive: {} -> {}",
            link_rel.display(),
            target.display()
        ))
    };

    // depth of the directory the link lives in, relative to the archive root
    let mut depth = link_rel.parent().map_or(0, |p| p.components().count()) as isize;
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(reject());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(reject()),
        }
    }
    Ok(())
}

/// Write adapter that digests and counts everything passing through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> ArchiveSummary {
        let digest = self.hasher.finalize();
        let mut sha256 = String::with_capacity(64);
        for byte in digest {
            sha256.push_str(&format!("{:02x}", byte));
        }
        ArchiveSummary {
            size_bytes: self.written,
            sha256,
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_paths_must_live_under_workspace() {
        assert!(validate_entry_path(Path::new("workspace/a.txt")).unwrap().is_some());
        assert!(validate_entry_path(Path::new("workspace")).unwrap().is_none());
        assert!(validate_entry_path(Path::new("elsewhere/a.txt")).is_err());
        assert!(validate_entry_path(Path::new("/etc/passwd")).is_err());
        assert!(validate_entry_path(Path::new("workspace/../escape")).is_err());
    }

    #[test]
    fn symlink_targets_must_stay_inside_the_archive() {
        // in-archive targets, including upward hops that stay inside
        assert!(validate_symlink_target(Path::new("link"), Path::new("hello.txt")).is_ok());
        assert!(validate_symlink_target(Path::new("a/b/link"), Path::new("../sibling")).is_ok());
        assert!(validate_symlink_target(Path::new("a/link"), Path::new("./same/dir")).is_ok());

        // absolute or escaping targets
        assert!(validate_symlink_target(Path::new("link"), Path::new("/etc")).is_err());
        assert!(validate_symlink_target(Path::new("link"), Path::new("../outside")).is_err());
        assert!(
            validate_symlink_target(Path::new("a/link"), Path::new("../../outside")).is_err()
        );
        assert!(
            validate_symlink_target(Path::new("a/b/link"), Path::new("../../../etc/passwd"))
                .is_err()
        );
    }
}
