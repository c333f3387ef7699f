//! Workspace path confinement.
//!
//! File paths from clients are sandbox-absolute: a leading `/` addresses the
//! workspace root. Working-directory values are host paths that must already
//! lie inside the root. Both are normalized and symlink-resolved before the
//! prefix check, so neither `..` chains nor symlinks reach outside.

use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// Upper bound on symlink hops while resolving a candidate path.
const MAX_SYMLINK_HOPS: u32 = 40;

/// Resolve a client-supplied file path against a session workspace.
///
/// Absolute paths are re-rooted at `root`; relative paths resolve against
/// `cwd` (itself inside the root). Returns `PathEscape` if the result leaves
/// the workspace after normalization and symlink expansion.
pub fn resolve_file_path(root: &Path, cwd: &Path, raw: &str) -> Result<PathBuf> {
    if raw.is_empty() {
        return Err(Error::invalid_argument("empty path"));
    }
    let candidate = match raw.strip_prefix('/') {
        Some(stripped) => root.join(stripped),
        None => cwd.join(raw),
    };
    confine(root, &candidate).ok_or_else(|| Error::path_escape(raw))
}

/// Resolve a working-directory value: absolute host paths are taken as-is
/// and must sit inside the root; relative paths resolve against `current`.
pub fn resolve_cwd(root: &Path, current: &Path, raw: &str) -> Result<PathBuf> {
    if raw.is_empty() {
        return Err(Error::invalid_argument("empty cwd"));
    }
    let raw_path = Path::new(raw);
    let candidate = if raw_path.is_absolute() {
        raw_path.to_path_buf()
    } else {
        current.join(raw_path)
    };
    confine(root, &candidate).ok_or_else(|| Error::path_escape(raw))
}

/// Normalize `candidate` and verify it stays under `root` once every
/// existing component (including dangling symlinks) has been resolved.
/// Returns the normalized path on success.
fn confine(root: &Path, candidate: &Path) -> Option<PathBuf> {
    let root = std::fs::canonicalize(root).ok()?;
    let normalized = lexical_normalize(candidate)?;
    let resolved = resolve_symlinks(&normalized)?;
    if resolved.starts_with(&root) {
        Some(normalized)
    } else {
        None
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
/// Popping past the filesystem root fails.
fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
            Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Resolve the longest existing prefix of `path` (following symlinks, even
/// dangling ones) and re-append the non-existing tail.
fn resolve_symlinks(path: &Path) -> Option<PathBuf> {
    let mut current = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    let mut hops = 0;

    loop {
        match std::fs::canonicalize(&current) {
            Ok(resolved) => {
                let mut out = resolved;
                for part in tail.iter().rev() {
                    out.push(part);
                }
                return Some(out);
            }
            Err(_) => {
                // A dangling symlink canonicalizes to nothing but still
                // redirects writes; chase its target by hand.
                if let Ok(meta) = std::fs::symlink_metadata(&current) {
                    if meta.file_type().is_symlink() {
                        hops += 1;
                        if hops > MAX_SYMLINK_HOPS {
                            return None;
                        }
                        let target = std::fs::read_link(&current).ok()?;
                        let base = current.parent()?.to_path_buf();
                        let next = if target.is_absolute() {
                            target
                        } else {
                            base.join(target)
                        };
                        current = lexical_normalize(&next)?;
                        continue;
                    }
                }
                tail.push(current.file_name()?.to_os_string());
                current = current.parent()?.to_path_buf();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        std::fs::create_dir(&root).unwrap();
        let root = root.canonicalize().unwrap();
        (dir, root)
    }

    #[test]
    fn absolute_paths_are_rerooted() {
        let (_dir, root) = setup();
        let resolved = resolve_file_path(&root, &root, "/a.txt").unwrap();
        assert_eq!(resolved, root.join("a.txt"));
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let (_dir, root) = setup();
        let cwd = root.join("sub");
        std::fs::create_dir(&cwd).unwrap();
        let resolved = resolve_file_path(&root, &cwd, "b.txt").unwrap();
        assert_eq!(resolved, cwd.join("b.txt"));
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let (_dir, root) = setup();
        assert!(matches!(
            resolve_file_path(&root, &root, "../../etc/passwd"),
            Err(Error::PathEscape { .. })
        ));
        assert!(matches!(
            resolve_file_path(&root, &root, "/ok/../../../etc/passwd"),
            Err(Error::PathEscape { .. })
        ));
    }

    #[test]
    fn dotdot_inside_the_root_is_fine() {
        let (_dir, root) = setup();
        std::fs::create_dir(root.join("sub")).unwrap();
        let resolved = resolve_file_path(&root, &root, "/sub/../a.txt").unwrap();
        assert_eq!(resolved, root.join("a.txt"));
    }

    #[test]
    fn host_absolute_cwd_outside_root_is_rejected() {
        let (_dir, root) = setup();
        assert!(matches!(
            resolve_cwd(&root, &root, "/etc"),
            Err(Error::PathEscape { .. })
        ));
    }

    #[test]
    fn cwd_inside_root_is_accepted() {
        let (_dir, root) = setup();
        let sub = root.join("project");
        std::fs::create_dir(&sub).unwrap();
        assert_eq!(
            resolve_cwd(&root, &root, sub.to_str().unwrap()).unwrap(),
            sub
        );
        assert_eq!(resolve_cwd(&root, &root, "project").unwrap(), sub);
    }

    #[test]
    fn symlink_escape_is_rejected() {
        let (dir, root) = setup();
        let outside = dir.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("leak")).unwrap();

        assert!(matches!(
            resolve_file_path(&root, &root, "/leak/secret.txt"),
            Err(Error::PathEscape { .. })
        ));
    }

    #[test]
    fn dangling_symlink_escape_is_rejected() {
        let (dir, root) = setup();
        let target = dir.path().join("not-yet-there");
        std::os::unix::fs::symlink(&target, root.join("dangling")).unwrap();

        assert!(matches!(
            resolve_file_path(&root, &root, "/dangling"),
            Err(Error::PathEscape { .. })
        ));
    }

    #[test]
    fn symlink_within_root_is_accepted() {
        let (_dir, root) = setup();
        std::fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();

        let resolved = resolve_file_path(&root, &root, "/alias/file.txt").unwrap();
        assert_eq!(resolved, root.join("alias/file.txt"));
    }

    #[test]
    fn empty_paths_are_invalid() {
        let (_dir, root) = setup();
        assert!(matches!(
            resolve_file_path(&root, &root, ""),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            resolve_cwd(&root, &root, ""),
            Err(Error::InvalidArgument { .. })
        ));
    }
}
