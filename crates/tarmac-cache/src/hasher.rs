//! Deterministic digest over a set of input files.
//!
//! The digest depends only on which files match the include globs after
//! exclusion, and on their relative paths and byte contents. Files are
//! absorbed in lexicographic order of their repo-relative POSIX paths, so
//! the result is stable across platforms and traversal order.

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tarmac_core::{Error, Result};
use walkdir::WalkDir;

/// Exclusions applied to every hash, before the caller's own.
const DEFAULT_EXCLUDES: &[&str] = &[".git/**", "**/__pycache__/**"];

const FILE_SEP: u8 = 0x00;
const LINK_SEP: u8 = 0x01;

/// Hash the files under `root` selected by `include` minus `exclude`.
///
/// Returns a 64-character hex SHA-256 digest. Globs that match nothing
/// contribute nothing and do not fail.
pub fn hash_inputs(root: &Path, include: &[String], exclude: &[String]) -> Result<String> {
    let include_set = build_include_set(root, include)?;
    let exclude_set = build_exclude_set(exclude)?;

    let mut matched: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let file_type = entry.file_type();
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }
        let rel = match posix_relative(entry.path(), root) {
            Some(rel) => rel,
            None => continue,
        };
        if include_set.is_match(&rel) && !exclude_set.is_match(&rel) {
            matched.push((rel, entry.path().to_path_buf()));
        }
    }
    matched.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (rel, path) in matched {
        absorb_entry(&mut hasher, root, &rel, &path)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Per entry: relative path bytes, a separator byte, the payload length
/// as big-endian u64, then the payload. Symlinks are followed only when
/// their target stays inside `root`; otherwise the textual link target is
/// the payload, under a distinct separator.
fn absorb_entry(hasher: &mut Sha256, root: &Path, rel: &str, path: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path)?;
        if !link_target_within_root(path, root) {
            let text = target.to_string_lossy();
            hasher.update(rel.as_bytes());
            hasher.update([LINK_SEP]);
            hasher.update((text.len() as u64).to_be_bytes());
            hasher.update(text.as_bytes());
            return Ok(());
        }
        // Falls through: the target is inside root, absorb its content.
    }
    let len = std::fs::metadata(path)?.len();
    hasher.update(rel.as_bytes());
    hasher.update([FILE_SEP]);
    hasher.update(len.to_be_bytes());

    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

fn link_target_within_root(link: &Path, root: &Path) -> bool {
    let resolved = match std::fs::canonicalize(link) {
        Ok(p) => p,
        Err(_) => return false,
    };
    match std::fs::canonicalize(root) {
        Ok(root) => resolved.starts_with(root) && resolved.is_file(),
        Err(_) => false,
    }
}

fn build_include_set(root: &Path, patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.trim().trim_end_matches('/');
        if pattern.is_empty() {
            continue;
        }
        builder.add(glob(pattern)?);
        // A bare directory name selects its whole tree.
        if !pattern.contains(['*', '?', '[']) && root.join(pattern).is_dir() {
            builder.add(glob(&format!("{pattern}/**"))?);
        }
    }
    builder
        .build()
        .map_err(|e| Error::Internal(format!("bad input globs: {e}")))
}

fn build_exclude_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in DEFAULT_EXCLUDES {
        builder.add(glob(pattern)?);
    }
    for pattern in patterns {
        let pattern = pattern.trim();
        if !pattern.is_empty() {
            builder.add(glob(pattern)?);
        }
    }
    builder
        .build()
        .map_err(|e| Error::Internal(format!("bad exclude globs: {e}")))
}

fn glob(pattern: &str) -> Result<Glob> {
    Glob::new(pattern).map_err(|e| Error::Internal(format!("bad glob '{pattern}': {e}")))
}

/// Repo-relative path with `/` separators, or None for paths outside root.
fn posix_relative(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
