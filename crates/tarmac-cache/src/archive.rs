//! Tar-gzip archive helpers for cache entries.
//!
//! Archives record paths relative to a workspace anchor so extraction
//! under any workspace reproduces the captured trees. A listed directory
//! that does not exist is stored as an empty placeholder entry, making
//! restore total.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::path::Path;
use tarmac_core::{Error, Result};

/// Write a gzip-compressed tar of `dirs` (workspace-relative) to `writer`.
pub fn create_archive<W: Write>(writer: W, workspace: &Path, dirs: &[String]) -> Result<()> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for dir in dirs {
        let abs = workspace.join(dir);
        if abs.is_dir() {
            builder
                .append_dir_all(dir, &abs)
                .map_err(|e| Error::Internal(format!("failed to pack '{dir}': {e}")))?;
        } else if abs.is_file() {
            builder
                .append_path_with_name(&abs, dir)
                .map_err(|e| Error::Internal(format!("failed to pack '{dir}': {e}")))?;
        } else {
            append_empty_dir(&mut builder, dir)?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::Internal(format!("failed to finish tar: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Internal(format!("gzip finish failed: {e}")))?;
    Ok(())
}

fn append_empty_dir<W: Write>(builder: &mut tar::Builder<W>, dir: &str) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(0o755);
    header.set_size(0);
    header.set_cksum();
    let name = format!("{}/", dir.trim_end_matches('/'));
    builder
        .append_data(&mut header, name, std::io::empty())
        .map_err(|e| Error::Internal(format!("failed to record empty dir '{dir}': {e}")))?;
    Ok(())
}

/// Extract an archive under `dest`. Entries escaping `dest` are refused
/// by the tar crate, so overwrites stay confined to the captured trees.
pub fn extract_archive<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let decoder = GzDecoder::new(reader);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest)
        .map_err(|e| Error::CorruptEntry(format!("failed to unpack archive: {e}")))?;
    Ok(())
}

/// Structural check: the archive decompresses and every entry header is
/// readable. Does not extract anything.
pub fn verify_archive<R: Read>(reader: R) -> Result<()> {
    let decoder = GzDecoder::new(reader);
    let mut archive = tar::Archive::new(decoder);
    let entries = archive
        .entries()
        .map_err(|e| Error::CorruptEntry(format!("unreadable archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::CorruptEntry(format!("bad entry: {e}")))?;
        let mut sink = std::io::sink();
        std::io::copy(&mut entry, &mut sink)
            .map_err(|e| Error::CorruptEntry(format!("truncated entry: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("out/nested")).unwrap();
        std::fs::write(src.path().join("out/a.bin"), b"alpha").unwrap();
        std::fs::write(src.path().join("out/nested/b.bin"), b"beta").unwrap();

        let mut blob = Vec::new();
        create_archive(&mut blob, src.path(), &["out".to_string()]).unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract_archive(blob.as_slice(), dest.path()).unwrap();

        assert_eq!(std::fs::read(dest.path().join("out/a.bin")).unwrap(), b"alpha");
        assert_eq!(
            std::fs::read(dest.path().join("out/nested/b.bin")).unwrap(),
            b"beta"
        );
    }

    #[test]
    fn test_missing_dir_becomes_empty_placeholder() {
        let src = tempfile::tempdir().unwrap();
        let mut blob = Vec::new();
        create_archive(&mut blob, src.path(), &["never-created".to_string()]).unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract_archive(blob.as_slice(), dest.path()).unwrap();
        assert!(dest.path().join("never-created").is_dir());
    }

    #[test]
    fn test_verify_accepts_good_archive() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("d")).unwrap();
        std::fs::write(src.path().join("d/f"), b"x").unwrap();
        let mut blob = Vec::new();
        create_archive(&mut blob, src.path(), &["d".to_string()]).unwrap();
        verify_archive(blob.as_slice()).unwrap();
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let err = verify_archive(&b"definitely not a tarball"[..]).unwrap_err();
        assert!(matches!(err, Error::CorruptEntry(_)));
    }

    #[test]
    fn test_verify_rejects_truncated() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("d")).unwrap();
        std::fs::write(src.path().join("d/f"), vec![7u8; 32 * 1024]).unwrap();
        let mut blob = Vec::new();
        create_archive(&mut blob, src.path(), &["d".to_string()]).unwrap();
        blob.truncate(blob.len() / 2);
        assert!(verify_archive(blob.as_slice()).is_err());
    }
}
