//! Filesystem cache store.
//!
//! Layout under the cache root:
//!
//! ```text
//! <cache_root>/<job-name>/<key>.tar.gz
//! <cache_root>/<job-name>/<key>.meta
//! ```
//!
//! Entries sharing a job name form a key family; prune operates per
//! family. Writers follow an atomic-rename discipline so readers in
//! other processes never observe half-written archives, and prune holds
//! a per-job advisory file lock while it rewrites listings.

use crate::archive;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tarmac_core::{Error, Result};
use tracing::{debug, warn};

/// Sidecar metadata for one cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub created_at: DateTime<Utc>,
    pub size: u64,
    /// Workspace the trees were captured from.
    pub anchor: String,
    /// The directories the archive holds, workspace-relative.
    pub dirs: Vec<String>,
}

/// Content-addressed store of compressed directory trees.
#[derive(Clone)]
pub struct CacheStore {
    root: PathBuf,
    /// (job, key) stores currently in flight in this process. A second
    /// simultaneous store for the same entry observes the first and skips.
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job: &str) -> PathBuf {
        self.root.join(sanitize(job))
    }

    fn archive_path(&self, job: &str, key: &str) -> PathBuf {
        self.job_dir(job).join(format!("{key}.tar.gz"))
    }

    fn meta_path(&self, job: &str, key: &str) -> PathBuf {
        self.job_dir(job).join(format!("{key}.meta"))
    }

    /// Whether a structurally sound entry exists for (job, key).
    ///
    /// A corrupt entry is quarantined with a `.corrupt` suffix and
    /// reported absent, so it neither serves nor reappears.
    pub async fn lookup(&self, job: &str, key: &str) -> Result<bool> {
        let archive_path = self.archive_path(job, key);
        let meta_path = self.meta_path(job, key);
        tokio::task::spawn_blocking(move || lookup_sync(&archive_path, &meta_path))
            .await
            .map_err(|e| Error::Internal(format!("lookup task failed: {e}")))?
    }

    /// Extract the entry's trees under `workspace`.
    pub async fn restore(&self, job: &str, key: &str, workspace: &Path) -> Result<()> {
        let archive_path = self.archive_path(job, key);
        let workspace = workspace.to_path_buf();
        let job = job.to_string();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let file = File::open(&archive_path)
                .map_err(|e| Error::CorruptEntry(format!("{job}/{key}: {e}")))?;
            archive::extract_archive(file, &workspace)?;
            debug!(job = %job, key = %key, "cache restored");
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("restore task failed: {e}")))?
    }

    /// Capture `dirs` from `workspace` as the entry for (job, key).
    ///
    /// Returns false when the entry already exists or another store for
    /// the same entry is in flight in this process. The archive is built
    /// at a temporary path in the entry's directory, fsynced, then
    /// renamed into place.
    pub async fn store(
        &self,
        job: &str,
        key: &str,
        workspace: &Path,
        dirs: &[String],
    ) -> Result<bool> {
        let token = format!("{}/{key}", sanitize(job));
        {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| Error::Internal("cache store lock poisoned".to_string()))?;
            if !in_flight.insert(token.clone()) {
                debug!(job, key, "coalesced concurrent store");
                return Ok(false);
            }
        }
        let result = self.store_inner(job, key, workspace, dirs).await;
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&token);
        }
        result
    }

    async fn store_inner(
        &self,
        job: &str,
        key: &str,
        workspace: &Path,
        dirs: &[String],
    ) -> Result<bool> {
        let job_dir = self.job_dir(job);
        let archive_path = self.archive_path(job, key);
        let meta_path = self.meta_path(job, key);
        let workspace = workspace.to_path_buf();
        let dirs = dirs.to_vec();
        let job = job.to_string();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            if archive_path.exists() && meta_path.exists() {
                return Ok(false);
            }
            std::fs::create_dir_all(&job_dir)?;

            let tmp_path = job_dir.join(format!("{key}.tar.gz.tmp"));
            let result = write_entry(&tmp_path, &archive_path, &meta_path, &workspace, &dirs);
            if result.is_err() {
                let _ = std::fs::remove_file(&tmp_path);
            }
            result?;
            debug!(job = %job, key = %key, "cache stored");
            Ok(true)
        })
        .await
        .map_err(|e| Error::Internal(format!("store task failed: {e}")))?
    }

    /// Remove the oldest entries in the job's family, keeping the
    /// `keep_last_n` newest by creation time. Returns how many entries
    /// were removed.
    pub async fn prune(&self, job: &str, keep_last_n: usize) -> Result<usize> {
        let job_dir = self.job_dir(job);
        tokio::task::spawn_blocking(move || prune_sync(&job_dir, keep_last_n))
            .await
            .map_err(|e| Error::Internal(format!("prune task failed: {e}")))?
    }
}

fn lookup_sync(archive_path: &Path, meta_path: &Path) -> Result<bool> {
    if !archive_path.exists() || !meta_path.exists() {
        return Ok(false);
    }
    let sound = read_meta(meta_path).is_ok()
        && File::open(archive_path)
            .map_err(Error::Io)
            .and_then(archive::verify_archive)
            .is_ok();
    if sound {
        return Ok(true);
    }
    quarantine(archive_path);
    quarantine(meta_path);
    warn!(path = %archive_path.display(), "quarantined corrupt cache entry");
    Ok(false)
}

fn quarantine(path: &Path) {
    if path.exists() {
        let mut target = path.as_os_str().to_owned();
        target.push(".corrupt");
        let _ = std::fs::rename(path, PathBuf::from(target));
    }
}

fn write_entry(
    tmp_path: &Path,
    archive_path: &Path,
    meta_path: &Path,
    workspace: &Path,
    dirs: &[String],
) -> Result<()> {
    let tmp = File::create(tmp_path)?;
    archive::create_archive(&tmp, workspace, dirs)?;
    tmp.sync_all()?;
    drop(tmp);
    std::fs::rename(tmp_path, archive_path)?;

    let meta = EntryMeta {
        created_at: Utc::now(),
        size: std::fs::metadata(archive_path)?.len(),
        anchor: workspace.to_string_lossy().into_owned(),
        dirs: dirs.to_vec(),
    };
    let body = serde_json::to_vec_pretty(&meta)?;
    std::fs::write(meta_path, body)?;
    Ok(())
}

fn read_meta(path: &Path) -> Result<EntryMeta> {
    let body = std::fs::read(path)?;
    serde_json::from_slice(&body).map_err(|e| Error::CorruptEntry(format!("bad meta: {e}")))
}

fn prune_sync(job_dir: &Path, keep_last_n: usize) -> Result<usize> {
    if !job_dir.is_dir() {
        return Ok(0);
    }
    // Advisory lock: concurrent prunes for the same job in other
    // processes wait here instead of racing the listing below.
    let lock = File::create(job_dir.join(".lock"))?;
    lock.lock_exclusive()?;

    let mut entries: Vec<(DateTime<Utc>, PathBuf)> = Vec::new();
    for dir_entry in std::fs::read_dir(job_dir)? {
        let path = dir_entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("meta") {
            continue;
        }
        if let Ok(meta) = read_meta(&path) {
            entries.push((meta.created_at, path));
        }
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, meta_path) in entries.into_iter().skip(keep_last_n) {
        let archive_path = meta_path.with_extension("tar.gz");
        let _ = std::fs::remove_file(&archive_path);
        let _ = std::fs::remove_file(&meta_path);
        removed += 1;
    }
    FileExt::unlock(&lock)?;
    if removed > 0 {
        debug!(dir = %job_dir.display(), removed, "pruned cache entries");
    }
    Ok(removed)
}

/// Job names become directory names; keep them filesystem-safe.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_workspace() -> tempfile::TempDir {
        let ws = tempfile::tempdir().unwrap();
        std::fs::create_dir(ws.path().join("out")).unwrap();
        std::fs::write(ws.path().join("out/artifact"), b"payload").unwrap();
        ws
    }

    const KEY: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[tokio::test]
    async fn test_store_then_lookup_then_restore() {
        let root = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(root.path());
        let ws = make_workspace();

        assert!(!cache.lookup("build", KEY).await.unwrap());
        assert!(
            cache
                .store("build", KEY, ws.path(), &["out".to_string()])
                .await
                .unwrap()
        );
        assert!(cache.lookup("build", KEY).await.unwrap());

        let meta_body =
            std::fs::read(cache.root().join("build").join(format!("{KEY}.meta"))).unwrap();
        let meta: EntryMeta = serde_json::from_slice(&meta_body).unwrap();
        assert_eq!(meta.dirs, vec!["out"]);
        assert_eq!(meta.anchor, ws.path().to_string_lossy());
        assert!(meta.size > 0);

        let fresh = tempfile::tempdir().unwrap();
        cache.restore("build", KEY, fresh.path()).await.unwrap();
        assert_eq!(
            std::fs::read(fresh.path().join("out/artifact")).unwrap(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn test_second_store_skips() {
        let root = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(root.path());
        let ws = make_workspace();
        let dirs = vec!["out".to_string()];
        assert!(cache.store("build", KEY, ws.path(), &dirs).await.unwrap());
        assert!(!cache.store("build", KEY, ws.path(), &dirs).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_archive_quarantined() {
        let root_dir = tempfile::tempdir().unwrap();
        let root = root_dir.path();
        let cache = CacheStore::new(root);
        let ws = make_workspace();
        cache
            .store("build", KEY, ws.path(), &["out".to_string()])
            .await
            .unwrap();

        let archive = root.join("build").join(format!("{KEY}.tar.gz"));
        std::fs::write(&archive, b"scribbled over").unwrap();

        assert!(!cache.lookup("build", KEY).await.unwrap());
        assert!(!archive.exists());
        assert!(root.join("build").join(format!("{KEY}.tar.gz.corrupt")).exists());
        // Quarantined entries never come back.
        assert!(!cache.lookup("build", KEY).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let root = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(root.path());
        let ws = make_workspace();
        let keys: Vec<String> = (0..4).map(|i| format!("{i:0>64}")).collect();
        for key in &keys {
            cache
                .store("build", key, ws.path(), &["out".to_string()])
                .await
                .unwrap();
            // created_at granularity
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let removed = cache.prune("build", 2).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!cache.lookup("build", &keys[0]).await.unwrap());
        assert!(!cache.lookup("build", &keys[1]).await.unwrap());
        assert!(cache.lookup("build", &keys[2]).await.unwrap());
        assert!(cache.lookup("build", &keys[3]).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_missing_family_is_noop() {
        let root = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(root.path());
        assert_eq!(cache.prune("ghost", 3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_cache_dir_restores_empty() {
        let root = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(root.path());
        let ws = tempfile::tempdir().unwrap();
        cache
            .store("build", KEY, ws.path(), &["never".to_string()])
            .await
            .unwrap();

        let fresh = tempfile::tempdir().unwrap();
        cache.restore("build", KEY, fresh.path()).await.unwrap();
        assert!(fresh.path().join("never").is_dir());
    }
}
