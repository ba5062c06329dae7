//! Thin wrapper around the git CLI.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use tarmac_core::{Error, Result};
use tracing::debug;

/// Handle to the repository enclosing a directory.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Locate the repository containing `dir`.
    pub fn discover(dir: &Path) -> Result<Self> {
        let out = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(dir)
            .output()
            .map_err(|e| Error::Git(format!("failed to run git: {e}")))?;
        if !out.status.success() {
            return Err(Error::NotARepository);
        }
        let root = PathBuf::from(String::from_utf8_lossy(&out.stdout).trim());
        Ok(Self { root })
    }

    /// Absolute path of the repository root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| Error::Git(format!("failed to run git: {e}")))?;
        if !out.status.success() {
            return Err(Error::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Full SHA of the current HEAD commit.
    pub fn head(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    /// Whether the working tree has uncommitted or untracked changes.
    pub fn dirty(&self) -> Result<bool> {
        Ok(!self.git(&["status", "--porcelain"])?.is_empty())
    }

    /// Current branch name, or the commit id when HEAD is detached.
    pub fn current_ref(&self) -> Result<String> {
        let name = self.git(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if name == "HEAD" {
            // Detached
            self.head()
        } else {
            Ok(name)
        }
    }

    /// URL of the named remote, or None when it is not configured.
    pub fn remote_url(&self, name: &str) -> Result<Option<String>> {
        match self.git(&["remote", "get-url", name]) {
            Ok(url) => Ok(Some(url)),
            Err(_) => Ok(None),
        }
    }

    /// Merge-base of HEAD and `compare_ref`.
    pub fn merge_base(&self, compare_ref: &str) -> Result<String> {
        // Resolve the ref first so an unknown ref reports as such rather
        // than as a generic merge-base failure.
        if self
            .git(&["rev-parse", "--verify", "--quiet", compare_ref])
            .is_err()
        {
            return Err(Error::UnknownRef(compare_ref.to_string()));
        }
        self.git(&["merge-base", "HEAD", compare_ref])
    }

    /// Repo-relative paths differing between the merge-base with
    /// `compare_ref` and the working tree, including untracked files.
    pub fn changed_paths(&self, compare_ref: &str) -> Result<BTreeSet<String>> {
        let base = self.merge_base(compare_ref)?;
        let mut changed = BTreeSet::new();

        let committed = self.git(&["diff", "--name-only", &format!("{base}..HEAD")])?;
        changed.extend(committed.lines().map(str::to_string));

        // Working-tree state on top of the committed diff: staged,
        // unstaged, and untracked files all count as changed.
        let unstaged = self.git(&["diff", "--name-only"])?;
        changed.extend(unstaged.lines().map(str::to_string));

        let staged = self.git(&["diff", "--name-only", "--cached"])?;
        changed.extend(staged.lines().map(str::to_string));

        let untracked = self.git(&["ls-files", "--others", "--exclude-standard"])?;
        changed.extend(untracked.lines().map(str::to_string));

        changed.remove("");
        debug!(count = changed.len(), compare_ref, "collected changed paths");
        Ok(changed)
    }

    /// Capture all facts the engine needs for one run.
    pub fn snapshot(&self, compare_ref: &str) -> Result<RepoSnapshot> {
        Ok(RepoSnapshot {
            root: self.root.clone(),
            head: self.head()?,
            current_ref: self.current_ref()?,
            dirty: self.dirty()?,
            changed_paths: self.changed_paths(compare_ref)?,
        })
    }
}

/// Repository facts captured once and reused for a whole run.
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    pub root: PathBuf,
    pub head: String,
    pub current_ref: String,
    pub dirty: bool,
    pub changed_paths: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir)
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?}");
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "ci@example.com"]);
        run(&["config", "user.name", "ci"]);
        std::fs::write(dir.join("a.txt"), "one\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);
    }

    #[test]
    fn test_discover_outside_repo_fails() {
        let dir = tempfile::tempdir().unwrap();
        // A fresh tempdir is not itself a repository, but the tempdir may
        // live under one; point git somewhere guaranteed bare.
        let nested = dir.path().join("x");
        std::fs::create_dir(&nested).unwrap();
        let err = match GitRepo::discover(&nested) {
            Err(e) => e,
            Ok(repo) => {
                // Running inside a checkout; at least verify the root is
                // a real directory.
                assert!(repo.root().is_dir());
                return;
            }
        };
        assert!(matches!(err, Error::NotARepository | Error::Git(_)));
    }

    #[test]
    fn test_head_and_ref() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::discover(dir.path()).unwrap();
        assert_eq!(repo.head().unwrap().len(), 40);
        assert_eq!(repo.current_ref().unwrap(), "main");
        assert!(!repo.dirty().unwrap());
    }

    #[test]
    fn test_changed_paths_sees_untracked_and_modified() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::discover(dir.path()).unwrap();

        std::fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        std::fs::write(dir.path().join("new.txt"), "fresh\n").unwrap();

        let changed = repo.changed_paths("main").unwrap();
        assert!(changed.contains("a.txt"));
        assert!(changed.contains("new.txt"));
        assert!(repo.dirty().unwrap());
    }

    #[test]
    fn test_unknown_ref() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::discover(dir.path()).unwrap();
        let err = repo.changed_paths("no/such/ref").unwrap_err();
        assert!(matches!(err, Error::UnknownRef(_)));
    }

    #[test]
    fn test_remote_url_absent() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::discover(dir.path()).unwrap();
        assert_eq!(repo.remote_url("origin").unwrap(), None);
    }
}
