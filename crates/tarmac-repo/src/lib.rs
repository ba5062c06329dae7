//! Repository facts for tarmac.
//!
//! Pure read queries against the enclosing git repository. This crate
//! centralizes all git interaction so nothing else shells out to git
//! directly. All operations are side-effect-free; the scheduler captures
//! a [`RepoSnapshot`] once per run and reuses it.

mod git;

pub use git::{GitRepo, RepoSnapshot};
