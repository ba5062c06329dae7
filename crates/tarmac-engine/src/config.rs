//! Engine configuration.

use crate::select::SelectionMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything the engine needs for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Workspace root; the repository root by default.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Where cache entries live.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    /// Where per-step logs are appended.
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,
    /// Worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Stop issuing new jobs after the first failure.
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    /// Disable to force every job to execute its steps.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default)]
    pub mode: SelectionMode,
    /// Ref the diff mode compares against.
    #[serde(default = "default_compare_ref")]
    pub compare_ref: String,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_cache_root() -> PathBuf {
    PathBuf::from(".tarmac/cache")
}

fn default_log_root() -> PathBuf {
    PathBuf::from(".tarmac/logs")
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn default_true() -> bool {
    true
}

fn default_compare_ref() -> String {
    "origin/main".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            cache_root: default_cache_root(),
            log_root: default_log_root(),
            workers: default_workers(),
            fail_fast: true,
            cache_enabled: true,
            mode: SelectionMode::All,
            compare_ref: default_compare_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workers_at_least_one() {
        assert!(EngineConfig::default().workers >= 1);
    }

    #[test]
    fn test_defaults_roundtrip_through_serde() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!(config.fail_fast);
        assert!(config.cache_enabled);
        assert_eq!(config.mode, SelectionMode::All);
        assert_eq!(config.compare_ref, "origin/main");
    }
}
