//! Tool-version resolution.

use async_trait::async_trait;
use std::collections::HashMap;
use tarmac_core::ports::ToolVersions;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

/// Resolves versions by running the tool itself, memoized so results are
/// stable for the lifetime of one run.
#[derive(Default)]
pub struct SystemToolVersions {
    memo: Mutex<HashMap<String, Option<String>>>,
}

impl SystemToolVersions {
    pub fn new() -> Self {
        Self::default()
    }

    async fn probe(tool: &str) -> Option<String> {
        for flag in ["--version", "-V", "version"] {
            let output = match Command::new(tool).arg(flag).output().await {
                Ok(output) => output,
                Err(_) => continue,
            };
            if !output.status.success() {
                continue;
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let text = if stdout.trim().is_empty() { stderr } else { stdout };
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !text.is_empty() {
                return Some(text);
            }
        }
        None
    }
}

#[async_trait]
impl ToolVersions for SystemToolVersions {
    async fn version(&self, tool: &str) -> Option<String> {
        {
            let memo = self.memo.lock().await;
            if let Some(cached) = memo.get(tool) {
                return cached.clone();
            }
        }
        let resolved = Self::probe(tool).await;
        debug!(tool, version = ?resolved, "resolved tool version");
        self.memo
            .lock()
            .await
            .insert(tool.to_string(), resolved.clone());
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_tool_resolves() {
        // sh ships everywhere the tests run; git is a safer probe target.
        let tools = SystemToolVersions::new();
        let version = tools.version("git").await;
        assert!(version.is_some());
        // Memoized value is identical.
        assert_eq!(version, tools.version("git").await);
    }

    #[tokio::test]
    async fn test_missing_tool_is_none() {
        let tools = SystemToolVersions::new();
        assert_eq!(tools.version("definitely-not-installed-anywhere").await, None);
    }
}
