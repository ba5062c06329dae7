//! Port traits.
//!
//! These traits define the interfaces between the engine and its
//! swappable collaborators: step-kind executors and tool-version
//! resolution.

use crate::Result;
use crate::workflow::Step;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Context handed to a step-kind executor.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Workspace root; the default working directory for steps.
    pub workspace: PathBuf,
    /// Job environment, overlaid on the inherited process environment.
    pub env: BTreeMap<String, String>,
}

/// What executing one step produced.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An executor for one step kind.
///
/// Kinds are registered by tag; adding one is a registration, not
/// subtype inheritance. An unregistered tag aborts the job with
/// `UnknownStepKind`.
#[async_trait]
pub trait StepKind: Send + Sync {
    /// The tag this executor handles.
    fn tag(&self) -> &str;

    /// Run the step to completion.
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<StepOutput>;
}

/// Resolves external tool versions for cache-key derivation.
///
/// Implementations may exec `--version` or consult a lockfile; results
/// must be stable within a run.
#[async_trait]
pub trait ToolVersions: Send + Sync {
    /// The tool's version string, or None when the tool is absent.
    async fn version(&self, tool: &str) -> Option<String>;
}

/// Fixed tool versions, for tests and pinned configurations.
#[derive(Debug, Default, Clone)]
pub struct StaticToolVersions {
    versions: BTreeMap<String, String>,
}

impl StaticToolVersions {
    pub fn new(versions: BTreeMap<String, String>) -> Self {
        Self { versions }
    }

    pub fn with(mut self, tool: impl Into<String>, version: impl Into<String>) -> Self {
        self.versions.insert(tool.into(), version.into());
        self
    }
}

#[async_trait]
impl ToolVersions for StaticToolVersions {
    async fn version(&self, tool: &str) -> Option<String> {
        self.versions.get(tool).cloned()
    }
}
