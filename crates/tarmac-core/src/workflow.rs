//! Workflow definition types.
//!
//! A workflow is an ordered list of jobs with unique names. Jobs reference
//! each other through `needs`, carry glob sets for change-aware selection
//! and cache-key derivation, and own the directories the cache captures.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Component;

/// The builtin step kind executed through the system shell.
pub const SHELL_KIND: &str = "shell";

/// A single named unit of work inside a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Discriminator for the executor registry. `shell` is the base kind.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Command line for the `shell` kind.
    #[serde(default)]
    pub run: Option<String>,
    /// Working directory relative to the workspace.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Kind-specific options for extension kinds.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub with: serde_json::Value,
}

fn default_kind() -> String {
    SHELL_KIND.to_string()
}

impl Step {
    /// Create a shell step.
    pub fn shell(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_kind(),
            run: Some(run.into()),
            cwd: None,
            with: serde_json::Value::Null,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// A CI job: ordered steps plus the metadata driving selection and caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub steps: Vec<Step>,
    /// Names of jobs that must finish before this one starts.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Globs used by change-aware selection. Empty means no path filter.
    #[serde(default)]
    pub paths: Vec<String>,
    /// When false the job is always selected regardless of the diff.
    #[serde(default = "default_true")]
    pub diff_enabled: bool,
    /// Globs whose hashed content contributes to the cache key.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Applied to every step, overriding the inherited process environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Workspace-relative directories saved and restored by the cache.
    #[serde(default)]
    pub cache_dirs: Vec<String>,
    /// External tools whose versions contribute to the cache key.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Prune retention for this job's key family.
    #[serde(default = "default_cache_keep")]
    pub cache_keep: usize,
}

fn default_true() -> bool {
    true
}

fn default_cache_keep() -> usize {
    5
}

impl Job {
    /// Start building a job with the given name.
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder::new(name)
    }
}

/// Fluent builder for [`Job`] records.
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            job: Job {
                name: name.into(),
                steps: vec![],
                needs: vec![],
                paths: vec![],
                diff_enabled: true,
                inputs: vec![],
                env: BTreeMap::new(),
                cache_dirs: vec![],
                requires: vec![],
                cache_keep: default_cache_keep(),
            },
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.job.steps.push(step);
        self
    }

    pub fn sh(self, name: impl Into<String>, run: impl Into<String>) -> Self {
        self.step(Step::shell(name, run))
    }

    pub fn needs(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.job.needs.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn paths(mut self, globs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.job.paths.extend(globs.into_iter().map(Into::into));
        self
    }

    pub fn diff_enabled(mut self, enabled: bool) -> Self {
        self.job.diff_enabled = enabled;
        self
    }

    pub fn inputs(mut self, globs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.job.inputs.extend(globs.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.job.env.insert(key.into(), value.into());
        self
    }

    pub fn cache_dirs(mut self, dirs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.job.cache_dirs.extend(dirs.into_iter().map(Into::into));
        self
    }

    pub fn requires(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.job.requires.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn cache_keep(mut self, keep: usize) -> Self {
        self.job.cache_keep = keep;
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

/// The serialized form of a workflow document.
///
/// Deserialize this, then validate through [`Workflow::new`]; `Workflow`
/// itself cannot be deserialized so no unvalidated instance exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDoc {
    pub jobs: Vec<Job>,
}

impl WorkflowDoc {
    pub fn into_workflow(self) -> Result<Workflow> {
        Workflow::new(self.jobs)
    }
}

/// An ordered list of jobs with unique names.
///
/// Construction validates everything that does not require graph
/// traversal; `needs` resolution and cycle detection belong to the DAG
/// builder.
#[derive(Debug, Clone)]
pub struct Workflow {
    jobs: Vec<Job>,
}

impl Workflow {
    pub fn new(jobs: Vec<Job>) -> Result<Self> {
        let mut seen = HashSet::new();
        for job in &jobs {
            if job.name.is_empty() {
                return Err(Error::WorkflowLoad("job with empty name".to_string()));
            }
            if !seen.insert(job.name.clone()) {
                return Err(Error::DuplicateJob(job.name.clone()));
            }
            if job.steps.is_empty() {
                return Err(Error::InvalidJob {
                    job: job.name.clone(),
                    message: "must have at least one step".to_string(),
                });
            }
            for step in &job.steps {
                if step.name.is_empty() {
                    return Err(Error::InvalidJob {
                        job: job.name.clone(),
                        message: "step with empty name".to_string(),
                    });
                }
            }
            if job.needs.iter().any(|n| *n == job.name) {
                return Err(Error::InvalidJob {
                    job: job.name.clone(),
                    message: "job cannot need itself".to_string(),
                });
            }
            if job.cache_keep == 0 {
                return Err(Error::InvalidJob {
                    job: job.name.clone(),
                    message: "cache_keep must be at least 1".to_string(),
                });
            }
            for dir in &job.cache_dirs {
                if !is_confined(dir) {
                    return Err(Error::UnconfinedCacheDir {
                        job: job.name.clone(),
                        dir: dir.clone(),
                    });
                }
            }
        }
        Ok(Self { jobs })
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// A cache dir must stay inside the workspace: relative, no `..` traversal.
fn is_confined(dir: &str) -> bool {
    let path = std::path::Path::new(dir);
    if path.is_absolute() {
        return false;
    }
    path.components()
        .all(|c| !matches!(c, Component::ParentDir | Component::RootDir))
}
