//! Run plan and result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal outcome of one job in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Ok,
    Failed,
    Skipped,
    Cancelled,
}

impl JobOutcome {
    /// Skipped jobs count as vacuous successes.
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Ok | JobOutcome::Skipped)
    }
}

/// How the cache participated in a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    NotApplicable,
}

/// Result of one job the run touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub name: String,
    pub outcome: JobOutcome,
    pub cache: CacheOutcome,
    /// Name of the failing step, when the outcome is `Failed`.
    pub failed_step: Option<String>,
    /// Exit code of the failing step, when the outcome is `Failed`.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl JobResult {
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: JobOutcome::Skipped,
            cache: CacheOutcome::NotApplicable,
            failed_step: None,
            exit_code: None,
            duration_ms: 0,
        }
    }

    pub fn cancelled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: JobOutcome::Cancelled,
            cache: CacheOutcome::NotApplicable,
            failed_step: None,
            exit_code: None,
            duration_ms: 0,
        }
    }
}

/// Why a job was left out of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NoMatchingPaths,
    UpstreamSkipped,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoMatchingPaths => write!(f, "no-matching-paths"),
            SkipReason::UpstreamSkipped => write!(f, "upstream-skipped"),
        }
    }
}

/// A job excluded from the run, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedJob {
    pub name: String,
    pub reason: SkipReason,
}

/// Resolved selection for one invocation, produced before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    /// Selected job names, ordered by topological level then input order.
    pub selected: Vec<String>,
    pub skipped: Vec<SkippedJob>,
    /// Jobs grouped by topological level, for printing.
    pub levels: Vec<Vec<String>>,
}

impl RunPlan {
    pub fn is_selected(&self, name: &str) -> bool {
        self.selected.iter().any(|s| s == name)
    }
}

/// Everything the scheduler hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub results: Vec<JobResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_success())
    }

    pub fn result(&self, name: &str) -> Option<&JobResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_counts_as_success() {
        assert!(JobOutcome::Skipped.is_success());
        assert!(JobOutcome::Ok.is_success());
        assert!(!JobOutcome::Failed.is_success());
        assert!(!JobOutcome::Cancelled.is_success());
    }

    #[test]
    fn test_skip_reason_wire_format() {
        let json = serde_json::to_string(&SkipReason::NoMatchingPaths).unwrap();
        assert_eq!(json, "\"no-matching-paths\"");
        let json = serde_json::to_string(&SkipReason::UpstreamSkipped).unwrap();
        assert_eq!(json, "\"upstream-skipped\"");
    }

    #[test]
    fn test_summary_success() {
        let summary = RunSummary {
            results: vec![
                JobResult::skipped("a"),
                JobResult {
                    name: "b".to_string(),
                    outcome: JobOutcome::Ok,
                    cache: CacheOutcome::Hit,
                    failed_step: None,
                    exit_code: None,
                    duration_ms: 12,
                },
            ],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        assert!(summary.success());
        assert_eq!(summary.result("b").unwrap().cache, CacheOutcome::Hit);
    }
}
