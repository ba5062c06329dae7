//! Change-aware job selection.
//!
//! Couples the workflow to repository state: in `diff` mode a job only
//! runs when the changed paths touch its declared globs. A skipped
//! upstream is treated as a vacuous success, so `needs` encodes ordering,
//! not data dependence, and downstream jobs still run.

use crate::dag::{DagBuilder, JobGraph};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tarmac_core::run::{RunPlan, SkipReason, SkippedJob};
use tarmac_core::workflow::{Job, Workflow};
use tarmac_core::{Error, Result};
use tracing::debug;

/// How jobs are chosen for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Every job runs.
    #[default]
    All,
    /// Jobs run only when the diff against the compare ref touches them.
    Diff,
}

/// Resolve the plan for one invocation.
///
/// `changed` must be Some in `diff` mode; it is the snapshot of changed
/// repo-relative paths captured once for the run.
pub fn select(
    workflow: &Workflow,
    mode: SelectionMode,
    changed: Option<&BTreeSet<String>>,
) -> Result<(RunPlan, JobGraph)> {
    let mut selected_names = Vec::new();
    let mut skipped = Vec::new();

    match mode {
        SelectionMode::All => {
            selected_names.extend(workflow.jobs().iter().map(|j| j.name.clone()));
        }
        SelectionMode::Diff => {
            let changed = changed
                .ok_or_else(|| Error::Internal("diff selection without changed paths".into()))?;
            for job in workflow.jobs() {
                if job_touched(job, changed)? {
                    selected_names.push(job.name.clone());
                } else {
                    debug!(job = %job.name, "skipped: no matching paths");
                    skipped.push(SkippedJob {
                        name: job.name.clone(),
                        reason: SkipReason::NoMatchingPaths,
                    });
                }
            }
        }
    }

    let selected_set: HashSet<String> = selected_names.iter().cloned().collect();
    let graph = DagBuilder::build_pruned(workflow.jobs(), &selected_set)?;

    // Plan ordering: topological level, then declaration order (the
    // level peeling already preserves declaration order within a level).
    let levels: Vec<Vec<String>> = graph.levels().to_vec();
    let selected = levels.iter().flatten().cloned().collect();

    Ok((
        RunPlan {
            selected,
            skipped,
            levels,
        },
        graph,
    ))
}

fn job_touched(job: &Job, changed: &BTreeSet<String>) -> Result<bool> {
    // Per-job opt-out: always run.
    if !job.diff_enabled {
        return Ok(true);
    }
    // No path filter: always run.
    if job.paths.is_empty() {
        return Ok(true);
    }
    let globs = build_globset(&job.paths)?;
    Ok(changed.iter().any(|path| globs.is_match(path)))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Internal(format!("bad path glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Internal(format!("bad path globs: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|s| s.to_string()).collect()
    }

    fn workflow() -> Workflow {
        Workflow::new(vec![
            Job::builder("lint").sh("s", "true").paths(["src/**"]).build(),
            Job::builder("docs").sh("s", "true").paths(["docs/**"]).build(),
            Job::builder("audit")
                .sh("s", "true")
                .paths(["nothing/**"])
                .diff_enabled(false)
                .build(),
            Job::builder("always").sh("s", "true").build(),
        ])
        .unwrap()
    }

    #[test]
    fn test_all_mode_selects_everything() {
        let (plan, _) = select(&workflow(), SelectionMode::All, None).unwrap();
        assert_eq!(plan.selected.len(), 4);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_diff_mode_filters_by_paths() {
        let changed = changed(&["src/x.py"]);
        let (plan, _) = select(&workflow(), SelectionMode::Diff, Some(&changed)).unwrap();

        assert!(plan.is_selected("lint"));
        assert!(!plan.is_selected("docs"));
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].name, "docs");
        assert_eq!(plan.skipped[0].reason, SkipReason::NoMatchingPaths);
    }

    #[test]
    fn test_diff_disabled_always_selected() {
        let (plan, _) =
            select(&workflow(), SelectionMode::Diff, Some(&changed(&[]))).unwrap();
        assert!(plan.is_selected("audit"));
    }

    #[test]
    fn test_empty_paths_always_selected() {
        let (plan, _) =
            select(&workflow(), SelectionMode::Diff, Some(&changed(&[]))).unwrap();
        assert!(plan.is_selected("always"));
    }

    #[test]
    fn test_downstream_of_skipped_still_runs() {
        let wf = Workflow::new(vec![
            Job::builder("gen").sh("s", "true").paths(["gen/**"]).build(),
            Job::builder("build").sh("s", "true").needs(["gen"]).build(),
        ])
        .unwrap();
        let (plan, graph) =
            select(&wf, SelectionMode::Diff, Some(&changed(&["src/m.rs"]))).unwrap();

        assert!(!plan.is_selected("gen"));
        assert!(plan.is_selected("build"));
        // The edge onto the skipped upstream is gone, so build is ready.
        assert_eq!(graph.in_degrees()["build"], 0);
    }

    #[test]
    fn test_plan_levels_order() {
        let wf = Workflow::new(vec![
            Job::builder("b").sh("s", "true").needs(["a"]).build(),
            Job::builder("a").sh("s", "true").build(),
        ])
        .unwrap();
        let (plan, _) = select(&wf, SelectionMode::All, None).unwrap();
        assert_eq!(plan.selected, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(plan.levels.len(), 2);
    }
}
