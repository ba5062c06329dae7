//! Workflow file loading.
//!
//! The authoring surface is a YAML document listing jobs. Everything
//! here is deserialization plus the core validation pass; the engine
//! only ever sees a validated [`Workflow`].

use std::path::{Path, PathBuf};
use tarmac_core::workflow::{Workflow, WorkflowDoc};
use tarmac_core::{Error, Result};

/// Resolve a workflow argument to a file, trying `.yaml`/`.yml` suffixes
/// the way users type them.
pub fn resolve(arg: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(arg);
    if direct.is_file() {
        return Ok(direct);
    }
    for suffix in [".yaml", ".yml"] {
        let candidate = PathBuf::from(format!("{arg}{suffix}"));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(Error::WorkflowLoad(format!("workflow file not found: {arg}")))
}

/// Load and validate a workflow, returning the authored bytes alongside
/// it so submission can ship them verbatim.
pub fn load(path: &Path) -> Result<(Workflow, String)> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::WorkflowLoad(format!("{}: {e}", path.display())))?;
    let doc: WorkflowDoc = serde_yaml::from_str(&raw)
        .map_err(|e| Error::WorkflowLoad(format!("{}: {e}", path.display())))?;
    let workflow = doc.into_workflow()?;
    Ok((workflow, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
jobs:
  - name: lint
    steps:
      - name: ruff
        run: ruff check .
    paths: ["src/**"]
    inputs: ["src/**", "pyproject.toml"]
    requires: ["ruff"]
  - name: test
    needs: [lint]
    env:
      PYTHONDONTWRITEBYTECODE: "1"
    cache_dirs: [".venv"]
    cache_keep: 3
    steps:
      - name: pytest
        run: pytest -q
        cwd: backend
"#;

    #[test]
    fn test_load_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let (workflow, raw) = load(&path).unwrap();
        assert_eq!(workflow.len(), 2);
        assert_eq!(raw, SAMPLE);

        let test = workflow.job("test").unwrap();
        assert_eq!(test.needs, vec!["lint"]);
        assert_eq!(test.cache_dirs, vec![".venv"]);
        assert_eq!(test.cache_keep, 3);
        assert_eq!(test.steps[0].cwd.as_deref(), Some("backend"));

        let lint = workflow.job("lint").unwrap();
        assert!(lint.diff_enabled);
        assert_eq!(lint.cache_keep, 5);
    }

    #[test]
    fn test_bad_yaml_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yaml");
        std::fs::write(&path, "jobs: [{name: oops").unwrap();
        assert!(matches!(load(&path), Err(Error::WorkflowLoad(_))));
    }

    #[test]
    fn test_duplicate_names_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yaml");
        std::fs::write(
            &path,
            "jobs:\n  - {name: a, steps: [{name: s, run: 'true'}]}\n  - {name: a, steps: [{name: s, run: 'true'}]}\n",
        )
        .unwrap();
        assert!(matches!(load(&path), Err(Error::DuplicateJob(_))));
    }

    #[test]
    fn test_resolve_appends_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.yaml");
        std::fs::write(&path, "jobs: []").unwrap();
        let bare = dir.path().join("ci");
        let resolved = resolve(bare.to_str().unwrap()).unwrap();
        assert_eq!(resolved, path);
    }
}
