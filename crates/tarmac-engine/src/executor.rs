//! Step execution.
//!
//! Step kinds live in a registry keyed by tag; `shell` is the builtin.
//! Adding a kind is a registration, not subtype inheritance, and an
//! unregistered tag aborts the job. Captured output is appended to a
//! per-step log file on completion; there is no streaming contract.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tarmac_core::ports::{StepContext, StepKind, StepOutput};
use tarmac_core::workflow::{SHELL_KIND, Step};
use tarmac_core::{Error, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Registry of step-kind executors.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    kinds: HashMap<String, Arc<dyn StepKind>>,
    log_root: Option<PathBuf>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append per-step logs under `root`.
    pub fn with_log_root(root: impl Into<PathBuf>) -> Self {
        Self {
            kinds: HashMap::new(),
            log_root: Some(root.into()),
        }
    }

    /// Register an executor under its tag. A later registration for the
    /// same tag replaces the earlier one.
    pub fn register(&mut self, kind: Arc<dyn StepKind>) {
        self.kinds.insert(kind.tag().to_string(), kind);
    }

    /// Run one step of `job` through its kind's executor.
    pub async fn execute(&self, job: &str, step: &Step, ctx: &StepContext) -> Result<StepOutput> {
        let kind = self
            .kinds
            .get(&step.kind)
            .ok_or_else(|| Error::UnknownStepKind(step.kind.clone()))?;

        debug!(job, step = %step.name, kind = %step.kind, "executing step");
        let output = kind.execute(step, ctx).await?;
        self.append_log(job, step, &output).await;
        Ok(output)
    }

    /// Best effort; a log-file failure never fails the step.
    async fn append_log(&self, job: &str, step: &Step, output: &StepOutput) {
        let Some(root) = &self.log_root else {
            return;
        };
        let dir = root.join(job);
        let path = dir.join(format!("{}.log", step.name.replace(['/', ' '], "_")));
        let body = format!(
            "==> {job}/{step} exit={exit} ({ms}ms)\n{stdout}{stderr}",
            step = step.name,
            exit = output.exit_code,
            ms = output.duration.as_millis(),
            stdout = output.stdout,
            stderr = output.stderr,
        );
        let result = async {
            tokio::fs::create_dir_all(&dir).await?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, body.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            warn!(job, step = %step.name, error = %e, "failed to append step log");
        }
    }
}

/// The builtin `shell` kind.
///
/// Runs the command through `sh -c` so pipes, redirections, and variable
/// expansion behave as users expect. The child is killed when the run is
/// cancelled.
pub struct ShellKind {
    cancel: watch::Receiver<bool>,
}

impl ShellKind {
    pub fn new(cancel: watch::Receiver<bool>) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl StepKind for ShellKind {
    fn tag(&self) -> &str {
        SHELL_KIND
    }

    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<StepOutput> {
        let start = Instant::now();
        let command = step.run.as_deref().ok_or_else(|| {
            Error::Internal(format!("shell step '{}' has no command", step.name))
        })?;

        let cwd = match &step.cwd {
            Some(dir) => ctx.workspace.join(dir),
            None => ctx.workspace.clone(),
        };
        if !cwd.is_dir() {
            return Err(Error::Internal(format!(
                "step '{}': working directory not found: {}",
                step.name,
                cwd.display()
            )));
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .envs(&ctx.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to spawn '{}': {e}", step.name)))?;

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout not captured".to_string()))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("child stderr not captured".to_string()))?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let mut cancel = self.cancel.clone();
        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| Error::Internal(format!("wait failed: {e}")))?
            }
            _ = cancelled(&mut cancel) => {
                warn!(step = %step.name, "cancellation requested, killing child");
                let _ = child.start_kill();
                child
                    .wait()
                    .await
                    .map_err(|e| Error::Internal(format!("wait failed: {e}")))?
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        Ok(StepOutput {
            exit_code: exit_code_of(&status),
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }
}

/// Resolves when cancellation is requested; never resolves if the sender
/// is gone (the run owns the sender for its whole lifetime).
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancel| *cancel).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Child exit code, with signal deaths mapped to 128 + signal number.
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn make_ctx(workspace: &std::path::Path) -> StepContext {
        StepContext {
            workspace: workspace.to_path_buf(),
            env: BTreeMap::new(),
        }
    }

    fn shell() -> ShellKind {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test.
        std::mem::forget(tx);
        ShellKind::new(rx)
    }

    #[tokio::test]
    async fn test_shell_success_captures_stdout() {
        let ws = tempfile::tempdir().unwrap();
        let out = shell()
            .execute(&Step::shell("s", "echo hello"), &make_ctx(ws.path()))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_shell_failure_exit_code() {
        let ws = tempfile::tempdir().unwrap();
        let out = shell()
            .execute(&Step::shell("s", "echo oops >&2; exit 3"), &make_ctx(ws.path()))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_shell_env_overrides_inherited() {
        let ws = tempfile::tempdir().unwrap();
        let mut ctx = make_ctx(ws.path());
        ctx.env.insert("TARMAC_PROBE".to_string(), "42".to_string());
        let out = shell()
            .execute(&Step::shell("s", "echo $TARMAC_PROBE"), &ctx)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn test_shell_cwd_applies() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::create_dir(ws.path().join("sub")).unwrap();
        let step = Step::shell("s", "basename \"$PWD\"").with_cwd("sub");
        let out = shell().execute(&step, &make_ctx(ws.path())).await.unwrap();
        assert_eq!(out.stdout.trim(), "sub");
    }

    #[tokio::test]
    async fn test_shell_missing_cwd_is_executor_error() {
        let ws = tempfile::tempdir().unwrap();
        let step = Step::shell("s", "true").with_cwd("nope");
        assert!(shell().execute(&step, &make_ctx(ws.path())).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_death_maps_to_128_plus_signo() {
        let ws = tempfile::tempdir().unwrap();
        let out = shell()
            .execute(&Step::shell("s", "kill -TERM $$"), &make_ctx(ws.path()))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 128 + 15);
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let ws = tempfile::tempdir().unwrap();
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(shell()));
        let mut step = Step::shell("s", "true");
        step.kind = "container".to_string();
        let err = registry
            .execute("job", &step, &make_ctx(ws.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownStepKind(kind) if kind == "container"));
    }

    #[tokio::test]
    async fn test_log_appended_on_completion() {
        let ws = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let mut registry = ExecutorRegistry::with_log_root(logs.path());
        registry.register(Arc::new(shell()));

        let step = Step::shell("greet", "echo logged");
        registry.execute("job", &step, &make_ctx(ws.path())).await.unwrap();
        registry.execute("job", &step, &make_ctx(ws.path())).await.unwrap();

        let body = std::fs::read_to_string(logs.path().join("job/greet.log")).unwrap();
        assert_eq!(body.matches("logged").count(), 2, "appended, not truncated");
    }
}
