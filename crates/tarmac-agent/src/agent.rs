//! Agent poll loop and lease execution.

use crate::client::{ApiClient, LeasedJob};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tarmac_core::workflow::{Job, Workflow};
use tarmac_core::{Error, Result};
use tarmac_engine::{Engine, EngineConfig, SelectionMode};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_url: String,
    /// Unique agent identifier; defaults to the hostname.
    pub agent_id: String,
    /// Seconds between polls when the queue is idle.
    pub poll_interval_secs: u64,
    /// Where checkouts, logs, and the agent cache live.
    pub work_dir: PathBuf,
}

impl AgentConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            agent_id: default_agent_id(),
            poll_interval_secs: 5,
            work_dir: PathBuf::from(".tarmac/agent"),
        }
    }
}

fn default_agent_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "tarmac-agent".to_string())
}

/// What a lease payload carries.
#[derive(Debug, Deserialize)]
struct LeasePayload {
    repo: String,
    #[serde(rename = "ref")]
    git_ref: String,
    job: Job,
}

/// The polling build agent.
pub struct Agent {
    config: AgentConfig,
    client: ApiClient,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let client = ApiClient::new(&config.api_url, &config.agent_id);
        Self { config, client }
    }

    /// Poll and execute until interrupted.
    pub async fn run(&self) -> Result<()> {
        info!(
            api = %self.config.api_url,
            agent_id = %self.config.agent_id,
            poll_interval = self.config.poll_interval_secs,
            "agent starting"
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(true);
            }
        });

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.client.lease().await {
                Ok(Some(lease)) => {
                    info!(job_id = %lease.job_id, job = %lease.job_name, "acquired lease");
                    self.execute_lease(lease).await;
                }
                Ok(None) => {
                    self.idle_wait(&mut shutdown_rx).await;
                }
                Err(e) => {
                    warn!(error = %e, "lease poll failed");
                    self.idle_wait(&mut shutdown_rx).await;
                }
            }
        }

        info!("agent stopped");
        Ok(())
    }

    async fn idle_wait(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        let interval = std::time::Duration::from_secs(self.config.poll_interval_secs);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    /// Run one leased job and report the outcome. Reporting failures are
    /// logged; the lease will expire and be retried elsewhere.
    async fn execute_lease(&self, lease: LeasedJob) {
        let job_id = lease.job_id.clone();
        let (status, logs) = match self.run_lease(lease).await {
            Ok((status, logs)) => (status, logs),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "lease execution failed");
                ("failed", format!("agent error: {e}"))
            }
        };
        if let Err(e) = self.client.complete(&job_id, status, &logs).await {
            error!(job_id = %job_id, error = %e, "failed to report completion");
        } else {
            info!(job_id = %job_id, status, "completed");
        }
    }

    async fn run_lease(&self, lease: LeasedJob) -> Result<(&'static str, String)> {
        let payload: LeasePayload = serde_json::from_value(lease.payload)?;

        let checkout = self.checkout(&payload.repo, &payload.git_ref).await?;

        // A leased job runs standalone; its `needs` were ordered by the
        // submitting side and mean nothing here.
        let mut job = payload.job;
        job.needs.clear();
        let job_name = job.name.clone();
        let workflow = Workflow::new(vec![job])?;

        let log_root = self.config.work_dir.join("logs");
        let engine = Engine::new(EngineConfig {
            workspace: checkout,
            cache_root: self.config.work_dir.join("cache"),
            log_root: log_root.clone(),
            workers: 1,
            fail_fast: true,
            cache_enabled: true,
            mode: SelectionMode::All,
            compare_ref: "origin/main".to_string(),
        });

        let (_, summary) = engine.run(&workflow).await?;
        let status = if summary.success() { "ok" } else { "failed" };
        let mut logs = collect_logs(&log_root.join(&job_name)).await;
        if let Some(result) = summary.result(&job_name) {
            logs.push_str(&format!(
                "\n==> outcome={:?} cache={:?} duration_ms={}\n",
                result.outcome, result.cache, result.duration_ms
            ));
            if let Some(step) = &result.failed_step {
                logs.push_str(&format!("failed step: {step}\n"));
            }
        }
        Ok((status, logs))
    }

    /// Clone the repository, or fetch and check out when it is already
    /// present under the work dir.
    async fn checkout(&self, repo_url: &str, git_ref: &str) -> Result<PathBuf> {
        let name = repo_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("repo")
            .trim_end_matches(".git");
        let checkouts = self.config.work_dir.join("checkouts");
        let target = checkouts.join(name);
        tokio::fs::create_dir_all(&checkouts).await?;

        if target.join(".git").is_dir() {
            git(&target, &["fetch", "origin"]).await?;
        } else {
            git(&checkouts, &["clone", repo_url, name]).await?;
        }
        git(&target, &["checkout", git_ref]).await?;
        Ok(target)
    }
}

async fn git(cwd: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| Error::Git(format!("failed to run git: {e}")))?;
    if !output.status.success() {
        return Err(Error::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Concatenate every step log under `dir`, best effort.
async fn collect_logs(dir: &Path) -> String {
    let mut logs = String::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return logs;
    };
    let mut paths = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        paths.push(entry.path());
    }
    paths.sort();
    for path in paths {
        if let Ok(body) = tokio::fs::read_to_string(&path).await {
            logs.push_str(&body);
        }
    }
    logs
}
