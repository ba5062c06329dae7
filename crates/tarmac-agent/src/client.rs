//! HTTP client for the coordination plane.

use serde::{Deserialize, Serialize};
use tarmac_core::{Error, Result};

/// A job leased to this agent.
#[derive(Debug, Clone, Deserialize)]
pub struct LeasedJob {
    pub job_id: String,
    pub run_id: String,
    pub job_name: String,
    pub payload: serde_json::Value,
    pub lease_expires_at: i64,
}

/// Response to a run submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedRun {
    pub run_id: String,
    pub job_ids: Vec<String>,
}

#[derive(Serialize)]
struct LeaseRequest<'a> {
    agent_id: &'a str,
}

#[derive(Serialize)]
struct CompleteRequest<'a> {
    agent_id: &'a str,
    status: &'a str,
    logs: &'a str,
}

#[derive(Serialize)]
struct CreateRunRequest<'a> {
    repo: &'a str,
    #[serde(rename = "ref")]
    git_ref: &'a str,
    workflow_bytes: &'a str,
}

/// JSON client for the three queue endpoints.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    agent_id: String,
    http: reqwest::Client,
}

fn net_err(e: reqwest::Error) -> Error {
    Error::Network(e.to_string())
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent_id: agent_id.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Claim a job, or None when the queue is idle.
    pub async fn lease(&self) -> Result<Option<LeasedJob>> {
        let response = self
            .http
            .post(format!("{}/jobs/lease", self.base_url))
            .json(&LeaseRequest {
                agent_id: &self.agent_id,
            })
            .send()
            .await
            .map_err(net_err)?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(net_err)?;
        let leased = response.json::<LeasedJob>().await.map_err(net_err)?;
        Ok(Some(leased))
    }

    /// Report a job's terminal status with its logs.
    pub async fn complete(&self, job_id: &str, status: &str, logs: &str) -> Result<()> {
        self.http
            .post(format!("{}/jobs/{job_id}/complete", self.base_url))
            .json(&CompleteRequest {
                agent_id: &self.agent_id,
                status,
                logs,
            })
            .send()
            .await
            .map_err(net_err)?
            .error_for_status()
            .map_err(net_err)?;
        Ok(())
    }

    /// Queue a workflow run.
    pub async fn submit_run(
        &self,
        repo: &str,
        git_ref: &str,
        workflow_bytes: &str,
    ) -> Result<SubmittedRun> {
        let response = self
            .http
            .post(format!("{}/runs", self.base_url))
            .json(&CreateRunRequest {
                repo,
                git_ref,
                workflow_bytes,
            })
            .send()
            .await
            .map_err(net_err)?
            .error_for_status()
            .map_err(net_err)?;
        response.json::<SubmittedRun>().await.map_err(net_err)
    }
}
