//! HTTP handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tarmac_core::ids::{JobId, RunId};
use tarmac_core::workflow::WorkflowDoc;

use crate::state::AppState;
use crate::store::JobStatus;

type HandlerError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> HandlerError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Workflow document, as authored.
    pub workflow_bytes: String,
}

#[derive(Serialize)]
pub struct CreateRunResponse {
    pub run_id: String,
    pub job_ids: Vec<String>,
}

pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<CreateRunResponse>), HandlerError> {
    let doc: WorkflowDoc = serde_yaml::from_str(&request.workflow_bytes)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid workflow: {e}")))?;
    let workflow = doc
        .into_workflow()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid workflow: {e}")))?;

    let jobs: Vec<(String, serde_json::Value)> = workflow
        .jobs()
        .iter()
        .map(|job| {
            let payload = serde_json::json!({
                "repo": request.repo,
                "ref": request.git_ref,
                "job": job,
            });
            (job.name.clone(), payload)
        })
        .collect();

    let (run_id, job_ids) = state
        .db
        .create_run(&request.repo, &jobs)
        .await
        .map_err(internal)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRunResponse {
            run_id: run_id.to_string(),
            job_ids: job_ids.iter().map(|id| id.to_string()).collect(),
        }),
    ))
}

#[derive(Serialize)]
pub struct RunResponse {
    pub id: String,
    pub repo: String,
    pub status: String,
    pub created_at: i64,
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, HandlerError> {
    let run_id: RunId = id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid run id".to_string()))?;
    let run = state
        .db
        .get_run(run_id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "run not found".to_string()))?;
    Ok(Json(RunResponse {
        id: run.id.to_string(),
        repo: run.repo,
        status: run.status.as_str().to_string(),
        created_at: run.created_at,
    }))
}

#[derive(Deserialize)]
pub struct LeaseRequest {
    pub agent_id: String,
}

#[derive(Serialize)]
pub struct LeaseResponse {
    pub job_id: String,
    pub run_id: String,
    pub job_name: String,
    pub payload: serde_json::Value,
    pub lease_expires_at: i64,
}

/// Hand the oldest leasable job to the caller, or 204 when idle.
pub async fn lease_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LeaseRequest>,
) -> Result<Response, HandlerError> {
    if request.agent_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "agent_id required".to_string()));
    }
    let leased = state
        .db
        .lease_job(&request.agent_id, state.lease_seconds)
        .await
        .map_err(internal)?;

    match leased {
        Some(job) => Ok(Json(LeaseResponse {
            job_id: job.job_id.to_string(),
            run_id: job.run_id.to_string(),
            job_name: job.job_name,
            payload: job.payload,
            lease_expires_at: job.lease_expires_at,
        })
        .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub agent_id: String,
    pub status: String,
    #[serde(default)]
    pub logs: Option<String>,
}

#[derive(Serialize)]
pub struct CompleteResponse {
    pub ok: bool,
}

pub async fn complete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, HandlerError> {
    let job_id: JobId = id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid job id".to_string()))?;

    let status: JobStatus = request
        .status
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "status must be ok|failed|cancelled".to_string()))?;
    if !status.is_terminal() {
        return Err((
            StatusCode::BAD_REQUEST,
            "status must be ok|failed|cancelled".to_string(),
        ));
    }

    let lease = state
        .db
        .get_lease(job_id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::CONFLICT, "no lease for job".to_string()))?;
    if lease.agent_id != request.agent_id {
        return Err((
            StatusCode::FORBIDDEN,
            "lease owned by a different agent".to_string(),
        ));
    }

    state
        .db
        .finish_job(job_id, status, request.logs.as_deref())
        .await
        .map_err(internal)?;

    Ok(Json(CompleteResponse { ok: true }))
}

#[derive(Serialize)]
pub struct JobResponse {
    pub id: String,
    pub run_id: String,
    pub job_name: String,
    pub status: String,
    pub logs: Option<String>,
    pub created_at: i64,
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, HandlerError> {
    let job_id: JobId = id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid job id".to_string()))?;
    let job = state
        .db
        .get_job(job_id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "job not found".to_string()))?;
    Ok(Json(JobResponse {
        id: job.id.to_string(),
        run_id: job.run_id.to_string(),
        job_name: job.job_name,
        status: job.status.as_str().to_string(),
        logs: job.logs,
        created_at: job.created_at,
    }))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
