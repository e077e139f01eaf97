//! HTTP handlers for the Submission Gateway (spec.md section 4.4 and 6).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use geoflow_core::canonical::derive_job_id;
use geoflow_core::model::{JobMessage, JobRecord, JobStatus};
use geoflow_core::store::StoreError;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub deduplicated: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskStageCounts {
    pub stage: i32,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retrying: i64,
}

#[derive(Debug, Serialize)]
pub struct GetJobResponse {
    #[serde(flatten)]
    pub job: JobRecord,
    pub task_summary: Vec<TaskStageCounts>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: message.into() }))
}

pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Path(job_type): Path<String>,
    Json(parameters): Json<serde_json::Value>,
) -> Result<Json<SubmitJobResponse>, (StatusCode, Json<ErrorResponse>)> {
    let spec = state
        .job_registry
        .get(&job_type)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("unknown job_type: {job_type}")))?;

    let normalised = spec
        .validate_parameters(parameters)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.0))?;

    let job_id = derive_job_id(&job_type, &normalised);
    let now = Utc::now();
    let job = JobRecord::new(job_id.clone(), job_type.clone(), normalised.clone(), spec.stages().len() as i32, now);

    let outcome = state
        .state_store
        .create_job(job)
        .await
        .map_err(|e| store_error_response(e))?;

    if outcome.created {
        let message = JobMessage {
            job_id: job_id.clone(),
            job_type: job_type.clone(),
            stage: 1,
            parameters: normalised,
            correlation_id: job_id.clone(),
        };
        if let Err(e) = state.job_queue.enqueue(message).await {
            error!(job_id = %job_id, error = %e, "failed to enqueue job message after create_job succeeded");
            return Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to enqueue job"));
        }
        info!(job_id = %job_id, job_type = %job_type, "job submitted");
    }

    Ok(Json(SubmitJobResponse {
        job_id,
        status: outcome.existing_status.unwrap_or(JobStatus::Queued),
        deduplicated: !outcome.created,
    }))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<GetJobResponse>, (StatusCode, Json<ErrorResponse>)> {
    let job = state
        .state_store
        .get_job(&job_id)
        .await
        .map_err(|e| store_error_response(e))?;

    let tasks = state
        .state_store
        .list_tasks_for_job(&job_id, None)
        .await
        .map_err(|e| store_error_response(e))?;

    let mut task_summary: Vec<TaskStageCounts> = Vec::new();
    for stage in 1..=job.total_stages {
        let in_stage: Vec<_> = tasks.iter().filter(|t| t.stage == stage).collect();
        task_summary.push(TaskStageCounts {
            stage,
            queued: in_stage.iter().filter(|t| t.status == geoflow_core::model::TaskStatus::Queued).count() as i64,
            processing: in_stage.iter().filter(|t| t.status == geoflow_core::model::TaskStatus::Processing).count() as i64,
            completed: in_stage.iter().filter(|t| t.status == geoflow_core::model::TaskStatus::Completed).count() as i64,
            failed: in_stage.iter().filter(|t| t.status == geoflow_core::model::TaskStatus::Failed).count() as i64,
            retrying: in_stage.iter().filter(|t| t.status == geoflow_core::model::TaskStatus::Retrying).count() as i64,
        });
    }

    Ok(Json(GetJobResponse { job, task_summary }))
}

pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

fn store_error_response(error: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    match error {
        StoreError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, msg),
        StoreError::ContractViolation(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        StoreError::InvalidTransition { .. } | StoreError::StaleStage { .. } => {
            error_response(StatusCode::CONFLICT, error.to_string())
        }
        StoreError::Durable(e) => {
            error!(error = %e, "durable state store error");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "engine unavailable")
        }
    }
}
