//! Job Orchestrator (spec.md section 4.5): turns one `JobMessage` into a
//! batch of durably-recorded `TaskRecord`s, enters the job into PROCESSING
//! only once that batch is safely stored, and enqueues the corresponding
//! `TaskMessage`s.

use std::sync::Arc;

use geoflow_core::model::{ErrorDetails, ErrorCategory, JobStatus, TaskMessage, TaskRecord};
use geoflow_core::queue::{QueueTransport, QueueError};
use geoflow_core::registry::JobRegistry;
use geoflow_core::store::{StateStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

pub async fn handle_job_message(
    message: geoflow_core::model::JobMessage,
    state_store: &Arc<dyn StateStore>,
    job_registry: &Arc<JobRegistry>,
    task_queue: &Arc<dyn QueueTransport<TaskMessage>>,
) -> Result<(), OrchestratorError> {
    // Phase 1: validate and load.
    let job = match state_store.get_job(&message.job_id).await {
        Ok(job) => job,
        Err(StoreError::NotFound(_)) => {
            warn!(job_id = %message.job_id, "job message for unknown job, dropping");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if job.stage != message.stage {
        info!(job_id = %job.job_id, job_stage = job.stage, message_stage = message.stage, "stale job message, dropping");
        return Ok(());
    }
    if job.status.is_terminal() {
        info!(job_id = %job.job_id, status = ?job.status, "job already terminal, dropping message");
        return Ok(());
    }

    let spec = match job_registry.get(&job.job_type) {
        Ok(spec) => spec,
        Err(_) => {
            state_store
                .record_job_failure(
                    &job.job_id,
                    ErrorDetails::new(format!("unknown job_type: {}", job.job_type), ErrorCategory::ContractViolation),
                )
                .await?;
            return Ok(());
        }
    };

    // Phase 2: task generation.
    let prev_stage_result = if job.stage > 1 {
        job.stage_results.get(&(job.stage - 1).to_string())
    } else {
        None
    };

    let task_defs = match spec
        .create_tasks_for_stage(job.stage, &job.parameters, &job.job_id, prev_stage_result)
        .await
    {
        Ok(defs) => defs,
        Err(e) => {
            state_store
                .record_job_failure(&job.job_id, ErrorDetails::new(e.0, ErrorCategory::Business))
                .await?;
            return Ok(());
        }
    };

    let task_type = spec
        .stages()
        .iter()
        .find(|s| s.number == job.stage)
        .map(|s| s.task_type.clone())
        .unwrap_or_default();

    // Phase 3: task creation and enqueue.
    let now = chrono::Utc::now();
    let tasks: Vec<TaskRecord> = task_defs
        .into_iter()
        .map(|def| {
            TaskRecord::new(
                &job.job_id,
                job.job_type.clone(),
                task_type.clone(),
                job.stage,
                def.task_index,
                def.parameters,
                now,
            )
        })
        .collect();

    state_store.create_task_batch(tasks.clone(), &job.job_id).await?;

    if job.status == JobStatus::Queued {
        state_store.update_job_status(&job.job_id, JobStatus::Processing, None).await?;
    }

    for task in &tasks {
        let message = TaskMessage {
            task_id: task.task_id.clone(),
            parent_job_id: task.parent_job_id.clone(),
            job_type: task.job_type.clone(),
            task_type: task.task_type.clone(),
            stage: task.stage,
            task_index: task.task_index.clone(),
            parameters: task.parameters.clone(),
            retry_count: 0,
            correlation_id: job.job_id.clone(),
        };
        if let Err(e) = task_queue.enqueue(message).await {
            // The job stays PROCESSING; the Janitor reconciles any task rows
            // left QUEUED with no corresponding message.
            warn!(task_id = %task.task_id, error = %e, "failed to enqueue task message");
        }
    }

    Ok(())
}
