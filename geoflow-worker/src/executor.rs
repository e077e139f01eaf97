//! Task Executor (spec.md section 4.6): runs one task handler invocation to
//! completion, then — only for the task that turns out to be the last one
//! in its stage — aggregates the stage and advances (or finalises) the job.

use std::sync::Arc;

use chrono::Utc;
use geoflow_core::model::{
    ErrorCategory, ErrorDetails, JobMessage, JobStatus, StageResult, TaskMessage, TaskOutcome, TaskStatus,
};
use geoflow_core::queue::{QueueError, QueueTransport};
use geoflow_core::registry::{JobRegistry, TaskContext, TaskRegistry};
use geoflow_core::retry::{should_retry, RetryPolicy};
use geoflow_core::store::{StateStore, StoreError, TaskPatch};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

pub async fn handle_task_message(
    message: TaskMessage,
    state_store: &Arc<dyn StateStore>,
    job_registry: &Arc<JobRegistry>,
    task_registry: &Arc<TaskRegistry>,
    job_queue: &Arc<dyn QueueTransport<JobMessage>>,
    task_queue: &Arc<dyn QueueTransport<TaskMessage>>,
    retry_policy: &RetryPolicy,
) -> Result<(), ExecutorError> {
    // Step 1: load and de-duplicate redeliveries.
    let task = match state_store.get_task(&message.task_id).await {
        Ok(task) => task,
        Err(StoreError::NotFound(_)) => {
            warn!(task_id = %message.task_id, "task message for unknown task, dropping");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    if task.status != TaskStatus::Queued {
        info!(task_id = %task.task_id, status = ?task.status, "task already processed, dropping duplicate delivery");
        return Ok(());
    }

    // Step 2.
    state_store
        .update_task_status(
            &task.task_id,
            TaskStatus::Processing,
            Some(TaskPatch {
                heartbeat: Some(Utc::now()),
                ..Default::default()
            }),
        )
        .await?;

    // Steps 3-4.
    let outcome = match task_registry.get(&task.task_type) {
        Ok(handler) => {
            let context = TaskContext {
                job_id: task.parent_job_id.clone(),
                task_id: task.task_id.clone(),
                stage: task.stage,
                correlation_id: message.correlation_id.clone(),
            };
            handler.execute(&task.parameters, &context).await
        }
        Err(_) => TaskOutcome::failure(
            ErrorCategory::ContractViolation,
            format!("unknown task_type: {}", task.task_type),
        ),
    };

    if !outcome.success {
        let category = outcome.error_category.unwrap_or(ErrorCategory::Unclassified);
        if should_retry(category, task.retry_count, retry_policy) {
            let delay = retry_policy.backoff(task.retry_count);
            state_store
                .update_task_status(&task.task_id, TaskStatus::Retrying, None)
                .await?;
            let redelivery = TaskMessage {
                retry_count: task.retry_count + 1,
                ..message
            };
            task_queue.enqueue_delayed(redelivery, delay).await?;
            return Ok(());
        }
    }

    // Step 5.
    let complete_outcome = state_store
        .complete_task_and_check_stage(
            &task.task_id,
            &task.parent_job_id,
            task.stage,
            outcome.success,
            outcome.result_data.clone(),
            outcome.error_details.clone(),
        )
        .await?;

    let spec = job_registry.get(&task.job_type).ok();

    if !outcome.success {
        if let Some(spec) = &spec {
            if spec.strict_failure_policy() {
                let error = outcome
                    .error_details
                    .clone()
                    .unwrap_or_else(|| ErrorDetails::new("task failed under strict policy", ErrorCategory::Business));
                state_store.record_job_failure(&task.parent_job_id, error).await?;
                return Ok(());
            }
        }
    }

    // Step 6: not the last task in the stage, nothing more to do.
    if !complete_outcome.is_last_task_in_stage {
        return Ok(());
    }

    advance_stage_if_complete(
        &task.parent_job_id,
        task.stage,
        state_store,
        job_registry,
        job_queue,
        message.correlation_id,
    )
    .await
}

/// Step 7: aggregate the stage that `task_id`'s completion just closed out,
/// and either advance the job to its next stage or finalise it. Shared
/// between `handle_task_message` and the Janitor's dead-letter
/// reconciliation sweep, both of which can be the caller that observes a
/// stage's last outstanding task settle.
pub async fn advance_stage_if_complete(
    job_id: &str,
    stage: i32,
    state_store: &Arc<dyn StateStore>,
    job_registry: &Arc<JobRegistry>,
    job_queue: &Arc<dyn QueueTransport<JobMessage>>,
    correlation_id: String,
) -> Result<(), ExecutorError> {
    let stage_tasks = state_store
        .list_tasks_for_job(
            job_id,
            Some(geoflow_core::store::TaskFilter {
                stage: Some(stage),
                status: None,
            }),
        )
        .await?;
    let stage_result = StageResult::aggregate(stage, &stage_tasks, Utc::now());

    let advance = match state_store.advance_job_stage(job_id, stage, stage_result).await {
        Ok(advance) => advance,
        Err(StoreError::StaleStage { .. }) => {
            info!(job_id = %job_id, stage, "stage advance skipped: already advanced by another worker, or job already terminal");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let job = state_store.get_job(job_id).await?;
    let spec = job_registry.get(&job.job_type).ok();

    if advance.is_final_stage {
        let any_failures = job
            .stage_results
            .values()
            .any(|s| s.status != geoflow_core::model::StageStatus::Completed);
        let final_stage_failed = job
            .stage_results
            .get(&stage.to_string())
            .map(|s| s.status == geoflow_core::model::StageStatus::Failed)
            .unwrap_or(false);

        let final_status = if final_stage_failed {
            JobStatus::Failed
        } else if any_failures {
            JobStatus::CompletedWithErrors
        } else {
            JobStatus::Completed
        };

        if final_status == JobStatus::Failed {
            state_store
                .record_job_failure(job_id, ErrorDetails::new("final stage failed", ErrorCategory::Business))
                .await?;
        } else if let Some(spec) = &spec {
            let result_data = spec
                .finalize_job(&job.parameters, &job.stage_results)
                .await
                .unwrap_or_else(|e| serde_json::json!({ "finalize_error": e.0 }));
            state_store.record_job_completion(job_id, final_status, result_data).await?;
        }
    } else {
        let next_stage_message = JobMessage {
            job_id: job.job_id.clone(),
            job_type: job.job_type.clone(),
            stage: advance.new_stage,
            parameters: job.parameters.clone(),
            correlation_id,
        };
        job_queue.enqueue(next_stage_message).await?;
    }

    Ok(())
}
