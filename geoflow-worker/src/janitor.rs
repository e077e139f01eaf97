//! Janitor (spec.md section 4.8): a periodic sweep that recovers dead
//! workers, fails jobs the engine has otherwise lost track of, and
//! reconciles the queue's dead-letter state with task status.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use geoflow_core::model::{ErrorCategory, ErrorDetails, JobMessage, JobStatus, TaskMessage, TaskStatus};
use geoflow_core::queue::QueueTransport;
use geoflow_core::registry::JobRegistry;
use geoflow_core::retry::RetryPolicy;
use geoflow_core::store::{StateStore, TaskPatch};
use tracing::{info, warn};

use crate::executor::advance_stage_if_complete;

pub struct JanitorConfig {
    pub lease_grace: ChronoDuration,
    pub stuck_job_threshold: ChronoDuration,
}

/// Run one full sweep. Returns nothing — every observation is either acted
/// on directly or logged; a Janitor tick is not itself retried on error,
/// the next scheduled tick will simply see the same state again.
pub async fn run_once(
    config: &JanitorConfig,
    retry_policy: &RetryPolicy,
    state_store: &Arc<dyn StateStore>,
    job_registry: &Arc<JobRegistry>,
    job_queue: &Arc<dyn QueueTransport<JobMessage>>,
    task_queue: &Arc<dyn QueueTransport<TaskMessage>>,
) {
    if let Err(e) = sweep_heartbeat_lapse(config, retry_policy, state_store, job_registry, job_queue, task_queue).await {
        warn!(error = %e, "janitor heartbeat sweep failed");
    }
    if let Err(e) = sweep_stuck_jobs(config, state_store).await {
        warn!(error = %e, "janitor stuck-job sweep failed");
    }
    if let Err(e) = sweep_orphan_tasks(state_store).await {
        warn!(error = %e, "janitor orphan-task sweep failed");
    }
    if let Err(e) = sweep_dead_letters(state_store, job_registry, job_queue, task_queue).await {
        warn!(error = %e, "janitor dead-letter sweep failed");
    }
}

async fn sweep_heartbeat_lapse(
    config: &JanitorConfig,
    retry_policy: &RetryPolicy,
    state_store: &Arc<dyn StateStore>,
    job_registry: &Arc<JobRegistry>,
    job_queue: &Arc<dyn QueueTransport<JobMessage>>,
    task_queue: &Arc<dyn QueueTransport<TaskMessage>>,
) -> anyhow::Result<()> {
    let stale = state_store.list_stale_processing_tasks(config.lease_grace).await?;
    for task in stale {
        if task.retry_count >= retry_policy.max_retries {
            warn!(task_id = %task.task_id, "heartbeat lapsed and retries exhausted, failing task");
            let outcome = state_store
                .complete_task_and_check_stage(
                    &task.task_id,
                    &task.parent_job_id,
                    task.stage,
                    false,
                    None,
                    Some(ErrorDetails::new("heartbeat lapsed, retries exhausted", ErrorCategory::Transient)),
                )
                .await?;
            if outcome.is_last_task_in_stage {
                advance_stage_if_complete(
                    &task.parent_job_id,
                    task.stage,
                    state_store,
                    job_registry,
                    job_queue,
                    task.task_id.clone(),
                )
                .await?;
            }
            continue;
        }

        info!(task_id = %task.task_id, "heartbeat lapsed, requeuing");
        state_store
            .update_task_status(&task.task_id, TaskStatus::Queued, Some(TaskPatch::default()))
            .await?;
        let message = TaskMessage {
            task_id: task.task_id,
            parent_job_id: task.parent_job_id,
            job_type: task.job_type,
            task_type: task.task_type,
            stage: task.stage,
            task_index: task.task_index,
            parameters: task.parameters,
            retry_count: task.retry_count,
            correlation_id: String::from("janitor-heartbeat-recovery"),
        };
        task_queue.enqueue(message).await?;
    }
    Ok(())
}

async fn sweep_stuck_jobs(config: &JanitorConfig, state_store: &Arc<dyn StateStore>) -> anyhow::Result<()> {
    let stuck = state_store.list_stuck_jobs(config.stuck_job_threshold).await?;
    for job in stuck {
        warn!(job_id = %job.job_id, "no task activity past stuck threshold, failing job");
        state_store
            .record_job_failure(&job.job_id, ErrorDetails::new("orchestration_stuck", ErrorCategory::Transient))
            .await?;
    }
    Ok(())
}

async fn sweep_orphan_tasks(state_store: &Arc<dyn StateStore>) -> anyhow::Result<()> {
    let deleted = state_store.delete_orphan_tasks().await?;
    if !deleted.is_empty() {
        info!(count = deleted.len(), task_ids = ?deleted, "deleted orphan tasks");
    }
    Ok(())
}

async fn sweep_dead_letters(
    state_store: &Arc<dyn StateStore>,
    job_registry: &Arc<JobRegistry>,
    job_queue: &Arc<dyn QueueTransport<JobMessage>>,
    task_queue: &Arc<dyn QueueTransport<TaskMessage>>,
) -> anyhow::Result<()> {
    let dead_lettered = task_queue.list_dead_lettered().await?;
    for message in dead_lettered {
        let task = match state_store.get_task(&message.task_id).await {
            Ok(task) => task,
            Err(_) => continue,
        };
        if task.status == TaskStatus::Failed || task.status == TaskStatus::Completed {
            continue;
        }
        warn!(task_id = %task.task_id, "reconciling dead-lettered message, failing task");
        let outcome = state_store
            .complete_task_and_check_stage(
                &task.task_id,
                &task.parent_job_id,
                task.stage,
                false,
                None,
                Some(ErrorDetails::new("dead-lettered after max delivery attempts", ErrorCategory::Transient)),
            )
            .await?;
        if outcome.is_last_task_in_stage {
            advance_stage_if_complete(
                &task.parent_job_id,
                task.stage,
                state_store,
                job_registry,
                job_queue,
                task.task_id.clone(),
            )
            .await?;
        }
    }
    Ok(())
}
