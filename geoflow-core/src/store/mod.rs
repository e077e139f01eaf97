//! The State Store contract (spec.md section 4.1): the durable record of
//! jobs, tasks, and stage results, and the two atomic primitives
//! (`complete_task_and_check_stage`, `advance_job_stage`) that let
//! distributed Task Executors decide "am I the last task?" without races.
//!
//! The trait is the data boundary only — it never enqueues a message or
//! otherwise orchestrates. That responsibility belongs to the Task
//! Executor (spec.md section 9, "repository mixing data access and
//! orchestration").

pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ErrorDetails, JobRecord, JobStatus, StageResult, TaskRecord, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid status transition for {entity} {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },
    /// Returned when `advance_job_stage` is refused: either the job is no
    /// longer at `expected_stage` (a racing executor already advanced it),
    /// or the job has already reached a terminal status and must not be
    /// mutated further. Both are safe no-ops for the caller.
    #[error("stage advance rejected: job {job_id} is no longer eligible to advance from stage {expected_stage}")]
    StaleStage { job_id: String, expected_stage: i32 },
    #[error("contract violation: {0}")]
    ContractViolation(String),
    #[error("durable backend error: {0}")]
    Durable(#[from] sqlx::Error),
}

/// Result of `create_job`: whether this call inserted the row, and — when
/// it did not — the existing record's status, for the Gateway's
/// deduplication response.
#[derive(Debug, Clone)]
pub struct CreateJobOutcome {
    pub created: bool,
    pub existing_status: Option<JobStatus>,
}

/// Optional filter for `list_tasks_for_job`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub stage: Option<i32>,
    pub status: Option<TaskStatus>,
}

/// Partial update applied alongside a job status transition.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<ErrorDetails>,
}

/// Partial update applied alongside a task status transition.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<ErrorDetails>,
    pub retry_count: Option<i32>,
    pub heartbeat: Option<chrono::DateTime<chrono::Utc>>,
}

/// Result of the atomic "complete this task, then check whether it was the
/// last one in its stage" primitive.
#[derive(Debug, Clone)]
pub struct CompleteTaskOutcome {
    pub task_updated: bool,
    pub is_last_task_in_stage: bool,
    pub remaining_tasks: i64,
}

/// Result of the conditional stage-advance primitive.
#[derive(Debug, Clone)]
pub struct AdvanceStageOutcome {
    pub new_stage: i32,
    pub is_final_stage: bool,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_job(&self, job: JobRecord) -> Result<CreateJobOutcome, StoreError>;

    async fn get_job(&self, job_id: &str) -> Result<JobRecord, StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<TaskRecord, StoreError>;

    async fn list_tasks_for_job(
        &self,
        job_id: &str,
        filter: Option<TaskFilter>,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn update_job_status(
        &self,
        job_id: &str,
        new_status: JobStatus,
        patch: Option<JobPatch>,
    ) -> Result<(), StoreError>;

    async fn update_task_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        patch: Option<TaskPatch>,
    ) -> Result<(), StoreError>;

    /// All-or-nothing insertion. Every `task_id` must start with
    /// `parent_job_id[:8]` (spec.md invariant 2) — violation is a
    /// `ContractViolation`, not a durable error.
    async fn create_task_batch(
        &self,
        tasks: Vec<TaskRecord>,
        parent_job_id: &str,
    ) -> Result<(), StoreError>;

    /// Atomically transition `task_id` to a terminal status and, under a
    /// lock keyed on `(job_id, stage)`, report whether it was the last
    /// non-terminal task of that stage.
    async fn complete_task_and_check_stage(
        &self,
        task_id: &str,
        job_id: &str,
        stage: i32,
        success: bool,
        result_data: Option<serde_json::Value>,
        error_details: Option<ErrorDetails>,
    ) -> Result<CompleteTaskOutcome, StoreError>;

    /// Conditionally increment `stage` and append `stage_result`, only if
    /// `current_stage` still matches and the job is not already terminal —
    /// the guard that prevents a double-advance when two executors race,
    /// and prevents a late-completing task in a stage from mutating a job
    /// a strict failure policy already closed out (spec.md section 4.6).
    async fn advance_job_stage(
        &self,
        job_id: &str,
        current_stage: i32,
        stage_result: StageResult,
    ) -> Result<AdvanceStageOutcome, StoreError>;

    async fn record_job_completion(
        &self,
        job_id: &str,
        status: JobStatus,
        result_data: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn record_job_failure(&self, job_id: &str, error: ErrorDetails) -> Result<(), StoreError>;

    /// Tasks in PROCESSING whose heartbeat is older than `lease_grace` ago —
    /// candidates for the Janitor's heartbeat-lapse sweep (spec.md 4.8.1).
    async fn list_stale_processing_tasks(
        &self,
        lease_grace: chrono::Duration,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Jobs in PROCESSING with no non-terminal task and no recent task
    /// heartbeat — candidates for the Janitor's stuck-job sweep (spec.md
    /// 4.8.2).
    async fn list_stuck_jobs(&self, stuck_threshold: chrono::Duration) -> Result<Vec<JobRecord>, StoreError>;

    /// Delete and return the ids of tasks whose `parent_job_id` no longer
    /// has a corresponding job row (spec.md 4.8.3).
    async fn delete_orphan_tasks(&self) -> Result<Vec<String>, StoreError>;
}

/// `Job:  QUEUED → PROCESSING → {COMPLETED, COMPLETED_WITH_ERRORS, FAILED}`
pub fn job_transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Queued, Processing)
            | (Processing, Completed)
            | (Processing, CompletedWithErrors)
            | (Processing, Failed)
            | (Queued, Failed)
    )
}

/// ```text
/// Task: QUEUED → PROCESSING → {COMPLETED, FAILED, RETRYING}
///       RETRYING   → QUEUED      (on re-enqueue)
///       PROCESSING → QUEUED      (Janitor heartbeat-lapse recovery)
///       QUEUED     → FAILED      (only from Janitor / validation)
/// ```
pub fn task_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Queued, Processing)
            | (Processing, Completed)
            | (Processing, Failed)
            | (Processing, Retrying)
            | (Retrying, Queued)
            | (Processing, Queued)
            | (Queued, Failed)
    )
}
