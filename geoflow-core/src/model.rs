//! Typed shapes that cross every boundary in the engine: jobs, tasks, stage
//! results, and the two queue message envelopes. Nothing here is a free-form
//! map — see `spec.md` section 9's note on mixed dict/typed records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a `Job`. Transitions are validated by the state
/// store against the table in `store::transitions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    CompletedWithErrors,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::CompletedWithErrors
        )
    }
}

/// Lifecycle status of a `Task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Aggregate status of a completed `StageResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    CompletedWithErrors,
}

/// Error classification from the Retry / Failure Manager (spec.md 4.7).
/// A field on `TaskOutcome`/`TaskRecord`, never inferred from a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "error_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ContractViolation,
    Business,
    Transient,
    Unclassified,
}

/// Opaque structured error payload attached to a failed job or task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
    pub category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ErrorDetails {
    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            category: Some(category),
            context: None,
        }
    }

    pub fn contract_violation(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::ContractViolation)
    }
}

/// A client-submitted unit of work, decomposed into stages by its
/// `WorkflowSpec`. See spec.md section 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub job_type: String,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    pub stage: i32,
    pub total_stages: i32,
    pub stage_results: HashMap<String, StageResult>,
    pub metadata: serde_json::Value,
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<ErrorDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Construct a brand-new job record in its initial `Queued` state.
    /// The only constructor — partial job records cannot be built, per
    /// spec.md section 9's "factory methods" redesign note.
    pub fn new(
        job_id: String,
        job_type: String,
        parameters: serde_json::Value,
        total_stages: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            job_type,
            parameters,
            status: JobStatus::Queued,
            stage: 1,
            total_stages,
            stage_results: HashMap::new(),
            metadata: serde_json::Value::Object(Default::default()),
            result_data: None,
            error_details: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single invocation of a handler within a stage. See spec.md section 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub parent_job_id: String,
    pub job_type: String,
    pub task_type: String,
    pub stage: i32,
    pub task_index: String,
    pub parameters: serde_json::Value,
    pub status: TaskStatus,
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<ErrorDetails>,
    pub retry_count: i32,
    pub heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Build the canonical `task_id`: `{job_id[:8]}-s{stage}-{task_index}`.
    pub fn make_id(job_id: &str, stage: i32, task_index: &str) -> String {
        let prefix: String = job_id.chars().take(8).collect();
        format!("{prefix}-s{stage}-{task_index}")
    }

    pub fn new(
        parent_job_id: &str,
        job_type: String,
        task_type: String,
        stage: i32,
        task_index: String,
        parameters: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        let task_id = Self::make_id(parent_job_id, stage, &task_index);
        Self {
            task_id,
            parent_job_id: parent_job_id.to_string(),
            job_type,
            task_type,
            stage,
            task_index,
            parameters,
            status: TaskStatus::Queued,
            result_data: None,
            error_details: None,
            retry_count: 0,
            heartbeat: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-task result snapshot embedded (ordered) in a `StageResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultSnapshot {
    pub task_id: String,
    pub task_type: String,
    pub stage: i32,
    pub task_index: String,
    pub status: TaskStatus,
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<ErrorDetails>,
}

impl From<&TaskRecord> for TaskResultSnapshot {
    fn from(task: &TaskRecord) -> Self {
        Self {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            stage: task.stage,
            task_index: task.task_index.clone(),
            status: task.status,
            result_data: task.result_data.clone(),
            error_details: task.error_details.clone(),
        }
    }
}

/// Typed aggregation of a stage's task outcomes. Stored on the job keyed by
/// `str(stage_number)` — never a raw int key, per spec.md section 9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_number: i32,
    pub stage_key: String,
    pub status: StageStatus,
    pub task_count: i32,
    pub successful_tasks: i32,
    pub failed_tasks: i32,
    pub success_rate: f64,
    pub task_results: Vec<TaskResultSnapshot>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl StageResult {
    /// Aggregate a completed stage's tasks into its `StageResult`, applying
    /// the status rule of spec.md section 4.6 step 7.
    pub fn aggregate(stage_number: i32, tasks: &[TaskRecord], completed_at: DateTime<Utc>) -> Self {
        let task_count = tasks.len() as i32;
        let successful_tasks = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count() as i32;
        let failed_tasks = task_count - successful_tasks;

        let status = if failed_tasks == 0 {
            StageStatus::Completed
        } else if successful_tasks == 0 {
            StageStatus::Failed
        } else {
            StageStatus::CompletedWithErrors
        };

        let success_rate = if task_count == 0 {
            0.0
        } else {
            successful_tasks as f64 / task_count as f64
        };

        Self {
            stage_number,
            stage_key: stage_number.to_string(),
            status,
            task_count,
            successful_tasks,
            failed_tasks,
            success_rate,
            task_results: tasks.iter().map(TaskResultSnapshot::from).collect(),
            completed_at,
            metadata: None,
        }
    }
}

/// Queue envelope consumed by the Job Orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: String,
    pub job_type: String,
    pub stage: i32,
    pub parameters: serde_json::Value,
    pub correlation_id: String,
}

/// Queue envelope consumed by the Task Executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub parent_job_id: String,
    pub job_type: String,
    pub task_type: String,
    pub stage: i32,
    pub task_index: String,
    pub parameters: serde_json::Value,
    pub retry_count: i32,
    pub correlation_id: String,
}

/// A handler's verdict on a single task invocation (spec.md section 4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<ErrorDetails>,
    pub error_category: Option<ErrorCategory>,
}

impl TaskOutcome {
    pub fn success(result_data: serde_json::Value) -> Self {
        Self {
            success: true,
            result_data: Some(result_data),
            error_details: None,
            error_category: None,
        }
    }

    pub fn failure(category: ErrorCategory, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            result_data: None,
            error_details: Some(ErrorDetails::new(message, category)),
            error_category: Some(category),
        }
    }
}
