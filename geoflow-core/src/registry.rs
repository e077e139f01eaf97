//! Job Registry / Task Registry (spec.md section 4.3).
//!
//! Registration is an explicit call made once at process init from a fixed
//! list of constructors — never a self-registering decorator — per the
//! redesign note in spec.md section 9. Once `JobRegistry::freeze` runs, the
//! map is read-only for the lifetime of the process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::model::{StageResult, TaskOutcome};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job_type already registered: {0}")]
    DuplicateJobType(String),
    #[error("workflow spec for {0} has an empty stage list")]
    EmptyStageList(String),
    #[error("unknown job_type: {0}")]
    UnknownJobType(String),
    #[error("unknown task_type: {0}")]
    UnknownTaskType(String),
    #[error("task_type {task_type} used by job_type {job_type} is not registered in the task registry")]
    DanglingTaskType { job_type: String, task_type: String },
}

/// One stage descriptor within a `WorkflowSpec`.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub number: i32,
    pub task_type: String,
    pub parallelism: Parallelism,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    Single,
    FanOut,
}

/// One task the generator wants created for a stage: a semantic index
/// (embedded verbatim in the resulting `task_id`) plus its parameters.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub task_index: String,
    pub parameters: serde_json::Value,
}

/// A domain error raised while validating parameters or generating tasks.
/// Always a contract violation or business error, never retried.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct WorkflowError(pub String);

/// Registry entry mapping `job_type` to its stage list, task generator,
/// parameter schema, and finaliser (spec.md section 4.3).
#[async_trait]
pub trait WorkflowSpec: Send + Sync {
    fn job_type(&self) -> &str;

    fn stages(&self) -> &[StageDescriptor];

    /// Validate and normalise the submitted parameters. Violations are
    /// surfaced to the Gateway as `BadRequest`.
    fn validate_parameters(&self, params: serde_json::Value) -> Result<serde_json::Value, WorkflowError>;

    /// Build the task list for `stage_number`. `previous_stage_result` is
    /// `None` for stage 1, and `Some` otherwise — whether a
    /// `completed_with_errors` previous stage is acceptable here is a
    /// decision this generator makes (spec.md section 9, open question 1).
    async fn create_tasks_for_stage(
        &self,
        stage_number: i32,
        job_params: &serde_json::Value,
        job_id: &str,
        previous_stage_result: Option<&StageResult>,
    ) -> Result<Vec<TaskDefinition>, WorkflowError>;

    /// Combine every stage's `StageResult` into the job's final result.
    async fn finalize_job(
        &self,
        job_params: &serde_json::Value,
        all_stage_results: &HashMap<String, StageResult>,
    ) -> Result<serde_json::Value, WorkflowError>;

    /// Whether retry exhaustion on any task fails the whole job immediately
    /// (strict), or lets the stage complete as `completed_with_errors`.
    fn strict_failure_policy(&self) -> bool {
        false
    }
}

/// Per-`task_type` business logic function (spec.md section 4.3 and 6).
/// Handlers are pure at the engine-state boundary: they read `params` and
/// `context` and return a `TaskOutcome`, never touching the State Store or
/// queue directly.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &str;

    async fn execute(&self, params: &serde_json::Value, context: &TaskContext) -> TaskOutcome;
}

/// Read-only context handed to a task handler (spec.md section 6).
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: String,
    pub task_id: String,
    pub stage: i32,
    pub correlation_id: String,
}

/// Immutable, process-wide `job_type -> WorkflowSpec` table.
#[derive(Clone, Default)]
pub struct JobRegistry {
    specs: HashMap<String, Arc<dyn WorkflowSpec>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow spec. Rejected if `job_type` is already present
    /// or the stage list is empty (spec.md section 4.3).
    pub fn register(&mut self, spec: Arc<dyn WorkflowSpec>) -> Result<(), RegistryError> {
        let job_type = spec.job_type().to_string();
        if self.specs.contains_key(&job_type) {
            return Err(RegistryError::DuplicateJobType(job_type));
        }
        if spec.stages().is_empty() {
            return Err(RegistryError::EmptyStageList(job_type));
        }
        self.specs.insert(job_type, spec);
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Result<Arc<dyn WorkflowSpec>, RegistryError> {
        self.specs
            .get(job_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownJobType(job_type.to_string()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.specs.contains_key(job_type)
    }

    /// Consume `self` into an `Arc`, signalling the registry is now frozen:
    /// nothing but `Arc::clone` happens to it from here on.
    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Immutable, process-wide `task_type -> TaskHandler` table.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), RegistryError> {
        let task_type = handler.task_type().to_string();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::DuplicateJobType(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskHandler>, RegistryError> {
        self.handlers
            .get(task_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTaskType(task_type.to_string()))
    }

    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Validate that every `task_type` a `JobRegistry`'s workflows reference is
/// present in `task_registry`. Intended to run once at process init,
/// immediately after both registries are populated.
pub fn validate_cross_registry(
    job_registry: &JobRegistry,
    task_registry: &TaskRegistry,
) -> Result<(), RegistryError> {
    for spec in job_registry.specs.values() {
        for stage in spec.stages() {
            if task_registry.get(&stage.task_type).is_err() {
                return Err(RegistryError::DanglingTaskType {
                    job_type: spec.job_type().to_string(),
                    task_type: stage.task_type.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskOutcome;

    struct Noop;

    #[async_trait]
    impl WorkflowSpec for Noop {
        fn job_type(&self) -> &str {
            "noop"
        }
        fn stages(&self) -> &[StageDescriptor] {
            &[]
        }
        fn validate_parameters(&self, params: serde_json::Value) -> Result<serde_json::Value, WorkflowError> {
            Ok(params)
        }
        async fn create_tasks_for_stage(
            &self,
            _stage_number: i32,
            _job_params: &serde_json::Value,
            _job_id: &str,
            _previous_stage_result: Option<&StageResult>,
        ) -> Result<Vec<TaskDefinition>, WorkflowError> {
            Ok(vec![])
        }
        async fn finalize_job(
            &self,
            _job_params: &serde_json::Value,
            _all_stage_results: &HashMap<String, StageResult>,
        ) -> Result<serde_json::Value, WorkflowError> {
            Ok(serde_json::json!({}))
        }
    }

    #[test]
    fn rejects_empty_stage_list() {
        let mut registry = JobRegistry::new();
        let err = registry.register(Arc::new(Noop)).unwrap_err();
        assert!(matches!(err, RegistryError::EmptyStageList(_)));
    }

    struct OneStage;

    #[async_trait]
    impl WorkflowSpec for OneStage {
        fn job_type(&self) -> &str {
            "one_stage"
        }
        fn stages(&self) -> &[StageDescriptor] {
            static STAGES: std::sync::OnceLock<Vec<StageDescriptor>> = std::sync::OnceLock::new();
            STAGES.get_or_init(|| {
                vec![StageDescriptor {
                    number: 1,
                    task_type: "greet".to_string(),
                    parallelism: Parallelism::Single,
                }]
            })
        }
        fn validate_parameters(&self, params: serde_json::Value) -> Result<serde_json::Value, WorkflowError> {
            Ok(params)
        }
        async fn create_tasks_for_stage(
            &self,
            _stage_number: i32,
            _job_params: &serde_json::Value,
            _job_id: &str,
            _previous_stage_result: Option<&StageResult>,
        ) -> Result<Vec<TaskDefinition>, WorkflowError> {
            Ok(vec![])
        }
        async fn finalize_job(
            &self,
            _job_params: &serde_json::Value,
            _all_stage_results: &HashMap<String, StageResult>,
        ) -> Result<serde_json::Value, WorkflowError> {
            Ok(serde_json::json!({}))
        }
    }

    #[test]
    fn rejects_duplicate_job_type() {
        let mut registry = JobRegistry::new();
        registry.register(Arc::new(OneStage)).unwrap();
        let err = registry.register(Arc::new(OneStage)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateJobType(_)));
    }

    #[test]
    fn cross_registry_validation_catches_dangling_task_type() {
        let mut jobs = JobRegistry::new();
        jobs.register(Arc::new(OneStage)).unwrap();
        let tasks = TaskRegistry::new();
        let err = validate_cross_registry(&jobs, &tasks).unwrap_err();
        assert!(matches!(err, RegistryError::DanglingTaskType { .. }));
    }

    struct Greet;
    #[async_trait]
    impl TaskHandler for Greet {
        fn task_type(&self) -> &str {
            "greet"
        }
        async fn execute(&self, _params: &serde_json::Value, _ctx: &TaskContext) -> TaskOutcome {
            TaskOutcome::success(serde_json::json!({}))
        }
    }

    #[test]
    fn cross_registry_validation_passes_when_satisfied() {
        let mut jobs = JobRegistry::new();
        jobs.register(Arc::new(OneStage)).unwrap();
        let mut tasks = TaskRegistry::new();
        tasks.register(Arc::new(Greet)).unwrap();
        validate_cross_registry(&jobs, &tasks).unwrap();
    }
}
