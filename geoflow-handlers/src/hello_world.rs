//! `hello_world`: single-stage, single-task workflow used as the happy-path
//! smoke test for the whole engine.

use async_trait::async_trait;
use geoflow_core::model::{StageResult, TaskOutcome};
use geoflow_core::registry::{
    Parallelism, StageDescriptor, TaskContext, TaskDefinition, TaskHandler, WorkflowError,
    WorkflowSpec,
};
use std::collections::HashMap;
use std::sync::OnceLock;

pub struct HelloWorldSpec;

fn stages() -> &'static [StageDescriptor] {
    static STAGES: OnceLock<Vec<StageDescriptor>> = OnceLock::new();
    STAGES.get_or_init(|| {
        vec![StageDescriptor {
            number: 1,
            task_type: "echo".to_string(),
            parallelism: Parallelism::Single,
        }]
    })
}

#[async_trait]
impl WorkflowSpec for HelloWorldSpec {
    fn job_type(&self) -> &str {
        "hello_world"
    }

    fn stages(&self) -> &[StageDescriptor] {
        stages()
    }

    fn validate_parameters(
        &self,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, WorkflowError> {
        match params.get("message") {
            Some(serde_json::Value::String(_)) => Ok(params),
            _ => Err(WorkflowError("hello_world requires a string \"message\" parameter".into())),
        }
    }

    async fn create_tasks_for_stage(
        &self,
        stage_number: i32,
        job_params: &serde_json::Value,
        _job_id: &str,
        _previous_stage_result: Option<&StageResult>,
    ) -> Result<Vec<TaskDefinition>, WorkflowError> {
        debug_assert_eq!(stage_number, 1);
        Ok(vec![TaskDefinition {
            task_index: "0".to_string(),
            parameters: job_params.clone(),
        }])
    }

    async fn finalize_job(
        &self,
        _job_params: &serde_json::Value,
        all_stage_results: &HashMap<String, StageResult>,
    ) -> Result<serde_json::Value, WorkflowError> {
        let stage = all_stage_results
            .get("1")
            .ok_or_else(|| WorkflowError("stage 1 result missing at finalize time".into()))?;
        let task = stage
            .task_results
            .first()
            .ok_or_else(|| WorkflowError("stage 1 produced no task results".into()))?;
        let echoed = task
            .result_data
            .clone()
            .ok_or_else(|| WorkflowError("echo task produced no result_data".into()))?;
        Ok(echoed)
    }
}

/// Echoes the submitted message back, tagged so callers can see the round
/// trip went through a handler and not just the gateway.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn task_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, params: &serde_json::Value, _context: &TaskContext) -> TaskOutcome {
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        TaskOutcome::success(serde_json::json!({ "echoed": message }))
    }
}
