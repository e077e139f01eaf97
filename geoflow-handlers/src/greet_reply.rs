//! `greet_reply`: two-stage fan-out workflow. Stage 1 greets each name in
//! parallel; stage 2 replies to each greeting, keyed by the same semantic
//! index across stages (`greet-{i}` -> `reply-{i}`).

use async_trait::async_trait;
use geoflow_core::model::{StageResult, TaskOutcome};
use geoflow_core::registry::{
    Parallelism, StageDescriptor, TaskContext, TaskDefinition, TaskHandler, WorkflowError,
    WorkflowSpec,
};
use std::collections::HashMap;
use std::sync::OnceLock;

const FAN_OUT: usize = 3;

pub struct GreetReplySpec;

fn stages() -> &'static [StageDescriptor] {
    static STAGES: OnceLock<Vec<StageDescriptor>> = OnceLock::new();
    STAGES.get_or_init(|| {
        vec![
            StageDescriptor {
                number: 1,
                task_type: "greet".to_string(),
                parallelism: Parallelism::FanOut,
            },
            StageDescriptor {
                number: 2,
                task_type: "reply".to_string(),
                parallelism: Parallelism::FanOut,
            },
        ]
    })
}

#[async_trait]
impl WorkflowSpec for GreetReplySpec {
    fn job_type(&self) -> &str {
        "greet_reply"
    }

    fn stages(&self) -> &[StageDescriptor] {
        stages()
    }

    fn validate_parameters(
        &self,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, WorkflowError> {
        let names = params
            .get("names")
            .and_then(|v| v.as_array())
            .ok_or_else(|| WorkflowError("greet_reply requires a \"names\" array".into()))?;
        if names.len() != FAN_OUT {
            return Err(WorkflowError(format!(
                "greet_reply requires exactly {FAN_OUT} names, got {}",
                names.len()
            )));
        }
        if !names.iter().all(|n| n.is_string()) {
            return Err(WorkflowError("every entry in \"names\" must be a string".into()));
        }
        Ok(params)
    }

    async fn create_tasks_for_stage(
        &self,
        stage_number: i32,
        job_params: &serde_json::Value,
        _job_id: &str,
        previous_stage_result: Option<&StageResult>,
    ) -> Result<Vec<TaskDefinition>, WorkflowError> {
        match stage_number {
            1 => {
                let names = job_params
                    .get("names")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| WorkflowError("missing \"names\" at stage 1".into()))?;
                Ok(names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| TaskDefinition {
                        task_index: format!("greet-{i}"),
                        parameters: serde_json::json!({ "name": name }),
                    })
                    .collect())
            }
            2 => {
                let stage1 = previous_stage_result
                    .ok_or_else(|| WorkflowError("stage 2 requires stage 1's result".into()))?;
                let mut tasks = Vec::with_capacity(FAN_OUT);
                for i in 0..FAN_OUT {
                    let semantic_index = format!("greet-{i}");
                    let greeting = stage1
                        .task_results
                        .iter()
                        .find(|t| t.task_index == semantic_index)
                        .and_then(|t| t.result_data.as_ref())
                        .and_then(|r| r.get("greeting").cloned())
                        .ok_or_else(|| {
                            WorkflowError(format!("no greeting result for {semantic_index}"))
                        })?;
                    tasks.push(TaskDefinition {
                        task_index: format!("reply-{i}"),
                        parameters: serde_json::json!({ "greeting": greeting }),
                    });
                }
                Ok(tasks)
            }
            other => Err(WorkflowError(format!("greet_reply has no stage {other}"))),
        }
    }

    async fn finalize_job(
        &self,
        _job_params: &serde_json::Value,
        all_stage_results: &HashMap<String, StageResult>,
    ) -> Result<serde_json::Value, WorkflowError> {
        let stage2 = all_stage_results
            .get("2")
            .ok_or_else(|| WorkflowError("stage 2 result missing at finalize time".into()))?;
        let mut replies: Vec<(String, serde_json::Value)> = stage2
            .task_results
            .iter()
            .map(|t| {
                let reply = t
                    .result_data
                    .as_ref()
                    .and_then(|r| r.get("reply").cloned())
                    .unwrap_or(serde_json::Value::Null);
                (t.task_index.clone(), reply)
            })
            .collect();
        replies.sort_by(|a, b| a.0.cmp(&b.0));
        let replies: Vec<serde_json::Value> = replies.into_iter().map(|(_, v)| v).collect();
        Ok(serde_json::json!({ "replies": replies }))
    }
}

pub struct GreetHandler;

#[async_trait]
impl TaskHandler for GreetHandler {
    fn task_type(&self) -> &str {
        "greet"
    }

    async fn execute(&self, params: &serde_json::Value, _context: &TaskContext) -> TaskOutcome {
        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("there");
        TaskOutcome::success(serde_json::json!({ "greeting": format!("Hello, {name}!") }))
    }
}

pub struct ReplyHandler;

#[async_trait]
impl TaskHandler for ReplyHandler {
    fn task_type(&self) -> &str {
        "reply"
    }

    async fn execute(&self, params: &serde_json::Value, _context: &TaskContext) -> TaskOutcome {
        let greeting = params
            .get("greeting")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        TaskOutcome::success(serde_json::json!({ "reply": format!("{greeting} - got it!") }))
    }
}
