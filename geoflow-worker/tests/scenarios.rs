//! End-to-end seed scenarios run against the in-memory state store and
//! queue doubles: one full pass of orchestrator -> executor per message,
//! looped until both queues drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use geoflow_core::canonical::derive_job_id;
use geoflow_core::model::{ErrorCategory, JobMessage, JobRecord, JobStatus, StageResult, TaskMessage, TaskOutcome, TaskStatus};
use geoflow_core::queue::QueueTransport;
use geoflow_core::registry::{
    JobRegistry, Parallelism, StageDescriptor, TaskContext, TaskDefinition, TaskHandler, TaskRegistry,
    WorkflowError, WorkflowSpec,
};
use geoflow_core::retry::RetryPolicy;
use geoflow_core::store::StateStore;
use geoflow_core::testing::{InMemoryQueueTransport, InMemoryStateStore};
use geoflow_worker::{executor, orchestrator};

/// Drive the orchestrator/executor message loops to quiescence. Bounded so a
/// logic bug that never drains shows up as a test failure, not a hang.
async fn drain(
    state_store: &Arc<dyn StateStore>,
    job_registry: &Arc<JobRegistry>,
    task_registry: &Arc<TaskRegistry>,
    job_queue: &Arc<dyn QueueTransport<JobMessage>>,
    task_queue: &Arc<dyn QueueTransport<TaskMessage>>,
    retry_policy: &RetryPolicy,
) {
    for _ in 0..50 {
        let job_deliveries = job_queue.receive(100).await.unwrap();
        let task_deliveries = task_queue.receive(100).await.unwrap();
        if job_deliveries.is_empty() && task_deliveries.is_empty() {
            return;
        }
        for delivery in job_deliveries {
            orchestrator::handle_job_message(delivery.payload, state_store, job_registry, task_queue)
                .await
                .unwrap();
        }
        for delivery in task_deliveries {
            executor::handle_task_message(
                delivery.payload,
                state_store,
                job_registry,
                task_registry,
                job_queue,
                task_queue,
                retry_policy,
            )
            .await
            .unwrap();
        }
    }
    panic!("scenario did not drain within the iteration budget");
}

struct Harness {
    state_store: Arc<dyn StateStore>,
    job_registry: Arc<JobRegistry>,
    task_registry: Arc<TaskRegistry>,
    job_queue: Arc<dyn QueueTransport<JobMessage>>,
    task_queue: Arc<dyn QueueTransport<TaskMessage>>,
    retry_policy: RetryPolicy,
}

impl Harness {
    fn new(mut job_registry: JobRegistry, mut task_registry: TaskRegistry) -> Self {
        geoflow_handlers::register_all(&mut job_registry, &mut task_registry).unwrap();
        Self {
            state_store: Arc::new(InMemoryStateStore::new()),
            job_registry: job_registry.freeze(),
            task_registry: task_registry.freeze(),
            job_queue: Arc::new(InMemoryQueueTransport::new()),
            task_queue: Arc::new(InMemoryQueueTransport::new()),
            retry_policy: RetryPolicy::default(),
        }
    }

    async fn submit(&self, job_type: &str, parameters: serde_json::Value) -> String {
        let spec = self.job_registry.get(job_type).unwrap();
        let parameters = spec.validate_parameters(parameters).unwrap();
        let job_id = derive_job_id(job_type, &parameters);
        let job = JobRecord::new(job_id.clone(), job_type.to_string(), parameters.clone(), spec.stages().len() as i32, chrono::Utc::now());
        let outcome = self.state_store.create_job(job).await.unwrap();
        if outcome.created {
            self.job_queue
                .enqueue(JobMessage {
                    job_id: job_id.clone(),
                    job_type: job_type.to_string(),
                    stage: 1,
                    parameters,
                    correlation_id: job_id.clone(),
                })
                .await
                .unwrap();
        }
        job_id
    }

    async fn run_to_completion(&self) {
        drain(
            &self.state_store,
            &self.job_registry,
            &self.task_registry,
            &self.job_queue,
            &self.task_queue,
            &self.retry_policy,
        )
        .await;
    }
}

/// Scenario B: fan-out then sequential (greet-i -> reply-i).
#[tokio::test]
async fn scenario_b_fan_out_then_sequential() {
    let harness = Harness::new(JobRegistry::new(), TaskRegistry::new());
    let job_id = harness
        .submit("greet_reply", serde_json::json!({"names": ["Ann", "Bo", "Cy"]}))
        .await;
    harness.run_to_completion().await;

    let job = harness.state_store.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let replies = job.result_data.unwrap();
    assert_eq!(replies["replies"].as_array().unwrap().len(), 3);

    let tasks = harness.state_store.list_tasks_for_job(&job_id, None).await.unwrap();
    assert_eq!(tasks.len(), 6);
    let prefix: String = job_id.chars().take(8).collect();
    assert!(tasks.iter().any(|t| t.task_id == format!("{prefix}-s1-greet-0")));
    assert!(tasks.iter().any(|t| t.task_id == format!("{prefix}-s2-reply-2")));
}

struct PartialFailureSpec;

#[async_trait]
impl WorkflowSpec for PartialFailureSpec {
    fn job_type(&self) -> &str {
        "partial_failure"
    }
    fn stages(&self) -> &[StageDescriptor] {
        static STAGES: std::sync::OnceLock<Vec<StageDescriptor>> = std::sync::OnceLock::new();
        STAGES.get_or_init(|| {
            vec![StageDescriptor {
                number: 1,
                task_type: "maybe_fail".to_string(),
                parallelism: Parallelism::FanOut,
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
        Ok((0..3)
            .map(|i| TaskDefinition {
                task_index: i.to_string(),
                parameters: serde_json::json!({ "should_fail": i == 1 }),
            })
            .collect())
    }
    async fn finalize_job(
        &self,
        _job_params: &serde_json::Value,
        _all_stage_results: &std::collections::HashMap<String, StageResult>,
    ) -> Result<serde_json::Value, WorkflowError> {
        Ok(serde_json::json!({}))
    }
}

struct MaybeFailHandler;

#[async_trait]
impl TaskHandler for MaybeFailHandler {
    fn task_type(&self) -> &str {
        "maybe_fail"
    }
    async fn execute(&self, params: &serde_json::Value, _context: &TaskContext) -> TaskOutcome {
        if params.get("should_fail").and_then(|v| v.as_bool()).unwrap_or(false) {
            TaskOutcome::failure(ErrorCategory::Business, "permanent business failure")
        } else {
            TaskOutcome::success(serde_json::json!({}))
        }
    }
}

/// Scenario C: a non-strict job with one permanently-failing task in its
/// only stage ends COMPLETED_WITH_ERRORS with an accurate success count.
#[tokio::test]
async fn scenario_c_partial_failure_completes_with_errors() {
    let mut job_registry = JobRegistry::new();
    let mut task_registry = TaskRegistry::new();
    job_registry.register(Arc::new(PartialFailureSpec)).unwrap();
    task_registry.register(Arc::new(MaybeFailHandler)).unwrap();

    let harness = Harness::new(job_registry, task_registry);
    let job_id = harness.submit("partial_failure", serde_json::json!({})).await;
    harness.run_to_completion().await;

    let job = harness.state_store.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::CompletedWithErrors);
    let stage1 = &job.stage_results["1"];
    assert_eq!(stage1.successful_tasks, 2);
    assert_eq!(stage1.failed_tasks, 1);
}

struct FlakySpec;

#[async_trait]
impl WorkflowSpec for FlakySpec {
    fn job_type(&self) -> &str {
        "flaky"
    }
    fn stages(&self) -> &[StageDescriptor] {
        static STAGES: std::sync::OnceLock<Vec<StageDescriptor>> = std::sync::OnceLock::new();
        STAGES.get_or_init(|| {
            vec![StageDescriptor {
                number: 1,
                task_type: "flaky".to_string(),
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
        job_params: &serde_json::Value,
        _job_id: &str,
        _previous_stage_result: Option<&StageResult>,
    ) -> Result<Vec<TaskDefinition>, WorkflowError> {
        Ok(vec![TaskDefinition {
            task_index: "0".to_string(),
            parameters: job_params.clone(),
        }])
    }
    async fn finalize_job(
        &self,
        _job_params: &serde_json::Value,
        _all_stage_results: &std::collections::HashMap<String, StageResult>,
    ) -> Result<serde_json::Value, WorkflowError> {
        Ok(serde_json::json!({"finalized": true}))
    }
    fn strict_failure_policy(&self) -> bool {
        true
    }
}

/// Fails transiently on its first two invocations, then succeeds. Shared
/// across retries of the same task via interior state, the way a real
/// handler's flakiness would come from an unreliable downstream call rather
/// than from anything the engine tracks.
struct FlakyHandler {
    attempts: AtomicUsize,
    fail_until: usize,
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    fn task_type(&self) -> &str {
        "flaky"
    }
    async fn execute(&self, _params: &serde_json::Value, _context: &TaskContext) -> TaskOutcome {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_until {
            TaskOutcome::failure(ErrorCategory::Transient, "transient failure")
        } else {
            TaskOutcome::success(serde_json::json!({ "attempt": attempt }))
        }
    }
}

/// Scenario D: transient failures on attempts 0 and 1, success on attempt 2.
#[tokio::test]
async fn scenario_d_transient_then_success_retry() {
    let mut job_registry = JobRegistry::new();
    let mut task_registry = TaskRegistry::new();
    job_registry.register(Arc::new(FlakySpec)).unwrap();
    task_registry
        .register(Arc::new(FlakyHandler {
            attempts: AtomicUsize::new(0),
            fail_until: 2,
        }))
        .unwrap();

    let harness = Harness::new(job_registry, task_registry);
    let job_id = harness.submit("flaky", serde_json::json!({"seed": "d"})).await;
    harness.run_to_completion().await;

    let job = harness.state_store.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let tasks = harness.state_store.list_tasks_for_job(&job_id, None).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].retry_count, 2);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
}

/// Scenario E: a handler that never succeeds exhausts its retries; under a
/// strict-failure-policy job that fails the job immediately rather than
/// waiting for the rest of the (single-task) stage.
#[tokio::test]
async fn scenario_e_retry_exhaustion_fails_job_under_strict_policy() {
    let mut job_registry = JobRegistry::new();
    let mut task_registry = TaskRegistry::new();
    job_registry.register(Arc::new(FlakySpec)).unwrap();
    task_registry
        .register(Arc::new(FlakyHandler {
            attempts: AtomicUsize::new(0),
            fail_until: usize::MAX,
        }))
        .unwrap();

    let harness = Harness::new(job_registry, task_registry);
    let job_id = harness.submit("flaky", serde_json::json!({"seed": "e"})).await;
    harness.run_to_completion().await;

    let job = harness.state_store.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_details.is_some());

    let tasks = harness.state_store.list_tasks_for_job(&job_id, None).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].retry_count, harness.retry_policy.max_retries);
}

struct StrictPartialFailureSpec;

#[async_trait]
impl WorkflowSpec for StrictPartialFailureSpec {
    fn job_type(&self) -> &str {
        "strict_partial_failure"
    }
    fn stages(&self) -> &[StageDescriptor] {
        static STAGES: std::sync::OnceLock<Vec<StageDescriptor>> = std::sync::OnceLock::new();
        STAGES.get_or_init(|| {
            vec![StageDescriptor {
                number: 1,
                task_type: "strict_maybe_fail".to_string(),
                parallelism: Parallelism::FanOut,
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
        Ok((0..3)
            .map(|i| TaskDefinition {
                task_index: i.to_string(),
                parameters: serde_json::json!({ "should_fail": i == 1 }),
            })
            .collect())
    }
    async fn finalize_job(
        &self,
        _job_params: &serde_json::Value,
        _all_stage_results: &std::collections::HashMap<String, StageResult>,
    ) -> Result<serde_json::Value, WorkflowError> {
        Ok(serde_json::json!({}))
    }
    fn strict_failure_policy(&self) -> bool {
        true
    }
}

struct StrictMaybeFailHandler;

#[async_trait]
impl TaskHandler for StrictMaybeFailHandler {
    fn task_type(&self) -> &str {
        "strict_maybe_fail"
    }
    async fn execute(&self, params: &serde_json::Value, _context: &TaskContext) -> TaskOutcome {
        if params.get("should_fail").and_then(|v| v.as_bool()).unwrap_or(false) {
            TaskOutcome::failure(ErrorCategory::Business, "permanent business failure")
        } else {
            TaskOutcome::success(serde_json::json!({}))
        }
    }
}

/// Regression test: a strict-policy job with three tasks in its only stage
/// where the *middle* task (processed before the last one) fails
/// permanently. The executor's strict branch records the job failure and
/// returns early on that task, but the third (last-processed) task still
/// completes and reaches `advance_stage_if_complete` — which must refuse to
/// mutate a job already FAILED instead of advancing its stage or erroring.
#[tokio::test]
async fn strict_policy_middle_task_failure_does_not_corrupt_a_later_completer() {
    let mut job_registry = JobRegistry::new();
    let mut task_registry = TaskRegistry::new();
    job_registry.register(Arc::new(StrictPartialFailureSpec)).unwrap();
    task_registry.register(Arc::new(StrictMaybeFailHandler)).unwrap();

    let harness = Harness::new(job_registry, task_registry);
    let job_id = harness.submit("strict_partial_failure", serde_json::json!({})).await;
    harness.run_to_completion().await;

    let job = harness.state_store.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_details.is_some());
    assert_eq!(job.stage, 1, "a terminal job's stage must not advance");
    assert!(job.stage_results.is_empty());

    let tasks = harness.state_store.list_tasks_for_job(&job_id, None).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert_eq!(
        tasks.iter().filter(|t| t.status == TaskStatus::Completed).count(),
        2
    );
    assert_eq!(tasks.iter().filter(|t| t.status == TaskStatus::Failed).count(), 1);
}
