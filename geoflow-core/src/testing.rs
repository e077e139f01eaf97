//! In-memory `StateStore`/`QueueTransport` doubles used by handler and
//! orchestrator tests that want the real trait contracts without a
//! database. Feature-gated so production binaries never link this code.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::model::{ErrorDetails, JobRecord, JobStatus, StageResult, TaskRecord, TaskStatus};
use crate::queue::{Delivery, QueueError, QueueTransport};
use crate::store::{
    job_transition_allowed, task_transition_allowed, AdvanceStageOutcome, CompleteTaskOutcome,
    CreateJobOutcome, JobPatch, StateStore, StoreError, TaskFilter, TaskPatch,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    tasks: HashMap<String, TaskRecord>,
}

/// A `StateStore` backed by a `Mutex<HashMap>`. Enforces the same transition
/// table and the same `(job_id, stage)` last-task accounting as
/// `PostgresStateStore`, just without durability or true concurrency.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_job(&self, job: JobRecord) -> Result<CreateJobOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.jobs.get(&job.job_id) {
            return Ok(CreateJobOutcome {
                created: false,
                existing_status: Some(existing.status),
            });
        }
        inner.jobs.insert(job.job_id.clone(), job);
        Ok(CreateJobOutcome {
            created: true,
            existing_status: None,
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    async fn get_task(&self, task_id: &str) -> Result<TaskRecord, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))
    }

    async fn list_tasks_for_job(
        &self,
        job_id: &str,
        filter: Option<TaskFilter>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let filter = filter.unwrap_or_default();
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|t| t.parent_job_id == job_id)
            .filter(|t| filter.stage.map_or(true, |s| t.stage == s))
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        new_status: JobStatus,
        patch: Option<JobPatch>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if !job_transition_allowed(job.status, new_status) {
            return Err(StoreError::InvalidTransition {
                entity: "job",
                id: job_id.to_string(),
                from: format!("{:?}", job.status),
                to: format!("{:?}", new_status),
            });
        }
        job.status = new_status;
        if let Some(patch) = patch {
            if patch.result_data.is_some() {
                job.result_data = patch.result_data;
            }
            if patch.error_details.is_some() {
                job.error_details = patch.error_details;
            }
        }
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        patch: Option<TaskPatch>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        if !task_transition_allowed(task.status, new_status) {
            return Err(StoreError::InvalidTransition {
                entity: "task",
                id: task_id.to_string(),
                from: format!("{:?}", task.status),
                to: format!("{:?}", new_status),
            });
        }
        task.status = new_status;
        if let Some(patch) = patch {
            if patch.result_data.is_some() {
                task.result_data = patch.result_data;
            }
            if patch.error_details.is_some() {
                task.error_details = patch.error_details;
            }
            if let Some(retry_count) = patch.retry_count {
                task.retry_count = retry_count;
            }
            if patch.heartbeat.is_some() {
                task.heartbeat = patch.heartbeat;
            }
        }
        task.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn create_task_batch(
        &self,
        tasks: Vec<TaskRecord>,
        parent_job_id: &str,
    ) -> Result<(), StoreError> {
        let prefix: String = parent_job_id.chars().take(8).collect();
        for task in &tasks {
            if !task.task_id.starts_with(&prefix) {
                return Err(StoreError::ContractViolation(format!(
                    "task_id {} does not start with parent prefix {prefix}",
                    task.task_id
                )));
            }
        }
        let mut inner = self.inner.lock().unwrap();
        for task in tasks {
            inner.tasks.insert(task.task_id.clone(), task);
        }
        Ok(())
    }

    async fn complete_task_and_check_stage(
        &self,
        task_id: &str,
        job_id: &str,
        stage: i32,
        success: bool,
        result_data: Option<serde_json::Value>,
        error_details: Option<ErrorDetails>,
    ) -> Result<CompleteTaskOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        let task_updated = match inner.tasks.get_mut(task_id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = if success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                task.result_data = result_data;
                task.error_details = error_details;
                task.updated_at = chrono::Utc::now();
                true
            }
            _ => false,
        };

        let remaining_tasks = inner
            .tasks
            .values()
            .filter(|t| t.parent_job_id == job_id && t.stage == stage && !t.status.is_terminal())
            .count() as i64;

        Ok(CompleteTaskOutcome {
            task_updated,
            is_last_task_in_stage: remaining_tasks == 0,
            remaining_tasks,
        })
    }

    async fn advance_job_stage(
        &self,
        job_id: &str,
        current_stage: i32,
        stage_result: StageResult,
    ) -> Result<AdvanceStageOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;

        if job.stage != current_stage || job.status.is_terminal() {
            return Err(StoreError::StaleStage {
                job_id: job_id.to_string(),
                expected_stage: current_stage,
            });
        }

        job.stage_results.insert(stage_result.stage_key.clone(), stage_result);
        job.stage += 1;
        job.updated_at = chrono::Utc::now();

        Ok(AdvanceStageOutcome {
            new_stage: job.stage,
            is_final_stage: job.stage > job.total_stages,
        })
    }

    async fn record_job_completion(
        &self,
        job_id: &str,
        status: JobStatus,
        result_data: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.update_job_status(
            job_id,
            status,
            Some(JobPatch {
                result_data: Some(result_data),
                error_details: None,
            }),
        )
        .await
    }

    async fn record_job_failure(&self, job_id: &str, error: ErrorDetails) -> Result<(), StoreError> {
        self.update_job_status(
            job_id,
            JobStatus::Failed,
            Some(JobPatch {
                result_data: None,
                error_details: Some(error),
            }),
        )
        .await
    }

    async fn list_stale_processing_tasks(
        &self,
        lease_grace: chrono::Duration,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let cutoff = chrono::Utc::now() - lease_grace;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .filter(|t| t.heartbeat.map_or(true, |h| h < cutoff))
            .cloned()
            .collect())
    }

    async fn list_stuck_jobs(&self, stuck_threshold: chrono::Duration) -> Result<Vec<JobRecord>, StoreError> {
        let cutoff = chrono::Utc::now() - stuck_threshold;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.updated_at < cutoff)
            .filter(|j| {
                !inner
                    .tasks
                    .values()
                    .any(|t| t.parent_job_id == j.job_id && !t.status.is_terminal())
            })
            .cloned()
            .collect())
    }

    async fn delete_orphan_tasks(&self) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let job_ids: std::collections::HashSet<String> = inner.jobs.keys().cloned().collect();
        let orphan_ids: Vec<String> = inner
            .tasks
            .values()
            .filter(|t| !job_ids.contains(&t.parent_job_id))
            .map(|t| t.task_id.clone())
            .collect();
        for id in &orphan_ids {
            inner.tasks.remove(id);
        }
        Ok(orphan_ids)
    }
}

/// A `QueueTransport` backed by an in-process `Vec`. Delivery tokens are the
/// element's position-independent id; `nack` pushes the message back to the
/// tail, which is enough to exercise handler and orchestrator logic in
/// tests without a broker.
pub struct InMemoryQueueTransport<T> {
    messages: Mutex<Vec<(String, T, i32)>>,
    next_id: Mutex<u64>,
}

impl<T> Default for InMemoryQueueTransport<T> {
    fn default() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }
}

impl<T> InMemoryQueueTransport<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<T> QueueTransport<T> for InMemoryQueueTransport<T>
where
    T: Clone + Send + Sync,
{
    async fn enqueue(&self, payload: T) -> Result<(), QueueError> {
        let mut id = self.next_id.lock().unwrap();
        let token = id.to_string();
        *id += 1;
        self.messages.lock().unwrap().push((token, payload, 0));
        Ok(())
    }

    async fn enqueue_delayed(&self, payload: T, _delay: Duration) -> Result<(), QueueError> {
        self.enqueue(payload).await
    }

    async fn receive(&self, max: i64) -> Result<Vec<Delivery<T>>, QueueError> {
        let mut messages = self.messages.lock().unwrap();
        let take = (max as usize).min(messages.len());
        let drained: Vec<_> = messages.drain(0..take).collect();
        Ok(drained
            .into_iter()
            .map(|(token, payload, delivery_count)| Delivery {
                payload,
                delivery_token: token,
                delivery_count: delivery_count + 1,
            })
            .collect())
    }

    async fn ack(&self, _delivery_token: &str) -> Result<(), QueueError> {
        Ok(())
    }

    async fn nack(&self, _delivery_token: &str) -> Result<(), QueueError> {
        Ok(())
    }

    async fn list_dead_lettered(&self) -> Result<Vec<T>, QueueError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn last_task_in_stage_is_detected_once() {
        let store = InMemoryStateStore::new();
        let now = Utc::now();
        let job = JobRecord::new("a".repeat(64), "t".into(), serde_json::json!({}), 1, now);
        store.create_job(job).await.unwrap();

        let t1 = TaskRecord::new(&"a".repeat(64), "t".into(), "h".into(), 1, "0".into(), serde_json::json!({}), now);
        let t2 = TaskRecord::new(&"a".repeat(64), "t".into(), "h".into(), 1, "1".into(), serde_json::json!({}), now);
        let ids = (t1.task_id.clone(), t2.task_id.clone());
        store.create_task_batch(vec![t1, t2], &"a".repeat(64)).await.unwrap();

        let first = store
            .complete_task_and_check_stage(&ids.0, &"a".repeat(64), 1, true, None, None)
            .await
            .unwrap();
        assert!(!first.is_last_task_in_stage);

        let second = store
            .complete_task_and_check_stage(&ids.1, &"a".repeat(64), 1, true, None, None)
            .await
            .unwrap();
        assert!(second.is_last_task_in_stage);
    }

    #[tokio::test]
    async fn in_memory_queue_round_trips_a_payload() {
        let queue: InMemoryQueueTransport<String> = InMemoryQueueTransport::new();
        queue.enqueue("hello".to_string()).await.unwrap();
        let delivered = queue.receive(10).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, "hello");
        queue.ack(&delivered[0].delivery_token).await.unwrap();
    }

    /// Scenario F: submitting the same job twice yields one row and one
    /// queue message, mirroring what the Gateway's `submit_job` does around
    /// `create_job`.
    #[tokio::test]
    async fn duplicate_job_submission_creates_only_one_row_and_one_message() {
        let store = InMemoryStateStore::new();
        let queue: InMemoryQueueTransport<String> = InMemoryQueueTransport::new();
        let now = Utc::now();
        let job_id = crate::canonical::derive_job_id("hello_world", &serde_json::json!({"message": "hi"}));

        for _ in 0..2 {
            let job = JobRecord::new(job_id.clone(), "hello_world".into(), serde_json::json!({"message": "hi"}), 1, now);
            let outcome = store.create_job(job).await.unwrap();
            if outcome.created {
                queue.enqueue(job_id.clone()).await.unwrap();
            }
        }

        assert_eq!(store.inner.lock().unwrap().jobs.len(), 1);
        assert_eq!(queue.messages.lock().unwrap().len(), 1);
    }

    /// Invariant 7: for any completion order of a stage's tasks, exactly one
    /// `complete_task_and_check_stage` call observes `is_last_task_in_stage`.
    /// Exhaustive over every permutation of a 4-task stage rather than
    /// randomly sampled, since the space is small enough to cover fully.
    #[tokio::test]
    async fn exactly_one_completer_observes_last_task_in_stage_any_order() {
        for perm in permutations(&[0, 1, 2, 3]) {
            let store = InMemoryStateStore::new();
            let now = Utc::now();
            let job_id = "b".repeat(64);
            store
                .create_job(JobRecord::new(job_id.clone(), "t".into(), serde_json::json!({}), 1, now))
                .await
                .unwrap();

            let tasks: Vec<TaskRecord> = (0..4)
                .map(|i| TaskRecord::new(&job_id, "t".into(), "h".into(), 1, i.to_string(), serde_json::json!({}), now))
                .collect();
            let ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
            store.create_task_batch(tasks, &job_id).await.unwrap();

            let mut last_count = 0;
            for &i in &perm {
                let outcome = store
                    .complete_task_and_check_stage(&ids[i], &job_id, 1, true, None, None)
                    .await
                    .unwrap();
                if outcome.is_last_task_in_stage {
                    last_count += 1;
                }
            }
            assert_eq!(last_count, 1, "order {perm:?} produced {last_count} last-task observations");
        }
    }

    fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for (i, &item) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, item);
                out.push(tail);
            }
        }
        out
    }

    /// Invariant 6: a job recorded as failed always carries `error_details`;
    /// a job recorded as completed always carries `result_data`.
    #[tokio::test]
    async fn terminal_job_records_always_carry_their_payload() {
        let store = InMemoryStateStore::new();
        let now = Utc::now();

        let failed_id = "c".repeat(64);
        store
            .create_job(JobRecord::new(failed_id.clone(), "t".into(), serde_json::json!({}), 1, now))
            .await
            .unwrap();
        store
            .record_job_failure(&failed_id, ErrorDetails::contract_violation("boom"))
            .await
            .unwrap();
        let failed = store.get_job(&failed_id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_details.is_some());
        assert!(failed.result_data.is_none());

        let completed_id = "d".repeat(64);
        store
            .create_job(JobRecord::new(completed_id.clone(), "t".into(), serde_json::json!({}), 1, now))
            .await
            .unwrap();
        store
            .record_job_completion(&completed_id, JobStatus::Completed, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let completed = store.get_job(&completed_id).await.unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(completed.result_data.is_some());
        assert!(completed.error_details.is_none());
    }

    /// A job already terminal must not have its stage mutated by a
    /// late-arriving `advance_job_stage` call (the bug a strict-policy
    /// early job failure combined with a later stage completer could hit).
    #[tokio::test]
    async fn advance_job_stage_refuses_a_terminal_job() {
        let store = InMemoryStateStore::new();
        let now = Utc::now();
        let job_id = "e".repeat(64);
        store
            .create_job(JobRecord::new(job_id.clone(), "t".into(), serde_json::json!({}), 2, now))
            .await
            .unwrap();
        store
            .record_job_failure(&job_id, ErrorDetails::contract_violation("boom"))
            .await
            .unwrap();

        let result = store
            .advance_job_stage(
                &job_id,
                1,
                StageResult::aggregate(1, &[], now),
            )
            .await;
        assert!(matches!(result, Err(StoreError::StaleStage { .. })));

        let job = store.get_job(&job_id).await.unwrap();
        assert_eq!(job.stage, 1);
        assert!(job.stage_results.is_empty());
    }
}
