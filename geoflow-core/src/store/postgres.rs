//! Canonical `StateStore` backend (spec.md section 6): Postgres tables for
//! `jobs` and `tasks`, an advisory-lock-guarded routine for
//! `complete_task_and_check_stage`, and a conditional `UPDATE ... WHERE
//! stage = $cur` for `advance_job_stage`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

use crate::model::{
    ErrorDetails, JobRecord, JobStatus, StageResult, TaskRecord, TaskStatus,
};

use super::{
    job_transition_allowed, task_transition_allowed, AdvanceStageOutcome, CompleteTaskOutcome,
    CreateJobOutcome, JobPatch, StateStore, StoreError, TaskFilter, TaskPatch,
};

pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent schema bootstrap for the reference backend. Production
    /// deployments would run this as a migration instead; kept inline here
    /// because schema-DDL generation is out of this subsystem's scope
    /// (spec.md section 1) beyond what is needed to run the store.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DO $$ BEGIN
                CREATE TYPE job_status AS ENUM
                    ('queued', 'processing', 'completed', 'failed', 'completed_with_errors');
            EXCEPTION WHEN duplicate_object THEN null;
            END $$;
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            DO $$ BEGIN
                CREATE TYPE task_status AS ENUM
                    ('queued', 'processing', 'completed', 'failed', 'retrying');
            EXCEPTION WHEN duplicate_object THEN null;
            END $$;
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id          TEXT PRIMARY KEY,
                job_type        TEXT NOT NULL,
                parameters      JSONB NOT NULL,
                status          job_status NOT NULL,
                stage           INT NOT NULL,
                total_stages    INT NOT NULL,
                stage_results   JSONB NOT NULL DEFAULT '{}'::jsonb,
                metadata        JSONB NOT NULL DEFAULT '{}'::jsonb,
                result_data     JSONB,
                error_details   JSONB,
                created_at      TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id         TEXT PRIMARY KEY,
                parent_job_id   TEXT NOT NULL,
                job_type        TEXT NOT NULL,
                task_type       TEXT NOT NULL,
                stage           INT NOT NULL,
                task_index      TEXT NOT NULL,
                parameters      JSONB NOT NULL,
                status          task_status NOT NULL,
                result_data     JSONB,
                error_details   JSONB,
                retry_count     INT NOT NULL DEFAULT 0,
                heartbeat       TIMESTAMPTZ,
                created_at      TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS tasks_parent_job_id_idx ON tasks(parent_job_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS tasks_stage_status_idx ON tasks(parent_job_id, stage, status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<JobRecord, StoreError> {
        let stage_results_raw: serde_json::Value = row.try_get("stage_results")?;
        let stage_results: HashMap<String, StageResult> =
            serde_json::from_value(stage_results_raw).map_err(|e| {
                StoreError::ContractViolation(format!("corrupt stage_results: {e}"))
            })?;
        let error_details_raw: Option<serde_json::Value> = row.try_get("error_details")?;
        let error_details = error_details_raw
            .map(serde_json::from_value::<ErrorDetails>)
            .transpose()
            .map_err(|e| StoreError::ContractViolation(format!("corrupt error_details: {e}")))?;

        Ok(JobRecord {
            job_id: row.try_get("job_id")?,
            job_type: row.try_get("job_type")?,
            parameters: row.try_get("parameters")?,
            status: row.try_get("status")?,
            stage: row.try_get("stage")?,
            total_stages: row.try_get("total_stages")?,
            stage_results,
            metadata: row.try_get("metadata")?,
            result_data: row.try_get("result_data")?,
            error_details,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<TaskRecord, StoreError> {
        let error_details_raw: Option<serde_json::Value> = row.try_get("error_details")?;
        let error_details = error_details_raw
            .map(serde_json::from_value::<ErrorDetails>)
            .transpose()
            .map_err(|e| StoreError::ContractViolation(format!("corrupt error_details: {e}")))?;

        Ok(TaskRecord {
            task_id: row.try_get("task_id")?,
            parent_job_id: row.try_get("parent_job_id")?,
            job_type: row.try_get("job_type")?,
            task_type: row.try_get("task_type")?,
            stage: row.try_get("stage")?,
            task_index: row.try_get("task_index")?,
            parameters: row.try_get("parameters")?,
            status: row.try_get("status")?,
            result_data: row.try_get("result_data")?,
            error_details,
            retry_count: row.try_get("retry_count")?,
            heartbeat: row.try_get("heartbeat")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn create_job(&self, job: JobRecord) -> Result<CreateJobOutcome, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs
                (job_id, job_type, parameters, status, stage, total_stages,
                 stage_results, metadata, result_data, error_details, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (job_id) DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.job_type)
        .bind(&job.parameters)
        .bind(job.status)
        .bind(job.stage)
        .bind(job.total_stages)
        .bind(serde_json::to_value(&job.stage_results).unwrap_or_default())
        .bind(&job.metadata)
        .bind(&job.result_data)
        .bind(job.error_details.as_ref().map(|e| serde_json::to_value(e).unwrap()))
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(CreateJobOutcome {
                created: true,
                existing_status: None,
            });
        }

        let existing = self.get_job(&job.job_id).await?;
        Ok(CreateJobOutcome {
            created: false,
            existing_status: Some(existing.status),
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        Self::row_to_job(&row)
    }

    async fn get_task(&self, task_id: &str) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        Self::row_to_task(&row)
    }

    async fn list_tasks_for_job(
        &self,
        job_id: &str,
        filter: Option<TaskFilter>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let filter = filter.unwrap_or_default();
        let mut query = String::from("SELECT * FROM tasks WHERE parent_job_id = $1");
        let mut bind_index = 2;
        if filter.stage.is_some() {
            query.push_str(&format!(" AND stage = ${bind_index}"));
            bind_index += 1;
        }
        if filter.status.is_some() {
            query.push_str(&format!(" AND status = ${bind_index}"));
        }
        query.push_str(" ORDER BY created_at ASC");

        let mut q = sqlx::query(&query).bind(job_id);
        if let Some(stage) = filter.stage {
            q = q.bind(stage);
        }
        if let Some(status) = filter.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        new_status: JobStatus,
        patch: Option<JobPatch>,
    ) -> Result<(), StoreError> {
        let current = self.get_job(job_id).await?;
        if !job_transition_allowed(current.status, new_status) {
            return Err(StoreError::InvalidTransition {
                entity: "job",
                id: job_id.to_string(),
                from: format!("{:?}", current.status),
                to: format!("{:?}", new_status),
            });
        }
        let patch = patch.unwrap_or_default();
        sqlx::query(
            "UPDATE jobs SET status = $1, result_data = COALESCE($2, result_data),
             error_details = COALESCE($3, error_details), updated_at = $4 WHERE job_id = $5",
        )
        .bind(new_status)
        .bind(&patch.result_data)
        .bind(patch.error_details.as_ref().map(|e| serde_json::to_value(e).unwrap()))
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        patch: Option<TaskPatch>,
    ) -> Result<(), StoreError> {
        let current = self.get_task(task_id).await?;
        if !task_transition_allowed(current.status, new_status) {
            return Err(StoreError::InvalidTransition {
                entity: "task",
                id: task_id.to_string(),
                from: format!("{:?}", current.status),
                to: format!("{:?}", new_status),
            });
        }
        let patch = patch.unwrap_or_default();
        sqlx::query(
            "UPDATE tasks SET status = $1, result_data = COALESCE($2, result_data),
             error_details = COALESCE($3, error_details),
             retry_count = COALESCE($4, retry_count),
             heartbeat = COALESCE($5, heartbeat),
             updated_at = $6 WHERE task_id = $7",
        )
        .bind(new_status)
        .bind(&patch.result_data)
        .bind(patch.error_details.as_ref().map(|e| serde_json::to_value(e).unwrap()))
        .bind(patch.retry_count)
        .bind(patch.heartbeat)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
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

        let mut tx = self.pool.begin().await?;
        for task in &tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks
                    (task_id, parent_job_id, job_type, task_type, stage, task_index,
                     parameters, status, result_data, error_details, retry_count,
                     heartbeat, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(&task.task_id)
            .bind(parent_job_id)
            .bind(&task.job_type)
            .bind(&task.task_type)
            .bind(task.stage)
            .bind(&task.task_index)
            .bind(&task.parameters)
            .bind(task.status)
            .bind(&task.result_data)
            .bind(task.error_details.as_ref().map(|e| serde_json::to_value(e).unwrap()))
            .bind(task.retry_count)
            .bind(task.heartbeat)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;

        // Serialise concurrent completers for this (job_id, stage) pair.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{job_id}:{stage}"))
            .execute(&mut *tx)
            .await?;

        let new_status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        let updated = sqlx::query(
            r#"
            UPDATE tasks SET status = $1, result_data = $2, error_details = $3, updated_at = $4
            WHERE task_id = $5 AND status IN ('queued', 'processing')
            RETURNING task_id
            "#,
        )
        .bind(new_status)
        .bind(&result_data)
        .bind(error_details.as_ref().map(|e| serde_json::to_value(e).unwrap()))
        .bind(Utc::now())
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;

        let remaining_tasks: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE parent_job_id = $1 AND stage = $2
             AND status NOT IN ('completed', 'failed')",
        )
        .bind(job_id)
        .bind(stage)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CompleteTaskOutcome {
            task_updated: updated.is_some(),
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
        let stage_key = stage_result.stage_key.clone();
        let stage_result_json = serde_json::to_value(&stage_result)
            .map_err(|e| StoreError::ContractViolation(format!("unserialisable stage result: {e}")))?;

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET stage = stage + 1,
                stage_results = stage_results || jsonb_build_object($1::text, $2::jsonb),
                updated_at = $3
            WHERE job_id = $4 AND stage = $5
              AND status NOT IN ('failed', 'completed', 'completed_with_errors')
            RETURNING stage, total_stages
            "#,
        )
        .bind(&stage_key)
        .bind(&stage_result_json)
        .bind(Utc::now())
        .bind(job_id)
        .bind(current_stage)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| StoreError::StaleStage {
            job_id: job_id.to_string(),
            expected_stage: current_stage,
        })?;

        let new_stage: i32 = row.try_get("stage")?;
        let total_stages: i32 = row.try_get("total_stages")?;

        Ok(AdvanceStageOutcome {
            new_stage,
            is_final_stage: new_stage > total_stages,
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
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status = 'processing'
             AND (heartbeat IS NULL OR heartbeat < $1)",
        )
        .bind(Utc::now() - lease_grace)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn list_stuck_jobs(&self, stuck_threshold: chrono::Duration) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT j.* FROM jobs j
            WHERE j.status = 'processing'
              AND j.updated_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM tasks t
                  WHERE t.parent_job_id = j.job_id
                    AND t.status IN ('queued', 'processing')
              )
            "#,
        )
        .bind(Utc::now() - stuck_threshold)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn delete_orphan_tasks(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE NOT EXISTS (SELECT 1 FROM jobs WHERE jobs.job_id = tasks.parent_job_id)
            RETURNING task_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| r.try_get::<String, _>("task_id").map_err(StoreError::from)).collect()
    }
}

/// Requires a live Postgres reachable at `DATABASE_URL`; skipped otherwise.
/// Run with `DATABASE_URL=... cargo test -- --ignored`.
#[cfg(test)]
mod postgres_tests {
    use super::*;
    use serial_test::serial;

    async fn test_store() -> Option<PostgresStateStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.expect("connect to DATABASE_URL");
        let store = PostgresStateStore::new(pool);
        store.run_migrations().await.unwrap();
        Some(store)
    }

    #[tokio::test]
    #[ignore]
    #[serial]
    async fn create_job_is_idempotent_on_repeated_job_id() {
        let Some(store) = test_store().await else { return };
        let now = Utc::now();
        let job_id = format!("pgtest-{}", fastrand::u64(..));
        let job = JobRecord::new(job_id.clone(), "t".into(), serde_json::json!({}), 1, now);

        let first = store.create_job(job.clone()).await.unwrap();
        assert!(first.created);
        let second = store.create_job(job).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.existing_status, Some(JobStatus::Queued));
    }

    /// Regression test for the terminal-job mutation bug: a job already
    /// FAILED must not have its stage advanced by a late completer.
    #[tokio::test]
    #[ignore]
    #[serial]
    async fn advance_job_stage_refuses_a_terminal_job() {
        let Some(store) = test_store().await else { return };
        let now = Utc::now();
        let job_id = format!("pgtest-{}", fastrand::u64(..));
        let job = JobRecord::new(job_id.clone(), "t".into(), serde_json::json!({}), 2, now);
        store.create_job(job).await.unwrap();
        store.update_job_status(&job_id, JobStatus::Processing, None).await.unwrap();
        store
            .record_job_failure(&job_id, ErrorDetails::contract_violation("boom"))
            .await
            .unwrap();

        let result = store
            .advance_job_stage(&job_id, 1, StageResult::aggregate(1, &[], now))
            .await;
        assert!(matches!(result, Err(StoreError::StaleStage { .. })));

        let reloaded = store.get_job(&job_id).await.unwrap();
        assert_eq!(reloaded.stage, 1);
        assert!(reloaded.stage_results.is_empty());
    }
}
