//! Postgres-backed `QueueTransport`, grounded on the claim/lease pattern of
//! a polling job queue: a visibility timeout instead of a broker, claimed
//! with `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent receivers never
//! hand out the same row twice.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{PgPool, Row};
use std::marker::PhantomData;
use std::time::Duration;
use tracing::warn;

use super::{Delivery, QueueError, QueueTransport};

pub struct PgQueueTransport<T> {
    pool: PgPool,
    table: String,
    visibility_timeout: Duration,
    max_delivery_count: i32,
    _marker: PhantomData<T>,
}

impl<T> PgQueueTransport<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(
        pool: PgPool,
        table: impl Into<String>,
        visibility_timeout: Duration,
        max_delivery_count: i32,
    ) -> Self {
        Self {
            pool,
            table: table.into(),
            visibility_timeout,
            max_delivery_count,
            _marker: PhantomData,
        }
    }

    pub async fn run_migrations(&self) -> Result<(), QueueError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id              BIGSERIAL PRIMARY KEY,
                payload         JSONB NOT NULL,
                visible_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
                locked_by       TEXT,
                delivery_count  INT NOT NULL DEFAULT 0,
                dead_lettered   BOOLEAN NOT NULL DEFAULT false,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            "#,
            table = self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;

        let idx = format!(
            "CREATE INDEX IF NOT EXISTS {table}_visible_at_idx ON {table} (visible_at)
             WHERE NOT dead_lettered",
            table = self.table
        );
        sqlx::query(&idx).execute(&self.pool).await?;

        Ok(())
    }

    async fn insert(&self, payload: &T, delay: Duration) -> Result<(), QueueError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| QueueError::Durable(sqlx::Error::Decode(Box::new(e))))?;
        let query = format!(
            "INSERT INTO {table} (payload, visible_at) VALUES ($1, now() + $2::interval)",
            table = self.table
        );
        sqlx::query(&query)
            .bind(payload)
            .bind(format!("{} seconds", delay.as_secs()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<T> QueueTransport<T> for PgQueueTransport<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn enqueue(&self, payload: T) -> Result<(), QueueError> {
        self.insert(&payload, Duration::ZERO).await
    }

    async fn enqueue_delayed(&self, payload: T, delay: Duration) -> Result<(), QueueError> {
        self.insert(&payload, delay).await
    }

    async fn receive(&self, max: i64) -> Result<Vec<Delivery<T>>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT id FROM {table}
             WHERE NOT dead_lettered AND visible_at <= now()
             ORDER BY id ASC
             LIMIT $1
             FOR UPDATE SKIP LOCKED",
            table = self.table
        );
        let ids: Vec<i64> = sqlx::query(&select)
            .bind(max)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.get::<i64, _>("id"))
            .collect();

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(vec![]);
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let token = fastrand::u64(..).to_string();
            let update = format!(
                "UPDATE {table}
                 SET locked_by = $1,
                     visible_at = now() + $2::interval,
                     delivery_count = delivery_count + 1
                 WHERE id = $3
                 RETURNING payload, delivery_count",
                table = self.table
            );
            let row = sqlx::query(&update)
                .bind(&token)
                .bind(format!("{} seconds", self.visibility_timeout.as_secs()))
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;

            let payload_raw: serde_json::Value = row.try_get("payload")?;
            let delivery_count: i32 = row.try_get("delivery_count")?;

            let payload: T = match serde_json::from_value(payload_raw) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(table = %self.table, id, error = %e, "dead-lettering malformed queue payload");
                    let dead_letter = format!(
                        "UPDATE {table} SET dead_lettered = true, locked_by = NULL WHERE id = $1",
                        table = self.table
                    );
                    sqlx::query(&dead_letter).bind(id).execute(&mut *tx).await?;
                    continue;
                }
            };

            out.push(Delivery {
                payload,
                delivery_token: format!("{id}:{token}"),
                delivery_count,
            });
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn ack(&self, delivery_token: &str) -> Result<(), QueueError> {
        let (id, token) = split_token(delivery_token)?;
        let query = format!("DELETE FROM {table} WHERE id = $1 AND locked_by = $2", table = self.table);
        let result = sqlx::query(&query).bind(id).bind(token).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(delivery_token.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, delivery_token: &str) -> Result<(), QueueError> {
        let (id, token) = split_token(delivery_token)?;

        let dead_letter = format!(
            "UPDATE {table} SET dead_lettered = true, locked_by = NULL
             WHERE id = $1 AND locked_by = $2 AND delivery_count >= $3",
            table = self.table
        );
        let result = sqlx::query(&dead_letter)
            .bind(id)
            .bind(token)
            .bind(self.max_delivery_count)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        let requeue = format!(
            "UPDATE {table} SET visible_at = now(), locked_by = NULL
             WHERE id = $1 AND locked_by = $2",
            table = self.table
        );
        let result = sqlx::query(&requeue).bind(id).bind(token).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(delivery_token.to_string()));
        }
        Ok(())
    }

    async fn list_dead_lettered(&self) -> Result<Vec<T>, QueueError> {
        let query = format!("SELECT payload FROM {table} WHERE dead_lettered", table = self.table);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let payload_raw: serde_json::Value = row.try_get("payload")?;
                serde_json::from_value(payload_raw)
                    .map_err(|e| QueueError::Durable(sqlx::Error::Decode(Box::new(e))))
            })
            .collect()
    }
}

fn split_token(delivery_token: &str) -> Result<(i64, &str), QueueError> {
    let (id, token) = delivery_token
        .split_once(':')
        .ok_or_else(|| QueueError::UnknownDelivery(delivery_token.to_string()))?;
    let id: i64 = id
        .parse()
        .map_err(|_| QueueError::UnknownDelivery(delivery_token.to_string()))?;
    Ok((id, token))
}

/// Requires a live Postgres reachable at `DATABASE_URL`; skipped otherwise.
/// Run with `DATABASE_URL=... cargo test -- --ignored`.
#[cfg(test)]
mod postgres_tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestPayload {
        job_id: String,
        n: i32,
    }

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(PgPool::connect(&url).await.expect("connect to DATABASE_URL"))
    }

    #[tokio::test]
    #[ignore]
    #[serial]
    async fn enqueue_then_receive_round_trips_the_payload() {
        let Some(pool) = test_pool().await else { return };
        let queue: PgQueueTransport<TestPayload> =
            PgQueueTransport::new(pool, "geoflow_test_queue_roundtrip", Duration::from_secs(30), 3);
        queue.run_migrations().await.unwrap();

        let payload = TestPayload { job_id: "abc".into(), n: 1 };
        queue.enqueue(payload.clone()).await.unwrap();

        let delivered = queue.receive(10).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, payload);
        queue.ack(&delivered[0].delivery_token).await.unwrap();
    }

    /// Regression test for the malformed-payload livelock: a row whose
    /// `payload` cannot deserialise into `T` must be dead-lettered in place,
    /// not left at the head of the queue to fail every subsequent receive.
    #[tokio::test]
    #[ignore]
    #[serial]
    async fn malformed_payload_is_dead_lettered_instead_of_livelocking() {
        let Some(pool) = test_pool().await else { return };
        let table = "geoflow_test_queue_deadletter";
        let queue: PgQueueTransport<TestPayload> =
            PgQueueTransport::new(pool.clone(), table, Duration::from_secs(30), 3);
        queue.run_migrations().await.unwrap();

        sqlx::query(&format!("INSERT INTO {table} (payload) VALUES ($1)"))
            .bind(serde_json::json!({"not": "a TestPayload"}))
            .execute(&pool)
            .await
            .unwrap();
        let good = TestPayload { job_id: "good".into(), n: 2 };
        queue.enqueue(good.clone()).await.unwrap();

        let first = queue.receive(10).await.unwrap();
        assert_eq!(first.len(), 1, "the malformed row must be skipped, not returned or aborted");
        assert_eq!(first[0].payload, good);

        let second = queue.receive(10).await.unwrap();
        assert!(second.is_empty(), "the malformed row must not reappear on a later receive");
    }
}
