use std::sync::Arc;
use std::time::Duration;

use geoflow_core::config::Config;
use geoflow_core::model::{JobMessage, TaskMessage};
use geoflow_core::queue::postgres::PgQueueTransport;
use geoflow_core::queue::QueueTransport;
use geoflow_core::registry::{JobRegistry, TaskRegistry};
use geoflow_core::retry::RetryPolicy;
use geoflow_core::store::postgres::PostgresStateStore;
use geoflow_core::store::StateStore;
use geoflow_worker::{executor, janitor, orchestrator};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;

    info!(host = %config.database.host, database = %config.database.database, "connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_seconds))
        .connect(&config.database.connection_string())
        .await?;

    let state_store = PostgresStateStore::new(pool.clone());
    state_store.run_migrations().await?;
    let state_store: Arc<dyn StateStore> = Arc::new(state_store);

    let job_queue = PgQueueTransport::<JobMessage>::new(
        pool.clone(),
        config.queue.jobs_table.clone(),
        config.queue.visibility_timeout,
        config.queue.max_delivery_count,
    );
    job_queue.run_migrations().await?;
    let job_queue: Arc<dyn QueueTransport<JobMessage>> = Arc::new(job_queue);

    let task_queue = PgQueueTransport::<TaskMessage>::new(
        pool.clone(),
        config.queue.tasks_table.clone(),
        config.queue.visibility_timeout,
        config.queue.max_delivery_count,
    );
    task_queue.run_migrations().await?;
    let task_queue: Arc<dyn QueueTransport<TaskMessage>> = Arc::new(task_queue);

    let mut job_registry = JobRegistry::new();
    let mut task_registry = TaskRegistry::new();
    geoflow_handlers::register_all(&mut job_registry, &mut task_registry)?;
    geoflow_core::registry::validate_cross_registry(&job_registry, &task_registry)?;
    let job_registry = job_registry.freeze();
    let task_registry = task_registry.freeze();

    let retry_policy = RetryPolicy {
        max_retries: config.retry.max_attempts,
        base_delay: config.retry.base_delay,
        max_delay: config.retry.max_delay,
    };

    let orchestrator_loop = {
        let state_store = state_store.clone();
        let job_registry = job_registry.clone();
        let job_queue = job_queue.clone();
        let task_queue = task_queue.clone();
        tokio::spawn(async move {
            loop {
                match job_queue.receive(10).await {
                    Ok(deliveries) if deliveries.is_empty() => {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    Ok(deliveries) => {
                        for delivery in deliveries {
                            let result = orchestrator::handle_job_message(
                                delivery.payload,
                                &state_store,
                                &job_registry,
                                &task_queue,
                            )
                            .await;
                            match result {
                                Ok(()) => {
                                    if let Err(e) = job_queue.ack(&delivery.delivery_token).await {
                                        error!(error = %e, "failed to ack job message");
                                    }
                                }
                                Err(e) => {
                                    error!(error = %e, "job orchestrator failed, nacking message");
                                    if let Err(e) = job_queue.nack(&delivery.delivery_token).await {
                                        error!(error = %e, "failed to nack job message");
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "failed to receive job messages");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    };

    let executor_loop = {
        let state_store = state_store.clone();
        let job_registry = job_registry.clone();
        let task_registry = task_registry.clone();
        let job_queue = job_queue.clone();
        let task_queue = task_queue.clone();
        let retry_policy = retry_policy;
        tokio::spawn(async move {
            loop {
                match task_queue.receive(10).await {
                    Ok(deliveries) if deliveries.is_empty() => {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    Ok(deliveries) => {
                        for delivery in deliveries {
                            let result = executor::handle_task_message(
                                delivery.payload,
                                &state_store,
                                &job_registry,
                                &task_registry,
                                &job_queue,
                                &task_queue,
                                &retry_policy,
                            )
                            .await;
                            match result {
                                Ok(()) => {
                                    if let Err(e) = task_queue.ack(&delivery.delivery_token).await {
                                        error!(error = %e, "failed to ack task message");
                                    }
                                }
                                Err(e) => {
                                    error!(error = %e, "task executor failed, nacking message");
                                    if let Err(e) = task_queue.nack(&delivery.delivery_token).await {
                                        error!(error = %e, "failed to nack task message");
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "failed to receive task messages");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    };

    let janitor_loop = {
        let state_store = state_store.clone();
        let job_registry = job_registry.clone();
        let job_queue = job_queue.clone();
        let task_queue = task_queue.clone();
        let janitor_config = janitor::JanitorConfig {
            lease_grace: chrono::Duration::seconds(config.queue.visibility_timeout.as_secs() as i64 * 2),
            stuck_job_threshold: chrono::Duration::seconds(config.janitor.stuck_job_threshold.as_secs() as i64),
        };
        let interval = config.janitor.interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                info!("running janitor sweep");
                janitor::run_once(&janitor_config, &retry_policy, &state_store, &job_registry, &job_queue, &task_queue)
                    .await;
            }
        })
    };

    tokio::select! {
        result = orchestrator_loop => error!(?result, "orchestrator loop exited"),
        result = executor_loop => error!(?result, "executor loop exited"),
        result = janitor_loop => error!(?result, "janitor loop exited"),
    }

    Ok(())
}
