use std::sync::Arc;

use clap::{Parser, Subcommand};
use geoflow_core::canonical::derive_job_id;
use geoflow_core::config::Config;
use geoflow_core::model::{JobMessage, JobRecord};
use geoflow_core::queue::postgres::PgQueueTransport;
use geoflow_core::queue::QueueTransport;
use geoflow_core::registry::JobRegistry;
use geoflow_core::store::postgres::PostgresStateStore;
use geoflow_core::store::{StateStore, TaskFilter};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geoflow", about = "Operator CLI for the geospatial job orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a job by job_type and a JSON parameters blob.
    Submit {
        job_type: String,
        /// Raw JSON object, e.g. '{"message":"hi"}'.
        parameters: String,
    },
    /// Fetch a job's current status and per-stage task counts.
    Status { job_id: String },
    /// Run one Janitor sweep immediately and exit.
    Janitor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(config.database.acquire_timeout_seconds))
        .idle_timeout(std::time::Duration::from_secs(config.database.idle_timeout_seconds))
        .connect(&config.database.connection_string())
        .await?;

    let state_store = PostgresStateStore::new(pool.clone());
    state_store.run_migrations().await?;

    match cli.command {
        Command::Submit { job_type, parameters } => {
            let mut job_registry = JobRegistry::new();
            let mut task_registry = geoflow_core::registry::TaskRegistry::new();
            geoflow_handlers::register_all(&mut job_registry, &mut task_registry)?;

            let spec = job_registry.get(&job_type)?;
            let params: serde_json::Value = serde_json::from_str(&parameters)?;
            let params = spec
                .validate_parameters(params)
                .map_err(|e| anyhow::anyhow!(e))?;

            let job_id = derive_job_id(&job_type, &params);
            let job = JobRecord::new(
                job_id.clone(),
                job_type.clone(),
                params.clone(),
                spec.stages().len() as i32,
                chrono::Utc::now(),
            );
            let outcome = state_store.create_job(job).await?;

            let job_queue = PgQueueTransport::<JobMessage>::new(
                pool.clone(),
                config.queue.jobs_table.clone(),
                config.queue.visibility_timeout,
                config.queue.max_delivery_count,
            );
            job_queue.run_migrations().await?;

            if outcome.created {
                job_queue
                    .enqueue(JobMessage {
                        job_id: job_id.clone(),
                        job_type,
                        stage: 1,
                        parameters: params,
                        correlation_id: job_id.clone(),
                    })
                    .await?;
                println!("submitted job {job_id}");
            } else {
                println!(
                    "job {job_id} already exists (status: {:?}), not resubmitted",
                    outcome.existing_status
                );
            }
        }
        Command::Status { job_id } => {
            let job = state_store.get_job(&job_id).await?;
            println!("job_id:        {}", job.job_id);
            println!("job_type:      {}", job.job_type);
            println!("status:        {:?}", job.status);
            println!("stage:         {} / {}", job.stage, job.total_stages);
            if let Some(error) = &job.error_details {
                println!("error:         {}", error.message);
            }

            for stage in 1..=job.total_stages {
                let tasks = state_store
                    .list_tasks_for_job(
                        &job_id,
                        Some(TaskFilter {
                            stage: Some(stage),
                            status: None,
                        }),
                    )
                    .await?;
                if tasks.is_empty() {
                    continue;
                }
                let completed = tasks.iter().filter(|t| t.status == geoflow_core::model::TaskStatus::Completed).count();
                let failed = tasks.iter().filter(|t| t.status == geoflow_core::model::TaskStatus::Failed).count();
                println!("  stage {stage}: {completed}/{} completed, {failed} failed", tasks.len());
            }
        }
        Command::Janitor => {
            let job_queue: Arc<dyn QueueTransport<JobMessage>> = {
                let queue = PgQueueTransport::<JobMessage>::new(
                    pool.clone(),
                    config.queue.jobs_table.clone(),
                    config.queue.visibility_timeout,
                    config.queue.max_delivery_count,
                );
                queue.run_migrations().await?;
                Arc::new(queue)
            };
            let task_queue: Arc<dyn QueueTransport<geoflow_core::model::TaskMessage>> = {
                let queue = PgQueueTransport::<geoflow_core::model::TaskMessage>::new(
                    pool.clone(),
                    config.queue.tasks_table.clone(),
                    config.queue.visibility_timeout,
                    config.queue.max_delivery_count,
                );
                queue.run_migrations().await?;
                Arc::new(queue)
            };

            let mut job_registry = JobRegistry::new();
            let mut task_registry = geoflow_core::registry::TaskRegistry::new();
            geoflow_handlers::register_all(&mut job_registry, &mut task_registry)?;
            let job_registry = job_registry.freeze();

            let retry_policy = geoflow_core::retry::RetryPolicy {
                max_retries: config.retry.max_attempts,
                base_delay: config.retry.base_delay,
                max_delay: config.retry.max_delay,
            };
            let janitor_config = geoflow_worker::janitor::JanitorConfig {
                lease_grace: chrono::Duration::seconds(config.queue.visibility_timeout.as_secs() as i64 * 2),
                stuck_job_threshold: chrono::Duration::seconds(config.janitor.stuck_job_threshold.as_secs() as i64),
            };

            let state_store: Arc<dyn StateStore> = Arc::new(state_store);
            geoflow_worker::janitor::run_once(&janitor_config, &retry_policy, &state_store, &job_registry, &job_queue, &task_queue)
                .await;
            println!("janitor sweep complete");
        }
    }

    Ok(())
}
