use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use geoflow_core::config::Config;
use geoflow_core::model::JobMessage;
use geoflow_core::queue::postgres::PgQueueTransport;
use geoflow_core::queue::QueueTransport;
use geoflow_core::registry::JobRegistry;
use geoflow_core::store::postgres::PostgresStateStore;
use geoflow_core::store::StateStore;

mod routes;

pub struct AppState {
    pub job_registry: Arc<JobRegistry>,
    pub state_store: Arc<dyn StateStore>,
    pub job_queue: Arc<dyn QueueTransport<JobMessage>>,
}

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
        .acquire_timeout(std::time::Duration::from_secs(config.database.acquire_timeout_seconds))
        .idle_timeout(std::time::Duration::from_secs(config.database.idle_timeout_seconds))
        .connect(&config.database.connection_string())
        .await?;

    let state_store = PostgresStateStore::new(pool.clone());
    state_store.run_migrations().await?;

    let job_queue = PgQueueTransport::<JobMessage>::new(
        pool.clone(),
        config.queue.jobs_table.clone(),
        config.queue.visibility_timeout,
        config.queue.max_delivery_count,
    );
    job_queue.run_migrations().await?;

    let mut job_registry = JobRegistry::new();
    let mut task_registry = geoflow_core::registry::TaskRegistry::new();
    geoflow_handlers::register_all(&mut job_registry, &mut task_registry)?;
    geoflow_core::registry::validate_cross_registry(&job_registry, &task_registry)?;

    let app_state = Arc::new(AppState {
        job_registry: job_registry.freeze(),
        state_store: Arc::new(state_store),
        job_queue: Arc::new(job_queue),
    });

    let app = Router::new()
        .route("/jobs/:job_type", post(routes::submit_job))
        .route("/jobs/:job_type", get(routes::get_job))
        .route("/healthz", get(routes::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    info!(addr = %config.http_addr, "starting submission gateway");
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
