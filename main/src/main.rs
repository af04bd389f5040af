use std::{sync::Arc, time::Duration};

use api_router::{api_routes_v1, api_state::ApiState};
use axum::Router;
use common::{
    storage::db::SurrealDbClient,
    utils::{
        config::get_config,
        rate_limit::{RateLimitTracker, SystemClock},
    },
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use transcription_pipeline::{run_retention_sweeper, run_worker_pool, TranscriptionPipeline};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    // Ensure db is initialized
    db.ensure_initialized().await?;

    // Premium quota accounting, shared between the worker pool and the API.
    let tracker = RateLimitTracker::shared(config.premium_rate_limit_tier, Arc::new(SystemClock));
    info!(
        tier = config.premium_rate_limit_tier.as_str(),
        "Rate limit tracker initialized"
    );

    let pipeline = Arc::new(TranscriptionPipeline::new(
        Arc::clone(&db),
        &config,
        Arc::clone(&tracker),
    )?);

    // Workers and the retention sweeper start exactly once per process.
    info!(
        worker_concurrency = config.worker_concurrency,
        "Starting worker processes"
    );
    tokio::spawn(run_worker_pool(
        Arc::clone(&db),
        Arc::clone(&pipeline),
        config.worker_concurrency,
    ));
    tokio::spawn(run_retention_sweeper(
        Arc::clone(&db),
        Duration::from_secs(config.completed_retention_secs),
        Duration::from_secs(config.failed_retention_secs),
    ));

    let api_state = ApiState::new(Arc::clone(&db), config.clone(), tracker);

    // Create Axum router
    let app = Router::new()
        .nest("/api/v1", api_routes_v1())
        .with_state(api_state);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
    }

    Ok(())
}
