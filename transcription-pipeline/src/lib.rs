#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod pipeline;
pub mod utils;

use chrono::Utc;
use common::storage::{
    db::SurrealDbClient,
    types::transcription_job::{TranscriptionJob, DEFAULT_LEASE_SECS},
};
pub use pipeline::{PipelineConfig, PipelineTuning, TranscriptionPipeline};
use std::sync::Arc;
use tokio::{
    task::JoinSet,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Single claim loop: pull the next ready job, run it end to end, repeat.
/// Never returns; failures are logged and the loop backs off.
pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    pipeline: Arc<TranscriptionPipeline>,
    slot: usize,
) {
    let worker_id = format!("transcription-worker-{slot}-{}", Uuid::new_v4());
    let lease_duration = Duration::from_secs(DEFAULT_LEASE_SECS as u64);
    let idle_backoff = Duration::from_millis(500);

    loop {
        match TranscriptionJob::claim_next_ready(&db, &worker_id, Utc::now(), lease_duration).await
        {
            Ok(Some(job)) => {
                let job_id = job.id.clone();
                info!(
                    %worker_id,
                    %job_id,
                    attempt = job.attempts,
                    "claimed transcription job"
                );
                if let Err(err) = pipeline.process_job(job).await {
                    error!(%worker_id, %job_id, error = %err, "transcription job failed");
                }
            }
            Ok(None) => {
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim transcription job");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Starts the bounded worker pool. Called exactly once by the process entry
/// point; at most `concurrency` jobs are ever active simultaneously.
pub async fn run_worker_pool(
    db: Arc<SurrealDbClient>,
    pipeline: Arc<TranscriptionPipeline>,
    concurrency: usize,
) {
    let slots = concurrency.max(1);
    info!(worker_slots = slots, "starting transcription worker pool");

    let mut workers = JoinSet::new();
    for slot in 0..slots {
        let db = Arc::clone(&db);
        let pipeline = Arc::clone(&pipeline);
        workers.spawn(async move { run_worker_loop(db, pipeline, slot).await });
    }

    while let Some(result) = workers.join_next().await {
        if let Err(err) = result {
            error!(error = %err, "worker task terminated unexpectedly");
        }
    }
}

/// Periodically evicts terminal jobs past their retention windows.
pub async fn run_retention_sweeper(
    db: Arc<SurrealDbClient>,
    completed_retention: Duration,
    failed_retention: Duration,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));

    loop {
        ticker.tick().await;
        match TranscriptionJob::prune_finished(
            &db,
            Utc::now(),
            completed_retention,
            failed_retention,
        )
        .await
        {
            Ok(0) => {}
            Ok(evicted) => info!(evicted, "pruned finished transcription jobs"),
            Err(err) => warn!(error = %err, "retention sweep failed"),
        }
    }
}
