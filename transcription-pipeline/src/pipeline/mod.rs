mod config;
mod services;

pub use config::{PipelineConfig, PipelineTuning};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::transcription_job::{
            JobErrorInfo, JobStage, TranscriptionJob, TranscriptionQuality,
        },
    },
    utils::{config::AppConfig, rate_limit::SharedRateLimitTracker},
};
use tracing::{debug, info, warn};

use crate::utils::{callback, media::DownloadedMedia};

const PROGRESS_DOWNLOADING: u8 = 10;
const PROGRESS_TRANSCRIBING: u8 = 40;
const PROGRESS_CLEANING_UP: u8 = 90;

struct PipelineOutcome {
    transcript: String,
    effective_quality: TranscriptionQuality,
}

#[allow(clippy::module_name_repetitions)]
pub struct TranscriptionPipeline {
    db: Arc<SurrealDbClient>,
    pipeline_config: PipelineConfig,
    services: Arc<dyn PipelineServices>,
}

impl TranscriptionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: &AppConfig,
        tracker: SharedRateLimitTracker,
    ) -> Result<Self, AppError> {
        let services = DefaultPipelineServices::new(config, tracker)?;
        Self::with_services(db, PipelineConfig::default(), Arc::new(services))
    }

    pub fn with_services(
        db: Arc<SurrealDbClient>,
        pipeline_config: PipelineConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            db,
            pipeline_config,
            services,
        })
    }

    #[tracing::instrument(
        skip_all,
        fields(
            job_id = %job.id,
            attempt = job.attempts,
            worker_id = job.worker_id.as_deref().unwrap_or("unknown-worker"),
            quality = job.requested_quality.as_str()
        )
    )]
    pub async fn process_job(&self, job: TranscriptionJob) -> Result<(), AppError> {
        let started = Instant::now();

        match self.drive_pipeline(&job).await.map_err(|err| {
            debug!(
                job_id = %job.id,
                attempt = job.attempts,
                error = %err,
                "transcription pipeline failed"
            );
            err
        }) {
            Ok(outcome) => {
                let completed = job
                    .mark_completed(outcome.transcript.clone(), outcome.effective_quality, &self.db)
                    .await?;
                info!(
                    job_id = %completed.id,
                    attempt = completed.attempts,
                    effective_quality = outcome.effective_quality.as_str(),
                    total_ms = duration_millis(started.elapsed()),
                    "transcription job succeeded"
                );

                if let Some(callback_url) = completed.callback_url.clone() {
                    let payload = callback::success_payload(
                        &completed.id,
                        outcome.effective_quality.as_str(),
                        &outcome.transcript,
                    );
                    self.notify(&completed, &callback_url, &payload).await?;
                }
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                let error_info = JobErrorInfo {
                    code: Some(err.job_error_code().to_string()),
                    message: reason.clone(),
                    details: self.denial_details(&err).await,
                };

                if err.is_retryable() && job.can_retry() {
                    let delay = self.retry_delay(job.attempts);
                    job.mark_requeued(error_info, delay, &self.db).await?;
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        retry_in_secs = delay.as_secs(),
                        "transcription job failed; scheduled retry"
                    );
                } else {
                    let failed = job.mark_failed(error_info, &self.db).await?;
                    warn!(
                        job_id = %failed.id,
                        attempt = failed.attempts,
                        error_code = failed.error_code.as_deref().unwrap_or("unknown"),
                        "transcription job failed terminally"
                    );

                    if let Some(callback_url) = failed.callback_url.clone() {
                        let quality = failed
                            .effective_quality
                            .unwrap_or(failed.requested_quality);
                        let payload =
                            callback::failure_payload(&failed.id, quality.as_str(), &reason);
                        self.notify(&failed, &callback_url, &payload).await?;
                    }
                }

                Err(AppError::Processing(reason))
            }
        }
    }

    /// Usage snapshot attached to terminal rate-limit failures so the status
    /// API can render the 429 shape.
    async fn denial_details(&self, err: &AppError) -> Option<serde_json::Value> {
        if !matches!(err, AppError::RateLimited(_)) {
            return None;
        }
        let stats = self.services.usage_stats().await;
        Some(stats.to_denial_details(chrono::Utc::now()))
    }

    /// Records the webhook outcome on the terminal job. Delivery failure is
    /// advisory: logged and recorded, never a job failure.
    async fn notify(
        &self,
        job: &TranscriptionJob,
        callback_url: &str,
        payload: &serde_json::Value,
    ) -> Result<(), AppError> {
        match self.services.deliver_callback(callback_url, payload).await {
            Ok(()) => {
                job.record_callback_outcome(true, None, &self.db).await?;
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "callback delivery failed");
                job.record_callback_outcome(false, Some(err.to_string()), &self.db)
                    .await?;
            }
        }
        Ok(())
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let tuning = &self.pipeline_config.tuning;
        let capped_attempt = attempt
            .saturating_sub(1)
            .min(tuning.retry_backoff_cap_exponent);
        let multiplier = 2_u64.pow(capped_attempt);
        let delay = tuning.retry_base_delay_secs.saturating_mul(multiplier);

        Duration::from_secs(delay.min(tuning.retry_max_delay_secs))
    }

    #[tracing::instrument(skip_all, fields(job_id = %job.id, attempt = job.attempts))]
    async fn drive_pipeline(&self, job: &TranscriptionJob) -> Result<PipelineOutcome, AppError> {
        job.update_progress(
            JobStage::Downloading,
            PROGRESS_DOWNLOADING,
            "Downloading source audio",
            &self.db,
        )
        .await?;

        let download_started = Instant::now();
        let mut media = self.services.acquire_media(&job.source_url).await?;
        let download_ms = duration_millis(download_started.elapsed());

        let transcribe_started = Instant::now();
        let result = self.transcribe_stage(job, &media).await;
        let transcribe_ms = duration_millis(transcribe_started.elapsed());

        match result {
            Ok(outcome) => {
                job.update_progress(
                    JobStage::CleaningUp,
                    PROGRESS_CLEANING_UP,
                    "Removing temporary files",
                    &self.db,
                )
                .await?;
                self.services.cleanup_media(&mut media).await;

                info!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    download_ms,
                    transcribe_ms,
                    duration_seconds = media.duration_seconds,
                    "transcription pipeline finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.services.cleanup_media(&mut media).await;
                Err(err)
            }
        }
    }

    /// Backend selection and invocation, applying the fallback policy both
    /// predictively (tracker admission) and reactively (backend-reported
    /// rate limit).
    async fn transcribe_stage(
        &self,
        job: &TranscriptionJob,
        media: &DownloadedMedia,
    ) -> Result<PipelineOutcome, AppError> {
        let mut effective = job.requested_quality;

        if effective == TranscriptionQuality::Premium {
            let decision = self.services.admit_premium(media.duration_seconds).await;
            if !decision.allowed {
                if job.allow_fallback {
                    info!(
                        job_id = %job.id,
                        hourly_remaining = decision.hourly_remaining_seconds,
                        daily_remaining = decision.daily_remaining_seconds,
                        "premium quota exhausted; falling back to standard engine"
                    );
                    effective = TranscriptionQuality::Standard;
                } else {
                    return Err(AppError::RateLimited(
                        "premium transcription quota exhausted".to_string(),
                    ));
                }
            }
        }

        job.update_progress(
            JobStage::Transcribing,
            PROGRESS_TRANSCRIBING,
            format!("Transcribing audio ({} quality)", effective.as_str()),
            &self.db,
        )
        .await?;

        let transcript = match self.services.transcribe(effective, &media.file_path).await {
            Ok(text) => text,
            Err(AppError::RateLimited(message))
                if effective == TranscriptionQuality::Premium =>
            {
                // The backend's own accounting won the race against our
                // pre-check; resynchronize before deciding.
                let sync = self.services.resync_rate_limit(&message).await;
                warn!(
                    job_id = %job.id,
                    reset_delay_secs = sync.reset_delay.as_secs(),
                    "premium engine reported rate limit; tracker resynchronized"
                );
                if !job.allow_fallback {
                    return Err(AppError::RateLimited(message));
                }
                effective = TranscriptionQuality::Standard;
                self.services.transcribe(effective, &media.file_path).await?
            }
            Err(err) => return Err(err),
        };

        Ok(PipelineOutcome {
            transcript,
            effective_quality: effective,
        })
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests;
