use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::transcription_job::TranscriptionQuality,
    utils::{
        config::AppConfig,
        rate_limit::{AdmissionDecision, BackendLimitSync, RateLimitStats, SharedRateLimitTracker},
    },
};
use serde_json::Value;

use crate::utils::{
    backends::{PremiumEngine, StandardEngine, TranscriptionBackend},
    callback,
    media::{self, DownloadedMedia, MediaSettings},
};

/// Seam between the pipeline's orchestration logic and everything that
/// talks to the outside world. Tests substitute a mock implementation.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn acquire_media(&self, source_url: &str) -> Result<DownloadedMedia, AppError>;

    /// Check-then-reserve for premium quota: admission and usage tracking
    /// run atomically so concurrent workers cannot jointly overrun the
    /// window. A denial consumes nothing.
    async fn admit_premium(&self, duration_seconds: i64) -> AdmissionDecision;

    async fn resync_rate_limit(&self, backend_message: &str) -> BackendLimitSync;

    async fn usage_stats(&self) -> RateLimitStats;

    async fn transcribe(
        &self,
        quality: TranscriptionQuality,
        file_path: &str,
    ) -> Result<String, AppError>;

    async fn deliver_callback(&self, url: &str, payload: &Value) -> Result<(), AppError>;

    async fn cleanup_media(&self, media: &mut DownloadedMedia);
}

pub struct DefaultPipelineServices {
    media_settings: MediaSettings,
    standard: StandardEngine,
    premium: PremiumEngine,
    tracker: SharedRateLimitTracker,
    http: reqwest::Client,
    callback_timeout: Duration,
}

impl DefaultPipelineServices {
    pub fn new(config: &AppConfig, tracker: SharedRateLimitTracker) -> Result<Self, AppError> {
        let transcription_timeout = Duration::from_secs(config.transcription_timeout_secs);

        let media_settings = MediaSettings {
            ytdlp_path: config.ytdlp_path.clone(),
            media_dir: PathBuf::from(&config.data_dir).join("media"),
            download_timeout: Duration::from_secs(config.download_timeout_secs),
        };

        let standard = StandardEngine::new(
            &config.standard_engine_base_url,
            &config.standard_engine_api_key,
            config.standard_engine_model.clone(),
            transcription_timeout,
        );
        let premium = PremiumEngine::new(
            &config.premium_engine_base_url,
            &config.premium_engine_api_key,
            config.premium_engine_model.clone(),
            transcription_timeout,
        );

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            media_settings,
            standard,
            premium,
            tracker,
            http,
            callback_timeout: Duration::from_secs(config.callback_timeout_secs),
        })
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn acquire_media(&self, source_url: &str) -> Result<DownloadedMedia, AppError> {
        media::download_audio(&self.media_settings, source_url).await
    }

    async fn admit_premium(&self, duration_seconds: i64) -> AdmissionDecision {
        let mut tracker = self.tracker.lock().await;
        let decision = tracker.can_process(duration_seconds);
        if decision.allowed {
            tracker.track_usage(duration_seconds);
        }
        decision
    }

    async fn resync_rate_limit(&self, backend_message: &str) -> BackendLimitSync {
        self.tracker
            .lock()
            .await
            .handle_rate_limit_error(backend_message)
    }

    async fn usage_stats(&self) -> RateLimitStats {
        self.tracker.lock().await.usage_stats()
    }

    async fn transcribe(
        &self,
        quality: TranscriptionQuality,
        file_path: &str,
    ) -> Result<String, AppError> {
        match quality {
            TranscriptionQuality::Standard => self.standard.transcribe(file_path).await,
            TranscriptionQuality::Premium => self.premium.transcribe(file_path).await,
        }
    }

    async fn deliver_callback(&self, url: &str, payload: &Value) -> Result<(), AppError> {
        callback::deliver_callback(&self.http, url, payload, self.callback_timeout).await
    }

    async fn cleanup_media(&self, media: &mut DownloadedMedia) {
        media.cleanup();
    }
}
