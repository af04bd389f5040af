use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{AudioResponseFormat, CreateTranscriptionRequestArgs},
    Client,
};
use async_trait::async_trait;
use common::{error::AppError, storage::types::transcription_job::TranscriptionQuality};

/// A transcription engine: audio file in, transcript text out. Both engines
/// speak the OpenAI `audio/transcriptions` protocol; they differ in where
/// they run and whether a quota applies.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    fn quality(&self) -> TranscriptionQuality;
    async fn transcribe(&self, file_path: &str) -> Result<String, AppError>;
}

/// Local Whisper-compatible server. No quota; the universal fallback.
pub struct StandardEngine {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
}

impl StandardEngine {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(base_url),
        );
        Self {
            client,
            model: model.into(),
            request_timeout,
        }
    }
}

#[async_trait]
impl TranscriptionBackend for StandardEngine {
    fn quality(&self) -> TranscriptionQuality {
        TranscriptionQuality::Standard
    }

    async fn transcribe(&self, file_path: &str) -> Result<String, AppError> {
        let request = CreateTranscriptionRequestArgs::default()
            .file(file_path)
            .model(&self.model)
            .response_format(AudioResponseFormat::Json)
            .build()?;

        let response = tokio::time::timeout(
            self.request_timeout,
            self.client.audio().transcribe(request),
        )
        .await
        .map_err(|_| {
            AppError::Transcription(format!(
                "standard engine timed out after {}s",
                self.request_timeout.as_secs()
            ))
        })?
        .map_err(|err| AppError::Transcription(format!("standard engine failed: {err}")))?;

        Ok(response.text)
    }
}

/// Hosted engine with audio-second quotas. Rate-limit rejections map to the
/// dedicated error class so the worker can fall back or resynchronize.
pub struct PremiumEngine {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
}

impl PremiumEngine {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(base_url),
        );
        Self {
            client,
            model: model.into(),
            request_timeout,
        }
    }
}

#[async_trait]
impl TranscriptionBackend for PremiumEngine {
    fn quality(&self) -> TranscriptionQuality {
        TranscriptionQuality::Premium
    }

    async fn transcribe(&self, file_path: &str) -> Result<String, AppError> {
        let request = CreateTranscriptionRequestArgs::default()
            .file(file_path)
            .model(&self.model)
            .response_format(AudioResponseFormat::Json)
            .build()?;

        let response = tokio::time::timeout(
            self.request_timeout,
            self.client.audio().transcribe(request),
        )
        .await
        .map_err(|_| {
            AppError::Transcription(format!(
                "premium engine timed out after {}s",
                self.request_timeout.as_secs()
            ))
        })?
        .map_err(|err| {
            if is_rate_limit_error(&err) {
                AppError::RateLimited(err.to_string())
            } else {
                AppError::Transcription(format!("premium engine failed: {err}"))
            }
        })?;

        Ok(response.text)
    }
}

fn is_rate_limit_error(err: &OpenAIError) -> bool {
    match err {
        OpenAIError::ApiError(api) => {
            api.r#type.as_deref() == Some("rate_limit_exceeded")
                || api.message.to_ascii_lowercase().contains("rate limit")
        }
        _ => false,
    }
}
