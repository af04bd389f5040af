use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Engine error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Download error: {0}")]
    Download(String),
    #[error("Transcription error: {0}")]
    Transcription(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("Callback delivery error: {0}")]
    Callback(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Stable machine-readable code persisted on failed jobs and exposed by
    /// the status API.
    pub fn job_error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Download(_) => "download_error",
            AppError::RateLimited(_) => "rate_limit_exceeded",
            AppError::Transcription(_) | AppError::OpenAI(_) => "transcription_error",
            AppError::Callback(_) => "callback_error",
            _ => "processing_error",
        }
    }

    /// Whether another pipeline attempt can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AppError::Validation(_) | AppError::RateLimited(_))
    }
}
