use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use common::{
    storage::types::transcription_job::{TranscriptionJob, TranscriptionQuality},
    utils::source_url::{ensure_callback_url_allowed, ensure_supported_source_url},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct SubmitTranscriptionParams {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub quality: TranscriptionQuality,
    #[serde(default = "default_fallback", rename = "fallbackOnRateLimit")]
    pub fallback_on_rate_limit: bool,
    #[serde(default)]
    pub callback_url: Option<String>,
}

fn default_fallback() -> bool {
    true
}

/// Accepts a transcription request. Validation failures are rejected
/// synchronously before anything is enqueued; on acceptance the job id is
/// returned immediately and processing happens asynchronously.
pub async fn submit_transcription(
    State(state): State<ApiState>,
    Json(input): Json<SubmitTranscriptionParams>,
) -> Result<impl IntoResponse, ApiError> {
    let url = input
        .url
        .as_deref()
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .ok_or_else(|| ApiError::ValidationError("Missing required field: url".to_string()))?;

    ensure_supported_source_url(url)?;
    if let Some(callback_url) = input.callback_url.as_deref() {
        ensure_callback_url_allowed(callback_url)?;
    }

    info!(
        quality = input.quality.as_str(),
        fallback_on_rate_limit = input.fallback_on_rate_limit,
        has_callback = input.callback_url.is_some(),
        "Received transcription request"
    );

    let job = TranscriptionJob::create_and_enqueue(
        url.to_string(),
        input.quality,
        input.fallback_on_rate_limit,
        input.callback_url.clone(),
        &state.db,
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status_code": "202",
            "status_message": "accepted",
            "job_id": job.id,
            "quality": job.requested_quality.as_str(),
        })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let input: SubmitTranscriptionParams =
            serde_json::from_str(r#"{"url": "https://youtu.be/abc123"}"#).expect("valid json");

        assert_eq!(input.quality, TranscriptionQuality::Standard);
        assert!(input.fallback_on_rate_limit);
        assert!(input.callback_url.is_none());
    }

    #[test]
    fn explicit_fields_are_honored() {
        let input: SubmitTranscriptionParams = serde_json::from_str(
            r#"{
                "url": "https://youtu.be/abc123",
                "quality": "premium",
                "fallbackOnRateLimit": false,
                "callback_url": "https://hooks.example.com/done"
            }"#,
        )
        .expect("valid json");

        assert_eq!(input.quality, TranscriptionQuality::Premium);
        assert!(!input.fallback_on_rate_limit);
        assert_eq!(
            input.callback_url.as_deref(),
            Some("https://hooks.example.com/done")
        );
    }

    #[test]
    fn unknown_quality_is_rejected() {
        let result = serde_json::from_str::<SubmitTranscriptionParams>(
            r#"{"url": "https://youtu.be/abc123", "quality": "ultra"}"#,
        );
        assert!(result.is_err());
    }
}
