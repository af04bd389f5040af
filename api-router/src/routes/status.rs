use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::{
    error::AppError,
    storage::types::transcription_job::{JobState, TranscriptionJob},
};
use serde_json::{json, Value};

use crate::{api_state::ApiState, error::ApiError};

/// Read-side contract for polling consumers. Unknown or evicted ids signal
/// `not_found` so callers can distinguish them from jobs that exist but have
/// made no progress yet; active jobs always reflect the latest progress
/// update.
pub async fn get_transcription_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job: Option<TranscriptionJob> = state
        .db
        .get_item(&job_id)
        .await
        .map_err(AppError::from)?;

    let Some(job) = job else {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({
                "status_code": 404,
                "status_message": "not_found",
                "error": format!("No transcription job found for id {job_id}"),
            })),
        )
            .into_response());
    };

    let response = match job.state {
        JobState::Waiting | JobState::Active => (
            StatusCode::OK,
            Json(json!({
                "status_code": 102,
                "status_message": "processing",
                "job_id": job.id,
                "progress": job.progress,
            })),
        )
            .into_response(),
        JobState::Completed => {
            let quality = job.effective_quality.unwrap_or(job.requested_quality);
            let mut body = json!({
                "status_code": 200,
                "status_message": "success",
                "job_id": job.id,
                "transcription": job.transcript.unwrap_or_default(),
                "quality": quality.as_str(),
                "callback_status": callback_status(job.callback_success),
            });
            if let (Some(map), Some(callback_error)) = (body.as_object_mut(), job.callback_error)
            {
                map.insert("callback_error".to_string(), Value::String(callback_error));
            }
            (StatusCode::OK, Json(body)).into_response()
        }
        JobState::Failed => failed_response(&job),
    };

    Ok(response)
}

fn callback_status(callback_success: Option<bool>) -> Value {
    match callback_success {
        Some(true) => Value::String("delivered".to_string()),
        Some(false) => Value::String("failed".to_string()),
        None => Value::Null,
    }
}

fn failed_response(job: &TranscriptionJob) -> Response {
    let details = job
        .error_message
        .clone()
        .unwrap_or_else(|| "Processing failed".to_string());

    if job.error_code.as_deref() == Some("rate_limit_exceeded") {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Rate limit exceeded",
                "details": details,
                "rateLimits": job.error_details.clone().unwrap_or(Value::Null),
                "quality": job.requested_quality.as_str(),
                "status_code": 429,
            })),
        )
            .into_response();
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "status_code": 500,
            "status_message": "error",
            "job_id": job.id,
            "details": details,
        })),
    )
        .into_response()
}
