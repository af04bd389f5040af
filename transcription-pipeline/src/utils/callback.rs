use std::time::Duration;

use common::error::AppError;
use serde_json::{json, Value};

/// Webhook body for a completed job.
pub fn success_payload(job_id: &str, quality: &str, text: &str) -> Value {
    json!({
        "job_id": job_id,
        "status_code": 200,
        "status_message": "success",
        "quality": quality,
        "response": { "text": text },
    })
}

/// Webhook body for a failed job.
pub fn failure_payload(job_id: &str, quality: &str, error: &str) -> Value {
    json!({
        "job_id": job_id,
        "status_code": 500,
        "status_message": "error",
        "quality": quality,
        "error": error,
    })
}

/// One-shot delivery with a short timeout. The job is already terminal when
/// this runs; delivery is advisory and never retried.
pub async fn deliver_callback(
    http: &reqwest::Client,
    url: &str,
    payload: &Value,
    request_timeout: Duration,
) -> Result<(), AppError> {
    let response = http
        .post(url)
        .timeout(request_timeout)
        .json(payload)
        .send()
        .await
        .map_err(|err| AppError::Callback(format!("callback POST failed: {err}")))?;

    if !response.status().is_success() {
        return Err(AppError::Callback(format!(
            "callback endpoint returned {}",
            response.status()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_payload_shape() {
        let payload = success_payload("job-1", "premium", "hello world");
        assert_eq!(payload["job_id"], "job-1");
        assert_eq!(payload["status_code"], 200);
        assert_eq!(payload["status_message"], "success");
        assert_eq!(payload["quality"], "premium");
        assert_eq!(payload["response"]["text"], "hello world");
    }

    #[test]
    fn failure_payload_shape() {
        let payload = failure_payload("job-2", "standard", "media download failed");
        assert_eq!(payload["status_code"], 500);
        assert_eq!(payload["status_message"], "error");
        assert_eq!(payload["error"], "media download failed");
        assert!(payload.get("response").is_none());
    }

    #[tokio::test]
    async fn delivery_to_unreachable_host_is_a_callback_error() {
        let http = reqwest::Client::new();
        // Reserved TEST-NET-1 address; nothing listens there.
        let result = deliver_callback(
            &http,
            "http://192.0.2.1:9/hook",
            &success_payload("job-3", "standard", "text"),
            Duration::from_millis(250),
        )
        .await;
        assert!(matches!(result, Err(AppError::Callback(_))));
    }
}
