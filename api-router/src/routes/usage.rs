use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::api_state::ApiState;

/// Current premium-quota snapshot, for dashboards and operators.
pub async fn get_usage(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.tracker.lock().await.usage_stats();

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "usage": stats,
        })),
    )
}
