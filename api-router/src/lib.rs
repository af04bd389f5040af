use api_state::ApiState;
use axum::{
    extract::FromRef,
    routing::{get, post},
    Router,
};
use routes::{
    liveness::live, readiness::ready, status::get_transcription_status,
    submit::submit_transcription, usage::get_usage,
};

pub mod api_state;
pub mod error;
mod routes;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Public endpoints for k8s/systemd probes
    let probes = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    let api = Router::new()
        .route("/transcriptions", post(submit_transcription))
        .route("/transcriptions/{job_id}", get(get_transcription_status))
        .route("/usage", get(get_usage));

    probes.merge(api)
}
