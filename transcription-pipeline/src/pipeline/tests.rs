use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::transcription_job::{JobState, TranscriptionJob, TranscriptionQuality},
    },
    utils::rate_limit::{
        AdmissionDecision, BackendLimitSync, RateLimitStats, RateLimitTier, WindowStats,
    },
};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{PipelineConfig, PipelineServices, TranscriptionPipeline};
use crate::utils::media::DownloadedMedia;

#[derive(Default)]
struct MockBehavior {
    fail_download: bool,
    deny_admission: bool,
    premium_rate_limited: bool,
    fail_callback: bool,
}

struct MockServices {
    duration_seconds: i64,
    behavior: MockBehavior,
    calls: Mutex<Vec<String>>,
}

impl MockServices {
    fn new(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            duration_seconds: 300,
            behavior,
            calls: Mutex::new(Vec::new()),
        })
    }

    async fn record(&self, call: impl Into<String>) {
        self.calls.lock().await.push(call.into());
    }

    async fn call_log(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    fn fabricated_stats(&self) -> RateLimitStats {
        let now = Utc::now();
        RateLimitStats {
            tier: RateLimitTier::Free,
            hourly: WindowStats {
                limit_seconds: 7_200,
                used_seconds: 7_200,
                remaining_seconds: 0,
                resets_at: now + ChronoDuration::minutes(30),
            },
            daily: WindowStats {
                limit_seconds: 28_800,
                used_seconds: 7_200,
                remaining_seconds: 21_600,
                resets_at: now + ChronoDuration::hours(20),
            },
        }
    }
}

#[async_trait]
impl PipelineServices for MockServices {
    async fn acquire_media(&self, _source_url: &str) -> Result<DownloadedMedia, AppError> {
        self.record("download").await;
        if self.behavior.fail_download {
            return Err(AppError::Download("media download failed: unavailable".into()));
        }
        Ok(DownloadedMedia::detached(
            "/tmp/mock-audio.mp3",
            self.duration_seconds,
        ))
    }

    async fn admit_premium(&self, duration_seconds: i64) -> AdmissionDecision {
        self.record(format!("admit:{duration_seconds}")).await;
        if self.behavior.deny_admission {
            AdmissionDecision {
                allowed: false,
                hourly_remaining_seconds: 0,
                daily_remaining_seconds: 21_600,
                estimated_wait: Some(Duration::from_secs(30 * 60)),
            }
        } else {
            AdmissionDecision {
                allowed: true,
                hourly_remaining_seconds: 7_200 - duration_seconds,
                daily_remaining_seconds: 28_800 - duration_seconds,
                estimated_wait: None,
            }
        }
    }

    async fn resync_rate_limit(&self, _backend_message: &str) -> BackendLimitSync {
        self.record("resync").await;
        BackendLimitSync {
            used_seconds: 7_200,
            reset_delay: Duration::from_secs(600),
            estimated_reset_at: Utc::now() + ChronoDuration::minutes(10),
        }
    }

    async fn usage_stats(&self) -> RateLimitStats {
        self.record("stats").await;
        self.fabricated_stats()
    }

    async fn transcribe(
        &self,
        quality: TranscriptionQuality,
        _file_path: &str,
    ) -> Result<String, AppError> {
        self.record(format!("transcribe:{}", quality.as_str())).await;
        if quality == TranscriptionQuality::Premium && self.behavior.premium_rate_limited {
            return Err(AppError::RateLimited(
                "rate limit reached, please try again in 10m".into(),
            ));
        }
        Ok(format!("transcript via {}", quality.as_str()))
    }

    async fn deliver_callback(&self, _url: &str, _payload: &Value) -> Result<(), AppError> {
        self.record("callback").await;
        if self.behavior.fail_callback {
            return Err(AppError::Callback("callback POST failed: connection refused".into()));
        }
        Ok(())
    }

    async fn cleanup_media(&self, media: &mut DownloadedMedia) {
        self.record("cleanup").await;
        media.cleanup();
    }
}

async fn setup_db() -> SurrealDbClient {
    let namespace = "pipeline_test";
    let database = Uuid::new_v4().to_string();
    SurrealDbClient::memory(namespace, &database)
        .await
        .expect("Failed to create in-memory SurrealDB")
}

fn pipeline_with(
    db: &SurrealDbClient,
    services: Arc<MockServices>,
) -> TranscriptionPipeline {
    TranscriptionPipeline::with_services(
        Arc::new(db.clone()),
        PipelineConfig::default(),
        services,
    )
    .expect("pipeline")
}

async fn enqueue_and_claim(
    db: &SurrealDbClient,
    worker_id: &str,
    quality: TranscriptionQuality,
    allow_fallback: bool,
    callback_url: Option<&str>,
) -> TranscriptionJob {
    let job = TranscriptionJob::new(
        "https://youtu.be/abc123".to_string(),
        quality,
        allow_fallback,
        callback_url.map(str::to_string),
    );
    db.store_item(job.clone()).await.expect("job stored");
    TranscriptionJob::claim_next_ready(db, worker_id, Utc::now(), job.lease_duration())
        .await
        .expect("claim succeeds")
        .expect("job claimed")
}

#[tokio::test]
async fn standard_job_completes_with_callback() {
    let db = setup_db().await;
    let services = MockServices::new(MockBehavior::default());
    let pipeline = pipeline_with(&db, services.clone());

    let job = enqueue_and_claim(
        &db,
        "worker-happy",
        TranscriptionQuality::Standard,
        true,
        Some("https://hooks.example.com/done"),
    )
    .await;

    pipeline
        .process_job(job.clone())
        .await
        .expect("pipeline succeeds");

    let stored: TranscriptionJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve job")
        .expect("job present");
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.transcript.as_deref(), Some("transcript via standard"));
    assert_eq!(
        stored.effective_quality,
        Some(TranscriptionQuality::Standard)
    );
    assert_eq!(stored.progress.percentage, 100);
    assert_eq!(stored.callback_success, Some(true));
    assert!(stored.callback_error.is_none());

    let calls = services.call_log().await;
    assert_eq!(
        calls,
        ["download", "transcribe:standard", "cleanup", "callback"]
    );
}

#[tokio::test]
async fn premium_job_uses_premium_engine_when_admitted() {
    let db = setup_db().await;
    let services = MockServices::new(MockBehavior::default());
    let pipeline = pipeline_with(&db, services.clone());

    let job = enqueue_and_claim(&db, "worker-prem", TranscriptionQuality::Premium, true, None).await;

    pipeline.process_job(job.clone()).await.expect("succeeds");

    let stored: TranscriptionJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve")
        .expect("present");
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.effective_quality, Some(TranscriptionQuality::Premium));
    assert_eq!(stored.transcript.as_deref(), Some("transcript via premium"));

    let calls = services.call_log().await;
    assert_eq!(calls, ["download", "admit:300", "transcribe:premium", "cleanup"]);
}

#[tokio::test]
async fn denied_premium_job_falls_back_to_standard() {
    let db = setup_db().await;
    let services = MockServices::new(MockBehavior {
        deny_admission: true,
        ..MockBehavior::default()
    });
    let pipeline = pipeline_with(&db, services.clone());

    let job = enqueue_and_claim(&db, "worker-fb", TranscriptionQuality::Premium, true, None).await;

    pipeline.process_job(job.clone()).await.expect("succeeds");

    let stored: TranscriptionJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve")
        .expect("present");
    assert_eq!(stored.state, JobState::Completed);
    // Never premium when admission denied.
    assert_eq!(
        stored.effective_quality,
        Some(TranscriptionQuality::Standard)
    );

    let calls = services.call_log().await;
    assert!(calls.contains(&"transcribe:standard".to_string()));
    assert!(!calls.contains(&"transcribe:premium".to_string()));
}

#[tokio::test]
async fn denied_premium_job_without_fallback_fails_without_backend_call() {
    let db = setup_db().await;
    let services = MockServices::new(MockBehavior {
        deny_admission: true,
        ..MockBehavior::default()
    });
    let pipeline = pipeline_with(&db, services.clone());

    let job =
        enqueue_and_claim(&db, "worker-deny", TranscriptionQuality::Premium, false, None).await;

    let result = pipeline.process_job(job.clone()).await;
    assert!(result.is_err(), "denial should surface as error");

    let stored: TranscriptionJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve")
        .expect("present");
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.error_code.as_deref(), Some("rate_limit_exceeded"));
    assert!(stored.error_message.is_some());
    let details = stored.error_details.expect("usage snapshot recorded");
    assert_eq!(details["used"], 7_200);
    assert_eq!(details["remaining"], 0);

    let calls = services.call_log().await;
    assert!(
        !calls.iter().any(|c| c.starts_with("transcribe")),
        "no backend call on denial: {calls:?}"
    );

    // Terminal immediately, no retry scheduled.
    let next = TranscriptionJob::claim_next_ready(
        &db,
        "worker-next",
        Utc::now() + ChronoDuration::hours(1),
        Duration::from_secs(60),
    )
    .await
    .expect("claim");
    assert!(next.is_none());
}

#[tokio::test]
async fn backend_rate_limit_falls_back_within_the_attempt() {
    let db = setup_db().await;
    let services = MockServices::new(MockBehavior {
        premium_rate_limited: true,
        ..MockBehavior::default()
    });
    let pipeline = pipeline_with(&db, services.clone());

    let job =
        enqueue_and_claim(&db, "worker-react", TranscriptionQuality::Premium, true, None).await;

    pipeline.process_job(job.clone()).await.expect("succeeds");

    let stored: TranscriptionJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve")
        .expect("present");
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(
        stored.effective_quality,
        Some(TranscriptionQuality::Standard)
    );

    let calls = services.call_log().await;
    assert_eq!(
        calls,
        [
            "download",
            "admit:300",
            "transcribe:premium",
            "resync",
            "transcribe:standard",
            "cleanup"
        ]
    );
}

#[tokio::test]
async fn backend_rate_limit_without_fallback_fails_terminally() {
    let db = setup_db().await;
    let services = MockServices::new(MockBehavior {
        premium_rate_limited: true,
        ..MockBehavior::default()
    });
    let pipeline = pipeline_with(&db, services.clone());

    let job =
        enqueue_and_claim(&db, "worker-react2", TranscriptionQuality::Premium, false, None).await;

    let result = pipeline.process_job(job.clone()).await;
    assert!(result.is_err());

    let stored: TranscriptionJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve")
        .expect("present");
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.error_code.as_deref(), Some("rate_limit_exceeded"));

    let calls = services.call_log().await;
    assert!(calls.contains(&"resync".to_string()), "tracker resynchronized");
}

#[tokio::test]
async fn download_failure_retries_until_attempts_exhausted() {
    let db = setup_db().await;
    let services = MockServices::new(MockBehavior {
        fail_download: true,
        ..MockBehavior::default()
    });
    let pipeline = pipeline_with(&db, services.clone());

    let job = TranscriptionJob::new(
        "https://youtu.be/gone".to_string(),
        TranscriptionQuality::Standard,
        true,
        None,
    );
    let max_attempts = job.max_attempts;
    db.store_item(job.clone()).await.expect("stored");

    let mut claim_time = Utc::now();
    for attempt in 1..=max_attempts {
        let claimed = TranscriptionJob::claim_next_ready(
            &db,
            "worker-retry",
            claim_time,
            Duration::from_secs(60),
        )
        .await
        .expect("claim succeeds")
        .expect("job claimable");
        assert_eq!(claimed.attempts, attempt);

        let result = pipeline.process_job(claimed).await;
        assert!(result.is_err());

        let stored: TranscriptionJob = db
            .get_item(&job.id)
            .await
            .expect("retrieve")
            .expect("present");

        if attempt < max_attempts {
            assert_eq!(stored.state, JobState::Waiting, "retry scheduled");
            assert_eq!(stored.error_code.as_deref(), Some("download_error"));
            assert!(stored.scheduled_at > claim_time, "backoff in the future");
            claim_time = stored.scheduled_at + ChronoDuration::seconds(1);
        } else {
            assert_eq!(stored.state, JobState::Failed, "attempts exhausted");
            assert_eq!(stored.error_code.as_deref(), Some("download_error"));
            assert!(stored.finished_at.is_some());
        }
    }
}

#[tokio::test]
async fn callback_failure_never_changes_the_terminal_state() {
    let db = setup_db().await;
    let services = MockServices::new(MockBehavior {
        fail_callback: true,
        ..MockBehavior::default()
    });
    let pipeline = pipeline_with(&db, services.clone());

    let job = enqueue_and_claim(
        &db,
        "worker-cb",
        TranscriptionQuality::Standard,
        true,
        Some("https://unreachable.example.com/hook"),
    )
    .await;

    pipeline
        .process_job(job.clone())
        .await
        .expect("job still succeeds");

    let stored: TranscriptionJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve")
        .expect("present");
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.callback_success, Some(false));
    assert!(stored
        .callback_error
        .as_deref()
        .is_some_and(|msg| !msg.is_empty()));
}

#[tokio::test]
async fn failure_callback_is_delivered_for_terminal_failures() {
    let db = setup_db().await;
    let services = MockServices::new(MockBehavior {
        deny_admission: true,
        ..MockBehavior::default()
    });
    let pipeline = pipeline_with(&db, services.clone());

    let job = enqueue_and_claim(
        &db,
        "worker-failcb",
        TranscriptionQuality::Premium,
        false,
        Some("https://hooks.example.com/failed"),
    )
    .await;

    let result = pipeline.process_job(job.clone()).await;
    assert!(result.is_err());

    let stored: TranscriptionJob = db
        .get_item(&job.id)
        .await
        .expect("retrieve")
        .expect("present");
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.callback_success, Some(true));

    let calls = services.call_log().await;
    assert!(calls.contains(&"callback".to_string()));
}
