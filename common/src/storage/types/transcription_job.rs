use std::time::Duration;

use chrono::Duration as ChronoDuration;
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_SECS: i64 = 600;

/// Quality tier requested by the caller. Premium jobs outrank standard ones
/// in the dispatch order.
#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionQuality {
    #[default]
    Standard,
    Premium,
}

impl TranscriptionQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            TranscriptionQuality::Standard => "standard",
            TranscriptionQuality::Premium => "premium",
        }
    }

    pub fn queue_priority(self) -> i32 {
        match self {
            TranscriptionQuality::Standard => 0,
            TranscriptionQuality::Premium => 10,
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Downloading,
    Transcribing,
    CleaningUp,
    Completed,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Downloading => "downloading",
            JobStage::Transcribing => "transcribing",
            JobStage::CleaningUp => "cleaning_up",
            JobStage::Completed => "completed",
        }
    }
}

/// Live progress of a job, mutated in place while the job is active.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct JobProgress {
    pub percentage: u8,
    pub stage: JobStage,
    pub message: String,
}

impl JobProgress {
    pub fn queued() -> Self {
        Self {
            percentage: 0,
            stage: JobStage::Downloading,
            message: "Waiting for an available worker".to_string(),
        }
    }

    fn finished() -> Self {
        Self {
            percentage: 100,
            stage: JobStage::Completed,
            message: "Transcription complete".to_string(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Default)]
pub struct JobErrorInfo {
    pub code: Option<String>,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy)]
enum JobTransition {
    Claim,
    Complete,
    Fail,
    Requeue,
}

impl JobTransition {
    fn as_str(&self) -> &'static str {
        match self {
            JobTransition::Claim => "claim",
            JobTransition::Complete => "complete",
            JobTransition::Fail => "fail",
            JobTransition::Requeue => "requeue",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Waiting,
        states: [Waiting, Active, Completed, Failed],
        events {
            claim {
                transition: { from: Waiting, to: Active }
            }
            complete {
                transition: { from: Active, to: Completed }
            }
            fail {
                transition: { from: Active, to: Failed }
            }
            requeue {
                transition: { from: Active, to: Waiting }
            }
        }
    }

    pub(super) fn waiting() -> JobLifecycleMachine<(), Waiting> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn active() -> JobLifecycleMachine<(), Active> {
        waiting()
            .claim()
            .expect("claim transition from Waiting should exist")
    }
}

fn invalid_transition(state: &JobState, event: JobTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid job transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(state: &JobState, event: JobTransition) -> Result<JobState, AppError> {
    use lifecycle::*;
    match (state, event) {
        (JobState::Waiting, JobTransition::Claim) => waiting()
            .claim()
            .map(|_| JobState::Active)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Active, JobTransition::Complete) => active()
            .complete()
            .map(|_| JobState::Completed)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Active, JobTransition::Fail) => active()
            .fail()
            .map(|_| JobState::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Active, JobTransition::Requeue) => active()
            .requeue()
            .map(|_| JobState::Waiting)
            .map_err(|_| invalid_transition(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

stored_object!(TranscriptionJob, "transcription_job", {
    source_url: String,
    requested_quality: TranscriptionQuality,
    effective_quality: Option<TranscriptionQuality>,
    allow_fallback: bool,
    callback_url: Option<String>,
    state: JobState,
    priority: i32,
    progress: JobProgress,
    transcript: Option<String>,
    callback_success: Option<bool>,
    callback_error: Option<String>,
    attempts: u32,
    max_attempts: u32,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    scheduled_at: chrono::DateTime<chrono::Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
    lease_duration_secs: i64,
    worker_id: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    error_details: Option<serde_json::Value>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    last_error_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    finished_at: Option<chrono::DateTime<chrono::Utc>>
});

impl TranscriptionJob {
    pub fn new(
        source_url: String,
        requested_quality: TranscriptionQuality,
        allow_fallback: bool,
        callback_url: Option<String>,
    ) -> Self {
        let now = chrono::Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            source_url,
            requested_quality,
            effective_quality: None,
            allow_fallback,
            callback_url,
            state: JobState::Waiting,
            priority: requested_quality.queue_priority(),
            progress: JobProgress::queued(),
            transcript: None,
            callback_success: None,
            callback_error: None,
            attempts: 0,
            max_attempts: MAX_ATTEMPTS,
            scheduled_at: now,
            locked_at: None,
            lease_duration_secs: DEFAULT_LEASE_SECS,
            worker_id: None,
            error_code: None,
            error_message: None,
            error_details: None,
            last_error_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs.max(0) as u64)
    }

    pub async fn create_and_enqueue(
        source_url: String,
        requested_quality: TranscriptionQuality,
        allow_fallback: bool,
        callback_url: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<TranscriptionJob, AppError> {
        let job = Self::new(source_url, requested_quality, allow_fallback, callback_url);
        db.store_item(job.clone()).await?;
        Ok(job)
    }

    /// Atomically claims the best waiting job: premium tier first, FIFO
    /// within a tier. Active jobs whose lease expired are reclaimable so a
    /// crashed worker cannot strand them; a reclaim does not count as a new
    /// attempt.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        worker_id: &str,
        now: chrono::DateTime<chrono::Utc>,
        lease_duration: Duration,
    ) -> Result<Option<TranscriptionJob>, AppError> {
        debug_assert!(compute_next_state(&JobState::Waiting, JobTransition::Claim).is_ok());

        const CLAIM_QUERY: &str = r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE (
                        (state = $waiting AND scheduled_at <= $now)
                        OR (
                            state = $active
                            AND locked_at != NONE
                            AND time::unix($now) - time::unix(locked_at) >= lease_duration_secs
                        )
                      )
                ORDER BY priority DESC, scheduled_at ASC, created_at ASC
                LIMIT 1
            )
            SET attempts = if state = $waiting THEN
                    if attempts + 1 > max_attempts THEN max_attempts ELSE attempts + 1 END
                ELSE
                    attempts
                END,
                state = $active,
                locked_at = $now,
                worker_id = $worker_id,
                lease_duration_secs = $lease_secs,
                updated_at = $now
            RETURN *;
        "#;

        let mut result = db
            .client
            .query(CLAIM_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("waiting", JobState::Waiting.as_str()))
            .bind(("active", JobState::Active.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("lease_secs", lease_duration.as_secs() as i64))
            .await?;

        let job: Option<TranscriptionJob> = result.take(0)?;
        Ok(job)
    }

    /// Writes a progress update for polling consumers and renews the lease.
    /// Guarded by worker id so a stale worker cannot touch a reclaimed job.
    pub async fn update_progress(
        &self,
        stage: JobStage,
        percentage: u8,
        message: impl Into<String>,
        db: &SurrealDbClient,
    ) -> Result<TranscriptionJob, AppError> {
        const PROGRESS_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET progress = $progress,
                locked_at = $now,
                updated_at = $now
            WHERE state = $active AND worker_id = $worker_id
            RETURN *;
        "#;

        let progress = JobProgress {
            percentage,
            stage,
            message: message.into(),
        };

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(PROGRESS_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("progress", progress))
            .bind(("active", JobState::Active.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<TranscriptionJob> = result.take(0)?;
        updated.ok_or_else(|| {
            AppError::Processing(format!("progress update lost for job {}", self.id))
        })
    }

    pub async fn mark_completed(
        &self,
        transcript: String,
        effective_quality: TranscriptionQuality,
        db: &SurrealDbClient,
    ) -> Result<TranscriptionJob, AppError> {
        let next = compute_next_state(&self.state, JobTransition::Complete)?;
        debug_assert_eq!(next, JobState::Completed);

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $completed,
                progress = $progress,
                transcript = $transcript,
                effective_quality = $quality,
                finished_at = $now,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                error_code = NONE,
                error_message = NONE,
                error_details = NONE,
                last_error_at = NONE
            WHERE state = $active AND worker_id = $worker_id
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(COMPLETE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("completed", JobState::Completed.as_str()))
            .bind(("progress", JobProgress::finished()))
            .bind(("transcript", transcript))
            .bind(("quality", effective_quality))
            .bind(("active", JobState::Active.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<TranscriptionJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, JobTransition::Complete))
    }

    /// Records the webhook outcome on an already-terminal job. Never changes
    /// the job state.
    pub async fn record_callback_outcome(
        &self,
        success: bool,
        error: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<TranscriptionJob, AppError> {
        const CALLBACK_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET callback_success = $success,
                callback_error = $error,
                updated_at = $now
            WHERE state IN $terminal_states
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(CALLBACK_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("success", success))
            .bind(("error", error))
            .bind((
                "terminal_states",
                vec![JobState::Completed.as_str(), JobState::Failed.as_str()],
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<TranscriptionJob> = result.take(0)?;
        updated.ok_or_else(|| {
            AppError::Processing(format!("callback outcome lost for job {}", self.id))
        })
    }

    /// Schedules another attempt after a transient failure. The job returns
    /// to the waiting pool with a future visibility time; attempts are
    /// counted at claim time.
    pub async fn mark_requeued(
        &self,
        error: JobErrorInfo,
        retry_delay: Duration,
        db: &SurrealDbClient,
    ) -> Result<TranscriptionJob, AppError> {
        let next = compute_next_state(&self.state, JobTransition::Requeue)?;
        debug_assert_eq!(next, JobState::Waiting);

        let now = chrono::Utc::now();
        let retry_at = now
            + ChronoDuration::from_std(retry_delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

        const REQUEUE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $waiting,
                scheduled_at = $retry_at,
                progress = $progress,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                error_code = $error_code,
                error_message = $error_message,
                last_error_at = $now
            WHERE state = $active AND worker_id = $worker_id
            RETURN *;
        "#;

        let progress = JobProgress {
            percentage: 0,
            stage: JobStage::Downloading,
            message: "Retry scheduled".to_string(),
        };

        let mut result = db
            .client
            .query(REQUEUE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("waiting", JobState::Waiting.as_str()))
            .bind(("retry_at", SurrealDatetime::from(retry_at)))
            .bind(("progress", progress))
            .bind(("active", JobState::Active.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("error_code", error.code.clone()))
            .bind(("error_message", error.message.clone()))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<TranscriptionJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, JobTransition::Requeue))
    }

    pub async fn mark_failed(
        &self,
        error: JobErrorInfo,
        db: &SurrealDbClient,
    ) -> Result<TranscriptionJob, AppError> {
        let next = compute_next_state(&self.state, JobTransition::Fail)?;
        debug_assert_eq!(next, JobState::Failed);

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $failed,
                finished_at = $now,
                updated_at = $now,
                locked_at = NONE,
                worker_id = NONE,
                error_code = $error_code,
                error_message = $error_message,
                error_details = $error_details,
                last_error_at = $now
            WHERE state = $active AND worker_id = $worker_id
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed", JobState::Failed.as_str()))
            .bind(("active", JobState::Active.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("error_code", error.code.clone()))
            .bind(("error_message", error.message.clone()))
            .bind(("error_details", error.details.clone()))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<TranscriptionJob> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, JobTransition::Fail))
    }

    /// Evicts terminal jobs past their retention window. Completed jobs are
    /// pruned sooner than failed ones so failures stay inspectable longer.
    pub async fn prune_finished(
        db: &SurrealDbClient,
        now: chrono::DateTime<chrono::Utc>,
        completed_retention: Duration,
        failed_retention: Duration,
    ) -> Result<usize, AppError> {
        const PRUNE_QUERY: &str = r#"
            DELETE FROM type::table($table)
            WHERE (state = $completed AND finished_at != NONE AND finished_at <= $completed_cutoff)
               OR (state = $failed AND finished_at != NONE AND finished_at <= $failed_cutoff)
            RETURN BEFORE;
        "#;

        let completed_cutoff = now
            - ChronoDuration::from_std(completed_retention)
                .unwrap_or_else(|_| ChronoDuration::hours(1));
        let failed_cutoff = now
            - ChronoDuration::from_std(failed_retention)
                .unwrap_or_else(|_| ChronoDuration::hours(24));

        let mut result = db
            .client
            .query(PRUNE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("completed", JobState::Completed.as_str()))
            .bind(("failed", JobState::Failed.as_str()))
            .bind(("completed_cutoff", SurrealDatetime::from(completed_cutoff)))
            .bind(("failed_cutoff", SurrealDatetime::from(failed_cutoff)))
            .await?;

        let evicted: Vec<TranscriptionJob> = result.take(0)?;
        Ok(evicted.len())
    }
}
