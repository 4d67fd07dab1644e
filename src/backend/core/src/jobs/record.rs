//! Job records.
//!
//! A job is a common envelope (identity, owner principal, state machine,
//! timestamps) plus a tagged payload variant selected by the job type.
//! Executors match on the payload discriminator; there is no job-type
//! inheritance anywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::state::{JobState, JobStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Type & Payload
// ═══════════════════════════════════════════════════════════════════════════════

/// Discriminator selecting the payload variant and the executor for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Character-frequency encoding of a text input
    Encode,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode => write!(f, "encode"),
        }
    }
}

/// Per-type job data: the input blob plus the resumption cursor.
///
/// Owned exclusively by the job record and mutated only by that type's
/// executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Encode {
        /// Source text to encode
        input: String,
        /// Number of output characters already produced and delivered
        cursor: usize,
        /// Output produced so far
        produced: String,
    },
}

impl JobPayload {
    /// The discriminator for this payload.
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Encode { .. } => JobType::Encode,
        }
    }
}

/// Typed creation payload accepted at the submission boundary.
///
/// Unknown job types or missing fields fail deserialization before a record
/// is ever created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum CreateJobRequest {
    Encode { input: String },
}

impl CreateJobRequest {
    /// The job type this request creates.
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Encode { .. } => JobType::Encode,
        }
    }

    /// Build the initial payload for a fresh record.
    pub fn into_payload(self) -> JobPayload {
        match self {
            Self::Encode { input } => JobPayload::Encode {
                input,
                cursor: 0,
                produced: String::new(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    user_id: String,
    state: JobState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    payload: JobPayload,
}

impl Job {
    /// Create a new record in `Created` for the given owner principal.
    pub fn new(user_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: JobId::new(),
            user_id: user_id.into(),
            state: JobState::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            payload,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut JobPayload {
        &mut self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle (thin wrappers stamping timestamps around state transitions)
    // ─────────────────────────────────────────────────────────────────────────

    /// Admit the job to the queue.
    pub fn enqueue(&mut self) -> Result<()> {
        self.state.enqueue()
    }

    /// Attempt to lease the job for `worker_id`.
    pub fn try_acquire(&mut self, worker_id: &str, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.state.try_acquire(worker_id, now, ttl)
    }

    /// Begin execution; the first start wins the `started_at` stamp.
    pub fn start(&mut self, worker_id: &str) -> Result<()> {
        self.state.start(worker_id)?;
        self.started_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    /// Renew the lease.
    pub fn heartbeat(&mut self, worker_id: &str, now: DateTime<Utc>, ttl: Duration) -> Result<()> {
        self.state.heartbeat(worker_id, now, ttl)
    }

    /// Record a cancellation request.
    pub fn request_cancel(&mut self) -> Result<()> {
        self.state.request_cancel()?;
        self.stamp_if_terminal();
        Ok(())
    }

    /// Mark the job completed.
    pub fn complete(&mut self, worker_id: &str) -> Result<()> {
        self.state.complete(worker_id)?;
        self.stamp_if_terminal();
        Ok(())
    }

    /// Confirm a cancellation from the executing worker.
    pub fn cancel_by_worker(&mut self, worker_id: &str) -> Result<()> {
        self.state.cancel_by_worker(worker_id)?;
        self.stamp_if_terminal();
        Ok(())
    }

    /// Mark the job failed.
    pub fn fail(&mut self, worker_id: &str) -> Result<()> {
        self.state.fail(worker_id)?;
        self.stamp_if_terminal();
        Ok(())
    }

    /// Classify an expired lease (reconciler only).
    pub fn check_ownership_expired(&mut self, now: DateTime<Utc>, max_retries: u32) {
        self.state.check_ownership_expired(now, max_retries);
        self.stamp_if_terminal();
    }

    /// Force-cancel a stuck cancellation (reconciler only).
    pub fn cancel_stuck(&mut self, now: DateTime<Utc>, lease_duration: Duration) -> Result<()> {
        self.state.cancel_stuck(now, lease_duration)?;
        self.stamp_if_terminal();
        Ok(())
    }

    /// First entry into a terminal status wins the `completed_at` stamp.
    fn stamp_if_terminal(&mut self) {
        if self.status().is_terminal() {
            self.completed_at.get_or_insert_with(Utc::now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    fn encode_job(input: &str) -> Job {
        Job::new(
            "user-1",
            CreateJobRequest::Encode {
                input: input.to_string(),
            }
            .into_payload(),
        )
    }

    #[test]
    fn test_new_job_is_created() {
        let job = encode_job("abc");
        assert_eq!(job.status(), JobStatus::Created);
        assert_eq!(job.user_id(), "user-1");
        assert_eq!(job.job_type(), JobType::Encode);
        assert!(job.started_at().is_none());
        assert!(job.completed_at().is_none());
    }

    #[test]
    fn test_started_at_first_start_wins() {
        let mut job = encode_job("abc");
        job.enqueue().unwrap();
        assert!(job.try_acquire("worker-1", Utc::now(), TTL));
        job.start("worker-1").unwrap();
        let first = job.started_at().unwrap();

        // A started_at already present is never overwritten.
        job.request_cancel().unwrap();
        job.cancel_by_worker("worker-1").unwrap();
        assert_eq!(job.started_at(), Some(first));
    }

    #[test]
    fn test_completed_at_stamped_once_on_terminal() {
        let mut job = encode_job("abc");
        job.enqueue().unwrap();
        assert!(job.try_acquire("worker-1", Utc::now(), TTL));
        job.start("worker-1").unwrap();
        assert!(job.completed_at().is_none());

        job.complete("worker-1").unwrap();
        let stamped = job.completed_at().unwrap();
        assert!(job.started_at().unwrap() <= stamped);
    }

    #[test]
    fn test_cancel_while_queued_stamps_completed_at() {
        let mut job = encode_job("abc");
        job.enqueue().unwrap();
        job.request_cancel().unwrap();
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(job.completed_at().is_some());
    }

    #[test]
    fn test_cancelling_is_not_stamped() {
        let mut job = encode_job("abc");
        job.enqueue().unwrap();
        assert!(job.try_acquire("worker-1", Utc::now(), TTL));
        job.start("worker-1").unwrap();
        job.request_cancel().unwrap();
        assert_eq!(job.status(), JobStatus::Cancelling);
        assert!(job.completed_at().is_none());
    }

    #[test]
    fn test_create_request_rejects_unknown_type() {
        let result: std::result::Result<CreateJobRequest, _> =
            serde_json::from_str(r#"{"job_type": "transcode", "input": "abc"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_request_rejects_missing_fields() {
        let result: std::result::Result<CreateJobRequest, _> =
            serde_json::from_str(r#"{"job_type": "encode"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_request_builds_fresh_payload() {
        let request: CreateJobRequest =
            serde_json::from_str(r#"{"job_type": "encode", "input": "abc"}"#).unwrap();
        assert_eq!(request.job_type(), JobType::Encode);
        let JobPayload::Encode {
            input,
            cursor,
            produced,
        } = request.into_payload();
        assert_eq!(input, "abc");
        assert_eq!(cursor, 0);
        assert!(produced.is_empty());
    }
}
