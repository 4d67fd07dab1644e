//! Job state machine.
//!
//! Pure transition logic over a job's status, lease and retry fields. No I/O
//! happens here; callers persist the record after a successful transition.
//!
//! The ownership fields form the lease: `owner` and `taken_until` are both
//! set or both cleared, never one without the other. Every transition that
//! demands a worker identity compares it against the stored owner, which is
//! what stops a worker that lost its lease from progressing a job it no
//! longer holds.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{LonghaulError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job record exists but has not been admitted to the queue
    Created,
    /// Job is waiting for a worker to lease it
    Queued,
    /// A worker holds the lease but has not started executing
    Taken,
    /// Job is currently being executed
    Running,
    /// Cancellation was requested while a worker may still be active
    Cancelling,
    /// Job was cancelled
    Cancelled,
    /// Job completed successfully
    Completed,
    /// Job failed permanently
    Failed,
    /// Lease expired without a heartbeat; awaiting retry classification
    Abandoned,
    /// Job is eligible to be leased again after abandonment
    Retrying,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    /// Check if a worker may attempt to lease the job.
    pub fn is_acquirable(&self) -> bool {
        matches!(self, Self::Queued | Self::Retrying)
    }

    /// Check if the job currently holds (or recently held) a lease.
    pub fn is_leased(&self) -> bool {
        matches!(self, Self::Taken | Self::Running | Self::Cancelling)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Queued => write!(f, "queued"),
            Self::Taken => write!(f, "taken"),
            Self::Running => write!(f, "running"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// The state-machine portion of a job record: status, lease and retry count.
///
/// Fields are only mutated through the transition methods below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    status: JobStatus,
    owner: Option<String>,
    taken_until: Option<DateTime<Utc>>,
    retry_count: u32,
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}

impl JobState {
    /// Create a fresh state in `Created`.
    pub fn new() -> Self {
        Self::with_status(JobStatus::Created)
    }

    /// Create a state starting from an arbitrary status (tests, rehydration).
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status,
            owner: None,
            taken_until: None,
            retry_count: 0,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn taken_until(&self) -> Option<DateTime<Utc>> {
        self.taken_until
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Created/Retrying → Queued.
    ///
    /// Retrying is accepted so the reconciler's requeue sweep can push a job
    /// back through the same operation the submission path uses.
    pub fn enqueue(&mut self) -> Result<()> {
        self.ensure(&[JobStatus::Created, JobStatus::Retrying])?;
        self.status = JobStatus::Queued;
        Ok(())
    }

    /// Queued/Retrying → Taken, granting `worker` a lease until `now + ttl`.
    ///
    /// Returns `false` without side effects when the job is not acquirable;
    /// concurrent losers observe nothing. Expiry of previous leases is the
    /// reconciler's business, never checked here.
    pub fn try_acquire(&mut self, worker_id: &str, now: DateTime<Utc>, ttl: Duration) -> bool {
        if !self.status.is_acquirable() {
            return false;
        }

        self.owner = Some(worker_id.to_string());
        self.taken_until = Some(now + lease_ttl(ttl));
        self.status = JobStatus::Taken;
        true
    }

    /// Taken → Running.
    pub fn start(&mut self, worker_id: &str) -> Result<()> {
        self.ensure(&[JobStatus::Taken])?;
        self.ensure_owner(worker_id)?;
        self.status = JobStatus::Running;
        Ok(())
    }

    /// Refresh the lease expiry while Taken/Running/Cancelling.
    pub fn heartbeat(&mut self, worker_id: &str, now: DateTime<Utc>, ttl: Duration) -> Result<()> {
        self.ensure(&[JobStatus::Taken, JobStatus::Running, JobStatus::Cancelling])?;
        self.ensure_owner(worker_id)?;
        self.taken_until = Some(now + lease_ttl(ttl));
        Ok(())
    }

    /// Queued → Cancelled, or Taken/Running → Cancelling.
    ///
    /// Frees the lease immediately in the Cancelling case: the worker may
    /// still be executing, but nothing it does can progress the job through
    /// owner-guarded transitions any more.
    pub fn request_cancel(&mut self) -> Result<()> {
        match self.status {
            JobStatus::Queued => {
                self.status = JobStatus::Cancelled;
            }
            JobStatus::Taken | JobStatus::Running => {
                self.status = JobStatus::Cancelling;
            }
            other => return Err(LonghaulError::invalid_transition(other)),
        }

        self.clear_ownership();
        Ok(())
    }

    /// Abandoned → Retrying.
    pub fn retry(&mut self) -> Result<()> {
        self.ensure(&[JobStatus::Abandoned])?;
        self.status = JobStatus::Retrying;
        Ok(())
    }

    /// Running/Cancelling → Completed.
    pub fn complete(&mut self, worker_id: &str) -> Result<()> {
        self.ensure(&[JobStatus::Running, JobStatus::Cancelling])?;
        self.ensure_owner(worker_id)?;
        self.status = JobStatus::Completed;
        self.clear_ownership();
        Ok(())
    }

    /// Cancelling → Cancelled, confirmed by the executing worker.
    ///
    /// `request_cancel` already freed the lease, so a cleared owner is
    /// accepted here; a different recorded owner is still rejected.
    pub fn cancel_by_worker(&mut self, worker_id: &str) -> Result<()> {
        self.ensure(&[JobStatus::Cancelling])?;
        if let Some(owner) = self.owner.as_deref() {
            if owner != worker_id {
                return Err(LonghaulError::ownership_mismatch(worker_id));
            }
        }
        self.status = JobStatus::Cancelled;
        self.clear_ownership();
        Ok(())
    }

    /// Taken/Running/Cancelling → Failed.
    pub fn fail(&mut self, worker_id: &str) -> Result<()> {
        self.ensure(&[JobStatus::Taken, JobStatus::Running, JobStatus::Cancelling])?;
        self.ensure_owner(worker_id)?;
        self.status = JobStatus::Failed;
        self.clear_ownership();
        Ok(())
    }

    /// Classify an expired lease: Abandoned, then Retrying or Failed.
    ///
    /// Side-effecting; must be invoked by exactly one authority (the
    /// reconciler's reclaim sweep) so two processes never race to increment
    /// `retry_count` for the same expiry. A live or absent lease is a no-op.
    pub fn check_ownership_expired(&mut self, now: DateTime<Utc>, max_retries: u32) {
        let Some(taken_until) = self.taken_until else {
            return;
        };

        if now <= taken_until {
            return;
        }

        if self.status.is_leased() {
            self.status = JobStatus::Abandoned;
            self.clear_ownership();
            self.retry_count += 1;

            if self.retry_count <= max_retries {
                self.status = JobStatus::Retrying;
            } else {
                self.status = JobStatus::Failed;
            }
        }
    }

    /// Force-cancel a Cancelling job whose worker never confirmed.
    ///
    /// Stuck means no owner, or the lease expired more than `lease_duration`
    /// ago. A Cancelling job still actively owned is left alone and the call
    /// fails.
    pub fn cancel_stuck(&mut self, now: DateTime<Utc>, lease_duration: Duration) -> Result<()> {
        if self.status != JobStatus::Cancelling {
            return Err(LonghaulError::invalid_transition(self.status));
        }

        let expired_past_grace = self
            .taken_until
            .map(|until| now > until + lease_ttl(lease_duration))
            .unwrap_or(false);

        if self.owner.is_none() || expired_past_grace {
            self.status = JobStatus::Cancelled;
            self.clear_ownership();
            Ok(())
        } else {
            Err(LonghaulError::new(
                crate::error::ErrorCode::InvalidStateTransition,
                "Cannot force-cancel a job that is still owned by a worker",
            ))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Guards
    // ─────────────────────────────────────────────────────────────────────────

    fn ensure(&self, allowed: &[JobStatus]) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(LonghaulError::invalid_transition(self.status))
        }
    }

    fn ensure_owner(&self, worker_id: &str) -> Result<()> {
        if self.owner.as_deref() == Some(worker_id) {
            Ok(())
        } else {
            Err(LonghaulError::ownership_mismatch(worker_id))
        }
    }

    fn clear_ownership(&mut self) {
        self.owner = None;
        self.taken_until = None;
    }
}

/// Convert a std `Duration` into the chrono span used for lease arithmetic.
fn lease_ttl(ttl: Duration) -> ChronoDuration {
    ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::MAX)
}
