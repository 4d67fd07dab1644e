//! # Longhaul Core
//!
//! A durable background job core: leasing, heartbeats and reconciliation
//! for long-lived, resumable jobs.
//!
//! ## Architecture
//!
//! - **Job state machine**: legal status transitions enforced under
//!   concurrent access
//! - **Lease protocol**: worker processes compete for the backlog without
//!   double execution
//! - **Heartbeat/expiry**: worker death detected through lease staleness
//! - **Reconciler**: orphaned jobs requeued or failed with bounded retries
//! - **Progress streaming**: status and progress events pushed to
//!   per-(user, job) subscribers

pub mod config;
pub mod error;
pub mod jobs;
pub mod progress;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, LonghaulError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, ErrorSeverity, LonghaulError, Result};
    pub use crate::jobs::{
        CreateJobRequest, ExecutorRegistry, InMemoryJobRepository, InputEncodeExecutor, Job,
        JobExecutor, JobId, JobPayload, JobQueue, JobReconciler, JobRepository, JobService,
        JobState, JobStateView, JobStatus, JobType, JobWorker,
    };
    pub use crate::progress::{ProgressChannelRegistry, ProgressEvent, ProgressNotifier};
}
