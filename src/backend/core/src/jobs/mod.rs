//! Background job core.
//!
//! Long-lived, resumable jobs tracked through a durable state machine:
//!
//! - **Record**: job envelope plus a tagged per-type payload
//! - **State machine**: pure transition logic with lease and retry fields
//! - **Queue**: bounded in-process dispatch channel
//! - **Executor**: pluggable per-type execution with cursor-based resumption
//! - **Worker**: lease, run under heartbeat and cancellation watch, finalize
//! - **Reconciler**: periodic repair of orphaned and stuck jobs
//!
//! # Architecture
//!
//! ```text
//!  submit ──▶ Job record ──▶ Queue ──▶ Worker ──▶ Executor ──▶ Progress sink
//!                 ▲                      │ lease + heartbeat
//!                 │                      ▼
//!                 └────────────── Reconciler (requeue / reclaim / cancel)
//! ```
//!
//! Multiple workers compete for the same backlog; the lease protocol in the
//! state machine guarantees at most one of them ever executes a given job at
//! a time, and the reconciler requeues work whose owner died.

pub mod encode;
pub mod executor;
pub mod queue;
pub mod record;
pub mod reconciler;
pub mod repository;
pub mod service;
pub mod state;
pub mod worker;

pub use encode::InputEncodeExecutor;
pub use executor::{ExecutorRegistry, JobExecutor, ProgressFn, SharedJob};
pub use queue::JobQueue;
pub use record::{CreateJobRequest, Job, JobId, JobPayload, JobType};
pub use reconciler::JobReconciler;
pub use repository::{InMemoryJobRepository, JobRepository};
pub use service::{JobService, JobStateView};
pub use state::{JobState, JobStatus};
pub use worker::JobWorker;
