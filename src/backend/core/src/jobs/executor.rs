//! Pluggable per-type job execution.
//!
//! Each job type registers a `JobExecutor`. The worker resolves the executor
//! from the registry once a job is leased; a missing registration is a fatal
//! configuration error for that job.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::jobs::record::{Job, JobType};

/// A job shared between the executing task and its heartbeat watcher.
///
/// Lock sections must stay short and never span an await; persistence clones
/// the record out under the lock.
pub type SharedJob = Arc<Mutex<Job>>;

/// Callback invoked for each unit of progress an executor produces.
///
/// The worker's callback re-checks cancellation before emitting, so a slow
/// sink can never swallow a cancellation.
pub type ProgressFn =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Per-type execution strategy.
///
/// Implementations must resume from the payload's stored cursor and advance
/// it incrementally, so re-execution after abandonment continues instead of
/// redoing (and redelivering) finished work.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// The job type this executor handles.
    fn job_type(&self) -> JobType;

    /// Run the job to completion, reporting progress along the way.
    ///
    /// Must return promptly with an error once `cancel` fires.
    async fn execute(
        &self,
        job: SharedJob,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Registry mapping job types to their executors.
///
/// Built once at startup, then shared read-only with the workers.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor; the last registration for a type wins.
    pub fn register(&mut self, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(executor.job_type(), executor);
    }

    /// Resolve the executor for a job type.
    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(&job_type).cloned()
    }

    /// Check whether a job type has a registered executor.
    pub fn contains(&self, job_type: JobType) -> bool {
        self.executors.contains_key(&job_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopExecutor;

    #[async_trait]
    impl JobExecutor for NoopExecutor {
        fn job_type(&self) -> JobType {
            JobType::Encode
        }

        async fn execute(
            &self,
            _job: SharedJob,
            _progress: ProgressFn,
            _cancel: CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ExecutorRegistry::new();
        assert!(!registry.contains(JobType::Encode));

        registry.register(Arc::new(NoopExecutor));
        assert!(registry.contains(JobType::Encode));
        assert!(registry.get(JobType::Encode).is_some());
    }
}
