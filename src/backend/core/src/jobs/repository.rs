//! Job persistence seam.
//!
//! The core treats storage as an external collaborator behind the
//! `JobRepository` trait: load the latest record, conditionally write it
//! back. Updates are whole-record last-writer-wins; the state machine's
//! ownership guard is the correctness backstop, so no optimistic-concurrency
//! token is required here.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{ErrorCode, LonghaulError, Result};
use crate::jobs::record::{Job, JobId};
use crate::jobs::state::JobStatus;

/// Trait for job stores.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Load a snapshot of a job by id.
    ///
    /// The returned record is owned by the caller; this is also the
    /// read-only polling path, so it must reflect the latest persisted
    /// write, never another task's in-memory mutations.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Load snapshots of all jobs currently in the given status.
    async fn get_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Persist a new record.
    async fn add(&self, job: Job) -> Result<()>;

    /// Persist the latest version of an existing record.
    ///
    /// Safe to call repeatedly from concurrent heartbeat/lease paths; the
    /// last writer wins.
    async fn update(&self, job: Job) -> Result<()>;
}

/// In-memory repository used by the server binary and tests.
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: DashMap<JobId, Job>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn get_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| entry.value().status() == status)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn add(&self, job: Job) -> Result<()> {
        let id = job.id();
        match self.jobs.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LonghaulError::new(
                ErrorCode::DuplicateJob,
                format!("Job already exists: {}", id),
            )),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(job);
                Ok(())
            }
        }
    }

    async fn update(&self, job: Job) -> Result<()> {
        let id = job.id();
        match self.jobs.get_mut(&id) {
            Some(mut entry) => {
                *entry.value_mut() = job;
                Ok(())
            }
            None => Err(LonghaulError::new(
                ErrorCode::RepositoryError,
                format!("Cannot update unknown job: {}", id),
            )),
        }
    }
}
