//! Cleanup / reconciler.
//!
//! A periodic loop, independent of any worker, that repairs job records left
//! inconsistent by worker death or incomplete cancellation. Each tick runs
//! three independent sweeps, and each sweep re-validates a job's status
//! after reloading it so the scan's own staleness never drives a repair:
//!
//! 1. Requeue jobs resting in Retrying.
//! 2. Reclaim expired leases: classify abandonment, retry or fail.
//! 3. Force-cancel Cancelling jobs whose worker never confirmed.
//!
//! This loop is the single authority for lease-expiry classification, which
//! keeps `retry_count` from being incremented twice for one expiry.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ReconcilerConfig;
use crate::error::Result;
use crate::jobs::queue::JobQueue;
use crate::jobs::record::Job;
use crate::jobs::repository::JobRepository;
use crate::jobs::state::JobStatus;

/// Periodic repair loop for orphaned and stuck jobs.
pub struct JobReconciler {
    config: ReconcilerConfig,
    queue: Arc<JobQueue>,
    repository: Arc<dyn JobRepository>,
}

impl JobReconciler {
    pub fn new(
        config: ReconcilerConfig,
        queue: Arc<JobQueue>,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            config,
            queue,
            repository,
        }
    }

    /// Run ticks at the configured interval until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!("Job reconciler started");

        loop {
            if let Err(error) = self.tick().await {
                tracing::error!(error = %error, "Error in reconciler tick");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.error_backoff) => continue,
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }
        }

        tracing::info!("Job reconciler stopped");
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        self.requeue_retrying().await?;
        self.reclaim_expired_leases(now).await?;
        self.cancel_stuck(now).await?;
        Ok(())
    }

    /// Push Retrying jobs back through the queue.
    async fn requeue_retrying(&self) -> Result<()> {
        let candidates = self.repository.get_by_status(JobStatus::Retrying).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        tracing::info!(count = candidates.len(), "Requeuing retrying jobs");

        for candidate in candidates {
            if let Err(error) = self.requeue_one(&candidate).await {
                tracing::error!(
                    job_id = %candidate.id(),
                    error = %error,
                    "Failed to requeue job"
                );
            }
        }
        Ok(())
    }

    async fn requeue_one(&self, candidate: &Job) -> Result<()> {
        let Some(mut job) = self.repository.get(candidate.id()).await? else {
            return Ok(());
        };
        if job.status() != JobStatus::Retrying {
            return Ok(());
        }

        job.enqueue()?;
        self.repository.update(job.clone()).await?;
        self.queue.enqueue(job.id()).await?;
        counter!("longhaul_jobs_requeued_total").increment(1);
        tracing::info!(job_id = %job.id(), "Requeued job");
        Ok(())
    }

    /// Classify expired leases on the lease-holding statuses.
    ///
    /// Expired Taken/Running jobs go through the abandonment path (retry or
    /// fail, bounded by the retry budget); expired Cancelling jobs are left
    /// to the stuck sweep so a cancel request can never resurrect work.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<()> {
        for status in [JobStatus::Taken, JobStatus::Running] {
            let candidates = self.repository.get_by_status(status).await?;
            for candidate in candidates {
                if let Err(error) = self.reclaim_one(&candidate, status, now).await {
                    tracing::error!(
                        job_id = %candidate.id(),
                        error = %error,
                        "Failed to process abandoned job"
                    );
                }
            }
        }
        Ok(())
    }

    async fn reclaim_one(
        &self,
        candidate: &Job,
        expected_status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(mut job) = self.repository.get(candidate.id()).await? else {
            return Ok(());
        };
        if job.status() != expected_status {
            return Ok(());
        }

        job.check_ownership_expired(now, self.config.max_retries);

        match job.status() {
            JobStatus::Retrying => {
                self.repository.update(job.clone()).await?;
                self.queue.enqueue(job.id()).await?;
                counter!("longhaul_jobs_reclaimed_total", "outcome" => "retry").increment(1);
                tracing::info!(
                    job_id = %job.id(),
                    retry_count = job.state().retry_count(),
                    "Abandoned job requeued for retry"
                );
            }
            JobStatus::Failed => {
                self.repository.update(job.clone()).await?;
                counter!("longhaul_jobs_reclaimed_total", "outcome" => "fail").increment(1);
                tracing::warn!(
                    job_id = %job.id(),
                    retry_count = job.state().retry_count(),
                    "Abandoned job exceeded retry budget, failed permanently"
                );
            }
            // Lease still live; nothing to repair this tick.
            _ => {}
        }
        Ok(())
    }

    /// Force-cancel Cancelling jobs with no active owner.
    async fn cancel_stuck(&self, now: DateTime<Utc>) -> Result<()> {
        let candidates = self.repository.get_by_status(JobStatus::Cancelling).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        tracing::info!(count = candidates.len(), "Checking cancelling jobs for stuck state");

        for candidate in candidates {
            if let Err(error) = self.cancel_stuck_one(&candidate, now).await {
                tracing::error!(
                    job_id = %candidate.id(),
                    error = %error,
                    "Failed to process stuck job"
                );
            }
        }
        Ok(())
    }

    async fn cancel_stuck_one(&self, candidate: &Job, now: DateTime<Utc>) -> Result<()> {
        let Some(mut job) = self.repository.get(candidate.id()).await? else {
            return Ok(());
        };
        if job.status() != JobStatus::Cancelling {
            return Ok(());
        }

        if job.cancel_stuck(now, self.config.lease_duration).is_ok() {
            self.repository.update(job.clone()).await?;
            counter!("longhaul_jobs_force_cancelled_total").increment(1);
            tracing::info!(job_id = %job.id(), "Cancelled stuck job");
        } else {
            // An owner is still actively heartbeating; leave it alone.
            tracing::debug!(job_id = %job.id(), "Cancelling job still owned, skipping");
        }
        Ok(())
    }
}
