//! Job worker (execution loop).
//!
//! One loop per worker process: dequeue a job id, spawn an isolated task for
//! it, and keep serving. Inside the task the worker leases the job, runs the
//! registered executor under a heartbeat ticker and a cancellation poller,
//! then persists the terminal outcome. Failures are contained per job; the
//! loop itself only ever backs off and continues.

use chrono::Utc;
use futures::FutureExt;
use metrics::counter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{ErrorCode, LonghaulError, Result};
use crate::jobs::executor::{ExecutorRegistry, ProgressFn, SharedJob};
use crate::jobs::queue::JobQueue;
use crate::jobs::record::JobId;
use crate::jobs::repository::JobRepository;
use crate::jobs::state::JobStatus;
use crate::progress::ProgressNotifier;

/// A worker competing for jobs on the shared queue.
pub struct JobWorker {
    worker_id: String,
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    repository: Arc<dyn JobRepository>,
    executors: Arc<ExecutorRegistry>,
    notifier: Arc<dyn ProgressNotifier>,
}

impl JobWorker {
    /// Create a worker; identity comes from config or a generated suffix.
    pub fn new(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        repository: Arc<dyn JobRepository>,
        executors: Arc<ExecutorRegistry>,
        notifier: Arc<dyn ProgressNotifier>,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()));
        Self {
            worker_id,
            config,
            queue,
            repository,
            executors,
            notifier,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run the dequeue loop until shutdown or queue closure.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(worker_id = %self.worker_id, "Job worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(worker_id = %self.worker_id, "Job worker is stopping");
                    break;
                }
                dequeued = self.queue.dequeue() => match dequeued {
                    Ok(job_id) => {
                        let worker = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            worker.process_job(job_id, shutdown).await;
                        });
                    }
                    Err(error) if error.code() == ErrorCode::QueueClosed => {
                        tracing::info!(worker_id = %self.worker_id, "Job queue closed");
                        break;
                    }
                    Err(error) => {
                        tracing::error!(
                            worker_id = %self.worker_id,
                            error = %error,
                            "Error in worker main loop"
                        );
                        tokio::time::sleep(self.config.error_backoff).await;
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Job worker stopped");
    }

    /// Per-job task boundary: unexpected errors are logged and the job is
    /// best-effort marked failed; nothing propagates to the loop.
    async fn process_job(&self, job_id: JobId, shutdown: CancellationToken) {
        if let Err(error) = self.run_job(job_id, shutdown).await {
            tracing::error!(
                worker_id = %self.worker_id,
                job_id = %job_id,
                error = %error,
                "Error processing job"
            );
            self.mark_failed_best_effort(job_id).await;
        }
    }

    async fn run_job(&self, job_id: JobId, shutdown: CancellationToken) -> Result<()> {
        let Some(mut job) = self.repository.get(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Job not found, skipping");
            return Ok(());
        };

        // Stale redelivery: someone else already progressed this job.
        if !job.status().is_acquirable() {
            tracing::info!(
                job_id = %job_id,
                status = %job.status(),
                "Job is not acquirable, skipping"
            );
            return Ok(());
        }

        let now = Utc::now();
        if !job.try_acquire(&self.worker_id, now, self.config.lease_duration) {
            tracing::info!(job_id = %job_id, status = %job.status(), "Failed to acquire job");
            return Ok(());
        }
        self.repository.update(job.clone()).await?;
        tracing::info!(worker_id = %self.worker_id, job_id = %job_id, "Acquired job");

        job.start(&self.worker_id)?;
        self.repository.update(job.clone()).await?;
        self.notifier
            .notify_status(job.user_id(), job_id, job.status())
            .await;

        let Some(executor) = self.executors.get(job.job_type()) else {
            // Fatal configuration error for this job only; never retried.
            LonghaulError::new(
                ErrorCode::UnknownJobType,
                format!("No executor registered for job type: {}", job.job_type()),
            )
            .log();
            let user_id = job.user_id().to_string();
            job.fail(&self.worker_id)?;
            self.repository.update(job.clone()).await?;
            self.notifier
                .notify_status(&user_id, job_id, job.status())
                .await;
            counter!("longhaul_jobs_failed_total", "reason" => "unknown_job_type").increment(1);
            return Ok(());
        };

        let user_id = job.user_id().to_string();
        let shared: SharedJob = Arc::new(Mutex::new(job));

        // Two watchers with different lifetimes: the execution token is fired
        // by the cancellation poller (or shutdown), while the heartbeat keeps
        // renewing until the job task finalizes.
        let exec_token = shutdown.child_token();
        let heartbeat_token = shutdown.child_token();

        let heartbeat_handle = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.repository),
            Arc::clone(&shared),
            self.worker_id.clone(),
            self.config.heartbeat_interval,
            self.config.lease_duration,
            heartbeat_token.clone(),
        ));
        let watch_handle = tokio::spawn(cancellation_watch(
            Arc::clone(&self.repository),
            job_id,
            self.config.cancel_poll_interval,
            exec_token.clone(),
        ));

        let progress = self.progress_callback(&user_id, job_id, exec_token.clone());
        let result = executor
            .execute(Arc::clone(&shared), progress, exec_token.clone())
            .await;

        exec_token.cancel();
        heartbeat_token.cancel();
        let _ = watch_handle.await;
        let _ = heartbeat_handle.await;

        match result {
            Ok(()) => {
                let mut job = shared.lock().clone();
                job.complete(&self.worker_id)?;
                self.repository.update(job.clone()).await?;
                self.notifier
                    .notify_status(&user_id, job_id, job.status())
                    .await;
                counter!("longhaul_jobs_completed_total").increment(1);
                tracing::info!(worker_id = %self.worker_id, job_id = %job_id, "Completed job");
            }
            Err(error) if error.code() == ErrorCode::ExecutionCancelled => {
                // Confirm against the authoritative record, not the in-memory
                // copy: the reconciler may have finalized it already, and a
                // process shutdown fires the same token without any
                // cancellation having been requested.
                let Some(mut fresh) = self.repository.get(job_id).await? else {
                    return Ok(());
                };
                if fresh.status() == JobStatus::Cancelling {
                    *fresh.payload_mut() = shared.lock().payload().clone();
                    fresh.cancel_by_worker(&self.worker_id)?;
                    self.repository.update(fresh.clone()).await?;
                    self.notifier
                        .notify_status(&user_id, job_id, fresh.status())
                        .await;
                    counter!("longhaul_jobs_cancelled_total").increment(1);
                    tracing::info!(worker_id = %self.worker_id, job_id = %job_id, "Cancelled job");
                }
            }
            Err(error) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    job_id = %job_id,
                    error = %error,
                    "Error executing job"
                );
                let mut job = shared.lock().clone();
                job.fail(&self.worker_id)?;
                self.repository.update(job.clone()).await?;
                self.notifier
                    .notify_status(&user_id, job_id, job.status())
                    .await;
                counter!("longhaul_jobs_failed_total", "reason" => "executor_error").increment(1);
            }
        }

        Ok(())
    }

    /// Forward executor progress to the sink, re-checking cancellation first
    /// so a slow sink can never swallow a cancel.
    fn progress_callback(
        &self,
        user_id: &str,
        job_id: JobId,
        exec_token: CancellationToken,
    ) -> ProgressFn {
        let notifier = Arc::clone(&self.notifier);
        let user_id = user_id.to_string();
        Arc::new(move |payload| {
            let notifier = Arc::clone(&notifier);
            let user_id = user_id.clone();
            let exec_token = exec_token.clone();
            async move {
                if exec_token.is_cancelled() {
                    return Err(LonghaulError::cancelled());
                }
                notifier.notify_progress(&user_id, job_id, payload).await;
                Ok(())
            }
            .boxed()
        })
    }

    /// Secondary failures here are logged and swallowed; the reconciler is
    /// the backstop.
    async fn mark_failed_best_effort(&self, job_id: JobId) {
        let Ok(Some(mut job)) = self.repository.get(job_id).await else {
            return;
        };
        if job.fail(&self.worker_id).is_err() {
            return;
        }
        match self.repository.update(job.clone()).await {
            Ok(()) => {
                self.notifier
                    .notify_status(job.user_id(), job_id, job.status())
                    .await;
            }
            Err(error) => {
                tracing::error!(
                    job_id = %job_id,
                    error = %error,
                    "Failed to update job status after error"
                );
            }
        }
    }
}

/// Renew the lease at a fixed interval until told to stop.
///
/// Renewal is a read-modify-write against a fresh record: once a cancel
/// request (or reclamation) has freed the lease, the ownership guard fails
/// and the ticker stops instead of resurrecting the old lease. Each renewal
/// also checkpoints the executor's latest payload cursor.
async fn heartbeat_loop(
    repository: Arc<dyn JobRepository>,
    shared: SharedJob,
    worker_id: String,
    interval: Duration,
    lease_duration: Duration,
    token: CancellationToken,
) {
    let job_id = shared.lock().id();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let fresh = match repository.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(error) => {
                tracing::error!(job_id = %job_id, error = %error, "Heartbeat load failed");
                continue;
            }
        };

        let mut fresh = fresh;
        if let Err(error) = fresh.heartbeat(&worker_id, Utc::now(), lease_duration) {
            tracing::debug!(
                job_id = %job_id,
                error = %error,
                "Lease no longer renewable, stopping heartbeat"
            );
            break;
        }

        *fresh.payload_mut() = shared.lock().payload().clone();
        if let Err(error) = repository.update(fresh).await {
            tracing::error!(job_id = %job_id, error = %error, "Heartbeat update failed");
            continue;
        }
        tracing::trace!(job_id = %job_id, worker_id = %worker_id, "Heartbeat");
    }
}

/// Poll the authoritative record and fire the execution token when a
/// cancellation request is observed.
async fn cancellation_watch(
    repository: Arc<dyn JobRepository>,
    job_id: JobId,
    poll_interval: Duration,
    exec_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = exec_token.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        match repository.get(job_id).await {
            Ok(Some(job)) if job.status() == JobStatus::Cancelling => {
                tracing::info!(job_id = %job_id, "Cancellation requested, stopping execution");
                exec_token.cancel();
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(job_id = %job_id, error = %error, "Cancellation poll failed");
            }
        }
    }
}
