//! Job service façade.
//!
//! The contracts this core exposes to its out-of-scope collaborators
//! (submission, cancellation, state query, progress subscription), expressed
//! as plain methods the transport layer calls into. Every operation on an
//! existing job verifies the requesting principal against the record's
//! owner before touching it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ProgressConfig;
use crate::error::{ErrorCode, LonghaulError, Result};
use crate::jobs::executor::ExecutorRegistry;
use crate::jobs::queue::JobQueue;
use crate::jobs::record::{CreateJobRequest, Job, JobId};
use crate::jobs::repository::JobRepository;
use crate::jobs::state::JobStatus;
use crate::progress::{ProgressChannelRegistry, ProgressEvent};

/// Read-only view of a job's lifecycle, returned by the state query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStateView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStateView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id(),
            status: job.status(),
            created_at: job.created_at(),
            started_at: job.started_at(),
            completed_at: job.completed_at(),
        }
    }
}

/// Entry point for clients of the job core.
pub struct JobService {
    repository: Arc<dyn JobRepository>,
    queue: Arc<JobQueue>,
    executors: Arc<ExecutorRegistry>,
    progress: Arc<ProgressChannelRegistry>,
    keep_alive_interval: Duration,
}

impl JobService {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        queue: Arc<JobQueue>,
        executors: Arc<ExecutorRegistry>,
        progress: Arc<ProgressChannelRegistry>,
        config: &ProgressConfig,
    ) -> Self {
        Self {
            repository,
            queue,
            executors,
            progress,
            keep_alive_interval: config.keep_alive_interval,
        }
    }

    /// Create a job, persist it and admit it to the queue.
    ///
    /// Job types with no registered executor are rejected up front rather
    /// than failing later on a worker.
    pub async fn submit(&self, user_id: &str, request: CreateJobRequest) -> Result<JobId> {
        let job_type = request.job_type();
        if !self.executors.contains(job_type) {
            return Err(LonghaulError::new(
                ErrorCode::UnknownJobType,
                format!("Unknown job type: {}", job_type),
            ));
        }

        let mut job = Job::new(user_id, request.into_payload());
        job.enqueue()?;
        let job_id = job.id();

        self.repository.add(job).await?;
        self.queue.enqueue(job_id).await?;

        tracing::info!(
            job_id = %job_id,
            job_type = %job_type,
            user_id,
            "Created job"
        );
        Ok(job_id)
    }

    /// Record a cancellation request for a job owned by `user_id`.
    pub async fn request_cancel(&self, user_id: &str, job_id: JobId) -> Result<()> {
        let mut job = self.load_owned(user_id, job_id).await?;
        job.request_cancel()?;
        self.repository.update(job).await?;

        tracing::info!(job_id = %job_id, user_id, "Cancellation requested");
        Ok(())
    }

    /// Return the job's status and timestamps.
    pub async fn get_state(&self, user_id: &str, job_id: JobId) -> Result<JobStateView> {
        let job = self.load_owned(user_id, job_id).await?;
        Ok(JobStateView::from(&job))
    }

    /// Subscribe to a job's status and progress events.
    ///
    /// The stream starts with a `Connected` event, then carries `Status` and
    /// `Progress` events as they occur, interleaved with periodic
    /// `KeepAlive`s so a dead subscriber is detected. The keep-alive watcher
    /// ends the subscription once the job reaches a terminal status or the
    /// subscriber goes away.
    pub async fn subscribe(
        &self,
        user_id: &str,
        job_id: JobId,
    ) -> Result<ReceiverStream<ProgressEvent>> {
        self.load_owned(user_id, job_id).await?;

        let stream = self.progress.subscribe(user_id, job_id);

        tokio::spawn(keep_alive_loop(
            Arc::clone(&self.repository),
            Arc::clone(&self.progress),
            user_id.to_string(),
            job_id,
            self.keep_alive_interval,
        ));

        Ok(stream)
    }

    async fn load_owned(&self, user_id: &str, job_id: JobId) -> Result<Job> {
        let job = self
            .repository
            .get(job_id)
            .await?
            .ok_or_else(|| LonghaulError::job_not_found(job_id))?;

        if job.user_id() != user_id {
            return Err(LonghaulError::user_mismatch(user_id, job_id));
        }
        Ok(job)
    }
}

/// Emit keep-alives until the job finishes or the subscriber disconnects.
async fn keep_alive_loop(
    repository: Arc<dyn JobRepository>,
    progress: Arc<ProgressChannelRegistry>,
    user_id: String,
    job_id: JobId,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;

        if !progress.is_subscribed(&user_id, job_id) {
            break;
        }

        match repository.get(job_id).await {
            Ok(Some(job)) if !job.status().is_terminal() => {}
            // Job finished or vanished: close the stream.
            _ => break,
        }

        progress
            .send(
                &user_id,
                job_id,
                ProgressEvent::KeepAlive {
                    timestamp: Utc::now(),
                },
            )
            .await;
    }

    progress.unregister(&user_id, job_id);
    tracing::debug!(user_id = %user_id, job_id = %job_id, "Progress subscription closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::encode::InputEncodeExecutor;
    use crate::jobs::repository::InMemoryJobRepository;
    use tokio_stream::StreamExt;

    struct Harness {
        service: JobService,
        repository: Arc<InMemoryJobRepository>,
        queue: Arc<JobQueue>,
    }

    fn harness() -> Harness {
        harness_with_keep_alive(Duration::from_secs(30))
    }

    fn harness_with_keep_alive(keep_alive: Duration) -> Harness {
        let repository = Arc::new(InMemoryJobRepository::new());
        let queue = Arc::new(JobQueue::new(16));
        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(InputEncodeExecutor::new(Duration::ZERO)));
        let progress_config = ProgressConfig {
            keep_alive_interval: keep_alive,
            ..ProgressConfig::default()
        };
        let progress = Arc::new(ProgressChannelRegistry::new(&progress_config));

        let service = JobService::new(
            repository.clone() as Arc<dyn JobRepository>,
            Arc::clone(&queue),
            Arc::new(executors),
            progress,
            &progress_config,
        );
        Harness {
            service,
            repository,
            queue,
        }
    }

    fn encode_request(input: &str) -> CreateJobRequest {
        CreateJobRequest::Encode {
            input: input.to_string(),
        }
    }

    #[tokio::test]
    async fn test_submit_creates_queued_job() {
        let harness = harness();
        let job_id = harness
            .service
            .submit("user-1", encode_request("aab"))
            .await
            .unwrap();

        let job = harness.repository.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.user_id(), "user-1");
        assert_eq!(harness.queue.dequeue().await.unwrap(), job_id);
    }

    #[tokio::test]
    async fn test_submit_rejects_unregistered_job_type() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let queue = Arc::new(JobQueue::new(16));
        let progress_config = ProgressConfig::default();
        let service = JobService::new(
            repository as Arc<dyn JobRepository>,
            queue,
            Arc::new(ExecutorRegistry::new()),
            Arc::new(ProgressChannelRegistry::new(&progress_config)),
            &progress_config,
        );

        let err = service
            .submit("user-1", encode_request("aab"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownJobType);
    }

    #[tokio::test]
    async fn test_cancel_queued_job_goes_terminal() {
        let harness = harness();
        let job_id = harness
            .service
            .submit("user-1", encode_request("aab"))
            .await
            .unwrap();

        harness
            .service
            .request_cancel("user-1", job_id)
            .await
            .unwrap();

        let view = harness.service.get_state("user-1", job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert!(view.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_not_found() {
        let harness = harness();
        let err = harness
            .service
            .request_cancel("user-1", JobId::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn test_operations_reject_other_users() {
        let harness = harness();
        let job_id = harness
            .service
            .submit("user-1", encode_request("aab"))
            .await
            .unwrap();

        let err = harness
            .service
            .request_cancel("user-2", job_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserMismatch);

        let err = harness
            .service
            .get_state("user-2", job_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserMismatch);

        let err = harness
            .service
            .subscribe("user-2", job_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserMismatch);

        // The record is untouched by the rejected cancel.
        let view = harness.service.get_state("user-1", job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_get_state_reports_timestamps() {
        let harness = harness();
        let job_id = harness
            .service
            .submit("user-1", encode_request("aab"))
            .await
            .unwrap();

        let view = harness.service.get_state("user-1", job_id).await.unwrap();
        assert_eq!(view.job_id, job_id);
        assert_eq!(view.status, JobStatus::Queued);
        assert!(view.started_at.is_none());
        assert!(view.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_emits_connected_first() {
        let harness = harness();
        let job_id = harness
            .service
            .submit("user-1", encode_request("aab"))
            .await
            .unwrap();

        let mut stream = harness.service.subscribe("user-1", job_id).await.unwrap();
        assert_eq!(
            stream.next().await,
            Some(ProgressEvent::Connected { job_id })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alives_flow_until_terminal() {
        let harness = harness_with_keep_alive(Duration::from_secs(1));
        let job_id = harness
            .service
            .submit("user-1", encode_request("aab"))
            .await
            .unwrap();

        let mut stream = harness.service.subscribe("user-1", job_id).await.unwrap();
        assert_eq!(
            stream.next().await,
            Some(ProgressEvent::Connected { job_id })
        );

        // Two keep-alive windows pass while the job sits in the queue.
        let event = stream.next().await.unwrap();
        assert!(matches!(event, ProgressEvent::KeepAlive { .. }));

        // Once the job goes terminal the watcher closes the stream.
        harness
            .service
            .request_cancel("user-1", job_id)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match stream.next().await {
                    Some(ProgressEvent::KeepAlive { .. }) => continue,
                    Some(other) => panic!("unexpected event: {:?}", other),
                    None => break,
                }
            }
        })
        .await
        .expect("stream never closed after terminal status");
    }
}
