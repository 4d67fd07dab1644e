//! Integration tests for the Longhaul job core.
//!
//! These tests drive the public surface end to end: submission through the
//! service, execution on a worker, repair through the reconciler, and
//! progress delivery to subscribers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use longhaul_core::config::{ProgressConfig, ReconcilerConfig, WorkerConfig};
use longhaul_core::error::ErrorCode;
use longhaul_core::jobs::{
    CreateJobRequest, ExecutorRegistry, InMemoryJobRepository, InputEncodeExecutor, Job, JobId,
    JobPayload, JobQueue, JobReconciler, JobRepository, JobService, JobStatus, JobWorker,
};
use longhaul_core::progress::{ProgressChannelRegistry, ProgressEvent, ProgressNotifier};

// ============================================================================
// Test Utilities
// ============================================================================

struct TestApp {
    repository: Arc<InMemoryJobRepository>,
    queue: Arc<JobQueue>,
    progress: Arc<ProgressChannelRegistry>,
    service: JobService,
    reconciler: Arc<JobReconciler>,
    shutdown: CancellationToken,
}

impl TestApp {
    /// Build the full stack with fast test intervals; workers are started
    /// separately so tests control when execution begins.
    fn new(step_delay: Duration) -> Self {
        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(InputEncodeExecutor::new(step_delay)));
        Self::with_executors(executors)
    }

    fn with_executors(executors: ExecutorRegistry) -> Self {
        let repository = Arc::new(InMemoryJobRepository::new());
        let queue = Arc::new(JobQueue::new(64));
        let progress_config = ProgressConfig {
            keep_alive_interval: Duration::from_secs(30),
            ..ProgressConfig::default()
        };
        let progress = Arc::new(ProgressChannelRegistry::new(&progress_config));
        let executors = Arc::new(executors);

        let service = JobService::new(
            repository.clone() as Arc<dyn JobRepository>,
            Arc::clone(&queue),
            Arc::clone(&executors),
            Arc::clone(&progress),
            &progress_config,
        );
        let reconciler = Arc::new(JobReconciler::new(
            ReconcilerConfig {
                sweep_interval: Duration::from_secs(300),
                lease_duration: Duration::from_secs(300),
                max_retries: 3,
                error_backoff: Duration::from_secs(5),
            },
            Arc::clone(&queue),
            repository.clone() as Arc<dyn JobRepository>,
        ));

        let app = Self {
            repository,
            queue,
            progress,
            service,
            reconciler,
            shutdown: CancellationToken::new(),
        };
        app.spawn_worker_with_executors(executors, "worker-a");
        app
    }

    fn spawn_worker_with_executors(&self, executors: Arc<ExecutorRegistry>, worker_id: &str) {
        let worker = Arc::new(JobWorker::new(
            WorkerConfig {
                worker_id: Some(worker_id.to_string()),
                count: 1,
                heartbeat_interval: Duration::from_secs(60),
                lease_duration: Duration::from_secs(300),
                cancel_poll_interval: Duration::from_millis(200),
                error_backoff: Duration::from_millis(100),
            },
            Arc::clone(&self.queue),
            self.repository.clone() as Arc<dyn JobRepository>,
            executors,
            self.progress.clone() as Arc<dyn ProgressNotifier>,
        ));
        tokio::spawn(worker.run(self.shutdown.clone()));
    }

    async fn wait_for_status(&self, job_id: JobId, status: JobStatus) -> Job {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                if let Some(job) = self.repository.get(job_id).await.unwrap() {
                    if job.status() == status {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("job never reached expected status")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn encode_request(input: &str) -> CreateJobRequest {
    CreateJobRequest::Encode {
        input: input.to_string(),
    }
}

// ============================================================================
// Submission → Execution → Completion
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_submitted_job_runs_to_completion() {
    let app = TestApp::new(Duration::ZERO);

    let job_id = app.service.submit("user-1", encode_request("aab")).await.unwrap();
    let view = app.service.get_state("user-1", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Queued);

    app.wait_for_status(job_id, JobStatus::Completed).await;

    let view = app.service.get_state("user-1", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert!(view.started_at.is_some());
    assert!(view.completed_at.is_some());
    assert!(view.started_at.unwrap() <= view.completed_at.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_progress_stream_carries_status_and_output() {
    let app = TestApp::new(Duration::ZERO);

    // No await point yields between submit and subscribe on this runtime,
    // so the subscription is registered before the worker can lease the job.
    let job_id = app.service.submit("user-1", encode_request("aab")).await.unwrap();
    let mut stream = app.service.subscribe("user-1", job_id).await.unwrap();

    app.wait_for_status(job_id, JobStatus::Completed).await;

    assert_eq!(
        stream.next().await,
        Some(ProgressEvent::Connected { job_id })
    );

    let mut produced = String::new();
    let mut statuses = Vec::new();
    while let Some(event) = stream.next().await {
        match event {
            ProgressEvent::Progress { payload, .. } => {
                produced.push_str(payload.as_str().unwrap());
            }
            ProgressEvent::Status { status, .. } => {
                statuses.push(status);
                if status == JobStatus::Completed {
                    break;
                }
            }
            _ => {}
        }
    }
    assert_eq!(produced, "2a1b/YWFi");
    assert_eq!(statuses, vec![JobStatus::Running, JobStatus::Completed]);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_queued_job_never_leases() {
    // No yielding between submit and cancel: the worker cannot have leased.
    let app = TestApp::new(Duration::from_secs(3600));

    let job_id = app.service.submit("user-1", encode_request("aab")).await.unwrap();
    app.service.request_cancel("user-1", job_id).await.unwrap();

    let view = app.service.get_state("user-1", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    assert!(view.completed_at.is_some());

    let job = app.repository.get(job_id).await.unwrap().unwrap();
    assert!(job.state().owner().is_none());
    assert!(job.started_at().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_job_is_confirmed_by_worker() {
    // A huge step delay parks the executor after its first character.
    let app = TestApp::new(Duration::from_secs(3600));

    let job_id = app.service.submit("user-1", encode_request("aab")).await.unwrap();
    app.wait_for_status(job_id, JobStatus::Running).await;

    app.service.request_cancel("user-1", job_id).await.unwrap();
    let view = app.service.get_state("user-1", job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Cancelling);

    // The worker's poll observes the request, halts and confirms.
    let job = app.wait_for_status(job_id, JobStatus::Cancelled).await;
    assert!(job.completed_at().is_some());
    assert!(job.state().owner().is_none());
}

// ============================================================================
// Abandonment and Reconciliation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_abandoned_job_retries_and_completes() {
    let app = TestApp::new(Duration::ZERO);

    // A job leased in the past by a worker that died before renewing; the
    // first two output characters were already produced and delivered.
    let mut job = Job::new("user-1", encode_request("aab").into_payload());
    job.enqueue().unwrap();
    let leased_at = Utc::now() - chrono::Duration::seconds(10);
    assert!(job.try_acquire("dead-worker", leased_at, Duration::ZERO));
    job.start("dead-worker").unwrap();
    let JobPayload::Encode {
        cursor, produced, ..
    } = job.payload_mut();
    *cursor = 2;
    *produced = "2a".to_string();
    let job_id = job.id();
    app.repository.add(job).await.unwrap();

    app.reconciler.tick().await.unwrap();

    let reclaimed = app.repository.get(job_id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status(), JobStatus::Retrying);
    assert_eq!(reclaimed.state().retry_count(), 1);

    // The queue now redelivers the id to the live worker.
    let job = app.wait_for_status(job_id, JobStatus::Completed).await;
    assert!(job.completed_at().is_some());
}

#[tokio::test]
async fn test_stuck_cancellation_is_force_cancelled() {
    let app = TestApp::new(Duration::ZERO);

    // Cancel was requested while a (now dead) worker was running; nobody
    // ever confirmed.
    let mut job = Job::new("user-1", encode_request("aab").into_payload());
    job.enqueue().unwrap();
    assert!(job.try_acquire("dead-worker", Utc::now(), Duration::from_secs(300)));
    job.start("dead-worker").unwrap();
    job.request_cancel().unwrap();
    assert_eq!(job.status(), JobStatus::Cancelling);
    let job_id = job.id();
    app.repository.add(job).await.unwrap();

    app.reconciler.tick().await.unwrap();

    let job = app.repository.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Cancelled);
    assert!(job.completed_at().is_some());
}

// ============================================================================
// Error Surfaces
// ============================================================================

#[tokio::test]
async fn test_submit_unregistered_job_type_is_rejected() {
    let app = TestApp::with_executors(ExecutorRegistry::new());

    let err = app
        .service
        .submit("user-1", encode_request("aab"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownJobType);
}

#[tokio::test]
async fn test_foreign_user_cannot_touch_job() {
    let app = TestApp::new(Duration::from_secs(3600));
    let job_id = app.service.submit("user-1", encode_request("aab")).await.unwrap();

    let err = app
        .service
        .get_state("intruder", job_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UserMismatch);

    let err = app
        .service
        .request_cancel("intruder", job_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UserMismatch);
}

#[tokio::test]
async fn test_unknown_job_id_is_not_found() {
    let app = TestApp::new(Duration::ZERO);

    let err = app
        .service
        .get_state("user-1", JobId::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotFound);
}
