//! Longhaul Server - Main entry point
//!
//! Wires the job core together: repository, queue, executor registry,
//! progress registry, worker loops and the reconciler, all driven by a
//! shared cancellation token and a signal-based graceful shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use longhaul_core::{
    config::Config,
    jobs::{
        ExecutorRegistry, InMemoryJobRepository, InputEncodeExecutor, JobQueue, JobReconciler,
        JobRepository, JobService, JobWorker,
    },
    progress::{ProgressChannelRegistry, ProgressNotifier},
    telemetry::{self, LoggingConfig},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize logging
    let environment =
        std::env::var("LONGHAUL_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    telemetry::init_logging(
        &LoggingConfig {
            level: config.observability.log_level.clone(),
            format: if config.observability.json_logging {
                telemetry::LogFormat::Json
            } else {
                telemetry::LogFormat::Pretty
            },
            ..LoggingConfig::default()
        },
        &environment,
    )?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Longhaul Server"
    );

    // Explicit construction and dependency passing; no container.
    let repository: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
    let queue = Arc::new(JobQueue::new(config.queue.capacity));

    let mut executors = ExecutorRegistry::new();
    executors.register(Arc::new(InputEncodeExecutor::default()));
    let executors = Arc::new(executors);

    let progress = Arc::new(ProgressChannelRegistry::new(&config.progress));

    // The submission/cancel/query/subscribe surface; the out-of-scope
    // transport layer embedding this process calls into it.
    let _service = JobService::new(
        Arc::clone(&repository),
        Arc::clone(&queue),
        Arc::clone(&executors),
        Arc::clone(&progress),
        &config.progress,
    );

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    // Worker loops
    for index in 0..config.worker.count.max(1) {
        let mut worker_config = config.worker.clone();
        if let Some(base) = worker_config.worker_id.as_ref() {
            worker_config.worker_id = Some(format!("{}-{}", base, index));
        }
        let worker = Arc::new(JobWorker::new(
            worker_config,
            Arc::clone(&queue),
            Arc::clone(&repository),
            Arc::clone(&executors),
            Arc::clone(&progress) as Arc<dyn ProgressNotifier>,
        ));
        tracing::info!(worker_id = %worker.worker_id(), "Spawning job worker");
        tasks.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    // Reconciler
    let reconciler = Arc::new(JobReconciler::new(
        config.reconciler.clone(),
        Arc::clone(&queue),
        Arc::clone(&repository),
    ));
    tasks.push(tokio::spawn(reconciler.run(shutdown.clone())));

    // Wait for shutdown signal, then stop accepting and drain.
    shutdown_signal().await;
    shutdown.cancel();
    queue.close().await;

    for task in tasks {
        let _ = task.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
