//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Reconciler configuration
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Progress streaming configuration
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Configuration for the job worker loop.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Worker identity; generated from a random suffix when unset
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Number of worker loops to run
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Interval between lease renewals
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Lease time-to-live granted on acquisition and renewal
    #[serde(default = "default_lease_duration", with = "humantime_serde")]
    pub lease_duration: Duration,

    /// Interval between cancellation-status polls
    #[serde(default = "default_cancel_poll_interval", with = "humantime_serde")]
    pub cancel_poll_interval: Duration,

    /// Backoff applied after a dequeue-loop failure
    #[serde(default = "default_error_backoff", with = "humantime_serde")]
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            count: default_worker_count(),
            heartbeat_interval: default_heartbeat_interval(),
            lease_duration: default_lease_duration(),
            cancel_poll_interval: default_cancel_poll_interval(),
            error_backoff: default_error_backoff(),
        }
    }
}

/// Configuration for the cleanup/reconciler loop.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Interval between reconciliation ticks
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Lease duration used when classifying stuck cancellations
    #[serde(default = "default_lease_duration", with = "humantime_serde")]
    pub lease_duration: Duration,

    /// Maximum abandonment-driven retries before a job fails permanently
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff applied after a tick failure
    #[serde(default = "default_error_backoff", with = "humantime_serde")]
    pub error_backoff: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            lease_duration: default_lease_duration(),
            max_retries: default_max_retries(),
            error_backoff: default_error_backoff(),
        }
    }
}

/// Configuration for the in-process job queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Channel capacity; a full queue blocks submission (backpressure)
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

/// Configuration for progress subscriptions.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    /// Interval between keep-alive events on an open subscription
    #[serde(default = "default_keep_alive_interval", with = "humantime_serde")]
    pub keep_alive_interval: Duration,

    /// Per-subscriber event buffer size
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: default_keep_alive_interval(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_worker_count() -> usize { 1 }
fn default_heartbeat_interval() -> Duration { Duration::from_secs(300) }
fn default_lease_duration() -> Duration { Duration::from_secs(300) }
fn default_cancel_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_error_backoff() -> Duration { Duration::from_secs(5) }
fn default_sweep_interval() -> Duration { Duration::from_secs(300) }
fn default_max_retries() -> u32 { 3 }
fn default_queue_capacity() -> usize { 1000 }
fn default_keep_alive_interval() -> Duration { Duration::from_secs(30) }
fn default_subscriber_buffer() -> usize { 64 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("LONGHAUL").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("LONGHAUL").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.worker.count, 1);
        assert_eq!(config.worker.heartbeat_interval, Duration::from_secs(300));
        assert_eq!(config.worker.lease_duration, Duration::from_secs(300));
        assert_eq!(config.worker.cancel_poll_interval, Duration::from_secs(1));
        assert_eq!(config.reconciler.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.reconciler.max_retries, 3);
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.progress.keep_alive_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_durations_deserialize_from_humantime() {
        let worker: WorkerConfig =
            serde_json::from_str(r#"{"heartbeat_interval": "5m", "lease_duration": "90s"}"#)
                .unwrap();
        assert_eq!(worker.heartbeat_interval, Duration::from_secs(300));
        assert_eq!(worker.lease_duration, Duration::from_secs(90));
    }
}
