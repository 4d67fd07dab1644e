//! Progress delivery to subscribed clients.
//!
//! The core pushes status-change and progress events at a per-(user, job)
//! channel registered by whatever transport is serving the client (an SSE
//! response, a websocket, a test buffer). Delivery is fail-soft: a send that
//! fails because the subscriber went away unregisters the stale entry and is
//! otherwise swallowed; job execution never blocks on a broken sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ProgressConfig;
use crate::jobs::record::JobId;
use crate::jobs::state::JobStatus;

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// An event delivered to a progress subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Emitted once when the subscription is established.
    #[serde(rename_all = "camelCase")]
    Connected { job_id: JobId },

    /// The job's status changed.
    #[serde(rename_all = "camelCase")]
    Status { job_id: JobId, status: JobStatus },

    /// The executor produced a unit of progress.
    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: JobId,
        payload: serde_json::Value,
    },

    /// Periodic liveness signal so dead subscribers are detected.
    #[serde(rename_all = "camelCase")]
    KeepAlive { timestamp: DateTime<Utc> },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notifier Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination for job status and progress events.
///
/// Implementations must fail soft: delivery problems are their own to absorb,
/// never the caller's.
#[async_trait]
pub trait ProgressNotifier: Send + Sync {
    /// Push a status change to whoever is listening for (user, job).
    async fn notify_status(&self, user_id: &str, job_id: JobId, status: JobStatus);

    /// Push a unit of executor progress to whoever is listening for (user, job).
    async fn notify_progress(&self, user_id: &str, job_id: JobId, payload: serde_json::Value);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Channel Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Registry of live subscriber channels keyed by (user, job).
///
/// Supports concurrent registration, lookup and removal. One subscriber per
/// (user, job) pair; a new subscription replaces the previous channel.
pub struct ProgressChannelRegistry {
    connections: DashMap<(String, JobId), mpsc::Sender<ProgressEvent>>,
    buffer: usize,
}

impl ProgressChannelRegistry {
    pub fn new(config: &ProgressConfig) -> Self {
        Self {
            connections: DashMap::new(),
            buffer: config.subscriber_buffer.max(1),
        }
    }

    /// Register a subscriber and hand back its event stream.
    ///
    /// The `Connected` event is already buffered when this returns.
    pub fn subscribe(&self, user_id: &str, job_id: JobId) -> ReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let _ = tx.try_send(ProgressEvent::Connected { job_id });
        self.connections
            .insert((user_id.to_string(), job_id), tx);
        tracing::debug!(user_id, job_id = %job_id, "Progress subscriber registered");
        ReceiverStream::new(rx)
    }

    /// Remove a subscriber, if present.
    pub fn unregister(&self, user_id: &str, job_id: JobId) {
        if self
            .connections
            .remove(&(user_id.to_string(), job_id))
            .is_some()
        {
            tracing::debug!(user_id, job_id = %job_id, "Progress subscriber unregistered");
        }
    }

    /// Whether a subscriber is currently registered for (user, job).
    pub fn is_subscribed(&self, user_id: &str, job_id: JobId) -> bool {
        self.connections
            .contains_key(&(user_id.to_string(), job_id))
    }

    /// Deliver an event; a failed delivery unregisters the stale entry.
    pub async fn send(&self, user_id: &str, job_id: JobId, event: ProgressEvent) {
        let sender = self
            .connections
            .get(&(user_id.to_string(), job_id))
            .map(|entry| entry.value().clone());

        let Some(sender) = sender else {
            tracing::trace!(user_id, job_id = %job_id, "No progress subscriber");
            return;
        };

        if sender.send(event).await.is_err() {
            tracing::debug!(
                user_id,
                job_id = %job_id,
                "Progress delivery failed, dropping stale subscriber"
            );
            self.unregister(user_id, job_id);
        }
    }
}

#[async_trait]
impl ProgressNotifier for ProgressChannelRegistry {
    async fn notify_status(&self, user_id: &str, job_id: JobId, status: JobStatus) {
        self.send(user_id, job_id, ProgressEvent::Status { job_id, status })
            .await;
    }

    async fn notify_progress(&self, user_id: &str, job_id: JobId, payload: serde_json::Value) {
        self.send(user_id, job_id, ProgressEvent::Progress { job_id, payload })
            .await;
    }
}
