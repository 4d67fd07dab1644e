//! In-process job dispatch queue.
//!
//! A bounded FIFO channel of job ids between the submission path and the
//! worker loops. A full channel makes `enqueue` wait, pushing backpressure
//! onto submission instead of dropping work. Ids may be re-enqueued by the
//! reconciler; redelivery is harmless because the lease protocol gates
//! actual execution.

use tokio::sync::{mpsc, Mutex};

use crate::error::{ErrorCode, LonghaulError, Result};
use crate::jobs::record::JobId;

/// Bounded FIFO queue of job ids.
///
/// `dequeue` hands each id to exactly one caller; concurrent workers share
/// the single receiver behind an async mutex.
pub struct JobQueue {
    tx: mpsc::Sender<JobId>,
    rx: Mutex<mpsc::Receiver<JobId>>,
}

impl JobQueue {
    /// Create a queue with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Admit a job id for pickup, waiting while the queue is full.
    pub async fn enqueue(&self, job_id: JobId) -> Result<()> {
        self.tx.send(job_id).await.map_err(|_| {
            LonghaulError::new(ErrorCode::QueueClosed, "Job queue is closed")
        })?;
        tracing::debug!(job_id = %job_id, "Job enqueued");
        Ok(())
    }

    /// Wait until an id is available and return it to exactly one caller.
    pub async fn dequeue(&self) -> Result<JobId> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(job_id) => {
                tracing::debug!(job_id = %job_id, "Job dequeued");
                Ok(job_id)
            }
            None => Err(LonghaulError::new(
                ErrorCode::QueueClosed,
                "Job queue is closed",
            )),
        }
    }

    /// Stop accepting new ids; pending ids remain dequeueable.
    pub async fn close(&self) {
        self.rx.lock().await.close();
    }
}
