//! Background durability worker
//!
//! Messages are delivered before they are stored. The write happens here, on
//! a bounded queue drained by one task, so storage latency never sits on the
//! delivery path.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use parley_shared::{IdentityId, NewGlobalMessage, NewMessage, ServerEvent, Store, StoreError};

use super::gateway::Gateway;

/// Upper bound for a single backoff step
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Reason reported to the sender when a private message cannot be stored
pub const SEND_FAILED_REASON: &str = "Message could not be saved";

#[derive(Debug, Clone)]
pub struct DurabilityConfig {
    pub queue_capacity: usize,
    /// Total write attempts for a private message, first try included
    pub max_attempts: usize,
    pub base_backoff: Duration,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
        }
    }
}

/// A write owed to the record store
#[derive(Debug, Clone)]
pub enum DurabilityJob {
    Private(NewMessage),
    Global(NewGlobalMessage),
}

impl DurabilityJob {
    fn sender_id(&self) -> IdentityId {
        match self {
            DurabilityJob::Private(draft) => draft.sender_id,
            DurabilityJob::Global(draft) => draft.sender_id,
        }
    }
}

/// Why a job was not queued. The job is handed back.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("durability queue is full")]
    Full(DurabilityJob),
    #[error("durability worker has stopped")]
    Closed(DurabilityJob),
}

/// Producer side of the durability queue
#[derive(Clone)]
pub struct DurabilityQueue {
    tx: mpsc::Sender<DurabilityJob>,
}

impl DurabilityQueue {
    /// Queue a write without waiting. A full queue refuses the job.
    pub fn enqueue(&self, job: DurabilityJob) -> Result<(), EnqueueError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => EnqueueError::Full(job),
            mpsc::error::TrySendError::Closed(job) => EnqueueError::Closed(job),
        })
    }
}

/// Start the durability worker. It drains the queue and stops once every
/// [`DurabilityQueue`] is dropped.
pub fn spawn(
    config: DurabilityConfig,
    store: Arc<dyn Store>,
    gateway: Arc<Gateway>,
) -> (DurabilityQueue, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let worker = DurabilityWorker {
        config,
        store,
        gateway,
    };
    let task = tokio::spawn(worker.run(rx));
    (DurabilityQueue { tx }, task)
}

struct DurabilityWorker {
    config: DurabilityConfig,
    store: Arc<dyn Store>,
    gateway: Arc<Gateway>,
}

impl DurabilityWorker {
    async fn run(self, mut rx: mpsc::Receiver<DurabilityJob>) {
        tracing::info!(
            queue_capacity = self.config.queue_capacity,
            max_attempts = self.config.max_attempts,
            "Durability worker started"
        );

        while let Some(job) = rx.recv().await {
            tracing::debug!(
                sender_id = job.sender_id(),
                backlog = rx.len(),
                "Persisting message"
            );
            match job {
                DurabilityJob::Private(draft) => self.persist_private(draft).await,
                DurabilityJob::Global(draft) => self.persist_global(draft).await,
            }
        }

        tracing::info!("Durability worker stopped");
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        let base_ms = u64::try_from(self.config.base_backoff.as_millis()).unwrap_or(u64::MAX);
        // from_millis(2).factor(base) yields base*2, base*4, base*8, ...
        ExponentialBackoff::from_millis(2)
            .factor(base_ms.max(1))
            .max_delay(MAX_BACKOFF)
            .map(jitter)
            .take(self.config.max_attempts.saturating_sub(1))
    }

    async fn persist_private(&self, draft: NewMessage) {
        let store = &self.store;
        let result = RetryIf::spawn(
            self.retry_strategy(),
            || {
                let draft = draft.clone();
                async move { store.create_message(draft).await }
            },
            |e: &StoreError| {
                let transient = e.is_transient();
                if transient {
                    tracing::debug!(error = %e, "Transient store error, retrying message write");
                }
                transient
            },
        )
        .await;

        match result {
            Ok(message) => {
                tracing::debug!(
                    sender_id = draft.sender_id,
                    receiver_id = draft.receiver_id,
                    idempotency_token = %draft.client_token,
                    message_id = ?message.id,
                    "Private message persisted"
                );
            }
            Err(e) => {
                tracing::error!(
                    sender_id = draft.sender_id,
                    receiver_id = draft.receiver_id,
                    idempotency_token = %draft.client_token,
                    error = %e,
                    "Failed to persist private message"
                );
                // Only the sender learns about it; the receiver keeps its
                // provisional copy
                self.gateway
                    .send_to_identity(
                        draft.sender_id,
                        ServerEvent::MessageSendFailed {
                            idempotency_token: draft.client_token,
                            reason: SEND_FAILED_REASON.to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    async fn persist_global(&self, draft: NewGlobalMessage) {
        let sender_id = draft.sender_id;
        match self.store.create_global_message(draft).await {
            Ok(message) => {
                tracing::debug!(sender_id, message_id = ?message.id, "Global message persisted");
            }
            Err(e) => {
                tracing::error!(sender_id, error = %e, "Failed to persist global message");
            }
        }
    }
}
