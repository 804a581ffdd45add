//! WebSocket connection management
//!
//! Represents an authenticated WebSocket connection and its outbound queues.
//!
//! Events go out on two queues: a reliable one that is never dropped and a
//! bounded lossy one for typing starts. The writer prefers the reliable
//! queue, so every event is stamped with a per-connection sequence number
//! and [`Outbound`] discards a typing start that was queued before a stop
//! already written for the same sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use parley_shared::{Identity, IdentityId, ServerEvent};

/// Why an event did not reach a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("lossy queue full")]
    Full,
}

#[derive(Debug)]
struct Queued {
    seq: u64,
    event: ServerEvent,
}

/// Receiving ends of a connection's outbound queues, drained by its writer task
pub struct Outbound {
    reliable: mpsc::UnboundedReceiver<Queued>,
    lossy: mpsc::Receiver<Queued>,
    /// Sequence of the last typing stop handed out, per sender
    typing_stopped: HashMap<IdentityId, u64>,
}

impl Outbound {
    /// Wait for the next event to write. Returns `None` once both queues are
    /// closed and empty.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        loop {
            let queued = tokio::select! {
                biased;
                Some(queued) = self.reliable.recv() => queued,
                Some(queued) = self.lossy.recv() => queued,
                else => return None,
            };
            if let Some(event) = self.admit(queued) {
                return Some(event);
            }
        }
    }

    /// Next event already queued, without waiting
    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        loop {
            let queued = match self.reliable.try_recv() {
                Ok(queued) => queued,
                Err(_) => self.lossy.try_recv().ok()?,
            };
            if let Some(event) = self.admit(queued) {
                return Some(event);
            }
        }
    }

    fn admit(&mut self, queued: Queued) -> Option<ServerEvent> {
        if let ServerEvent::TypingChanged { from_id, is_typing } = &queued.event {
            if *is_typing {
                let stale = self
                    .typing_stopped
                    .get(from_id)
                    .is_some_and(|stopped| *stopped > queued.seq);
                if stale {
                    tracing::trace!(from_id, seq = queued.seq, "Dropping typing start overtaken by stop");
                    return None;
                }
            } else {
                self.typing_stopped.insert(*from_id, queued.seq);
            }
        }
        Some(queued.event)
    }
}

/// Represents an active WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection
    pub session_id: Uuid,

    /// Authenticated identity
    pub identity: Identity,

    /// Events that must arrive (messages, acks, failures, presence, typing stop)
    reliable: mpsc::UnboundedSender<Queued>,

    /// Events that may be dropped under backpressure (typing start)
    lossy: mpsc::Sender<Queued>,

    next_seq: AtomicU64,
    dropped: AtomicU64,
    close: Notify,
}

impl Connection {
    /// Create a new connection and the queues its writer task drains
    pub fn new(identity: Identity, lossy_capacity: usize) -> (Self, Outbound) {
        let (reliable_tx, reliable_rx) = mpsc::unbounded_channel();
        let (lossy_tx, lossy_rx) = mpsc::channel(lossy_capacity.max(1));

        let conn = Self {
            session_id: Uuid::new_v4(),
            identity,
            reliable: reliable_tx,
            lossy: lossy_tx,
            next_seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            close: Notify::new(),
        };
        let outbound = Outbound {
            reliable: reliable_rx,
            lossy: lossy_rx,
            typing_stopped: HashMap::new(),
        };
        (conn, outbound)
    }

    pub fn identity_id(&self) -> IdentityId {
        self.identity.id
    }

    fn stamp(&self, event: ServerEvent) -> Queued {
        Queued {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            event,
        }
    }

    /// Queue an event that must not be dropped
    pub fn send(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        self.reliable
            .send(self.stamp(event))
            .map_err(|_| DeliveryError::Closed)
    }

    /// Queue an event that may be dropped when the connection is behind
    pub fn try_send_lossy(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        self.lossy.try_send(self.stamp(event)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                DeliveryError::Full
            }
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Whether the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.reliable.is_closed()
    }

    /// Number of lossy events dropped for this connection
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the connection's reader loop to stop. Events already queued are
    /// still written.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`Connection::close`] has been called
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn typing(from_id: IdentityId, is_typing: bool) -> ServerEvent {
        ServerEvent::TypingChanged { from_id, is_typing }
    }

    #[tokio::test]
    async fn test_reliable_send_after_close_fails() {
        let (conn, outbound) = Connection::new(Identity::member(1, "alice"), 4);
        assert!(conn.send(ServerEvent::Pong).is_ok());
        assert!(!conn.is_closed());

        drop(outbound);
        assert_eq!(conn.send(ServerEvent::Pong), Err(DeliveryError::Closed));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_lossy_queue_drops_when_full() {
        let (conn, mut outbound) = Connection::new(Identity::member(1, "alice"), 1);

        assert!(conn.try_send_lossy(typing(2, true)).is_ok());
        assert_eq!(conn.try_send_lossy(typing(2, true)), Err(DeliveryError::Full));
        assert_eq!(conn.dropped_count(), 1);

        // Reliable events are unaffected by a full lossy queue
        assert!(conn.send(ServerEvent::Pong).is_ok());
        assert_eq!(outbound.recv().await, Some(ServerEvent::Pong));
        assert_eq!(outbound.recv().await, Some(typing(2, true)));
    }

    #[tokio::test]
    async fn test_typing_stop_is_never_followed_by_older_start() {
        let (conn, mut outbound) = Connection::new(Identity::member(2, "bob"), 4);

        conn.try_send_lossy(typing(1, true)).unwrap();
        conn.send(typing(1, false)).unwrap();
        drop(conn);

        let mut wire = Vec::new();
        while let Some(event) = outbound.recv().await {
            wire.push(event);
        }
        assert_eq!(wire, vec![typing(1, false)]);
    }

    #[tokio::test]
    async fn test_start_after_stop_is_kept() {
        let (conn, mut outbound) = Connection::new(Identity::member(2, "bob"), 4);

        conn.try_send_lossy(typing(1, true)).unwrap();
        conn.send(typing(1, false)).unwrap();
        conn.try_send_lossy(typing(1, true)).unwrap();
        // A stop from another sender does not affect sender 1
        conn.send(typing(3, false)).unwrap();

        let mut wire = Vec::new();
        while let Some(event) = outbound.try_recv() {
            wire.push(event);
        }
        assert_eq!(
            wire,
            vec![typing(1, false), typing(3, false), typing(1, true)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_waiter() {
        let (conn, _outbound) = Connection::new(Identity::member(1, "alice"), 4);
        conn.close();
        assert!(tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .is_ok());
    }
}
