//! Message fan-out
//!
//! A send is delivered first and stored second: the provisional message goes
//! to the receiver's connections and back to the sender before the write is
//! handed to the durability worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;

use parley_shared::{
    AttachmentDescriptor, ConversationKey, Identity, IdentityId, Message, MessageLimits,
    NewGlobalMessage, NewMessage, ServerEvent, ValidationError,
};

use super::durability::{DurabilityJob, DurabilityQueue, SEND_FAILED_REASON};
use super::gateway::Gateway;

/// Source of provisional message ids.
///
/// Provisional ids live in their own `MessageId::Provisional` space, so they
/// cannot be mistaken for durable ids. The seed is the start time in seconds
/// shifted left by 20 bits: ids stay below 2^53 so JavaScript clients read
/// them exactly, and separate process runs stay apart unless one mints more
/// than a million ids per second of uptime.
#[derive(Debug)]
pub struct ProvisionalIds {
    next: AtomicU64,
}

impl ProvisionalIds {
    pub fn new() -> Self {
        let start_secs = OffsetDateTime::now_utc().unix_timestamp().max(0);
        let seed = u64::try_from(start_secs).unwrap_or(0) << 20;
        Self::starting_at(seed)
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ProvisionalIds {
    fn default() -> Self {
        Self::new()
    }
}

/// A private send as it arrives from a client
#[derive(Debug, Clone)]
pub struct PrivateSend {
    pub receiver_id: IdentityId,
    pub body: Option<String>,
    pub attachment: Option<AttachmentDescriptor>,
    pub idempotency_token: String,
}

pub struct MessageRouter {
    gateway: Arc<Gateway>,
    durability: DurabilityQueue,
    limits: MessageLimits,
    ids: ProvisionalIds,
}

impl MessageRouter {
    pub fn new(gateway: Arc<Gateway>, durability: DurabilityQueue, limits: MessageLimits) -> Self {
        Self {
            gateway,
            durability,
            limits,
            ids: ProvisionalIds::new(),
        }
    }

    /// Deliver a private message and schedule its write.
    ///
    /// The receiver gets `new_message` on every live connection, the sender
    /// gets `message_accepted` on every live connection. Returns the
    /// provisional message.
    pub async fn send_private(
        &self,
        sender: &Identity,
        send: PrivateSend,
    ) -> Result<Message, ValidationError> {
        let body = self.limits.check_private(
            send.receiver_id,
            send.body.as_deref(),
            send.attachment.as_ref(),
            &send.idempotency_token,
        )?;

        let draft = NewMessage {
            sender_id: sender.id,
            receiver_id: send.receiver_id,
            conversation_key: ConversationKey::between(sender.id, send.receiver_id),
            body,
            attachment: send.attachment,
            client_token: send.idempotency_token,
            created_at: OffsetDateTime::now_utc(),
        };
        let message = draft.provisional(self.ids.next_id());

        let receiver_connections = self
            .gateway
            .send_to_identity(
                draft.receiver_id,
                ServerEvent::NewMessage {
                    message: message.clone(),
                },
            )
            .await;
        self.gateway
            .send_to_identity(
                sender.id,
                ServerEvent::MessageAccepted {
                    idempotency_token: draft.client_token.clone(),
                    message: message.clone(),
                },
            )
            .await;

        tracing::debug!(
            sender_id = sender.id,
            receiver_id = draft.receiver_id,
            idempotency_token = %draft.client_token,
            receiver_connections,
            "Delivered private message"
        );

        let token = draft.client_token.clone();
        if let Err(e) = self.durability.enqueue(DurabilityJob::Private(draft)) {
            tracing::error!(
                sender_id = sender.id,
                idempotency_token = %token,
                error = %e,
                "Message not queued for saving"
            );
            self.gateway
                .send_to_identity(
                    sender.id,
                    ServerEvent::MessageSendFailed {
                        idempotency_token: token,
                        reason: SEND_FAILED_REASON.to_string(),
                    },
                )
                .await;
        }

        Ok(message)
    }

    /// Broadcast a global message to every connection and schedule its write
    pub async fn send_global(&self, sender: &Identity, body: &str) -> Result<Message, ValidationError> {
        let body = self.limits.check_global(body)?;
        let draft = NewGlobalMessage {
            sender_id: sender.id,
            body,
            created_at: OffsetDateTime::now_utc(),
        };
        let message = draft.provisional(self.ids.next_id());

        let recipients = self
            .gateway
            .broadcast_all(ServerEvent::GlobalMessage {
                message: message.clone(),
            })
            .await;
        tracing::debug!(sender_id = sender.id, recipients, "Broadcast global message");

        if let Err(e) = self.durability.enqueue(DurabilityJob::Global(draft)) {
            tracing::error!(sender_id = sender.id, error = %e, "Global message not queued for saving");
        }

        Ok(message)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::websocket::connection::{Connection, Outbound};
    use crate::websocket::durability::{self, DurabilityConfig};
    use parley_shared::{MemoryStore, MessageId};
    use std::time::Duration;

    struct Harness {
        router: MessageRouter,
        gateway: Arc<Gateway>,
        store: Arc<MemoryStore>,
        worker: tokio::task::JoinHandle<()>,
    }

    async fn harness() -> Harness {
        harness_with(DurabilityConfig::default()).await
    }

    async fn harness_with(config: DurabilityConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(Gateway::new());
        let (queue, worker) = durability::spawn(
            config,
            store.clone(),
            Arc::clone(&gateway),
        );
        let router = MessageRouter::new(Arc::clone(&gateway), queue, MessageLimits::default());
        Harness {
            router,
            gateway,
            store,
            worker,
        }
    }

    async fn connect(gateway: &Gateway, identity: &Identity) -> Outbound {
        let (conn, outbound) = Connection::new(identity.clone(), 4);
        gateway.register(Arc::new(conn)).await;
        outbound
    }

    fn hi(receiver_id: IdentityId, token: &str) -> PrivateSend {
        PrivateSend {
            receiver_id,
            body: Some("hi".to_string()),
            attachment: None,
            idempotency_token: token.to_string(),
        }
    }

    #[test]
    fn test_provisional_ids_are_increasing() {
        let ids = ProvisionalIds::starting_at(10);
        assert_eq!(ids.next_id(), 10);
        assert_eq!(ids.next_id(), 11);
    }

    #[test]
    fn test_provisional_ids_are_exact_in_javascript() {
        let id = ProvisionalIds::new().next_id();
        assert!(id > 1 << 40);
        assert!(id < 1 << 53);
    }

    #[tokio::test]
    async fn test_private_send_delivers_before_persisting() {
        let h = harness().await;
        let alice = h.store.insert_identity("alice", parley_shared::IdentityKind::Member).await;
        let bob = h.store.insert_identity("bob", parley_shared::IdentityKind::Member).await;
        let mut alice_out = connect(&h.gateway, &alice).await;
        let mut bob_out = connect(&h.gateway, &bob).await;

        let message = h.router.send_private(&alice, hi(bob.id, "t1")).await.unwrap();
        assert!(matches!(message.id, MessageId::Provisional(_)));

        match bob_out.try_recv() {
            Some(ServerEvent::NewMessage { message: delivered }) => {
                assert_eq!(delivered.body.as_deref(), Some("hi"));
                assert_eq!(delivered.conversation_key, Some(ConversationKey::between(1, 2)));
            }
            other => panic!("expected new_message, got {other:?}"),
        }
        match alice_out.try_recv() {
            Some(ServerEvent::MessageAccepted {
                idempotency_token, ..
            }) => assert_eq!(idempotency_token, "t1"),
            other => panic!("expected message_accepted, got {other:?}"),
        }

        drop(h.router);
        h.worker.await.unwrap();
        assert_eq!(h.store.message_count().await, 1);
    }

    #[tokio::test]
    async fn test_every_receiver_device_gets_the_message() {
        let h = harness().await;
        let alice = Identity::member(1, "alice");
        let bob = Identity::member(2, "bob");
        let mut phone = connect(&h.gateway, &bob).await;
        let mut laptop = connect(&h.gateway, &bob).await;

        h.router.send_private(&alice, hi(bob.id, "t1")).await.unwrap();

        assert!(matches!(phone.try_recv(), Some(ServerEvent::NewMessage { .. })));
        assert!(matches!(laptop.try_recv(), Some(ServerEvent::NewMessage { .. })));
    }

    #[tokio::test]
    async fn test_invalid_send_is_not_delivered() {
        let h = harness().await;
        let alice = Identity::member(1, "alice");
        let bob = Identity::member(2, "bob");
        let mut bob_out = connect(&h.gateway, &bob).await;

        let empty = PrivateSend {
            receiver_id: bob.id,
            body: Some("   ".to_string()),
            attachment: None,
            idempotency_token: "t1".to_string(),
        };
        assert_eq!(
            h.router.send_private(&alice, empty).await,
            Err(ValidationError::EmptyMessage)
        );
        assert!(matches!(
            h.router.send_private(&alice, hi(0, "t2")).await,
            Err(ValidationError::InvalidReceiver(0))
        ));
        assert!(bob_out.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_offline_receiver_is_not_an_error() {
        let h = harness().await;
        let alice = Identity::member(1, "alice");
        let mut alice_out = connect(&h.gateway, &alice).await;

        h.router.send_private(&alice, hi(2, "t1")).await.unwrap();
        assert!(matches!(
            alice_out.try_recv(),
            Some(ServerEvent::MessageAccepted { .. })
        ));
    }

    #[tokio::test]
    async fn test_global_send_reaches_everyone() {
        let h = harness().await;
        let alice = Identity::member(1, "alice");
        let bob = Identity::member(2, "bob");
        let mut alice_out = connect(&h.gateway, &alice).await;
        let mut bob_out = connect(&h.gateway, &bob).await;

        let message = h.router.send_global(&alice, " hello all ").await.unwrap();
        assert!(message.is_global());
        assert_eq!(message.body.as_deref(), Some("hello all"));
        assert!(matches!(alice_out.try_recv(), Some(ServerEvent::GlobalMessage { .. })));
        assert!(matches!(bob_out.try_recv(), Some(ServerEvent::GlobalMessage { .. })));

        assert_eq!(
            h.router.send_global(&alice, "").await,
            Err(ValidationError::EmptyMessage)
        );
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_worker_is_gone() {
        let h = harness().await;
        h.worker.abort();
        let _ = h.worker.await;
        let alice = Identity::member(1, "alice");
        let mut alice_out = connect(&h.gateway, &alice).await;

        h.router.send_private(&alice, hi(2, "t1")).await.unwrap();
        assert!(matches!(alice_out.try_recv(), Some(ServerEvent::MessageAccepted { .. })));
        assert!(matches!(
            alice_out.try_recv(),
            Some(ServerEvent::MessageSendFailed { idempotency_token, .. }) if idempotency_token == "t1"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_does_not_wait_for_a_full_queue() {
        let h = harness_with(DurabilityConfig {
            queue_capacity: 1,
            ..DurabilityConfig::default()
        })
        .await;
        let alice = Identity::member(1, "alice");
        let mut alice_out = connect(&h.gateway, &alice).await;
        h.store.set_fail_writes(true);
        h.store.set_write_delay(Duration::from_secs(10));

        // One write in flight and one queued at most, so the third overflows
        for token in ["t1", "t2", "t3"] {
            let send = h.router.send_private(&alice, hi(2, token));
            let sent = tokio::time::timeout(Duration::from_millis(100), send).await;
            assert!(sent.unwrap().is_ok());
        }

        let mut failed = Vec::new();
        while let Some(event) = alice_out.try_recv() {
            if let ServerEvent::MessageSendFailed { idempotency_token, .. } = event {
                failed.push(idempotency_token);
            }
        }
        assert!(failed.contains(&"t3".to_string()));
    }
}
