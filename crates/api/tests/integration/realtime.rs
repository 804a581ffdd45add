//! End-to-end tests for the real-time gateway
//!
//! Connections are attached directly to a running [`AppState`] backed by the
//! in-memory store, so every actor runs for real under a paused clock.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, http::StatusCode};

use parley_api::auth::{AuthError, JwtManager};
use parley_api::config::StoreBackend;
use parley_api::routes::health::{health, readiness};
use parley_api::state::CREDENTIAL_TTL_HOURS;
use parley_api::websocket::connection::{Connection, Outbound};
use parley_api::websocket::handler::{attach, detach, dispatch};
use parley_api::{AppState, Config};
use parley_client::{ClientSession, EntryStatus};
use parley_shared::{
    ClientEvent, ConversationKey, Identity, IdentityKind, MemoryStore, ServerEvent, Store,
};

// ============================================================================
// Test Utilities
// ============================================================================

const SECRET: &str = "integration-secret-at-least-32-chars";

fn test_config() -> Config {
    let mut config = Config::with_secret(SECRET);
    config.store_backend = StoreBackend::Memory;
    config.presence_settle = Duration::from_secs(1);
    config.presence_debounce = Duration::from_millis(100);
    config.guest_grace = Duration::from_secs(10);
    config.durability_backoff = Duration::from_millis(10);
    config
}

fn start() -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let (state, _tasks) = AppState::start(test_config(), store.clone());
    (state, store)
}

/// Everything queued for a connection so far, in the order the writer
/// would put it on the wire
fn drain(outbound: &mut Outbound) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Some(event) = outbound.try_recv() {
        events.push(event);
    }
    events
}

/// A client session fed by one attached connection
struct Device {
    conn: Arc<Connection>,
    outbound: Outbound,
    session: ClientSession,
}

impl Device {
    async fn connect(state: &AppState, identity: &Identity) -> Self {
        let (conn, outbound) = attach(state, identity.clone()).await;
        // The tracker has queued the online set once it answers
        state.presence.snapshot().await.unwrap();
        let mut device = Self {
            conn,
            outbound,
            session: ClientSession::new(identity.clone()),
        };
        device.pump();
        device
    }

    /// Apply everything received so far; returns the raw events
    fn pump(&mut self) -> Vec<ServerEvent> {
        let events = drain(&mut self.outbound);
        for event in &events {
            self.session.apply(event.clone(), Instant::now());
        }
        events
    }

    async fn send(&mut self, state: &AppState, event: ClientEvent) {
        dispatch(state, &self.conn, event).await;
    }
}

fn last_online(events: &[ServerEvent]) -> Option<Vec<i64>> {
    events.iter().rev().find_map(|event| match event {
        ServerEvent::PresenceChanged { online } => {
            Some(online.iter().map(|identity| identity.id).collect())
        }
        _ => None,
    })
}

// ============================================================================
// Messaging
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_private_send_fails_after_retries_and_stays_visible() {
    let (state, store) = start();
    let alice = store.insert_identity("alice", IdentityKind::Member).await;
    let bob = store.insert_identity("bob", IdentityKind::Member).await;

    let mut alice_dev = Device::connect(&state, &alice).await;
    let mut bob_dev = Device::connect(&state, &bob).await;

    store.set_fail_writes(true);
    let submitted = alice_dev
        .session
        .submit_private(bob.id, Some("hi".into()), None)
        .unwrap();
    alice_dev.send(&state, submitted.event.clone()).await;

    // Delivery does not wait for the write
    let bob_events = bob_dev.pump();
    assert!(bob_events.iter().any(|event| matches!(
        event,
        ServerEvent::NewMessage { message } if message.body.as_deref() == Some("hi")
    )));
    let alice_events = alice_dev.pump();
    assert!(alice_events.iter().any(|event| matches!(
        event,
        ServerEvent::MessageAccepted { idempotency_token, .. }
            if *idempotency_token == submitted.idempotency_token
    )));

    tokio::time::sleep(Duration::from_secs(2)).await;

    let alice_events = alice_dev.pump();
    assert!(alice_events.iter().any(|event| matches!(
        event,
        ServerEvent::MessageSendFailed { idempotency_token, .. }
            if *idempotency_token == submitted.idempotency_token
    )));
    assert!(!bob_dev
        .pump()
        .iter()
        .any(|event| matches!(event, ServerEvent::MessageSendFailed { .. })));
    assert_eq!(store.write_attempts(), 3);
    assert_eq!(store.message_count().await, 0);

    let view = alice_dev.session.conversation(bob.id).unwrap();
    assert_eq!(view.len(), 1);
    assert!(view.visible()[0].status.is_failed());

    // Retrying reuses the token and succeeds once the store recovers
    store.set_fail_writes(false);
    let resend = alice_dev
        .session
        .retry(bob.id, &submitted.idempotency_token)
        .unwrap();
    assert_eq!(resend, submitted.event);
    alice_dev.send(&state, resend).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.message_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_accepted_send_and_history_collapse_into_one_entry() {
    let (state, store) = start();
    let alice = store.insert_identity("alice", IdentityKind::Member).await;
    let bob = store.insert_identity("bob", IdentityKind::Member).await;

    let mut alice_dev = Device::connect(&state, &alice).await;
    let submitted = alice_dev
        .session
        .submit_private(bob.id, Some("persist me".into()), None)
        .unwrap();
    alice_dev.send(&state, submitted.event).await;
    alice_dev.pump();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.message_count().await, 1);

    let page = store
        .conversation_history(ConversationKey::between(alice.id, bob.id), None, 50)
        .await
        .unwrap();
    assert_eq!(alice_dev.session.apply_history(bob.id, page), 1);

    let view = alice_dev.session.conversation(bob.id).unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view.visible()[0].status, EntryStatus::Confirmed);
    assert!(view.visible()[0].message.id.durable().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_message_reaches_every_device_of_both_parties() {
    let (state, store) = start();
    let alice = store.insert_identity("alice", IdentityKind::Member).await;
    let bob = store.insert_identity("bob", IdentityKind::Member).await;

    let mut alice_phone = Device::connect(&state, &alice).await;
    let mut alice_laptop = Device::connect(&state, &alice).await;
    let mut bob_phone = Device::connect(&state, &bob).await;
    let mut bob_laptop = Device::connect(&state, &bob).await;

    let submitted = alice_phone
        .session
        .submit_private(bob.id, Some("everywhere".into()), None)
        .unwrap();
    alice_phone.send(&state, submitted.event).await;

    for device in [&mut bob_phone, &mut bob_laptop] {
        let events = device.pump();
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, ServerEvent::NewMessage { .. }))
                .count(),
            1
        );
        assert_eq!(device.session.conversation(alice.id).unwrap().len(), 1);
    }

    // Other devices of the sender see the acknowledgment too
    assert!(alice_laptop
        .pump()
        .iter()
        .any(|event| matches!(event, ServerEvent::MessageAccepted { .. })));
    assert_eq!(alice_laptop.session.conversation(bob.id).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_typing_reaches_receiver_only() {
    let (state, store) = start();
    let alice = store.insert_identity("alice", IdentityKind::Member).await;
    let bob = store.insert_identity("bob", IdentityKind::Member).await;
    let carol = store.insert_identity("carol", IdentityKind::Member).await;

    let mut alice_dev = Device::connect(&state, &alice).await;
    let mut bob_dev = Device::connect(&state, &bob).await;
    let mut carol_dev = Device::connect(&state, &carol).await;

    alice_dev
        .send(&state, ClientEvent::TypingStart { receiver_id: bob.id })
        .await;
    bob_dev.pump();
    assert_eq!(bob_dev.session.typing(Instant::now()), vec![alice.id]);

    alice_dev
        .send(&state, ClientEvent::TypingStop { receiver_id: bob.id })
        .await;
    bob_dev.pump();
    assert!(bob_dev.session.typing(Instant::now()).is_empty());

    assert!(!carol_dev
        .pump()
        .iter()
        .any(|event| matches!(event, ServerEvent::TypingChanged { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_quick_start_stop_never_leaves_receiver_typing() {
    let (state, store) = start();
    let alice = store.insert_identity("alice", IdentityKind::Member).await;
    let bob = store.insert_identity("bob", IdentityKind::Member).await;

    let mut alice_dev = Device::connect(&state, &alice).await;
    let mut bob_dev = Device::connect(&state, &bob).await;

    // Both signals are queued before bob's writer runs
    alice_dev
        .send(&state, ClientEvent::TypingStart { receiver_id: bob.id })
        .await;
    alice_dev
        .send(&state, ClientEvent::TypingStop { receiver_id: bob.id })
        .await;

    let typing: Vec<bool> = bob_dev
        .pump()
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::TypingChanged { is_typing, .. } => Some(is_typing),
            _ => None,
        })
        .collect();
    assert_eq!(typing.last(), Some(&false));
    assert!(bob_dev.session.typing(Instant::now()).is_empty());
}

// ============================================================================
// Guest lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_guest_reconnecting_within_grace_is_kept() {
    let (state, store) = start();
    let alice = store.insert_identity("alice", IdentityKind::Member).await;
    let guest = store.insert_identity("Guest 7", IdentityKind::Guest).await;
    let credential = JwtManager::new(SECRET, CREDENTIAL_TTL_HOURS)
        .issue(&guest)
        .unwrap();

    let mut guest_dev = Device::connect(&state, &guest).await;
    let submitted = guest_dev
        .session
        .submit_private(alice.id, Some("hello from a guest".into()), None)
        .unwrap();
    guest_dev.send(&state, submitted.event).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.message_count().await, 1);

    detach(&state, &guest_dev.conn).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let resolved = state.resolver.resolve(&credential).await.unwrap();
    assert_eq!(resolved, guest);
    let _guest_again = Device::connect(&state, &resolved).await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    let report = state.presence.sweep().await.unwrap();
    assert_eq!(report.evicted, 0);
    assert_eq!(store.message_count().await, 1);
    assert!(store.get_user(guest.id).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_guest_away_past_grace_is_evicted() {
    let (state, store) = start();
    let alice = store.insert_identity("alice", IdentityKind::Member).await;
    let guest = store.insert_identity("Guest 8", IdentityKind::Guest).await;
    let credential = JwtManager::new(SECRET, CREDENTIAL_TTL_HOURS)
        .issue(&guest)
        .unwrap();

    let mut alice_dev = Device::connect(&state, &alice).await;
    let guest_dev = Device::connect(&state, &guest).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(last_online(&alice_dev.pump()), Some(vec![alice.id, guest.id]));

    detach(&state, &guest_dev.conn).await;
    tokio::time::sleep(Duration::from_secs(12)).await;

    let report = state.presence.sweep().await.unwrap();
    assert_eq!(report.evicted, 1);
    assert!(matches!(
        state.resolver.resolve(&credential).await,
        Err(AuthError::UnknownIdentity(id)) if id == guest.id
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(last_online(&alice_dev.pump()), Some(vec![alice.id]));
    assert!(!alice_dev.session.is_online(guest.id));
}

#[tokio::test(start_paused = true)]
async fn test_readiness_follows_store_availability() {
    let (state, store) = start();
    assert_eq!(readiness(State(state.clone())).await, StatusCode::OK);

    store.set_unavailable(true);
    assert_eq!(
        readiness(State(state)).await,
        StatusCode::SERVICE_UNAVAILABLE
    );
}

#[tokio::test(start_paused = true)]
async fn test_health_reports_connections_and_online_count() {
    let (state, store) = start();
    let alice = store.insert_identity("alice", IdentityKind::Member).await;
    let _phone = Device::connect(&state, &alice).await;
    let _laptop = Device::connect(&state, &alice).await;

    let (status, body) = health(State(state)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.connections.active_connections, 2);
    assert_eq!(body.connections.connected_identities, 1);
    assert_eq!(body.online, Some(1));
}
