//! Connection gateway
//!
//! Owns every live connection, grouped by identity so that delivering to one
//! identity never scans unrelated connections. Delivery failures stay inside
//! the gateway: they are logged and the stale connection is dropped lazily.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use parley_shared::{IdentityId, ServerEvent};

use super::connection::{Connection, DeliveryError};

/// Live connections indexed by identity, then by session
#[derive(Default)]
pub struct Gateway {
    by_identity: RwLock<HashMap<IdentityId, HashMap<Uuid, Arc<Connection>>>>,
    connection_count: AtomicUsize,
}

/// Statistics about gateway connections
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct GatewayStats {
    pub active_connections: usize,
    pub connected_identities: usize,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to its identity. Returns how many connections the
    /// identity has afterwards.
    pub async fn register(&self, conn: Arc<Connection>) -> usize {
        let mut by_identity = self.by_identity.write().await;
        let sessions = by_identity.entry(conn.identity_id()).or_default();
        if sessions.insert(conn.session_id, Arc::clone(&conn)).is_none() {
            self.connection_count.fetch_add(1, Ordering::Relaxed);
        }
        let identity_connections = sessions.len();

        tracing::info!(
            session_id = %conn.session_id,
            identity_id = conn.identity_id(),
            identity_connections,
            total_connections = self.connection_count.load(Ordering::Relaxed),
            "WebSocket connection added"
        );

        identity_connections
    }

    /// Remove a connection. Idempotent; returns whether it was still bound.
    pub async fn unregister(&self, identity_id: IdentityId, session_id: Uuid) -> bool {
        let mut by_identity = self.by_identity.write().await;
        let removed = Self::remove_locked(&mut by_identity, identity_id, session_id);
        if removed {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(
                session_id = %session_id,
                identity_id,
                remaining_connections = self.connection_count.load(Ordering::Relaxed),
                "WebSocket connection removed"
            );
        }
        removed
    }

    fn remove_locked(
        by_identity: &mut HashMap<IdentityId, HashMap<Uuid, Arc<Connection>>>,
        identity_id: IdentityId,
        session_id: Uuid,
    ) -> bool {
        let Some(sessions) = by_identity.get_mut(&identity_id) else {
            return false;
        };
        let removed = sessions.remove(&session_id).is_some();
        if sessions.is_empty() {
            by_identity.remove(&identity_id);
        }
        removed
    }

    /// Deliver to every live connection of an identity. Having no live
    /// connection is not an error; returns the number of connections reached.
    pub async fn send_to_identity(&self, identity_id: IdentityId, event: ServerEvent) -> usize {
        self.deliver_to_identity(identity_id, event, false).await
    }

    /// Like [`Gateway::send_to_identity`] but drops the event for any
    /// connection whose lossy queue is full.
    pub async fn try_send_to_identity(&self, identity_id: IdentityId, event: ServerEvent) -> usize {
        self.deliver_to_identity(identity_id, event, true).await
    }

    async fn deliver_to_identity(
        &self,
        identity_id: IdentityId,
        event: ServerEvent,
        lossy: bool,
    ) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();
        {
            let by_identity = self.by_identity.read().await;
            let Some(sessions) = by_identity.get(&identity_id) else {
                tracing::debug!(identity_id, event_type = event.kind(), "Identity has no live connection");
                return 0;
            };

            for conn in sessions.values() {
                let result = if lossy {
                    conn.try_send_lossy(event.clone())
                } else {
                    conn.send(event.clone())
                };
                match result {
                    Ok(()) => delivered += 1,
                    Err(DeliveryError::Full) => {
                        tracing::debug!(
                            session_id = %conn.session_id,
                            event_type = event.kind(),
                            "Dropped lossy event for slow connection"
                        );
                    }
                    Err(DeliveryError::Closed) => stale.push((identity_id, conn.session_id)),
                }
            }
        }

        self.prune(stale).await;

        tracing::debug!(
            identity_id,
            event_type = event.kind(),
            recipients = delivered,
            "Delivered event to identity"
        );
        delivered
    }

    /// Deliver to every live connection
    pub async fn broadcast_all(&self, event: ServerEvent) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();
        {
            let by_identity = self.by_identity.read().await;
            for conn in by_identity.values().flat_map(HashMap::values) {
                match conn.send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => stale.push((conn.identity_id(), conn.session_id)),
                }
            }
        }

        let failed = stale.len();
        self.prune(stale).await;

        tracing::debug!(
            event_type = event.kind(),
            recipients = delivered,
            failed,
            "Broadcast event to all connections"
        );
        delivered
    }

    /// Drop connections whose writer side is gone
    async fn prune(&self, stale: Vec<(IdentityId, Uuid)>) {
        if stale.is_empty() {
            return;
        }

        let mut by_identity = self.by_identity.write().await;
        for (identity_id, session_id) in stale {
            if Self::remove_locked(&mut by_identity, identity_id, session_id) {
                self.connection_count.fetch_sub(1, Ordering::Relaxed);
                tracing::warn!(
                    session_id = %session_id,
                    identity_id,
                    "Failed to send event to connection (likely closed), unregistered"
                );
            }
        }
    }

    /// All live connections of an identity
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> GatewayStats {
        let by_identity = self.by_identity.read().await;
        GatewayStats {
            active_connections: self.connection_count(),
            connected_identities: by_identity.len(),
        }
    }
}
