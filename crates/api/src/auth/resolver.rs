//! Identity resolution for inbound connections

use async_trait::async_trait;
use std::sync::Arc;

use parley_shared::{Identity, IdentityId, Store};

use super::jwt::{JwtError, JwtManager};

/// Why a connection attempt was refused. Fatal to that attempt; the gateway
/// never retries it.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,
    #[error("Credential has expired")]
    Expired,
    #[error("Invalid credential: {0}")]
    Invalid(String),
    #[error("Identity {0} no longer exists")]
    UnknownIdentity(IdentityId),
    #[error("Identity lookup unavailable: {0}")]
    Unavailable(String),
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => AuthError::Expired,
            other => AuthError::Invalid(other.to_string()),
        }
    }
}

/// Turns a connection credential into an identity. Has no side effects; in
/// particular it does not mark presence.
#[async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    async fn resolve(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Resolves HS256 credentials against the record store
pub struct JwtIdentityResolver {
    jwt: JwtManager,
    store: Arc<dyn Store>,
}

impl JwtIdentityResolver {
    pub fn new(jwt: JwtManager, store: Arc<dyn Store>) -> Self {
        Self { jwt, store }
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve(&self, credential: &str) -> Result<Identity, AuthError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let claims = self.jwt.validate(credential)?;

        // The stored record is authoritative; an evicted guest keeps a
        // signature-valid credential but has no identity left.
        match self.store.get_user(claims.sub).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => {
                tracing::warn!(identity_id = claims.sub, "Credential for unknown identity");
                Err(AuthError::UnknownIdentity(claims.sub))
            }
            Err(e) => {
                tracing::error!(error = ?e, identity_id = claims.sub, "Identity lookup failed");
                Err(AuthError::Unavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parley_shared::{IdentityKind, MemoryStore};
    use time::{Duration, OffsetDateTime};

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    async fn setup() -> (Arc<MemoryStore>, JwtManager, JwtIdentityResolver) {
        let store = Arc::new(MemoryStore::new());
        let jwt = JwtManager::new(SECRET, 24);
        let resolver = JwtIdentityResolver::new(jwt.clone(), store.clone());
        (store, jwt, resolver)
    }

    #[tokio::test]
    async fn test_resolves_known_identity() {
        let (store, jwt, resolver) = setup().await;
        let alice = store.insert_identity("alice", IdentityKind::Member).await;

        let token = jwt.issue(&alice).unwrap();
        assert_eq!(resolver.resolve(&token).await.unwrap(), alice);
    }

    #[tokio::test]
    async fn test_rejects_missing_and_expired() {
        let (store, jwt, resolver) = setup().await;
        let alice = store.insert_identity("alice", IdentityKind::Member).await;

        assert!(matches!(
            resolver.resolve("  ").await,
            Err(AuthError::MissingCredential)
        ));

        let expired = jwt
            .issue_until(&alice, OffsetDateTime::now_utc() - Duration::minutes(5))
            .unwrap();
        assert!(matches!(resolver.resolve(&expired).await, Err(AuthError::Expired)));
        assert!(matches!(
            resolver.resolve("garbage").await,
            Err(AuthError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_evicted_guest() {
        let (store, jwt, resolver) = setup().await;
        let guest = store.insert_identity("guest", IdentityKind::Guest).await;
        let token = jwt.issue(&guest).unwrap();

        store.delete_identity(guest.id).await.unwrap();
        assert!(matches!(
            resolver.resolve(&token).await,
            Err(AuthError::UnknownIdentity(id)) if id == guest.id
        ));
    }

    #[tokio::test]
    async fn test_store_outage_is_unavailable() {
        let (store, jwt, resolver) = setup().await;
        let alice = store.insert_identity("alice", IdentityKind::Member).await;
        let token = jwt.issue(&alice).unwrap();

        store.set_unavailable(true);
        assert!(matches!(
            resolver.resolve(&token).await,
            Err(AuthError::Unavailable(_))
        ));
    }
}
