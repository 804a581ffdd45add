//! Persistence collaborator interface
//!
//! The gateway never owns durable records; it reaches the record store only
//! through this trait so a Postgres pool, an in-memory store, or a remote
//! service can sit behind it.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StoreResult;
use crate::types::{
    Attachment, ConversationKey, HistoryCursor, Identity, IdentityId, Message, NewGlobalMessage,
    NewMessage,
};

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Persist a private message. Idempotent per `(sender_id, client_token)`:
    /// a repeated write returns the already stored message.
    async fn create_message(&self, draft: NewMessage) -> StoreResult<Message>;

    /// Persist a global-room message
    async fn create_global_message(&self, draft: NewGlobalMessage) -> StoreResult<Message>;

    /// Look up an identity; `None` when it does not exist (or was evicted)
    async fn get_user(&self, id: IdentityId) -> StoreResult<Option<Identity>>;

    /// Delete an identity and everything it authored. Returns whether a row
    /// was removed; deleting a missing identity is not an error.
    async fn delete_identity(&self, id: IdentityId) -> StoreResult<bool>;

    /// Identities the store last recorded as online
    async fn list_online(&self) -> StoreResult<Vec<Identity>>;

    /// Record a presence transition
    async fn set_presence(
        &self,
        id: IdentityId,
        is_online: bool,
        last_seen: OffsetDateTime,
    ) -> StoreResult<()>;

    /// One newest-first page of a private conversation, strictly older than
    /// `before` when given
    async fn conversation_history(
        &self,
        key: ConversationKey,
        before: Option<HistoryCursor>,
        limit: i64,
    ) -> StoreResult<Vec<Message>>;

    /// Unreferenced attachments uploaded before `before`
    async fn get_old_attachments(&self, before: OffsetDateTime) -> StoreResult<Vec<Attachment>>;

    async fn delete_attachment(&self, id: i64) -> StoreResult<()>;

    /// Connectivity check for readiness probes
    async fn ping(&self) -> StoreResult<()>;
}
