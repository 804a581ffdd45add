//! In-memory record store
//!
//! Used for local development (`STORE_BACKEND=memory`) and as the persistence
//! collaborator in tests, with switchable failure injection.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::store::Store;
use crate::types::{
    Attachment, ConversationKey, HistoryCursor, Identity, IdentityId, IdentityKind, Message,
    NewGlobalMessage, NewMessage,
};

#[derive(Debug, Clone)]
struct IdentityEntry {
    identity: Identity,
    is_online: bool,
    last_seen: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
struct AttachmentEntry {
    attachment: Attachment,
    message_id: Option<i64>,
}

#[derive(Debug, Default)]
struct Inner {
    next_identity_id: i64,
    next_message_id: i64,
    next_global_id: i64,
    next_attachment_id: i64,
    identities: BTreeMap<IdentityId, IdentityEntry>,
    messages: Vec<Message>,
    global: Vec<Message>,
    attachments: BTreeMap<i64, AttachmentEntry>,
}

/// Record store held entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    fail_writes: AtomicBool,
    failures_remaining: AtomicUsize,
    write_attempts: AtomicUsize,
    write_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call, reads included
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail every write until switched off
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` writes, then recover
    pub fn fail_next_writes(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Make every write take `delay` before it succeeds or fails
    pub fn set_write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of write calls received, failed ones included
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Create an identity with the next free id
    pub async fn insert_identity(&self, display_name: &str, kind: IdentityKind) -> Identity {
        let mut inner = self.inner.lock().await;
        inner.next_identity_id += 1;
        let identity = Identity {
            id: inner.next_identity_id,
            display_name: display_name.to_string(),
            kind,
        };
        inner.identities.insert(
            identity.id,
            IdentityEntry {
                identity: identity.clone(),
                is_online: false,
                last_seen: None,
            },
        );
        identity
    }

    /// Register an uploaded file that is not attached to any message yet
    pub async fn insert_upload(&self, storage_key: &str, created_at: OffsetDateTime) -> Attachment {
        let mut inner = self.inner.lock().await;
        inner.next_attachment_id += 1;
        let attachment = Attachment {
            id: inner.next_attachment_id,
            storage_key: storage_key.to_string(),
            file_name: storage_key.rsplit('/').next().unwrap_or(storage_key).to_string(),
            created_at,
        };
        inner.attachments.insert(
            attachment.id,
            AttachmentEntry {
                attachment: attachment.clone(),
                message_id: None,
            },
        );
        attachment
    }

    /// Last recorded `(is_online, last_seen)` for an identity
    pub async fn presence_of(&self, id: IdentityId) -> Option<(bool, Option<OffsetDateTime>)> {
        let inner = self.inner.lock().await;
        inner.identities.get(&id).map(|e| (e.is_online, e.last_seen))
    }

    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn global_count(&self) -> usize {
        self.inner.lock().await.global.len()
    }

    pub async fn attachment_count(&self) -> usize {
        self.inner.lock().await.attachments.len()
    }

    fn check_read(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }

    async fn check_write(&self) -> StoreResult<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_read()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes failing".to_string()));
        }
        let consumed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

fn older_than(message: &Message, cursor: &HistoryCursor) -> bool {
    let id = message.id.durable().unwrap_or(i64::MAX);
    (message.created_at, id) < (cursor.created_at, cursor.id)
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_message(&self, draft: NewMessage) -> StoreResult<Message> {
        self.check_write().await?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let Some(existing) = inner.messages.iter().find(|m| {
            m.sender_id == draft.sender_id && m.client_token.as_deref() == Some(&draft.client_token)
        }) {
            return Ok(existing.clone());
        }
        for id in [draft.sender_id, draft.receiver_id] {
            if !inner.identities.contains_key(&id) {
                return Err(StoreError::Conflict(format!("identity {id} does not exist")));
            }
        }

        inner.next_message_id += 1;
        let message = draft.confirmed(inner.next_message_id);

        if let Some(descriptor) = &draft.attachment {
            let message_id = inner.next_message_id;
            let existing = inner
                .attachments
                .values_mut()
                .find(|e| e.attachment.storage_key == descriptor.storage_key);
            match existing {
                Some(entry) => entry.message_id = Some(message_id),
                None => {
                    inner.next_attachment_id += 1;
                    let id = inner.next_attachment_id;
                    inner.attachments.insert(
                        id,
                        AttachmentEntry {
                            attachment: Attachment {
                                id,
                                storage_key: descriptor.storage_key.clone(),
                                file_name: descriptor.file_name.clone(),
                                created_at: draft.created_at,
                            },
                            message_id: Some(message_id),
                        },
                    );
                }
            }
        }

        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn create_global_message(&self, draft: NewGlobalMessage) -> StoreResult<Message> {
        self.check_write().await?;
        let mut inner = self.inner.lock().await;
        inner.next_global_id += 1;
        let message = draft.confirmed(inner.next_global_id);
        inner.global.push(message.clone());
        Ok(message)
    }

    async fn get_user(&self, id: IdentityId) -> StoreResult<Option<Identity>> {
        self.check_read()?;
        let inner = self.inner.lock().await;
        Ok(inner.identities.get(&id).map(|e| e.identity.clone()))
    }

    async fn delete_identity(&self, id: IdentityId) -> StoreResult<bool> {
        self.check_write().await?;
        let mut inner = self.inner.lock().await;
        if inner.identities.remove(&id).is_none() {
            return Ok(false);
        }

        let removed: Vec<i64> = inner
            .messages
            .iter()
            .filter(|m| m.sender_id == id || m.receiver_id == Some(id))
            .filter_map(|m| m.id.durable())
            .collect();
        inner
            .messages
            .retain(|m| m.sender_id != id && m.receiver_id != Some(id));
        inner.global.retain(|m| m.sender_id != id);
        for entry in inner.attachments.values_mut() {
            if entry.message_id.is_some_and(|mid| removed.contains(&mid)) {
                entry.message_id = None;
            }
        }
        Ok(true)
    }

    async fn list_online(&self) -> StoreResult<Vec<Identity>> {
        self.check_read()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .identities
            .values()
            .filter(|e| e.is_online)
            .map(|e| e.identity.clone())
            .collect())
    }

    async fn set_presence(
        &self,
        id: IdentityId,
        is_online: bool,
        last_seen: OffsetDateTime,
    ) -> StoreResult<()> {
        self.check_write().await?;
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.identities.get_mut(&id) {
            entry.is_online = is_online;
            entry.last_seen = Some(last_seen);
        }
        Ok(())
    }

    async fn conversation_history(
        &self,
        key: ConversationKey,
        before: Option<HistoryCursor>,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        self.check_read()?;
        let inner = self.inner.lock().await;
        let mut page: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_key == Some(key))
            .filter(|m| before.as_ref().map_or(true, |c| older_than(m, c)))
            .cloned()
            .collect();
        page.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        page.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(page)
    }

    async fn get_old_attachments(&self, before: OffsetDateTime) -> StoreResult<Vec<Attachment>> {
        self.check_read()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .attachments
            .values()
            .filter(|e| e.message_id.is_none() && e.attachment.created_at < before)
            .map(|e| e.attachment.clone())
            .collect())
    }

    async fn delete_attachment(&self, id: i64) -> StoreResult<()> {
        self.check_write().await?;
        self.inner.lock().await.attachments.remove(&id);
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_read()
    }
}
