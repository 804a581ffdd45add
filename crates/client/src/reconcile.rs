//! Conversation reconciliation
//!
//! A [`ConversationView`] merges three sources into one ordered list:
//! pages of durable history, messages streamed live by the gateway, and
//! sends the user made that the server has not confirmed yet.
//!
//! Entries carrying an idempotency token are keyed by `(sender, token)`, so
//! the local optimistic copy, the provisional echo and the durable row of
//! one send always collapse into a single entry. Entries without a token
//! are keyed by their id. A source never downgrades an entry: a confirmed
//! message is not replaced by a late provisional copy of itself.

use serde::Serialize;
use std::collections::HashMap;

use parley_shared::{
    ClientEvent, ConversationKey, HistoryCursor, IdentityId, Message, MessageId, NewMessage,
};

/// Where an entry is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    /// Shown locally, not yet acknowledged by the server
    Sending,
    /// Delivered by the server, not yet durable
    Delivered,
    /// The server could not accept or store it; kept until retried or discarded
    Failed { reason: String },
    /// Durable
    Confirmed,
}

impl EntryStatus {
    fn rank(&self) -> u8 {
        match self {
            EntryStatus::Sending => 0,
            EntryStatus::Delivered => 1,
            EntryStatus::Failed { .. } => 2,
            EntryStatus::Confirmed => 3,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, EntryStatus::Failed { .. })
    }
}

/// One visible line of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub message: Message,
    pub status: EntryStatus,
}

impl Entry {
    pub fn idempotency_token(&self) -> Option<&str> {
        self.message.client_token.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntryKey {
    Token(IdentityId, String),
    Durable(i64),
    Provisional(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("no message with idempotency token {0}")]
    UnknownToken(String),
    #[error("message {0} has not failed")]
    NotFailed(String),
}

/// Merged view of one private conversation, or of the global room
#[derive(Debug, Clone)]
pub struct ConversationView {
    me: IdentityId,
    /// `None` for the global room
    key: Option<ConversationKey>,
    entries: HashMap<EntryKey, Entry>,
    by_durable: HashMap<i64, EntryKey>,
    oldest: Option<HistoryCursor>,
    exhausted: bool,
}

impl ConversationView {
    pub fn private(me: IdentityId, peer: IdentityId) -> Self {
        Self::new(me, Some(ConversationKey::between(me, peer)))
    }

    pub fn global(me: IdentityId) -> Self {
        Self::new(me, None)
    }

    fn new(me: IdentityId, key: Option<ConversationKey>) -> Self {
        Self {
            me,
            key,
            entries: HashMap::new(),
            by_durable: HashMap::new(),
            oldest: None,
            exhausted: false,
        }
    }

    pub fn conversation_key(&self) -> Option<ConversationKey> {
        self.key
    }

    /// Whether `message` belongs in this view
    pub fn accepts(&self, message: &Message) -> bool {
        match self.key {
            Some(key) => message.conversation_key == Some(key),
            None => message.is_global(),
        }
    }

    /// Show a local send immediately. Returns false if the token is already
    /// in use.
    pub fn submit(&mut self, draft: &NewMessage) -> bool {
        let message = draft.provisional(0);
        if !self.accepts(&message) {
            return false;
        }
        let key = EntryKey::Token(draft.sender_id, draft.client_token.clone());
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(
            key,
            Entry {
                message,
                status: EntryStatus::Sending,
            },
        );
        true
    }

    /// Merge one newest-first history page and advance the pagination
    /// cursor. An empty page marks the history as exhausted.
    pub fn apply_history(&mut self, page: Vec<Message>) -> usize {
        if page.is_empty() {
            self.exhausted = true;
            return 0;
        }

        let mut changed = 0;
        for message in page {
            let Some(cursor) = message.cursor() else {
                continue;
            };
            if self
                .oldest
                .map_or(true, |oldest| (cursor.created_at, cursor.id) < (oldest.created_at, oldest.id))
            {
                self.oldest = Some(cursor);
            }
            if self.merge(message, EntryStatus::Confirmed) {
                changed += 1;
            }
        }
        changed
    }

    /// Merge a message streamed by the gateway (new message, acceptance echo
    /// or global broadcast). Returns whether the view changed.
    pub fn apply_live(&mut self, message: Message) -> bool {
        let status = match message.id {
            MessageId::Confirmed(_) => EntryStatus::Confirmed,
            MessageId::Provisional(_) => EntryStatus::Delivered,
        };
        self.merge(message, status)
    }

    /// Mark one of my sends as failed. A send that is already durable stays
    /// confirmed.
    pub fn apply_send_failed(&mut self, token: &str, reason: &str) -> bool {
        let key = EntryKey::Token(self.me, token.to_string());
        match self.entries.get_mut(&key) {
            Some(entry) if entry.status != EntryStatus::Confirmed => {
                entry.status = EntryStatus::Failed {
                    reason: reason.to_string(),
                };
                true
            }
            _ => false,
        }
    }

    /// Whether one of my sends with this token is in the view
    pub fn has_token(&self, token: &str) -> bool {
        self.entries
            .contains_key(&EntryKey::Token(self.me, token.to_string()))
    }

    /// Put a failed send back into `Sending` and return the command that
    /// resends it under the same token
    pub fn retry(&mut self, token: &str) -> Result<ClientEvent, ReconcileError> {
        let key = EntryKey::Token(self.me, token.to_string());
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| ReconcileError::UnknownToken(token.to_string()))?;
        if !entry.status.is_failed() {
            return Err(ReconcileError::NotFailed(token.to_string()));
        }
        let Some(receiver_id) = entry.message.receiver_id else {
            return Err(ReconcileError::UnknownToken(token.to_string()));
        };

        entry.status = EntryStatus::Sending;
        Ok(ClientEvent::SendPrivateMessage {
            receiver_id,
            body: entry.message.body.clone(),
            attachment: entry.message.attachments.first().cloned(),
            idempotency_token: token.to_string(),
        })
    }

    /// Drop a failed send from the view
    pub fn discard(&mut self, token: &str) -> Result<Entry, ReconcileError> {
        let key = EntryKey::Token(self.me, token.to_string());
        match self.entries.get(&key).map(|entry| entry.status.is_failed()) {
            None => Err(ReconcileError::UnknownToken(token.to_string())),
            Some(false) => Err(ReconcileError::NotFailed(token.to_string())),
            Some(true) => self
                .entries
                .remove(&key)
                .ok_or_else(|| ReconcileError::UnknownToken(token.to_string())),
        }
    }

    /// Entries ordered oldest first by creation time, id as tie-break
    pub fn visible(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            (a.message.created_at, a.message.id, &a.message.client_token).cmp(&(
                b.message.created_at,
                b.message.id,
                &b.message.client_token,
            ))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cursor for fetching the next older history page
    pub fn oldest_cursor(&self) -> Option<HistoryCursor> {
        self.oldest
    }

    pub fn history_exhausted(&self) -> bool {
        self.exhausted
    }

    fn key_for(&self, message: &Message) -> EntryKey {
        if let Some(key) = message
            .id
            .durable()
            .and_then(|id| self.by_durable.get(&id))
        {
            return key.clone();
        }
        match (&message.client_token, message.id) {
            (Some(token), _) => EntryKey::Token(message.sender_id, token.clone()),
            (None, MessageId::Confirmed(id)) => EntryKey::Durable(id),
            (None, MessageId::Provisional(id)) => EntryKey::Provisional(id),
        }
    }

    fn merge(&mut self, message: Message, status: EntryStatus) -> bool {
        if !self.accepts(&message) {
            tracing::debug!(message_id = ?message.id, "Ignoring message for another conversation");
            return false;
        }

        let key = self.key_for(&message);
        if let Some(id) = message.id.durable() {
            self.by_durable.insert(id, key.clone());
        }

        match self.entries.get_mut(&key) {
            Some(existing) if existing.status.rank() > status.rank() => false,
            Some(existing) => {
                let changed = existing.message != message || existing.status != status;
                existing.message = message;
                existing.status = status;
                changed
            }
            None => {
                self.entries.insert(key, Entry { message, status });
                true
            }
        }
    }
}
