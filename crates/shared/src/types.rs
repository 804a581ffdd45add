//! Common types used across Parley

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::ValidationError;

// =============================================================================
// Identities
// =============================================================================

/// Stable numeric identity id, shared by members and guests
pub type IdentityId = i64;

/// Whether an identity is durable or ephemeral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Member,
    Guest,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Member => "member",
            IdentityKind::Guest => "guest",
        }
    }
}

impl FromStr for IdentityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(IdentityKind::Member),
            "guest" => Ok(IdentityKind::Guest),
            other => Err(format!("unknown identity kind: {other}")),
        }
    }
}

/// An addressable chat participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub kind: IdentityKind,
}

impl Identity {
    pub fn member(id: IdentityId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            kind: IdentityKind::Member,
        }
    }

    pub fn guest(id: IdentityId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            kind: IdentityKind::Guest,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.kind == IdentityKind::Guest
    }
}

/// Presence state of one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub identity_id: IdentityId,
    pub is_online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

// =============================================================================
// Conversations
// =============================================================================

/// Order-independent pairing of two identities.
///
/// Both participants of a private thread derive the same key no matter who
/// sends. Serialized as `"<low>:<high>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ConversationKey {
    low: IdentityId,
    high: IdentityId,
}

impl ConversationKey {
    pub fn between(a: IdentityId, b: IdentityId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn participants(&self) -> (IdentityId, IdentityId) {
        (self.low, self.high)
    }

    /// The participant that is not `me`, if `me` is part of the conversation
    pub fn peer_of(&self, me: IdentityId) -> Option<IdentityId> {
        if self.low == me {
            Some(self.high)
        } else if self.high == me {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

impl FromStr for ConversationKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidConversationKey(s.to_string());
        let (a, b) = s.split_once(':').ok_or_else(invalid)?;
        let a: IdentityId = a.parse().map_err(|_| invalid())?;
        let b: IdentityId = b.parse().map_err(|_| invalid())?;
        Ok(Self::between(a, b))
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Message id in one of its two lifecycle forms.
///
/// Provisional ids are minted by the gateway and never leave the provisional
/// space; confirmed ids come from the persistence collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    Provisional(u64),
    Confirmed(i64),
}

impl MessageId {
    pub fn durable(&self) -> Option<i64> {
        match self {
            MessageId::Confirmed(id) => Some(*id),
            MessageId::Provisional(_) => None,
        }
    }
}

/// Client-supplied reference to an already uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub storage_key: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
}

/// Durable attachment row, as seen by the cleanup sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub storage_key: String,
    pub file_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A private or global chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: IdentityId,
    /// Absent for global messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<IdentityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<ConversationKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
    /// Idempotency token of the submitting client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Message {
    pub fn is_global(&self) -> bool {
        self.conversation_key.is_none()
    }

    /// Pagination cursor pointing at this message, once it is durable
    pub fn cursor(&self) -> Option<HistoryCursor> {
        self.id.durable().map(|id| HistoryCursor {
            created_at: self.created_at,
            id,
        })
    }
}

/// A private message ready to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: IdentityId,
    pub receiver_id: IdentityId,
    pub conversation_key: ConversationKey,
    pub body: Option<String>,
    pub attachment: Option<AttachmentDescriptor>,
    pub client_token: String,
    pub created_at: OffsetDateTime,
}

impl NewMessage {
    fn with_id(&self, id: MessageId) -> Message {
        Message {
            id,
            sender_id: self.sender_id,
            receiver_id: Some(self.receiver_id),
            conversation_key: Some(self.conversation_key),
            body: self.body.clone(),
            attachments: self.attachment.iter().cloned().collect(),
            client_token: Some(self.client_token.clone()),
            created_at: self.created_at,
        }
    }

    pub fn provisional(&self, temp_id: u64) -> Message {
        self.with_id(MessageId::Provisional(temp_id))
    }

    pub fn confirmed(&self, durable_id: i64) -> Message {
        self.with_id(MessageId::Confirmed(durable_id))
    }
}

/// A global message ready to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGlobalMessage {
    pub sender_id: IdentityId,
    pub body: String,
    pub created_at: OffsetDateTime,
}

impl NewGlobalMessage {
    fn with_id(&self, id: MessageId) -> Message {
        Message {
            id,
            sender_id: self.sender_id,
            receiver_id: None,
            conversation_key: None,
            body: Some(self.body.clone()),
            attachments: Vec::new(),
            client_token: None,
            created_at: self.created_at,
        }
    }

    pub fn provisional(&self, temp_id: u64) -> Message {
        self.with_id(MessageId::Provisional(temp_id))
    }

    pub fn confirmed(&self, durable_id: i64) -> Message {
        self.with_id(MessageId::Confirmed(durable_id))
    }
}

/// Keyset cursor for newest-first history pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCursor {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub id: i64,
}
