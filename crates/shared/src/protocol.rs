//! WebSocket event types and serialization
//!
//! Defines all client-to-server and server-to-client event types
//! with type-safe serde serialization.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AttachmentDescriptor, Identity, IdentityId, Message};

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Commands sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Send a private message to one identity
    SendPrivateMessage {
        receiver_id: IdentityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<AttachmentDescriptor>,
        idempotency_token: String,
    },

    /// Post to the global room
    SendGlobalMessage { body: String },

    /// Start typing to an identity
    TypingStart { receiver_id: IdentityId },

    /// Stop typing to an identity
    TypingStop { receiver_id: IdentityId },

    /// Heartbeat ping to keep connection alive
    Ping,
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection acknowledged
    Connected {
        session_id: Uuid,
        identity: Identity,
    },

    /// The set of online identities changed (full list)
    PresenceChanged { online: Vec<Identity> },

    /// Message addressed to this identity (provisional or durable)
    NewMessage { message: Message },

    /// Echo of a private send back to its sender
    MessageAccepted {
        idempotency_token: String,
        message: Message,
    },

    /// A private send could not be made durable
    MessageSendFailed {
        idempotency_token: String,
        reason: String,
    },

    /// Typing indicator from another identity
    TypingChanged { from_id: IdentityId, is_typing: bool },

    /// Message posted to the global room
    GlobalMessage { message: Message },

    /// Heartbeat response
    Pong,

    /// Error message
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idempotency_token: Option<String>,
    },
}

impl ServerEvent {
    /// Short event name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::PresenceChanged { .. } => "presence_changed",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::MessageAccepted { .. } => "message_accepted",
            ServerEvent::MessageSendFailed { .. } => "message_send_failed",
            ServerEvent::TypingChanged { .. } => "typing_changed",
            ServerEvent::GlobalMessage { .. } => "global_message",
            ServerEvent::Pong => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_deserialization() {
        let json = r#"{"type":"send_private_message","receiver_id":2,"body":"hi","idempotency_token":"t1"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::SendPrivateMessage {
                receiver_id,
                body,
                attachment,
                idempotency_token,
            } => {
                assert_eq!(receiver_id, 2);
                assert_eq!(body.as_deref(), Some("hi"));
                assert!(attachment.is_none());
                assert_eq!(idempotency_token, "t1");
            }
            _ => panic!("Expected SendPrivateMessage event"),
        }
    }

    #[test]
    fn test_server_event_serialization() {
        let event = ServerEvent::Pong;
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_send_failed_serialization() {
        let event = ServerEvent::MessageSendFailed {
            idempotency_token: "t1".to_string(),
            reason: "store unavailable".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"message_send_failed""#));
        assert!(json.contains(r#""idempotency_token":"t1""#));
    }

    #[test]
    fn test_typing_events() {
        let json = r#"{"type":"typing_stop","receiver_id":5}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, ClientEvent::TypingStop { receiver_id: 5 });
    }
}
