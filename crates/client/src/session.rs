//! Client session state
//!
//! Folds the gateway's event stream into per-conversation views, the global
//! room, the online list and typing indicators.

use std::collections::HashMap;
use std::time::Instant;
use time::OffsetDateTime;
use uuid::Uuid;

use parley_shared::{
    AttachmentDescriptor, ClientEvent, ConversationKey, Identity, IdentityId, Message,
    MessageLimits, NewMessage, ServerEvent, ValidationError,
};

use crate::reconcile::{ConversationView, Entry, ReconcileError};
use crate::typing::TypingIndicators;

/// A private send that is already visible locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub idempotency_token: String,
    /// Command to transmit to the gateway
    pub event: ClientEvent,
}

#[derive(Debug)]
pub struct ClientSession {
    me: Identity,
    session_id: Option<Uuid>,
    limits: MessageLimits,
    conversations: HashMap<ConversationKey, ConversationView>,
    global: ConversationView,
    online: Vec<Identity>,
    typing: TypingIndicators,
}

impl ClientSession {
    pub fn new(me: Identity) -> Self {
        Self {
            global: ConversationView::global(me.id),
            me,
            session_id: None,
            limits: MessageLimits::default(),
            conversations: HashMap::new(),
            online: Vec::new(),
            typing: TypingIndicators::default(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.me
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn online(&self) -> &[Identity] {
        &self.online
    }

    pub fn is_online(&self, id: IdentityId) -> bool {
        self.online.iter().any(|identity| identity.id == id)
    }

    pub fn conversation(&self, peer: IdentityId) -> Option<&ConversationView> {
        self.conversations
            .get(&ConversationKey::between(self.me.id, peer))
    }

    fn conversation_mut(&mut self, peer: IdentityId) -> &mut ConversationView {
        let me = self.me.id;
        self.conversations
            .entry(ConversationKey::between(me, peer))
            .or_insert_with(|| ConversationView::private(me, peer))
    }

    pub fn global(&self) -> &ConversationView {
        &self.global
    }

    /// Show a private send immediately and build the command that carries it
    pub fn submit_private(
        &mut self,
        peer: IdentityId,
        body: Option<String>,
        attachment: Option<AttachmentDescriptor>,
    ) -> Result<Submitted, ValidationError> {
        let token = Uuid::new_v4().simple().to_string();
        let body = self
            .limits
            .check_private(peer, body.as_deref(), attachment.as_ref(), &token)?;

        let draft = NewMessage {
            sender_id: self.me.id,
            receiver_id: peer,
            conversation_key: ConversationKey::between(self.me.id, peer),
            body: body.clone(),
            attachment: attachment.clone(),
            client_token: token.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.conversation_mut(peer).submit(&draft);

        Ok(Submitted {
            idempotency_token: token.clone(),
            event: ClientEvent::SendPrivateMessage {
                receiver_id: peer,
                body,
                attachment,
                idempotency_token: token,
            },
        })
    }

    /// Merge a history page fetched for the conversation with `peer`
    pub fn apply_history(&mut self, peer: IdentityId, page: Vec<Message>) -> usize {
        self.conversation_mut(peer).apply_history(page)
    }

    pub fn retry(&mut self, peer: IdentityId, token: &str) -> Result<ClientEvent, ReconcileError> {
        self.conversation_mut(peer).retry(token)
    }

    pub fn discard(&mut self, peer: IdentityId, token: &str) -> Result<Entry, ReconcileError> {
        self.conversation_mut(peer).discard(token)
    }

    /// Identities typing to me at `now`
    pub fn typing(&self, now: Instant) -> Vec<IdentityId> {
        self.typing.typing(now)
    }

    /// Apply one server event received at `now`. Returns whether any visible
    /// state changed.
    pub fn apply(&mut self, event: ServerEvent, now: Instant) -> bool {
        match event {
            ServerEvent::Connected {
                session_id,
                identity,
            } => {
                self.session_id = Some(session_id);
                self.me = identity;
                true
            }

            ServerEvent::PresenceChanged { online } => {
                let changed = self.online != online;
                self.online = online;
                changed
            }

            ServerEvent::NewMessage { message } | ServerEvent::MessageAccepted { message, .. } => {
                self.apply_private(message)
            }

            ServerEvent::MessageSendFailed {
                idempotency_token,
                reason,
            } => self.fail_send(&idempotency_token, &reason),

            ServerEvent::TypingChanged { from_id, is_typing } => {
                self.typing.apply(from_id, is_typing, now);
                true
            }

            ServerEvent::GlobalMessage { message } => self.global.apply_live(message),

            ServerEvent::Pong => false,

            ServerEvent::Error {
                message,
                idempotency_token,
            } => match idempotency_token {
                Some(token) => self.fail_send(&token, &message),
                None => {
                    tracing::warn!(error = %message, "Gateway reported an error");
                    false
                }
            },
        }
    }

    fn apply_private(&mut self, message: Message) -> bool {
        let Some(peer) = message
            .conversation_key
            .and_then(|key| key.peer_of(self.me.id))
        else {
            tracing::debug!(message_id = ?message.id, "Ignoring message not addressed to me");
            return false;
        };
        self.conversation_mut(peer).apply_live(message)
    }

    fn fail_send(&mut self, token: &str, reason: &str) -> bool {
        match self
            .conversations
            .values_mut()
            .find(|view| view.has_token(token))
        {
            Some(view) => view.apply_send_failed(token, reason),
            None => {
                tracing::debug!(idempotency_token = %token, "Failure for unknown send");
                false
            }
        }
    }
}
