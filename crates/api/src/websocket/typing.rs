//! Typing indicator relay
//!
//! Typing signals are never stored. A start pulse may be dropped when the
//! receiver is behind; a stop is always queued so an indicator cannot get
//! stuck, and a start queued before it is never written after it. Receivers
//! expire indicators on their own as a safety net.

use std::sync::Arc;

use parley_shared::{IdentityId, ServerEvent};

use super::gateway::Gateway;

pub struct TypingRelay {
    gateway: Arc<Gateway>,
}

impl TypingRelay {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub async fn start_typing(&self, from_id: IdentityId, to_id: IdentityId) -> usize {
        self.gateway
            .try_send_to_identity(
                to_id,
                ServerEvent::TypingChanged {
                    from_id,
                    is_typing: true,
                },
            )
            .await
    }

    pub async fn stop_typing(&self, from_id: IdentityId, to_id: IdentityId) -> usize {
        self.gateway
            .send_to_identity(
                to_id,
                ServerEvent::TypingChanged {
                    from_id,
                    is_typing: false,
                },
            )
            .await
    }
}
