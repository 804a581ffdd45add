//! Receiver-side typing indicators
//!
//! A typing start that is never followed by a stop expires on its own after
//! a fixed timeout. Whether someone is typing is a pure function of the
//! signals received and the current instant.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parley_shared::IdentityId;

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TypingIndicators {
    timeout: Duration,
    started: HashMap<IdentityId, Instant>,
}

impl Default for TypingIndicators {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_TIMEOUT)
    }
}

impl TypingIndicators {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            started: HashMap::new(),
        }
    }

    /// Record a typing signal received at `now`
    pub fn apply(&mut self, from_id: IdentityId, is_typing: bool, now: Instant) {
        if is_typing {
            self.started.insert(from_id, now);
        } else {
            self.started.remove(&from_id);
        }
    }

    pub fn is_typing(&self, from_id: IdentityId, now: Instant) -> bool {
        self.started
            .get(&from_id)
            .is_some_and(|since| now.saturating_duration_since(*since) < self.timeout)
    }

    /// Identities currently typing, ordered by id
    pub fn typing(&self, now: Instant) -> Vec<IdentityId> {
        let mut ids: Vec<IdentityId> = self
            .started
            .keys()
            .copied()
            .filter(|id| self.is_typing(*id, now))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Forget expired indicators
    pub fn prune(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.started
            .retain(|_, since| now.saturating_duration_since(*since) < timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_without_stop_expires() {
        let t0 = Instant::now();
        let mut typing = TypingIndicators::new(Duration::from_secs(5));

        typing.apply(2, true, t0);
        assert!(typing.is_typing(2, t0 + Duration::from_secs(4)));
        assert!(!typing.is_typing(2, t0 + Duration::from_secs(5)));
        assert!(typing.typing(t0 + Duration::from_secs(6)).is_empty());
    }

    #[test]
    fn test_stop_clears_and_new_pulse_extends() {
        let t0 = Instant::now();
        let mut typing = TypingIndicators::default();

        typing.apply(2, true, t0);
        typing.apply(3, true, t0);
        typing.apply(2, false, t0 + Duration::from_secs(1));
        assert_eq!(typing.typing(t0 + Duration::from_secs(1)), vec![3]);

        typing.apply(3, true, t0 + Duration::from_secs(4));
        assert!(typing.is_typing(3, t0 + Duration::from_secs(8)));
    }

    #[test]
    fn test_prune_drops_expired() {
        let t0 = Instant::now();
        let mut typing = TypingIndicators::new(Duration::from_secs(1));
        typing.apply(2, true, t0);
        typing.prune(t0 + Duration::from_secs(2));
        assert!(typing.started.is_empty());
    }
}
