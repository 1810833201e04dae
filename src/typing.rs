//! Ephemeral typing indicators with a wall-clock expiry.

use crate::models::ConversationKey;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct TypingTracker {
    ttl: Duration,
    signals: HashMap<(ConversationKey, String), Instant>,
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            signals: HashMap::new(),
        }
    }

    /// Records or refreshes a signal. Returns `true` if `sender` was not
    /// already shown as typing in `key`.
    pub fn record(&mut self, key: &ConversationKey, sender: &str, now: Instant) -> bool {
        self.signals
            .insert((key.clone(), sender.to_string()), now + self.ttl)
            .map(|expiry| expiry <= now)
            .unwrap_or(true)
    }

    /// Senders currently typing in `key`, sorted.
    pub fn active(&self, key: &ConversationKey, now: Instant) -> Vec<String> {
        self.signals
            .iter()
            .filter(|((k, _), expiry)| k == key && **expiry > now)
            .map(|((_, sender), _)| sender.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Drops expired signals and returns the conversations that lost one.
    pub fn expire(&mut self, now: Instant) -> Vec<ConversationKey> {
        let mut changed = BTreeSet::new();
        self.signals.retain(|(key, _), expiry| {
            if *expiry <= now {
                changed.insert(key.clone());
                false
            } else {
                true
            }
        });
        changed.into_iter().collect()
    }

    pub fn clear(&mut self, key: &ConversationKey) -> bool {
        let before = self.signals.len();
        self.signals.retain(|(k, _), _| k != key);
        before != self.signals.len()
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_expires_after_ttl() {
        let mut tracker = TypingTracker::default();
        let key = ConversationKey::Direct("bob".into());
        let t0 = Instant::now();

        assert!(tracker.record(&key, "bob", t0));
        assert_eq!(tracker.active(&key, t0 + Duration::from_millis(1500)), vec!["bob"]);
        assert!(tracker.active(&key, t0 + Duration::from_millis(2000)).is_empty());

        assert!(tracker.expire(t0 + Duration::from_millis(1999)).is_empty());
        assert_eq!(tracker.expire(t0 + Duration::from_millis(2500)), vec![key.clone()]);
        assert!(tracker.expire(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_refresh_extends_expiry() {
        let mut tracker = TypingTracker::default();
        let key = ConversationKey::Group("g".into());
        let t0 = Instant::now();

        tracker.record(&key, "bob", t0);
        assert!(!tracker.record(&key, "bob", t0 + Duration::from_millis(1500)));
        assert_eq!(tracker.active(&key, t0 + Duration::from_millis(3000)), vec!["bob"]);
    }

    #[test]
    fn test_clear_only_affects_one_conversation() {
        let mut tracker = TypingTracker::default();
        let a = ConversationKey::Group("a".into());
        let b = ConversationKey::Group("b".into());
        let t0 = Instant::now();

        tracker.record(&a, "bob", t0);
        tracker.record(&b, "carol", t0);
        assert!(tracker.clear(&a));
        assert!(!tracker.clear(&a));
        assert!(tracker.active(&a, t0).is_empty());
        assert_eq!(tracker.active(&b, t0), vec!["carol"]);
    }
}
