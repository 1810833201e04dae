//! Per-conversation message logs, ordered by timestamp.

use crate::models::{ConversationKey, DeliveryState, Message};
use chrono::NaiveDate;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MessageStore {
    logs: HashMap<ConversationKey, Vec<Message>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `message` at its timestamp position.
    ///
    /// Returns `false` if the log already holds the same message (same id, or
    /// same sender, timestamp and text). The stored copy may still pick up a
    /// server id and a more advanced delivery state from the duplicate.
    pub fn append(&mut self, message: Message) -> bool {
        let log = self.logs.entry(message.conversation.clone()).or_default();

        if let Some(existing) = log.iter_mut().find(|m| m.is_duplicate_of(&message)) {
            if existing.id.is_none() {
                existing.id = message.id;
            }
            existing.delivery.advance(message.delivery);
            return false;
        }

        // Ties keep arrival order.
        let pos = log.partition_point(|m| m.timestamp <= message.timestamp);
        log.insert(pos, message);
        true
    }

    /// Merges a fetched snapshot into the log of `key`.
    ///
    /// Messages already present (including ones appended live while the
    /// fetch was in flight) are kept; nothing is removed. Returns the
    /// messages that were not stored before, in snapshot order.
    pub fn replace_all(&mut self, key: &ConversationKey, messages: Vec<Message>) -> Vec<Message> {
        let mut inserted = Vec::new();
        for message in messages {
            if &message.conversation != key {
                tracing::warn!(
                    conversation = %key,
                    other = %message.conversation,
                    "Skipping snapshot message for another conversation"
                );
                continue;
            }
            if self.append(message.clone()) {
                inserted.push(message);
            }
        }
        // Keep an empty log so the conversation counts as loaded.
        self.logs.entry(key.clone()).or_default();
        inserted
    }

    pub fn messages(&self, key: &ConversationKey) -> &[Message] {
        self.logs.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self, key: &ConversationKey) -> usize {
        self.messages(key).len()
    }

    pub fn latest(&self, key: &ConversationKey) -> Option<&Message> {
        self.messages(key).last()
    }

    pub fn get_by_id(&self, key: &ConversationKey, id: &str) -> Option<&Message> {
        self.messages(key).iter().find(|m| m.id.as_deref() == Some(id))
    }

    /// Advances the delivery state of a stored message.
    pub fn set_delivery(&mut self, key: &ConversationKey, id: &str, state: DeliveryState) -> bool {
        self.logs
            .get_mut(key)
            .and_then(|log| log.iter_mut().find(|m| m.id.as_deref() == Some(id)))
            .map(|m| m.delivery.advance(state))
            .unwrap_or(false)
    }

    /// Date-grouped view of one conversation, oldest day first.
    pub fn group_by_date(&self, key: &ConversationKey) -> DateGroups<'_> {
        DateGroups { rest: self.messages(key) }
    }
}

/// Messages of one calendar day (UTC).
#[derive(Debug, Clone, PartialEq)]
pub struct DateGroup<'a> {
    pub date: NaiveDate,
    pub messages: &'a [Message],
}

impl DateGroup<'_> {
    pub fn label(&self, today: NaiveDate) -> String {
        if self.date == today {
            "Today".to_string()
        } else if today.pred_opt() == Some(self.date) {
            "Yesterday".to_string()
        } else {
            self.date.format("%B %-d, %Y").to_string()
        }
    }
}

/// Lazy iterator over [`DateGroup`]s. Clone it to restart.
#[derive(Debug, Clone)]
pub struct DateGroups<'a> {
    rest: &'a [Message],
}

impl<'a> Iterator for DateGroups<'a> {
    type Item = DateGroup<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let date = self.rest.first()?.timestamp.date_naive();
        let len = self
            .rest
            .iter()
            .take_while(|m| m.timestamp.date_naive() == date)
            .count();
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Some(DateGroup { date, messages: head })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn key() -> ConversationKey {
        ConversationKey::Direct("bob".into())
    }

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 8, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn msg(text: &str, hours: i64) -> Message {
        Message {
            id: None,
            conversation: key(),
            sender: "bob".into(),
            text: text.into(),
            attachment: None,
            timestamp: at(hours),
            delivery: DeliveryState::Sent,
        }
    }

    fn texts(store: &MessageStore) -> Vec<String> {
        store.messages(&key()).iter().map(|m| m.text.clone()).collect()
    }

    #[test]
    fn test_append_is_idempotent() {
        let mut store = MessageStore::new();
        assert!(store.append(msg("hi", 0)));
        assert!(!store.append(msg("hi", 0)));
        assert_eq!(store.len(&key()), 1);
    }

    #[test]
    fn test_append_keeps_timestamp_order() {
        let mut store = MessageStore::new();
        store.append(msg("c", 3));
        store.append(msg("a", 1));
        store.append(msg("b", 2));
        assert_eq!(texts(&store), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_adopts_id_and_advances_delivery() {
        let mut store = MessageStore::new();
        let mut local = msg("hi", 0);
        local.delivery = DeliveryState::Pending;
        store.append(local);

        let mut server = msg("hi", 0);
        server.id = Some("srv-1".into());
        server.delivery = DeliveryState::Seen;
        assert!(!store.append(server));

        let stored = store.get_by_id(&key(), "srv-1").unwrap();
        assert_eq!(stored.delivery, DeliveryState::Seen);

        let mut stale = msg("hi", 0);
        stale.id = Some("srv-1".into());
        stale.delivery = DeliveryState::Sent;
        store.append(stale);
        assert_eq!(store.latest(&key()).unwrap().delivery, DeliveryState::Seen);
    }

    #[test]
    fn test_same_id_different_content_is_duplicate() {
        let mut store = MessageStore::new();
        let mut a = msg("first", 0);
        a.id = Some("m1".into());
        let mut b = msg("edited", 1);
        b.id = Some("m1".into());
        store.append(a);
        assert!(!store.append(b));
        assert_eq!(texts(&store), vec!["first"]);
    }

    #[test]
    fn test_replace_all_merges_with_live_messages() {
        let mut store = MessageStore::new();
        store.append(msg("live", 2));

        let inserted = store.replace_all(&key(), vec![msg("old", 1), msg("live", 2), msg("new", 3)]);
        assert_eq!(inserted.len(), 2);
        assert_eq!(texts(&store), vec!["old", "live", "new"]);
    }

    #[test]
    fn test_replace_all_skips_foreign_messages() {
        let mut store = MessageStore::new();
        let mut foreign = msg("x", 1);
        foreign.conversation = ConversationKey::Group("g".into());
        let inserted = store.replace_all(&key(), vec![foreign]);
        assert!(inserted.is_empty());
        assert_eq!(store.len(&key()), 0);
        assert_eq!(store.len(&ConversationKey::Group("g".into())), 0);
    }

    #[test]
    fn test_set_delivery_is_monotonic() {
        let mut store = MessageStore::new();
        let mut m = msg("hi", 0);
        m.id = Some("m1".into());
        m.delivery = DeliveryState::Pending;
        store.append(m);

        assert!(store.set_delivery(&key(), "m1", DeliveryState::Seen));
        assert!(!store.set_delivery(&key(), "m1", DeliveryState::Sent));
        assert!(!store.set_delivery(&key(), "missing", DeliveryState::Sent));
    }

    #[test]
    fn test_group_by_date_is_restartable() {
        let mut store = MessageStore::new();
        store.append(msg("mon-1", 0));
        store.append(msg("mon-2", 2));
        store.append(msg("tue-1", 24));
        store.append(msg("thu-1", 72));

        let groups = store.group_by_date(&key());
        let sizes: Vec<usize> = groups.clone().map(|g| g.messages.len()).collect();
        assert_eq!(sizes, vec![2, 1, 1]);

        let dates: Vec<NaiveDate> = groups.map(|g| g.date).collect();
        assert_eq!(dates[0], NaiveDate::from_ymd_opt(2025, 3, 4).unwrap());
        assert_eq!(dates[2], NaiveDate::from_ymd_opt(2025, 3, 7).unwrap());
    }

    #[test]
    fn test_group_labels() {
        let mut store = MessageStore::new();
        store.append(msg("a", 0));
        store.append(msg("b", 24));
        store.append(msg("c", 48));
        let today = NaiveDate::from_ymd_opt(2025, 3, 6).unwrap();

        let labels: Vec<String> = store.group_by_date(&key()).map(|g| g.label(today)).collect();
        assert_eq!(labels, vec!["March 4, 2025", "Yesterday", "Today"]);
    }

    #[test]
    fn test_group_by_date_of_unknown_conversation_is_empty() {
        let store = MessageStore::new();
        assert_eq!(store.group_by_date(&key()).count(), 0);
    }
}
