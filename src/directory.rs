//! Contact and group directory: the sidebar list with previews and unread
//! counters, kept in most-recent-activity-first order.

use crate::models::{Contact, ConversationKey, Group, Message};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct MessagePreview {
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub key: ConversationKey,
    pub display_name: String,
    pub profile_image: Option<String>,
    pub last_message: Option<MessagePreview>,
    pub unread: u32,
}

impl DirectoryEntry {
    pub fn contact(contact: &Contact) -> Self {
        let display_name = if contact.display_name.is_empty() {
            contact.email.clone().unwrap_or_else(|| contact.uid.clone())
        } else {
            contact.display_name.clone()
        };
        Self {
            key: ConversationKey::Direct(contact.uid.clone()),
            display_name,
            profile_image: contact.profile_image.clone(),
            last_message: None,
            unread: 0,
        }
    }

    pub fn group(group: &Group) -> Self {
        Self {
            key: ConversationKey::Group(group.id.clone()),
            display_name: group.name.clone(),
            profile_image: None,
            last_message: None,
            unread: 0,
        }
    }

    fn placeholder(key: &ConversationKey) -> Self {
        Self {
            key: key.clone(),
            display_name: key.id().to_string(),
            profile_image: None,
            last_message: None,
            unread: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct DirectoryCache {
    entries: HashMap<ConversationKey, DirectoryEntry>,
    order: Vec<ConversationKey>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&DirectoryEntry> {
        self.entries.get(key)
    }

    /// Inserts a new entry at the end, or merges name and picture into an
    /// existing one. Never reorders and never touches preview or unread.
    pub fn upsert(&mut self, entry: DirectoryEntry) -> bool {
        match self.entries.get_mut(&entry.key) {
            Some(existing) => {
                let mut changed = false;
                if !entry.display_name.is_empty() && existing.display_name != entry.display_name {
                    existing.display_name = entry.display_name;
                    changed = true;
                }
                if entry.profile_image.is_some() && existing.profile_image != entry.profile_image {
                    existing.profile_image = entry.profile_image;
                    changed = true;
                }
                changed
            }
            None => {
                self.order.push(entry.key.clone());
                self.entries.insert(entry.key.clone(), entry);
                true
            }
        }
    }

    /// Applies a profile change pushed by the server for a direct contact.
    pub fn update_profile(
        &mut self,
        uid: &str,
        display_name: Option<&str>,
        profile_image: Option<&str>,
    ) -> bool {
        let key = ConversationKey::Direct(uid.to_string());
        let Some(existing) = self.entries.get(&key) else {
            return false;
        };
        let entry = DirectoryEntry {
            key,
            display_name: display_name.unwrap_or_default().to_string(),
            profile_image: profile_image.map(str::to_string),
            last_message: None,
            unread: existing.unread,
        };
        self.upsert(entry)
    }

    /// Records a live message: the entry always moves to the front. The
    /// preview only changes if `message` is not older than the stored one,
    /// so a delayed frame cannot overwrite a newer preview.
    pub fn touch(&mut self, key: &ConversationKey, message: &Message) -> bool {
        let updated = self.set_preview(key, message);
        self.move_to_front(key);
        updated
    }

    /// Records the newest message of a fetched snapshot. Only a newer
    /// message changes the preview, and the entry is placed by the preview
    /// timestamp rather than at the front.
    pub fn backfill(&mut self, key: &ConversationKey, message: &Message) -> bool {
        if !self.set_preview(key, message) {
            return false;
        }
        self.order.retain(|k| k != key);
        let pos = self
            .order
            .iter()
            .position(|k| {
                self.entries
                    .get(k)
                    .and_then(|e| e.last_message.as_ref())
                    .map_or(true, |p| p.timestamp <= message.timestamp)
            })
            .unwrap_or(self.order.len());
        self.order.insert(pos, key.clone());
        true
    }

    fn set_preview(&mut self, key: &ConversationKey, message: &Message) -> bool {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| DirectoryEntry::placeholder(key));

        if let Some(preview) = &entry.last_message {
            if message.timestamp < preview.timestamp {
                return false;
            }
        }

        entry.last_message = Some(MessagePreview {
            sender: message.sender.clone(),
            text: message.preview(),
            timestamp: message.timestamp,
        });
        true
    }

    pub fn set_unread(&mut self, key: &ConversationKey, count: u32) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.unread = count;
        }
    }

    /// Returns the new count, or `None` if the key is unknown.
    pub fn increment_unread(&mut self, key: &ConversationKey) -> Option<u32> {
        self.entries.get_mut(key).map(|entry| {
            entry.unread = entry.unread.saturating_add(1);
            entry.unread
        })
    }

    pub fn unread(&self, key: &ConversationKey) -> u32 {
        self.entries.get(key).map(|e| e.unread).unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.entries.values().map(|e| e.unread).sum()
    }

    /// Entries in recency order, optionally narrowed by a case-insensitive
    /// substring of the display name.
    pub fn list(&self, filter: Option<&str>) -> Vec<&DirectoryEntry> {
        let needle = filter
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty());

        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .filter(|entry| match &needle {
                Some(needle) => entry.display_name.to_lowercase().contains(needle.as_str()),
                None => true,
            })
            .collect()
    }

    /// Explicit removal after the server confirmed it.
    pub fn remove(&mut self, key: &ConversationKey) -> Option<DirectoryEntry> {
        self.order.retain(|k| k != key);
        self.entries.remove(key)
    }

    fn move_to_front(&mut self, key: &ConversationKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if pos == 0 {
                return;
            }
            let k = self.order.remove(pos);
            self.order.insert(0, k);
        } else {
            self.order.insert(0, key.clone());
        }
    }
}
