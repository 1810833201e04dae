//! Data models for Chatsync

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Conversation key
// ============================================================================

/// Selects either a direct conversation with a peer or a group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationKey {
    Direct(String),
    Group(String),
}

impl ConversationKey {
    pub fn id(&self) -> &str {
        match self {
            ConversationKey::Direct(id) | ConversationKey::Group(id) => id,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ConversationKey::Group(_))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Direct(uid) => write!(f, "direct:{}", uid),
            ConversationKey::Group(id) => write!(f, "group:{}", id),
        }
    }
}

impl FromStr for ConversationKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("direct", uid)) if !uid.is_empty() => Ok(ConversationKey::Direct(uid.to_string())),
            Some(("group", id)) if !id.is_empty() => Ok(ConversationKey::Group(id.to_string())),
            _ => Err(Error::Protocol(format!("invalid conversation key: {}", s))),
        }
    }
}

// ============================================================================
// Users, contacts and groups
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(alias = "id")]
    pub uid: String,
    #[serde(alias = "username", alias = "displayName", default)]
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(alias = "profileImage", alias = "profile_picture", default)]
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(alias = "group_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    #[serde(alias = "id")]
    pub uid: String,
    #[serde(alias = "username", alias = "displayName", default)]
    pub display_name: String,
    #[serde(alias = "profileImage", default)]
    pub profile_image: Option<String>,
}

/// The authenticated user, as persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub uid: String,
    pub email: String,
    pub display_name: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContactRequestStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRequest {
    pub id: String,
    #[serde(alias = "from")]
    pub from_uid: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(alias = "to")]
    pub to_uid: String,
    #[serde(default)]
    pub status: ContactRequestStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Messages
// ============================================================================

/// Delivery progress of a message. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    Pending,
    Sent,
    Seen,
}

impl DeliveryState {
    /// Moves to `to` if it is further along. Returns whether the state changed.
    pub fn advance(&mut self, to: DeliveryState) -> bool {
        if to > *self {
            *self = to;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub mime: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Option<String>,
    pub conversation: ConversationKey,
    pub sender: String,
    pub text: String,
    pub attachment: Option<Attachment>,
    pub timestamp: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl Message {
    pub fn fingerprint(&self) -> (&str, DateTime<Utc>, &str) {
        (&self.sender, self.timestamp, &self.text)
    }

    /// Same explicit id, or same `(sender, timestamp, text)`.
    pub fn is_duplicate_of(&self, other: &Message) -> bool {
        if let (Some(a), Some(b)) = (&self.id, &other.id) {
            if a == b {
                return true;
            }
        }
        self.fingerprint() == other.fingerprint()
    }

    pub fn is_from(&self, uid: &str) -> bool {
        self.sender == uid
    }

    /// Short single-line preview for the directory.
    pub fn preview(&self) -> String {
        const PREVIEW_CHARS: usize = 50;

        if self.text.trim().is_empty() {
            if let Some(att) = &self.attachment {
                return format!("[{}]", att.mime);
            }
        }
        let line = self.text.lines().next().unwrap_or_default();
        if line.chars().count() > PREVIEW_CHARS {
            let cut: String = line.chars().take(PREVIEW_CHARS).collect();
            format!("{}…", cut)
        } else {
            line.to_string()
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        let (receiver, group_id) = match &self.conversation {
            ConversationKey::Direct(uid) => (Some(uid.clone()), None),
            ConversationKey::Group(id) => (None, Some(id.clone())),
        };
        WireMessage {
            id: self.id.clone(),
            sender: self.sender.clone(),
            receiver,
            group_id,
            message: self.text.clone(),
            timestamp: Some(self.timestamp),
            attachment: self.attachment.clone(),
            status: Some(self.delivery),
        }
    }
}

/// A message as the backend sends it, over REST or the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(alias = "text", default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryState>,
}

impl WireMessage {
    /// Resolves the conversation from the point of view of `self_uid`.
    ///
    /// `fallback` stamps frames that arrive without a timestamp; snapshots
    /// pass `None` so such records are rejected.
    pub fn into_message(self, self_uid: &str, fallback: Option<DateTime<Utc>>) -> Result<Message> {
        if self.sender.is_empty() {
            return Err(Error::Protocol("message without sender".into()));
        }
        if self.message.is_empty() && self.attachment.is_none() {
            return Err(Error::Protocol("message without text or attachment".into()));
        }

        let conversation = match (self.group_id, self.receiver) {
            (Some(group_id), _) if !group_id.is_empty() => ConversationKey::Group(group_id),
            (_, receiver) => {
                if self.sender == self_uid {
                    match receiver {
                        Some(peer) if !peer.is_empty() => ConversationKey::Direct(peer),
                        _ => return Err(Error::Protocol("outgoing message without receiver".into())),
                    }
                } else {
                    ConversationKey::Direct(self.sender.clone())
                }
            }
        };

        let timestamp = self
            .timestamp
            .or(fallback)
            .ok_or_else(|| Error::Protocol("message without timestamp".into()))?;

        Ok(Message {
            id: self.id.filter(|id| !id.is_empty()),
            conversation,
            sender: self.sender,
            text: self.message,
            attachment: self.attachment,
            timestamp,
            delivery: self.status.unwrap_or(DeliveryState::Sent),
        })
    }
}
