//! Active-conversation controller: at most one conversation is open, and
//! user-initiated sends go through here.

use crate::error::{Error, Result};
use crate::models::{Attachment, ConversationKey, DeliveryState, Message};
use crate::network::Transport;
use crate::protocol::ClientFrame;
use crate::sync::{HistoryRequest, SyncEffect, SyncState};
use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct ActiveConversation {
    key: Option<ConversationKey>,
    generation: u64,
}

impl ActiveConversation {
    /// Bumped on every open and close.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn key(&self) -> Option<&ConversationKey> {
        self.key.as_ref()
    }

    pub fn is_open(&self, key: &ConversationKey) -> bool {
        self.key.as_ref() == Some(key)
    }
}

impl SyncState {
    pub fn open_key(&self) -> Option<&ConversationKey> {
        self.active.key()
    }

    /// Opens `key`, closing the current conversation first. Resets the
    /// unread counter and returns the history fetch to issue, or `None` if
    /// `key` was already open.
    pub fn open_conversation(
        &mut self,
        key: ConversationKey,
        now: DateTime<Utc>,
    ) -> Option<HistoryRequest> {
        if self.active.is_open(&key) {
            return None;
        }
        self.close_current();

        tracing::info!(conversation = %key, "Opening conversation");
        self.active.key = Some(key.clone());
        self.active.generation += 1;

        if self.directory.get(&key).is_none() {
            self.directory.upsert(crate::directory::DirectoryEntry {
                key: key.clone(),
                display_name: key.id().to_string(),
                profile_image: None,
                last_message: None,
                unread: 0,
            });
        }
        self.directory.set_unread(&key, 0);

        let seen_at = self
            .messages
            .latest(&key)
            .map(|m| m.timestamp.max(now))
            .unwrap_or(now);
        self.advance_watermark(&key, seen_at);

        self.emit(SyncEffect::DirectoryChanged);
        self.emit(SyncEffect::RenderHistory(key.clone()));

        Some(HistoryRequest {
            key,
            requested_at: now,
            generation: self.active.generation,
        })
    }

    /// Re-requests history for the open conversation, e.g. after a reconnect.
    pub fn refresh_open(&self, now: DateTime<Utc>) -> Option<HistoryRequest> {
        self.active.key().map(|key| HistoryRequest {
            key: key.clone(),
            requested_at: now,
            generation: self.active.generation,
        })
    }

    pub fn close_conversation(&mut self) {
        self.close_current();
        self.emit(SyncEffect::ShowPlaceholder);
    }

    fn close_current(&mut self) {
        let Some(previous) = self.active.key.take() else {
            return;
        };
        self.active.generation += 1;
        tracing::debug!(conversation = %previous, "Closing conversation");

        if self.typing.clear(&previous) {
            self.emit(SyncEffect::TypingChanged {
                conversation: previous.clone(),
                typing: Vec::new(),
            });
        }
        if let Some(latest) = self.messages.latest(&previous).map(|m| m.timestamp) {
            self.advance_watermark(&previous, latest);
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Sends a text message to the open conversation.
    ///
    /// The message is stored and rendered as `Pending` before it is handed to
    /// the transport. If the transport refuses it, it stays `Pending` (so it
    /// can be retried with [`SyncState::retry_send`]) and the error is returned.
    pub fn send_text(
        &mut self,
        transport: &dyn Transport,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let key = self.require_open()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Validation("message text is empty".into()));
        }
        self.dispatch(transport, key, text.to_string(), None, now)
    }

    pub fn send_attachment(
        &mut self,
        transport: &dyn Transport,
        attachment: Attachment,
        caption: &str,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let key = self.require_open()?;
        if attachment.url.is_empty() {
            return Err(Error::Validation("attachment has no url".into()));
        }
        self.dispatch(transport, key, caption.trim().to_string(), Some(attachment), now)
    }

    /// Re-sends an own message that is still `Pending`.
    pub fn retry_send(
        &mut self,
        transport: &dyn Transport,
        key: &ConversationKey,
        message_id: &str,
    ) -> Result<Message> {
        let message = self
            .messages
            .get_by_id(key, message_id)
            .filter(|m| m.is_from(self.self_uid()) && m.delivery == DeliveryState::Pending)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no pending message {}", message_id)))?;
        self.transmit(transport, message)
    }

    /// Tells the peer (or group) of the open conversation that we are typing.
    pub fn notify_typing(&self, transport: &dyn Transport) -> Result<()> {
        let Some(key) = self.active.key() else {
            return Ok(());
        };
        let sender = self.self_uid().to_string();
        let frame = match key {
            ConversationKey::Direct(uid) => ClientFrame::Typing { sender, receiver: uid.clone() },
            ConversationKey::Group(id) => ClientFrame::GroupTyping { group_id: id.clone(), sender },
        };
        transport.send(&frame)
    }

    fn require_open(&self) -> Result<ConversationKey> {
        self.active
            .key()
            .cloned()
            .ok_or_else(|| Error::Validation("no conversation is open".into()))
    }

    fn dispatch(
        &mut self,
        transport: &dyn Transport,
        key: ConversationKey,
        text: String,
        attachment: Option<Attachment>,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let message = Message {
            id: Some(uuid::Uuid::new_v4().to_string()),
            conversation: key.clone(),
            sender: self.self_uid().to_string(),
            text,
            attachment,
            timestamp: now,
            delivery: DeliveryState::Pending,
        };

        self.messages.append(message.clone());
        self.directory.touch(&key, &message);
        self.emit(SyncEffect::Render(message.clone()));
        self.emit(SyncEffect::DirectoryChanged);

        self.transmit(transport, message)
    }

    fn transmit(&mut self, transport: &dyn Transport, mut message: Message) -> Result<Message> {
        let mut wire = message.to_wire();
        wire.status = None;
        let frame = match &message.conversation {
            ConversationKey::Direct(_) => ClientFrame::Message(wire),
            ConversationKey::Group(_) => ClientFrame::GroupMessage(wire),
        };

        if let Err(e) = transport.send(&frame) {
            tracing::warn!(conversation = %message.conversation, "Send failed: {}", e);
            self.emit(SyncEffect::Failure(format!("message not sent: {}", e)));
            return Err(e);
        }

        let key = message.conversation.clone();
        if let Some(id) = message.id.clone() {
            if self.messages.set_delivery(&key, &id, DeliveryState::Sent) {
                self.emit(SyncEffect::DeliveryChanged {
                    conversation: key,
                    message_id: id,
                    state: DeliveryState::Sent,
                });
            }
        }
        message.delivery.advance(DeliveryState::Sent);
        Ok(message)
    }
}
