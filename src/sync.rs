//! Event router and synchronizer.
//!
//! [`SyncState`] reconciles live socket events and REST snapshots into the
//! directory and the message store. It performs no I/O: every decision that
//! needs the outside world (rendering, fetching, persisting) is queued as a
//! [`SyncEffect`] and collected by the caller with
//! [`SyncState::drain_effects`].

use crate::conversation::ActiveConversation;
use crate::directory::{DirectoryCache, DirectoryEntry};
use crate::error::Result;
use crate::models::{
    Contact, ContactRequest, ConversationKey, DeliveryState, Group, GroupMember, Message,
    WireMessage,
};
use crate::protocol::{ServerEvent, SignalEvent, SignalKind, SignalPayload};
use crate::store::MessageStore;
use crate::typing::TypingTracker;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// A history fetch issued by `open_conversation` (or a refresh), to be
/// resolved with [`SyncState::apply_history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub key: ConversationKey,
    pub requested_at: DateTime<Utc>,
    /// Value of the active-conversation generation when the request was made.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEffect {
    /// Append one message to the open conversation view.
    Render(Message),
    /// Redraw the open conversation from the store.
    RenderHistory(ConversationKey),
    /// No conversation is open.
    ShowPlaceholder,
    DeliveryChanged {
        conversation: ConversationKey,
        message_id: String,
        state: DeliveryState,
    },
    DirectoryChanged,
    TypingChanged {
        conversation: ConversationKey,
        typing: Vec<String>,
    },
    ContactRequestsChanged,
    FetchContacts,
    FetchGroups,
    FetchContactRequests,
    FetchHistory(HistoryRequest),
    FetchMembers {
        group_id: String,
    },
    Signal(SignalEvent),
    PersistWatermark {
        conversation: ConversationKey,
        seen_at: DateTime<Utc>,
    },
    Failure(String),
}

pub struct SyncState {
    self_uid: String,
    pub(crate) directory: DirectoryCache,
    pub(crate) messages: MessageStore,
    pub(crate) typing: TypingTracker,
    pub(crate) active: ActiveConversation,
    member_names: HashMap<String, String>,
    members_requested: HashSet<String>,
    watermarks: HashMap<ConversationKey, DateTime<Utc>>,
    contact_requests: Vec<ContactRequest>,
    effects: Vec<SyncEffect>,
}

impl SyncState {
    pub fn new(self_uid: &str) -> Self {
        Self::with_watermarks(self_uid, HashMap::new(), crate::typing::DEFAULT_TYPING_TTL)
    }

    /// Restores persisted last-seen watermarks so a reload does not bring
    /// back already-seen unread counts.
    pub fn with_watermarks(
        self_uid: &str,
        watermarks: HashMap<ConversationKey, DateTime<Utc>>,
        typing_ttl: Duration,
    ) -> Self {
        Self {
            self_uid: self_uid.to_string(),
            directory: DirectoryCache::new(),
            messages: MessageStore::new(),
            typing: TypingTracker::new(typing_ttl),
            active: ActiveConversation::default(),
            member_names: HashMap::new(),
            members_requested: HashSet::new(),
            watermarks,
            contact_requests: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn self_uid(&self) -> &str {
        &self.self_uid
    }

    pub fn directory(&self) -> &DirectoryCache {
        &self.directory
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn contact_requests(&self) -> &[ContactRequest] {
        &self.contact_requests
    }

    pub fn watermark(&self, key: &ConversationKey) -> Option<DateTime<Utc>> {
        self.watermarks.get(key).copied()
    }

    pub fn typing_in(&self, key: &ConversationKey, now: Instant) -> Vec<String> {
        self.typing.active(key, now)
    }

    /// Display name for a sender: group member cache, then directory, then uid.
    pub fn sender_name(&self, uid: &str) -> String {
        if let Some(name) = self.member_names.get(uid) {
            return name.clone();
        }
        self.directory
            .get(&ConversationKey::Direct(uid.to_string()))
            .map(|e| e.display_name.clone())
            .unwrap_or_else(|| uid.to_string())
    }

    pub fn drain_effects(&mut self) -> Vec<SyncEffect> {
        std::mem::take(&mut self.effects)
    }

    pub(crate) fn emit(&mut self, effect: SyncEffect) {
        self.effects.push(effect);
    }

    // ========================================================================
    // Live events
    // ========================================================================

    /// Routes one inbound socket event. Never fails: payloads that cannot be
    /// applied are logged and dropped so later frames are still processed.
    pub fn handle_event(&mut self, event: ServerEvent, now: Instant) {
        tracing::trace!(event = event.type_name(), "Routing event");

        match event {
            ServerEvent::Auth { status, detail } => {
                if status.as_deref() == Some("error") {
                    let detail = detail.unwrap_or_else(|| "authentication rejected".to_string());
                    tracing::warn!(%detail, "Socket authentication rejected");
                    self.emit(SyncEffect::Failure(detail));
                } else {
                    tracing::debug!("Socket authenticated");
                }
            }
            ServerEvent::Message(wire) => self.on_message(wire, false),
            ServerEvent::GroupMessage(wire) => self.on_message(wire, true),
            ServerEvent::Typing { sender, .. } => {
                let key = ConversationKey::Direct(sender.clone());
                self.on_typing(key, &sender, now);
            }
            ServerEvent::GroupTyping { group_id, sender } => {
                if sender != self.self_uid {
                    self.on_typing(ConversationKey::Group(group_id), &sender, now);
                }
            }
            ServerEvent::Notification { .. } => self.emit(SyncEffect::FetchContactRequests),
            ServerEvent::ContactRequestAccepted { .. } => self.emit(SyncEffect::FetchContacts),
            ServerEvent::ProfilePictureUpdate { uid, profile_image, display_name } => {
                self.on_profile(&uid, display_name.as_deref(), profile_image.as_deref());
            }
            ServerEvent::NameChange { uid, display_name } => {
                self.on_profile(&uid, Some(&display_name), None);
            }
            ServerEvent::WebrtcOffer(payload) => self.forward_signal(SignalKind::Offer, payload),
            ServerEvent::WebrtcAnswer(payload) => self.forward_signal(SignalKind::Answer, payload),
            ServerEvent::WebrtcIce(payload) => self.forward_signal(SignalKind::Ice, payload),
            ServerEvent::WebrtcEnd(payload) => self.forward_signal(SignalKind::End, payload),
        }
    }

    /// Re-fetches everything a disconnect may have made stale: the directory,
    /// pending contact requests and the history of the open conversation.
    pub fn resync(&mut self, now: DateTime<Utc>) {
        tracing::debug!("Resyncing after reconnect");
        self.emit(SyncEffect::FetchContacts);
        self.emit(SyncEffect::FetchGroups);
        self.emit(SyncEffect::FetchContactRequests);
        if let Some(request) = self.refresh_open(now) {
            self.emit(SyncEffect::FetchHistory(request));
        }
    }

    /// Expires typing indicators.
    pub fn tick(&mut self, now: Instant) {
        for key in self.typing.expire(now) {
            if self.active.is_open(&key) {
                let typing = self.typing.active(&key, now);
                self.emit(SyncEffect::TypingChanged { conversation: key, typing });
            }
        }
    }

    fn on_message(&mut self, wire: WireMessage, group: bool) {
        let message = match wire.into_message(&self.self_uid, Some(Utc::now())) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed message event: {}", e);
                return;
            }
        };
        if group && !message.conversation.is_group() {
            tracing::warn!(sender = %message.sender, "Dropping group message without group id");
            return;
        }
        self.accept_live(message);
    }

    fn accept_live(&mut self, message: Message) {
        let key = message.conversation.clone();
        if !self.messages.append(message.clone()) {
            tracing::debug!(conversation = %key, "Duplicate message ignored");
            return;
        }
        if let ConversationKey::Group(group_id) = &key {
            self.ensure_member_known(group_id, &message.sender);
        }

        let inbound = !message.is_from(&self.self_uid);
        let open = self.active.is_open(&key);

        self.directory.touch(&key, &message);
        if open {
            if inbound {
                self.advance_watermark(&key, message.timestamp);
            }
            self.emit(SyncEffect::Render(message));
        } else if inbound {
            self.directory.increment_unread(&key);
        }
        self.emit(SyncEffect::DirectoryChanged);
    }

    fn on_typing(&mut self, key: ConversationKey, sender: &str, now: Instant) {
        if !self.active.is_open(&key) {
            return;
        }
        if self.typing.record(&key, sender, now) {
            let typing = self.typing.active(&key, now);
            self.emit(SyncEffect::TypingChanged { conversation: key, typing });
        }
    }

    fn on_profile(&mut self, uid: &str, display_name: Option<&str>, profile_image: Option<&str>) {
        if let Some(name) = display_name.filter(|n| !n.is_empty()) {
            if self.member_names.contains_key(uid) {
                self.member_names.insert(uid.to_string(), name.to_string());
            }
        }
        if self.directory.update_profile(uid, display_name, profile_image) {
            self.emit(SyncEffect::DirectoryChanged);
        }
    }

    fn forward_signal(&mut self, kind: SignalKind, payload: SignalPayload) {
        self.emit(SyncEffect::Signal(SignalEvent { kind, payload }));
    }

    fn ensure_member_known(&mut self, group_id: &str, uid: &str) {
        if uid == self.self_uid || self.member_names.contains_key(uid) {
            return;
        }
        if self.members_requested.insert(group_id.to_string()) {
            self.emit(SyncEffect::FetchMembers { group_id: group_id.to_string() });
        }
    }

    pub(crate) fn advance_watermark(&mut self, key: &ConversationKey, seen_at: DateTime<Utc>) {
        let current = self.watermarks.get(key).copied();
        if current.map_or(true, |w| seen_at > w) {
            self.watermarks.insert(key.clone(), seen_at);
            self.emit(SyncEffect::PersistWatermark { conversation: key.clone(), seen_at });
        }
    }

    // ========================================================================
    // REST snapshots
    // ========================================================================

    /// Merges a fetched history snapshot. Either the whole batch is applied
    /// or, on error, nothing changes.
    ///
    /// The snapshot is stored even if the conversation was closed in the
    /// meantime, but only rendered if it is still the open one now.
    pub fn apply_history(
        &mut self,
        request: HistoryRequest,
        result: Result<Vec<WireMessage>>,
    ) -> Result<usize> {
        let key = request.key;
        let self_uid = self.self_uid.clone();
        let converted = result.and_then(|batch| {
            batch
                .into_iter()
                .map(|w| w.into_message(&self_uid, None))
                .collect::<Result<Vec<_>>>()
        });
        let messages = self.settle("history fetch", converted)?;
        if request.generation != self.active.generation() {
            tracing::debug!(conversation = %key, "History resolved after the view changed");
        }

        let inserted = self.messages.replace_all(&key, messages);
        tracing::debug!(
            conversation = %key,
            requested_at = %request.requested_at,
            inserted = inserted.len(),
            "History merged"
        );

        if let Some(newest) = inserted.iter().max_by_key(|m| m.timestamp) {
            self.directory.backfill(&key, newest);
        }

        if self.active.is_open(&key) {
            if let Some(latest) = self.messages.latest(&key).map(|m| m.timestamp) {
                self.advance_watermark(&key, latest);
            }
            self.emit(SyncEffect::RenderHistory(key.clone()));
        } else {
            let watermark = self.watermarks.get(&key).copied();
            let unseen = inserted
                .iter()
                .filter(|m| !m.is_from(&self.self_uid))
                .filter(|m| watermark.map_or(true, |w| m.timestamp > w))
                .count();
            for _ in 0..unseen {
                self.directory.increment_unread(&key);
            }
        }

        if !inserted.is_empty() {
            self.emit(SyncEffect::DirectoryChanged);
        }
        Ok(inserted.len())
    }

    pub fn apply_contacts(&mut self, result: Result<Vec<Contact>>) -> Result<usize> {
        let contacts = self.settle("contacts fetch", result)?;
        let mut count = 0;
        let self_uid = self.self_uid.clone();
        for contact in contacts.iter().filter(|c| c.uid != self_uid) {
            let entry = DirectoryEntry::contact(contact);
            let key = entry.key.clone();
            self.directory.upsert(entry);
            self.request_backfill(key);
            count += 1;
        }
        self.emit(SyncEffect::DirectoryChanged);
        Ok(count)
    }

    pub fn apply_groups(&mut self, result: Result<Vec<Group>>) -> Result<usize> {
        let groups = self.settle("groups fetch", result)?;
        for group in &groups {
            let entry = DirectoryEntry::group(group);
            let key = entry.key.clone();
            self.directory.upsert(entry);
            self.request_backfill(key);
        }
        self.emit(SyncEffect::DirectoryChanged);
        Ok(groups.len())
    }

    /// Replaces the pending contact requests wholesale.
    pub fn apply_contact_requests(&mut self, result: Result<Vec<ContactRequest>>) -> Result<usize> {
        self.contact_requests = self.settle("contact requests fetch", result)?;
        self.emit(SyncEffect::ContactRequestsChanged);
        Ok(self.contact_requests.len())
    }

    pub fn apply_member_details(
        &mut self,
        group_id: &str,
        result: Result<Vec<GroupMember>>,
    ) -> Result<usize> {
        self.members_requested.remove(group_id);
        let members = self.settle("group members fetch", result)?;
        for member in &members {
            let name = if member.display_name.is_empty() {
                member.uid.clone()
            } else {
                member.display_name.clone()
            };
            self.member_names.insert(member.uid.clone(), name);
        }
        let key = ConversationKey::Group(group_id.to_string());
        if self.active.is_open(&key) {
            self.emit(SyncEffect::RenderHistory(key));
        }
        Ok(members.len())
    }

    /// Fetches recent history of a closed conversation so that messages
    /// received while offline are counted against the stored watermark.
    /// The open conversation is refreshed by `resync` instead.
    fn request_backfill(&mut self, key: ConversationKey) {
        if self.active.is_open(&key) {
            return;
        }
        let request = HistoryRequest {
            key,
            requested_at: Utc::now(),
            generation: self.active.generation(),
        };
        self.emit(SyncEffect::FetchHistory(request));
    }

    /// Logs and reports a failed fetch; the prior state is left untouched.
    fn settle<T>(&mut self, what: &str, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            tracing::warn!("{} failed: {}", what, e);
            self.emit(SyncEffect::Failure(format!("{} failed: {}", what, e)));
            e
        })
    }

    /// Drops a conversation after the server confirmed the removal.
    pub fn forget_conversation(&mut self, key: &ConversationKey) {
        if self.active.is_open(key) {
            self.close_conversation();
        }
        if self.directory.remove(key).is_some() {
            self.emit(SyncEffect::DirectoryChanged);
        }
    }
}
