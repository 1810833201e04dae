//! Client orchestrator.
//!
//! [`ChatClient`] owns the [`SyncState`] and is its only mutator. Transport
//! events, REST completions, user commands and the tick interval are handled
//! one at a time on a single task; REST calls run as spawned tasks whose
//! results come back as completions. After every step the queued
//! [`SyncEffect`]s are executed and turned into [`ClientUpdate`]s for the
//! presentation layer.

use crate::config::ClientConfig;
use crate::directory::DirectoryEntry;
use crate::error::{Error, Result};
use crate::models::*;
use crate::network::{ApiClient, ConnectionState, Transport, TransportEvent, WebSocketClient};
use crate::protocol::{ClientFrame, SignalEvent, SignalKind, SignalPayload};
use crate::storage::LocalStorage;
use crate::sync::{HistoryRequest, SyncEffect, SyncState};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// User intents accepted by [`ChatClient::run`].
#[derive(Debug, Clone)]
pub enum Command {
    Open(ConversationKey),
    Close,
    SendText(String),
    SendAttachment { attachment: Attachment, caption: String },
    Retry { conversation: ConversationKey, message_id: String },
    Typing,
    Search(String),
    SendContactRequest(String),
    RespondContactRequest { id: String, accept: bool },
    RemoveContact(String),
    CreateGroup { name: String, members: Vec<String> },
    DeleteGroup(String),
    AddGroupMember { group_id: String, uid: String },
    RemoveGroupMember { group_id: String, uid: String },
    UpdateName(String),
    UploadProfilePicture { file_name: String, data: Vec<u8> },
    Signal { kind: SignalKind, payload: SignalPayload },
    Refresh,
    Shutdown,
}

/// View updates published to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    Connection(ConnectionState),
    Directory(Vec<DirectoryEntry>),
    History {
        conversation: ConversationKey,
        messages: Vec<Message>,
    },
    Message(Message),
    Delivery {
        conversation: ConversationKey,
        message_id: String,
        state: DeliveryState,
    },
    Typing {
        conversation: ConversationKey,
        typing: Vec<String>,
    },
    Placeholder,
    ContactRequests(Vec<ContactRequest>),
    SearchResults(Vec<Contact>),
    ProfileUpdated {
        display_name: Option<String>,
        profile_image: Option<String>,
    },
    Signal(SignalEvent),
    Error(String),
    /// The server rejected the credential; the user has to sign in again.
    SessionExpired,
}

/// What to re-fetch after a mutating call succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Refresh {
    ContactsAndRequests,
    Groups,
    Members(String),
}

enum Completion {
    History(HistoryRequest, Result<Vec<WireMessage>>),
    Contacts(Result<Vec<Contact>>),
    Groups(Result<Vec<Group>>),
    ContactRequests(Result<Vec<ContactRequest>>),
    Members(String, Result<Vec<GroupMember>>),
    Search(Result<Vec<Contact>>),
    Removed(ConversationKey, Result<()>),
    Done {
        action: &'static str,
        result: Result<()>,
        refresh: Option<Refresh>,
    },
    NameUpdated(String, Result<()>),
    ProfilePicture(Result<String>),
}

pub struct ChatClient {
    config: ClientConfig,
    api: Arc<ApiClient>,
    storage: Arc<LocalStorage>,
    session: AuthSession,
    state: SyncState,
    transport: Arc<dyn Transport>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Option<mpsc::UnboundedReceiver<Completion>>,
    updates: mpsc::UnboundedSender<ClientUpdate>,
    was_connected: bool,
}

impl ChatClient {
    /// Connects the WebSocket transport for `session` and restores its
    /// watermarks. Must be called inside a tokio runtime.
    pub fn start(
        config: ClientConfig,
        storage: Arc<LocalStorage>,
        session: AuthSession,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientUpdate>)> {
        let api = Arc::new(ApiClient::new(&config)?);
        api.set_token(&session.token);

        let (socket, events) = WebSocketClient::connect(
            &config.ws_url(),
            &session.token,
            config.sync.reconnect_policy(),
        );
        Self::with_transport(config, api, storage, session, Arc::new(socket), events)
    }

    /// Builds a client on an already connected transport.
    pub fn with_transport(
        config: ClientConfig,
        api: Arc<ApiClient>,
        storage: Arc<LocalStorage>,
        session: AuthSession,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientUpdate>)> {
        let watermarks = storage.load_watermarks(&session.uid)?;
        tracing::info!(
            uid = %session.uid,
            watermarks = watermarks.len(),
            "Starting chat client"
        );
        let state = SyncState::with_watermarks(&session.uid, watermarks, config.sync.typing_ttl());

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                config,
                api,
                storage,
                session,
                state,
                transport,
                events: Some(events),
                completions_tx,
                completions_rx: Some(completions_rx),
                updates: updates_tx,
                was_connected: false,
            },
            updates_rx,
        ))
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Processes events until `Command::Shutdown` or until `commands` closes.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> Result<()> {
        let mut events = self.events.take().ok_or_else(|| Error::Config("client already ran".into()))?;
        let mut completions = self
            .completions_rx
            .take()
            .ok_or_else(|| Error::Config("client already ran".into()))?;

        let mut ticker = tokio::time::interval(self.config.sync.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.state.resync(Utc::now());
        self.flush();

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.on_transport(event),
                Some(done) = completions.recv() => self.on_completion(done),
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                _ = ticker.tick() => self.state.tick(Instant::now()),
            }
            self.flush();
        }

        tracing::info!("Chat client stopped");
        Ok(())
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Event(event) => self.state.handle_event(event, Instant::now()),
            TransportEvent::State(state) => {
                tracing::debug!(?state, "Connection state changed");
                if state == ConnectionState::Connected {
                    if self.was_connected {
                        self.state.resync(Utc::now());
                    }
                    self.was_connected = true;
                }
                self.publish(ClientUpdate::Connection(state));
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        let now = Utc::now();
        let uid = self.session.uid.clone();

        match command {
            Command::Open(key) => {
                if let Some(request) = self.state.open_conversation(key, now) {
                    self.fetch_history(request);
                }
            }
            Command::Close => self.state.close_conversation(),
            Command::SendText(text) => {
                let result = self.state.send_text(self.transport.as_ref(), &text, now);
                self.report_local(result);
            }
            Command::SendAttachment { attachment, caption } => {
                let result =
                    self.state
                        .send_attachment(self.transport.as_ref(), attachment, &caption, now);
                self.report_local(result);
            }
            Command::Retry { conversation, message_id } => {
                let result =
                    self.state
                        .retry_send(self.transport.as_ref(), &conversation, &message_id);
                self.report_local(result);
            }
            Command::Typing => {
                if let Err(e) = self.state.notify_typing(self.transport.as_ref()) {
                    tracing::debug!("Typing signal not sent: {}", e);
                }
            }
            Command::Search(query) => {
                let api = self.api.clone();
                self.spawn(async move { Completion::Search(api.search_users(&query).await) });
            }
            Command::SendContactRequest(to) => {
                let api = self.api.clone();
                self.spawn(async move {
                    Completion::Done {
                        action: "contact request",
                        result: api.send_contact_request(&uid, &to).await,
                        refresh: None,
                    }
                });
            }
            Command::RespondContactRequest { id, accept } => {
                let api = self.api.clone();
                self.spawn(async move {
                    Completion::Done {
                        action: "contact request response",
                        result: api.respond_contact_request(&id, accept).await,
                        refresh: Some(Refresh::ContactsAndRequests),
                    }
                });
            }
            Command::RemoveContact(contact) => {
                let api = self.api.clone();
                self.spawn(async move {
                    let result = api.remove_contact(&uid, &contact).await;
                    Completion::Removed(ConversationKey::Direct(contact), result)
                });
            }
            Command::CreateGroup { name, members } => {
                let api = self.api.clone();
                self.spawn(async move {
                    Completion::Done {
                        action: "group creation",
                        result: api.create_group(&name, &uid, &members).await.map(|group| {
                            tracing::info!(group = %group.id, "Group created");
                        }),
                        refresh: Some(Refresh::Groups),
                    }
                });
            }
            Command::DeleteGroup(group_id) => {
                let api = self.api.clone();
                self.spawn(async move {
                    let result = api.delete_group(&group_id).await;
                    Completion::Removed(ConversationKey::Group(group_id), result)
                });
            }
            Command::AddGroupMember { group_id, uid: member } => {
                let api = self.api.clone();
                self.spawn(async move {
                    Completion::Done {
                        action: "adding group member",
                        result: api.add_group_member(&group_id, &member).await,
                        refresh: Some(Refresh::Members(group_id)),
                    }
                });
            }
            Command::RemoveGroupMember { group_id, uid: member } => {
                let api = self.api.clone();
                self.spawn(async move {
                    Completion::Done {
                        action: "removing group member",
                        result: api.remove_group_member(&group_id, &member).await,
                        refresh: Some(Refresh::Members(group_id)),
                    }
                });
            }
            Command::UpdateName(name) => {
                let api = self.api.clone();
                self.spawn(async move {
                    let result = api.update_name(&uid, &name).await;
                    Completion::NameUpdated(name.trim().to_string(), result)
                });
            }
            Command::UploadProfilePicture { file_name, data } => {
                let api = self.api.clone();
                self.spawn(async move {
                    Completion::ProfilePicture(api.upload_profile_picture(&uid, data, &file_name).await)
                });
            }
            Command::Signal { kind, payload } => {
                if let Err(e) = self.transport.send(&ClientFrame::signal(kind, payload)) {
                    self.publish(ClientUpdate::Error(e.to_string()));
                }
            }
            Command::Refresh => self.state.resync(now),
            Command::Shutdown => {}
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::History(request, result) => {
                let result = self.state.apply_history(request, result);
                self.check_session(result);
            }
            Completion::Contacts(result) => {
                let result = self.state.apply_contacts(result);
                self.check_session(result);
            }
            Completion::Groups(result) => {
                let result = self.state.apply_groups(result);
                self.check_session(result);
            }
            Completion::ContactRequests(result) => {
                let result = self.state.apply_contact_requests(result);
                self.check_session(result);
            }
            Completion::Members(group_id, result) => {
                let result = self.state.apply_member_details(&group_id, result);
                self.check_session(result);
            }
            Completion::Search(result) => match result {
                Ok(users) => {
                    let users = users
                        .into_iter()
                        .filter(|u| u.uid != self.session.uid)
                        .collect();
                    self.publish(ClientUpdate::SearchResults(users));
                }
                Err(e) => self.report_remote("search", e),
            },
            Completion::Removed(key, result) => match result {
                Ok(()) => {
                    tracing::info!(conversation = %key, "Conversation removed");
                    self.state.forget_conversation(&key);
                }
                Err(e) => self.report_remote("removal", e),
            },
            Completion::Done { action, result, refresh } => match result {
                Ok(()) => {
                    tracing::debug!(action, "Request succeeded");
                    match refresh {
                        Some(Refresh::ContactsAndRequests) => {
                            self.fetch_contacts();
                            self.fetch_contact_requests();
                        }
                        Some(Refresh::Groups) => self.fetch_groups(),
                        Some(Refresh::Members(group_id)) => self.fetch_members(group_id),
                        None => {}
                    }
                }
                Err(e) => self.report_remote(action, e),
            },
            Completion::NameUpdated(name, result) => match result {
                Ok(()) => {
                    self.session.display_name = name.clone();
                    if let Err(e) = self.storage.save_session(&self.session) {
                        tracing::warn!("Failed to persist session: {}", e);
                    }
                    self.publish(ClientUpdate::ProfileUpdated {
                        display_name: Some(name),
                        profile_image: None,
                    });
                }
                Err(e) => self.report_remote("name update", e),
            },
            Completion::ProfilePicture(result) => match result {
                Ok(url) => self.publish(ClientUpdate::ProfileUpdated {
                    display_name: None,
                    profile_image: Some(url),
                }),
                Err(e) => self.report_remote("profile picture upload", e),
            },
        }
    }

    // ========================================================================
    // Effects
    // ========================================================================

    fn flush(&mut self) {
        let mut directory_changed = false;

        for effect in self.state.drain_effects() {
            match effect {
                SyncEffect::Render(message) => self.publish(ClientUpdate::Message(message)),
                SyncEffect::RenderHistory(key) => {
                    let messages = self.state.messages().messages(&key).to_vec();
                    self.publish(ClientUpdate::History { conversation: key, messages });
                }
                SyncEffect::ShowPlaceholder => self.publish(ClientUpdate::Placeholder),
                SyncEffect::DeliveryChanged { conversation, message_id, state } => {
                    self.publish(ClientUpdate::Delivery { conversation, message_id, state });
                }
                SyncEffect::DirectoryChanged => directory_changed = true,
                SyncEffect::TypingChanged { conversation, typing } => {
                    self.publish(ClientUpdate::Typing { conversation, typing });
                }
                SyncEffect::ContactRequestsChanged => {
                    let requests = self.state.contact_requests().to_vec();
                    self.publish(ClientUpdate::ContactRequests(requests));
                }
                SyncEffect::FetchContacts => self.fetch_contacts(),
                SyncEffect::FetchGroups => self.fetch_groups(),
                SyncEffect::FetchContactRequests => self.fetch_contact_requests(),
                SyncEffect::FetchMembers { group_id } => self.fetch_members(group_id),
                SyncEffect::FetchHistory(request) => self.fetch_history(request),
                SyncEffect::Signal(signal) => self.publish(ClientUpdate::Signal(signal)),
                SyncEffect::PersistWatermark { conversation, seen_at } => {
                    if let Err(e) =
                        self.storage
                            .save_watermark(&self.session.uid, &conversation, seen_at)
                    {
                        tracing::warn!(%conversation, "Failed to persist watermark: {}", e);
                    }
                }
                SyncEffect::Failure(detail) => self.publish(ClientUpdate::Error(detail)),
            }
        }

        if directory_changed {
            let entries = self.state.directory().list(None).into_iter().cloned().collect();
            self.publish(ClientUpdate::Directory(entries));
        }
    }

    fn fetch_history(&self, request: HistoryRequest) {
        let api = self.api.clone();
        let uid = self.session.uid.clone();
        let limit = Some(self.config.sync.history_limit);
        self.spawn(async move {
            let result = api.history(&uid, &request.key, limit).await;
            Completion::History(request, result)
        });
    }

    fn fetch_contacts(&self) {
        let api = self.api.clone();
        let uid = self.session.uid.clone();
        self.spawn(async move { Completion::Contacts(api.contacts(&uid).await) });
    }

    fn fetch_groups(&self) {
        let api = self.api.clone();
        let uid = self.session.uid.clone();
        self.spawn(async move { Completion::Groups(api.groups(&uid).await) });
    }

    fn fetch_contact_requests(&self) {
        let api = self.api.clone();
        let uid = self.session.uid.clone();
        self.spawn(async move { Completion::ContactRequests(api.contact_requests(&uid).await) });
    }

    fn fetch_members(&self, group_id: String) {
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.group_members(&group_id).await;
            Completion::Members(group_id, result)
        });
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(task.await);
        });
    }

    fn publish(&self, update: ClientUpdate) {
        if self.updates.send(update).is_err() {
            tracing::trace!("No presentation layer listening");
        }
    }

    /// Local send errors. Transport failures already surfaced as a
    /// `Failure` effect; only validation problems are reported here.
    fn report_local<T>(&self, result: Result<T>) {
        if let Err(e @ Error::Validation(_)) = result {
            self.publish(ClientUpdate::Error(e.to_string()));
        }
    }

    fn report_remote(&self, action: &str, error: Error) {
        tracing::warn!(action, "Request failed: {}", error);
        if error.is_recoverable() {
            self.publish(ClientUpdate::Error(format!("{} failed: {}", action, error)));
        } else {
            self.publish(ClientUpdate::SessionExpired);
        }
    }

    /// The synchronizer already reported the failure; an auth failure also
    /// ends the session.
    fn check_session<T>(&self, result: Result<T>) {
        if let Err(e) = result {
            if !e.is_recoverable() {
                self.publish(ClientUpdate::SessionExpired);
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Signs in and persists the session so [`current_user`] finds it on the
/// next run.
pub async fn login(
    api: &ApiClient,
    storage: &LocalStorage,
    email: &str,
    password: &str,
) -> Result<AuthSession> {
    let session = api.login(email, password).await?;
    storage.save_session(&session)?;
    Ok(session)
}

/// The persisted session, if any.
pub fn current_user(storage: &LocalStorage) -> Result<Option<AuthSession>> {
    storage.get_session()
}

pub fn logout(api: &ApiClient, storage: &LocalStorage) -> Result<()> {
    api.clear_token();
    storage.clear_session()?;
    tracing::info!("Logged out");
    Ok(())
}
