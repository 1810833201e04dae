//! Chatsync Core Library
//!
//! Client-side synchronization core of a REST + WebSocket chat application.
//! Provides: models, wire protocol, networking, the conversation state
//! machine, and local persistence.

pub mod client;
pub mod config;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod models;
pub mod network;
pub mod protocol;
pub mod storage;
pub mod store;
pub mod sync;
pub mod typing;

pub use client::{ChatClient, ClientUpdate, Command};
pub use config::{ClientConfig, ServerConfig, SyncConfig};
pub use directory::{DirectoryCache, DirectoryEntry, MessagePreview};
pub use error::{Error, Result};
pub use models::*;
pub use network::{
    ApiClient, ConnectionState, ReconnectPolicy, Transport, TransportEvent, WebSocketClient,
};
pub use protocol::{ClientFrame, ServerEvent, SignalEvent, SignalKind, SignalPayload};
pub use storage::LocalStorage;
pub use store::{DateGroup, MessageStore};
pub use sync::{HistoryRequest, SyncEffect, SyncState};
