//! Network layer for Chatsync - REST gateway and WebSocket transport

pub mod api;
pub mod websocket;

pub use api::ApiClient;
pub use websocket::{ConnectionState, ReconnectPolicy, Transport, TransportEvent, WebSocketClient};
