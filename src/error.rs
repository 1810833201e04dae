//! Error types for Chatsync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or expired credential. The UI sends the user back to login.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Socket send while disconnected, or a REST call that never got a response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-2xx REST response with the server-provided detail text.
    #[error("API error ({status}): {detail}")]
    Api { status: u16, detail: String },

    /// Local check that blocks an action before any network call.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error should be shown as a dismissible message rather than
    /// ending the session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Auth(_) | Error::NotLoggedIn)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Protocol(e.to_string())
        } else {
            Error::Transport(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
