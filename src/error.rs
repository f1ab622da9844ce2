use thiserror::Error;

use crate::protocol::ErrorResponse;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failures the library can surface to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration: bad node options, no voice payload
    /// sender, bot user id not set when required.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network-level failure: WebSocket dial/IO, REST connection, timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote spoke something we do not understand: malformed JSON,
    /// unknown opcode, unexpected payload shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation attempted in the wrong state (pause with no track, seek on
    /// a non-seekable track, play on a destroyed player, ...).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The node rejected a REST call with a non-2xx status.
    #[error("lavalink returned {status}: {}", .body.as_ref().map(|b| b.message.as_str()).unwrap_or("no body"))]
    Rest {
        status: u16,
        body: Option<ErrorResponse>,
    },

    /// The node's session is gone: 404 on a session/player path, or a
    /// permanent WebSocket close code.
    #[error("session invalid: {0}")]
    Session(String),

    /// Unrecoverable playback failure: a `fault`-severity track exception or
    /// a fatal voice close code. The affected player is destroyed.
    #[error("fault: {0}")]
    Fault(String),

    /// The player was destroyed while an operation was in flight.
    #[error("player destroyed")]
    PlayerDestroyed,

    /// The 20 s voice handshake window elapsed without the platform
    /// delivering its half of the exchange.
    #[error("voice connection timed out")]
    ConnectionTimeout,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for errors that terminate the player they occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fault(_) | Self::PlayerDestroyed)
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}
