//! Error types for chorus-session

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Result type alias using chorus-session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while processing frames or driving the socket
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the wire layer
    #[error(transparent)]
    Wire(#[from] chorus_wire::Error),

    /// The websocket failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// JSON serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A caller-supplied hook failed
    #[error("Hook failed: {0}")]
    Hook(String),

    /// The peer closed the connection
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Nothing was received within the heartbeat timeout
    #[error("No traffic for {0:?}, connection presumed dead")]
    HeartbeatTimeout(Duration),

    /// The retry budget ran out
    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),

    /// A generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a hook error
    pub fn hook(message: impl Into<String>) -> Self {
        Self::Hook(message.into())
    }

    /// Check if reconnecting could fix this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::WebSocket(e) => !matches!(
                e,
                tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_)
            ),
            Error::Closed(_) | Error::HeartbeatTimeout(_) => true,
            _ => false,
        }
    }
}
