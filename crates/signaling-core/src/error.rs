//! Error types for the signaling layer

use thiserror::Error;

/// Errors produced by the signaling connection
#[derive(Debug, Error)]
pub enum Error {
    /// WebSocket transport failure. Always terminal for the call; there
    /// is no reconnection for a streaming session.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A message violated the wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection has already reached its terminal state
    #[error("signaling connection is closed")]
    Closed,
}

/// Result alias for signaling operations
pub type Result<T> = std::result::Result<T, Error>;
