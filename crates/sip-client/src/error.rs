//! Error types for the legacy SIP path

use thiserror::Error;

/// Errors produced while negotiating a legacy SIP session
#[derive(Debug, Error)]
pub enum Error {
    /// The server answered an INVITE with 480: the ding this session was
    /// minted for has expired. The caller is expected to fetch a fresh
    /// session and retry the negotiation exactly once.
    #[error("session expired (480 Temporarily Unavailable)")]
    SessionExpired,

    /// A request was rejected with a final status of 300 or above
    #[error("{method} rejected with status {status} {reason}")]
    RequestRejected {
        method: &'static str,
        status: u16,
        reason: String,
    },

    /// The far end hung up while we were waiting on a response
    #[error("remote side ended the call")]
    RemoteHangup,

    /// A SIP message could not be parsed
    #[error("malformed SIP message: {0}")]
    MalformedMessage(String),

    /// The SDP answer was missing required lines or unparseable
    #[error("SDP error: {0}")]
    Sdp(#[from] chime_media_core::Error),

    /// TLS handshake or certificate problem
    #[error("TLS error: {0}")]
    Tls(String),

    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for SIP operations
pub type Result<T> = std::result::Result<T, Error>;
