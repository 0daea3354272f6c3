//! Error types for media-plane utilities

use thiserror::Error;

/// Errors produced by the media-core utilities
#[derive(Debug, Error)]
pub enum Error {
    /// SRTP keying blob was not valid base64 or had the wrong length
    #[error("invalid SRTP key material: {0}")]
    InvalidSrtpMaterial(String),

    /// Buffer was too short or malformed for a STUN message
    #[error("malformed STUN message: {0}")]
    MalformedStun(String),

    /// A required SDP line was missing or unparseable
    #[error("SDP parse error: {0}")]
    SdpParse(String),

    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for media-core operations
pub type Result<T> = std::result::Result<T, Error>;
