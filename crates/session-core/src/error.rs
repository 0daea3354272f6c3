//! Session-level error type

use thiserror::Error;

/// Errors surfaced by session orchestration
#[derive(Error, Debug)]
pub enum Error {
    #[error("media error: {0}")]
    Media(#[from] chime_media_core::Error),

    #[error("sip error: {0}")]
    Sip(#[from] chime_sip_client::Error),

    #[error("signaling error: {0}")]
    Signaling(#[from] chime_signaling_core::Error),

    #[error("media engine error: {0}")]
    Engine(#[from] webrtc::Error),

    #[error("transcoder error: {0}")]
    Transcoder(String),

    #[error("call already ended")]
    CallEnded,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
