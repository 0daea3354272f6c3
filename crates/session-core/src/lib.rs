//! Streaming-session orchestration for chime camera live views
//!
//! The layers below negotiate; this crate streams. It wraps the WebRTC
//! engine behind a media transport adapter, abstracts the two
//! call-control paths (WebSocket signaling and legacy SIP) behind one
//! connection trait, and exposes [`LiveSession`]: negotiate a call,
//! pipe its media through an external transcoder, and guarantee the
//! call-end cascade runs exactly once.

pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod transcode;
pub mod transport;

pub use config::{ConnectionKind, SessionConfig, SipSessionSource};
pub use connection::{AudioCodec, CallConnection, ConnectionEvent, MediaPlan};
pub use error::{Error, Result};
pub use session::LiveSession;
pub use transcode::TranscodeOptions;
pub use transport::{MediaTransport, TransportEvents};
