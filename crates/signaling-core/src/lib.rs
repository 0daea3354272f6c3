//! WebSocket call-control signaling for chime camera sessions
//!
//! The modern camera backends speak a JSON call-control protocol over a
//! secured WebSocket. Two concrete backend generations exist; they share
//! one call state machine and differ only in endpoint, auth headers and
//! how outbound messages are framed. This crate implements the shared
//! state machine and both framings. It deliberately knows nothing about
//! media: SDP and ICE payloads pass through as opaque strings, and the
//! facade in `chime-session-core` wires them to the WebRTC engine.

pub mod connection;
pub mod error;
pub mod message;
pub mod state;
pub mod variant;

pub use connection::{SignalingConfig, SignalingConnection, SignalingEvent};
pub use error::{Error, Result};
pub use message::{CloseReason, IncomingKind, IncomingMessage, Outgoing, StreamOptions};
pub use state::CallState;
pub use variant::ProtocolVariant;
