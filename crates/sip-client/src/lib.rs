//! Legacy SIP negotiator for chime camera sessions
//!
//! Older camera firmware only speaks the vendor's SIP/RTP backend: an
//! INVITE over TLS carrying a hand-built SDP offer, SRTP keys exchanged in
//! `a=crypto` lines, and DTMF/keyframe nudges delivered as INFO requests.
//! This crate implements that wire dialect and nothing newer; the modern
//! WebSocket path lives in `chime-signaling-core`.

pub mod error;
pub mod message;
pub mod sdp;
pub mod session;

pub use error::{Error, Result};
pub use sdp::{OfferParams, RemoteStreams};
pub use session::{SipConfig, SipSession, TlsSipSession};
