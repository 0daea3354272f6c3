//! Media-plane codec utilities for the chime stack
//!
//! This crate holds the stateless pieces shared by both signaling paths:
//! packet classification (STUN vs RTP), SRTP keying material encoding,
//! STUN binding message construction/parsing, a NAT keepalive agent, and
//! line-oriented SDP helpers. Nothing in here owns a call; everything is
//! either a pure function or a small agent bound to sockets its caller owns.

pub mod descriptor;
pub mod error;
pub mod keepalive;
pub mod packet;
pub mod sdp;
pub mod srtp;
pub mod stun;

pub use descriptor::{IceCredentials, RtpStreamDescriptor};
pub use error::{Error, Result};
pub use packet::{classify, PacketKind};
pub use srtp::SrtpMaterial;
