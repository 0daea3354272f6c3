//! Shared per-leg transport descriptors

use crate::srtp::SrtpMaterial;

/// ICE short-term credentials for one media leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// Transport parameters for one media leg, as negotiated through SDP.
///
/// One of these exists per audio/video leg for the lifetime of a call and
/// is discarded at call end.
#[derive(Debug, Clone)]
pub struct RtpStreamDescriptor {
    /// Local UDP port this leg is bound to
    pub local_port: u16,
    /// Remote UDP port from the SDP answer
    pub remote_port: u16,
    /// Synchronization source the remote will send with
    pub ssrc: u32,
    /// ICE credentials, when the remote offered them
    pub ice: Option<IceCredentials>,
    /// SRTP master key material, when the leg is encrypted
    pub srtp: Option<SrtpMaterial>,
}
