//! Session construction parameters
//!
//! Everything a session needs is injected here; nothing is read from
//! process-wide state. The transcoder path in particular varies per
//! deployment (system ffmpeg, bundled binary) and is the caller's call.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chime_sip_client::SipConfig;
use chime_signaling_core::ProtocolVariant;

use crate::error::Result;

/// Supplies legacy SIP session parameters, freshly fetched.
///
/// The backend's session tokens expire; when an INVITE comes back 480 the
/// session asks this source for new parameters and renegotiates once.
/// Decoding the opaque token into host/port/URIs happens behind this
/// trait, in the caller's account layer.
#[async_trait]
pub trait SipSessionSource: Send + Sync {
    async fn fetch(&self) -> Result<SipConfig>;
}

/// Which call-control path this device speaks
#[derive(Clone)]
pub enum ConnectionKind {
    /// WebSocket signaling with the WebRTC media engine
    Signaling {
        endpoint: String,
        variant: ProtocolVariant,
        auth_headers: Vec<(String, String)>,
    },
    /// Legacy SIP/TLS negotiation with hand-managed UDP media
    Sip { source: Arc<dyn SipSessionSource> },
}

/// Parameters for one streaming session
#[derive(Clone)]
pub struct SessionConfig {
    /// Path to the transcoder binary (ffmpeg or compatible)
    pub transcoder_path: PathBuf,
    /// Device the stream is requested from
    pub device_id: u64,
    /// How to reach the device
    pub connection: ConnectionKind,
    /// Spawn the return-audio pipeline alongside the live view
    pub return_audio: bool,
}
