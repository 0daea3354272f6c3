//! Call connection strategies
//!
//! A session does not care whether it is talking to a WebSocket-signaled
//! WebRTC device or a legacy SIP one. [`CallConnection`] is the seam:
//! both strategies negotiate media, then hand the session a
//! [`MediaPlan`] describing the inbound packet feeds, and keep serving
//! the small set of in-call operations until stopped.

mod sip;
mod webrtc;

use async_trait::async_trait;
use bytes::Bytes;
use chime_media_core::SrtpMaterial;
use tokio::sync::mpsc;

use crate::error::Result;

pub use self::sip::SipCall;
pub use self::webrtc::WebRtcCall;

/// Audio codec the call negotiated, which picks the transcoder's audio
/// input arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
    Pcmu,
}

/// One negotiated media leg as the transcoder needs to know it
#[derive(Debug, Clone)]
pub struct StreamSpec {
    /// RTP payload type on the wire
    pub payload_type: u8,
    /// Set when the packets are still SRTP-protected and the transcoder
    /// must decrypt them itself (legacy path)
    pub srtp: Option<SrtpMaterial>,
}

/// Everything the media pipeline needs once negotiation finished
pub struct MediaPlan {
    /// The remote SDP as received; the transcoder input SDP is derived
    /// from it by rewriting ports to the local relay sockets
    pub remote_sdp: String,
    /// Codec of the inbound audio feed
    pub audio_codec: AudioCodec,
    /// Codec [`CallConnection::send_audio`] expects for return audio.
    /// Not necessarily the inbound codec: the WebRTC path sends on a
    /// track bound at negotiation time.
    pub return_codec: AudioCodec,
    pub audio: StreamSpec,
    pub video: Option<StreamSpec>,
    /// SRTP material for the return-audio direction, when the transcoder
    /// has to encrypt what it sends back
    pub return_audio_srtp: Option<SrtpMaterial>,
    /// Inbound audio RTP feed
    pub audio_rtp: mpsc::UnboundedReceiver<Bytes>,
    /// Inbound video RTP feed
    pub video_rtp: Option<mpsc::UnboundedReceiver<Bytes>>,
}

/// Events a connection delivers to the session
pub enum ConnectionEvent {
    /// Negotiation finished; media is (or will shortly be) flowing
    Answered(Box<MediaPlan>),
    /// The call is over, from whichever side. Delivered at most once.
    Ended,
}

/// In-call operations common to both strategies
#[async_trait]
pub trait CallConnection: Send + Sync {
    /// Turn the device's speaker/stream on. Idempotent.
    async fn activate(&self) -> Result<()>;

    /// Send one return-audio RTP packet toward the device
    async fn send_audio(&self, packet: Bytes) -> Result<()>;

    /// Ask the device for a video keyframe
    async fn request_keyframe(&self) -> Result<()>;

    /// Tear the connection down. Idempotent; never fails.
    async fn stop(&self);
}

/// First payload type on the `m=<kind>` line of an SDP body
pub(crate) fn first_payload_type(sdp: &str, kind: &str) -> Option<u8> {
    sdp.lines().find_map(|line| {
        let rest = line.trim_end_matches('\r').strip_prefix("m=")?;
        let mut parts = rest.split(' ');
        if parts.next()? != kind {
            return None;
        }
        // m=<kind> <port> <proto> <fmt> ...
        parts.nth(1)?;
        parts.next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_type_extraction() {
        let sdp = "v=0\r\nm=audio 5004 RTP/SAVP 0\r\nm=video 5006 UDP/TLS/RTP/SAVPF 102 103\r\n";
        assert_eq!(first_payload_type(sdp, "audio"), Some(0));
        assert_eq!(first_payload_type(sdp, "video"), Some(102));
        assert_eq!(first_payload_type(sdp, "application"), None);
    }
}
