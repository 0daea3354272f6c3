//! WebSocket-signaled WebRTC call strategy
//!
//! Glues a [`SignalingConnection`] to a [`MediaTransport`]: local
//! candidates flow out through signaling, the remote answer and
//! candidates flow into the engine, and the engine's decrypted RTP
//! becomes the session's media plan. Used by both signaling variants;
//! the variant quirks live entirely in `chime-signaling-core`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chime_media_core::sdp::prefers_opus;
use chime_signaling_core::{
    ProtocolVariant, SignalingConfig, SignalingConnection, SignalingEvent,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::connection::{
    first_payload_type, AudioCodec, CallConnection, ConnectionEvent, MediaPlan, StreamSpec,
};
use crate::error::Result;
use crate::transport::{MediaTransport, TransportEvents};

pub struct WebRtcCall {
    signaling: SignalingConnection,
    transport: Arc<MediaTransport>,
    stopped: AtomicBool,
}

impl WebRtcCall {
    /// Create the peer connection, open signaling with its offer, and
    /// start the pump that ties the two together.
    pub async fn connect(
        endpoint: String,
        variant: ProtocolVariant,
        device_id: u64,
        auth_headers: Vec<(String, String)>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let (transport, events) = MediaTransport::new().await?;
        let transport = Arc::new(transport);
        let offer = transport.create_offer().await?;

        let (signaling, sig_events) = SignalingConnection::connect(
            SignalingConfig {
                endpoint,
                device_id,
                variant,
                auth_headers,
            },
            offer,
        )
        .await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(
            events,
            sig_events,
            signaling.clone(),
            Arc::clone(&transport),
            event_tx,
        ));

        Ok((
            Self {
                signaling,
                transport,
                stopped: AtomicBool::new(false),
            },
            event_rx,
        ))
    }
}

#[async_trait]
impl CallConnection for WebRtcCall {
    async fn activate(&self) -> Result<()> {
        self.signaling.activate();
        Ok(())
    }

    async fn send_audio(&self, packet: Bytes) -> Result<()> {
        self.transport.send_audio(&packet).await
    }

    async fn request_keyframe(&self) -> Result<()> {
        self.transport.request_keyframe().await
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signaling.close();
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "engine close failed");
        }
    }
}

async fn pump(
    mut transport_events: TransportEvents,
    mut sig_events: mpsc::UnboundedReceiver<SignalingEvent>,
    signaling: SignalingConnection,
    transport: Arc<MediaTransport>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    // Media feeds are handed over exactly once, with the answer
    let mut feeds = Some((transport_events.audio_rtp, transport_events.video_rtp));
    let mut candidates_done = false;

    loop {
        tokio::select! {
            candidate = transport_events.candidates.recv(), if !candidates_done => {
                match candidate {
                    Some((candidate, m_line_index)) => {
                        signaling.send_ice_candidate(candidate, m_line_index);
                    }
                    None => candidates_done = true,
                }
            }
            changed = transport_events.states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *transport_events.states.borrow();
                debug!(?state, "engine state");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    // The engine never recovers from these on its own
                    warn!(?state, "engine reached a terminal state");
                    let _ = event_tx.send(ConnectionEvent::Ended);
                    break;
                }
            }
            event = sig_events.recv() => match event {
                Some(SignalingEvent::Answer { sdp }) => {
                    if let Err(e) = transport.accept_answer(&sdp).await {
                        warn!(error = %e, "remote answer rejected by engine");
                        let _ = event_tx.send(ConnectionEvent::Ended);
                        break;
                    }
                    if let Some((audio_rtp, video_rtp)) = feeds.take() {
                        info!("call answered");
                        let plan = plan_from_answer(sdp, audio_rtp, video_rtp);
                        let _ = event_tx.send(ConnectionEvent::Answered(Box::new(plan)));
                    }
                }
                Some(SignalingEvent::RemoteIce { candidate, m_line_index }) => {
                    if let Err(e) = transport.add_ice_candidate(candidate, m_line_index).await {
                        debug!(error = %e, "remote candidate rejected");
                    }
                }
                Some(SignalingEvent::Activated) => debug!("activation confirmed"),
                Some(SignalingEvent::Notification(value)) => {
                    debug!(%value, "backend notification");
                }
                Some(SignalingEvent::CameraOptions(value)) => {
                    debug!(%value, "camera options report");
                }
                Some(SignalingEvent::Ended { reason }) => {
                    info!(?reason, "signaling ended the call");
                    let _ = event_tx.send(ConnectionEvent::Ended);
                    break;
                }
                None => {
                    let _ = event_tx.send(ConnectionEvent::Ended);
                    break;
                }
            },
        }
    }
}

/// Turn the remote answer plus the engine's decrypted feeds into a
/// media plan. Inbound codec follows the answer; return audio is always
/// Opus, because the outbound track is bound with an Opus capability
/// before negotiation.
fn plan_from_answer(
    sdp: String,
    audio_rtp: mpsc::UnboundedReceiver<Bytes>,
    video_rtp: mpsc::UnboundedReceiver<Bytes>,
) -> MediaPlan {
    MediaPlan {
        audio_codec: if prefers_opus(&sdp) {
            AudioCodec::Opus
        } else {
            AudioCodec::Pcmu
        },
        return_codec: AudioCodec::Opus,
        audio: StreamSpec {
            payload_type: first_payload_type(&sdp, "audio").unwrap_or(0),
            srtp: None,
        },
        video: first_payload_type(&sdp, "video").map(|payload_type| StreamSpec {
            payload_type,
            srtp: None,
        }),
        return_audio_srtp: None,
        audio_rtp,
        video_rtp: Some(video_rtp),
        remote_sdp: sdp,
    }
}
