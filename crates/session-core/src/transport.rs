//! Media transport adapter over the WebRTC engine
//!
//! [`MediaTransport`] wraps an `RTCPeerConnection` with the fixed codec
//! set the cameras speak and turns its callback surface into channels:
//! gathered ICE candidates, connection state, and decrypted inbound RTP
//! per media kind. Offer/answer, ICE connectivity and SRTP-DTLS are the
//! engine's problem; this layer only configures and observes it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use crate::error::Result;

/// Spacing of the periodic keyframe request once video is flowing
pub const PLI_INTERVAL: Duration = Duration::from_secs(4);

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Channel ends produced by [`MediaTransport::new`]
pub struct TransportEvents {
    /// Locally gathered ICE candidates with their m-line index
    pub candidates: mpsc::UnboundedReceiver<(String, u16)>,
    /// Engine connection state changes
    pub states: watch::Receiver<RTCPeerConnectionState>,
    /// Decrypted inbound audio RTP
    pub audio_rtp: mpsc::UnboundedReceiver<Bytes>,
    /// Decrypted inbound video RTP
    pub video_rtp: mpsc::UnboundedReceiver<Bytes>,
}

/// One peer connection configured for a camera call
pub struct MediaTransport {
    peer: Arc<RTCPeerConnection>,
    audio_out: Arc<TrackLocalStaticRTP>,
    video_ssrc: Arc<AtomicU32>,
    shutdown: watch::Sender<bool>,
}

impl MediaTransport {
    pub async fn new() -> Result<(Self, TransportEvents)> {
        let mut media_engine = MediaEngine::default();
        // Exactly the codecs the cameras negotiate; registering more lets
        // the remote pick something the transcoder is not set up for.
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_PCMU.to_owned(),
                    clock_rate: 8000,
                    channels: 1,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: 0,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP.to_owned(),
                    rtcp_feedback: vec![
                        RTCPFeedback {
                            typ: "nack".to_owned(),
                            parameter: String::new(),
                        },
                        RTCPFeedback {
                            typ: "nack".to_owned(),
                            parameter: "pli".to_owned(),
                        },
                    ],
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer = Arc::new(api.new_peer_connection(config).await?);

        // Outbound audio: one track, added before negotiation so it gets
        // an m-line and a binding.
        let audio_out = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "chime".to_owned(),
        ));
        let sender = peer
            .add_track(Arc::clone(&audio_out) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        tokio::spawn(async move {
            // The sender's RTCP must be drained or the interceptors stall
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        // Inbound legs
        peer.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        let (candidate_tx, candidates) = mpsc::unbounded_channel();
        peer.on_ice_candidate(Box::new(move |candidate| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx
                            .send((init.candidate, init.sdp_mline_index.unwrap_or(0)));
                    }
                    Err(e) => warn!(error = %e, "could not serialize ICE candidate"),
                }
            })
        }));

        let (state_tx, states) = watch::channel(RTCPeerConnectionState::New);
        peer.on_peer_connection_state_change(Box::new(move |state| {
            let _ = state_tx.send(state);
            Box::pin(async {})
        }));

        let (shutdown, _) = watch::channel(false);
        let video_ssrc = Arc::new(AtomicU32::new(0));

        let (audio_tx, audio_rtp) = mpsc::unbounded_channel::<Bytes>();
        let (video_tx, video_rtp) = mpsc::unbounded_channel::<Bytes>();
        let weak_peer = Arc::downgrade(&peer);
        let ssrc_slot = Arc::clone(&video_ssrc);
        let shutdown_rx = shutdown.subscribe();
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let audio_tx = audio_tx.clone();
            let video_tx = video_tx.clone();
            let weak_peer = weak_peer.clone();
            let ssrc_slot = Arc::clone(&ssrc_slot);
            let shutdown_rx = shutdown_rx.clone();
            Box::pin(async move {
                match track.kind() {
                    RTPCodecType::Video => {
                        ssrc_slot.store(track.ssrc(), Ordering::Relaxed);
                        pump_video(track, video_tx, weak_peer, shutdown_rx).await;
                    }
                    _ => pump_rtp(track, audio_tx).await,
                }
            })
        }));

        let transport = Self {
            peer,
            audio_out,
            video_ssrc,
            shutdown,
        };
        let events = TransportEvents {
            candidates,
            states,
            audio_rtp,
            video_rtp,
        };
        Ok((transport, events))
    }

    /// Create the local offer and install it as the local description.
    /// Candidates trickle afterwards through the candidate channel.
    pub async fn create_offer(&self) -> Result<String> {
        let offer = self.peer.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.peer.set_local_description(offer).await?;
        Ok(sdp)
    }

    /// Answer a remote offer
    pub async fn create_answer(&self, remote_offer: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(remote_offer.to_owned())?;
        self.peer.set_remote_description(offer).await?;
        let answer = self.peer.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.peer.set_local_description(answer).await?;
        Ok(sdp)
    }

    /// Install the remote answer
    pub async fn accept_answer(&self, remote_answer: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(remote_answer.to_owned())?;
        self.peer.set_remote_description(answer).await?;
        Ok(())
    }

    /// Feed a trickled remote candidate to the engine
    pub async fn add_ice_candidate(&self, candidate: String, m_line_index: u16) -> Result<()> {
        self.peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate,
                sdp_mid: None,
                sdp_mline_index: Some(m_line_index),
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    /// Write one RTP packet to the outbound audio track
    pub async fn send_audio(&self, packet: &[u8]) -> Result<()> {
        self.audio_out.write(packet).await?;
        Ok(())
    }

    /// Ask the remote for a keyframe. A no-op until video has arrived
    /// and its SSRC is known.
    pub async fn request_keyframe(&self) -> Result<()> {
        let ssrc = self.video_ssrc.load(Ordering::Relaxed);
        if ssrc == 0 {
            return Ok(());
        }
        send_pli(&self.peer, ssrc).await
    }

    /// Stop the PLI timer and close the peer connection
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.peer.close().await?;
        Ok(())
    }
}

async fn send_pli(peer: &RTCPeerConnection, media_ssrc: u32) -> Result<()> {
    let pli: Box<dyn webrtc::rtcp::packet::Packet + Send + Sync> =
        Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        });
    peer.write_rtcp(&[pli]).await?;
    Ok(())
}

/// Forward a remote track's packets into a channel until it ends
async fn pump_rtp(track: Arc<TrackRemote>, tx: mpsc::UnboundedSender<Bytes>) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => match packet.marshal() {
                Ok(bytes) => {
                    if tx.send(bytes).is_err() {
                        break;
                    }
                }
                Err(e) => trace!(error = %e, "dropping unmarshalable packet"),
            },
            Err(e) => {
                debug!(error = %e, kind = %track.kind(), "remote track ended");
                break;
            }
        }
    }
}

/// Video variant of the pump: the first packet triggers an immediate PLI
/// and starts the periodic PLI timer. Cameras stop sending keyframes on
/// their own; without the timer a single lost keyframe freezes the view.
async fn pump_video(
    track: Arc<TrackRemote>,
    tx: mpsc::UnboundedSender<Bytes>,
    peer: Weak<RTCPeerConnection>,
    shutdown: watch::Receiver<bool>,
) {
    let ssrc = track.ssrc();
    let mut pli_started = false;
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if !pli_started {
                    pli_started = true;
                    if let Some(peer) = peer.upgrade() {
                        if let Err(e) = send_pli(&peer, ssrc).await {
                            warn!(error = %e, "initial PLI failed");
                        }
                    }
                    let peer = peer.clone();
                    let mut shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let mut interval = tokio::time::interval(PLI_INTERVAL);
                        interval.tick().await; // immediate PLI already sent
                        loop {
                            tokio::select! {
                                _ = interval.tick() => {
                                    let Some(peer) = peer.upgrade() else { break };
                                    if send_pli(&peer, ssrc).await.is_err() {
                                        break;
                                    }
                                }
                                _ = shutdown.changed() => break,
                            }
                        }
                        trace!("PLI timer stopped");
                    });
                }
                match packet.marshal() {
                    Ok(bytes) => {
                        if tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Err(e) => trace!(error = %e, "dropping unmarshalable packet"),
                }
            }
            Err(e) => {
                debug!(error = %e, "video track ended");
                break;
            }
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offer_carries_the_negotiated_codecs() {
        let (transport, events) = MediaTransport::new().await.unwrap();
        let offer = transport.create_offer().await.unwrap();

        assert!(offer.contains("m=audio"));
        assert!(offer.contains("m=video"));
        assert!(offer.to_lowercase().contains("opus/48000"));
        assert!(offer.contains("H264/90000"));
        assert_eq!(*events.states.borrow(), RTCPeerConnectionState::New);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn keyframe_request_is_a_noop_before_video() {
        let (transport, _events) = MediaTransport::new().await.unwrap();
        // No video track yet, so no SSRC to address a PLI to
        transport.request_keyframe().await.unwrap();
        transport.close().await.unwrap();
    }
}
