//! Legacy SIP call strategy
//!
//! Media here is hand-managed: two local UDP sockets, SRTP keys traded
//! through the SDP crypto lines, STUN keepalives toward the camera and
//! STUN binding responses back at it. The packets stay encrypted on the
//! way through; the transcoder gets the keys and decrypts itself.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chime_media_core::keepalive::{StunCredentials, StunKeepalive};
use chime_media_core::{classify, stun, IceCredentials, PacketKind, RtpStreamDescriptor, SrtpMaterial};
use chime_sip_client::{OfferParams, SipConfig, SipSession, TlsSipSession};
use rand::distributions::{Alphanumeric, DistString};
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::connection::{AudioCodec, CallConnection, ConnectionEvent, MediaPlan, StreamSpec};
use crate::error::{Error, Result};

pub struct SipCall {
    session: Mutex<TlsSipSession>,
    audio_socket: Arc<UdpSocket>,
    audio_remote: SocketAddr,
    keepalives: std::sync::Mutex<Vec<StunKeepalive>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    stopped: AtomicBool,
}

impl SipCall {
    /// Negotiate a media session over SIP and start the media agents.
    ///
    /// A 480 from the INVITE propagates as
    /// [`chime_sip_client::Error::SessionExpired`]; the session facade
    /// owns the single fetch-and-retry for that case.
    pub async fn connect(
        config: SipConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let mut session = SipSession::connect(config).await?;

        let audio_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let video_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);

        let offer = OfferParams {
            local_ip: session.local_addr().ip(),
            audio_port: audio_socket.local_addr()?.port(),
            video_port: video_socket.local_addr()?.port(),
            audio_srtp: random_srtp(),
            video_srtp: random_srtp(),
            audio_ssrc: rand::random(),
            video_ssrc: rand::random(),
            ice: IceCredentials {
                ufrag: Alphanumeric.sample_string(&mut rand::thread_rng(), 8),
                pwd: Alphanumeric.sample_string(&mut rand::thread_rng(), 22),
            },
        };
        let streams = session.invite(&offer).await?;

        let remote_ip: IpAddr = streams
            .address
            .parse()
            .map_err(|_| Error::Media(chime_media_core::Error::SdpParse(format!(
                "bad remote media address: {}",
                streams.address
            ))))?;
        let audio_remote = SocketAddr::new(remote_ip, streams.audio.remote_port);
        let video_remote = SocketAddr::new(remote_ip, streams.video.remote_port);
        info!(%audio_remote, %video_remote, "legacy media session negotiated");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut keepalives = Vec::new();
        let mut tasks = Vec::new();

        let (audio_rtp_tx, audio_rtp) = mpsc::unbounded_channel();
        let (video_rtp_tx, video_rtp) = mpsc::unbounded_channel();

        for (socket, remote, rtp_tx, descriptor) in [
            (&audio_socket, audio_remote, audio_rtp_tx, &streams.audio),
            (&video_socket, video_remote, video_rtp_tx, &streams.video),
        ] {
            let (stun_tx, stun_rx) = mpsc::channel(8);
            let credentials = descriptor.ice.as_ref().map(|remote_ice| StunCredentials {
                username: format!("{}:{}", remote_ice.ufrag, offer.ice.ufrag),
                password: remote_ice.pwd.clone(),
            });
            let has_credentials = credentials.is_some();
            let rtcp_remote = rtcp_companion(remote);
            if rtcp_remote.is_none() {
                debug!(%remote, "no RTCP companion port, keepalive covers RTP only");
            }
            keepalives.push(StunKeepalive::spawn(
                Arc::clone(socket),
                remote,
                rtcp_remote,
                credentials,
                has_credentials.then_some(stun_rx),
            ));
            tasks.push(tokio::spawn(pump_socket(
                Arc::clone(socket),
                rtp_tx,
                stun_tx,
            )));
        }

        let plan = MediaPlan {
            remote_sdp: streams.sdp.clone(),
            audio_codec: AudioCodec::Pcmu,
            return_codec: AudioCodec::Pcmu,
            audio: leg_spec(&streams.audio, 0),
            video: Some(leg_spec(&streams.video, 99)),
            // What the camera sent is protected with the keys it answered
            // with; what we send back uses the keys we offered.
            return_audio_srtp: Some(offer.audio_srtp.clone()),
            audio_rtp,
            video_rtp: Some(video_rtp),
        };
        let _ = event_tx.send(ConnectionEvent::Answered(Box::new(plan)));

        Ok((
            Self {
                session: Mutex::new(session),
                audio_socket,
                audio_remote,
                keepalives: std::sync::Mutex::new(keepalives),
                tasks: std::sync::Mutex::new(tasks),
                event_tx,
                stopped: AtomicBool::new(false),
            },
            event_rx,
        ))
    }
}

#[async_trait]
impl CallConnection for SipCall {
    async fn activate(&self) -> Result<()> {
        self.session.lock().await.activate_speaker().await?;
        Ok(())
    }

    async fn send_audio(&self, packet: Bytes) -> Result<()> {
        self.audio_socket.send_to(&packet, self.audio_remote).await?;
        Ok(())
    }

    async fn request_keyframe(&self) -> Result<()> {
        self.session.lock().await.request_keyframe().await?;
        Ok(())
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for keepalive in self.keepalives.lock().unwrap().iter_mut() {
            keepalive.stop();
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.session.lock().await.send_bye().await;
        let _ = self.event_tx.send(ConnectionEvent::Ended);
    }
}

/// RTCP lives one port above RTP by convention; an answer advertising
/// port 65535 leaves no room for it.
fn rtcp_companion(rtp: SocketAddr) -> Option<SocketAddr> {
    rtp.port()
        .checked_add(1)
        .map(|port| SocketAddr::new(rtp.ip(), port))
}

fn leg_spec(descriptor: &RtpStreamDescriptor, payload_type: u8) -> StreamSpec {
    StreamSpec {
        payload_type,
        srtp: descriptor.srtp.clone(),
    }
}

fn random_srtp() -> SrtpMaterial {
    let mut key = [0u8; 16];
    let mut salt = [0u8; 14];
    rand::thread_rng().fill_bytes(&mut key);
    rand::thread_rng().fill_bytes(&mut salt);
    SrtpMaterial { key, salt }
}

/// Demultiplex one media socket: STUN requests get a binding response,
/// STUN responses feed the keepalive, RTP goes to the transcoder relay.
async fn pump_socket(
    socket: Arc<UdpSocket>,
    rtp_tx: mpsc::UnboundedSender<Bytes>,
    stun_tx: mpsc::Sender<Vec<u8>>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "media socket closed");
                break;
            }
        };
        let datagram = &buf[..len];
        match classify(datagram) {
            PacketKind::Stun => match stun::parse(datagram) {
                Ok(message) if message.is_binding_request() => {
                    if let Some(response) = stun::respond_to_binding(datagram, source) {
                        if let Err(e) = socket.send_to(&response, source).await {
                            debug!(error = %e, "binding response send failed");
                        }
                    }
                }
                Ok(message) if message.is_binding_success() => {
                    let _ = stun_tx.try_send(datagram.to_vec());
                }
                Ok(_) => trace!("ignoring STUN message"),
                Err(e) => debug!(error = %e, "malformed STUN datagram"),
            },
            PacketKind::Rtp => {
                if rtp_tx.send(Bytes::copy_from_slice(datagram)).is_err() {
                    break;
                }
            }
            PacketKind::Unknown => trace!(len, "dropping unclassifiable datagram"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtcp_port_never_wraps_around() {
        let rtp: SocketAddr = "203.0.113.9:29586".parse().unwrap();
        assert_eq!(
            rtcp_companion(rtp),
            Some("203.0.113.9:29587".parse().unwrap())
        );

        let top: SocketAddr = "203.0.113.9:65535".parse().unwrap();
        assert_eq!(rtcp_companion(top), None);
    }

    #[tokio::test]
    async fn socket_pump_separates_stun_from_rtp() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let (rtp_tx, mut rtp_rx) = mpsc::unbounded_channel();
        let (stun_tx, _stun_rx) = mpsc::channel(4);
        tokio::spawn(pump_socket(Arc::clone(&socket), rtp_tx, stun_tx));

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // A binding request gets answered with a success response
        let request = stun::binding_request(&stun::TransactionId::random());
        peer.send_to(&request, addr).await.unwrap();
        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            peer.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(stun::parse(&buf[..len]).unwrap().is_binding_success());

        // An RTP packet is forwarded to the relay channel
        let mut rtp = vec![0u8; 64];
        rtp[0] = 0x80;
        rtp[1] = 99; // video payload type
        peer.send_to(&rtp, addr).await.unwrap();
        let forwarded = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            rtp_rx.recv(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(forwarded.len(), 64);
    }
}
