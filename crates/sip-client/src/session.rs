//! Legacy SIP session over TLS
//!
//! Owns one SIP dialog with a camera: INVITE to open the media session,
//! INFO for DTMF and keyframe nudges, BYE to hang up. The transaction
//! sequencing is strictly one-at-a-time, which is all this backend ever
//! does. Response-code policy (learned by long observation of the vendor
//! backend, not from any RFC):
//!
//! - status < 200 is provisional and skipped
//! - 480 on INVITE means the ding expired; the caller fetches a fresh
//!   session and retries the whole negotiation once
//! - any other status >= 300 rejects the request
//! - 408 on BYE is expected (the far end is often already gone) and is
//!   not treated as an error

use std::net::SocketAddr;
use std::sync::Arc;

use rand::distributions::{Alphanumeric, DistString};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, OwnedTrustAnchor, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::message::{read_message, Incoming, Method, Request, Response};
use crate::sdp::{build_offer, parse_answer, OfferParams, RemoteStreams};

/// Vendor-defined DTMF digit that unmutes the camera speaker
const SPEAKER_ON_DIGIT: char = '2';

const MEDIA_CONTROL_BODY: &str = "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\
    <media_control><vc_primitive><to_encoder>\
    <picture_fast_update></picture_fast_update>\
    </to_encoder></vc_primitive></media_control>";

/// Connection parameters for the legacy SIP backend.
///
/// Host, port and URIs come out of the opaque session token the vendor
/// API hands to the caller; decoding that token is the caller's job.
#[derive(Debug, Clone)]
pub struct SipConfig {
    /// SIP server hostname (also used for TLS verification)
    pub host: String,
    /// SIP-over-TLS port
    pub port: u16,
    /// Our own SIP URI
    pub local_uri: String,
    /// The camera's SIP URI; also the request URI
    pub remote_uri: String,
    /// Vendor auth headers sent on every request
    pub auth_headers: Vec<(String, String)>,
}

/// The session type produced by [`SipSession::connect`]
pub type TlsSipSession = SipSession<TlsStream<TcpStream>>;

/// One SIP dialog over an established stream
pub struct SipSession<S> {
    config: SipConfig,
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    local_addr: SocketAddr,
    call_id: String,
    from_tag: String,
    to_tag: Option<String>,
    cseq: u32,
    invite_cseq: u32,
    speaker_activated: bool,
}

impl SipSession<TlsStream<TcpStream>> {
    /// Connect to the SIP backend over TLS with webpki roots
    pub async fn connect(config: SipConfig) -> Result<Self> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
        let local_addr = tcp.local_addr()?;

        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let tls_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = rustls::ServerName::try_from(config.host.as_str())
            .map_err(|e| Error::Tls(format!("invalid server name: {e}")))?;
        let stream = TlsConnector::from(Arc::new(tls_config))
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;

        debug!(host = %config.host, port = config.port, "SIP TLS connection established");
        Ok(Self::from_stream(stream, config, local_addr))
    }
}

impl<S> SipSession<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Build a session over an already-established stream
    pub fn from_stream(stream: S, config: SipConfig, local_addr: SocketAddr) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            config,
            reader: BufReader::new(read_half),
            writer: write_half,
            local_addr,
            call_id: Alphanumeric.sample_string(&mut rand::thread_rng(), 24),
            from_tag: Alphanumeric.sample_string(&mut rand::thread_rng(), 10),
            to_tag: None,
            cseq: 0,
            invite_cseq: 0,
            speaker_activated: false,
        }
    }

    /// Local address of the underlying stream, the reachable media IP
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn next_request(&mut self, method: Method) -> Request {
        self.cseq += 1;
        self.request_with_cseq(method, self.cseq)
    }

    fn request_with_cseq(&self, method: Method, cseq: u32) -> Request {
        let branch = Alphanumeric.sample_string(&mut rand::thread_rng(), 16);
        let mut to = format!("<{}>", self.config.remote_uri);
        if let Some(tag) = &self.to_tag {
            to.push_str(&format!(";tag={tag}"));
        }
        let mut request = Request::new(method, self.config.remote_uri.clone())
            .header("Via", format!("SIP/2.0/TLS {};branch=z9hG4bK{branch}", self.local_addr))
            .header("Max-Forwards", "70")
            .header("From", format!("<{}>;tag={}", self.config.local_uri, self.from_tag))
            .header("To", to)
            .header("Call-ID", self.call_id.clone())
            .header("CSeq", format!("{cseq} {}", method.as_str()))
            .header("Contact", format!("<sip:chime@{};transport=tls>", self.local_addr))
            .header("User-Agent", "chime/0.3");
        for (name, value) in &self.config.auth_headers {
            request = request.header(name.clone(), value.clone());
        }
        request
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        trace!(method = %request.method, "sending SIP request");
        self.writer.write_all(request.to_wire().as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a request and wait for its final response, skipping
    /// provisionals and acknowledging a remote BYE if one arrives instead.
    async fn transaction(&mut self, request: Request) -> Result<Response> {
        self.send(&request).await?;
        loop {
            match read_message(&mut self.reader).await? {
                Incoming::Response(response) if response.is_provisional() => {
                    trace!(status = response.status, "provisional response, waiting");
                }
                Incoming::Response(response) => {
                    if let Some(tag) = response.to_tag() {
                        if self.to_tag.is_none() {
                            self.to_tag = Some(tag.to_string());
                        }
                    }
                    return Ok(response);
                }
                Incoming::Request { method, headers } if method == "BYE" => {
                    self.acknowledge_remote_bye(&headers).await;
                    return Err(Error::RemoteHangup);
                }
                Incoming::Request { method, .. } => {
                    debug!(%method, "ignoring unexpected in-dialog request");
                }
            }
        }
    }

    async fn acknowledge_remote_bye(&mut self, headers: &[(String, String)]) {
        // Minimal 200 OK echoing the dialog-identifying headers
        let mut out = String::from("SIP/2.0 200 OK\r\n");
        for (name, value) in headers {
            if matches!(
                name.to_ascii_lowercase().as_str(),
                "via" | "from" | "to" | "call-id" | "cseq"
            ) {
                out.push_str(&format!("{name}: {value}\r\n"));
            }
        }
        out.push_str("Content-Length: 0\r\n\r\n");
        if let Err(e) = self.writer.write_all(out.as_bytes()).await {
            debug!(error = %e, "failed to acknowledge remote BYE");
        }
    }

    /// Run the INVITE negotiation: offer, final answer, ACK, then the DTMF
    /// and keyframe INFOs the backend requires shortly after answer (it
    /// drops the session if they don't arrive within about a minute).
    pub async fn invite(&mut self, offer: &OfferParams) -> Result<RemoteStreams> {
        let sdp = build_offer(offer);
        let request = self.next_request(Method::Invite).body("application/sdp", sdp);
        self.invite_cseq = self.cseq;

        let response = self.transaction(request).await?;
        match response.status {
            480 => {
                debug!("INVITE answered 480, session expired");
                Err(Error::SessionExpired)
            }
            status if status >= 300 => Err(Error::RequestRejected {
                method: "INVITE",
                status,
                reason: response.reason,
            }),
            status => {
                debug!(status, "INVITE answered");
                let streams = parse_answer(&response.body, offer)?;

                // ACK shares the INVITE's CSeq number
                let ack = self.request_with_cseq(Method::Ack, self.invite_cseq);
                self.send(&ack).await?;

                self.send_dtmf(SPEAKER_ON_DIGIT).await?;
                self.speaker_activated = true;
                self.request_keyframe().await?;
                Ok(streams)
            }
        }
    }

    /// Send a DTMF digit as an INFO request
    pub async fn send_dtmf(&mut self, digit: char) -> Result<()> {
        let body = format!("Signal={digit}\r\nDuration=250\r\n");
        let request = self
            .next_request(Method::Info)
            .body("application/dtmf-relay", body);
        let response = self.transaction(request).await?;
        if response.status >= 300 {
            return Err(Error::RequestRejected {
                method: "INFO",
                status: response.status,
                reason: response.reason,
            });
        }
        Ok(())
    }

    /// Ask the camera's encoder for a fresh keyframe
    pub async fn request_keyframe(&mut self) -> Result<()> {
        let request = self
            .next_request(Method::Info)
            .body("application/media_control+xml", MEDIA_CONTROL_BODY);
        let response = self.transaction(request).await?;
        if response.status >= 300 {
            return Err(Error::RequestRejected {
                method: "INFO",
                status: response.status,
                reason: response.reason,
            });
        }
        Ok(())
    }

    /// Unmute the camera speaker. Idempotent; the backend misbehaves if
    /// the digit is sent twice.
    pub async fn activate_speaker(&mut self) -> Result<()> {
        if self.speaker_activated {
            return Ok(());
        }
        self.send_dtmf(SPEAKER_ON_DIGIT).await?;
        self.speaker_activated = true;
        Ok(())
    }

    /// Hang up. Best effort: the call is already ending, so every failure
    /// here is logged and swallowed. A 408 means the far end beat us to it
    /// and is not even worth a warning.
    pub async fn send_bye(&mut self) {
        let request = self.next_request(Method::Bye);
        match self.transaction(request).await {
            Ok(response) if response.status == 408 => {
                debug!("BYE timed out at the far end, already gone");
            }
            Ok(response) if response.status >= 300 => {
                warn!(status = response.status, "BYE rejected");
            }
            Ok(_) => trace!("BYE acknowledged"),
            Err(Error::RemoteHangup) => {}
            Err(e) => debug!(error = %e, "BYE failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chime_media_core::{IceCredentials, SrtpMaterial};
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn config() -> SipConfig {
        SipConfig {
            host: "sip.example.com".into(),
            port: 5061,
            local_uri: "sip:client@example.com".into(),
            remote_uri: "sip:cam@example.com".into(),
            auth_headers: vec![("X-Auth".into(), "token".into())],
        }
    }

    fn offer_params() -> OfferParams {
        OfferParams {
            local_ip: "10.0.0.5".parse().unwrap(),
            audio_port: 51000,
            video_port: 51002,
            audio_srtp: SrtpMaterial {
                key: [1; 16],
                salt: [2; 14],
            },
            video_srtp: SrtpMaterial {
                key: [3; 16],
                salt: [4; 14],
            },
            audio_ssrc: 111,
            video_ssrc: 222,
            ice: IceCredentials {
                ufrag: "uf".into(),
                pwd: "pwd".into(),
            },
        }
    }

    fn session(stream: DuplexStream) -> SipSession<DuplexStream> {
        SipSession::from_stream(stream, config(), "10.0.0.5:40000".parse().unwrap())
    }

    async fn drain_request(server: &mut DuplexStream) -> String {
        let mut collected = Vec::new();
        // Read one byte at a time so we stop exactly at the end of the
        // first message and never consume bytes of the request after it.
        let mut buf = [0u8; 1];
        loop {
            let n = server.read(&mut buf).await.unwrap();
            collected.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&collected);
            if let Some(idx) = text.find("\r\n\r\n") {
                let headers = &text[..idx];
                let content_length: usize = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                if collected.len() >= idx + 4 + content_length {
                    return text.into_owned();
                }
            }
        }
    }

    fn answer_body() -> String {
        let key = SrtpMaterial {
            key: [7; 16],
            salt: [6; 14],
        };
        format!(
            "v=0\r\no=- 1 1 IN IP4 203.0.113.9\r\ns=-\r\nc=IN IP4 203.0.113.9\r\nt=0 0\r\n\
             m=audio 29586 RTP/SAVP 0\r\na=crypto:{c}\r\na=ssrc:1001\r\n\
             m=video 29588 RTP/SAVP 99\r\na=crypto:{c}\r\na=ssrc:2002\r\n",
            c = key.crypto_line_value(1),
        )
    }

    async fn write_response(server: &mut DuplexStream, status: u16, reason: &str, body: &str) {
        use tokio::io::AsyncWriteExt;
        let response = format!(
            "SIP/2.0 {status} {reason}\r\nTo: <sip:cam@example.com>;tag=rtag\r\nContent-Length: {}\r\n\r\n{body}",
            body.len(),
        );
        server.write_all(response.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn invite_480_is_session_expired() {
        init_tracing();
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut sip = session(client);

        let server_task = tokio::spawn(async move {
            let request = drain_request(&mut server).await;
            assert!(request.starts_with("INVITE "));
            assert!(request.contains("X-Auth: token"));
            write_response(&mut server, 480, "Temporarily Unavailable", "").await;
            server
        });

        let err = sip.invite(&offer_params()).await.unwrap_err();
        assert!(matches!(err, Error::SessionExpired));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn provisional_responses_are_skipped() {
        init_tracing();
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut sip = session(client);

        let server_task = tokio::spawn(async move {
            let _invite = drain_request(&mut server).await;
            write_response(&mut server, 100, "Trying", "").await;
            write_response(&mut server, 183, "Session Progress", "").await;
            write_response(&mut server, 200, "OK", &answer_body()).await;
            // ACK then two INFOs follow
            let ack = drain_request(&mut server).await;
            assert!(ack.starts_with("ACK "));
            let dtmf = drain_request(&mut server).await;
            assert!(dtmf.contains("dtmf-relay"));
            write_response(&mut server, 200, "OK", "").await;
            let keyframe = drain_request(&mut server).await;
            assert!(keyframe.contains("picture_fast_update"));
            write_response(&mut server, 200, "OK", "").await;
        });

        let streams = sip.invite(&offer_params()).await.unwrap();
        assert_eq!(streams.audio.ssrc, 1001);
        assert_eq!(streams.video.remote_port, 29588);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejection_carries_status() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut sip = session(client);

        let server_task = tokio::spawn(async move {
            let _ = drain_request(&mut server).await;
            write_response(&mut server, 503, "Service Unavailable", "").await;
        });

        match sip.invite(&offer_params()).await.unwrap_err() {
            Error::RequestRejected { status, .. } => assert_eq!(status, 503),
            other => panic!("unexpected error: {other}"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn bye_swallows_timeout() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut sip = session(client);

        let server_task = tokio::spawn(async move {
            let bye = drain_request(&mut server).await;
            assert!(bye.starts_with("BYE "));
            write_response(&mut server, 408, "Request Timeout", "").await;
        });

        // Must not error or panic
        sip.send_bye().await;
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn speaker_activation_is_idempotent() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut sip = session(client);

        let server_task = tokio::spawn(async move {
            let info = drain_request(&mut server).await;
            assert!(info.contains("Signal=2"));
            write_response(&mut server, 200, "OK", "").await;
            // A second INFO would hang this task; returning proves there
            // was exactly one.
        });

        sip.activate_speaker().await.unwrap();
        sip.activate_speaker().await.unwrap();
        server_task.await.unwrap();
    }
}
