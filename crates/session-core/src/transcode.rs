//! Transcoder process orchestration
//!
//! The session does not decode media itself; it hands the negotiated
//! streams to an external transcoder (ffmpeg or compatible). The recipe:
//! reserve local UDP ports, rewrite the remote SDP's media ports onto
//! them, spawn the process with that SDP on stdin, and relay the inbound
//! RTP feeds into the ports the process is now listening on. Process
//! exit, for any reason, ends the call.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use chime_media_core::sdp::{rewrite_media_ports, SdpDocument};
use chime_media_core::SrtpMaterial;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::AudioCodec;
use crate::error::{Error, Result};

/// Caller-supplied transcoder arguments, mirroring the three argument
/// groups of an ffmpeg invocation
#[derive(Debug, Clone, Default)]
pub struct TranscodeOptions {
    /// Drop the video leg entirely and transcode audio only
    pub audio_only: bool,
    /// Output audio arguments (defaults to `-acodec aac`)
    pub audio: Vec<String>,
    /// Output video arguments (defaults to `-vcodec copy`)
    pub video: Vec<String>,
    /// Output destination arguments, e.g. a path or an RTSP URL
    pub output: Vec<String>,
}

/// A running transcoder plus its relay tasks
pub struct Transcoder {
    kill: Option<oneshot::Sender<()>>,
    relays: Vec<JoinHandle<()>>,
}

impl Transcoder {
    /// Spawn the transcoder and start relaying.
    ///
    /// `exit_tx` fires once when the process exits on its own; a stop
    /// through [`Transcoder::stop`] does not fire it.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        binary: &Path,
        input_sdp: String,
        audio_codec: AudioCodec,
        audio_rtp: mpsc::UnboundedReceiver<Bytes>,
        audio_port: u16,
        video_rtp: Option<mpsc::UnboundedReceiver<Bytes>>,
        video_port: Option<u16>,
        options: &TranscodeOptions,
        exit_tx: oneshot::Sender<()>,
    ) -> Result<Self> {
        let args = build_args(audio_codec, options);
        debug!(binary = %binary.display(), ?args, "spawning transcoder");
        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transcoder(format!("could not spawn transcoder: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transcoder("transcoder has no stdin".into()))?;
        // An instantly-dead process shows up as a broken pipe here; the
        // exit watcher below reports it, so the write is best-effort.
        if let Err(e) = stdin.write_all(input_sdp.as_bytes()).await {
            debug!(error = %e, "input SDP write failed");
        }
        let _ = stdin.shutdown().await;
        drop(stdin);
        trace!(sdp = %input_sdp, "wrote input SDP");

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    info!(?status, "transcoder exited");
                    let _ = exit_tx.send(());
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        debug!(error = %e, "transcoder kill failed");
                    }
                }
            }
        });

        let mut relays = vec![tokio::spawn(relay(audio_rtp, audio_port))];
        if let (Some(video_rtp), Some(video_port)) = (video_rtp, video_port) {
            relays.push(tokio::spawn(relay(video_rtp, video_port)));
        }

        Ok(Self {
            kill: Some(kill_tx),
            relays,
        })
    }

    /// Kill the process and stop the relays. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        for relay in self.relays.drain(..) {
            relay.abort();
        }
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A running return-audio pipeline: a second transcoder emitting RTP to
/// a local port, forwarded into the call's audio sink.
pub struct ReturnAudio {
    kill: Option<oneshot::Sender<()>>,
    forward: JoinHandle<()>,
}

impl ReturnAudio {
    /// Spawn the return-audio transcoder.
    ///
    /// `input` names the audio source the way the caller wants it
    /// (e.g. `-f pulse -i default`); packets the process emits are handed
    /// to `sink` one datagram at a time.
    pub async fn spawn(
        binary: &Path,
        input: &[String],
        codec: AudioCodec,
        srtp: Option<&SrtpMaterial>,
        sink: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let port = socket.local_addr()?.port();

        let args = return_audio_args(input, codec, srtp, port);
        debug!(binary = %binary.display(), ?args, "spawning return-audio transcoder");
        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transcoder(format!("could not spawn return audio: {e}")))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => debug!(?status, "return-audio transcoder exited"),
                _ = kill_rx => {
                    let _ = child.kill().await;
                }
            }
        });

        let forward = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, _)) => {
                        if sink.send(Bytes::copy_from_slice(&buf[..len])).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "return-audio socket closed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            kill: Some(kill_tx),
            forward,
        })
    }

    pub fn stop(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.forward.abort();
    }
}

impl Drop for ReturnAudio {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture a single frame from the video feed as a JPEG.
///
/// One-shot transcoder run: same input recipe as the live pipeline but
/// with `-frames:v 1` and the image on stdout.
pub async fn capture_snapshot(
    binary: &Path,
    input_sdp: String,
    video_rtp: mpsc::UnboundedReceiver<Bytes>,
    video_port: u16,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut args = base_input_args(AudioCodec::Pcmu);
    args.extend(words("-an -frames:v 1 -c:v mjpeg -f image2 pipe:1"));

    let mut child = Command::new(binary)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Transcoder(format!("could not spawn snapshot run: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Transcoder("snapshot run has no stdin".into()))?;
    if let Err(e) = stdin.write_all(input_sdp.as_bytes()).await {
        debug!(error = %e, "snapshot SDP write failed");
    }
    let _ = stdin.shutdown().await;
    drop(stdin);

    let relay = tokio::spawn(relay(video_rtp, video_port));
    let output = tokio::time::timeout(timeout, child.wait_with_output()).await;
    relay.abort();

    let output = output
        .map_err(|_| Error::Transcoder("snapshot timed out".into()))?
        .map_err(|e| Error::Transcoder(format!("snapshot run failed: {e}")))?;
    if !output.status.success() || output.stdout.is_empty() {
        return Err(Error::Transcoder(format!(
            "snapshot run produced no frame (status {})",
            output.status
        )));
    }
    Ok(output.stdout)
}

/// Reserve a local UDP port for the transcoder to listen on.
///
/// The socket is dropped straight away; the process binds the port
/// itself when it parses the SDP.
pub async fn reserve_udp_port() -> Result<u16> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    Ok(socket.local_addr()?.port())
}

/// Derive the transcoder input SDP from the remote SDP: media ports move
/// to the local relay ports, the connection address becomes loopback,
/// and when the feed is already decrypted the crypto lines go away and
/// the profile drops back to plain RTP/AVP.
pub fn build_input_sdp(
    remote_sdp: &str,
    audio_port: u16,
    video_port: Option<u16>,
    decrypted: bool,
) -> Result<String> {
    let rewritten = rewrite_media_ports(remote_sdp, Some(audio_port), video_port)?;
    let mut doc = SdpDocument::parse(&rewritten)?;

    let fix_lines = |lines: &mut Vec<String>| {
        lines.retain(|line| !(decrypted && line.starts_with("a=crypto:")));
        for line in lines.iter_mut() {
            if line.starts_with("c=") {
                *line = "c=IN IP4 127.0.0.1".to_string();
            } else if line.starts_with("m=") {
                let mut parts: Vec<&str> = line.split(' ').collect();
                if parts.len() > 2 {
                    let profile = if decrypted { "RTP/AVP" } else { "RTP/SAVP" };
                    parts[2] = profile;
                    *line = parts.join(" ");
                }
            }
        }
    };

    fix_lines(&mut doc.session_lines);
    for section in doc.media.iter_mut() {
        fix_lines(&mut section.lines);
    }
    Ok(doc.to_sdp())
}

fn base_input_args(audio_codec: AudioCodec) -> Vec<String> {
    let mut args = words("-hide_banner -loglevel error");
    args.extend(words("-protocol_whitelist pipe,udp,rtp,file,crypto"));
    match audio_codec {
        AudioCodec::Opus => args.extend(words("-acodec libopus")),
        AudioCodec::Pcmu => args.extend(words("-acodec pcm_mulaw")),
    }
    args.extend(words("-f sdp -i pipe:0"));
    args
}

fn return_audio_args(
    input: &[String],
    codec: AudioCodec,
    srtp: Option<&SrtpMaterial>,
    port: u16,
) -> Vec<String> {
    let mut args: Vec<String> = input.to_vec();
    match codec {
        AudioCodec::Opus => args.extend(words("-acodec libopus -ar 48000 -ac 2")),
        AudioCodec::Pcmu => args.extend(words("-acodec pcm_mulaw -ar 8000 -ac 1")),
    }
    match srtp {
        Some(material) => {
            args.extend(words("-f rtp -srtp_out_suite AES_CM_128_HMAC_SHA1_80"));
            args.push("-srtp_out_params".into());
            args.push(material.to_base64());
            args.push(format!("srtp://127.0.0.1:{port}"));
        }
        None => {
            args.extend(words("-f rtp"));
            args.push(format!("rtp://127.0.0.1:{port}"));
        }
    }
    args
}

fn build_args(audio_codec: AudioCodec, options: &TranscodeOptions) -> Vec<String> {
    let mut args = base_input_args(audio_codec);
    if options.audio.is_empty() {
        args.extend(words("-acodec aac"));
    } else {
        args.extend(options.audio.iter().cloned());
    }
    if options.video.is_empty() {
        args.extend(words("-vcodec copy"));
    } else {
        args.extend(options.video.iter().cloned());
    }
    args.extend(options.output.iter().cloned());
    args
}

fn words(s: &str) -> Vec<String> {
    s.split(' ').map(str::to_string).collect()
}

/// Push channel packets at a local transcoder input port
async fn relay(mut rtp: mpsc::UnboundedReceiver<Bytes>, port: u16) {
    let socket = match UdpSocket::bind("127.0.0.1:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "could not bind relay socket");
            return;
        }
    };
    let target = format!("127.0.0.1:{port}");
    while let Some(packet) = rtp.recv().await {
        if let Err(e) = socket.send_to(&packet, &target).await {
            debug!(error = %e, "relay send failed");
            break;
        }
    }
    trace!(port, "relay finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    const REMOTE_SDP: &str = "v=0\r\n\
        o=- 1 1 IN IP4 203.0.113.9\r\n\
        s=camera\r\n\
        c=IN IP4 203.0.113.9\r\n\
        t=0 0\r\n\
        m=audio 29586 RTP/SAVP 0\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGw==\r\n\
        m=video 29588 RTP/SAVP 99\r\n\
        a=rtpmap:99 H264/90000\r\n\
        a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:HBcWFRQTEhEQDw4NDAsKCQgHBgUEAwIBAAECAw==\r\n";

    #[test]
    fn input_sdp_for_encrypted_feed_keeps_crypto() {
        let sdp = build_input_sdp(REMOTE_SDP, 40000, Some(40002), false).unwrap();
        assert!(sdp.contains("m=audio 40000 RTP/SAVP 0"));
        assert!(sdp.contains("m=video 40002 RTP/SAVP 99"));
        assert!(sdp.contains("c=IN IP4 127.0.0.1"));
        assert!(!sdp.contains("203.0.113.9") || sdp.contains("o=- 1 1 IN IP4 203.0.113.9"));
        assert_eq!(sdp.matches("a=crypto:").count(), 2);
    }

    #[test]
    fn input_sdp_for_decrypted_feed_strips_crypto() {
        let sdp = build_input_sdp(REMOTE_SDP, 40000, Some(40002), true).unwrap();
        assert!(sdp.contains("m=audio 40000 RTP/AVP 0"));
        assert!(sdp.contains("m=video 40002 RTP/AVP 99"));
        assert!(!sdp.contains("a=crypto:"));
    }

    #[test]
    fn input_sdp_audio_only() {
        let audio_only = chime_media_core::sdp::remove_video_section(REMOTE_SDP).unwrap();
        let sdp = build_input_sdp(&audio_only, 40000, None, true).unwrap();
        assert!(sdp.contains("m=audio 40000"));
        assert!(!sdp.contains("m=video"));
    }

    #[test]
    fn argument_recipe() {
        let args = build_args(AudioCodec::Opus, &TranscodeOptions::default());
        let joined = args.join(" ");
        assert!(joined.contains("-protocol_whitelist pipe,udp,rtp,file,crypto"));
        assert!(joined.contains("-acodec libopus -f sdp -i pipe:0"));
        assert!(joined.contains("-acodec aac"));
        assert!(joined.contains("-vcodec copy"));

        let custom = TranscodeOptions {
            audio: words("-acodec copy"),
            output: words("-f null -"),
            ..Default::default()
        };
        let args = build_args(AudioCodec::Pcmu, &custom);
        let joined = args.join(" ");
        assert!(joined.contains("-acodec pcm_mulaw"));
        assert!(joined.contains("-acodec copy"));
        assert!(joined.ends_with("-f null -"));
    }

    #[test]
    fn return_audio_argument_recipe() {
        let input = words("-f pulse -i default");
        let args = return_audio_args(&input, AudioCodec::Opus, None, 40000);
        let joined = args.join(" ");
        assert!(joined.starts_with("-f pulse -i default"));
        assert!(joined.contains("-acodec libopus -ar 48000 -ac 2"));
        assert!(joined.ends_with("-f rtp rtp://127.0.0.1:40000"));

        let material = SrtpMaterial {
            key: [1; 16],
            salt: [2; 14],
        };
        let args = return_audio_args(&input, AudioCodec::Pcmu, Some(&material), 40000);
        let joined = args.join(" ");
        assert!(joined.contains("-acodec pcm_mulaw -ar 8000 -ac 1"));
        assert!(joined.contains("-srtp_out_suite AES_CM_128_HMAC_SHA1_80"));
        assert!(joined.contains(&material.to_base64()));
        assert!(joined.ends_with("srtp://127.0.0.1:40000"));
    }

    #[tokio::test]
    async fn relay_delivers_packets_to_the_port() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(relay(rx, port));

        tx.send(Bytes::from_static(b"\x80\x63rtp-payload")).unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"\x80\x63rtp-payload");
    }

    #[tokio::test]
    async fn process_exit_fires_the_notification() {
        // `cat` exits as soon as stdin closes, standing in for a
        // transcoder that died.
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let _transcoder = Transcoder::spawn(
            Path::new("cat"),
            "v=0\r\n".into(),
            AudioCodec::Pcmu,
            audio_rx,
            reserve_udp_port().await.unwrap(),
            None,
            None,
            &TranscodeOptions::default(),
            exit_tx,
        )
        .await
        .unwrap();
        drop(audio_tx);

        tokio::time::timeout(Duration::from_secs(5), exit_rx)
            .await
            .expect("no exit notification")
            .expect("exit channel dropped");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (_audio_tx, audio_rx) = mpsc::unbounded_channel::<Bytes>();
        let (exit_tx, _exit_rx) = oneshot::channel();
        let mut transcoder = Transcoder::spawn(
            Path::new("cat"),
            "v=0\r\n".into(),
            AudioCodec::Pcmu,
            audio_rx,
            reserve_udp_port().await.unwrap(),
            None,
            None,
            &TranscodeOptions::default(),
            exit_tx,
        )
        .await
        .unwrap();
        transcoder.stop();
        transcoder.stop();
    }
}
