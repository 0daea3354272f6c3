//! The streaming-session facade
//!
//! [`LiveSession`] ties one call connection to one transcoder pipeline
//! and owns the call-end cascade: whether the trigger is the consumer,
//! the backend, the media engine or the transcoder process dying, the
//! same guarded teardown runs once and the ended watch fires once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chime_media_core::sdp::remove_video_section;
use chime_media_core::SrtpMaterial;
use chime_sip_client::{Error as SipError, SipConfig};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ConnectionKind, SessionConfig, SipSessionSource};
use crate::connection::{
    AudioCodec, CallConnection, ConnectionEvent, MediaPlan, SipCall, WebRtcCall,
};
use crate::error::{Error, Result};
use crate::transcode::{
    build_input_sdp, capture_snapshot, reserve_udp_port, ReturnAudio, TranscodeOptions, Transcoder,
};

/// One live streaming session with a device
pub struct LiveSession {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    connection: Arc<dyn CallConnection>,
    audio_codec: AudioCodec,
    return_codec: AudioCodec,
    return_srtp: Option<SrtpMaterial>,
    plan: Mutex<Option<Box<MediaPlan>>>,
    transcoder: std::sync::Mutex<Option<Transcoder>>,
    return_audio: std::sync::Mutex<Option<ReturnAudio>>,
    ended: AtomicBool,
    ended_tx: watch::Sender<bool>,
}

impl LiveSession {
    /// Negotiate a session with the device and wait for the answer.
    ///
    /// On the legacy path an expired session token (480 on the INVITE)
    /// is retried exactly once with freshly fetched parameters; a second
    /// failure of any kind propagates.
    pub async fn start(config: SessionConfig) -> Result<Self> {
        let (connection, events): (Arc<dyn CallConnection>, _) = match &config.connection {
            ConnectionKind::Signaling {
                endpoint,
                variant,
                auth_headers,
            } => {
                let (call, events) = WebRtcCall::connect(
                    endpoint.clone(),
                    *variant,
                    config.device_id,
                    auth_headers.clone(),
                )
                .await?;
                (Arc::new(call), events)
            }
            ConnectionKind::Sip { source } => {
                let (call, events) =
                    with_expired_retry(source.as_ref(), |sip_config| SipCall::connect(sip_config))
                        .await?;
                (Arc::new(call), events)
            }
        };

        Self::assemble(config, connection, events).await
    }

    /// Wire up a connected call: wait for the answer, then watch for the
    /// remote end.
    async fn assemble(
        config: SessionConfig,
        connection: Arc<dyn CallConnection>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Result<Self> {
        let plan = match events.recv().await {
            Some(ConnectionEvent::Answered(plan)) => plan,
            Some(ConnectionEvent::Ended) | None => {
                connection.stop().await;
                return Err(Error::CallEnded);
            }
        };

        let (ended_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            connection,
            audio_codec: plan.audio_codec,
            return_codec: plan.return_codec,
            return_srtp: plan.return_audio_srtp.clone(),
            plan: Mutex::new(Some(plan)),
            transcoder: std::sync::Mutex::new(None),
            return_audio: std::sync::Mutex::new(None),
            ended: AtomicBool::new(false),
            ended_tx,
        });

        let watcher = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if matches!(event, ConnectionEvent::Ended) {
                    watcher.teardown().await;
                    break;
                }
            }
        });

        Ok(Self { inner })
    }

    /// Spawn the transcoder over the negotiated streams.
    ///
    /// Consumes the media plan: one pipeline (or one snapshot) per
    /// session. Transcoder exit ends the call.
    pub async fn start_transcoding(&self, options: TranscodeOptions) -> Result<()> {
        let plan = self.take_plan().await?;

        let audio_port = reserve_udp_port().await?;
        let want_video = !options.audio_only && plan.video.is_some();
        let video_port = if want_video {
            Some(reserve_udp_port().await?)
        } else {
            None
        };

        let decrypted = plan.audio.srtp.is_none();
        let mut remote_sdp = plan.remote_sdp.clone();
        if !want_video {
            remote_sdp = remove_video_section(&remote_sdp)?;
        }
        let input_sdp = build_input_sdp(&remote_sdp, audio_port, video_port, decrypted)?;

        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        let transcoder = Transcoder::spawn(
            &self.inner.config.transcoder_path,
            input_sdp,
            plan.audio_codec,
            plan.audio_rtp,
            audio_port,
            want_video.then_some(plan.video_rtp).flatten(),
            video_port,
            &options,
            exit_tx,
        )
        .await?;
        *self.inner.transcoder.lock().unwrap() = Some(transcoder);

        let watcher = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if exit_rx.await.is_ok() {
                info!("transcoder exited, ending the call");
                watcher.teardown().await;
            }
        });

        // Make the first seconds watchable without waiting for the
        // periodic PLI
        if let Err(e) = self.inner.connection.request_keyframe().await {
            debug!(error = %e, "initial keyframe request failed");
        }
        Ok(())
    }

    /// Spawn the return-audio pipeline and unmute the device.
    ///
    /// `input` is the transcoder's audio-source argument list, e.g.
    /// `-f pulse -i default`.
    pub async fn start_return_audio(&self, input: Vec<String>) -> Result<()> {
        if !self.inner.config.return_audio {
            return Err(Error::Transcoder(
                "return audio not enabled for this session".into(),
            ));
        }
        if self.inner.ended.load(Ordering::SeqCst) {
            return Err(Error::CallEnded);
        }

        self.inner.connection.activate().await?;

        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let pipeline = ReturnAudio::spawn(
            &self.inner.config.transcoder_path,
            &input,
            self.inner.return_codec,
            self.inner.return_srtp.as_ref(),
            sink_tx,
        )
        .await?;
        *self.inner.return_audio.lock().unwrap() = Some(pipeline);

        let forward = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(packet) = sink_rx.recv().await {
                if forward.ended.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = forward.connection.send_audio(packet).await {
                    warn!(error = %e, "return-audio send failed");
                    break;
                }
            }
        });
        Ok(())
    }

    /// Grab a single video frame instead of streaming.
    ///
    /// Consumes the media plan like [`start_transcoding`] does; a
    /// session does one or the other.
    ///
    /// [`start_transcoding`]: LiveSession::start_transcoding
    pub async fn snapshot(&self, timeout: Duration) -> Result<Vec<u8>> {
        let plan = self.take_plan().await?;
        let video_rtp = plan
            .video_rtp
            .ok_or_else(|| Error::Transcoder("session has no video leg".into()))?;

        let video_port = reserve_udp_port().await?;
        let decrypted = plan.audio.srtp.is_none();
        let input_sdp = build_input_sdp(
            &plan.remote_sdp,
            reserve_udp_port().await?,
            Some(video_port),
            decrypted,
        )?;

        if let Err(e) = self.inner.connection.request_keyframe().await {
            debug!(error = %e, "snapshot keyframe request failed");
        }
        capture_snapshot(
            &self.inner.config.transcoder_path,
            input_sdp,
            video_rtp,
            video_port,
            timeout,
        )
        .await
    }

    /// Turn the device's speaker/stream on
    pub async fn activate(&self) -> Result<()> {
        if self.inner.ended.load(Ordering::SeqCst) {
            return Err(Error::CallEnded);
        }
        self.inner.connection.activate().await
    }

    /// Ask the device for a video keyframe
    pub async fn request_keyframe(&self) -> Result<()> {
        if self.inner.ended.load(Ordering::SeqCst) {
            return Err(Error::CallEnded);
        }
        self.inner.connection.request_keyframe().await
    }

    /// Watch that flips to `true` exactly once when the call ends
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.inner.ended_tx.subscribe()
    }

    /// True once the call has ended
    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// End the call. Idempotent from every trigger path.
    pub async fn stop(&self) {
        self.inner.teardown().await;
    }

    async fn take_plan(&self) -> Result<Box<MediaPlan>> {
        if self.inner.ended.load(Ordering::SeqCst) {
            return Err(Error::CallEnded);
        }
        self.inner
            .plan
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Transcoder("media streams already consumed".into()))
    }
}

impl Inner {
    /// The one call-end cascade. Runs its body at most once.
    async fn teardown(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("session teardown");
        if let Some(mut transcoder) = self.transcoder.lock().unwrap().take() {
            transcoder.stop();
        }
        if let Some(mut return_audio) = self.return_audio.lock().unwrap().take() {
            return_audio.stop();
        }
        self.plan.lock().await.take();
        self.connection.stop().await;
        let _ = self.ended_tx.send(true);
    }
}

/// Run `connect` with parameters from `source`, retrying exactly once
/// when the session token has expired.
async fn with_expired_retry<T, F, Fut>(source: &dyn SipSessionSource, connect: F) -> Result<T>
where
    F: Fn(SipConfig) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let config = source.fetch().await?;
    match connect(config).await {
        Err(Error::Sip(SipError::SessionExpired)) => {
            info!("session expired, negotiating once with fresh parameters");
            let config = source.fetch().await?;
            connect(config).await
        }
        other => other,
    }
}
