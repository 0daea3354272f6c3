//! The signaling connection state machine
//!
//! One connection drives one call. The connection task owns the socket
//! and the state machine; consumers interact through a command handle and
//! an event stream. There is no reconnection: any socket error or close
//! is a terminal call-end event (the device-sync channel elsewhere in the
//! product reconnects, a streaming session never does).

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{CloseReason, IncomingKind, IncomingMessage, Outgoing, StreamOptions};
use crate::state::CallState;
use crate::variant::ProtocolVariant;

/// Keepalive spacing for the dialog variant
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Connection parameters for one signaling session
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// WebSocket endpoint (`wss://...`; `ws://` only in tests)
    pub endpoint: String,
    /// Device the live view is requested from
    pub device_id: u64,
    /// Which backend generation the endpoint speaks
    pub variant: ProtocolVariant,
    /// Auth headers added to the upgrade request
    pub auth_headers: Vec<(String, String)>,
}

/// Events delivered to the connection's consumer
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The remote SDP answer; feed it to the media transport
    Answer { sdp: String },
    /// A remote ICE candidate; feed it to the media transport
    RemoteIce { candidate: String, m_line_index: u16 },
    /// Activation messages have been sent
    Activated,
    /// Informational notification from the backend
    Notification(Value),
    /// Device option report
    CameraOptions(Value),
    /// Terminal: the call ended. Emitted exactly once.
    Ended { reason: Option<CloseReason> },
}

enum Command {
    Ice { candidate: String, m_line_index: u16 },
    Activate,
    CameraOptions(Value),
    Close,
}

/// Handle to a running signaling connection
#[derive(Clone)]
pub struct SignalingConnection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<CallState>,
}

impl SignalingConnection {
    /// Open the socket, send the local offer, and start the state
    /// machine. Returns the handle and the event stream.
    pub async fn connect(
        config: SignalingConfig,
        local_offer: String,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let mut request = config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(Error::WebSocket)?;
        for (name, value) in &config.auth_headers {
            let name: http::header::HeaderName = name
                .parse()
                .map_err(|_| Error::Protocol(format!("bad header name: {name}")))?;
            let value = value
                .parse()
                .map_err(|_| Error::Protocol(format!("bad header value for {name}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _) = connect_async(request).await?;
        info!(endpoint = %config.endpoint, variant = ?config.variant, "signaling socket open");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);

        let runner = Runner {
            ws,
            config,
            dialog_id: Uuid::new_v4().to_string(),
            session_id: None,
            state_tx,
            event_tx,
            cmd_rx,
            offer_sent: false,
            pending_candidates: Vec::new(),
            activation_sent: false,
            ended: false,
        };
        tokio::spawn(runner.run(local_offer));

        Ok((Self { cmd_tx, state_rx }, event_rx))
    }

    /// Queue a locally gathered ICE candidate. Candidates queued before
    /// the offer is on the wire are buffered behind the offer gate.
    pub fn send_ice_candidate(&self, candidate: String, m_line_index: u16) {
        let _ = self.cmd_tx.send(Command::Ice {
            candidate,
            m_line_index,
        });
    }

    /// Request activation. Deferred until the answer arrives; repeated
    /// calls collapse into a single activation.
    pub fn activate(&self) {
        let _ = self.cmd_tx.send(Command::Activate);
    }

    /// Send device-specific options
    pub fn send_camera_options(&self, options: Value) {
        let _ = self.cmd_tx.send(Command::CameraOptions(options));
    }

    /// Begin a graceful teardown. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Current call state
    pub fn state(&self) -> CallState {
        *self.state_rx.borrow()
    }

    /// Watch channel for call state transitions
    pub fn state_receiver(&self) -> watch::Receiver<CallState> {
        self.state_rx.clone()
    }
}

struct Runner {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: SignalingConfig,
    dialog_id: String,
    session_id: Option<String>,
    state_tx: watch::Sender<CallState>,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    offer_sent: bool,
    pending_candidates: Vec<(String, u16)>,
    activation_sent: bool,
    ended: bool,
}

impl Runner {
    async fn run(mut self, local_offer: String) {
        // Socket is open: the offer goes out first, releasing the
        // candidate gate.
        if let Err(e) = self.send(&Outgoing::LiveView { sdp: local_offer }).await {
            warn!(error = %e, "failed to send offer");
            self.finish(None);
            return;
        }
        self.offer_sent = true;
        self.set_state(CallState::OfferSent);
        let buffered = std::mem::take(&mut self.pending_candidates);
        for (candidate, m_line_index) in buffered {
            if self.send_ice(candidate, m_line_index).await.is_err() {
                self.finish(None);
                return;
            }
        }

        // First tick after a full interval; the socket just opened
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(Command::Ice { candidate, m_line_index }) => {
                            if !self.offer_sent {
                                self.pending_candidates.push((candidate, m_line_index));
                            } else if self.send_ice(candidate, m_line_index).await.is_err() {
                                break;
                            }
                        }
                        Some(Command::Activate) => {
                            if self.try_activate().await.is_err() {
                                break;
                            }
                        }
                        Some(Command::CameraOptions(options)) => {
                            if self.send(&Outgoing::CameraOptions(options)).await.is_err() {
                                break;
                            }
                        }
                        Some(Command::Close) | None => {
                            // Graceful local stop; tell the backend first
                            let _ = self.send(&Outgoing::Close { code: CloseReason::NORMAL }).await;
                            let _ = self.ws.close(None).await;
                            break;
                        }
                    }
                }
                inbound = self.ws.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            match self.config.variant.parse(&text) {
                                Ok(message) => {
                                    if self.handle(message).await {
                                        break;
                                    }
                                }
                                Err(e) => debug!(error = %e, "unparseable signaling message"),
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            debug!(?frame, "socket closed by remote");
                            break;
                        }
                        Some(Ok(_)) => {} // binary/ping/pong frames
                        Some(Err(e)) => {
                            warn!(error = %e, "socket error, ending call");
                            break;
                        }
                        None => break,
                    }
                }
                _ = ping.tick(), if self.config.variant.sends_keepalive_ping() => {
                    if self.send(&Outgoing::Ping).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.finish(None);
    }

    /// Process one inbound message; returns true when the call is over
    async fn handle(&mut self, message: IncomingMessage) -> bool {
        // Messages for a different session never reach the state machine
        if let (Some(bound), Some(session_id)) = (&self.session_id, &message.session_id) {
            if bound != session_id {
                debug!(%session_id, %bound, "discarding message for foreign session");
                return false;
            }
        }

        match message.kind {
            IncomingKind::SessionCreated | IncomingKind::SessionStarted => {
                if self.session_id.is_none() {
                    match message.session_id {
                        Some(session_id) => {
                            debug!(%session_id, "session assigned");
                            self.session_id = Some(session_id);
                            self.set_state(CallState::SessionAssigned);
                        }
                        None => warn!("session message without session id"),
                    }
                }
                false
            }
            IncomingKind::Sdp { sdp } => {
                self.set_state(CallState::Answered);
                let _ = self.event_tx.send(SignalingEvent::Answer { sdp });
                // Without activation the backend drops the stream after
                // roughly seventy seconds, so it follows the answer
                // immediately.
                self.try_activate().await.is_err()
            }
            IncomingKind::Ice {
                candidate,
                m_line_index,
            } => {
                let _ = self.event_tx.send(SignalingEvent::RemoteIce {
                    candidate,
                    m_line_index,
                });
                false
            }
            IncomingKind::Pong => {
                trace!("pong");
                false
            }
            IncomingKind::Notification(value) => {
                let _ = self.event_tx.send(SignalingEvent::Notification(value));
                false
            }
            IncomingKind::CameraOptions(value) => {
                let _ = self.event_tx.send(SignalingEvent::CameraOptions(value));
                false
            }
            IncomingKind::Close(reason) => {
                info!(code = reason.code, text = %reason.text, "backend closed the call");
                self.finish(Some(reason));
                true
            }
            IncomingKind::Unknown(method) => {
                debug!(%method, "ignoring unknown method");
                false
            }
        }
    }

    /// Send activation exactly once, and only once answered
    async fn try_activate(&mut self) -> Result<()> {
        if self.activation_sent || *self.state_tx.borrow() < CallState::Answered {
            return Ok(());
        }
        self.send(&Outgoing::ActivateSession).await?;
        self.send(&Outgoing::StreamOptions(StreamOptions {
            audio_enabled: true,
            video_enabled: true,
        }))
        .await?;
        self.activation_sent = true;
        self.set_state(CallState::Activated);
        let _ = self.event_tx.send(SignalingEvent::Activated);
        Ok(())
    }

    async fn send_ice(&mut self, candidate: String, m_line_index: u16) -> Result<()> {
        if self.config.variant.duplicates_mline_ice() {
            // Known backend quirk: without the duplicate only one media
            // leg ever connects.
            for index in [0u16, 1] {
                self.send(&Outgoing::Ice {
                    candidate: candidate.clone(),
                    m_line_index: index,
                })
                .await?;
            }
            Ok(())
        } else {
            self.send(&Outgoing::Ice {
                candidate,
                m_line_index,
            })
            .await
        }
    }

    async fn send(&mut self, message: &Outgoing) -> Result<()> {
        if self.ended {
            return Err(Error::Closed);
        }
        let text = self
            .config
            .variant
            .frame(self.config.device_id, &self.dialog_id, message)?;
        trace!(method = message.method(), "sending signaling message");
        self.ws.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    /// Terminal transition; idempotent from every trigger path
    fn finish(&mut self, reason: Option<CloseReason>) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.set_state(CallState::Ended);
        let _ = self.event_tx.send(SignalingEvent::Ended { reason });
    }

    fn set_state(&self, state: CallState) {
        // Transitions are one-directional; never move backwards
        if state > *self.state_tx.borrow() {
            let _ = self.state_tx.send(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    struct TestServer {
        endpoint: String,
        listener: TcpListener,
    }

    impl TestServer {
        async fn bind() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let endpoint = format!("ws://{}", listener.local_addr().unwrap());
            Self { endpoint, listener }
        }

        async fn accept(
            &self,
        ) -> WebSocketStream<TcpStream> {
            let (stream, _) = self.listener.accept().await.unwrap();
            accept_async(stream).await.unwrap()
        }
    }

    fn config(endpoint: &str, variant: ProtocolVariant) -> SignalingConfig {
        SignalingConfig {
            endpoint: endpoint.into(),
            device_id: 42,
            variant,
            auth_headers: vec![],
        }
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    async fn recv_event(
        rx: &mut mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn full_call_flow_reaches_activated() {
        init_tracing();
        let server = TestServer::bind().await;
        let endpoint = server.endpoint.clone();

        let server_task = tokio::spawn(async move {
            let mut ws = server.accept().await;
            let live_view = next_json(&mut ws).await;
            assert_eq!(live_view["method"], "live_view");
            assert_eq!(live_view["sdp"], "local-offer");

            ws.send(WsMessage::Text(
                r#"{"method":"session_created","session_id":"abc"}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(WsMessage::Text(
                r#"{"method":"sdp","session_id":"abc","type":"answer","sdp":"remote-answer"}"#
                    .into(),
            ))
            .await
            .unwrap();

            let activate = next_json(&mut ws).await;
            assert_eq!(activate["method"], "activate_session");
            let options = next_json(&mut ws).await;
            assert_eq!(options["method"], "stream_options");
            assert_eq!(options["audio_enabled"], true);
            assert_eq!(options["video_enabled"], true);
            ws
        });

        let (connection, mut events) = SignalingConnection::connect(
            config(&endpoint, ProtocolVariant::Flat),
            "local-offer".into(),
        )
        .await
        .unwrap();

        match recv_event(&mut events).await {
            SignalingEvent::Answer { sdp } => assert_eq!(sdp, "remote-answer"),
            other => panic!("expected answer, got {other:?}"),
        }
        match recv_event(&mut events).await {
            SignalingEvent::Activated => {}
            other => panic!("expected activation, got {other:?}"),
        }

        let mut state_rx = connection.state_receiver();
        state_rx
            .wait_for(|state| *state == CallState::Activated)
            .await
            .unwrap();

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn foreign_session_messages_are_discarded() {
        let server = TestServer::bind().await;
        let endpoint = server.endpoint.clone();

        let server_task = tokio::spawn(async move {
            let mut ws = server.accept().await;
            let _ = next_json(&mut ws).await; // live_view
            ws.send(WsMessage::Text(
                r#"{"method":"session_created","session_id":"abc"}"#.into(),
            ))
            .await
            .unwrap();
            // Answer for some other session must not reach the consumer
            ws.send(WsMessage::Text(
                r#"{"method":"sdp","session_id":"zzz","sdp":"wrong-answer"}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(WsMessage::Text(
                r#"{"method":"sdp","session_id":"abc","sdp":"right-answer"}"#.into(),
            ))
            .await
            .unwrap();
            // Drain activation
            let _ = next_json(&mut ws).await;
            let _ = next_json(&mut ws).await;
            ws
        });

        let (_connection, mut events) = SignalingConnection::connect(
            config(&endpoint, ProtocolVariant::Flat),
            "offer".into(),
        )
        .await
        .unwrap();

        match recv_event(&mut events).await {
            SignalingEvent::Answer { sdp } => assert_eq!(sdp, "right-answer"),
            other => panic!("expected answer, got {other:?}"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn activation_before_answer_collapses_to_one() {
        let server = TestServer::bind().await;
        let endpoint = server.endpoint.clone();

        let server_task = tokio::spawn(async move {
            let mut ws = server.accept().await;
            let _ = next_json(&mut ws).await; // live_view
            ws.send(WsMessage::Text(
                r#"{"method":"session_created","session_id":"abc"}"#.into(),
            ))
            .await
            .unwrap();
            // Let the activate commands land before the answer
            tokio::time::sleep(Duration::from_millis(100)).await;
            ws.send(WsMessage::Text(
                r#"{"method":"sdp","session_id":"abc","sdp":"answer"}"#.into(),
            ))
            .await
            .unwrap();

            let first = next_json(&mut ws).await;
            assert_eq!(first["method"], "activate_session");
            let second = next_json(&mut ws).await;
            assert_eq!(second["method"], "stream_options");
            // Anything further would be a duplicate activation
            let extra = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
            assert!(extra.is_err(), "unexpected extra message: {extra:?}");
            ws
        });

        let (connection, mut events) = SignalingConnection::connect(
            config(&endpoint, ProtocolVariant::Flat),
            "offer".into(),
        )
        .await
        .unwrap();
        connection.activate();
        connection.activate();

        loop {
            if matches!(recv_event(&mut events).await, SignalingEvent::Activated) {
                break;
            }
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn dialog_variant_duplicates_ice_candidates() {
        let server = TestServer::bind().await;
        let endpoint = server.endpoint.clone();

        let server_task = tokio::spawn(async move {
            let mut ws = server.accept().await;
            let live_view = next_json(&mut ws).await;
            assert_eq!(live_view["dialog_id"].as_str().is_some(), true);
            assert_eq!(live_view["body"]["sdp"], "offer");

            let first = next_json(&mut ws).await;
            assert_eq!(first["method"], "ice");
            assert_eq!(first["body"]["mlineindex"], 0);
            let second = next_json(&mut ws).await;
            assert_eq!(second["method"], "ice");
            assert_eq!(second["body"]["mlineindex"], 1);
            assert_eq!(second["body"]["ice"], first["body"]["ice"]);
            ws
        });

        let (connection, _events) = SignalingConnection::connect(
            config(&endpoint, ProtocolVariant::Dialog),
            "offer".into(),
        )
        .await
        .unwrap();
        connection.send_ice_candidate("candidate:1 1 udp 1 10.0.0.5 5004 typ host".into(), 0);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let server = TestServer::bind().await;
        let endpoint = server.endpoint.clone();

        let server_task = tokio::spawn(async move {
            let mut ws = server.accept().await;
            let _ = next_json(&mut ws).await; // live_view
            // Read until the socket closes; count close messages
            let mut closes = 0;
            while let Some(Ok(message)) = ws.next().await {
                if let WsMessage::Text(text) = message {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["method"] == "close" {
                        closes += 1;
                    }
                }
            }
            closes
        });

        let (connection, mut events) = SignalingConnection::connect(
            config(&endpoint, ProtocolVariant::Flat),
            "offer".into(),
        )
        .await
        .unwrap();
        connection.close();
        connection.close();

        let mut ended = 0;
        while let Some(event) = events.recv().await {
            if matches!(event, SignalingEvent::Ended { .. }) {
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
        assert_eq!(connection.state(), CallState::Ended);
        assert_eq!(server_task.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remote_close_ends_the_call() {
        let server = TestServer::bind().await;
        let endpoint = server.endpoint.clone();

        let server_task = tokio::spawn(async move {
            let mut ws = server.accept().await;
            let _ = next_json(&mut ws).await; // live_view
            ws.send(WsMessage::Text(
                r#"{"method":"close","reason":{"code":6,"text":"timeout"}}"#.into(),
            ))
            .await
            .unwrap();
            ws
        });

        let (_connection, mut events) = SignalingConnection::connect(
            config(&endpoint, ProtocolVariant::Flat),
            "offer".into(),
        )
        .await
        .unwrap();

        loop {
            match recv_event(&mut events).await {
                SignalingEvent::Ended { reason } => {
                    assert_eq!(reason.unwrap().code, CloseReason::TIMEOUT);
                    break;
                }
                _ => continue,
            }
        }
        server_task.await.unwrap();
    }
}
