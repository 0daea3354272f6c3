//! STUN NAT keepalive agent
//!
//! Keeps the NAT binding for a media socket alive for the duration of a
//! call. With ICE short-term credentials available it sends
//! integrity-protected binding requests and watches for responses; without
//! them it falls back to fire-and-forget requests aimed at both the RTP
//! and RTCP remote ports, where no response is expected at all.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::stun;

/// Default spacing between keepalive requests
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);
/// How long to wait for a response in credentialed mode
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Username/password pair for integrity-protected keepalives
#[derive(Debug, Clone)]
pub struct StunCredentials {
    /// Joined `remote-ufrag:local-ufrag`
    pub username: String,
    /// Remote ice-pwd
    pub password: String,
}

/// Handle to a running keepalive task. Dropping the handle stops the task.
pub struct StunKeepalive {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl StunKeepalive {
    /// Start a keepalive over `socket` toward the remote RTP port, and the
    /// RTCP port when one exists.
    ///
    /// In credentialed mode the caller must feed inbound STUN datagrams
    /// (as classified by [`crate::packet::classify`]) through `stun_rx`
    /// so responses can be matched to outstanding transactions.
    pub fn spawn(
        socket: Arc<UdpSocket>,
        rtp_addr: SocketAddr,
        rtcp_addr: Option<SocketAddr>,
        credentials: Option<StunCredentials>,
        stun_rx: Option<mpsc::Receiver<Vec<u8>>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            match (credentials, stun_rx) {
                (Some(creds), Some(rx)) => {
                    run_credentialed(socket, rtp_addr, creds, rx, shutdown_rx).await
                }
                _ => run_fire_and_forget(socket, rtp_addr, rtcp_addr, shutdown_rx).await,
            }
        });
        Self {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Stop the keepalive. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for StunKeepalive {
    fn drop(&mut self) {
        self.stop();
        self.task.abort();
    }
}

async fn run_fire_and_forget(
    socket: Arc<UdpSocket>,
    rtp_addr: SocketAddr,
    rtcp_addr: Option<SocketAddr>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
    debug!(%rtp_addr, ?rtcp_addr, "starting fire-and-forget STUN keepalive");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for addr in [Some(rtp_addr), rtcp_addr].into_iter().flatten() {
                    let request = stun::binding_request(&stun::TransactionId::random());
                    if let Err(e) = socket.send_to(&request, addr).await {
                        // Best effort; the call ends through the transport
                        // state, not through keepalive failures.
                        debug!(%addr, error = %e, "STUN keepalive send failed");
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }
    trace!("STUN keepalive stopped");
}

async fn run_credentialed(
    socket: Arc<UdpSocket>,
    rtp_addr: SocketAddr,
    credentials: StunCredentials,
    mut stun_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
    debug!(%rtp_addr, "starting credentialed STUN keepalive");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let tid = stun::TransactionId::random();
                let request = match stun::binding_request_with_integrity(
                    &tid,
                    &credentials.username,
                    &credentials.password,
                ) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "could not build STUN request");
                        continue;
                    }
                };
                if let Err(e) = socket.send_to(&request, rtp_addr).await {
                    debug!(error = %e, "STUN keepalive send failed");
                    continue;
                }
                if !await_response(&mut stun_rx, &tid).await {
                    warn!("no STUN response within timeout");
                }
            }
            _ = &mut shutdown => break,
        }
    }
    trace!("STUN keepalive stopped");
}

async fn await_response(rx: &mut mpsc::Receiver<Vec<u8>>, tid: &stun::TransactionId) -> bool {
    let deadline = tokio::time::sleep(RESPONSE_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            packet = rx.recv() => match packet {
                Some(buf) => {
                    if let Ok(message) = stun::parse(&buf) {
                        if message.is_binding_success() && message.transaction_id == *tid {
                            return true;
                        }
                    }
                    // Stray transaction, keep waiting
                }
                None => return false,
            },
            _ = &mut deadline => return false,
        }
    }
}
