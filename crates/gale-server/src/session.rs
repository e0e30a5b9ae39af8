//! Server-side control session.
//!
//! One session per connected tunnel client. The session owns exactly one
//! control socket: a dedicated reader task feeds decoded frames into the
//! serving loop, and all writes go through that loop so the socket has a
//! single producer. Front-end handlers interact with the session only via
//! [`SessionHandle::forward`], which correlates a pending slot with the
//! eventual RESPONSE frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gale_core::config::ServerConfig;
use gale_proto::codec::ProtoError;
use gale_proto::frame::now_ms;
use gale_proto::subdomain;
use gale_proto::{
    Close, ErrorFrame, Frame, FramedStream, Headers, HeartbeatAck, Register, RegisterAck,
    RegisterNack, RequestEnvelope, ResponseEnvelope, PROTOCOL_VERSION,
};

use crate::registry::TunnelRegistry;

/// Queue depth of the per-session outbound frame channel.
const OUTBOUND_QUEUE: usize = 64;

/// Per-session traffic counters, updated by the session loop and read by the
/// status page.
#[derive(Debug, Default)]
pub struct Counters {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub requests: AtomicU64,
    pub errors: AtomicU64,
}

/// Snapshot of one registered tunnel for the status page.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub subdomain: String,
    pub client_id: String,
    pub peer_addr: SocketAddr,
    pub age: Duration,
    pub since_heartbeat: Duration,
    pub requests: u64,
    pub errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Why a forwarded request did not produce a tunneled response.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("tunnel session closed")]
    SessionClosed,

    #[error("tunnel response timed out")]
    Timeout,
}

/// Shared handle to a live control session. Held by the registry and by
/// front-end handlers while a request is in flight.
pub struct SessionHandle {
    pub subdomain: String,
    pub client_id: String,
    pub peer_addr: SocketAddr,
    pub tls: bool,
    pub counters: Counters,
    registered_at: Instant,
    last_heartbeat_ms: AtomicU64,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<ResponseEnvelope>>>,
    frame_tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
}

impl SessionHandle {
    pub fn new(
        subdomain: String,
        peer_addr: SocketAddr,
        tls: bool,
        frame_tx: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            subdomain,
            client_id: Uuid::new_v4().to_string(),
            peer_addr,
            tls,
            counters: Counters::default(),
            registered_at: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(now_ms()),
            next_request_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            frame_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Time since this session registered.
    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Record a heartbeat. `fetch_max` keeps the timestamp monotone even if
    /// echoes race with the status page.
    pub fn touch_heartbeat(&self) {
        self.last_heartbeat_ms.fetch_max(now_ms(), Ordering::Relaxed);
    }

    /// Relay one HTTP request through the tunnel and wait for its response.
    ///
    /// A timeout clears only this request's pending slot; a late response
    /// arriving afterwards is dropped silently by the session loop.
    pub async fn forward(
        &self,
        method: String,
        path: String,
        headers: Headers,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, ForwardError> {
        if self.is_closed() {
            return Err(ForwardError::SessionClosed);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let frame = Frame::Request(RequestEnvelope {
            request_id,
            method,
            path,
            headers,
            body,
        });
        // Bounded submission: a session stalled on a dead peer must not
        // wedge front-end handlers in the queue.
        match self.frame_tx.send_timeout(frame, timeout).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.pending.lock().await.remove(&request_id);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(ForwardError::Timeout);
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.pending.lock().await.remove(&request_id);
                return Err(ForwardError::SessionClosed);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Pending slots are dropped wholesale when the session closes.
            Ok(Err(_)) => Err(ForwardError::SessionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(ForwardError::Timeout)
            }
        }
    }

    /// Deliver a RESPONSE frame to its pending slot. Returns false when no
    /// slot is waiting (timed out or never existed).
    pub async fn resolve_pending(&self, response: ResponseEnvelope) -> bool {
        if let Some(tx) = self.pending.lock().await.remove(&response.request_id) {
            tx.send(response).is_ok()
        } else {
            false
        }
    }

    /// Drop every pending slot, waking all waiters with a terminal error.
    pub async fn fail_all_pending(&self) {
        let dropped = {
            let mut pending = self.pending.lock().await;
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            debug!(
                subdomain = %self.subdomain,
                dropped,
                "Failed pending requests on session close"
            );
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn info(&self) -> TunnelInfo {
        let last_hb = self.last_heartbeat_ms.load(Ordering::Relaxed);
        TunnelInfo {
            subdomain: self.subdomain.clone(),
            client_id: self.client_id.clone(),
            peer_addr: self.peer_addr,
            age: self.age(),
            since_heartbeat: Duration::from_millis(now_ms().saturating_sub(last_hb)),
            requests: self.counters.requests.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
        }
    }
}

enum ReaderEvent {
    Frame(Frame),
    Eof,
    Failed(ProtoError),
}

/// Drive one accepted control connection from handshake to teardown.
pub async fn handle_connection<S>(
    stream: S,
    peer_addr: SocketAddr,
    tls: bool,
    registry: TunnelRegistry,
    config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = FramedStream::new(stream);

    // Awaiting-Registration: the first frame must be REGISTER.
    let register = match tokio::time::timeout(config.handshake_timeout(), framed.recv()).await {
        Ok(Ok(Some(Frame::Register(register)))) => register,
        Ok(Ok(Some(other))) => {
            warn!(peer = %peer_addr, frame = ?other.frame_type(), "First frame was not REGISTER");
            let _ = framed
                .send(&Frame::Error(ErrorFrame {
                    message: format!(
                        "expected REGISTER, got {:?}",
                        other.frame_type()
                    ),
                    request_id: None,
                }))
                .await;
            return;
        }
        Ok(Ok(None)) => {
            debug!(peer = %peer_addr, "Connection closed before registration");
            return;
        }
        Ok(Err(e)) => {
            warn!(peer = %peer_addr, error = %e, "Framing error before registration");
            return;
        }
        Err(_) => {
            warn!(peer = %peer_addr, "Registration handshake timed out");
            return;
        }
    };

    if let Some(nack) = validate_register(&register) {
        warn!(
            peer = %peer_addr,
            subdomain = %register.subdomain,
            reason = %nack,
            "Rejected registration"
        );
        let _ = framed
            .send(&Frame::RegisterNack(RegisterNack { reason: nack }))
            .await;
        return;
    }
    // validate_register ensured this succeeds.
    let Ok(label) = subdomain::normalize(&register.subdomain) else {
        return;
    };

    let (frame_tx, frame_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let session = Arc::new(SessionHandle::new(label.clone(), peer_addr, tls, frame_tx));

    if let Err(conflict) = registry.register(&label, Arc::clone(&session)).await {
        warn!(
            subdomain = %label,
            peer = %peer_addr,
            existing_age_secs = conflict.existing_age.as_secs(),
            "Rejected registration: subdomain already taken"
        );
        let _ = framed
            .send(&Frame::RegisterNack(RegisterNack {
                reason: "conflict".into(),
            }))
            .await;
        return;
    }

    let ack = Frame::RegisterAck(RegisterAck {
        client_id: session.client_id.clone(),
        server_time_ms: now_ms(),
        protocol_version: PROTOCOL_VERSION,
    });
    if let Err(e) = framed.send(&ack).await {
        warn!(subdomain = %label, peer = %peer_addr, error = %e, "Failed to ack registration");
        registry.unregister(&label, &session.client_id).await;
        return;
    }
    info!(
        subdomain = %label,
        client_id = %session.client_id,
        peer = %peer_addr,
        tls,
        "Tunnel registered"
    );

    let reason = serve(framed, &session, frame_rx, &config, &mut shutdown).await;

    // Unregister before failing pending slots so no new request can land on
    // a session that is about to drop them.
    session.mark_closed();
    registry.unregister(&label, &session.client_id).await;
    session.fail_all_pending().await;
    info!(
        subdomain = %label,
        client_id = %session.client_id,
        reason = %reason,
        "Tunnel closed"
    );
}

/// Registered-state loop. Returns a short close reason for logging.
async fn serve<S>(
    framed: FramedStream<S>,
    session: &Arc<SessionHandle>,
    mut frame_rx: mpsc::Receiver<Frame>,
    config: &ServerConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> String
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = framed.into_split();
    let (event_tx, mut event_rx) = mpsc::channel(16);

    let reader_session = Arc::clone(session);
    let reader_task = tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(Some(frame)) => {
                    reader_session
                        .counters
                        .bytes_in
                        .store(reader.bytes_read(), Ordering::Relaxed);
                    if event_tx.send(ReaderEvent::Frame(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = event_tx.send(ReaderEvent::Eof).await;
                    break;
                }
                Err(e) => {
                    let _ = event_tx.send(ReaderEvent::Failed(e)).await;
                    break;
                }
            }
        }
    });

    let heartbeat_timeout = config.heartbeat_timeout();
    let mut deadline = tokio::time::Instant::now() + heartbeat_timeout;

    let reason = loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(ReaderEvent::Frame(frame)) => {
                    deadline = tokio::time::Instant::now() + heartbeat_timeout;
                    match frame {
                        Frame::Heartbeat(heartbeat) => {
                            session.touch_heartbeat();
                            let ack = Frame::HeartbeatAck(HeartbeatAck {
                                nonce: heartbeat.nonce,
                                server_time_ms: now_ms(),
                            });
                            if writer.send(&ack).await.is_err() {
                                break "write-failed".to_string();
                            }
                            session.counters.bytes_out.store(writer.bytes_written(), Ordering::Relaxed);
                        }
                        Frame::Response(response) => {
                            let request_id = response.request_id;
                            if !session.resolve_pending(response).await {
                                debug!(
                                    subdomain = %session.subdomain,
                                    request_id,
                                    "Dropping response with no pending slot"
                                );
                            }
                        }
                        Frame::Close(close) => {
                            break format!(
                                "client-close: {}",
                                close.reason.as_deref().unwrap_or("unspecified")
                            );
                        }
                        Frame::Error(error) => {
                            session.counters.errors.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                subdomain = %session.subdomain,
                                message = %error.message,
                                "Client reported error"
                            );
                        }
                        other => {
                            let _ = writer
                                .send(&Frame::Error(ErrorFrame {
                                    message: format!(
                                        "unexpected {:?} frame in registered state",
                                        other.frame_type()
                                    ),
                                    request_id: None,
                                }))
                                .await;
                            break "protocol-error".to_string();
                        }
                    }
                }
                Some(ReaderEvent::Eof) => break "peer-disconnected".to_string(),
                Some(ReaderEvent::Failed(e)) => {
                    warn!(subdomain = %session.subdomain, error = %e, "Session read failed");
                    // Best effort: tell the client why before dropping it.
                    let _ = writer
                        .send(&Frame::Error(ErrorFrame {
                            message: e.to_string(),
                            request_id: None,
                        }))
                        .await;
                    break "framing-error".to_string();
                }
                None => break "reader-stopped".to_string(),
            },
            outbound = frame_rx.recv() => {
                // The handle in the registry keeps a sender alive, so recv
                // only yields Some while the session is up.
                if let Some(frame) = outbound {
                    if writer.send(&frame).await.is_err() {
                        break "write-failed".to_string();
                    }
                    session.counters.bytes_out.store(writer.bytes_written(), Ordering::Relaxed);
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = writer
                    .send(&Frame::Close(Close {
                        reason: Some("heartbeat-timeout".into()),
                    }))
                    .await;
                break "heartbeat-timeout".to_string();
            }
            _ = shutdown.changed() => {
                let _ = writer
                    .send(&Frame::Close(Close {
                        reason: Some("server-shutdown".into()),
                    }))
                    .await;
                break "server-shutdown".to_string();
            }
        }
    };

    reader_task.abort();
    reason
}

/// Returns a NACK reason when the REGISTER frame is unacceptable.
fn validate_register(register: &Register) -> Option<String> {
    if register.protocol_version != PROTOCOL_VERSION {
        return Some("version".to_string());
    }
    if let Err(e) = subdomain::normalize(&register.subdomain) {
        return Some(format!("invalid-subdomain: {e}"));
    }
    None
}
