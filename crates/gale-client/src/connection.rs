//! Durable connection manager.
//!
//! Dials the server, registers the subdomain, and services relayed requests
//! until the connection drops, then reconnects with the shared backoff
//! policy. One serving loop owns all writes to the control socket; a
//! dedicated reader task feeds it decoded frames; origin round-trips run in
//! a bounded worker pool and push their responses through a queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use gale_core::config::ClientConfig;
use gale_core::BackoffPolicy;
use gale_proto::codec::ProtoError;
use gale_proto::frame::now_ms;
use gale_proto::{
    Close, Frame, FramedStream, Headers, Heartbeat, HeartbeatAck, Register, RegisterAck,
    RequestEnvelope, ResponseEnvelope, PROTOCOL_VERSION,
};

use crate::error::TunnelClientError;
use crate::forwarder::LocalForwarder;
use crate::tls;

/// A session must stay in serving this long before the backoff counters
/// reset.
const STABLE_SERVING: Duration = Duration::from_secs(60);

/// Dial timeout for the TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period for flushing in-flight responses on shutdown.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type BoxedIo = Box<dyn Io>;

enum ReaderEvent {
    Frame(Frame),
    Eof,
    Failed(ProtoError),
}

enum SessionEnd {
    /// Graceful termination; the manager exits.
    Shutdown,
    /// Anything else; the manager reconnects.
    Disconnected {
        served: Duration,
        error: Option<TunnelClientError>,
    },
}

enum ServeEnd {
    Shutdown,
    Closed(Option<TunnelClientError>),
}

/// Maintains the persistent control connection to the server.
pub struct ConnectionManager {
    config: ClientConfig,
    subdomain: String,
    forwarder: Arc<LocalForwarder>,
    backoff: BackoffPolicy,
}

impl ConnectionManager {
    /// `subdomain` must already be normalized (lowercase DNS label).
    pub fn new(config: ClientConfig, subdomain: String) -> Result<Self, TunnelClientError> {
        let forwarder = Arc::new(LocalForwarder::new(
            &config.local_host,
            config.local_port,
            config.request_timeout(),
        )?);
        Ok(Self {
            config,
            subdomain,
            forwarder,
            backoff: BackoffPolicy::new(),
        })
    }

    /// Run with automatic reconnection until the shutdown signal fires.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                info!("Tunnel client shutting down");
                return;
            }

            match self.connect_and_serve(&mut shutdown).await {
                SessionEnd::Shutdown => {
                    info!("Tunnel client shut down cleanly");
                    return;
                }
                SessionEnd::Disconnected { served, error } => {
                    if served >= STABLE_SERVING {
                        self.backoff.reset();
                        self.backoff.record_success();
                    } else {
                        self.backoff.record_failure();
                    }
                    if let Some(e) = &error {
                        warn!(error = %e, served_secs = served.as_secs(), "Tunnel disconnected");
                    } else {
                        info!(served_secs = served.as_secs(), "Tunnel disconnected");
                    }

                    let delay = self.backoff.next_delay();
                    if !delay.is_zero() {
                        warn!(
                            delay_secs = delay.as_secs(),
                            consecutive_failures = self.backoff.consecutive_failures(),
                            "Reconnecting after delay"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {
                                info!("Tunnel client shutting down during reconnect wait");
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_serve(&self, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                return SessionEnd::Disconnected {
                    served: Duration::ZERO,
                    error: Some(e),
                }
            }
        };
        let mut framed = FramedStream::new(stream);

        if let Err(e) = self.register(&mut framed).await {
            return SessionEnd::Disconnected {
                served: Duration::ZERO,
                error: Some(e),
            };
        }

        let serving_started = Instant::now();
        match self.serve(framed, shutdown).await {
            ServeEnd::Shutdown => SessionEnd::Shutdown,
            ServeEnd::Closed(error) => SessionEnd::Disconnected {
                served: serving_started.elapsed(),
                error,
            },
        }
    }

    async fn connect(&self) -> Result<BoxedIo, TunnelClientError> {
        let addr = format!("{}:{}", self.config.server_host, self.config.server_port);
        info!(addr = %addr, tls = self.config.use_ssl, "Connecting to server");

        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| TunnelClientError::Connection(format!("connect to {addr} timed out")))?
            .map_err(|e| TunnelClientError::Connection(format!("connect to {addr}: {e}")))?;

        if !self.config.use_ssl {
            return Ok(Box::new(tcp));
        }

        let connector = tls::connector(self.config.insecure);
        let server_name = tls::server_name(&self.config.server_host)?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TunnelClientError::Connection(format!("TLS handshake: {e}")))?;
        Ok(Box::new(stream))
    }

    async fn register(
        &self,
        framed: &mut FramedStream<BoxedIo>,
    ) -> Result<(), TunnelClientError> {
        framed
            .send(&Frame::Register(Register {
                subdomain: self.subdomain.clone(),
                protocol_version: PROTOCOL_VERSION,
            }))
            .await
            .map_err(|e| TunnelClientError::Connection(format!("send REGISTER: {e}")))?;

        let ack: RegisterAck =
            match tokio::time::timeout(self.config.register_timeout(), framed.recv()).await {
                Ok(Ok(Some(Frame::RegisterAck(ack)))) => ack,
                Ok(Ok(Some(Frame::RegisterNack(nack)))) => {
                    if nack.reason == "conflict" {
                        error!(
                            subdomain = %self.subdomain,
                            "Subdomain is already registered by another client"
                        );
                    }
                    return Err(TunnelClientError::Registration(nack.reason));
                }
                Ok(Ok(Some(other))) => {
                    return Err(TunnelClientError::Registration(format!(
                        "unexpected {:?} frame instead of REGISTER_ACK",
                        other.frame_type()
                    )));
                }
                Ok(Ok(None)) => {
                    return Err(TunnelClientError::Connection(
                        "server closed during registration".into(),
                    ));
                }
                Ok(Err(e)) => return Err(TunnelClientError::Stream(e.to_string())),
                Err(_) => {
                    return Err(TunnelClientError::Registration(
                        "timed out waiting for REGISTER_ACK".into(),
                    ));
                }
            };

        info!(
            subdomain = %self.subdomain,
            client_id = %ack.client_id,
            "Tunnel registered"
        );
        Ok(())
    }

    async fn serve(
        &self,
        framed: FramedStream<BoxedIo>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ServeEnd {
        let (mut reader, mut writer) = framed.into_split();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(Some(frame)) => {
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

        let limit = self.config.in_flight_limit.max(1);
        let limiter = Arc::new(Semaphore::new(limit));
        let (response_tx, mut response_rx) = mpsc::channel::<Frame>(limit);

        let mut heartbeat_timer = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat_timer.tick().await; // Skip first immediate tick
        let mut nonce: u64 = 0;
        let mut last_ack = Instant::now();

        let end = loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(ReaderEvent::Frame(frame)) => match frame {
                        Frame::Request(request) => {
                            self.dispatch(request, &limiter, &response_tx);
                        }
                        Frame::HeartbeatAck(ack) => {
                            last_ack = Instant::now();
                            debug!(nonce = ack.nonce, "Heartbeat acknowledged");
                        }
                        Frame::Heartbeat(heartbeat) => {
                            // Server-initiated liveness probe; echo it.
                            let ack = Frame::HeartbeatAck(HeartbeatAck {
                                nonce: heartbeat.nonce,
                                server_time_ms: now_ms(),
                            });
                            if writer.send(&ack).await.is_err() {
                                break ServeEnd::Closed(Some(TunnelClientError::Connection(
                                    "write failed".into(),
                                )));
                            }
                        }
                        Frame::Close(close) => {
                            info!(reason = ?close.reason, "Server closed the tunnel");
                            break ServeEnd::Closed(None);
                        }
                        Frame::Error(error) => {
                            warn!(message = %error.message, "Server reported error");
                        }
                        other => {
                            warn!(frame = ?other.frame_type(), "Ignoring unexpected frame");
                        }
                    },
                    Some(ReaderEvent::Eof) => {
                        break ServeEnd::Closed(Some(TunnelClientError::Connection(
                            "server closed the connection".into(),
                        )));
                    }
                    Some(ReaderEvent::Failed(e)) => {
                        break ServeEnd::Closed(Some(TunnelClientError::Stream(e.to_string())));
                    }
                    None => {
                        break ServeEnd::Closed(Some(TunnelClientError::Connection(
                            "reader stopped".into(),
                        )));
                    }
                },
                response = response_rx.recv() => {
                    if let Some(frame) = response {
                        if writer.send(&frame).await.is_err() {
                            break ServeEnd::Closed(Some(TunnelClientError::Connection(
                                "write failed".into(),
                            )));
                        }
                    }
                }
                _ = heartbeat_timer.tick() => {
                    if last_ack.elapsed() >= self.config.heartbeat_timeout() {
                        break ServeEnd::Closed(Some(TunnelClientError::HeartbeatTimeout));
                    }
                    nonce += 1;
                    let heartbeat = Frame::Heartbeat(Heartbeat {
                        nonce,
                        timestamp_ms: now_ms(),
                    });
                    if writer.send(&heartbeat).await.is_err() {
                        break ServeEnd::Closed(Some(TunnelClientError::Connection(
                            "write failed".into(),
                        )));
                    }
                }
                _ = shutdown.changed() => {
                    info!("Shutting down, closing tunnel");
                    let _ = writer
                        .send(&Frame::Close(Close {
                            reason: Some("client-shutdown".into()),
                        }))
                        .await;

                    // Flush whatever in-flight responses make it in time.
                    let flush_deadline = tokio::time::sleep(SHUTDOWN_FLUSH);
                    tokio::pin!(flush_deadline);
                    loop {
                        tokio::select! {
                            _ = &mut flush_deadline => break,
                            response = response_rx.recv() => match response {
                                Some(frame) => {
                                    if writer.send(&frame).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                    break ServeEnd::Shutdown;
                }
            }
        };

        reader_task.abort();
        end
    }

    /// Hand a relayed request to the bounded worker pool, or answer with a
    /// `client-overloaded` 502 when the pool is saturated.
    fn dispatch(
        &self,
        request: RequestEnvelope,
        limiter: &Arc<Semaphore>,
        response_tx: &mpsc::Sender<Frame>,
    ) {
        let request_id = request.request_id;
        match Arc::clone(limiter).try_acquire_owned() {
            Ok(permit) => {
                let forwarder = Arc::clone(&self.forwarder);
                let response_tx = response_tx.clone();
                tokio::spawn(async move {
                    let response = forwarder.forward(request).await;
                    let _ = response_tx.send(Frame::Response(response)).await;
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(request_id, "In-flight limit reached, rejecting request");
                let response = ResponseEnvelope {
                    request_id,
                    status: 502,
                    reason: Some("client-overloaded".into()),
                    headers: Headers::new(),
                    body: Vec::new(),
                };
                let response_tx = response_tx.clone();
                tokio::spawn(async move {
                    let _ = response_tx.send(Frame::Response(response)).await;
                });
            }
        }
    }
}
