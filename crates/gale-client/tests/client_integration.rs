//! Connection manager tests against a scripted in-process server and a raw
//! TCP origin stub.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use gale_client::ConnectionManager;
use gale_core::config::ClientConfig;
use gale_proto::{
    Frame, FramedStream, Headers, RegisterAck, RequestEnvelope, PROTOCOL_VERSION,
};

/// Minimal origin: answers every request with 200 "ok" after an optional
/// delay.
async fn spawn_origin(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                let mut total = 0;
                loop {
                    match socket.read(&mut buf[total..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            total += n;
                            if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                tokio::time::sleep(delay).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                    )
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

fn client_config(server: SocketAddr, origin: SocketAddr) -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.server_host = server.ip().to_string();
    cfg.server_port = server.port();
    cfg.local_host = origin.ip().to_string();
    cfg.local_port = origin.port();
    cfg.subdomain = Some("p".into());
    cfg.use_ssl = false;
    cfg.heartbeat_interval_secs = 1;
    cfg
}

/// Accept one control connection and complete the registration handshake.
async fn accept_and_ack(listener: &TcpListener) -> FramedStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = FramedStream::new(stream);
    match framed.recv().await.unwrap() {
        Some(Frame::Register(register)) => {
            assert_eq!(register.subdomain, "p");
            assert_eq!(register.protocol_version, PROTOCOL_VERSION);
        }
        other => panic!("expected REGISTER, got {other:?}"),
    }
    framed
        .send(&Frame::RegisterAck(RegisterAck {
            client_id: "test-client".into(),
            server_time_ms: 0,
            protocol_version: PROTOCOL_VERSION,
        }))
        .await
        .unwrap();
    framed
}

fn request(request_id: u64) -> Frame {
    Frame::Request(RequestEnvelope {
        request_id,
        method: "GET".into(),
        path: "/".into(),
        headers: Headers::new(),
        body: Vec::new(),
    })
}

#[tokio::test]
async fn registers_and_answers_relayed_requests() {
    let origin = spawn_origin(Duration::ZERO).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let mut manager = ConnectionManager::new(client_config(server_addr, origin), "p".into()).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move { manager.run(shutdown_rx).await });

    let mut framed = accept_and_ack(&listener).await;
    framed.send(&request(1)).await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match framed.recv().await.unwrap() {
                Some(Frame::Response(response)) => break response,
                Some(_) => continue,
                None => panic!("connection closed before response"),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(response.request_id, 1);
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"ok");
}

#[tokio::test]
async fn emits_heartbeats_on_the_configured_interval() {
    let origin = spawn_origin(Duration::ZERO).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let mut manager = ConnectionManager::new(client_config(server_addr, origin), "p".into()).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move { manager.run(shutdown_rx).await });

    let mut framed = accept_and_ack(&listener).await;
    let heartbeat = tokio::time::timeout(Duration::from_secs(4), async {
        loop {
            match framed.recv().await.unwrap() {
                Some(Frame::Heartbeat(heartbeat)) => break heartbeat,
                Some(_) => continue,
                None => panic!("connection closed before heartbeat"),
            }
        }
    })
    .await
    .expect("heartbeat within interval");
    assert!(heartbeat.nonce >= 1);
}

#[tokio::test]
async fn saturated_worker_pool_rejects_with_client_overloaded() {
    // Slow origin, room for exactly one in-flight request.
    let origin = spawn_origin(Duration::from_millis(500)).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let mut cfg = client_config(server_addr, origin);
    cfg.in_flight_limit = 1;

    let mut manager = ConnectionManager::new(cfg, "p".into()).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move { manager.run(shutdown_rx).await });

    let mut framed = accept_and_ack(&listener).await;
    framed.send(&request(1)).await.unwrap();
    framed.send(&request(2)).await.unwrap();

    let mut responses = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while responses.len() < 2 {
        let response = tokio::time::timeout_at(deadline, async {
            loop {
                match framed.recv().await.unwrap() {
                    Some(Frame::Response(response)) => break response,
                    Some(_) => continue,
                    None => panic!("connection closed early"),
                }
            }
        })
        .await
        .expect("both responses in time");
        responses.push(response);
    }

    let overloaded: Vec<_> = responses
        .iter()
        .filter(|r| r.reason.as_deref() == Some("client-overloaded"))
        .collect();
    assert_eq!(overloaded.len(), 1);
    assert_eq!(overloaded[0].status, 502);
    assert_eq!(overloaded[0].request_id, 2);

    let served: Vec<_> = responses.iter().filter(|r| r.status == 200).collect();
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].request_id, 1);
}

#[tokio::test]
async fn reconnects_after_server_drops_the_connection() {
    let origin = spawn_origin(Duration::ZERO).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let mut manager = ConnectionManager::new(client_config(server_addr, origin), "p".into()).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move { manager.run(shutdown_rx).await });

    // First connection: register, then drop it.
    let framed = accept_and_ack(&listener).await;
    drop(framed);

    // One failure puts the client in the first backoff tier (5 s).
    let reconnected = tokio::time::timeout(Duration::from_secs(10), accept_and_ack(&listener))
        .await
        .expect("client should reconnect within the first backoff tier");
    drop(reconnected);
}

#[tokio::test]
async fn graceful_shutdown_sends_close() {
    let origin = spawn_origin(Duration::ZERO).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let mut manager = ConnectionManager::new(client_config(server_addr, origin), "p".into()).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_task = tokio::spawn(async move { manager.run(shutdown_rx).await });

    let mut framed = accept_and_ack(&listener).await;
    shutdown_tx.send(true).unwrap();

    let close = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match framed.recv().await.unwrap() {
                Some(Frame::Close(close)) => break close,
                Some(_) => continue,
                None => panic!("connection closed without CLOSE frame"),
            }
        }
    })
    .await
    .expect("CLOSE frame on shutdown");
    assert_eq!(close.reason.as_deref(), Some("client-shutdown"));

    tokio::time::timeout(Duration::from_secs(5), run_task)
        .await
        .expect("run() returns after shutdown")
        .unwrap();
}

#[tokio::test]
async fn registration_nack_is_retried_not_fatal() {
    let origin = spawn_origin(Duration::ZERO).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let mut manager = ConnectionManager::new(client_config(server_addr, origin), "p".into()).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move { manager.run(shutdown_rx).await });

    // NACK the first attempt.
    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = FramedStream::new(stream);
    let Some(Frame::Register(_)) = framed.recv().await.unwrap() else {
        panic!("expected REGISTER");
    };
    framed
        .send(&Frame::RegisterNack(gale_proto::RegisterNack {
            reason: "conflict".into(),
        }))
        .await
        .unwrap();
    drop(framed);

    // The client comes back after the first backoff tier.
    let second = tokio::time::timeout(Duration::from_secs(10), accept_and_ack(&listener))
        .await
        .expect("client should retry after a NACK");
    drop(second);
}
