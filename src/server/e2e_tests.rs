//! End-to-end tests driving a real server over loopback, with
//! tokio-tungstenite as the well-behaved client and raw sockets as the
//! hostile one.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hyper::Response;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AuthScheme, Credentials};
use crate::codes;
use crate::error::Error;
use crate::server::router::{Body, HttpRouter};
use crate::server::{ServerState, WsServer};
use crate::service::behavior::{Behavior, CloseArgs, SessionLink, WsData};
use crate::service::manager::ManagerState;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn connect(port: u16, path: &str) -> WebSocketStream<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let url = format!("ws://127.0.0.1:{}{}", port, path);
    let (ws, _) = tokio_tungstenite::client_async(url, stream).await.unwrap();
    ws
}

async fn wait_until(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Writes a raw request and returns whatever arrives within `window`.
async fn raw_exchange(port: u16, request: String, window: Duration) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn upgrade_request(port: u16, path: &str, extra_headers: &str) -> String {
    let key = crate::utils::base64_encode(&crate::utils::random_bytes(16));
    format!(
        "GET {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {key}\r\n{extra_headers}\r\n"
    )
}

#[derive(Clone, Default)]
struct CloseLog(Arc<StdMutex<Vec<CloseArgs>>>);

impl CloseLog {
    fn entries(&self) -> Vec<CloseArgs> {
        self.0.lock().unwrap().clone()
    }
}

/// Echoes text and binary back to the sender, recording its close.
struct Echo {
    log: CloseLog,
}

#[async_trait::async_trait]
impl Behavior for Echo {
    async fn on_message(&mut self, link: &SessionLink, data: WsData) -> anyhow::Result<()> {
        link.send(data)?;
        Ok(())
    }

    async fn on_close(&mut self, _link: &SessionLink, args: &CloseArgs) {
        self.log.0.lock().unwrap().push(args.clone());
    }
}

/// Relays every message to all sessions of the service.
struct Chat;

#[async_trait::async_trait]
impl Behavior for Chat {
    async fn on_message(&mut self, link: &SessionLink, data: WsData) -> anyhow::Result<()> {
        link.broadcast(data).await;
        Ok(())
    }
}

struct Idle;

impl Behavior for Idle {}

#[tokio::test]
async fn echo_round_trip_with_clean_close() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let log = CloseLog::default();
    let server = WsServer::builder()
        .port(port)
        .keep_clean(false)
        .build()
        .unwrap();
    {
        let log = log.clone();
        assert!(server.add_service("/echo", move || Echo { log: log.clone() }));
    }
    server.start().unwrap();

    let mut client = connect(port, "/echo").await;
    client.send(Message::Text("hello".into())).await.unwrap();
    match client.next().await {
        Some(Ok(Message::Text(text))) => assert_eq!(text, "hello"),
        other => panic!("expected echo, got {:?}", other),
    }

    client
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();
    while let Some(Ok(_)) = client.next().await {}

    let sessions = server.services().try_get("/echo").unwrap().sessions().clone();
    assert!(
        wait_until(|| sessions.is_empty(), Duration::from_secs(1)).await,
        "session must leave the manager after close"
    );
    let entries = log.entries();
    assert_eq!(entries.len(), 1, "on_close fires exactly once");
    assert_eq!(entries[0].code, codes::NORMAL);
    assert_eq!(entries[0].reason, "bye");
    assert!(entries[0].was_clean);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_session_including_sender() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let server = WsServer::builder()
        .port(port)
        .keep_clean(false)
        .build()
        .unwrap();
    assert!(server.add_service("/chat", || Chat));
    server.start().unwrap();

    let mut a = connect(port, "/chat").await;
    let mut b = connect(port, "/chat").await;
    let mut c = connect(port, "/chat").await;
    let sessions = server.services().try_get("/chat").unwrap().sessions().clone();
    assert!(wait_until(|| sessions.len() == 3, Duration::from_secs(1)).await);

    a.send(Message::Text("hi".into())).await.unwrap();
    for client in [&mut a, &mut b, &mut c] {
        match tokio::time::timeout(Duration::from_secs(2), client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => assert_eq!(text, "hi"),
            other => panic!("broadcast did not arrive: {:?}", other),
        }
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn broadcasts_keep_per_recipient_order() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let server = WsServer::builder()
        .port(port)
        .keep_clean(false)
        .build()
        .unwrap();
    assert!(server.add_service("/feed", || Idle));
    server.start().unwrap();

    let mut client = connect(port, "/feed").await;
    let sessions = server.services().try_get("/feed").unwrap().sessions().clone();
    assert!(wait_until(|| sessions.len() == 1, Duration::from_secs(1)).await);

    for i in 0..20 {
        sessions.broadcast(format!("msg-{}", i)).await;
    }
    for i in 0..20 {
        match tokio::time::timeout(Duration::from_secs(2), client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => assert_eq!(text, format!("msg-{}", i)),
            other => panic!("missing broadcast {}: {:?}", i, other),
        }
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unresponsive_session_swept_with_1006() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let log = CloseLog::default();
    let server = WsServer::builder()
        .port(port)
        .keep_clean(true)
        .wait_time(Duration::from_millis(100))
        .build()
        .unwrap();
    {
        let log = log.clone();
        assert!(server.add_service("/quiet", move || Echo { log: log.clone() }));
    }
    let sessions = server.services().try_get("/quiet").unwrap().sessions().clone();
    sessions.set_sweep_interval(Duration::from_millis(300));
    server.start().unwrap();

    // Hand-rolled handshake; this client never reads and never pongs.
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(upgrade_request(port, "/quiet", "").as_bytes())
        .await
        .unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "server hung up during handshake");
        buf.extend_from_slice(&chunk[..n]);
    }
    assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 101"));

    assert!(wait_until(|| sessions.len() == 1, Duration::from_secs(1)).await);
    assert!(
        wait_until(|| sessions.is_empty(), Duration::from_secs(5)).await,
        "sweeper must remove the dead session"
    );
    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].code, codes::ABNORMAL);
    assert!(!entries[0].was_clean);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_every_session_and_blocks_restart() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let server = WsServer::builder()
        .port(port)
        .keep_clean(false)
        .wait_time(Duration::from_millis(100))
        .build()
        .unwrap();
    assert!(server.add_service("/hub", || Idle));
    server.start().unwrap();
    // double start is a no-op
    server.start().unwrap();
    assert_eq!(server.state(), ServerState::Start);

    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(connect(port, "/hub").await);
    }
    let sessions = server.services().try_get("/hub").unwrap().sessions().clone();
    assert!(wait_until(|| sessions.len() == 10, Duration::from_secs(2)).await);

    server.stop_with(codes::GOING_AWAY, "going away").await.unwrap();
    assert_eq!(server.state(), ServerState::Stop);
    assert_eq!(sessions.state(), ManagerState::Stop);
    assert_eq!(sessions.len(), 0);

    for mut client in clients {
        let mut saw_close = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(2), client.next()).await {
                Ok(Some(Ok(Message::Close(Some(frame))))) => {
                    assert_eq!(u16::from(frame.code), codes::GOING_AWAY);
                    assert_eq!(frame.reason, "going away");
                    saw_close = true;
                    break;
                }
                Ok(Some(Ok(_))) => continue,
                _ => break,
            }
        }
        assert!(saw_close, "every client receives the close frame");
    }

    // A stopped server does not restart, and stopping again is a no-op.
    server.start().unwrap();
    assert_eq!(server.state(), ServerState::Stop);
    assert!(!server.is_listening());
    server.stop().await.unwrap();
    assert!(
        TcpStream::connect(("127.0.0.1", port)).await.is_err(),
        "listener must be gone"
    );
}

#[tokio::test]
async fn secure_without_certificate_refuses_start() {
    let server = WsServer::builder()
        .port(free_port())
        .secure(true)
        .build()
        .unwrap();
    match server.start() {
        Err(Error::Config(_)) => {}
        other => panic!("expected a config error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(server.state(), ServerState::Ready, "failed start leaves Ready");
}

#[tokio::test]
async fn forwarded_upgrade_rejected_with_400() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let server = WsServer::builder()
        .port(port)
        .keep_clean(false)
        .build()
        .unwrap();
    assert!(server.add_service("/svc", || Idle));
    server.start().unwrap();

    let key = crate::utils::base64_encode(&crate::utils::random_bytes(16));
    let request = format!(
        "GET /svc HTTP/1.1\r\nHost: other.example:9999\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {key}\r\n\r\n"
    );
    let response = raw_exchange(port, request, Duration::from_millis(700)).await;
    assert!(
        response.starts_with("HTTP/1.1 400"),
        "got: {}",
        response.lines().next().unwrap_or("")
    );
    let sessions = server.services().try_get("/svc").unwrap().sessions().clone();
    assert!(sessions.is_empty(), "no session may be created");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_path_answers_501() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let server = WsServer::builder()
        .port(port)
        .keep_clean(false)
        .build()
        .unwrap();
    assert!(server.add_service("/known", || Idle));
    server.start().unwrap();

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let url = format!("ws://127.0.0.1:{}/nope", port);
    match tokio_tungstenite::client_async(url, stream).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 501)
        }
        other => panic!("expected 501, got {:?}", other.map(|_| ())),
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn basic_auth_gate_challenges_then_admits() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let server = WsServer::builder()
        .port(port)
        .keep_clean(false)
        .auth_scheme(AuthScheme::Basic)
        .credential_finder(|user| {
            (user == "alice").then(|| Credentials::new("alice", "open sesame"))
        })
        .build()
        .unwrap();
    assert!(server.add_service("/echo", || Idle));
    server.start().unwrap();

    // No credentials: challenged and turned away.
    let response = raw_exchange(
        port,
        upgrade_request(port, "/echo", ""),
        Duration::from_millis(700),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 401"));
    assert!(response.contains("WWW-Authenticate: Basic realm=\"SECRET AREA\""));

    // Good credentials: the handshake completes.
    let auth = crate::auth::basic_authorization(&Credentials::new("alice", "open sesame"));
    let response = raw_exchange(
        port,
        upgrade_request(port, "/echo", &format!("Authorization: {}\r\n", auth)),
        Duration::from_millis(700),
    )
    .await;
    assert!(
        response.starts_with("HTTP/1.1 101"),
        "got: {}",
        response.lines().next().unwrap_or("")
    );

    // Wrong credentials: forbidden.
    let bad = crate::auth::basic_authorization(&Credentials::new("alice", "guessed"));
    let response = raw_exchange(
        port,
        upgrade_request(port, "/echo", &format!("Authorization: {}\r\n", bad)),
        Duration::from_millis(700),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 403"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn http_mode_dispatches_by_method() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let log = CloseLog::default();
    let router = HttpRouter::new()
        .on_get(|_ctx| async { Ok(Response::new(Body::from("pong"))) });
    let server = WsServer::builder()
        .port(port)
        .keep_clean(false)
        .router(router)
        .build()
        .unwrap();
    {
        let log = log.clone();
        assert!(server.add_service("/echo", move || Echo { log: log.clone() }));
    }
    server.start().unwrap();

    let response = raw_exchange(
        port,
        format!("GET /info HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n"),
        Duration::from_millis(700),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("pong"));

    let response = raw_exchange(
        port,
        format!("DELETE /info HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n"),
        Duration::from_millis(700),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 501"));

    // Upgrade paths are still honored in HTTP mode.
    let mut client = connect(port, "/echo").await;
    client.send(Message::Text("ws".into())).await.unwrap();
    match client.next().await {
        Some(Ok(Message::Text(text))) => assert_eq!(text, "ws"),
        other => panic!("expected echo, got {:?}", other),
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn mutators_and_stop_codes_validated_while_running() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let server = WsServer::builder()
        .port(port)
        .keep_clean(false)
        .build()
        .unwrap();
    server.start().unwrap();

    // Mutators after start are logged no-ops.
    server.set_realm("changed");
    assert_eq!(server.realm(), crate::auth::DEFAULT_REALM);
    assert!(!server.add_service("/late", || Idle));

    // Stop-code validation fires before any state change.
    assert!(matches!(
        server.stop_with(codes::MANDATORY_EXTENSION, "x").await,
        Err(Error::Config(_))
    ));
    assert!(matches!(
        server.stop_with(codes::NO_STATUS, "nonempty").await,
        Err(Error::Config(_))
    ));
    let long_reason = "r".repeat(codes::MAX_CLOSE_REASON + 1);
    assert!(matches!(
        server.stop_with(codes::NORMAL, &long_reason).await,
        Err(Error::Config(_))
    ));
    assert_eq!(server.state(), ServerState::Start);

    server.stop().await.unwrap();
    assert_eq!(server.state(), ServerState::Stop);
}

#[tokio::test]
async fn remove_service_while_running_closes_with_1001() {
    let _ = pretty_env_logger::try_init();
    let port = free_port();
    let server = WsServer::builder()
        .port(port)
        .keep_clean(false)
        .wait_time(Duration::from_millis(100))
        .build()
        .unwrap();
    assert!(server.add_service("/gone", || Idle));
    server.start().unwrap();

    let mut client = connect(port, "/gone").await;
    let sessions = server.services().try_get("/gone").unwrap().sessions().clone();
    assert!(wait_until(|| sessions.len() == 1, Duration::from_secs(1)).await);

    assert!(server.remove_service("/gone").await);
    assert!(server.services().try_get("/gone").is_none());

    let mut saw_close = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(2), client.next()).await {
            Ok(Some(Ok(Message::Close(Some(frame))))) => {
                assert_eq!(u16::from(frame.code), codes::GOING_AWAY);
                saw_close = true;
                break;
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
    assert!(saw_close);

    server.stop().await.unwrap();
}
