//! The listening server: lifecycle state machine, accept loop,
//! authentication gate, and dispatch to HTTP handlers or services.

pub mod builder;
pub mod router;
pub mod tls;

#[cfg(test)]
mod e2e_tests;

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, HOST, UPGRADE, WWW_AUTHENTICATE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use log::{debug, error, info, trace, warn};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::auth::{AuthGate, AuthOutcome, AuthScheme, CredentialFinder, Credentials};
use crate::codes;
use crate::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::server::builder::WsServerBuilder;
use crate::server::router::{Body, HttpContext, HttpRouter};
use crate::server::tls::TlsSettings;
use crate::service::behavior::{behavior_factory, Behavior};
use crate::service::registry::{normalize_path, ServiceRegistry};

/// How long `stop` waits for the accept loop before abandoning it; the
/// listener is already closed by then, so the loop exits on its own.
const ACCEPT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Ready = 0,
    Start = 1,
    ShuttingDown = 2,
    Stop = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Ready,
            1 => ServerState::Start,
            2 => ServerState::ShuttingDown,
            _ => ServerState::Stop,
        }
    }
}

struct Settings {
    realm: String,
    auth_scheme: AuthScheme,
    credential_finder: Option<CredentialFinder>,
    reuse_address: bool,
    allow_forwarded_request: bool,
    hostname: Option<String>,
}

/// Configuration snapshot taken at start; connection tasks read this,
/// never the live settings, so mid-run mutation cannot tear a request.
struct ActiveConfig {
    gate: AuthGate,
    allow_forwarded_request: bool,
    hostname: Option<String>,
    port: u16,
    secure: bool,
    router: Option<Arc<HttpRouter>>,
}

pub(crate) struct Inner {
    address: IpAddr,
    port: u16,
    secure: bool,
    state: AtomicU8,
    /// State transitions happen under this lock; reads are lock-free.
    transition: StdMutex<()>,
    services: ServiceRegistry,
    settings: StdMutex<Settings>,
    tls: StdMutex<TlsSettings>,
    router: StdMutex<Option<Arc<HttpRouter>>>,
    stop_notify: Notify,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn server_state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// A multi-service WebSocket server.
///
/// Runs once: Ready → Start → ShuttingDown → Stop. Configuration and
/// service registration happen in Ready; a stopped server does not
/// restart.
#[derive(Clone)]
pub struct WsServer {
    inner: Arc<Inner>,
}

impl WsServer {
    pub fn builder() -> WsServerBuilder {
        WsServerBuilder::new()
    }

    pub(crate) fn from_builder(builder: WsServerBuilder) -> Self {
        Self {
            inner: Arc::new(Inner {
                address: builder.address,
                port: builder.port,
                secure: builder.secure,
                state: AtomicU8::new(ServerState::Ready as u8),
                transition: StdMutex::new(()),
                services: ServiceRegistry::new(builder.keep_clean, builder.wait_time),
                settings: StdMutex::new(Settings {
                    realm: builder.realm,
                    auth_scheme: builder.auth_scheme,
                    credential_finder: builder.credential_finder,
                    reuse_address: builder.reuse_address,
                    allow_forwarded_request: builder.allow_forwarded_request,
                    hostname: builder.hostname,
                }),
                tls: StdMutex::new(builder.tls),
                router: StdMutex::new(builder.router.map(Arc::new)),
                stop_notify: Notify::new(),
                accept_task: StdMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.server_state()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ServerState::Start
    }

    pub fn address(&self) -> IpAddr {
        self.inner.address
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    pub fn realm(&self) -> String {
        self.inner.settings.lock().unwrap().realm.clone()
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    /// Registers a service at `path`. Valid only before start.
    pub fn add_service<B, F>(&self, path: &str, factory: F) -> bool
    where
        B: Behavior + 'static,
        F: Fn() -> B + Send + Sync + 'static,
    {
        if self.state() != ServerState::Ready {
            warn!("service {} not added: server already started", path);
            return false;
        }
        self.inner.services.add(path, behavior_factory(factory))
    }

    /// Unregisters a service, closing its sessions with 1001 Going Away.
    /// Unlike registration this is honored while the server runs.
    pub async fn remove_service(&self, path: &str) -> bool {
        self.inner.services.remove(path).await
    }

    pub fn set_realm(&self, realm: impl Into<String>) {
        self.with_settings("set_realm", |s| s.realm = realm.into());
    }

    pub fn set_auth_scheme(&self, scheme: AuthScheme) {
        self.with_settings("set_auth_scheme", |s| s.auth_scheme = scheme);
    }

    pub fn set_credential_finder<F>(&self, finder: F)
    where
        F: Fn(&str) -> Option<Credentials> + Send + Sync + 'static,
    {
        self.with_settings("set_credential_finder", |s| {
            s.credential_finder = Some(Arc::new(finder))
        });
    }

    pub fn set_reuse_address(&self, reuse: bool) {
        self.with_settings("set_reuse_address", |s| s.reuse_address = reuse);
    }

    pub fn set_allow_forwarded_request(&self, allow: bool) {
        self.with_settings("set_allow_forwarded_request", |s| {
            s.allow_forwarded_request = allow
        });
    }

    pub fn set_hostname(&self, hostname: impl Into<String>) {
        self.with_settings("set_hostname", |s| s.hostname = Some(hostname.into()));
    }

    pub fn set_tls(&self, tls: TlsSettings) {
        if self.state() != ServerState::Ready {
            warn!("set_tls ignored: server already started");
            return;
        }
        *self.inner.tls.lock().unwrap() = tls;
    }

    pub fn set_router(&self, router: HttpRouter) {
        if self.state() != ServerState::Ready {
            warn!("set_router ignored: server already started");
            return;
        }
        *self.inner.router.lock().unwrap() = Some(Arc::new(router));
    }

    pub fn set_keep_clean(&self, on: bool) {
        if self.state() != ServerState::Ready {
            warn!("set_keep_clean ignored: server already started");
            return;
        }
        self.inner.services.set_keep_clean(on);
    }

    pub fn set_wait_time(&self, wait: Duration) -> Result<()> {
        if self.state() != ServerState::Ready {
            warn!("set_wait_time ignored: server already started");
            return Ok(());
        }
        self.inner.services.set_wait_time(wait)
    }

    fn with_settings(&self, op: &str, apply: impl FnOnce(&mut Settings)) {
        if self.state() != ServerState::Ready {
            warn!("{} ignored: server already started", op);
            return;
        }
        apply(&mut self.inner.settings.lock().unwrap());
    }

    /// Binds the listener and spawns the accept loop. Must be called on a
    /// tokio runtime. A second call is a logged no-op; a secure server
    /// without certificate material fails before any state changes.
    pub fn start(&self) -> Result<()> {
        let _guard = self.inner.transition.lock().unwrap();
        match self.inner.server_state() {
            ServerState::Ready => {}
            other => {
                warn!("start ignored: server is in {:?}", other);
                return Ok(());
            }
        }

        let acceptor = if self.inner.secure {
            let tls = self.inner.tls.lock().unwrap();
            if !tls.has_certificate() {
                return Err(Error::config("secure server requires a certificate"));
            }
            Some(tls.build_acceptor()?)
        } else {
            None
        };

        let (active, reuse_address) = {
            let settings = self.inner.settings.lock().unwrap();
            let gate = AuthGate::new(
                settings.auth_scheme,
                settings.realm.clone(),
                settings.credential_finder.clone(),
            );
            let active = Arc::new(ActiveConfig {
                gate,
                allow_forwarded_request: settings.allow_forwarded_request,
                hostname: settings.hostname.clone(),
                port: self.inner.port,
                secure: self.inner.secure,
                router: self.inner.router.lock().unwrap().clone(),
            });
            (active, settings.reuse_address)
        };

        let addr = SocketAddr::new(self.inner.address, self.inner.port);
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if reuse_address {
            socket.set_reuseaddr(true)?;
        }
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;

        self.inner.services.start();
        self.inner.set_state(ServerState::Start);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(accept_loop(inner, listener, active, acceptor));
        *self.inner.accept_task.lock().unwrap() = Some(task);

        info!("listening on {}", addr);
        Ok(())
    }

    /// Stops without a closing handshake (reserved code 1005).
    pub async fn stop(&self) -> Result<()> {
        self.stop_with(codes::NO_STATUS, "").await
    }

    /// Graceful shutdown: close the listener, join the accept loop, and
    /// close every session with (code, reason). Reserved codes suppress
    /// the close frame. No-op unless the server is running.
    pub async fn stop_with(&self, code: u16, reason: &str) -> Result<()> {
        codes::check_close(code, reason)?;
        {
            let _guard = self.inner.transition.lock().unwrap();
            match self.inner.server_state() {
                ServerState::Start => self.inner.set_state(ServerState::ShuttingDown),
                other => {
                    warn!("stop ignored: server is in {:?}", other);
                    return Ok(());
                }
            }
        }
        self.inner.stop_notify.notify_one();

        let task = self.inner.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            if tokio::time::timeout(ACCEPT_JOIN_TIMEOUT, task).await.is_err() {
                warn!(
                    "accept loop did not exit within {:?}; abandoning it",
                    ACCEPT_JOIN_TIMEOUT
                );
            }
        }

        self.inner.services.stop(code, reason).await;
        self.inner.set_state(ServerState::Stop);
        info!("server stopped");
        Ok(())
    }
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    active: Arc<ActiveConfig>,
    acceptor: Option<TlsAcceptor>,
) {
    loop {
        tokio::select! {
            conn = listener.accept() => {
                let (stream, peer_addr) = match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept failed: {}", e);
                        abort(&inner).await;
                        break;
                    }
                };
                trace!("incoming connection accepted: {}", peer_addr);
                let inner = Arc::clone(&inner);
                let active = Arc::clone(&active);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    serve_connection(inner, active, acceptor, stream, peer_addr).await;
                });
            },

            _ = inner.stop_notify.notified() => {
                debug!("stop signal received; leaving the accept loop");
                break;
            }
        }
    }
}

/// Abort path for a failed listener: tear every session down with 1006
/// and go straight to Stop.
async fn abort(inner: &Arc<Inner>) {
    {
        let _guard = inner.transition.lock().unwrap();
        if inner.server_state() != ServerState::Start {
            return;
        }
        inner.set_state(ServerState::ShuttingDown);
    }
    inner.services.stop(codes::ABNORMAL, "").await;
    inner.set_state(ServerState::Stop);
    error!("listener failed; server aborted");
}

async fn serve_connection(
    inner: Arc<Inner>,
    active: Arc<ActiveConfig>,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let builder = Builder::new(TokioExecutor::new());
    let service = service_fn({
        let inner = Arc::clone(&inner);
        let active = Arc::clone(&active);
        move |req| handle_request(Arc::clone(&inner), Arc::clone(&active), req, peer_addr)
    });

    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                if let Err(e) = builder
                    .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                    .await
                {
                    error!("connection error: {}", e);
                }
            }
            Err(e) => debug!("tls handshake with {} failed: {}", peer_addr, e),
        },
        None => {
            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                error!("connection error: {}", e);
            }
        }
    }
    trace!("connection dropped: {}", peer_addr);
}

async fn handle_request(
    inner: Arc<Inner>,
    active: Arc<ActiveConfig>,
    mut req: Request<Incoming>,
    peer_addr: SocketAddr,
) -> std::result::Result<Response<Body>, Infallible> {
    let identity = match active.gate.authenticate(req.headers()) {
        AuthOutcome::Granted(identity) => identity,
        AuthOutcome::Challenge(challenge) => {
            debug!("{} challenged with {} auth", peer_addr, active.gate.scheme());
            return Ok(challenge_response(&challenge));
        }
        AuthOutcome::Forbidden => {
            debug!("{} forbidden: bad credentials", peer_addr);
            return Ok(closed_status(StatusCode::FORBIDDEN));
        }
    };

    if is_upgrade_request(req.headers()) {
        if !active.allow_forwarded_request
            && !request_host_acceptable(req.uri(), req.headers(), &active)
        {
            debug!("forwarded upgrade from {} rejected", peer_addr);
            return Ok(closed_status(StatusCode::BAD_REQUEST));
        }
        let path = match normalize_path(req.uri().path()) {
            Ok(path) => path,
            Err(_) => return Ok(closed_status(StatusCode::NOT_FOUND)),
        };
        let Some(host) = inner.services.try_get(&path) else {
            debug!("no service at {}; upgrade refused", path);
            return Ok(closed_status(StatusCode::NOT_IMPLEMENTED));
        };
        let ctx = ConnectionContext::new(
            req.uri().clone(),
            req.headers().clone(),
            identity,
            peer_addr,
            active.secure,
        );
        return Ok(host.start_session(&mut req, ctx));
    }

    match active.router.as_ref() {
        Some(router) => {
            let (parts, body) = req.into_parts();
            let bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    debug!("request body read failed: {}", e);
                    Bytes::new()
                }
            };
            let ctx = HttpContext {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body: bytes,
                peer_addr,
                identity,
            };
            Ok(router.dispatch(ctx).await)
        }
        None => Ok(closed_status(StatusCode::NOT_IMPLEMENTED)),
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("websocket")))
        .unwrap_or(false)
}

/// Applies the forwarded-request policy: the request must target this
/// listener's port, and a DNS-style host name must match the configured
/// hostname. IP-literal hosts are only port-checked.
fn request_host_acceptable(uri: &Uri, headers: &HeaderMap, active: &ActiveConfig) -> bool {
    let authority = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| uri.authority().map(|a| a.as_str().to_owned()));
    let Some(authority) = authority else {
        return false;
    };

    let (host, port) = split_authority(&authority);
    let port = port.unwrap_or(if active.secure { 443 } else { 80 });
    if port != active.port {
        return false;
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return true;
    }
    match &active.hostname {
        Some(name) => name.eq_ignore_ascii_case(host),
        None => false,
    }
}

fn split_authority(authority: &str) -> (&str, Option<u16>) {
    if let Some(stripped) = authority.strip_prefix('[') {
        // bracketed IPv6
        if let Some(end) = stripped.find(']') {
            let host = &authority[..end + 2];
            let port = stripped[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (authority, None);
    }
    if authority.matches(':').count() == 1 {
        if let Some((host, port)) = authority.rsplit_once(':') {
            return (host, port.parse().ok());
        }
    }
    (authority, None)
}

fn challenge_response(challenge: &str) -> Response<Body> {
    let mut res = closed_status(StatusCode::UNAUTHORIZED);
    if let Ok(value) = HeaderValue::from_str(challenge) {
        res.headers_mut().insert(WWW_AUTHENTICATE, value);
    }
    res
}

/// Error response that also ends the connection.
fn closed_status(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONNECTION, HeaderValue::from_static("close"))
        .body(Body::from(status.canonical_reason().unwrap_or_default()))
        .unwrap()
}
