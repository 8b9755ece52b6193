//! Runtime container for one registered service.

use std::sync::Arc;
use std::time::Duration;

use hyper::body::{Bytes, Incoming};
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::http::HeaderValue;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{handshake::derive_accept_key, protocol::Role};
use tokio_tungstenite::WebSocketStream;

use crate::context::ConnectionContext;
use crate::service::behavior::{Behavior, BehaviorFactory};
use crate::service::manager::SessionManager;
use crate::service::session::{run_session, ServerSocket, Session};

type Body = http_body_util::Full<Bytes>;

/// One path's behavior factory and its session manager.
pub struct ServiceHost {
    path: String,
    factory: BehaviorFactory,
    sessions: Arc<SessionManager>,
}

impl ServiceHost {
    pub(crate) fn new(
        path: String,
        factory: BehaviorFactory,
        keep_clean: bool,
        wait_time: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            factory,
            sessions: Arc::new(SessionManager::new(keep_clean, wait_time)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub(crate) fn start(&self) {
        self.sessions.start();
    }

    pub(crate) async fn stop(&self, code: u16, reason: &str) {
        self.sessions.stop(code, reason).await;
    }

    /// Accepts an upgrade request for this service: vets the handshake,
    /// spawns the session binding, and answers 101 Switching Protocols.
    ///
    /// The behavior is created and consulted before the response is
    /// written, so its event hooks are in place when the socket opens.
    pub(crate) fn start_session(
        self: &Arc<Self>,
        req: &mut Request<Incoming>,
        ctx: ConnectionContext,
    ) -> Response<Body> {
        let mut behavior = (self.factory)();
        if !behavior.on_handshake(&ctx) {
            debug!("handshake to {} vetoed by behavior", self.path);
            return plain_status(StatusCode::BAD_REQUEST);
        }

        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
            return plain_status(StatusCode::BAD_REQUEST);
        };
        let version = req
            .headers()
            .get(SEC_WEBSOCKET_VERSION)
            .and_then(|v| v.to_str().ok());
        if version != Some("13") {
            let mut res = plain_status(StatusCode::BAD_REQUEST);
            res.headers_mut()
                .append(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
            return res;
        }

        let derived = derive_accept_key(key.as_bytes());
        let ver = req.version();

        let on_upgrade = hyper::upgrade::on(req);
        let host = Arc::clone(self);
        let ctx = Arc::new(ctx);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    let socket = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                    host.bind_session(behavior, socket, ctx).await;
                }
                Err(e) => error!("websocket upgrade failed: {}", e),
            }
        });

        // send upgrade response
        let mut res = Response::new(Body::default());
        *res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *res.version_mut() = ver;
        res.headers_mut()
            .append(CONNECTION, HeaderValue::from_static("Upgrade"));
        res.headers_mut()
            .append(UPGRADE, HeaderValue::from_static("websocket"));
        res.headers_mut()
            .append(SEC_WEBSOCKET_ACCEPT, derived.parse().unwrap());
        res
    }

    async fn bind_session(
        self: Arc<Self>,
        behavior: Box<dyn Behavior>,
        socket: ServerSocket,
        ctx: Arc<ConnectionContext>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(SessionManager::allocate_id(), ctx, tx));
        if !self.sessions.add(Arc::clone(&session)) {
            debug!(
                "service {} is not accepting sessions; dropping connection",
                self.path
            );
            return;
        }
        run_session(session, Arc::clone(&self.sessions), behavior, socket, rx).await;
    }
}

fn plain_status(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::default());
    *res.status_mut() = status;
    res
}
