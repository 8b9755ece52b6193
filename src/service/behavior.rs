//! User-supplied per-session logic.
//!
//! A service registers a factory; the host calls it once per accepted
//! session and drives the returned behavior from the session's event
//! loop. Callbacks for one session never run concurrently.

use std::sync::Arc;

use tokio_tungstenite::tungstenite::Message;

use crate::context::ConnectionContext;
use crate::error::Result;
use crate::service::manager::SessionManager;
use crate::service::session::Session;

/// A text or binary message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsData {
    Text(String),
    Binary(Vec<u8>),
}

impl WsData {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsData::Text(t) => Some(t),
            WsData::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WsData::Text(t) => t.len(),
            WsData::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn into_message(self) -> Message {
        match self {
            WsData::Text(t) => Message::Text(t),
            WsData::Binary(b) => Message::Binary(b),
        }
    }
}

impl From<&str> for WsData {
    fn from(value: &str) -> Self {
        WsData::Text(value.to_owned())
    }
}

impl From<String> for WsData {
    fn from(value: String) -> Self {
        WsData::Text(value)
    }
}

impl From<Vec<u8>> for WsData {
    fn from(value: Vec<u8>) -> Self {
        WsData::Binary(value)
    }
}

impl From<&[u8]> for WsData {
    fn from(value: &[u8]) -> Self {
        WsData::Binary(value.to_vec())
    }
}

/// How and why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseArgs {
    pub code: u16,
    pub reason: String,
    /// True when the closing handshake completed; false on teardown.
    pub was_clean: bool,
}

impl CloseArgs {
    pub(crate) fn new(code: u16, reason: impl Into<String>, was_clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean,
        }
    }
}

/// Handle passed to every behavior callback: the session itself plus the
/// manager of its service, so a behavior can answer its peer or fan out
/// to the whole service.
#[derive(Clone)]
pub struct SessionLink {
    session: Arc<Session>,
    sessions: Arc<SessionManager>,
}

impl SessionLink {
    pub(crate) fn new(session: Arc<Session>, sessions: Arc<SessionManager>) -> Self {
        Self { session, sessions }
    }

    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// All sessions of the service this session belongs to.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn context(&self) -> &ConnectionContext {
        self.session.context()
    }

    /// Queues a message to this session's peer.
    pub fn send(&self, data: impl Into<WsData>) -> Result<()> {
        self.session.send(data)
    }

    /// Fans a message out to every session of the service, this one
    /// included.
    pub async fn broadcast(&self, data: impl Into<WsData>) {
        self.sessions.broadcast(data).await;
    }

    /// Initiates the closing handshake for this session.
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        crate::codes::check_close(code, reason)?;
        self.session
            .close_with(code, reason, self.sessions.wait_time())
            .await;
        Ok(())
    }
}

/// Per-session event handlers. All default to no-ops so a behavior only
/// implements what it needs.
#[async_trait::async_trait]
pub trait Behavior: Send {
    /// Runs before the opening handshake completes. Returning false
    /// rejects the connection with 400 and no session is created.
    fn on_handshake(&mut self, ctx: &ConnectionContext) -> bool {
        let _ = ctx;
        true
    }

    /// Delivered once the session is registered, before any message.
    async fn on_open(&mut self, link: &SessionLink) -> anyhow::Result<()> {
        let _ = link;
        Ok(())
    }

    async fn on_message(&mut self, link: &SessionLink, data: WsData) -> anyhow::Result<()> {
        let _ = (link, data);
        Ok(())
    }

    /// Receives socket errors and errors returned by the other callbacks.
    async fn on_error(&mut self, link: &SessionLink, error: &anyhow::Error) {
        let _ = (link, error);
    }

    /// Terminal; delivered exactly once per session.
    async fn on_close(&mut self, link: &SessionLink, args: &CloseArgs) {
        let _ = (link, args);
    }
}

/// Produces a fresh behavior per accepted session.
pub type BehaviorFactory = Arc<dyn Fn() -> Box<dyn Behavior> + Send + Sync>;

/// Wraps a plain closure returning a concrete behavior into a factory.
pub fn behavior_factory<B, F>(make: F) -> BehaviorFactory
where
    B: Behavior + 'static,
    F: Fn() -> B + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn Behavior>)
}
