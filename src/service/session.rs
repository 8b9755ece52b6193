//! One live WebSocket connection bound to a service.
//!
//! A session splits its socket into a reader driven by `run_session` and
//! a writer task fed by an unbounded command channel; everything the rest
//! of the crate does to a session goes through that channel, so writes
//! on one socket never interleave.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use log::{debug, trace};
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::codes;
use crate::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::service::behavior::{Behavior, CloseArgs, SessionLink, WsData};
use crate::service::manager::SessionManager;

pub(crate) type ServerSocket = WebSocketStream<TokioIo<Upgraded>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

pub(crate) enum Command {
    Send {
        msg: Message,
        /// Resolved after the frame hits the socket; dropped on failure.
        done: Option<oneshot::Sender<()>>,
    },
    /// `Some` sends the closing frame and closes the sink; `None` tears
    /// the connection down without a closing handshake.
    Close { frame: Option<CloseFrame<'static>> },
}

pub struct Session {
    id: String,
    started_at: DateTime<Utc>,
    context: Arc<ConnectionContext>,
    state: AtomicU8,
    tx: mpsc::UnboundedSender<Command>,
    pong_seq: watch::Sender<u64>,
    closed: watch::Sender<bool>,
    terminate: Notify,
    close_args: StdMutex<Option<CloseArgs>>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        context: Arc<ConnectionContext>,
        tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            context,
            state: AtomicU8::new(SessionState::Connecting as u8),
            tx,
            pong_seq: watch::Sender::new(0),
            closed: watch::Sender::new(false),
            terminate: Notify::new(),
            close_args: StdMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Queues a message for the peer. Fails when the session is not open.
    pub fn send(&self, data: impl Into<WsData>) -> Result<()> {
        if self.state() != SessionState::Open {
            return Err(Error::State("session is not open"));
        }
        self.tx
            .send(Command::Send {
                msg: data.into().into_message(),
                done: None,
            })
            .map_err(|_| Error::State("session writer has gone"))
    }

    /// Sends a message and resolves once the frame has been written; the
    /// broadcast chain awaits this per recipient.
    pub(crate) async fn send_awaited(&self, msg: Message) -> Result<()> {
        if self.state() != SessionState::Open {
            return Err(Error::State("session is not open"));
        }
        let (done, ack) = oneshot::channel();
        self.tx
            .send(Command::Send {
                msg,
                done: Some(done),
            })
            .map_err(|_| Error::State("session writer has gone"))?;
        ack.await.map_err(|_| Error::State("send was not written"))
    }

    /// Pings the peer; true iff a pong arrives within `wait`.
    pub async fn ping(&self, payload: &str, wait: Duration) -> Result<bool> {
        codes::check_ping_payload(payload)?;
        if self.state() != SessionState::Open {
            return Ok(false);
        }
        let mut seq = self.pong_seq.subscribe();
        if self
            .tx
            .send(Command::Send {
                msg: Message::Ping(payload.as_bytes().to_vec()),
                done: None,
            })
            .is_err()
        {
            return Ok(false);
        }
        Ok(tokio::time::timeout(wait, seq.changed()).await.is_ok())
    }

    /// Initiates the closing handshake (or a frameless teardown for a
    /// reserved code) and waits up to `wait` for the socket to drain.
    pub(crate) async fn close_with(&self, code: u16, reason: &str, wait: Duration) {
        match self.state() {
            SessionState::Closed | SessionState::Closing => return,
            _ => {}
        }
        self.set_state(SessionState::Closing);
        self.record_close(CloseArgs::new(code, reason, false));

        let frame = codes::close_frame(code, reason);
        let frameless = frame.is_none();
        let mut closed = self.closed.subscribe();
        let _ = self.tx.send(Command::Close { frame });

        if frameless {
            // No handshake to await; stop the reader straight away. The
            // permit survives if the reader is not parked yet.
            self.terminate.notify_one();
            return;
        }
        if tokio::time::timeout(wait, closed.changed()).await.is_err() {
            trace!("session {} close not acknowledged; tearing down", self.id);
            self.terminate.notify_one();
        }
    }

    fn record_close(&self, args: CloseArgs) {
        let mut slot = self.close_args.lock().unwrap();
        if slot.is_none() {
            *slot = Some(args);
        }
    }

    /// Marks the initiated close as acknowledged by the peer.
    fn acknowledge_close(&self) {
        if let Some(args) = self.close_args.lock().unwrap().as_mut() {
            args.was_clean = true;
        }
    }

    fn taken_close_args(&self) -> CloseArgs {
        self.close_args
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| CloseArgs::new(codes::ABNORMAL, "", false))
    }

    fn mark_pong(&self) {
        self.pong_seq.send_modify(|seq| *seq += 1);
    }

    fn mark_closed(&self) {
        self.set_state(SessionState::Closed);
        self.closed.send_replace(true);
    }
}

/// Drives one bound session to completion: delivers `on_open`, forwards
/// frames, then removes the session and delivers `on_close` exactly once.
pub(crate) async fn run_session(
    session: Arc<Session>,
    manager: Arc<SessionManager>,
    mut behavior: Box<dyn Behavior>,
    socket: ServerSocket,
    rx: mpsc::UnboundedReceiver<Command>,
) {
    let (outgoing, mut incoming) = socket.split();
    let writer = tokio::spawn(write_loop(outgoing, rx));

    let link = SessionLink::new(session.clone(), manager.clone());
    session.set_state(SessionState::Open);

    if let Err(e) = behavior.on_open(&link).await {
        behavior.on_error(&link, &e).await;
    }

    loop {
        select! {
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if session.state() == SessionState::Open {
                        deliver(&mut behavior, &link, WsData::Text(text)).await;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if session.state() == SessionState::Open {
                        deliver(&mut behavior, &link, WsData::Binary(data)).await;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = session.tx.send(Command::Send {
                        msg: Message::Pong(payload),
                        done: None,
                    });
                }
                Some(Ok(Message::Pong(_))) => session.mark_pong(),
                Some(Ok(Message::Close(frame))) => {
                    if session.state() == SessionState::Closing {
                        // Ack of the close we initiated.
                        session.acknowledge_close();
                    } else {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((codes::NO_STATUS, String::new()));
                        session.record_close(CloseArgs::new(code, reason.clone(), true));
                        session.set_state(SessionState::Closing);
                        // A status-less close is answered with an empty
                        // close frame; 1005 itself never goes on the wire.
                        let reply = match codes::close_frame(code, &reason) {
                            Some(frame) => Command::Close { frame: Some(frame) },
                            None => Command::Send {
                                msg: Message::Close(None),
                                done: None,
                            },
                        };
                        let _ = session.tx.send(reply);
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    session.record_close(CloseArgs::new(codes::ABNORMAL, "", false));
                    let error = anyhow::Error::new(e);
                    behavior.on_error(&link, &error).await;
                    break;
                }
                None => {
                    session.record_close(CloseArgs::new(codes::ABNORMAL, "", false));
                    break;
                }
            },
            _ = session.terminate.notified() => break,
        }
    }

    session.mark_closed();
    let _ = session.tx.send(Command::Close { frame: None });
    let _ = writer.await;

    manager.remove(session.id());
    let args = session.taken_close_args();
    debug!(
        "session {} closed: code={} clean={}",
        session.id, args.code, args.was_clean
    );
    behavior.on_close(&link, &args).await;
}

async fn deliver(behavior: &mut Box<dyn Behavior>, link: &SessionLink, data: WsData) {
    if let Err(e) = behavior.on_message(link, data).await {
        behavior.on_error(link, &e).await;
    }
}

async fn write_loop(
    mut outgoing: SplitSink<ServerSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Send { msg, done } => match outgoing.send(msg).await {
                Ok(()) => {
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Err(e) => {
                    debug!("socket write failed: {}", e);
                    break;
                }
            },
            Command::Close { frame: Some(frame) } => {
                if let Err(e) = outgoing.send(Message::Close(Some(frame))).await {
                    debug!("close frame write failed: {}", e);
                }
                let _ = outgoing.close().await;
                break;
            }
            Command::Close { frame: None } => break,
        }
    }
}
