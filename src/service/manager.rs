//! Per-service registry of live sessions.
//!
//! The map is guarded by a plain mutex; every operation copies the
//! sessions it will touch under the lock and iterates over the copy, so
//! socket I/O never happens with the lock held.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use ahash::AHashMap;
use log::{debug, error, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::codes;
use crate::error::{Error, Result};
use crate::service::behavior::WsData;
use crate::service::session::Session;

/// Cadence of the liveness sweeper.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default pong / close-acknowledgement wait.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    Ready = 0,
    Start = 1,
    ShuttingDown = 2,
    Stop = 3,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ManagerState::Ready,
            1 => ManagerState::Start,
            2 => ManagerState::ShuttingDown,
            _ => ManagerState::Stop,
        }
    }
}

struct Fanout {
    msg: Message,
    targets: Vec<Arc<Session>>,
}

pub struct SessionManager {
    sessions: StdMutex<AHashMap<String, Arc<Session>>>,
    state: AtomicU8,
    keep_clean: AtomicBool,
    wait_nanos: AtomicU64,
    sweep_every: StdMutex<Duration>,
    /// One sweep at a time, without touching the session lock.
    sweep_gate: tokio::sync::Mutex<()>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    broadcaster: StdMutex<Option<mpsc::UnboundedSender<Fanout>>>,
}

impl SessionManager {
    pub(crate) fn new(keep_clean: bool, wait_time: Duration) -> Self {
        Self {
            sessions: StdMutex::new(AHashMap::new()),
            state: AtomicU8::new(ManagerState::Ready as u8),
            keep_clean: AtomicBool::new(keep_clean),
            wait_nanos: AtomicU64::new(wait_time.as_nanos() as u64),
            sweep_every: StdMutex::new(SWEEP_INTERVAL),
            sweep_gate: tokio::sync::Mutex::new(()),
            sweeper: StdMutex::new(None),
            broadcaster: StdMutex::new(None),
        }
    }

    /// 32 lowercase hex characters; collisions are treated as impossible.
    pub(crate) fn allocate_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ManagerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ManagerState, to: ManagerState) -> bool {
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn keep_clean(&self) -> bool {
        self.keep_clean.load(Ordering::Acquire)
    }

    /// Turns the periodic sweeper on or off. Takes effect immediately
    /// when the manager is running.
    pub fn set_keep_clean(self: &Arc<Self>, on: bool) {
        if self.keep_clean.swap(on, Ordering::AcqRel) == on {
            return;
        }
        if self.state() != ManagerState::Start {
            return;
        }
        if on {
            self.spawn_sweeper();
        } else {
            self.stop_sweeper();
        }
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_nanos(self.wait_nanos.load(Ordering::Acquire))
    }

    pub fn set_wait_time(&self, wait: Duration) -> Result<()> {
        if wait.is_zero() {
            return Err(Error::config("wait time must be greater than zero"));
        }
        self.wait_nanos
            .store(wait.as_nanos() as u64, Ordering::Release);
        Ok(())
    }

    /// Shortens the sweep cadence; exists for tests that cannot wait a
    /// minute per cycle.
    #[cfg(test)]
    pub(crate) fn set_sweep_interval(&self, every: Duration) {
        *self.sweep_every.lock().unwrap() = every;
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    pub fn try_get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn start(self: &Arc<Self>) {
        if !self.transition(ManagerState::Ready, ManagerState::Start) {
            warn!("session manager already started");
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.broadcaster.lock().unwrap() = Some(tx);
        tokio::spawn(fanout_loop(rx));
        if self.keep_clean() {
            self.spawn_sweeper();
        }
    }

    /// Registers a session. Refused once shutdown has begun.
    pub(crate) fn add(&self, session: Arc<Session>) -> bool {
        if self.state() != ManagerState::Start {
            debug!("session refused: manager is not running");
            return false;
        }
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(session.id().to_owned(), session);
        true
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().remove(id).is_some()
    }

    /// Fans a message out to a snapshot of the current sessions.
    ///
    /// While running, the job is queued to a single worker and this call
    /// returns immediately; the worker sends to one recipient at a time,
    /// so per-recipient order is kept across broadcasts and a slow client
    /// never stalls the caller. During shutdown the fan-out runs inline
    /// and failed sends are skipped.
    pub async fn broadcast(&self, data: impl Into<WsData>) {
        let mut job = Fanout {
            msg: data.into().into_message(),
            targets: self.snapshot(),
        };
        if self.state() == ManagerState::Start {
            let tx = self.broadcaster.lock().unwrap().clone();
            if let Some(tx) = tx {
                match tx.send(job) {
                    Ok(()) => return,
                    // Worker has gone; fall back to the inline path.
                    Err(mpsc::error::SendError(returned)) => job = returned,
                }
            }
        }
        for session in job.targets {
            if let Err(e) = session.send_awaited(job.msg.clone()).await {
                trace!("broadcast skipped session {}: {}", session.id(), e);
            }
        }
    }

    /// Pings every session in sequence; the map records which answered
    /// within the wait time.
    pub async fn broadping(&self, payload: &str) -> Result<AHashMap<String, bool>> {
        codes::check_ping_payload(payload)?;
        let wait = self.wait_time();
        let mut receipts = AHashMap::new();
        for session in self.snapshot() {
            let alive = session.ping(payload, wait).await.unwrap_or(false);
            receipts.insert(session.id().to_owned(), alive);
        }
        Ok(receipts)
    }

    pub async fn ping_to(&self, id: &str, payload: &str) -> bool {
        let Some(session) = self.try_get(id) else {
            return false;
        };
        match session.ping(payload, self.wait_time()).await {
            Ok(alive) => alive,
            Err(e) => {
                error!("ping to {} rejected: {}", id, e);
                false
            }
        }
    }

    pub fn send_to(&self, id: &str, data: impl Into<WsData>) -> Result<()> {
        let session = self
            .try_get(id)
            .ok_or_else(|| Error::protocol(format!("no session with id {}", id)))?;
        session.send(data)
    }

    /// Closes sessions that failed to pong during this cycle with 1006.
    pub async fn sweep(&self) {
        let Ok(_gate) = self.sweep_gate.try_lock() else {
            debug!("sweep already in progress");
            return;
        };
        if self.state() != ManagerState::Start || self.is_empty() {
            return;
        }
        let receipts = match self.broadping("").await {
            Ok(receipts) => receipts,
            Err(e) => {
                error!("sweep broadping failed: {}", e);
                return;
            }
        };
        let wait = self.wait_time();
        for (id, alive) in receipts {
            if alive {
                continue;
            }
            if self.state() != ManagerState::Start {
                debug!("sweep aborted by shutdown");
                return;
            }
            if let Some(session) = self.try_get(&id) {
                trace!("sweeping dead session {}", id);
                session.close_with(codes::ABNORMAL, "", wait).await;
                self.remove(&id);
            }
        }
    }

    /// Drains and closes every session, then refuses all further adds.
    /// A reserved code tears sockets down without a closing handshake.
    pub(crate) async fn stop(&self, code: u16, reason: &str) {
        if !self.transition(ManagerState::Start, ManagerState::ShuttingDown) {
            // Never started: nothing to drain.
            self.transition(ManagerState::Ready, ManagerState::Stop);
            return;
        }
        self.stop_sweeper();
        self.broadcaster.lock().unwrap().take();

        let wait = self.wait_time();
        for session in self.snapshot() {
            session.close_with(code, reason, wait).await;
        }
        self.sessions.lock().unwrap().clear();
        self.set_state(ManagerState::Stop);
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let every = *self.sweep_every.lock().unwrap();
        let weak: Weak<SessionManager> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                if manager.state() != ManagerState::Start {
                    break;
                }
                manager.sweep().await;
            }
        });
        if let Some(old) = self.sweeper.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Single worker draining queued broadcasts, one recipient after another.
async fn fanout_loop(mut rx: mpsc::UnboundedReceiver<Fanout>) {
    while let Some(job) = rx.recv().await {
        for session in job.targets {
            if let Err(e) = session.send_awaited(job.msg.clone()).await {
                trace!("broadcast skipped session {}: {}", session.id(), e);
            }
        }
    }
}
