//! Path-keyed registry of service hosts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ahash::AHashMap;
use log::{debug, error, warn};

use crate::codes;
use crate::error::{Error, Result};
use crate::service::behavior::{BehaviorFactory, WsData};
use crate::service::host::ServiceHost;

/// Brings a service path to canonical form: percent-decoded, absolute,
/// query-free, no trailing slash.
pub fn normalize_path(path: &str) -> Result<String> {
    let decoded = crate::utils::percent_decode(path);
    if !decoded.starts_with('/') {
        return Err(Error::protocol(format!(
            "service path must be absolute: {:?}",
            path
        )));
    }
    if decoded.contains('?') || decoded.contains('#') {
        return Err(Error::protocol(format!(
            "service path must not carry a query or fragment: {:?}",
            path
        )));
    }
    let trimmed = decoded.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_owned());
    }
    Ok(trimmed.to_owned())
}

/// Maps normalized paths to hosts and fans service-wide operations out.
pub struct ServiceRegistry {
    hosts: StdMutex<AHashMap<String, Arc<ServiceHost>>>,
    running: AtomicBool,
    keep_clean: AtomicBool,
    wait_nanos: AtomicU64,
}

impl ServiceRegistry {
    pub(crate) fn new(keep_clean: bool, wait_time: Duration) -> Self {
        Self {
            hosts: StdMutex::new(AHashMap::new()),
            running: AtomicBool::new(false),
            keep_clean: AtomicBool::new(keep_clean),
            wait_nanos: AtomicU64::new(wait_time.as_nanos() as u64),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn wait_time(&self) -> Duration {
        Duration::from_nanos(self.wait_nanos.load(Ordering::Acquire))
    }

    /// Registers a service. Refused while the registry is running, for a
    /// malformed path, and for a duplicate; all three are logged no-ops.
    pub fn add(&self, path: &str, factory: BehaviorFactory) -> bool {
        if self.is_running() {
            warn!("service {} not added: registry already started", path);
            return false;
        }
        let normalized = match normalize_path(path) {
            Ok(p) => p,
            Err(e) => {
                error!("service not added: {}", e);
                return false;
            }
        };
        let mut hosts = self.hosts.lock().unwrap();
        if hosts.contains_key(&normalized) {
            error!("service {} already registered", normalized);
            return false;
        }
        let host = ServiceHost::new(
            normalized.clone(),
            factory,
            self.keep_clean.load(Ordering::Acquire),
            self.wait_time(),
        );
        hosts.insert(normalized, host);
        true
    }

    /// Unregisters a service, closing its sessions with 1001 Going Away.
    pub async fn remove(&self, path: &str) -> bool {
        let Ok(normalized) = normalize_path(path) else {
            return false;
        };
        let host = self.hosts.lock().unwrap().remove(&normalized);
        match host {
            Some(host) => {
                host.stop(codes::GOING_AWAY, "").await;
                debug!("service {} removed", normalized);
                true
            }
            None => false,
        }
    }

    pub fn try_get(&self, path: &str) -> Option<Arc<ServiceHost>> {
        let normalized = normalize_path(path).ok()?;
        self.hosts.lock().unwrap().get(&normalized).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.hosts.lock().unwrap().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Arc<ServiceHost>> {
        self.hosts.lock().unwrap().values().cloned().collect()
    }

    pub fn keep_clean(&self) -> bool {
        self.keep_clean.load(Ordering::Acquire)
    }

    /// Propagates the sweeper switch to every host.
    pub fn set_keep_clean(&self, on: bool) {
        self.keep_clean.store(on, Ordering::Release);
        for host in self.snapshot() {
            host.sessions().set_keep_clean(on);
        }
    }

    /// Propagates the pong/close wait to every host.
    pub fn set_wait_time(&self, wait: Duration) -> Result<()> {
        if wait.is_zero() {
            return Err(Error::config("wait time must be greater than zero"));
        }
        self.wait_nanos
            .store(wait.as_nanos() as u64, Ordering::Release);
        for host in self.snapshot() {
            host.sessions().set_wait_time(wait)?;
        }
        Ok(())
    }

    pub(crate) fn start(&self) {
        self.running.store(true, Ordering::Release);
        for host in self.snapshot() {
            host.start();
        }
    }

    pub(crate) async fn stop(&self, code: u16, reason: &str) {
        self.running.store(false, Ordering::Release);
        for host in self.snapshot() {
            host.stop(code, reason).await;
        }
    }

    /// Sends to every session of every service.
    pub async fn broadcast(&self, data: impl Into<WsData>) {
        let data = data.into();
        for host in self.snapshot() {
            host.sessions().broadcast(data.clone()).await;
        }
    }

    /// Sends to every session of one service.
    pub async fn broadcast_to(&self, path: &str, data: impl Into<WsData>) -> Result<()> {
        let host = self
            .try_get(path)
            .ok_or_else(|| Error::protocol(format!("no service at {}", path)))?;
        host.sessions().broadcast(data).await;
        Ok(())
    }

    /// Pings every session of every service; the nested map records pong
    /// receipts per service path.
    pub async fn broadping(
        &self,
        payload: &str,
    ) -> Result<AHashMap<String, AHashMap<String, bool>>> {
        codes::check_ping_payload(payload)?;
        let mut receipts = AHashMap::new();
        for host in self.snapshot() {
            receipts.insert(
                host.path().to_owned(),
                host.sessions().broadping(payload).await?,
            );
        }
        Ok(receipts)
    }

    pub async fn ping_to(&self, path: &str, id: &str, payload: &str) -> bool {
        match self.try_get(path) {
            Some(host) => host.sessions().ping_to(id, payload).await,
            None => {
                error!("ping failed: no service at {}", path);
                false
            }
        }
    }

    pub fn send_to(&self, path: &str, id: &str, data: impl Into<WsData>) -> Result<()> {
        let host = self
            .try_get(path)
            .ok_or_else(|| Error::protocol(format!("no service at {}", path)))?;
        host.sessions().send_to(id, data)
    }
}
