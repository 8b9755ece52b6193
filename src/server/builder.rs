//! Construction-time configuration for [`WsServer`].

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthScheme, CredentialFinder, Credentials, DEFAULT_REALM};
use crate::error::{Error, Result};
use crate::server::router::HttpRouter;
use crate::server::tls::TlsSettings;
use crate::server::WsServer;
use crate::service::manager::DEFAULT_WAIT_TIME;

pub struct WsServerBuilder {
    pub(crate) address: IpAddr,
    pub(crate) port: u16,
    pub(crate) secure: bool,
    pub(crate) reuse_address: bool,
    pub(crate) realm: String,
    pub(crate) auth_scheme: AuthScheme,
    pub(crate) credential_finder: Option<CredentialFinder>,
    pub(crate) keep_clean: bool,
    pub(crate) wait_time: Duration,
    pub(crate) allow_forwarded_request: bool,
    pub(crate) hostname: Option<String>,
    pub(crate) tls: TlsSettings,
    pub(crate) router: Option<HttpRouter>,
}

impl Default for WsServerBuilder {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 80,
            secure: false,
            reuse_address: false,
            realm: DEFAULT_REALM.to_owned(),
            auth_scheme: AuthScheme::Anonymous,
            credential_finder: None,
            keep_clean: true,
            wait_time: DEFAULT_WAIT_TIME,
            allow_forwarded_request: false,
            hostname: None,
            tls: TlsSettings::default(),
            router: None,
        }
    }
}

impl WsServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local address to bind; a non-local address fails at start time.
    pub fn address(mut self, address: IpAddr) -> Self {
        self.address = address;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Wraps the listener in TLS; a certificate must be configured before
    /// the server can start.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    pub fn auth_scheme(mut self, scheme: AuthScheme) -> Self {
        self.auth_scheme = scheme;
        self
    }

    pub fn credential_finder<F>(mut self, finder: F) -> Self
    where
        F: Fn(&str) -> Option<Credentials> + Send + Sync + 'static,
    {
        self.credential_finder = Some(Arc::new(finder));
        self
    }

    pub fn keep_clean(mut self, on: bool) -> Self {
        self.keep_clean = on;
        self
    }

    pub fn wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = wait;
        self
    }

    pub fn allow_forwarded_request(mut self, allow: bool) -> Self {
        self.allow_forwarded_request = allow;
        self
    }

    /// DNS name this server answers to; requests carrying another
    /// DNS-style host are rejected unless forwarding is allowed.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Enables the companion HTTP mode on the same port.
    pub fn router(mut self, router: HttpRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn build(self) -> Result<WsServer> {
        if self.port == 0 {
            return Err(Error::config("port must be within 1..=65535"));
        }
        if self.wait_time.is_zero() {
            return Err(Error::config("wait time must be greater than zero"));
        }
        if self.router.is_some() {
            if self.port == 80 && self.secure {
                return Err(Error::config("port 80 must not be secure in HTTP mode"));
            }
            if self.port == 443 && !self.secure {
                return Err(Error::config("port 443 must be secure in HTTP mode"));
            }
        }
        Ok(WsServer::from_builder(self))
    }
}
