//! Authentication gate for the accept path.
//!
//! The gate inspects the `Authorization` header of every request before
//! dispatch. Anonymous mode grants everything; Basic mode verifies the
//! presented credentials against the credential finder; Digest mode only
//! produces the challenge here, and validating a digest response is the
//! job of an external helper, so presented digest credentials are turned
//! away with 403.

use std::fmt;
use std::sync::Arc;

use hyper::header::{HeaderMap, AUTHORIZATION};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::utils::{base64_decode, base64_encode, random_bytes};

/// Realm reported in challenges when none is configured.
pub const DEFAULT_REALM: &str = "SECRET AREA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthScheme {
    #[default]
    Anonymous,
    Basic,
    Digest,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Anonymous => write!(f, "anonymous"),
            AuthScheme::Basic => write!(f, "basic"),
            AuthScheme::Digest => write!(f, "digest"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Looks up the stored credentials for an identity presented by a client.
pub type CredentialFinder = Arc<dyn Fn(&str) -> Option<Credentials> + Send + Sync>;

/// Outcome of the gate for one request.
pub enum AuthOutcome {
    /// Request may proceed; carries the authenticated identity, if any.
    Granted(Option<String>),
    /// No acceptable credentials; the value is the `WWW-Authenticate`
    /// challenge to send with 401.
    Challenge(String),
    /// Credentials were presented and are not acceptable; respond 403.
    Forbidden,
}

/// Snapshot of the server's authentication inputs, taken at start time.
#[derive(Clone)]
pub struct AuthGate {
    scheme: AuthScheme,
    realm: String,
    finder: Option<CredentialFinder>,
}

impl AuthGate {
    pub fn new(scheme: AuthScheme, realm: String, finder: Option<CredentialFinder>) -> Self {
        Self {
            scheme,
            realm,
            finder,
        }
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> AuthOutcome {
        if self.scheme == AuthScheme::Anonymous {
            return AuthOutcome::Granted(None);
        }

        let header = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        match self.scheme {
            AuthScheme::Basic => match header.strip_prefix("Basic ") {
                Some(encoded) => match self.check_basic(encoded.trim()) {
                    Some(user) => AuthOutcome::Granted(Some(user)),
                    None => AuthOutcome::Forbidden,
                },
                None => AuthOutcome::Challenge(self.challenge()),
            },
            AuthScheme::Digest => match header.strip_prefix("Digest ") {
                // Digest responses are validated by an external helper,
                // not by this gate; credentials reaching it are refused.
                Some(_) => {
                    debug!("digest credentials presented; validation is delegated");
                    AuthOutcome::Forbidden
                }
                None => AuthOutcome::Challenge(self.challenge()),
            },
            AuthScheme::Anonymous => unreachable!(),
        }
    }

    /// `WWW-Authenticate` value for the configured scheme.
    pub fn challenge(&self) -> String {
        match self.scheme {
            AuthScheme::Basic => format!("Basic realm=\"{}\"", self.realm),
            AuthScheme::Digest => format!(
                "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\"",
                self.realm,
                fresh_nonce()
            ),
            AuthScheme::Anonymous => String::new(),
        }
    }

    fn lookup(&self, username: &str) -> Option<Credentials> {
        let finder = self.finder.as_ref()?;
        finder(username)
    }

    fn check_basic(&self, encoded: &str) -> Option<String> {
        let decoded = base64_decode(encoded).ok()?;
        let pair = String::from_utf8(decoded).ok()?;
        let (username, password) = pair.split_once(':')?;
        let stored = self.lookup(username)?;
        if stored.password == password {
            Some(username.to_owned())
        } else {
            debug!("basic auth password mismatch for {}", username);
            None
        }
    }
}

/// Builds the `Authorization: Basic` value for a credential pair. Used by
/// clients and tests.
pub fn basic_authorization(credentials: &Credentials) -> String {
    let pair = format!("{}:{}", credentials.username, credentials.password);
    format!("Basic {}", base64_encode(pair.as_bytes()))
}

fn fresh_nonce() -> String {
    let bytes = random_bytes(16);
    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
