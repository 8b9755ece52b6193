use thiserror::Error;

/// Errors surfaced by the server control plane.
///
/// Data-plane failures inside behavior callbacks are routed to the
/// behavior's `on_error` and never reach this enum.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration, rejected synchronously: bad port, missing
    /// TLS certificate, invalid close code, oversized reason or payload.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation attempted in a lifecycle state that forbids it. Call
    /// sites log this and treat the operation as a no-op.
    #[error("invalid in current state: {0}")]
    State(&'static str),

    /// Malformed or disallowed request. Mapped to an HTTP status on the
    /// wire, never propagated to the caller.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed; a challenge or 403 was sent.
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
