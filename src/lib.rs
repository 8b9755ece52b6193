//! wshub: a multi-service WebSocket server.
//!
//! One listener (plain TCP or TLS) dispatches HTTP upgrade requests by
//! path to registered services. Each service pairs a behavior factory
//! with a session manager that handles liveness sweeping, broadcast
//! fan-out, and graceful shutdown. A companion HTTP router can answer
//! plain requests on the same port.
//!
//! ```no_run
//! use wshub::{Behavior, SessionLink, WsData, WsServer};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Behavior for Echo {
//!     async fn on_message(&mut self, link: &SessionLink, data: WsData) -> anyhow::Result<()> {
//!         link.send(data)?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let server = WsServer::builder().port(8080).build()?;
//! server.add_service("/echo", || Echo);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod codes;
pub mod context;
pub mod error;
pub mod server;
pub mod service;

pub(crate) mod utils;

pub use auth::{AuthScheme, CredentialFinder, Credentials, DEFAULT_REALM};
pub use context::ConnectionContext;
pub use error::{Error, Result};
pub use server::builder::WsServerBuilder;
pub use server::router::{Body, HttpContext, HttpRouter};
pub use server::tls::{TlsSettings, TlsVersion};
pub use server::{ServerState, WsServer};
pub use service::{
    behavior_factory, normalize_path, Behavior, BehaviorFactory, CloseArgs, ManagerState,
    ServiceHost, ServiceRegistry, Session, SessionLink, SessionManager, SessionState, WsData,
};
