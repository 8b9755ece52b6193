pub mod behavior;
pub mod host;
pub mod manager;
pub mod registry;
pub mod session;

pub use behavior::{behavior_factory, Behavior, BehaviorFactory, CloseArgs, SessionLink, WsData};
pub use host::ServiceHost;
pub use manager::{ManagerState, SessionManager, DEFAULT_WAIT_TIME, SWEEP_INTERVAL};
pub use registry::{normalize_path, ServiceRegistry};
pub use session::{Session, SessionState};
