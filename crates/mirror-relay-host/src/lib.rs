//! Host link over the Chrome DevTools Protocol.
//!
//! Finds the host's debug endpoint, keeps one WebSocket session to it alive,
//! captures the conversation surface and executes commands inside the host's
//! execution contexts.

pub mod capture;
pub mod discovery;
pub mod dispatch;
pub mod link;
pub mod resolve;
pub mod scripts;
pub mod supervisor;

pub use discovery::{DebugTarget, HostAddress};
pub use dispatch::Dispatcher;
pub use link::{ExecutionContext, HostLink, ScriptHost};
pub use supervisor::{CdpConnector, Connector, HostSupervisor};
