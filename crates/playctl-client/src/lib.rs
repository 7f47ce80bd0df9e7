//! Playground connectivity client
//!
//! Talks to the control plane, authenticates tunnels to playground
//! machines, fans port forwards out over them, and follows a play's
//! task-state event stream.

pub mod api;
pub mod config;
pub mod conn;
pub mod forward;
pub mod group;
pub mod retry;
pub mod tunnel;

#[cfg(test)]
mod test_support;

pub use api::{ApiError, ControlPlane, HttpControlPlane};
pub use config::{ClientConfig, DEFAULT_BASE_URL};
pub use conn::{ConnError, ConnState, PlayConn, PlayConnConfig, PlayOutcome, SharedPlay};
pub use forward::{forward_all, ForwardOrchestrator};
pub use group::{GroupPolicy, TaskGroup};
pub use retry::{RetryError, RetryPolicy};
pub use tunnel::{resolve_machine, Tunnel, TunnelAuthenticator, TunnelError, TunnelHandle};

pub use playctl_proto::{ForwardingSpec, Play, PlayTask};
