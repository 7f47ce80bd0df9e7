//! Playground Protocol Definitions
//!
//! This crate defines the data model shared by the playground connectivity
//! layer: play and task state, the forwarding-spec grammar, the control-plane
//! request/response bodies, and the event-stream wire messages.

pub mod api;
pub mod forwarding;
pub mod messages;
pub mod play;

pub use api::{
    CreateTunnelRequest, CreateTunnelResponse, PlayConnResponse, PortForward, TunnelAccess,
    PORT_FORWARD_KIND_LOCAL,
};
pub use forwarding::{ForwardingSpec, SpecError, DEFAULT_LOCAL_HOST, LOCAL_PORT_RANGE};
pub use messages::{ConnMessage, MessageError, MESSAGE_KIND_TASK};
pub use play::{
    InitProgress, Machine, MachineResources, MachineUser, Play, PlayState, PlayTask, StateEvent,
    TaskStatus, UnknownTaskStatus, DEFAULT_SSH_USER,
};

/// Remote port of the SSH daemon on every playground machine
pub const SSH_PORT: u16 = 22;
