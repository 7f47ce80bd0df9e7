//! Interactive SSH sessions into playground machines
//!
//! The SSH traffic rides a tunnel forward: the bridge starts a forward of
//! an ephemeral local port to the machine's SSH port, dials it, and runs a
//! russh client over that connection.

pub mod bridge;
pub mod identity;
pub mod terminal;

use playctl_client::TunnelError;
use std::path::PathBuf;
use thiserror::Error;

pub use bridge::{resolve_login, SshBridge, SshSession};
pub use identity::SshIdentity;
pub use terminal::{RawModeGuard, ResizeWatcher, Terminal};

#[derive(Debug, Error)]
pub enum SshError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("user '{user}' does not exist on machine '{machine}'")]
    UnknownUser { machine: String, user: String },

    #[error("SSH identity error: {0}")]
    Identity(String),

    #[error("SSH identity error at {path}: {source}")]
    IdentityIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to dial forwarded SSH port {addr} after {attempts} attempts: {source}")]
    Dial {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH handshake failed: {0}")]
    Handshake(#[source] russh::Error),

    #[error("SSH authentication rejected for user '{0}'")]
    AuthRejected(String),

    #[error("remote execution failed: {0}")]
    Channel(#[source] russh::Error),

    #[error("terminal error: {0}")]
    Terminal(#[source] std::io::Error),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session forcibly closed; the remote process may still be running")]
    ForciblyClosed,

    #[error("context canceled")]
    Canceled,
}
