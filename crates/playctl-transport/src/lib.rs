//! Transport abstraction for playground tunnels
//!
//! The tunnel layer never speaks a multiplexing protocol itself. It hands a
//! [`ForwardTarget`] to a [`Forwarder`], which owns the local listener and
//! carries every accepted connection to the remote address over one
//! authenticated transport connection.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Tunnel / forward orchestrator        │
//! └─────────────────────────────────────────────┘
//!                       │ Forwarder::forward
//!                       ↓
//! ┌─────────────────────────────────────────────┐
//! │     playctl-transport (this crate)          │
//! │  - Forwarder      - ForwardTarget           │
//! └─────────────────────────────────────────────┘
//!                       │ implemented by
//!                       ↓
//! ┌──────────────────────────────┬──────────────┐
//! │ playctl-transport-websocket  │   Future     │
//! └──────────────────────────────┴──────────────┘
//! ```

use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind local address {address}: {source}")]
    BindError {
        address: String,
        source: std::io::Error,
    },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One local to remote mapping to be carried over a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Tunnel endpoint (`https://`, `wss://`, `http://` or `ws://`)
    pub server_url: String,
    /// `host:port` the local listener binds to
    pub local_addr: String,
    /// `host:port` dialed on the far side of the tunnel
    pub remote_addr: String,
    /// Extra headers sent when the transport connection is opened
    pub headers: Vec<(String, String)>,
}

impl ForwardTarget {
    pub fn new(
        server_url: impl Into<String>,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Drives one forward for its whole lifetime
#[async_trait]
pub trait Forwarder: Send + Sync + Debug {
    /// Bind `target.local_addr`, open the transport connection, and carry
    /// every accepted local connection to `target.remote_addr`.
    ///
    /// Returns `Err` when the forward cannot be set up, or when the
    /// transport connection is lost and cannot be re-established. Once
    /// running, errors affecting a single carried connection are sent on
    /// `errors` and the forward keeps going. Returns `Ok(())` only when
    /// `cancel` fires.
    async fn forward(
        &self,
        target: ForwardTarget,
        cancel: CancellationToken,
        errors: mpsc::Sender<TransportError>,
    ) -> TransportResult<()>;

    /// Human-readable transport name
    fn name(&self) -> &str;
}
