//! WebSocket transport for playground tunnels
//!
//! WebSocket has no native stream multiplexing, so every carried local
//! connection becomes a numbered stream framed inside binary messages
//! (see [`frame`]). Client streams use odd IDs and announce their target
//! with an `open` frame.
//!
//! # Example
//!
//! ```no_run
//! use playctl_transport::{ForwardTarget, Forwarder};
//! use playctl_transport_websocket::WebSocketForwarder;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let forwarder = WebSocketForwarder::default();
//! let (errors, _rx) = mpsc::channel(16);
//! let target = ForwardTarget::new("https://tunnel.example.com", "127.0.0.1:8080", "127.0.0.1:80")
//!     .with_header("Cookie", "session=abc");
//! forwarder.forward(target, CancellationToken::new(), errors).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod forwarder;
pub mod frame;
pub mod stream;

pub use config::WebSocketConfig;
pub use connection::MuxConnection;
pub use forwarder::{websocket_url, WebSocketForwarder};
pub use frame::{Frame, FrameType};
pub use stream::{MuxRecvHalf, MuxSendHalf, MuxStream};
