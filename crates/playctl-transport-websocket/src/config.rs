//! WebSocket transport configuration

use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum message size accepted from the server
    pub max_message_size: usize,

    /// Frames buffered per stream before the reader applies backpressure
    pub stream_buffer: usize,

    /// Read buffer used when copying from local connections
    pub read_buffer_size: usize,

    /// Reconnect attempts after the transport connection drops mid-forward
    pub max_reconnect_attempts: u32,

    /// Delay before the first reconnect attempt
    pub reconnect_initial_backoff: Duration,

    /// Upper bound for the doubling reconnect delay
    pub reconnect_max_backoff: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::client_default()
    }
}

impl WebSocketConfig {
    /// Create a client configuration with defaults
    pub fn client_default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024, // 16MB
            stream_buffer: 256,
            read_buffer_size: 16 * 1024,
            max_reconnect_attempts: 5,
            reconnect_initial_backoff: Duration::from_secs(1),
            reconnect_max_backoff: Duration::from_secs(10),
        }
    }

    pub fn with_reconnect(mut self, attempts: u32, initial: Duration, max: Duration) -> Self {
        self.max_reconnect_attempts = attempts;
        self.reconnect_initial_backoff = initial;
        self.reconnect_max_backoff = max;
        self
    }

    pub(crate) fn protocol_config(&self) -> ProtocolConfig {
        let mut config = ProtocolConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config
    }

    /// Reconnect delay for the given 1-based attempt
    pub(crate) fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_initial_backoff
            .saturating_mul(factor)
            .min(self.reconnect_max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_default() {
        let config = WebSocketConfig::client_default();
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.protocol_config().max_message_size, Some(16 * 1024 * 1024));
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let config = WebSocketConfig::client_default();
        assert_eq!(config.reconnect_backoff(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_backoff(3), Duration::from_secs(4));
        assert_eq!(config.reconnect_backoff(5), Duration::from_secs(10));
        assert_eq!(config.reconnect_backoff(40), Duration::from_secs(10));
    }
}
