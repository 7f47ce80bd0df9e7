//! Local listener carried over a multiplexed WebSocket

use async_trait::async_trait;
use playctl_transport::{ForwardTarget, Forwarder, TransportError, TransportResult};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::WebSocketConfig;
use crate::connection::MuxConnection;
use crate::stream::MuxStream;

/// [`Forwarder`] speaking the stream-multiplexing WebSocket protocol
#[derive(Debug, Clone, Default)]
pub struct WebSocketForwarder {
    config: WebSocketConfig,
}

impl WebSocketForwarder {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Open one transport connection to the tunnel endpoint
    pub async fn connect(&self, target: &ForwardTarget) -> TransportResult<MuxConnection> {
        let url = websocket_url(&target.server_url)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;

        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        debug!(url = %url, "Connecting WebSocket transport");
        let (ws_stream, _response) = tokio_tungstenite::connect_async_with_config(
            request,
            Some(self.config.protocol_config()),
            true,
        )
        .await
        .map_err(|e| TransportError::ConnectionError(format!("WebSocket connect failed: {}", e)))?;

        Ok(MuxConnection::new(ws_stream, self.config.stream_buffer))
    }

    /// Reconnect with capped exponential backoff. `Ok(None)` means canceled.
    async fn reconnect(
        &self,
        target: &ForwardTarget,
        cancel: &CancellationToken,
    ) -> TransportResult<Option<MuxConnection>> {
        let mut last_error = None;

        for attempt in 1..=self.config.max_reconnect_attempts {
            let backoff = self.config.reconnect_backoff(attempt);
            info!(
                attempt,
                max_attempts = self.config.max_reconnect_attempts,
                "Reconnecting in {:?}",
                backoff
            );

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(backoff) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = self.connect(target) => result,
            };

            match result {
                Ok(conn) => {
                    info!(connection_id = %conn.connection_id(), "Transport reconnected");
                    return Ok(Some(conn));
                }
                Err(e) => {
                    warn!(attempt, "Reconnect failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::ConnectionError("transport connection lost".to_string())
        }))
    }
}

#[async_trait]
impl Forwarder for WebSocketForwarder {
    async fn forward(
        &self,
        target: ForwardTarget,
        cancel: CancellationToken,
        errors: mpsc::Sender<TransportError>,
    ) -> TransportResult<()> {
        let listener = TcpListener::bind(&target.local_addr)
            .await
            .map_err(|source| TransportError::BindError {
                address: target.local_addr.clone(),
                source,
            })?;

        let mut conn = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            conn = self.connect(&target) => Arc::new(conn?),
        };

        info!(
            local_addr = %target.local_addr,
            remote_addr = %target.remote_addr,
            connection_id = %conn.connection_id(),
            "Forwarding"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(local_addr = %target.local_addr, "Forward canceled");
                    conn.close();
                    return Ok(());
                }
                _ = conn.closed() => {
                    warn!(local_addr = %target.local_addr, "Transport connection lost");
                    let _ = errors
                        .send(TransportError::ConnectionError("transport connection lost".to_string()))
                        .await;

                    match self.reconnect(&target, &cancel).await? {
                        Some(new_conn) => conn = Arc::new(new_conn),
                        None => return Ok(()),
                    }
                }
                accepted = listener.accept() => {
                    let (socket, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(local_addr = %target.local_addr, "Failed to accept connection: {}", e);
                            let _ = errors.send(TransportError::IoError(e)).await;
                            continue;
                        }
                    };
                    debug!(peer_addr = %peer_addr, "Accepted local connection");

                    let conn = conn.clone();
                    let remote_addr = target.remote_addr.clone();
                    let cancel = cancel.clone();
                    let errors = errors.clone();
                    let read_buffer = self.config.read_buffer_size;

                    tokio::spawn(async move {
                        let result = tokio::select! {
                            _ = cancel.cancelled() => return,
                            result = carry(socket, &conn, &remote_addr, read_buffer) => result,
                        };
                        match result {
                            Ok((sent, received)) => {
                                debug!(
                                    peer_addr = %peer_addr,
                                    bytes_sent = sent,
                                    bytes_received = received,
                                    "Connection closed"
                                );
                            }
                            Err(e) => {
                                let _ = errors.send(e).await;
                            }
                        }
                    });
                }
            }
        }
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

/// Carry one local connection over a fresh stream.
/// Returns bytes sent to and received from the remote side.
async fn carry(
    socket: TcpStream,
    conn: &MuxConnection,
    remote_addr: &str,
    read_buffer: usize,
) -> TransportResult<(u64, u64)> {
    let stream = conn.open_stream(remote_addr).await?;
    pipe(socket, stream, read_buffer).await
}

async fn pipe(
    socket: TcpStream,
    stream: MuxStream,
    read_buffer: usize,
) -> TransportResult<(u64, u64)> {
    let (mut local_read, mut local_write) = socket.into_split();
    let (mut send, mut recv) = stream.split();

    let upstream = async {
        let mut buf = vec![0u8; read_buffer];
        let mut total = 0u64;
        loop {
            let n = local_read.read(&mut buf).await?;
            if n == 0 {
                send.finish().await?;
                break;
            }
            send.send(&buf[..n]).await?;
            total += n as u64;
        }
        Ok::<u64, TransportError>(total)
    };

    let downstream = async {
        let mut total = 0u64;
        while let Some(data) = recv.recv().await {
            local_write.write_all(&data).await?;
            total += data.len() as u64;
        }
        let _ = local_write.shutdown().await;
        Ok::<u64, TransportError>(total)
    };

    let (sent, received) = tokio::join!(upstream, downstream);
    Ok((sent?, received?))
}

/// Map `http(s)` tunnel URLs onto their `ws(s)` equivalents
pub fn websocket_url(server_url: &str) -> TransportResult<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|e| TransportError::ConfigurationError(format!("invalid tunnel URL: {}", e)))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::ConfigurationError(format!(
                "unsupported tunnel URL scheme '{}'",
                other
            )))
        }
    };

    url.set_scheme(scheme).map_err(|_| {
        TransportError::ConfigurationError(format!("cannot use scheme '{}'", scheme))
    })?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("https://t.example.com/tunnel").unwrap().as_str(),
            "wss://t.example.com/tunnel"
        );
        assert_eq!(
            websocket_url("http://127.0.0.1:8080").unwrap().as_str(),
            "ws://127.0.0.1:8080/"
        );
        assert!(websocket_url("ftp://x").is_err());
        assert!(websocket_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let forwarder = WebSocketForwarder::default();
        let (err_tx, _err_rx) = mpsc::channel(1);
        let target = ForwardTarget::new("http://127.0.0.1:1", addr.clone(), "127.0.0.1:80");

        let err = forwarder
            .forward(target, CancellationToken::new(), err_tx)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::BindError { address, .. } if address == addr));
    }
}
