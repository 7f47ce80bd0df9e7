//! Client side of a multiplexed WebSocket connection

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use playctl_transport::{TransportError, TransportResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};

use crate::frame::{Frame, FrameType};
use crate::stream::MuxStream;

pub(crate) type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

type StreamMap = Arc<RwLock<HashMap<u32, mpsc::Sender<Bytes>>>>;

/// Multiplexed WebSocket connection
pub struct MuxConnection {
    /// Connection ID for logging
    connection_id: String,
    /// Channel for sending frames to WebSocket writer task
    frame_tx: mpsc::Sender<Vec<u8>>,
    /// Maps stream ID to sender for that stream
    streams: StreamMap,
    /// Client-initiated streams use odd IDs
    next_stream_id: AtomicU32,
    stream_buffer: usize,
    /// Fired by the reader task when the connection is gone
    closed: CancellationToken,
    /// Fired locally to make the writer send a close frame
    shutdown: CancellationToken,
}

impl std::fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnection")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl MuxConnection {
    /// Wrap an established WebSocket and start its reader and writer tasks
    pub fn new(ws_stream: WsStream, stream_buffer: usize) -> Self {
        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
        let (ws_sink, ws_source) = ws_stream.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(256);
        let streams: StreamMap = Arc::new(RwLock::new(HashMap::new()));
        let closed = CancellationToken::new();
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::writer_task(
            ws_sink,
            frame_rx,
            shutdown.clone(),
            closed.clone(),
            connection_id.clone(),
        ));
        tokio::spawn(Self::reader_task(
            ws_source,
            streams.clone(),
            closed.clone(),
            connection_id.clone(),
        ));

        Self {
            connection_id,
            frame_tx,
            streams,
            next_stream_id: AtomicU32::new(1),
            stream_buffer,
            closed,
            shutdown,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Open a stream whose far end dials `remote_addr`
    pub async fn open_stream(&self, remote_addr: &str) -> TransportResult<MuxStream> {
        if self.is_closed() {
            return Err(TransportError::ConnectionError(
                "Connection closed".to_string(),
            ));
        }

        // Increment by 2 to stay odd
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        self.streams.write().await.insert(stream_id, tx);

        if self
            .frame_tx
            .send(Frame::open(stream_id, remote_addr).encode())
            .await
            .is_err()
        {
            self.streams.write().await.remove(&stream_id);
            return Err(TransportError::ConnectionError(
                "WebSocket writer stopped".to_string(),
            ));
        }

        debug!(
            connection_id = %self.connection_id,
            stream_id,
            remote_addr,
            "Opened stream"
        );
        Ok(MuxStream::new(stream_id, rx, self.frame_tx.clone()))
    }

    /// Send a close frame and stop the writer
    pub fn close(&self) {
        debug!(connection_id = %self.connection_id, "Closing connection");
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is gone, whoever closed it
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    async fn writer_task(
        mut sink: SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<Vec<u8>>,
        shutdown: CancellationToken,
        closed: CancellationToken,
        conn_id: String,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sink.send(Message::Binary(frame)).await {
                        warn!(connection_id = %conn_id, "WebSocket send error: {}", e);
                        closed.cancel();
                        return;
                    }
                }
            }
        }

        debug!(connection_id = %conn_id, "WebSocket writer task ended");
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }

    async fn reader_task(
        mut source: SplitStream<WsStream>,
        streams: StreamMap,
        closed: CancellationToken,
        conn_id: String,
    ) {
        while let Some(result) = source.next().await {
            match result {
                Ok(Message::Binary(data)) => {
                    let Some(frame) = Frame::decode(&data) else {
                        warn!(connection_id = %conn_id, "Invalid frame received");
                        continue;
                    };
                    trace!(
                        connection_id = %conn_id,
                        stream_id = frame.stream_id,
                        len = frame.payload.len(),
                        "Received frame"
                    );
                    Self::dispatch(&streams, frame, &conn_id).await;
                }
                Ok(Message::Close(_)) => {
                    debug!(connection_id = %conn_id, "WebSocket close received");
                    break;
                }
                Ok(_) => {
                    // Pings are answered by tungstenite, text is ignored
                }
                Err(e) => {
                    warn!(connection_id = %conn_id, "WebSocket read error: {}", e);
                    break;
                }
            }
        }

        debug!(connection_id = %conn_id, "WebSocket reader task ended");
        closed.cancel();

        // Dropping the senders ends every stream after its buffered data
        streams.write().await.clear();
    }

    async fn dispatch(streams: &StreamMap, frame: Frame, conn_id: &str) {
        let tx = streams.read().await.get(&frame.stream_id).cloned();
        let Some(tx) = tx else {
            trace!(connection_id = %conn_id, stream_id = frame.stream_id, "Frame for unknown stream");
            return;
        };

        match frame.frame_type {
            FrameType::Data => {
                if tx.send(frame.payload).await.is_err() {
                    debug!(connection_id = %conn_id, stream_id = frame.stream_id, "Stream receiver dropped");
                    streams.write().await.remove(&frame.stream_id);
                }
            }
            FrameType::Fin => {
                trace!(connection_id = %conn_id, stream_id = frame.stream_id, "Stream finished by peer");
                streams.write().await.remove(&frame.stream_id);
            }
            FrameType::Open => {
                warn!(
                    connection_id = %conn_id,
                    stream_id = frame.stream_id,
                    "Server-initiated streams are not supported"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_data_frame_keeps_stream_open() {
        let streams: StreamMap = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::channel(8);
        streams.write().await.insert(1, tx);
        let (frame_tx, _frame_rx) = mpsc::channel(8);
        let (_send, mut recv) = MuxStream::new(1, rx, frame_tx).split();

        MuxConnection::dispatch(&streams, Frame::data(1, b""), "ws-test").await;
        MuxConnection::dispatch(&streams, Frame::data(1, b"after"), "ws-test").await;
        MuxConnection::dispatch(&streams, Frame::fin(1), "ws-test").await;

        assert_eq!(recv.recv().await.as_deref(), Some(&b""[..]));
        assert_eq!(recv.recv().await.as_deref(), Some(&b"after"[..]));
        assert_eq!(recv.recv().await, None);
        assert!(streams.read().await.is_empty());
    }
}
