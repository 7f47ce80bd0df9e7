//! A virtual stream over a multiplexed WebSocket connection

use bytes::Bytes;
use playctl_transport::{TransportError, TransportResult};
use tokio::sync::mpsc;
use tracing::trace;

use crate::frame::Frame;

/// One carried connection. Split it to drive both directions concurrently.
#[derive(Debug)]
pub struct MuxStream {
    send: MuxSendHalf,
    recv: MuxRecvHalf,
}

impl MuxStream {
    pub(crate) fn new(stream_id: u32, rx: mpsc::Receiver<Bytes>, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            send: MuxSendHalf {
                stream_id,
                tx,
                finished: false,
            },
            recv: MuxRecvHalf { stream_id, rx },
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.send.stream_id
    }

    pub async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        self.send.send(data).await
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.recv.recv().await
    }

    pub async fn finish(&mut self) -> TransportResult<()> {
        self.send.finish().await
    }

    pub fn split(self) -> (MuxSendHalf, MuxRecvHalf) {
        (self.send, self.recv)
    }
}

#[derive(Debug)]
pub struct MuxSendHalf {
    stream_id: u32,
    tx: mpsc::Sender<Vec<u8>>,
    finished: bool,
}

impl MuxSendHalf {
    pub async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.finished {
            return Err(TransportError::StreamClosed);
        }
        trace!(stream_id = self.stream_id, len = data.len(), "Sending data frame");
        self.tx
            .send(Frame::data(self.stream_id, data).encode())
            .await
            .map_err(|_| TransportError::ConnectionError("WebSocket send failed".to_string()))
    }

    /// Half-close the stream. Idempotent.
    pub async fn finish(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        // Ignore error if connection is already closed
        let _ = self.tx.send(Frame::fin(self.stream_id).encode()).await;
        Ok(())
    }
}

/// Receiving half. The connection closes the stream by dropping its
/// sender, so chunks of any length, empty ones included, are data.
#[derive(Debug)]
pub struct MuxRecvHalf {
    stream_id: u32,
    rx: mpsc::Receiver<Bytes>,
}

impl MuxRecvHalf {
    /// Next chunk from the far side, `None` once it finished or the
    /// connection went away
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}
