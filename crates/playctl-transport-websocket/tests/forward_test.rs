//! End-to-end forwarding through a minimal multiplexing tunnel server

use futures_util::{SinkExt, StreamExt};
use playctl_transport::{ForwardTarget, Forwarder, TransportError};
use playctl_transport_websocket::{Frame, FrameType, WebSocketConfig, WebSocketForwarder};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

struct TunnelServer {
    addr: SocketAddr,
    cookies: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

/// Tunnel server that dials the address named by each `open` frame.
/// The first `drop_first` connections are closed right after the handshake.
async fn start_tunnel_server(drop_first: usize) -> TunnelServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cookies = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));

    let server_cookies = cookies.clone();
    let server_connections = connections.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let cookies = server_cookies.clone();
            let index = server_connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    if let Some(cookie) = req.headers().get("cookie") {
                        cookies
                            .lock()
                            .unwrap()
                            .push(cookie.to_str().unwrap().to_string());
                    }
                    Ok(resp)
                };
                let ws = tokio_tungstenite::accept_hdr_async(socket, callback)
                    .await
                    .unwrap();
                if index < drop_first {
                    let (mut sink, _) = ws.split();
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                serve_mux(ws).await;
            });
        }
    });

    TunnelServer {
        addr,
        cookies,
        connections,
    }
}

async fn serve_mux(ws: tokio_tungstenite::WebSocketStream<TcpStream>) {
    let (mut sink, mut source) = ws.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if sink.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut targets: HashMap<u32, OwnedWriteHalf> = HashMap::new();
    while let Some(Ok(msg)) = source.next().await {
        let Message::Binary(data) = msg else { continue };
        let frame = Frame::decode(&data).unwrap();
        match frame.frame_type {
            FrameType::Open => {
                let remote = String::from_utf8(frame.payload.to_vec()).unwrap();
                let (mut read, write) = TcpStream::connect(remote).await.unwrap().into_split();
                targets.insert(frame.stream_id, write);
                let tx = frame_tx.clone();
                let stream_id = frame.stream_id;
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match read.read(&mut buf).await {
                            Ok(0) | Err(_) => {
                                let _ = tx.send(Frame::fin(stream_id).encode()).await;
                                break;
                            }
                            Ok(n) => {
                                let _ = tx.send(Frame::data(stream_id, &buf[..n]).encode()).await;
                            }
                        }
                    }
                });
            }
            FrameType::Data => {
                if let Some(write) = targets.get_mut(&frame.stream_id) {
                    write.write_all(&frame.payload).await.unwrap();
                }
            }
            FrameType::Fin => {
                if let Some(mut write) = targets.remove(&frame.stream_id) {
                    let _ = write.shutdown().await;
                }
            }
        }
    }
}

async fn free_local_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

async fn connect_with_retry(addr: &str) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("local listener {} never came up", addr);
}

async fn echo_roundtrip(addr: &str, payload: &[u8]) -> Vec<u8> {
    let mut client = connect_with_retry(addr).await;
    client.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

#[tokio::test]
async fn test_forward_carries_connections_and_sends_cookie() {
    let echo_addr = start_echo_server().await;
    let server = start_tunnel_server(0).await;
    let local_addr = free_local_addr().await;

    let target = ForwardTarget::new(
        format!("http://{}/tunnel", server.addr),
        local_addr.clone(),
        echo_addr.to_string(),
    )
    .with_header("Cookie", "play_session=secret");

    let cancel = CancellationToken::new();
    let (err_tx, mut err_rx) = mpsc::channel(16);
    let forwarder = WebSocketForwarder::default();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { forwarder.forward(target, cancel, err_tx).await }
    });

    assert_eq!(echo_roundtrip(&local_addr, b"hello").await, b"hello");
    assert_eq!(echo_roundtrip(&local_addr, b"second stream").await, b"second stream");

    assert_eq!(
        server.cookies.lock().unwrap().as_slice(),
        ["play_session=secret".to_string()]
    );
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(err_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_forward_reconnects_after_server_close() {
    let echo_addr = start_echo_server().await;
    let server = start_tunnel_server(1).await;
    let local_addr = free_local_addr().await;

    let target = ForwardTarget::new(
        format!("http://{}", server.addr),
        local_addr.clone(),
        echo_addr.to_string(),
    );

    let config = WebSocketConfig::client_default().with_reconnect(
        3,
        Duration::from_millis(10),
        Duration::from_millis(50),
    );
    let cancel = CancellationToken::new();
    let (err_tx, mut err_rx) = mpsc::channel(16);
    let forwarder = WebSocketForwarder::new(config);
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { forwarder.forward(target, cancel, err_tx).await }
    });

    let err = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, TransportError::ConnectionError(_)));

    assert_eq!(echo_roundtrip(&local_addr, b"after reconnect").await, b"after reconnect");
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_forward_fails_when_server_unreachable() {
    let unreachable = free_local_addr().await;
    let local_addr = free_local_addr().await;
    let target = ForwardTarget::new(format!("http://{}", unreachable), local_addr, "127.0.0.1:80");

    let (err_tx, _err_rx) = mpsc::channel(1);
    let result = WebSocketForwarder::default()
        .forward(target, CancellationToken::new(), err_tx)
        .await;
    assert!(matches!(result, Err(TransportError::ConnectionError(_))));
}
