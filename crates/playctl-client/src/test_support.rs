//! Fixtures shared by the unit tests

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use playctl_transport::{ForwardTarget, Forwarder, TransportError, TransportResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Records every target and runs until canceled.
/// Forwards to `fail_remote` fail immediately with a bind error.
#[derive(Debug, Default)]
pub struct RecordingForwarder {
    pub targets: Mutex<Vec<ForwardTarget>>,
    pub fail_remote: Option<String>,
    pub report_error: bool,
}

impl RecordingForwarder {
    pub fn failing(remote_addr: &str) -> Self {
        Self {
            fail_remote: Some(remote_addr.to_string()),
            ..Default::default()
        }
    }

    pub fn targets(&self) -> Vec<ForwardTarget> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward(
        &self,
        target: ForwardTarget,
        cancel: CancellationToken,
        errors: mpsc::Sender<TransportError>,
    ) -> TransportResult<()> {
        self.targets.lock().unwrap().push(target.clone());

        if self.fail_remote.as_deref() == Some(target.remote_addr.as_str()) {
            return Err(TransportError::BindError {
                address: target.local_addr,
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
            });
        }
        if self.report_error {
            let _ = errors.send(TransportError::StreamClosed).await;
        }

        cancel.cancelled().await;
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

pub struct LoginServer {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicU32>,
}

impl LoginServer {
    pub fn login_url(&self) -> String {
        format!("http://{}/login", self.addr)
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct LoginState {
    hits: Arc<AtomicU32>,
    fail_times: u32,
}

async fn login(State(state): State<LoginState>) -> Response {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    if hit <= state.fail_times {
        return (StatusCode::NOT_FOUND, "tunnel not ready").into_response();
    }
    (
        [(header::SET_COOKIE, "play_session=cookie-123; Path=/; HttpOnly")],
        "ok",
    )
        .into_response()
}

/// Login endpoint that fails `fail_times` times before setting the cookie
pub async fn start_login_server(fail_times: u32) -> LoginServer {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new().route("/login", get(login)).with_state(LoginState {
        hits: hits.clone(),
        fail_times,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    LoginServer { addr, hits }
}
