//! Session event stream (task-state client)
//!
//! A [`PlayConn`] holds one event connection for a play. Its reader task is
//! the only writer of the shared [`Play`]: every task update is applied
//! under the write lock and only then announced to waiters, so a waiter
//! that wakes up always sees the update it was told about.
//!
//! ```text
//! Idle ──start──> Connecting ──dial ok──> Streaming ──normal close──> Closed
//!                     │                       │
//!                     └──retries exhausted──> Failed <──unexpected close/read error
//! ```

use futures_util::StreamExt;
use playctl_proto::{ConnMessage, InitProgress, MessageError, Play, PlayTask};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::api::{ApiError, ControlPlane};
use crate::retry::{RetryError, RetryPolicy};

/// A play shared between the event stream's reader and its waiters
pub type SharedPlay = Arc<RwLock<Play>>;

type EventSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("failed to request event connection: {0}")]
    Descriptor(#[source] ApiError),

    #[error("invalid event connection URL: {0}")]
    InvalidUrl(String),

    #[error("event stream dial failed after {attempts} attempts: {source}")]
    Dial {
        attempts: u32,
        #[source]
        source: tungstenite::Error,
    },

    #[error("canceled while retrying event stream dial")]
    CanceledWhileRetrying,

    #[error("event stream closed unexpectedly: {0}")]
    UnexpectedClose(String),

    #[error("event stream read failed: {0}")]
    Read(#[source] tungstenite::Error),

    #[error("malformed event stream message: {0}")]
    Decode(#[from] MessageError),

    #[error("timed out after {0:?} waiting for the play")]
    Timeout(Duration),

    #[error("event stream not started")]
    NotStarted,

    #[error("event stream closed")]
    Closed,

    #[error("context canceled")]
    Canceled,
}

impl ConnError {
    /// Errors that end the event stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnError::UnexpectedClose(_) | ConnError::Read(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Streaming,
    Closed,
    Failed,
}

/// How a play ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PlayConnConfig {
    pub dial_retry: RetryPolicy,
    pub message_buffer: usize,
    pub error_buffer: usize,
}

impl Default for PlayConnConfig {
    fn default() -> Self {
        Self {
            dial_retry: RetryPolicy::exponential(
                10,
                Duration::from_millis(500),
                Duration::from_secs(5),
            ),
            message_buffer: 64,
            error_buffer: 16,
        }
    }
}

impl PlayConnConfig {
    pub fn with_dial_retry(mut self, policy: RetryPolicy) -> Self {
        self.dial_retry = policy;
        self
    }
}

struct Channels {
    updates: mpsc::Receiver<PlayTask>,
    errors: mpsc::Receiver<ConnError>,
}

/// Client side of a play's task-update event stream
pub struct PlayConn {
    play: SharedPlay,
    config: PlayConnConfig,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConnState>>,
    /// Waiters serialise on this lock
    channels: Mutex<Option<Channels>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PlayConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayConn")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl PlayConn {
    pub fn new(play: SharedPlay) -> Self {
        Self::with_config(play, PlayConnConfig::default())
    }

    pub fn with_config(play: SharedPlay, config: PlayConnConfig) -> Self {
        let (state, _) = watch::channel(ConnState::Idle);
        Self {
            play,
            config,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
            channels: Mutex::new(None),
            reader: std::sync::Mutex::new(None),
        }
    }

    pub fn play(&self) -> &SharedPlay {
        &self.play
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnState> {
        self.state.subscribe()
    }

    /// Request an event connection for the play and start reading it.
    ///
    /// The stream lives until `cancel` fires or [`PlayConn::close`] is called.
    pub async fn start(
        &mut self,
        cancel: &CancellationToken,
        api: &dyn ControlPlane,
        origin: &str,
    ) -> Result<(), ConnError> {
        self.cancel = cancel.child_token();
        self.state.send_replace(ConnState::Connecting);

        let result = self.connect(api, origin).await;
        let socket = match result {
            Ok(socket) => socket,
            Err(e) => {
                self.state.send_replace(ConnState::Failed);
                return Err(e);
            }
        };

        let (update_tx, updates) = mpsc::channel(self.config.message_buffer);
        let (error_tx, errors) = mpsc::channel(self.config.error_buffer);
        *self.channels.get_mut() = Some(Channels { updates, errors });

        self.state.send_replace(ConnState::Streaming);
        let reader = tokio::spawn(read_loop(
            socket,
            self.play.clone(),
            update_tx,
            error_tx,
            self.state.clone(),
            self.cancel.clone(),
        ));
        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(reader);
        }
        Ok(())
    }

    async fn connect(&self, api: &dyn ControlPlane, origin: &str) -> Result<EventSocket, ConnError> {
        let play_id = self.play.read().await.id.clone();
        let descriptor = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ConnError::Canceled),
            descriptor = api.create_play_conn(&play_id) => descriptor.map_err(ConnError::Descriptor)?,
        };

        let url = descriptor.url;
        url.as_str()
            .into_client_request()
            .map_err(|e| ConnError::InvalidUrl(e.to_string()))?;
        let origin = HeaderValue::from_str(origin)
            .map_err(|e| ConnError::InvalidUrl(format!("invalid origin: {}", e)))?;

        info!(play_id = %play_id, "Opening event stream");
        self.config
            .dial_retry
            .run(
                &self.cancel,
                |attempt| {
                    let url = url.as_str();
                    let origin = origin.clone();
                    let play_id = play_id.as_str();
                    async move {
                        debug!(play_id, attempt, "Dialing event stream");
                        let mut request = url.into_client_request()?;
                        request.headers_mut().insert("Origin", origin);
                        tokio_tungstenite::connect_async(request)
                            .await
                            .map(|(socket, _)| socket)
                    }
                },
                |_| true,
            )
            .await
            .map_err(|e| match e {
                RetryError::Canceled => ConnError::CanceledWhileRetrying,
                RetryError::Exhausted { attempts, last } => ConnError::Dial {
                    attempts,
                    source: last,
                },
                RetryError::Fatal(source) => ConnError::Dial {
                    attempts: 1,
                    source,
                },
            })
    }

    /// Wait until every init task is completed
    pub async fn wait_play_ready(&self, timeout: Duration) -> Result<(), ConnError> {
        self.wait_play_ready_with_progress(timeout, |_| {}).await
    }

    /// Like [`PlayConn::wait_play_ready`], reporting init progress after
    /// every update
    pub async fn wait_play_ready_with_progress<F>(
        &self,
        timeout: Duration,
        mut progress: F,
    ) -> Result<(), ConnError>
    where
        F: FnMut(InitProgress),
    {
        let wait = self.wait_for(|play| {
            progress(play.init_progress());
            play.is_initialized().then_some(())
        });

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ConnError::Timeout(timeout))?
    }

    /// Wait until the play is completable or any task failed.
    /// Bounded only by cancellation.
    pub async fn wait_done(&self) -> Result<PlayOutcome, ConnError> {
        self.wait_for(|play| {
            if play.is_failed() {
                Some(PlayOutcome::Failed)
            } else if play.is_completable() {
                Some(PlayOutcome::Completed)
            } else {
                None
            }
        })
        .await
    }

    async fn wait_for<T, F>(&self, mut check: F) -> Result<T, ConnError>
    where
        F: FnMut(&Play) -> Option<T>,
    {
        let mut guard = self.channels.lock().await;
        let channels = guard.as_mut().ok_or(ConnError::NotStarted)?;

        loop {
            if let Some(done) = check(&*self.play.read().await) {
                return Ok(done);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConnError::Canceled),
                Some(err) = channels.errors.recv() => {
                    if err.is_terminal() {
                        return Err(err);
                    }
                    warn!("Event stream error: {}", err);
                }
                update = channels.updates.recv() => match update {
                    Some(task) => trace!(task = %task.name, status = ?task.status, "Task updated"),
                    None => return Err(drain_terminal_error(&mut channels.errors)),
                },
            }
        }
    }

    /// Stop the reader, close the socket and drop both channels
    pub async fn close(&self) {
        self.cancel.cancel();

        let reader = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(reader) = reader {
            let _ = reader.await;
        }

        self.channels.lock().await.take();
        if self.state() != ConnState::Failed {
            self.state.send_replace(ConnState::Closed);
        }
    }
}

impl Drop for PlayConn {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    mut socket: EventSocket,
    play: SharedPlay,
    updates: mpsc::Sender<PlayTask>,
    errors: mpsc::Sender<ConnError>,
    state: Arc<watch::Sender<ConnState>>,
    cancel: CancellationToken,
) {
    let play_id = play.read().await.id.clone();

    let final_state = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = socket.close(None).await;
                break ConnState::Closed;
            }
            message = socket.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                handle_message(text.as_bytes(), &play, &updates, &errors).await
            }
            Some(Ok(Message::Binary(data))) => handle_message(&data, &play, &updates, &errors).await,
            Some(Ok(Message::Close(frame))) => {
                if is_normal_close(frame.as_ref()) {
                    debug!(play_id = %play_id, "Event stream closed");
                    break ConnState::Closed;
                }
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                    .unwrap_or_default();
                push_error(&errors, ConnError::UnexpectedClose(reason));
                break ConnState::Failed;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                push_error(&errors, ConnError::Read(e));
                break ConnState::Failed;
            }
            None => {
                push_error(
                    &errors,
                    ConnError::UnexpectedClose("connection reset without close frame".to_string()),
                );
                break ConnState::Failed;
            }
        }
    };

    debug!(play_id = %play_id, state = ?final_state, "Event stream reader ended");
    state.send_replace(final_state);
}

async fn handle_message(
    data: &[u8],
    play: &SharedPlay,
    updates: &mpsc::Sender<PlayTask>,
    errors: &mpsc::Sender<ConnError>,
) {
    let task = match ConnMessage::decode(data).and_then(ConnMessage::into_task) {
        Ok(Some(task)) => task,
        Ok(None) => {
            trace!("Ignoring non-task event");
            return;
        }
        Err(e) => {
            push_error(errors, e.into());
            return;
        }
    };

    // Overwrite wholesale; versions are not compared
    play.write().await.apply_task(task.clone());

    // Waiters re-read the play, so a dropped notice only matters when the
    // queue is already full of newer ones
    if let Err(mpsc::error::TrySendError::Full(_)) = updates.try_send(task) {
        trace!("Update queue full, waiters will observe the latest state");
    }
}

/// The reader pushes its terminal error before dropping the update sender,
/// so once updates are exhausted the error is already queued.
fn drain_terminal_error(errors: &mut mpsc::Receiver<ConnError>) -> ConnError {
    let mut terminal = None;
    while let Ok(err) = errors.try_recv() {
        if err.is_terminal() && terminal.is_none() {
            terminal = Some(err);
        } else {
            warn!("Event stream error: {}", err);
        }
    }
    terminal.unwrap_or(ConnError::Closed)
}

fn push_error(errors: &mpsc::Sender<ConnError>, err: ConnError) {
    if let Err(mpsc::error::TrySendError::Full(err)) = errors.try_send(err) {
        warn!("Dropping event stream error, queue full: {}", err);
    }
}

fn is_normal_close(frame: Option<&CloseFrame<'_>>) -> bool {
    match frame {
        None => true,
        Some(frame) => matches!(frame.code, CloseCode::Normal | CloseCode::Away),
    }
}
