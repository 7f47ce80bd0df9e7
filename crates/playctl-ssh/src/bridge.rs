//! SSH over a tunnel forward, bridged to the local terminal

use playctl_client::{
    resolve_machine, RetryError, RetryPolicy, TunnelAuthenticator, TunnelError,
};
use playctl_proto::{CreateTunnelRequest, ForwardingSpec, Machine, Play, SSH_PORT};
use russh::client::{self, AuthResult, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::SshIdentity;
use crate::terminal::{next_resize, Terminal};
use crate::SshError;

/// Exit code reported when the remote side closes without a status
const MISSING_EXIT_STATUS: u32 = 255;

/// Input chunks buffered between the stdin thread and the session
const STDIN_QUEUE: usize = 16;

/// Accepts any host key: the tunnel already authenticates and encrypts
/// the path to the machine.
struct TunnelHostKeys;

impl client::Handler for TunnelHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Resolve the machine and login user, validating an explicit user
pub fn resolve_login<'a>(
    play: &'a Play,
    machine: Option<&str>,
    user: Option<&str>,
) -> Result<(&'a Machine, String), SshError> {
    let machine = resolve_machine(play, machine)?;
    let user = match user {
        Some(user) if !machine.users.is_empty() && !machine.has_user(user) => {
            return Err(SshError::UnknownUser {
                machine: machine.name.clone(),
                user: user.to_string(),
            })
        }
        Some(user) => user.to_string(),
        None => machine.default_user().to_string(),
    };
    Ok((machine, user))
}

/// Dial the forward's local end, absorbing its startup latency
pub async fn dial_local(
    cancel: &CancellationToken,
    addr: &str,
    policy: &RetryPolicy,
) -> Result<TcpStream, SshError> {
    policy
        .run(
            cancel,
            |attempt| async move {
                debug!(addr, attempt, "Dialing forwarded SSH port");
                TcpStream::connect(addr).await
            },
            |_| true,
        )
        .await
        .map_err(|e| match e {
            RetryError::Canceled => SshError::Canceled,
            RetryError::Exhausted { attempts, last } => SshError::Dial {
                addr: addr.to_string(),
                attempts,
                source: last,
            },
            RetryError::Fatal(source) => SshError::Dial {
                addr: addr.to_string(),
                attempts: 1,
                source,
            },
        })
}

/// Opens SSH sessions to playground machines
#[derive(Clone)]
pub struct SshBridge {
    authenticator: Arc<TunnelAuthenticator>,
    identity: SshIdentity,
    dial_retry: RetryPolicy,
    config: Arc<client::Config>,
}

impl std::fmt::Debug for SshBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshBridge")
            .field("identity", &self.identity)
            .field("dial_retry", &self.dial_retry)
            .finish()
    }
}

impl SshBridge {
    pub fn new(authenticator: Arc<TunnelAuthenticator>, identity: SshIdentity) -> Self {
        Self {
            authenticator,
            identity,
            dial_retry: RetryPolicy::fixed(10, Duration::from_millis(500)),
            config: Arc::new(client::Config::default()),
        }
    }

    pub fn with_dial_retry(mut self, policy: RetryPolicy) -> Self {
        self.dial_retry = policy;
        self
    }

    /// Tunnel to the machine's SSH port, forward it locally, and log in.
    ///
    /// The returned session owns the forward; dropping or closing it stops
    /// the forward.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        play: &Play,
        machine: Option<&str>,
        user: Option<&str>,
    ) -> Result<SshSession, SshError> {
        let (machine, user) = resolve_login(play, machine, user)?;
        info!(play_id = %play.id, machine = %machine.name, user = %user, "Opening SSH session");

        let request = CreateTunnelRequest::private(&machine.name)
            .with_port(SSH_PORT)
            .with_ssh(&user, self.identity.public_key());
        let tunnel = self
            .authenticator
            .start_tunnel_with(cancel, &play.id, request)
            .await?;

        let spec = ForwardingSpec::parse(&SSH_PORT.to_string()).map_err(TunnelError::from)?;
        let local_addr = spec.local_addr();
        let forward_cancel = cancel.child_token();
        let (err_tx, mut err_rx) = mpsc::channel(16);

        let mut forward = tokio::spawn({
            let cancel = forward_cancel.clone();
            async move { tunnel.forward(cancel, &spec, err_tx).await }
        });
        tokio::spawn(async move {
            while let Some(err) = err_rx.recv().await {
                warn!("SSH forward error: {}", err);
            }
        });

        let stream = tokio::select! {
            stream = dial_local(cancel, &local_addr, &self.dial_retry) => stream,
            ended = &mut forward => {
                let err = match ended {
                    Ok(Err(e)) => SshError::Tunnel(e),
                    Ok(Ok(())) => SshError::Canceled,
                    Err(e) => SshError::Io(std::io::Error::other(e)),
                };
                return Err(err);
            }
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                forward_cancel.cancel();
                return Err(e);
            }
        };

        let handle = match handshake(self.config.clone(), &self.identity, stream, &user).await {
            Ok(handle) => handle,
            Err(e) => {
                forward_cancel.cancel();
                return Err(e);
            }
        };

        Ok(SshSession {
            handle,
            forward: Some(forward),
            forward_cancel,
        })
    }
}

/// SSH handshake and public-key login over an established connection
async fn handshake(
    config: Arc<client::Config>,
    identity: &SshIdentity,
    stream: TcpStream,
    user: &str,
) -> Result<Handle<TunnelHostKeys>, SshError> {
    let mut handle = client::connect_stream(config, stream, TunnelHostKeys)
        .await
        .map_err(SshError::Handshake)?;

    let key = PrivateKeyWithHashAlg::new(
        identity.private_key(),
        handle
            .best_supported_rsa_hash()
            .await
            .map_err(SshError::Handshake)?
            .flatten(),
    );

    match handle
        .authenticate_publickey(user, key)
        .await
        .map_err(SshError::Handshake)?
    {
        AuthResult::Success => {
            debug!(user, "SSH authentication successful");
            Ok(handle)
        }
        AuthResult::Failure { .. } => Err(SshError::AuthRejected(user.to_string())),
    }
}

/// Read stdin on a plain thread. A blocking read cannot be interrupted, and
/// a runtime blocking task would hold up runtime shutdown until the next
/// keypress; a detached thread does not.
fn spawn_stdin_reader() -> Result<mpsc::Receiver<Vec<u8>>, SshError> {
    let (tx, rx) = mpsc::channel(STDIN_QUEUE);
    std::thread::Builder::new()
        .name("playctl-stdin".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 8192];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// An authenticated SSH connection riding its own tunnel forward
pub struct SshSession {
    handle: Handle<TunnelHostKeys>,
    forward: Option<JoinHandle<Result<(), TunnelError>>>,
    forward_cancel: CancellationToken,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field(
                "forward_running",
                &self.forward.as_ref().is_some_and(|f| !f.is_finished()),
            )
            .finish()
    }
}

impl SshSession {
    /// Run `command`, or an interactive shell when `None`, bridged to the
    /// process's stdio. Returns the remote exit status.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        terminal: &Terminal,
        command: Option<&str>,
    ) -> Result<u32, SshError> {
        let stdin = spawn_stdin_reader()?;
        self.run_with_io(
            cancel,
            terminal,
            command,
            stdin,
            tokio::io::stdout(),
            tokio::io::stderr(),
        )
        .await
    }

    /// Like [`SshSession::run`], with input chunks read from `stdin` until
    /// its senders are gone, which sends EOF to the remote side
    pub async fn run_with_io<O, E>(
        &self,
        cancel: &CancellationToken,
        terminal: &Terminal,
        command: Option<&str>,
        mut stdin: mpsc::Receiver<Vec<u8>>,
        mut stdout: O,
        mut stderr: E,
    ) -> Result<u32, SshError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::Channel)?;

        let mut resize = None;
        let _raw_mode = if terminal.is_interactive() {
            let (cols, rows) = terminal.size();
            channel
                .request_pty(
                    false,
                    &terminal.term_name(),
                    u32::from(cols),
                    u32::from(rows),
                    0,
                    0,
                    &[],
                )
                .await
                .map_err(SshError::Channel)?;
            resize = Some(
                terminal
                    .watch_resize(cancel.child_token())
                    .map_err(SshError::Terminal)?,
            );
            Some(terminal.raw_mode().map_err(SshError::Terminal)?)
        } else {
            None
        };

        let started = match command {
            Some(command) => channel.exec(true, command).await,
            None => channel.request_shell(true).await,
        };
        started.map_err(SshError::Channel)?;

        let mut stdin_open = true;
        let mut exit_status = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if exit_status.is_none() {
                        return Err(SshError::ForciblyClosed);
                    }
                    break;
                }
                input = stdin.recv(), if stdin_open => match input {
                    Some(data) => channel.data(&data[..]).await.map_err(SshError::Channel)?,
                    None => {
                        stdin_open = false;
                        channel.eof().await.map_err(SshError::Channel)?;
                    }
                },
                Some((cols, rows)) = next_resize(&mut resize) => {
                    channel
                        .window_change(u32::from(cols), u32::from(rows), 0, 0)
                        .await
                        .map_err(SshError::Channel)?;
                }
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        stdout.write_all(data).await?;
                        stdout.flush().await?;
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                        stderr.write_all(data).await?;
                        stderr.flush().await?;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                        debug!(status, "Remote process exited");
                        exit_status = Some(status);
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
            }
        }

        Ok(exit_status.unwrap_or_else(|| {
            warn!("Remote session ended without an exit status");
            MISSING_EXIT_STATUS
        }))
    }

    /// Disconnect and stop the forward
    pub async fn close(mut self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        self.forward_cancel.cancel();
        if let Some(forward) = self.forward.take() {
            let _ = forward.await;
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.forward_cancel.cancel();
    }
}
