//! Tunnel authentication and per-spec forwarding

use playctl_proto::{CreateTunnelRequest, ForwardingSpec, Play, SpecError};
use playctl_transport::{ForwardTarget, Forwarder, TransportError};
use reqwest::cookie::{CookieStore, Jar};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::api::{ApiError, ControlPlane};
use crate::retry::{RetryError, RetryPolicy};

/// Cookie the login URL sets to authenticate the tunnel transport
pub const DEFAULT_SESSION_COOKIE: &str = "play_session";

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    InvalidSpec(#[from] SpecError),

    #[error("unknown machine '{0}'")]
    UnknownMachine(String),

    #[error("tunnel creation failed: {0}")]
    Create(#[source] ApiError),

    #[error("tunnel creation failed: max retries exceeded ({attempts} attempts): {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("tunnel login failed after {attempts} attempts: {reason}")]
    Login { attempts: u32, reason: String },

    #[error("forward {spec} failed: {source}")]
    Forward {
        spec: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to load persisted port forwards: {0}")]
    ListForwards(#[source] ApiError),

    #[error("context canceled")]
    Canceled,
}

#[derive(Debug, Error)]
enum LoginError {
    #[error("invalid login URL: {0}")]
    InvalidUrl(String),

    #[error("login request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("session cookie '{cookie}' not set (HTTP {status})")]
    CookieMissing {
        cookie: String,
        status: reqwest::StatusCode,
    },
}

/// Tunnel descriptor plus the session cookie authenticating it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    pub url: String,
    pub cookie: String,
}

/// Creates tunnels and exchanges their login URLs for session cookies
#[derive(Clone)]
pub struct TunnelAuthenticator {
    api: Arc<dyn ControlPlane>,
    forwarder: Arc<dyn Forwarder>,
    create_retry: RetryPolicy,
    login_retry: RetryPolicy,
    login_timeout: Duration,
    cookie_name: String,
}

impl std::fmt::Debug for TunnelAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAuthenticator")
            .field("forwarder", &self.forwarder.name())
            .field("create_retry", &self.create_retry)
            .field("login_retry", &self.login_retry)
            .field("cookie_name", &self.cookie_name)
            .finish()
    }
}

impl TunnelAuthenticator {
    pub fn new(api: Arc<dyn ControlPlane>, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            api,
            forwarder,
            create_retry: RetryPolicy::fixed(5, Duration::from_secs(1)),
            login_retry: RetryPolicy::fixed(10, Duration::from_secs(1)),
            login_timeout: Duration::from_secs(10),
            cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
        }
    }

    pub fn with_create_retry(mut self, policy: RetryPolicy) -> Self {
        self.create_retry = policy;
        self
    }

    pub fn with_login_retry(mut self, policy: RetryPolicy) -> Self {
        self.login_retry = policy;
        self
    }

    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    pub fn api(&self) -> &Arc<dyn ControlPlane> {
        &self.api
    }

    /// Private tunnel to `machine` with a login URL
    pub async fn start_tunnel(
        &self,
        cancel: &CancellationToken,
        play_id: &str,
        machine: &str,
    ) -> Result<Tunnel, TunnelError> {
        self.start_tunnel_with(cancel, play_id, CreateTunnelRequest::private(machine))
            .await
    }

    pub async fn start_tunnel_with(
        &self,
        cancel: &CancellationToken,
        play_id: &str,
        request: CreateTunnelRequest,
    ) -> Result<Tunnel, TunnelError> {
        let machine = request.machine.clone();
        info!(play_id, machine = %machine, "Starting tunnel");

        let created = self
            .create_retry
            .run(
                cancel,
                |attempt| {
                    let request = request.clone();
                    async move {
                        debug!(play_id, attempt, "Requesting tunnel");
                        self.api.create_tunnel(play_id, request).await
                    }
                },
                ApiError::is_gateway_timeout,
            )
            .await
            .map_err(|e| match e {
                RetryError::Fatal(source) => TunnelError::Create(source),
                RetryError::Exhausted { attempts, last } => TunnelError::MaxRetriesExceeded {
                    attempts,
                    source: last,
                },
                RetryError::Canceled => TunnelError::Canceled,
            })?;

        let cookie = self.login(cancel, &created.login_url).await?;
        debug!(play_id, machine = %machine, "Tunnel session established");

        Ok(Tunnel {
            play_id: play_id.to_string(),
            machine,
            handle: TunnelHandle {
                url: created.url,
                cookie,
            },
            cookie_name: self.cookie_name.clone(),
            forwarder: self.forwarder.clone(),
        })
    }

    /// GET the login URL until it sets the session cookie
    async fn login(&self, cancel: &CancellationToken, login_url: &str) -> Result<String, TunnelError> {
        let url = Url::parse(login_url).map_err(|e| TunnelError::Login {
            attempts: 0,
            reason: LoginError::InvalidUrl(e.to_string()).to_string(),
        })?;

        self.login_retry
            .run(cancel, |attempt| self.fetch_cookie(&url, attempt), |_| true)
            .await
            .map_err(|e| match e {
                RetryError::Fatal(last) => TunnelError::Login {
                    attempts: 1,
                    reason: last.to_string(),
                },
                RetryError::Exhausted { attempts, last } => TunnelError::Login {
                    attempts,
                    reason: last.to_string(),
                },
                RetryError::Canceled => TunnelError::Canceled,
            })
    }

    async fn fetch_cookie(&self, url: &Url, attempt: u32) -> Result<String, LoginError> {
        // Fresh jar per attempt so a redirect chain's cookies are all captured
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .timeout(self.login_timeout)
            .build()
            .map_err(LoginError::Request)?;

        debug!(attempt, "Exchanging login URL for session cookie");
        let response = http
            .get(url.clone())
            .send()
            .await
            .map_err(LoginError::Request)?;
        let status = response.status();

        let from_response = response
            .cookies()
            .find(|c| c.name() == self.cookie_name)
            .map(|c| c.value().to_string());

        from_response
            .or_else(|| find_cookie(jar.as_ref(), url, &self.cookie_name))
            .or_else(|| find_cookie(jar.as_ref(), response.url(), &self.cookie_name))
            .ok_or_else(|| LoginError::CookieMissing {
                cookie: self.cookie_name.clone(),
                status,
            })
    }
}

fn find_cookie(jar: &Jar, url: &Url, name: &str) -> Option<String> {
    let header = jar.cookies(url)?;
    let header = header.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Pick the requested machine, or the play's first one
pub fn resolve_machine<'a>(
    play: &'a Play,
    machine: Option<&str>,
) -> Result<&'a playctl_proto::Machine, TunnelError> {
    match machine {
        Some(name) => play
            .machine(name)
            .ok_or_else(|| TunnelError::UnknownMachine(name.to_string())),
        None => play
            .default_machine()
            .ok_or_else(|| TunnelError::UnknownMachine("<default>".to_string())),
    }
}

/// An authenticated tunnel to one playground machine
#[derive(Debug)]
pub struct Tunnel {
    play_id: String,
    machine: String,
    handle: TunnelHandle,
    cookie_name: String,
    forwarder: Arc<dyn Forwarder>,
}

impl Tunnel {
    pub fn new(
        play_id: impl Into<String>,
        machine: impl Into<String>,
        handle: TunnelHandle,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        Self {
            play_id: play_id.into(),
            machine: machine.into(),
            handle,
            cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
            forwarder,
        }
    }

    pub fn play_id(&self) -> &str {
        &self.play_id
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn handle(&self) -> &TunnelHandle {
        &self.handle
    }

    /// Carry one spec over this tunnel until `cancel` fires or the
    /// transport fails. Steady-state stream errors arrive on `errors`.
    pub async fn forward(
        &self,
        cancel: CancellationToken,
        spec: &ForwardingSpec,
        errors: mpsc::Sender<TransportError>,
    ) -> Result<(), TunnelError> {
        let target = ForwardTarget::new(&self.handle.url, spec.local_addr(), spec.remote_addr())
            .with_header(
                "Cookie",
                format!("{}={}", self.cookie_name, self.handle.cookie),
            );

        info!(
            play_id = %self.play_id,
            machine = %self.machine,
            transport = self.forwarder.name(),
            "Forwarding {}",
            spec
        );

        self.forwarder
            .forward(target, cancel, errors)
            .await
            .map_err(|source| TunnelError::Forward {
                spec: spec.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockControlPlane;
    use crate::test_support::{start_login_server, RecordingForwarder};
    use playctl_proto::CreateTunnelResponse;
    use reqwest::StatusCode;

    fn gateway_timeout() -> ApiError {
        ApiError::Status {
            path: "/plays/p1/tunnels".to_string(),
            status: StatusCode::GATEWAY_TIMEOUT,
            body: String::new(),
        }
    }

    fn tunnel_response(login_url: String) -> CreateTunnelResponse {
        CreateTunnelResponse {
            url: "https://tunnel.example.com/t/abc".to_string(),
            login_url,
        }
    }

    fn authenticator(api: MockControlPlane, forwarder: Arc<dyn Forwarder>) -> TunnelAuthenticator {
        TunnelAuthenticator::new(Arc::new(api), forwarder)
            .with_create_retry(RetryPolicy::fixed(5, Duration::from_millis(1)))
            .with_login_retry(RetryPolicy::fixed(10, Duration::from_millis(5)))
    }

    #[tokio::test]
    async fn test_login_succeeds_on_tenth_attempt() {
        let server = start_login_server(9).await;
        let login_url = server.login_url();

        let mut api = MockControlPlane::new();
        api.expect_create_tunnel()
            .withf(|_, req| req.machine == "dev" && req.generate_login_url)
            .times(1)
            .returning(move |_, _| Ok(tunnel_response(login_url.clone())));

        let auth = authenticator(api, Arc::new(RecordingForwarder::default()));
        let tunnel = auth
            .start_tunnel(&CancellationToken::new(), "p1", "dev")
            .await
            .unwrap();

        assert_eq!(tunnel.handle().cookie, "cookie-123");
        assert_eq!(tunnel.handle().url, "https://tunnel.example.com/t/abc");
        assert_eq!(server.hits(), 10);
    }

    #[tokio::test]
    async fn test_login_fails_after_ten_attempts() {
        let server = start_login_server(10).await;
        let login_url = server.login_url();

        let mut api = MockControlPlane::new();
        api.expect_create_tunnel()
            .returning(move |_, _| Ok(tunnel_response(login_url.clone())));

        let auth = authenticator(api, Arc::new(RecordingForwarder::default()));
        let err = auth
            .start_tunnel(&CancellationToken::new(), "p1", "dev")
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Login { attempts: 10, .. }), "{}", err);
        assert_eq!(server.hits(), 10);
    }

    #[tokio::test]
    async fn test_gateway_timeout_is_retried() {
        let server = start_login_server(0).await;
        let login_url = server.login_url();

        let mut calls = 0;
        let mut api = MockControlPlane::new();
        api.expect_create_tunnel().times(3).returning(move |_, _| {
            calls += 1;
            if calls < 3 {
                Err(gateway_timeout())
            } else {
                Ok(tunnel_response(login_url.clone()))
            }
        });

        let auth = authenticator(api, Arc::new(RecordingForwarder::default()));
        assert!(auth
            .start_tunnel(&CancellationToken::new(), "p1", "dev")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_gateway_timeout_exhausts_retries() {
        let mut api = MockControlPlane::new();
        api.expect_create_tunnel()
            .times(5)
            .returning(|_, _| Err(gateway_timeout()));

        let auth = authenticator(api, Arc::new(RecordingForwarder::default()));
        let err = auth
            .start_tunnel(&CancellationToken::new(), "p1", "dev")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::MaxRetriesExceeded { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn test_other_api_errors_are_fatal() {
        let mut api = MockControlPlane::new();
        api.expect_create_tunnel().times(1).returning(|_, _| {
            Err(ApiError::Status {
                path: "/plays/p1/tunnels".to_string(),
                status: StatusCode::FORBIDDEN,
                body: "no access".to_string(),
            })
        });

        let auth = authenticator(api, Arc::new(RecordingForwarder::default()));
        let err = auth
            .start_tunnel(&CancellationToken::new(), "p1", "dev")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Create(ApiError::Status { .. })));
    }

    #[tokio::test]
    async fn test_forward_attaches_session_cookie() {
        let forwarder = Arc::new(RecordingForwarder::default());
        let tunnel = Tunnel::new(
            "p1",
            "dev",
            TunnelHandle {
                url: "https://tunnel.example.com".to_string(),
                cookie: "abc".to_string(),
            },
            forwarder.clone(),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (err_tx, _err_rx) = mpsc::channel(1);
        let spec = ForwardingSpec::parse("9000:redis:6379").unwrap();
        tunnel.forward(cancel, &spec, err_tx).await.unwrap();

        let targets = forwarder.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].local_addr, "127.0.0.1:9000");
        assert_eq!(targets[0].remote_addr, "redis:6379");
        assert_eq!(targets[0].header("cookie"), Some("play_session=abc"));
    }

    #[test]
    fn test_resolve_machine() {
        let play: Play = serde_json::from_value(serde_json::json!({
            "id": "p1",
            "machines": [{"name": "dev"}, {"name": "node-01"}]
        }))
        .unwrap();

        assert_eq!(resolve_machine(&play, None).unwrap().name, "dev");
        assert_eq!(resolve_machine(&play, Some("node-01")).unwrap().name, "node-01");
        assert!(matches!(
            resolve_machine(&play, Some("nope")),
            Err(TunnelError::UnknownMachine(name)) if name == "nope"
        ));
    }
}
