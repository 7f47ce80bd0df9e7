//! Control-plane API client

use async_trait::async_trait;
use playctl_proto::{
    CreateTunnelRequest, CreateTunnelResponse, Play, PlayConnResponse, PortForward,
};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::ClientConfig;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: StatusCode,
        body: String,
    },

    #[error("failed to decode response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ApiError {
    /// Transient gateway timeout, worth retrying
    pub fn is_gateway_timeout(&self) -> bool {
        matches!(self, ApiError::Status { status, .. } if *status == StatusCode::GATEWAY_TIMEOUT)
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Control-plane operations consumed by the connectivity layer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// `GET /plays/{id}`
    async fn get_play(&self, play_id: &str) -> Result<Play, ApiError>;

    /// `POST /plays/{id}/conns`
    async fn create_play_conn(&self, play_id: &str) -> Result<PlayConnResponse, ApiError>;

    /// `POST /plays/{id}/tunnels`
    async fn create_tunnel(
        &self,
        play_id: &str,
        request: CreateTunnelRequest,
    ) -> Result<CreateTunnelResponse, ApiError>;

    /// `GET /plays/{id}/port-forwards`
    async fn list_port_forwards(&self, play_id: &str) -> Result<Vec<PortForward>, ApiError>;
}

/// JSON-over-HTTPS [`ControlPlane`]
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    config: ClientConfig,
    http: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.config.endpoint(path));
        match &self.config.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        builder: RequestBuilder,
    ) -> Result<T, ApiError> {
        debug!(path, "Control-plane request");
        let response = builder.send().await.map_err(|source| ApiError::Request {
            path: path.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                path: path.to_string(),
                status,
                body,
            });
        }

        response.json::<T>().await.map_err(|source| ApiError::Decode {
            path: path.to_string(),
            source,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(path, self.request(Method::GET, path)).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(path, self.request(Method::POST, path).json(body))
            .await
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_play(&self, play_id: &str) -> Result<Play, ApiError> {
        self.get(&format!("/plays/{}", play_id)).await
    }

    async fn create_play_conn(&self, play_id: &str) -> Result<PlayConnResponse, ApiError> {
        self.post(&format!("/plays/{}/conns", play_id), &serde_json::json!({}))
            .await
    }

    async fn create_tunnel(
        &self,
        play_id: &str,
        request: CreateTunnelRequest,
    ) -> Result<CreateTunnelResponse, ApiError> {
        self.post(&format!("/plays/{}/tunnels", play_id), &request)
            .await
    }

    async fn list_port_forwards(&self, play_id: &str) -> Result<Vec<PortForward>, ApiError> {
        self.get(&format!("/plays/{}/port-forwards", play_id)).await
    }
}
