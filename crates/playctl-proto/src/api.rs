//! Control-plane request and response bodies

use crate::forwarding::ForwardingSpec;
use serde::{Deserialize, Serialize};

/// `kind` of a persisted forward that maps a local port to the machine
pub const PORT_FORWARD_KIND_LOCAL: &str = "local";

/// Response of `POST /plays/{id}/conns`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayConnResponse {
    pub url: String,
}

/// Who may reach a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelAccess {
    Private,
    Public,
}

/// Body of `POST /plays/{id}/tunnels`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnelRequest {
    pub machine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub access: TunnelAccess,
    pub generate_login_url: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_pub_key: Option<String>,
}

impl CreateTunnelRequest {
    /// Private tunnel to `machine` with a login URL
    pub fn private(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            port: None,
            access: TunnelAccess::Private,
            generate_login_url: true,
            ssh_user: None,
            ssh_pub_key: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_ssh(mut self, user: impl Into<String>, public_key: impl Into<String>) -> Self {
        self.ssh_user = Some(user.into());
        self.ssh_pub_key = Some(public_key.into());
        self
    }
}

/// Response of `POST /plays/{id}/tunnels`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnelResponse {
    pub url: String,
    #[serde(default)]
    pub login_url: String,
}

/// One persisted forward from `GET /plays/{id}/port-forwards`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub kind: String,
    pub machine: String,
    #[serde(default)]
    pub local_host: String,
    #[serde(default)]
    pub local_port: String,
    pub remote_port: String,
    #[serde(default)]
    pub remote_host: String,
}

impl PortForward {
    pub fn is_local(&self) -> bool {
        self.kind == PORT_FORWARD_KIND_LOCAL
    }

    pub fn to_spec(&self) -> ForwardingSpec {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let local_host = non_empty(&self.local_host);
        let local_port = non_empty(&self.local_port);
        let remote_host = non_empty(&self.remote_host);
        ForwardingSpec::new(
            local_host.as_deref(),
            local_port.as_deref(),
            remote_host.as_deref(),
            &self.remote_port,
        )
    }
}
