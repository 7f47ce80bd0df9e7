//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.playctl.dev";

/// Control-plane connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub user_agent: String,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token: None,
            request_timeout: Duration::from_secs(30),
            user_agent: format!("playctl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `base_url` joined with an absolute API path
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ClientConfig::new("http://localhost:8080/")
            .with_access_token("tok")
            .with_request_timeout(Duration::from_secs(5));

        assert_eq!(config.access_token.as_deref(), Some("tok"));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(
            config.endpoint("/plays/p1"),
            "http://localhost:8080/plays/p1"
        );
    }

    #[test]
    fn test_serialization_uses_seconds() {
        let json = serde_json::to_value(ClientConfig::default()).unwrap();
        assert_eq!(json["request_timeout"], 30);
        assert!(json.get("access_token").is_none());

        let parsed: ClientConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.request_timeout, Duration::from_secs(30));
    }
}
