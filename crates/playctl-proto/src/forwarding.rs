//! Port-forwarding specifications
//!
//! A forwarding spec is a colon-separated list of one to four tokens:
//!
//! ```text
//! REMOTE_PORT
//! LOCAL_PORT:REMOTE_PORT
//! REMOTE_HOST:REMOTE_PORT
//! LOCAL_HOST:LOCAL_PORT:REMOTE_PORT
//! LOCAL_PORT:REMOTE_HOST:REMOTE_PORT
//! LOCAL_HOST:LOCAL_PORT:REMOTE_HOST:REMOTE_PORT
//! ```
//!
//! Two- and three-token forms are disambiguated by checking whether the
//! candidate token parses as a base-10 integer.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;

/// Local bind host used when the spec does not name one
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";

/// Range the local port is drawn from when the spec leaves it out.
///
/// Best effort: the transport reports the chosen port before it knows
/// whether the bind actually succeeded.
pub const LOCAL_PORT_RANGE: RangeInclusive<u16> = 30000..=59999;

/// Host dialed on the target machine when the spec has no remote host
const TARGET_MACHINE_HOST: &str = "127.0.0.1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("invalid forwarding spec '{spec}': expected 1 to 4 colon-separated parts, got {parts}")]
    InvalidFormat { spec: String, parts: usize },

    #[error("invalid forwarding spec '{0}': remote port is required")]
    MissingRemotePort(String),
}

/// One local to remote port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingSpec {
    pub local_host: String,
    pub local_port: String,
    pub remote_host: String,
    pub remote_port: String,
}

impl ForwardingSpec {
    /// Parse the compact `[[LOCAL_HOST:]LOCAL_PORT:][REMOTE_HOST:]REMOTE_PORT` grammar
    pub fn parse(s: &str) -> Result<Self, SpecError> {
        let parts: Vec<&str> = s.split(':').collect();

        let mut spec = match parts.as_slice() {
            [remote_port] => Self::with_parts("", "", "", remote_port),
            [first, remote_port] if is_port(first) => Self::with_parts("", first, "", remote_port),
            [remote_host, remote_port] => Self::with_parts("", "", remote_host, remote_port),
            [local_host, second, remote_port] if is_port(second) => {
                Self::with_parts(local_host, second, "", remote_port)
            }
            [local_port, remote_host, remote_port] => {
                Self::with_parts("", local_port, remote_host, remote_port)
            }
            [local_host, local_port, remote_host, remote_port] => {
                Self::with_parts(local_host, local_port, remote_host, remote_port)
            }
            _ => {
                return Err(SpecError::InvalidFormat {
                    spec: s.to_string(),
                    parts: parts.len(),
                })
            }
        };

        if spec.remote_port.is_empty() {
            return Err(SpecError::MissingRemotePort(s.to_string()));
        }

        if spec.local_host.is_empty() {
            spec.local_host = DEFAULT_LOCAL_HOST.to_string();
        }

        if spec.local_port.is_empty() {
            spec.local_port = random_local_port().to_string();
        }

        Ok(spec)
    }

    /// Build a spec from already-separated fields, filling in the same
    /// defaults the parser applies
    pub fn new(
        local_host: Option<&str>,
        local_port: Option<&str>,
        remote_host: Option<&str>,
        remote_port: &str,
    ) -> Self {
        let mut spec = Self::with_parts(
            local_host.unwrap_or_default(),
            local_port.unwrap_or_default(),
            remote_host.unwrap_or_default(),
            remote_port,
        );
        if spec.local_host.is_empty() {
            spec.local_host = DEFAULT_LOCAL_HOST.to_string();
        }
        if spec.local_port.is_empty() {
            spec.local_port = random_local_port().to_string();
        }
        spec
    }

    fn with_parts(local_host: &str, local_port: &str, remote_host: &str, remote_port: &str) -> Self {
        Self {
            local_host: local_host.to_string(),
            local_port: local_port.to_string(),
            remote_host: remote_host.to_string(),
            remote_port: remote_port.to_string(),
        }
    }

    /// Address the local listener binds to
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// Address dialed from the target machine
    pub fn remote_addr(&self) -> String {
        let host = if self.remote_host.is_empty() {
            TARGET_MACHINE_HOST
        } else {
            self.remote_host.as_str()
        };
        format!("{}:{}", host, self.remote_port)
    }
}

impl FromStr for ForwardingSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ForwardingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local_addr(), self.remote_addr())
    }
}

fn is_port(token: &str) -> bool {
    token.parse::<i64>().is_ok()
}

fn random_local_port() -> u16 {
    rand::thread_rng().gen_range(LOCAL_PORT_RANGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_random_local_port(spec: &ForwardingSpec) {
        let port: u16 = spec.local_port.parse().unwrap();
        assert!(LOCAL_PORT_RANGE.contains(&port), "port {} out of range", port);
    }

    #[test]
    fn test_parse_remote_port_only() {
        let spec = ForwardingSpec::parse("8080").unwrap();
        assert_eq!(spec.remote_host, "");
        assert_eq!(spec.remote_port, "8080");
        assert_eq!(spec.local_host, "127.0.0.1");
        assert_random_local_port(&spec);
    }

    #[test]
    fn test_parse_local_and_remote_port() {
        let spec = ForwardingSpec::parse("9000:8080").unwrap();
        assert_eq!(spec.local_port, "9000");
        assert_eq!(spec.remote_port, "8080");
        assert_eq!(spec.remote_host, "");
        assert_eq!(spec.local_host, DEFAULT_LOCAL_HOST);
    }

    #[test]
    fn test_parse_remote_host_and_port() {
        let spec = ForwardingSpec::parse("example.com:80").unwrap();
        assert_eq!(spec.remote_host, "example.com");
        assert_eq!(spec.remote_port, "80");
        assert_random_local_port(&spec);
    }

    #[test]
    fn test_parse_local_host_local_port_remote_port() {
        let spec = ForwardingSpec::parse("127.0.0.1:9000:8080").unwrap();
        assert_eq!(spec.local_host, "127.0.0.1");
        assert_eq!(spec.local_port, "9000");
        assert_eq!(spec.remote_host, "");
        assert_eq!(spec.remote_port, "8080");
    }

    #[test]
    fn test_parse_local_port_remote_host_remote_port() {
        let spec = ForwardingSpec::parse("9000:example.com:8080").unwrap();
        assert_eq!(spec.local_port, "9000");
        assert_eq!(spec.remote_host, "example.com");
        assert_eq!(spec.remote_port, "8080");
    }

    #[test]
    fn test_parse_full_form() {
        let spec = ForwardingSpec::parse("0.0.0.0:9000:db.internal:5432").unwrap();
        assert_eq!(spec.local_addr(), "0.0.0.0:9000");
        assert_eq!(spec.remote_addr(), "db.internal:5432");
    }

    #[test]
    fn test_parse_too_many_parts() {
        let err = ForwardingSpec::parse("a:b:c:d:e").unwrap_err();
        assert_eq!(
            err,
            SpecError::InvalidFormat {
                spec: "a:b:c:d:e".to_string(),
                parts: 5
            }
        );
    }

    #[test]
    fn test_parse_empty_remote_port() {
        assert!(matches!(
            ForwardingSpec::parse(""),
            Err(SpecError::MissingRemotePort(_))
        ));
        assert!(matches!(
            ForwardingSpec::parse("9000:"),
            Err(SpecError::MissingRemotePort(_))
        ));
    }

    #[test]
    fn test_empty_local_host_defaults_to_loopback() {
        let spec = ForwardingSpec::parse(":9000:8080").unwrap();
        assert_eq!(spec.local_host, DEFAULT_LOCAL_HOST);
        assert_eq!(spec.local_port, "9000");
    }

    #[test]
    fn test_remote_addr_defaults_to_target_machine() {
        let spec = ForwardingSpec::parse("9000:8080").unwrap();
        assert_eq!(spec.remote_addr(), "127.0.0.1:8080");
        assert_eq!(spec.to_string(), "127.0.0.1:9000 -> 127.0.0.1:8080");
    }

    #[test]
    fn test_from_str() {
        let spec: ForwardingSpec = "3000:80".parse().unwrap();
        assert_eq!(spec.local_port, "3000");
    }

    #[test]
    fn test_new_fills_defaults() {
        let spec = ForwardingSpec::new(None, None, Some("redis"), "6379");
        assert_eq!(spec.local_host, DEFAULT_LOCAL_HOST);
        assert_eq!(spec.remote_addr(), "redis:6379");
        assert_random_local_port(&spec);
    }
}
