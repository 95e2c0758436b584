//! Flow descriptors handed in by the enforcement point.
//!
//! `FlowDescriptor` is the loose, deserializable shape (every field optional);
//! `Flow` is the checked form the evaluator works on. Conversion fails fast
//! with `InvalidFlow` instead of guessing a default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{NpdsError, Result};
use crate::model::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

/// HTTP request attributes visible to L7 rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpRequest {
    pub method: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub authority: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl HttpRequest {
    /// Header lookup including the `:method`, `:path`/`:uri` and
    /// `:authority` pseudo-headers. Ordinary names compare case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        match name {
            ":method" => Some(self.method.as_str()),
            ":path" | ":uri" => self.path.as_deref(),
            ":authority" => self.authority.as_deref(),
            _ => self
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
        }
    }
}

/// A checked flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flow {
    pub direction: Direction,
    /// Policy identifier of the local endpoint; selects its filters.
    pub local_policy: u64,
    pub port: u16,
    pub protocol: Protocol,
    pub remote_policy: u64,
    pub http: Option<HttpRequest>,
}

/// Unchecked flow as received over the admin API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowDescriptor {
    pub direction: Option<Direction>,
    pub local_policy: Option<u64>,
    pub port: Option<u32>,
    pub protocol: Option<Protocol>,
    pub remote_policy: Option<u64>,
    #[serde(default)]
    pub http: Option<HttpRequest>,
}

fn required<T>(v: Option<T>, field: &str) -> Result<T> {
    v.ok_or_else(|| NpdsError::InvalidFlow(format!("missing {field}")))
}

impl TryFrom<FlowDescriptor> for Flow {
    type Error = NpdsError;

    fn try_from(d: FlowDescriptor) -> Result<Self> {
        let port = required(d.port, "port")?;
        let port = u16::try_from(port)
            .map_err(|_| NpdsError::InvalidFlow(format!("port {port} out of range")))?;
        if let Some(http) = &d.http {
            if http.method.is_empty() {
                return Err(NpdsError::InvalidFlow("http.method must not be empty".into()));
            }
        }

        Ok(Flow {
            direction: required(d.direction, "direction")?,
            local_policy: required(d.local_policy, "local_policy")?,
            port,
            protocol: required(d.protocol, "protocol")?,
            remote_policy: required(d.remote_policy, "remote_policy")?,
            http: d.http,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn descriptor_from_json() {
        let d: FlowDescriptor = serde_json::from_str(
            r#"{"direction":"ingress","local_policy":1,"port":80,"protocol":"tcp","remote_policy":10,
                "http":{"method":"GET","path":"/","headers":{"X-Token":"abc"}}}"#,
        )
        .unwrap();
        let flow = Flow::try_from(d).unwrap();
        assert_eq!(flow.port, 80);
        assert_eq!(flow.protocol, Protocol::Tcp);
        let http = flow.http.unwrap();
        assert_eq!(http.header(":method"), Some("GET"));
        assert_eq!(http.header("x-token"), Some("abc"));
        assert_eq!(http.header("x-missing"), None);
        assert_eq!(http.header(":path"), Some("/"));
        assert_eq!(http.header(":authority"), None);
    }

    #[test]
    fn missing_fields_fail_fast() {
        let err = Flow::try_from(FlowDescriptor {
            direction: Some(Direction::Egress),
            port: Some(53),
            protocol: Some(Protocol::Udp),
            remote_policy: Some(3),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFlow);
        assert!(err.to_string().contains("local_policy"));
    }

    #[test]
    fn port_range_checked() {
        let err = Flow::try_from(FlowDescriptor {
            direction: Some(Direction::Ingress),
            local_policy: Some(1),
            port: Some(65_536),
            protocol: Some(Protocol::Tcp),
            remote_policy: Some(3),
            http: None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
