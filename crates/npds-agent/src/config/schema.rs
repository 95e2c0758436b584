use std::time::Duration;

use serde::Deserialize;

use npds_core::error::{NpdsError, Result};
use npds_core::evaluator::EnforcementMode;
use npds_core::model::ValidationLimits;
use npds_core::proto::NETWORK_POLICY_TYPE_URL;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub version: u32,

    /// Identity presented to the control plane in every request.
    pub node_id: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub enforcement: EnforcementMode,

    #[serde(default)]
    pub discovery: DiscoverySection,

    #[serde(default)]
    pub admin: AdminSection,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(NpdsError::BadConfig(format!(
                "unsupported config version {}",
                self.version
            )));
        }
        if self.node_id.trim().is_empty() {
            return Err(NpdsError::BadConfig("node_id must not be empty".into()));
        }

        self.discovery.validate()?;
        self.admin.validate()?;

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Long-lived gRPC stream with ACK/NACK.
    #[default]
    Stream,
    /// Periodic unary gRPC fetch.
    Fetch,
    /// Periodic fetch over the HTTP mapping.
    Http,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoverySection {
    #[serde(default)]
    pub mode: DiscoveryMode,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_type_urls")]
    pub type_urls: Vec<String>,

    #[serde(default = "default_fetch_interval_ms")]
    pub fetch_interval_ms: u64,

    #[serde(default)]
    pub backoff: BackoffSection,

    #[serde(default = "default_max_ports_per_direction")]
    pub max_ports_per_direction: usize,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::default(),
            endpoint: default_endpoint(),
            type_urls: default_type_urls(),
            fetch_interval_ms: default_fetch_interval_ms(),
            backoff: BackoffSection::default(),
            max_ports_per_direction: default_max_ports_per_direction(),
        }
    }
}

impl DiscoverySection {
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(NpdsError::BadConfig(
                "discovery.endpoint must be an http:// or https:// URL".into(),
            ));
        }
        if self.type_urls.is_empty() {
            return Err(NpdsError::BadConfig("discovery.type_urls must not be empty".into()));
        }
        if let Some(t) = self.type_urls.iter().find(|t| t.as_str() != NETWORK_POLICY_TYPE_URL) {
            return Err(NpdsError::BadConfig(format!(
                "discovery.type_urls: unsupported type {t}"
            )));
        }
        if !(1000..=3_600_000).contains(&self.fetch_interval_ms) {
            return Err(NpdsError::BadConfig(
                "discovery.fetch_interval_ms must be between 1000 and 3600000".into(),
            ));
        }
        if !(1..=1024).contains(&self.max_ports_per_direction) {
            return Err(NpdsError::BadConfig(
                "discovery.max_ports_per_direction must be between 1 and 1024".into(),
            ));
        }
        self.backoff.validate()
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    pub fn limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_ports_per_direction: self.max_ports_per_direction,
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:9900".into()
}
fn default_type_urls() -> Vec<String> {
    vec![NETWORK_POLICY_TYPE_URL.to_string()]
}
fn default_fetch_interval_ms() -> u64 {
    30_000
}
fn default_max_ports_per_direction() -> usize {
    ValidationLimits::default().max_ports_per_direction
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffSection {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffSection {
    pub fn validate(&self) -> Result<()> {
        if self.initial_ms == 0 {
            return Err(NpdsError::BadConfig("discovery.backoff.initial_ms must be > 0".into()));
        }
        if self.max_ms < self.initial_ms {
            return Err(NpdsError::BadConfig(
                "discovery.backoff.max_ms must be >= initial_ms".into(),
            ));
        }
        if !(1.0..=10.0).contains(&self.multiplier) {
            return Err(NpdsError::BadConfig(
                "discovery.backoff.multiplier must be between 1.0 and 10.0".into(),
            ));
        }
        Ok(())
    }
}

fn default_initial_ms() -> u64 {
    100
}
fn default_max_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminSection {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ping_interval_ms: default_ping_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl AdminSection {
    pub fn validate(&self) -> Result<()> {
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(NpdsError::BadConfig(
                "admin.listen must be a valid socket address".into(),
            ));
        }
        if !(5000..=120000).contains(&self.ping_interval_ms) {
            return Err(NpdsError::BadConfig(
                "admin.ping_interval_ms must be between 5000 and 120000".into(),
            ));
        }
        if !(10000..=600000).contains(&self.idle_timeout_ms) {
            return Err(NpdsError::BadConfig(
                "admin.idle_timeout_ms must be between 10000 and 600000".into(),
            ));
        }
        if self.idle_timeout_ms <= self.ping_interval_ms {
            return Err(NpdsError::BadConfig(
                "admin.idle_timeout_ms must be greater than ping_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "127.0.0.1:9901".into()
}
fn default_ping_interval_ms() -> u64 {
    20000
}
fn default_idle_timeout_ms() -> u64 {
    60000
}
