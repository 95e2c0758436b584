//! Agent config loader (strict parsing).

pub mod schema;

use std::fs;

use npds_core::error::{NpdsError, Result};

pub use schema::{AdminSection, AgentConfig, BackoffSection, DiscoveryMode, DiscoverySection};

pub fn load_from_file(path: &str) -> Result<AgentConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| NpdsError::BadConfig(format!("read config {path} failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<AgentConfig> {
    let cfg: AgentConfig = serde_yaml::from_str(s)
        .map_err(|e| NpdsError::BadConfig(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
