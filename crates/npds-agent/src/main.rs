//! npds-agent
//!
//! Usage: `npds-agent [config.yaml]` (defaults to `npds.yaml`).
//! `RUST_LOG` overrides the configured `log_level`.

use std::process::ExitCode;

use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use npds_agent::{agent, config};

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args().nth(1).unwrap_or_else(|| "npds.yaml".to_string());

    let cfg = match config::load_from_file(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("npds-agent: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    fmt().with_env_filter(filter).init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    match agent::run(cfg, shutdown_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(code = e.code().as_str(), error = %e, "npds-agent failed");
            ExitCode::FAILURE
        }
    }
}
