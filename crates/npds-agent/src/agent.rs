//! Agent assembly: one discovery task feeding the store, one admin server
//! reading it, both stopped by the same shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use npds_core::error::{NpdsError, Result};

use crate::app_state::AppState;
use crate::config::{AgentConfig, DiscoveryMode};
use crate::discovery::{
    BackoffConfig, ClientState, DiscoveryClient, DiscoverySettings, GrpcTransport, HttpFetchTransport,
};
use crate::obs::AgentMetrics;
use crate::router;
use crate::store::PolicyStore;

fn build_client<T>(
    cfg: &AgentConfig,
    transport: T,
    store: &PolicyStore,
    metrics: &Arc<AgentMetrics>,
) -> Result<DiscoveryClient<T>> {
    let settings = DiscoverySettings {
        node_id: cfg.node_id.clone(),
        limits: cfg.discovery.limits(),
        backoff: BackoffConfig::from(&cfg.discovery.backoff),
    };
    let mut client = DiscoveryClient::new(Arc::new(transport), store.clone(), settings, Arc::clone(metrics));
    for type_url in &cfg.discovery.type_urls {
        client.track(type_url)?;
    }
    Ok(client)
}

fn spawn_discovery(
    cfg: &AgentConfig,
    store: &PolicyStore,
    metrics: &Arc<AgentMetrics>,
    shutdown: watch::Receiver<bool>,
) -> Result<(watch::Receiver<ClientState>, JoinHandle<()>)> {
    let endpoint = &cfg.discovery.endpoint;
    let interval = cfg.discovery.fetch_interval();

    Ok(match cfg.discovery.mode {
        DiscoveryMode::Stream => {
            let client = build_client(cfg, GrpcTransport::new(endpoint)?, store, metrics)?;
            (client.state(), tokio::spawn(client.run(shutdown)))
        }
        DiscoveryMode::Fetch => {
            let client = build_client(cfg, GrpcTransport::new(endpoint)?, store, metrics)?;
            (client.state(), tokio::spawn(client.poll(interval, shutdown)))
        }
        DiscoveryMode::Http => {
            let client = build_client(cfg, HttpFetchTransport::new(endpoint)?, store, metrics)?;
            (client.state(), tokio::spawn(client.poll(interval, shutdown)))
        }
    })
}

/// Run the agent until `shutdown` flips to `true`.
pub async fn run(cfg: AgentConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let listen: SocketAddr = cfg
        .admin
        .listen
        .parse()
        .map_err(|e| NpdsError::BadConfig(format!("admin.listen: {e}")))?;

    let store = PolicyStore::new();
    let metrics = Arc::new(AgentMetrics::default());

    let (discovery_state, discovery) = spawn_discovery(&cfg, &store, &metrics, shutdown.clone())?;
    let state = AppState::new(&cfg, store, metrics, Some(discovery_state));
    let app = router::build_router(state);

    tracing::info!(
        %listen,
        node_id = %cfg.node_id,
        mode = ?cfg.discovery.mode,
        endpoint = %cfg.discovery.endpoint,
        enforcement = ?cfg.enforcement,
        "npds-agent starting"
    );
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| NpdsError::Internal(format!("bind {listen} failed: {e}")))?;

    let mut stop = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|s| *s).await;
        })
        .await
        .map_err(|e| NpdsError::Internal(format!("admin server failed: {e}")))?;

    discovery
        .await
        .map_err(|e| NpdsError::Internal(format!("discovery task failed: {e}")))?;
    tracing::info!("npds-agent stopped");
    Ok(())
}
