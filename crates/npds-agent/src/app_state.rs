//! Shared state of the admin server.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use npds_core::evaluator::EnforcementMode;

use crate::config::AgentConfig;
use crate::discovery::ClientState;
use crate::obs::AgentMetrics;
use crate::store::PolicyStore;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    enforcement: EnforcementMode,
    ping_interval: Duration,
    idle_timeout: Duration,
    store: PolicyStore,
    metrics: Arc<AgentMetrics>,
    discovery: Option<watch::Receiver<ClientState>>,
}

impl AppState {
    pub fn new(
        cfg: &AgentConfig,
        store: PolicyStore,
        metrics: Arc<AgentMetrics>,
        discovery: Option<watch::Receiver<ClientState>>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                enforcement: cfg.enforcement,
                ping_interval: Duration::from_millis(cfg.admin.ping_interval_ms),
                idle_timeout: Duration::from_millis(cfg.admin.idle_timeout_ms),
                store,
                metrics,
                discovery,
            }),
        }
    }

    pub fn enforcement(&self) -> EnforcementMode {
        self.inner.enforcement
    }

    pub fn ping_interval(&self) -> Duration {
        self.inner.ping_interval
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    pub fn store(&self) -> &PolicyStore {
        &self.inner.store
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.inner.metrics
    }

    /// Ready once a first policy version has been installed.
    pub fn is_ready(&self) -> bool {
        self.inner.store.snapshot().revision() > 0
    }

    pub fn discovery_state(&self) -> Option<ClientState> {
        self.inner.discovery.as_ref().map(|rx| *rx.borrow())
    }
}
