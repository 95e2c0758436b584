//! The discovery client: subscribes to policy types over a stream (or polls
//! with unary fetches), validates every response, installs accepted sets into
//! the `PolicyStore` and answers with ACK/NACK.
//!
//! State machine of a stream session:
//!
//! ```text
//! Idle -> StreamOpen -> AwaitingResponse -> Applying -> Acking | Nacking -> AwaitingResponse
//!                 ^                                                          |
//!                 +---------------------- Reconnecting <---- stream error ----+
//! ```
//!
//! `Shutdown` is terminal and only entered through the shutdown signal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use npds_core::error::{NpdsError, Result};
use npds_core::model::{decode_resources, NetworkPolicy, PolicySet, ValidationLimits};
use npds_core::proto::{DiscoveryRequest, DiscoveryResponse, NETWORK_POLICY_TYPE_URL};
use npds_core::tracker::VersionTracker;

use super::backoff::{Backoff, BackoffConfig};
use super::transport::{FetchTransport, StreamTransport};
use crate::obs::AgentMetrics;
use crate::store::{ChangeNotification, PolicyStore};

const REQUEST_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Idle,
    StreamOpen,
    AwaitingResponse,
    Applying,
    Acking,
    Nacking,
    Reconnecting,
    Shutdown,
}

/// What changed for one type after an accepted response.
#[derive(Debug, Clone)]
pub struct ResourceBatch {
    pub type_url: String,
    pub version_info: String,
    /// New or modified filters.
    pub added: Vec<Arc<NetworkPolicy>>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub node_id: String,
    pub limits: ValidationLimits,
    pub backoff: BackoffConfig,
}

enum SessionEnd {
    Shutdown,
    Failed(NpdsError),
}

pub struct DiscoveryClient<T> {
    transport: Arc<T>,
    store: PolicyStore,
    metrics: Arc<AgentMetrics>,
    limits: ValidationLimits,
    backoff: BackoffConfig,
    tracker: VersionTracker,
    subscribers: BTreeMap<String, Vec<mpsc::UnboundedSender<ResourceBatch>>>,
    state: watch::Sender<ClientState>,
}

/// Resolves once shutdown is requested or the signal's sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn check_type(type_url: &str) -> Result<()> {
    if type_url == NETWORK_POLICY_TYPE_URL {
        Ok(())
    } else {
        Err(NpdsError::UnsupportedType(type_url.to_string()))
    }
}

impl<T> DiscoveryClient<T> {
    pub fn new(transport: Arc<T>, store: PolicyStore, settings: DiscoverySettings, metrics: Arc<AgentMetrics>) -> Self {
        let (state, _) = watch::channel(ClientState::Idle);
        Self {
            transport,
            store,
            metrics,
            limits: settings.limits,
            backoff: settings.backoff,
            tracker: VersionTracker::new(settings.node_id),
            subscribers: BTreeMap::new(),
            state,
        }
    }

    /// Track `type_url` without a batch consumer; the store still follows it.
    pub fn track(&mut self, type_url: &str) -> Result<()> {
        check_type(type_url)?;
        self.tracker.track(type_url);
        Ok(())
    }

    /// Track `type_url` and receive a `ResourceBatch` for every install.
    pub fn subscribe(&mut self, type_url: &str) -> Result<mpsc::UnboundedReceiver<ResourceBatch>> {
        self.track(type_url)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(type_url.to_string()).or_default().push(tx);
        Ok(rx)
    }

    pub fn state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn tracker(&self) -> &VersionTracker {
        &self.tracker
    }

    fn set_state(&self, next: ClientState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "discovery state");
        }
    }

    fn tracked_types(&self) -> Vec<String> {
        self.tracker.type_urls().map(str::to_string).collect()
    }

    fn install(
        &mut self,
        type_url: &str,
        version_info: &str,
        policies: Vec<NetworkPolicy>,
    ) -> Option<Arc<ChangeNotification>> {
        let Some(note) = self.store.replace(version_info, policies) else {
            debug!(type_url, version_info, "resync carried no changes");
            return None;
        };
        let snapshot = self.store.snapshot();
        self.metrics.policy_revision.set(&[], note.revision as i64);
        self.metrics.policies_active.set(&[], snapshot.set().len() as i64);
        self.notify(type_url, &note, snapshot.set());
        Some(note)
    }

    fn notify(&mut self, type_url: &str, note: &ChangeNotification, set: &PolicySet) {
        let Some(subs) = self.subscribers.get_mut(type_url) else {
            return;
        };
        let batch = ResourceBatch {
            type_url: type_url.to_string(),
            version_info: note.version_info.clone(),
            added: note.added.iter().filter_map(|n| set.get(n).cloned()).collect(),
            removed: note.removed.clone(),
        };
        subs.retain(|tx| tx.send(batch.clone()).is_ok());
    }
}

impl<T: StreamTransport> DiscoveryClient<T> {
    /// Drive the stream until shutdown, reconnecting with backoff on failure.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.backoff.clone());
        let mut reconnect = false;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if reconnect {
                self.tracker.begin_resync();
            }

            match self.session(&mut shutdown, &mut backoff).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(err) => {
                    self.set_state(ClientState::Reconnecting);
                    self.metrics.stream_reconnects.inc(&[]);
                    let delay = backoff.next_delay();
                    warn!(error = %err, attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "discovery stream failed; reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                    reconnect = true;
                }
            }
        }

        self.set_state(ClientState::Shutdown);
        info!("discovery client stopped");
    }

    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>, backoff: &mut Backoff) -> SessionEnd {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let transport = Arc::clone(&self.transport);

        let opened = tokio::select! {
            r = transport.open(rx) => r,
            _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
        };
        let mut responses = match opened {
            Ok(s) => s,
            Err(e) => return SessionEnd::Failed(e),
        };
        self.set_state(ClientState::StreamOpen);

        for req in self.tracker.initial_requests() {
            info!(type_url = %req.type_url, version = %req.version_info, nonce = %req.response_nonce, "subscribing");
            if let Some(end) = Self::enqueue(&tx, req, shutdown).await {
                return end;
            }
        }

        loop {
            self.set_state(ClientState::AwaitingResponse);
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
                n = responses.next() => n,
            };
            let resp = match next {
                Some(Ok(r)) => r,
                Some(Err(e)) => return SessionEnd::Failed(e),
                None => return SessionEnd::Failed(NpdsError::StreamTransport("stream closed by server".into())),
            };

            if let Some(req) = self.handle_response(resp) {
                backoff.reset();
                if let Some(end) = Self::enqueue(&tx, req, shutdown).await {
                    return end;
                }
            }
        }
    }

    async fn enqueue(
        tx: &mpsc::Sender<DiscoveryRequest>,
        req: DiscoveryRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<SessionEnd> {
        tokio::select! {
            r = tx.send(req) => r
                .err()
                .map(|_| SessionEnd::Failed(NpdsError::StreamTransport("request half closed".into()))),
            _ = shutdown_requested(shutdown) => Some(SessionEnd::Shutdown),
        }
    }

    /// Process one response; returns the ACK/NACK to send, or `None` when the
    /// response is discarded.
    fn handle_response(&mut self, resp: DiscoveryResponse) -> Option<DiscoveryRequest> {
        let type_url = resp.type_url.clone();

        if let Err(e) = self.tracker.check_response(&resp) {
            let outcome = match e {
                NpdsError::StaleNonce(_) => "stale",
                _ => "unsupported",
            };
            self.metrics
                .discovery_responses
                .inc(&[("type_url", type_url.as_str()), ("outcome", outcome)]);
            warn!(type_url = %type_url, version = %resp.version_info, nonce = %resp.nonce, error = %e, "discarding response");
            return None;
        }

        self.set_state(ClientState::Applying);
        match decode_resources(&type_url, &resp.resources, &self.limits) {
            Ok(policies) => {
                if let Err(e) = self.tracker.record_accepted(&type_url, &resp.version_info, &resp.nonce) {
                    self.metrics
                        .discovery_responses
                        .inc(&[("type_url", type_url.as_str()), ("outcome", "stale")]);
                    warn!(type_url = %type_url, error = %e, "discarding response");
                    return None;
                }
                self.install(&type_url, &resp.version_info, policies);
                self.set_state(ClientState::Acking);
                self.metrics
                    .discovery_responses
                    .inc(&[("type_url", type_url.as_str()), ("outcome", "ack")]);
                info!(type_url = %type_url, version = %resp.version_info, nonce = %resp.nonce, "ACK");
                self.tracker.ack(&type_url).ok()
            }
            Err(e) => {
                let detail = e.to_string();
                self.tracker.record_rejected(&type_url, &resp.nonce).ok()?;
                self.set_state(ClientState::Nacking);
                self.metrics
                    .discovery_responses
                    .inc(&[("type_url", type_url.as_str()), ("outcome", "nack")]);
                warn!(
                    type_url = %type_url,
                    version = %resp.version_info,
                    nonce = %resp.nonce,
                    kept = %self.store.snapshot().version_info(),
                    error = %detail,
                    "NACK"
                );
                self.tracker.nack(&type_url, &detail).ok()
            }
        }
    }
}

impl<T: FetchTransport> DiscoveryClient<T> {
    async fn fetch_policies(&self, type_url: &str) -> Result<(String, Vec<NetworkPolicy>)> {
        check_type(type_url)?;
        let resp = self.transport.fetch(self.tracker.fetch_request(type_url)).await?;
        if resp.type_url != type_url {
            return Err(NpdsError::UnsupportedType(resp.type_url));
        }
        let policies = decode_resources(type_url, &resp.resources, &self.limits)?;
        Ok((resp.version_info, policies))
    }

    /// Dry-run fetch: one request/response, validated like a streamed
    /// response. The batch is relative to the current store contents and
    /// nothing is installed; see `fetch_and_apply`.
    pub async fn fetch_once(&self, type_url: &str) -> Result<ResourceBatch> {
        let (version_info, policies) = self.fetch_policies(type_url).await?;
        let next = PolicySet::new(policies);
        let (changed, removed) = self.store.snapshot().set().diff(&next);
        Ok(ResourceBatch {
            type_url: type_url.to_string(),
            version_info,
            added: changed.iter().filter_map(|n| next.get(n).cloned()).collect(),
            removed,
        })
    }

    /// Fetch, validate and install `type_url`. `None` when the fetched set
    /// equals the installed one.
    pub async fn fetch_and_apply(&mut self, type_url: &str) -> Result<Option<Arc<ChangeNotification>>> {
        let (version_info, policies) = self.fetch_policies(type_url).await?;
        self.set_state(ClientState::Applying);
        Ok(self.install(type_url, &version_info, policies))
    }

    /// Fetch every tracked type each `interval` and install what validates.
    /// A failed fetch keeps the current set and waits for the next tick.
    pub async fn poll(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: loop {
            self.set_state(ClientState::Idle);
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            for type_url in self.tracked_types() {
                self.set_state(ClientState::AwaitingResponse);
                let fetched = tokio::select! {
                    r = self.fetch_and_apply(&type_url) => r,
                    _ = shutdown_requested(&mut shutdown) => break 'outer,
                };
                match fetched {
                    Ok(_) => {
                        self.metrics.fetches.inc(&[("type_url", type_url.as_str()), ("outcome", "ok")]);
                    }
                    Err(e) => {
                        self.metrics.fetches.inc(&[("type_url", type_url.as_str()), ("outcome", "error")]);
                        warn!(type_url = %type_url, error = %e, "fetch failed; keeping current set");
                    }
                }
            }
        }

        self.set_state(ClientState::Shutdown);
        info!("discovery poller stopped");
    }
}
