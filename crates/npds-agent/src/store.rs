//! PolicyStore: the single owner of the active policy set.
//!
//! The current set lives in an immutable, versioned `PolicySnapshot` behind a
//! `watch` channel. Readers clone the `Arc` out and evaluate against it for as
//! long as they like; writers build a whole new snapshot and swap it in under
//! the channel's lock, so no reader ever observes a mix of two sets.
//! Replacements are serialized by that lock and the last one wins.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use npds_core::evaluator::{Decision, EnforcementMode};
use npds_core::flow::Flow;
use npds_core::model::{NetworkPolicy, PolicySet};

const CHANGE_QUEUE_DEPTH: usize = 64;

/// One immutable generation of the active policy set.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    revision: u64,
    version_info: String,
    set: PolicySet,
}

impl PolicySnapshot {
    /// Monotonic install counter; 0 until the first install.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Discovery version the set was installed from.
    pub fn version_info(&self) -> &str {
        &self.version_info
    }

    pub fn set(&self) -> &PolicySet {
        &self.set
    }

    pub fn evaluate(&self, flow: &Flow, mode: EnforcementMode) -> Decision {
        self.set.evaluate(flow, mode)
    }
}

/// Change notification published after every install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeNotification {
    pub revision: u64,
    pub version_info: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Clone)]
pub struct PolicyStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    current: watch::Sender<Arc<PolicySnapshot>>,
    changes: broadcast::Sender<Arc<ChangeNotification>>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        let (current, _) = watch::channel(Arc::new(PolicySnapshot::default()));
        let (changes, _) = broadcast::channel(CHANGE_QUEUE_DEPTH);
        Self {
            inner: Arc::new(StoreInner { current, changes }),
        }
    }

    /// Point-in-time view; unaffected by later installs.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.inner.current.borrow())
    }

    pub fn evaluate(&self, flow: &Flow, mode: EnforcementMode) -> Decision {
        self.snapshot().evaluate(flow, mode)
    }

    /// Install `policies` as the complete active set.
    ///
    /// Returns `None` when the set is identical to the current one (after the
    /// first install). The revision stays and no change is published; a new
    /// `version_info` is still recorded on the snapshot.
    pub fn replace(&self, version_info: &str, policies: Vec<NetworkPolicy>) -> Option<Arc<ChangeNotification>> {
        let next = PolicySet::new(policies);
        let mut note = None;

        self.inner.current.send_if_modified(|cur| {
            let (added, removed) = cur.set.diff(&next);
            if cur.revision > 0 && added.is_empty() && removed.is_empty() {
                if cur.version_info == version_info {
                    return false;
                }
                *cur = Arc::new(PolicySnapshot {
                    revision: cur.revision,
                    version_info: version_info.to_string(),
                    set: cur.set.clone(),
                });
                return true;
            }
            let revision = cur.revision + 1;
            note = Some(Arc::new(ChangeNotification {
                revision,
                version_info: version_info.to_string(),
                added,
                removed,
            }));
            *cur = Arc::new(PolicySnapshot {
                revision,
                version_info: version_info.to_string(),
                set: next,
            });
            true
        });

        self.publish(note)
    }

    /// Drop one filter outside the discovery flow. Returns `None` if it is
    /// not installed.
    pub fn withdraw(&self, name: &str) -> Option<Arc<ChangeNotification>> {
        let mut note = None;

        self.inner.current.send_if_modified(|cur| {
            let Some(next) = cur.set.without(name) else {
                return false;
            };
            let revision = cur.revision + 1;
            note = Some(Arc::new(ChangeNotification {
                revision,
                version_info: cur.version_info.clone(),
                added: Vec::new(),
                removed: vec![name.to_string()],
            }));
            *cur = Arc::new(PolicySnapshot {
                revision,
                version_info: cur.version_info.clone(),
                set: next,
            });
            true
        });

        self.publish(note)
    }

    fn publish(&self, note: Option<Arc<ChangeNotification>>) -> Option<Arc<ChangeNotification>> {
        if let Some(n) = &note {
            // no receivers is fine
            let _ = self.inner.changes.send(Arc::clone(n));
            tracing::info!(
                revision = n.revision,
                version = %n.version_info,
                added = n.added.len(),
                removed = n.removed.len(),
                "policy set installed"
            );
        }
        note
    }

    /// Every future install, as a diff.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Arc<ChangeNotification>> {
        self.inner.changes.subscribe()
    }

    /// Latest snapshot, for collaborators that rebuild a compiled form on change.
    pub fn watch(&self) -> watch::Receiver<Arc<PolicySnapshot>> {
        self.inner.current.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npds_core::model::ValidationLimits;
    use npds_core::proto::{self, SocketProtocol};

    fn policy(name: &str, remote: u64) -> NetworkPolicy {
        NetworkPolicy::from_wire(
            proto::NetworkPolicy {
                name: name.into(),
                policy: 1,
                ingress: Some(proto::DirectionNetworkPolicy {
                    per_port_policies: vec![proto::PortNetworkPolicy {
                        port: 80,
                        protocol: SocketProtocol::Tcp as i32,
                        rules: vec![proto::PortNetworkPolicyRule {
                            remote_policies: vec![remote],
                            l7_rules: None,
                        }],
                    }],
                }),
                egress: None,
            },
            &ValidationLimits::default(),
        )
        .unwrap()
    }

    #[test]
    fn replace_reports_diff_and_bumps_revision() {
        let store = PolicyStore::new();
        let n1 = store.replace("1", vec![policy("a", 1), policy("b", 2)]).unwrap();
        assert_eq!(n1.revision, 1);
        assert_eq!(n1.added, vec!["a".to_string(), "b".to_string()]);

        let n2 = store.replace("2", vec![policy("a", 1), policy("c", 3)]).unwrap();
        assert_eq!(n2.revision, 2);
        assert_eq!(n2.added, vec!["c".to_string()]);
        assert_eq!(n2.removed, vec!["b".to_string()]);
        assert_eq!(store.snapshot().version_info(), "2");
    }

    #[test]
    fn identical_set_is_a_no_op() {
        let store = PolicyStore::new();
        store.replace("1", vec![policy("a", 1)]).unwrap();
        let before = store.snapshot();
        assert!(store.replace("1", vec![policy("a", 1)]).is_none());
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[test]
    fn same_content_under_new_version_only_moves_the_version() {
        let store = PolicyStore::new();
        store.replace("1", vec![policy("a", 1)]).unwrap();
        let mut rx = store.subscribe_changes();

        assert!(store.replace("2", vec![policy("a", 1)]).is_none());
        let snap = store.snapshot();
        assert_eq!(snap.version_info(), "2");
        assert_eq!(snap.revision(), 1);
        assert!(snap.set().get("a").is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn first_install_counts_even_when_empty() {
        let store = PolicyStore::new();
        let n = store.replace("1", vec![]).unwrap();
        assert_eq!(n.revision, 1);
        assert_eq!(store.snapshot().revision(), 1);
    }

    #[test]
    fn old_snapshot_survives_replace() {
        let store = PolicyStore::new();
        store.replace("1", vec![policy("a", 1)]).unwrap();
        let old = store.snapshot();
        store.replace("2", vec![policy("b", 2)]).unwrap();
        assert!(old.set().get("a").is_some());
        assert!(old.set().get("b").is_none());
        assert!(store.snapshot().set().get("b").is_some());
    }

    #[test]
    fn withdraw_removes_one_filter() {
        let store = PolicyStore::new();
        store.replace("1", vec![policy("a", 1), policy("b", 2)]).unwrap();
        let mut rx = store.subscribe_changes();
        let n = store.withdraw("a").unwrap();
        assert_eq!(n.removed, vec!["a".to_string()]);
        assert_eq!(rx.try_recv().unwrap().revision, 2);
        assert!(store.withdraw("a").is_none());
        assert_eq!(store.snapshot().set().len(), 1);
    }
}
