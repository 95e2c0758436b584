use std::collections::BTreeMap;
use std::sync::Arc;

use crate::evaluator::{self, Decision, EnforcementMode};
use crate::flow::Flow;

use super::NetworkPolicy;

/// Immutable set of active filters, keyed by `name` and indexed by parent
/// policy identifier.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    by_name: BTreeMap<String, Arc<NetworkPolicy>>,
    by_policy: BTreeMap<u64, Vec<Arc<NetworkPolicy>>>,
}

impl PolicySet {
    pub fn new(policies: impl IntoIterator<Item = NetworkPolicy>) -> Self {
        Self::from_arcs(policies.into_iter().map(Arc::new))
    }

    fn from_arcs(policies: impl IntoIterator<Item = Arc<NetworkPolicy>>) -> Self {
        let by_name: BTreeMap<String, Arc<NetworkPolicy>> = policies
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        let mut by_policy: BTreeMap<u64, Vec<Arc<NetworkPolicy>>> = BTreeMap::new();
        for p in by_name.values() {
            by_policy.entry(p.policy).or_default().push(Arc::clone(p));
        }

        Self { by_name, by_policy }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<NetworkPolicy>> {
        self.by_name.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<NetworkPolicy>> {
        self.by_name.values()
    }

    /// Every filter whose parent policy is `policy`.
    pub fn filters_for(&self, policy: u64) -> impl Iterator<Item = &NetworkPolicy> {
        self.by_policy
            .get(&policy)
            .into_iter()
            .flatten()
            .map(|p| p.as_ref())
    }

    /// Evaluate `flow` against the filters of its local endpoint.
    pub fn evaluate(&self, flow: &Flow, mode: EnforcementMode) -> Decision {
        evaluator::evaluate(self.filters_for(flow.local_policy), flow, mode)
    }

    /// Names added or changed in `next`, and names absent from `next`.
    pub fn diff(&self, next: &PolicySet) -> (Vec<String>, Vec<String>) {
        let changed = next
            .by_name
            .iter()
            .filter(|(name, p)| self.by_name.get(*name).map_or(true, |old| old != *p))
            .map(|(name, _)| name.clone())
            .collect();
        let removed = self
            .by_name
            .keys()
            .filter(|name| !next.by_name.contains_key(*name))
            .cloned()
            .collect();
        (changed, removed)
    }

    /// Copy of this set without `name`, or `None` if it is not present.
    pub fn without(&self, name: &str) -> Option<PolicySet> {
        if !self.by_name.contains_key(name) {
            return None;
        }
        Some(Self::from_arcs(
            self.by_name
                .values()
                .filter(|p| p.name != name)
                .cloned(),
        ))
    }
}
