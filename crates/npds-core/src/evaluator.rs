//! Flow evaluation (deny-by-default allow-lists).
//!
//! Order of checks for the filters of one endpoint:
//! 1. No filter restricts the flow's direction -> allow.
//! 2. No port entry for `port`/`protocol` in any restricting filter -> deny.
//! 3. Any rule of any matching port entry matches -> allow.
//! 4. Otherwise deny.
//!
//! Filters sharing a parent policy are unioned: port entries for the same
//! port across filters form one disjunction of rules.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::flow::{Flow, FlowDescriptor};
use crate::model::{DirectionNetworkPolicy, NetworkPolicy, PolicySet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
        }
    }

    pub fn is_allow(self) -> bool {
        self == Decision::Allow
    }
}

/// How endpoints without any filter are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Endpoints without filters are unrestricted.
    #[default]
    Default,
    /// Endpoints without filters are denied in both directions.
    Always,
    /// Nothing is enforced.
    Never,
}

/// Evaluate `flow` against the filters in effect for its local endpoint.
pub fn evaluate<'a, I>(filters: I, flow: &Flow, mode: EnforcementMode) -> Decision
where
    I: IntoIterator<Item = &'a NetworkPolicy>,
{
    if mode == EnforcementMode::Never {
        return Decision::Allow;
    }

    let mut any_filter = false;
    let mut restricting: Vec<&DirectionNetworkPolicy> = Vec::new();
    for f in filters {
        any_filter = true;
        if let Some(d) = f.direction(flow.direction) {
            restricting.push(d);
        }
    }

    if !any_filter {
        return match mode {
            EnforcementMode::Always => Decision::Deny,
            _ => Decision::Allow,
        };
    }
    if restricting.is_empty() {
        return Decision::Allow;
    }

    let allowed = restricting
        .into_iter()
        .flat_map(|d| d.matching(flow.port, flow.protocol))
        .flat_map(|p| p.rules())
        .any(|r| r.matches(flow.remote_policy, flow.http.as_ref()));

    if allowed {
        Decision::Allow
    } else {
        Decision::Deny
    }
}

/// Check an unchecked descriptor, then evaluate it against `set`.
pub fn evaluate_descriptor(set: &PolicySet, desc: FlowDescriptor, mode: EnforcementMode) -> Result<Decision> {
    let flow = Flow::try_from(desc)?;
    Ok(set.evaluate(&flow, mode))
}
