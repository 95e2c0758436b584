//! Immutable in-memory policy model.
//!
//! A `NetworkPolicy` is one filter (identified by `name`) subsetting a parent
//! policy identifier. Instances are only produced by validation
//! ([`validate`]), so every value reachable from here already satisfies the
//! non-empty and range invariants; the evaluator never re-checks them.

mod set;
pub mod validate;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::flow::{Direction, HttpRequest};
use crate::proto::SocketProtocol;

pub use set::PolicySet;
pub use validate::{decode_resources, ValidationLimits};

/// Transport protocol of a port entry or flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl From<SocketProtocol> for Protocol {
    fn from(p: SocketProtocol) -> Self {
        match p {
            SocketProtocol::Tcp => Protocol::Tcp,
            SocketProtocol::Udp => Protocol::Udp,
            SocketProtocol::Sctp => Protocol::Sctp,
        }
    }
}

/// One network policy filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPolicy {
    pub(crate) name: String,
    pub(crate) policy: u64,
    pub(crate) ingress: Option<DirectionNetworkPolicy>,
    pub(crate) egress: Option<DirectionNetworkPolicy>,
}

impl NetworkPolicy {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent policy identifier this filter subsets.
    pub fn policy(&self) -> u64 {
        self.policy
    }

    /// Restriction for `direction`; `None` means unrestricted by this filter.
    pub fn direction(&self, direction: Direction) -> Option<&DirectionNetworkPolicy> {
        match direction {
            Direction::Ingress => self.ingress.as_ref(),
            Direction::Egress => self.egress.as_ref(),
        }
    }
}

/// Port entries of one direction, keyed by `(port, protocol)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionNetworkPolicy {
    pub(crate) ports: BTreeMap<(u16, Protocol), PortNetworkPolicy>,
}

impl DirectionNetworkPolicy {
    pub fn ports(&self) -> impl Iterator<Item = &PortNetworkPolicy> {
        self.ports.values()
    }

    /// Entries applying to `port`/`protocol`: the exact entry and the
    /// all-ports (`port == 0`) entry, if configured.
    pub fn matching(&self, port: u16, protocol: Protocol) -> impl Iterator<Item = &PortNetworkPolicy> {
        let exact = self.ports.get(&(port, protocol));
        let wildcard = if port == 0 {
            None
        } else {
            self.ports.get(&(0, protocol))
        };
        exact.into_iter().chain(wildcard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortNetworkPolicy {
    pub(crate) port: u16,
    pub(crate) protocol: Protocol,
    pub(crate) rules: Vec<PortNetworkPolicyRule>,
}

impl PortNetworkPolicy {
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
    pub fn rules(&self) -> &[PortNetworkPolicyRule] {
        &self.rules
    }
}

/// A rule allows a remote policy set, optionally narrowed by L7 rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortNetworkPolicyRule {
    pub(crate) remote_policies: BTreeSet<u64>,
    pub(crate) l7_rules: Option<L7Rules>,
}

impl PortNetworkPolicyRule {
    pub fn remote_policies(&self) -> &BTreeSet<u64> {
        &self.remote_policies
    }

    pub fn l7_rules(&self) -> Option<&L7Rules> {
        self.l7_rules.as_ref()
    }

    /// Remote membership AND (when present) an L7 match.
    pub fn matches(&self, remote_policy: u64, http: Option<&HttpRequest>) -> bool {
        if !self.remote_policies.contains(&remote_policy) {
            return false;
        }
        match &self.l7_rules {
            None => true,
            Some(l7) => l7.matches(http),
        }
    }
}

/// Application-protocol rules attached to a port rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L7Rules {
    Http(HttpNetworkPolicyRules),
}

impl L7Rules {
    fn matches(&self, http: Option<&HttpRequest>) -> bool {
        match self {
            // No request descriptor: nothing to prove the rule with.
            L7Rules::Http(rules) => http.is_some_and(|req| rules.matches(req)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpNetworkPolicyRules {
    pub(crate) rules: Vec<HttpNetworkPolicyRule>,
}

impl HttpNetworkPolicyRules {
    pub fn rules(&self) -> &[HttpNetworkPolicyRule] {
        &self.rules
    }

    /// Disjunction across rules.
    pub fn matches(&self, req: &HttpRequest) -> bool {
        self.rules.iter().any(|r| r.matches(req))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpNetworkPolicyRule {
    pub(crate) headers: Vec<HeaderMatcher>,
}

impl HttpNetworkPolicyRule {
    pub fn headers(&self) -> &[HeaderMatcher] {
        &self.headers
    }

    /// Conjunction across headers; an empty rule matches any request.
    pub fn matches(&self, req: &HttpRequest) -> bool {
        self.headers.iter().all(|h| h.matches(req))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKind {
    Exact(String),
    Present,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMatcher {
    pub(crate) name: String,
    pub(crate) kind: MatchKind,
    pub(crate) case_insensitive: bool,
}

impl HeaderMatcher {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &MatchKind {
        &self.kind
    }

    pub fn matches(&self, req: &HttpRequest) -> bool {
        let Some(actual) = req.header(&self.name) else {
            return false;
        };
        match &self.kind {
            MatchKind::Present => true,
            MatchKind::Exact(want) if self.case_insensitive => actual.eq_ignore_ascii_case(want),
            MatchKind::Exact(want) => actual == want,
        }
    }
}
