//! Wire -> model conversion with invariant checks.
//!
//! Validation is all-or-nothing per discovery response: `decode_resources`
//! returns the first failure and no partially built set.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use prost::Message;

use crate::error::{NpdsError, Result};
use crate::proto::{self, header_matcher::HeaderMatchSpecifier, port_network_policy_rule, SocketProtocol};

use super::{
    DirectionNetworkPolicy, HeaderMatcher, HttpNetworkPolicyRule, HttpNetworkPolicyRules, L7Rules,
    MatchKind, NetworkPolicy, PortNetworkPolicy, PortNetworkPolicyRule, Protocol,
};

/// Upper bounds applied on top of the structural invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_ports_per_direction: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_ports_per_direction: 40,
        }
    }
}

/// Decode and validate every resource of a response.
///
/// Resource names must be unique within the batch.
pub fn decode_resources(
    type_url: &str,
    resources: &[prost_types::Any],
    limits: &ValidationLimits,
) -> Result<Vec<NetworkPolicy>> {
    if type_url != proto::NETWORK_POLICY_TYPE_URL {
        return Err(NpdsError::UnsupportedType(type_url.to_string()));
    }

    let mut seen = HashSet::with_capacity(resources.len());
    let mut out = Vec::with_capacity(resources.len());
    for (idx, any) in resources.iter().enumerate() {
        if any.type_url != type_url {
            return Err(NpdsError::malformed(
                format!("#{idx}"),
                format!("resource type {} does not match response type {type_url}", any.type_url),
            ));
        }
        let wire = proto::NetworkPolicy::decode(any.value.as_slice())
            .map_err(|e| NpdsError::malformed(format!("#{idx}"), format!("decode failed: {e}")))?;
        let policy = NetworkPolicy::from_wire(wire, limits)?;
        if !seen.insert(policy.name.clone()) {
            return Err(NpdsError::malformed(&policy.name, "duplicate resource name"));
        }
        out.push(policy);
    }
    Ok(out)
}

impl NetworkPolicy {
    /// Validate a single wire resource.
    pub fn from_wire(wire: proto::NetworkPolicy, limits: &ValidationLimits) -> Result<Self> {
        if wire.name.is_empty() {
            return Err(NpdsError::malformed("", "name must not be empty"));
        }
        let name = wire.name;
        let ingress = wire
            .ingress
            .map(|d| direction(&name, "ingress", d, limits))
            .transpose()?;
        let egress = wire
            .egress
            .map(|d| direction(&name, "egress", d, limits))
            .transpose()?;

        Ok(Self {
            name,
            policy: wire.policy,
            ingress,
            egress,
        })
    }
}

fn direction(
    name: &str,
    which: &str,
    wire: proto::DirectionNetworkPolicy,
    limits: &ValidationLimits,
) -> Result<DirectionNetworkPolicy> {
    if wire.per_port_policies.is_empty() {
        return Err(NpdsError::malformed(name, format!("{which}: no port policies")));
    }
    if wire.per_port_policies.len() > limits.max_ports_per_direction {
        return Err(NpdsError::malformed(
            name,
            format!(
                "{which}: {} port policies exceeds limit of {}",
                wire.per_port_policies.len(),
                limits.max_ports_per_direction
            ),
        ));
    }

    let mut ports = BTreeMap::new();
    for p in wire.per_port_policies {
        let entry = port_policy(name, which, p)?;
        let key = (entry.port, entry.protocol);
        if ports.insert(key, entry).is_some() {
            return Err(NpdsError::malformed(
                name,
                format!("{which}: duplicate port entry {}/{}", key.0, key.1.as_str()),
            ));
        }
    }
    Ok(DirectionNetworkPolicy { ports })
}

fn port_policy(name: &str, which: &str, wire: proto::PortNetworkPolicy) -> Result<PortNetworkPolicy> {
    let port = u16::try_from(wire.port)
        .map_err(|_| NpdsError::malformed(name, format!("{which}: port {} out of range", wire.port)))?;
    let protocol = SocketProtocol::try_from(wire.protocol)
        .map(Protocol::from)
        .map_err(|_| NpdsError::malformed(name, format!("{which}: unknown protocol {}", wire.protocol)))?;
    if wire.rules.is_empty() {
        return Err(NpdsError::malformed(name, format!("{which}: port {port} has no rules")));
    }

    let rules = wire
        .rules
        .into_iter()
        .map(|r| rule(name, port, r))
        .collect::<Result<Vec<_>>>()?;

    Ok(PortNetworkPolicy { port, protocol, rules })
}

fn rule(name: &str, port: u16, wire: proto::PortNetworkPolicyRule) -> Result<PortNetworkPolicyRule> {
    if wire.remote_policies.is_empty() {
        return Err(NpdsError::malformed(name, format!("port {port}: rule has no remote policies")));
    }
    let mut remote_policies = BTreeSet::new();
    for id in wire.remote_policies {
        if !remote_policies.insert(id) {
            return Err(NpdsError::malformed(
                name,
                format!("port {port}: duplicate remote policy {id}"),
            ));
        }
    }

    let l7_rules = match wire.l7_rules {
        None => None,
        Some(port_network_policy_rule::L7Rules::HttpRules(http)) => {
            Some(L7Rules::Http(http_rules(name, port, http)?))
        }
    };

    Ok(PortNetworkPolicyRule { remote_policies, l7_rules })
}

fn http_rules(name: &str, port: u16, wire: proto::HttpNetworkPolicyRules) -> Result<HttpNetworkPolicyRules> {
    if wire.http_rules.is_empty() {
        return Err(NpdsError::malformed(name, format!("port {port}: empty http rules")));
    }
    let rules = wire
        .http_rules
        .into_iter()
        .map(|r| {
            let headers = r
                .headers
                .into_iter()
                .map(|h| header(name, port, h))
                .collect::<Result<Vec<_>>>()?;
            Ok(HttpNetworkPolicyRule { headers })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(HttpNetworkPolicyRules { rules })
}

fn header(name: &str, port: u16, wire: proto::HeaderMatcher) -> Result<HeaderMatcher> {
    if wire.name.is_empty() {
        return Err(NpdsError::malformed(name, format!("port {port}: header matcher without name")));
    }
    let kind = match wire.header_match_specifier {
        Some(HeaderMatchSpecifier::ExactMatch(v)) => MatchKind::Exact(v),
        Some(HeaderMatchSpecifier::PresentMatch(true)) => MatchKind::Present,
        Some(HeaderMatchSpecifier::PresentMatch(false)) | None => {
            return Err(NpdsError::malformed(
                name,
                format!("port {port}: header {} has no match specifier", wire.name),
            ));
        }
    };
    Ok(HeaderMatcher {
        name: wire.name.to_ascii_lowercase(),
        kind,
        case_insensitive: wire.case_insensitive,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::error::ErrorCode;
    use crate::proto::pack;

    fn wire_rule(remotes: &[u64]) -> proto::PortNetworkPolicyRule {
        proto::PortNetworkPolicyRule {
            remote_policies: remotes.to_vec(),
            l7_rules: None,
        }
    }

    fn wire_port(port: u32, rules: Vec<proto::PortNetworkPolicyRule>) -> proto::PortNetworkPolicy {
        proto::PortNetworkPolicy {
            port,
            protocol: SocketProtocol::Tcp as i32,
            rules,
        }
    }

    fn wire_policy(name: &str, ports: Vec<proto::PortNetworkPolicy>) -> proto::NetworkPolicy {
        proto::NetworkPolicy {
            name: name.into(),
            policy: 7,
            ingress: Some(proto::DirectionNetworkPolicy { per_port_policies: ports }),
            egress: None,
        }
    }

    fn reason(err: NpdsError) -> String {
        assert_eq!(err.code(), ErrorCode::MalformedResource);
        err.to_string()
    }

    #[test]
    fn accepts_minimal_policy() {
        let p = NetworkPolicy::from_wire(
            wire_policy("web", vec![wire_port(80, vec![wire_rule(&[10])])]),
            &ValidationLimits::default(),
        )
        .unwrap();
        assert_eq!(p.name(), "web");
        assert_eq!(p.policy(), 7);
        assert!(p.direction(crate::flow::Direction::Egress).is_none());
        let ingress = p.direction(crate::flow::Direction::Ingress).unwrap();
        assert_eq!(ingress.ports().count(), 1);
    }

    #[test]
    fn rejects_empty_direction() {
        let err = NetworkPolicy::from_wire(wire_policy("web", vec![]), &ValidationLimits::default())
            .unwrap_err();
        assert!(reason(err).contains("no port policies"));
    }

    #[test]
    fn rejects_port_out_of_range() {
        let err = NetworkPolicy::from_wire(
            wire_policy("web", vec![wire_port(70_000, vec![wire_rule(&[1])])]),
            &ValidationLimits::default(),
        )
        .unwrap_err();
        assert!(reason(err).contains("out of range"));
    }

    #[test]
    fn rejects_duplicate_remote_policy() {
        let err = NetworkPolicy::from_wire(
            wire_policy("web", vec![wire_port(80, vec![wire_rule(&[1, 2, 1])])]),
            &ValidationLimits::default(),
        )
        .unwrap_err();
        assert!(reason(err).contains("duplicate remote policy 1"));
    }

    #[test]
    fn rejects_empty_rules_and_remotes() {
        let limits = ValidationLimits::default();
        let err = NetworkPolicy::from_wire(wire_policy("a", vec![wire_port(80, vec![])]), &limits)
            .unwrap_err();
        assert!(reason(err).contains("has no rules"));

        let err = NetworkPolicy::from_wire(wire_policy("b", vec![wire_port(80, vec![wire_rule(&[])])]), &limits)
            .unwrap_err();
        assert!(reason(err).contains("no remote policies"));
    }

    #[test]
    fn rejects_duplicate_port_entry() {
        let err = NetworkPolicy::from_wire(
            wire_policy(
                "web",
                vec![wire_port(80, vec![wire_rule(&[1])]), wire_port(80, vec![wire_rule(&[2])])],
            ),
            &ValidationLimits::default(),
        )
        .unwrap_err();
        assert!(reason(err).contains("duplicate port entry 80/tcp"));
    }

    #[test]
    fn enforces_port_limit() {
        let ports = (1..=50).map(|p| wire_port(p, vec![wire_rule(&[1])])).collect();
        let err = NetworkPolicy::from_wire(wire_policy("wide", ports), &ValidationLimits::default())
            .unwrap_err();
        assert!(reason(err).contains("exceeds limit of 40"));
    }

    #[test]
    fn rejects_empty_http_rules_and_bad_matchers() {
        let limits = ValidationLimits::default();
        let mut r = wire_rule(&[1]);
        r.l7_rules = Some(port_network_policy_rule::L7Rules::HttpRules(
            proto::HttpNetworkPolicyRules { http_rules: vec![] },
        ));
        let err = NetworkPolicy::from_wire(wire_policy("a", vec![wire_port(80, vec![r])]), &limits)
            .unwrap_err();
        assert!(reason(err).contains("empty http rules"));

        let mut r = wire_rule(&[1]);
        r.l7_rules = Some(port_network_policy_rule::L7Rules::HttpRules(
            proto::HttpNetworkPolicyRules {
                http_rules: vec![proto::HttpNetworkPolicyRule {
                    headers: vec![proto::HeaderMatcher {
                        name: ":method".into(),
                        header_match_specifier: None,
                        case_insensitive: false,
                    }],
                }],
            },
        ));
        let err = NetworkPolicy::from_wire(wire_policy("b", vec![wire_port(80, vec![r])]), &limits)
            .unwrap_err();
        assert!(reason(err).contains("no match specifier"));
    }

    #[test]
    fn decode_resources_rejects_duplicate_names() {
        let p = wire_policy("web", vec![wire_port(80, vec![wire_rule(&[1])])]);
        let err = decode_resources(
            proto::NETWORK_POLICY_TYPE_URL,
            &[pack(&p), pack(&p)],
            &ValidationLimits::default(),
        )
        .unwrap_err();
        assert!(reason(err).contains("duplicate resource name"));
    }

    #[test]
    fn decode_resources_rejects_foreign_type() {
        let err = decode_resources("type.googleapis.com/other.Thing", &[], &ValidationLimits::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedType);
    }

    #[test]
    fn decode_resources_rejects_garbage_payload() {
        let any = prost_types::Any {
            type_url: proto::NETWORK_POLICY_TYPE_URL.into(),
            value: vec![0xff, 0xff, 0xff],
        };
        let err = decode_resources(proto::NETWORK_POLICY_TYPE_URL, &[any], &ValidationLimits::default())
            .unwrap_err();
        assert!(reason(err).contains("decode failed"));
    }
}
