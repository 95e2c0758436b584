//! Discovery wire messages (protobuf).
//!
//! Field numbers follow the network policy discovery service schema so the
//! agent interoperates with existing control planes:
//! - `DiscoveryRequest` / `DiscoveryResponse` carry version, nonce, type URL and
//!   the state-of-the-world resource list as `google.protobuf.Any`.
//! - `NetworkPolicy` and its nested rule tree are the only resource type.
//!
//! These are plain prost messages; validation into the immutable model lives in
//! [`crate::model`].

#![allow(missing_docs)]

use prost::Message;

/// Type URL of the `NetworkPolicy` resource.
pub const NETWORK_POLICY_TYPE_URL: &str = "type.googleapis.com/cilium.NetworkPolicy";

/// Fully-qualified gRPC service name.
pub const DISCOVERY_SERVICE: &str = "cilium.NetworkPolicyDiscoveryService";
/// gRPC path of the bidirectional stream.
pub const STREAM_NETWORK_POLICIES_PATH: &str =
    "/cilium.NetworkPolicyDiscoveryService/StreamNetworkPolicies";
/// gRPC path of the unary fetch.
pub const FETCH_NETWORK_POLICIES_PATH: &str =
    "/cilium.NetworkPolicyDiscoveryService/FetchNetworkPolicies";
/// HTTP mapping of the unary fetch (`POST`, protobuf body).
pub const HTTP_DISCOVERY_PATH: &str = "/v2/discovery:network_policies";

#[derive(Clone, PartialEq, Message)]
pub struct Node {
    #[prost(string, tag = "1")]
    pub id: String,
}

/// `google.rpc.Status` subset used for NACK details.
#[derive(Clone, PartialEq, Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct DiscoveryRequest {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, optional, tag = "2")]
    pub node: Option<Node>,
    /// Empty means "all resources of this type".
    #[prost(string, repeated, tag = "3")]
    pub resource_names: Vec<String>,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub response_nonce: String,
    /// Set only on NACK.
    #[prost(message, optional, tag = "6")]
    pub error_detail: Option<RpcStatus>,
}

impl DiscoveryRequest {
    /// True when this request rejects the response it echoes.
    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct DiscoveryResponse {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<prost_types::Any>,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub nonce: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SocketProtocol {
    Tcp = 0,
    Udp = 1,
    Sctp = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct NetworkPolicy {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub policy: u64,
    #[prost(message, optional, tag = "3")]
    pub ingress: Option<DirectionNetworkPolicy>,
    #[prost(message, optional, tag = "4")]
    pub egress: Option<DirectionNetworkPolicy>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DirectionNetworkPolicy {
    #[prost(message, repeated, tag = "1")]
    pub per_port_policies: Vec<PortNetworkPolicy>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PortNetworkPolicy {
    /// Destination port; 0 selects every port of `protocol`.
    #[prost(uint32, tag = "1")]
    pub port: u32,
    #[prost(enumeration = "SocketProtocol", tag = "2")]
    pub protocol: i32,
    #[prost(message, repeated, tag = "3")]
    pub rules: Vec<PortNetworkPolicyRule>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PortNetworkPolicyRule {
    #[prost(uint64, repeated, tag = "1")]
    pub remote_policies: Vec<u64>,
    #[prost(oneof = "port_network_policy_rule::L7Rules", tags = "100")]
    pub l7_rules: Option<port_network_policy_rule::L7Rules>,
}

pub mod port_network_policy_rule {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum L7Rules {
        #[prost(message, tag = "100")]
        HttpRules(super::HttpNetworkPolicyRules),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct HttpNetworkPolicyRules {
    #[prost(message, repeated, tag = "1")]
    pub http_rules: Vec<HttpNetworkPolicyRule>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HttpNetworkPolicyRule {
    #[prost(message, repeated, tag = "1")]
    pub headers: Vec<HeaderMatcher>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeaderMatcher {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(oneof = "header_matcher::HeaderMatchSpecifier", tags = "2, 3")]
    pub header_match_specifier: Option<header_matcher::HeaderMatchSpecifier>,
    #[prost(bool, tag = "4")]
    pub case_insensitive: bool,
}

pub mod header_matcher {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum HeaderMatchSpecifier {
        #[prost(string, tag = "2")]
        ExactMatch(String),
        #[prost(bool, tag = "3")]
        PresentMatch(bool),
    }
}

/// Pack a wire `NetworkPolicy` into the `Any` envelope used by responses.
pub fn pack(policy: &NetworkPolicy) -> prost_types::Any {
    prost_types::Any {
        type_url: NETWORK_POLICY_TYPE_URL.to_string(),
        value: policy.encode_to_vec(),
    }
}
