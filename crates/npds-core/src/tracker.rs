//! Per-type version/nonce bookkeeping for the discovery protocol.
//!
//! The tracker is a plain value: the stream reader owns it, consults it for
//! every response, and hands the requests it builds to the writer queue. It
//! performs no I/O, which keeps the ACK/NACK decisions testable in isolation.
//!
//! Staleness rules for a response of a tracked type:
//! - its nonce equals the last nonce already answered (replay), or both nonces
//!   are decimal counters and the new one is not greater;
//! - its version is a decimal counter lower than the accepted one.
//!
//! Both rules are suspended for the first response after `begin_resync`, so a
//! server that restarted its counters can still resync the client.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{NpdsError, Result};
use crate::proto::{DiscoveryRequest, DiscoveryResponse, Node, RpcStatus};

/// gRPC `INVALID_ARGUMENT`, reported in NACK details.
const NACK_STATUS_CODE: i32 = 3;

/// Accepted version of a type and the nonce of the response that carried it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeVersion {
    pub version_info: String,
    pub nonce: String,
}

#[derive(Debug, Clone, Default)]
struct TypeState {
    accepted: TypeVersion,
    /// Nonce of the most recent response answered with ACK or NACK.
    last_nonce: String,
    resync: bool,
}

#[derive(Debug, Clone)]
pub struct VersionTracker {
    node_id: String,
    types: BTreeMap<String, TypeState>,
}

fn counter(s: &str) -> Option<u64> {
    s.parse().ok()
}

impl VersionTracker {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            types: BTreeMap::new(),
        }
    }

    /// Start tracking `type_url` (idempotent).
    pub fn track(&mut self, type_url: &str) {
        self.types.entry(type_url.to_string()).or_default();
    }

    pub fn is_tracked(&self, type_url: &str) -> bool {
        self.types.contains_key(type_url)
    }

    pub fn type_urls(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn accepted(&self, type_url: &str) -> Option<&TypeVersion> {
        self.types.get(type_url).map(|s| &s.accepted)
    }

    pub fn last_nonce(&self, type_url: &str) -> Option<&str> {
        self.types.get(type_url).map(|s| s.last_nonce.as_str())
    }

    fn state(&self, type_url: &str) -> Result<&TypeState> {
        self.types
            .get(type_url)
            .ok_or_else(|| NpdsError::UnsupportedType(type_url.to_string()))
    }

    fn state_mut(&mut self, type_url: &str) -> Result<&mut TypeState> {
        self.types
            .get_mut(type_url)
            .ok_or_else(|| NpdsError::UnsupportedType(type_url.to_string()))
    }

    /// Decide whether `resp` should be processed at all.
    pub fn check_response(&self, resp: &DiscoveryResponse) -> Result<()> {
        let st = self.state(&resp.type_url)?;
        if st.resync {
            return Ok(());
        }

        if !resp.nonce.is_empty() && !st.last_nonce.is_empty() {
            let replay = match (counter(&resp.nonce), counter(&st.last_nonce)) {
                (Some(new), Some(last)) => new <= last,
                _ => resp.nonce == st.last_nonce,
            };
            if replay {
                return Err(NpdsError::StaleNonce(format!(
                    "nonce {} already answered (last {})",
                    resp.nonce, st.last_nonce
                )));
            }
        }

        if let (Some(new), Some(cur)) = (counter(&resp.version_info), counter(&st.accepted.version_info)) {
            if new < cur {
                return Err(NpdsError::StaleNonce(format!(
                    "version {new} is older than accepted {cur}"
                )));
            }
        }
        Ok(())
    }

    /// Record a successfully applied response.
    ///
    /// Refuses to move a decimal version backward unless a resync is pending.
    pub fn record_accepted(&mut self, type_url: &str, version_info: &str, nonce: &str) -> Result<()> {
        let st = self.state_mut(type_url)?;
        if !st.resync {
            if let (Some(new), Some(cur)) = (counter(version_info), counter(&st.accepted.version_info)) {
                if new < cur {
                    return Err(NpdsError::StaleNonce(format!(
                        "refusing to move {type_url} from version {cur} back to {new}"
                    )));
                }
            }
        }
        st.accepted = TypeVersion {
            version_info: version_info.to_string(),
            nonce: nonce.to_string(),
        };
        st.last_nonce = nonce.to_string();
        st.resync = false;
        debug!(type_url, version_info, nonce, "version accepted");
        Ok(())
    }

    /// Record a rejected response; the accepted version is kept.
    pub fn record_rejected(&mut self, type_url: &str, nonce: &str) -> Result<()> {
        let st = self.state_mut(type_url)?;
        st.last_nonce = nonce.to_string();
        st.resync = false;
        debug!(type_url, nonce, kept = %st.accepted.version_info, "version rejected");
        Ok(())
    }

    /// Called after reconnecting: the next response of each type is a full
    /// resync and may carry a fresh nonce sequence or an older version.
    pub fn begin_resync(&mut self) {
        for st in self.types.values_mut() {
            st.resync = true;
        }
    }

    fn node(&self) -> Option<Node> {
        Some(Node {
            id: self.node_id.clone(),
        })
    }

    /// Subscription requests sent when a stream opens, presenting the last
    /// accepted version/nonce of each type (empty on first open).
    pub fn initial_requests(&self) -> Vec<DiscoveryRequest> {
        self.types
            .iter()
            .map(|(type_url, st)| DiscoveryRequest {
                version_info: st.accepted.version_info.clone(),
                node: self.node(),
                resource_names: Vec::new(),
                type_url: type_url.clone(),
                response_nonce: st.accepted.nonce.clone(),
                error_detail: None,
            })
            .collect()
    }

    /// ACK of the most recently accepted response.
    pub fn ack(&self, type_url: &str) -> Result<DiscoveryRequest> {
        let st = self.state(type_url)?;
        Ok(DiscoveryRequest {
            version_info: st.accepted.version_info.clone(),
            node: self.node(),
            resource_names: Vec::new(),
            type_url: type_url.to_string(),
            response_nonce: st.accepted.nonce.clone(),
            error_detail: None,
        })
    }

    /// NACK of the most recently rejected response: echoes the previously
    /// accepted version and the rejected nonce.
    pub fn nack(&self, type_url: &str, detail: &str) -> Result<DiscoveryRequest> {
        let st = self.state(type_url)?;
        Ok(DiscoveryRequest {
            version_info: st.accepted.version_info.clone(),
            node: self.node(),
            resource_names: Vec::new(),
            type_url: type_url.to_string(),
            response_nonce: st.last_nonce.clone(),
            error_detail: Some(RpcStatus {
                code: NACK_STATUS_CODE,
                message: detail.to_string(),
            }),
        })
    }

    /// One-shot fetch request; carries no version or nonce.
    pub fn fetch_request(&self, type_url: &str) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info: String::new(),
            node: self.node(),
            resource_names: Vec::new(),
            type_url: type_url.to_string(),
            response_nonce: String::new(),
            error_detail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::error::ErrorCode;
    use crate::proto::NETWORK_POLICY_TYPE_URL as T;

    fn resp(version: &str, nonce: &str) -> DiscoveryResponse {
        DiscoveryResponse {
            version_info: version.into(),
            resources: vec![],
            type_url: T.into(),
            nonce: nonce.into(),
        }
    }

    fn tracker() -> VersionTracker {
        let mut t = VersionTracker::new("node-a");
        t.track(T);
        t
    }

    #[test]
    fn initial_request_is_empty() {
        let t = tracker();
        let reqs = t.initial_requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].version_info, "");
        assert_eq!(reqs[0].response_nonce, "");
        assert_eq!(reqs[0].type_url, T);
        assert_eq!(reqs[0].node.as_ref().unwrap().id, "node-a");
    }

    #[test]
    fn ack_echoes_version_and_nonce() {
        let mut t = tracker();
        t.record_accepted(T, "3", "7").unwrap();
        let ack = t.ack(T).unwrap();
        assert_eq!(ack.version_info, "3");
        assert_eq!(ack.response_nonce, "7");
        assert!(!ack.is_nack());
    }

    #[test]
    fn nack_keeps_previous_version() {
        let mut t = tracker();
        t.record_accepted(T, "3", "7").unwrap();
        t.record_rejected(T, "8").unwrap();
        let nack = t.nack(T, "bad port").unwrap();
        assert_eq!(nack.version_info, "3");
        assert_eq!(nack.response_nonce, "8");
        assert_eq!(nack.error_detail.unwrap().message, "bad port");
        assert_eq!(t.accepted(T).unwrap().version_info, "3");
    }

    #[test]
    fn replayed_nonce_is_stale() {
        let mut t = tracker();
        t.record_accepted(T, "1", "5").unwrap();
        assert_eq!(t.check_response(&resp("2", "5")).unwrap_err().code(), ErrorCode::StaleNonce);
        assert_eq!(t.check_response(&resp("2", "4")).unwrap_err().code(), ErrorCode::StaleNonce);
        assert!(t.check_response(&resp("2", "6")).is_ok());

        let mut opaque = tracker();
        opaque.record_accepted(T, "v1", "abc").unwrap();
        assert!(opaque.check_response(&resp("v2", "abc")).is_err());
        assert!(opaque.check_response(&resp("v2", "abd")).is_ok());
    }

    #[test]
    fn version_never_moves_backward_without_resync() {
        let mut t = tracker();
        t.record_accepted(T, "5", "1").unwrap();
        assert!(t.check_response(&resp("4", "2")).is_err());
        assert!(t.record_accepted(T, "4", "2").is_err());
        assert_eq!(t.accepted(T).unwrap().version_info, "5");

        t.begin_resync();
        assert!(t.check_response(&resp("4", "1")).is_ok());
        t.record_accepted(T, "4", "1").unwrap();
        assert_eq!(t.accepted(T).unwrap().version_info, "4");
    }

    #[test]
    fn resubscribe_presents_last_accepted_pair() {
        let mut t = tracker();
        t.record_accepted(T, "9", "12").unwrap();
        t.record_rejected(T, "13").unwrap();
        t.begin_resync();
        let req = &t.initial_requests()[0];
        assert_eq!(req.version_info, "9");
        assert_eq!(req.response_nonce, "12");
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let t = tracker();
        let mut r = resp("1", "1");
        r.type_url = "type.googleapis.com/other".into();
        assert_eq!(t.check_response(&r).unwrap_err().code(), ErrorCode::UnsupportedType);
    }
}
