//! JSON admin API: policy snapshot summary, flow evaluation, change feed.

pub mod watch;

use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use npds_core::error::NpdsError;
use npds_core::flow::{Direction, FlowDescriptor};
use npds_core::model::{DirectionNetworkPolicy, NetworkPolicy, Protocol};

use crate::app_state::AppState;
use crate::discovery::ClientState;
use crate::store::ChangeNotification;

/// `NpdsError` rendered as `{"code": .., "msg": ..}`.
pub struct ApiError(NpdsError);

impl From<NpdsError> for ApiError {
    fn from(e: NpdsError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            NpdsError::InvalidFlow(_) => StatusCode::BAD_REQUEST,
            NpdsError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "code": self.0.code().as_str(),
            "msg": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct PoliciesView {
    pub revision: u64,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_state: Option<ClientState>,
    pub filters: Vec<FilterView>,
}

#[derive(Debug, Serialize)]
pub struct FilterView {
    pub name: String,
    pub policy: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Vec<PortView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress: Option<Vec<PortView>>,
}

#[derive(Debug, Serialize)]
pub struct PortView {
    pub port: u16,
    pub protocol: Protocol,
    pub rules: usize,
    pub l7: bool,
}

fn ports_view(dir: &DirectionNetworkPolicy) -> Vec<PortView> {
    dir.ports()
        .map(|p| PortView {
            port: p.port(),
            protocol: p.protocol(),
            rules: p.rules().len(),
            l7: p.rules().iter().any(|r| r.l7_rules().is_some()),
        })
        .collect()
}

fn filter_view(np: &NetworkPolicy) -> FilterView {
    FilterView {
        name: np.name().to_string(),
        policy: np.policy(),
        ingress: np.direction(Direction::Ingress).map(ports_view),
        egress: np.direction(Direction::Egress).map(ports_view),
    }
}

pub async fn policies(State(state): State<AppState>) -> Json<PoliciesView> {
    let snapshot = state.store().snapshot();
    Json(PoliciesView {
        revision: snapshot.revision(),
        version: snapshot.version_info().to_string(),
        discovery_state: state.discovery_state(),
        filters: snapshot.set().iter().map(|np| filter_view(np)).collect(),
    })
}

/// `GET /v1/policies/{name}`
pub async fn policy(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<FilterView>, ApiError> {
    let snapshot = state.store().snapshot();
    match snapshot.set().get(&name) {
        Some(np) => Ok(Json(filter_view(np))),
        None => Err(NpdsError::NotFound(format!("no filter named {name:?}")).into()),
    }
}

/// `DELETE /v1/policies/{name}`: withdraws one filter and returns the change.
///
/// The next accepted discovery response replaces the whole set again.
pub async fn withdraw_policy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ChangeNotification>, ApiError> {
    let Some(note) = state.store().withdraw(&name) else {
        return Err(NpdsError::NotFound(format!("no filter named {name:?}")).into());
    };
    let metrics = state.metrics();
    metrics.policy_revision.set(&[], note.revision as i64);
    metrics
        .policies_active
        .set(&[], state.store().snapshot().set().len() as i64);
    tracing::info!(filter = %name, revision = note.revision, "filter withdrawn via admin api");
    Ok(Json(note.as_ref().clone()))
}

/// `POST /v1/evaluate`: flow descriptor in, decision out.
///
/// The body is parsed here rather than through the `Json` extractor so that
/// every malformed flow maps to `INVALID_FLOW`.
pub async fn evaluate(State(state): State<AppState>, body: Bytes) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let result = serde_json::from_slice::<FlowDescriptor>(&body)
        .map_err(|e| NpdsError::InvalidFlow(format!("invalid flow json: {e}")))
        .and_then(|desc| {
            let snapshot = state.store().snapshot();
            npds_core::evaluator::evaluate_descriptor(snapshot.set(), desc, state.enforcement())
        });

    let metrics = state.metrics();
    metrics.evaluate_duration.observe(&[], started.elapsed());
    match result {
        Ok(decision) => {
            metrics.evaluations.inc(&[("decision", decision.as_str())]);
            Ok(Json(json!({ "decision": decision })))
        }
        Err(e) => {
            metrics.evaluations.inc(&[("decision", "invalid")]);
            tracing::debug!(error = %e, "rejected flow");
            Err(e.into())
        }
    }
}
