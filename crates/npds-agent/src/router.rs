//! Axum router wiring for the admin server.

use axum::{
    routing::{get, post},
    Router,
};

use crate::{api, app_state::AppState, ops};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(ops::healthz))
        .route("/readyz", get(ops::readyz))
        .route("/metrics", get(ops::metrics))
        .route("/v1/policies", get(api::policies))
        .route("/v1/policies/:name", get(api::policy).delete(api::withdraw_policy))
        .route("/v1/evaluate", post(api::evaluate))
        .route("/v1/watch", get(api::watch::watch_upgrade))
        .with_state(state)
}
