//! Metrics snapshot endpoint.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use courier_common::metrics::OpStats;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_snapshot))
}

/// GET /metrics — Per-operation counters since process start.
async fn metrics_snapshot(State(state): State<AppState>) -> Json<BTreeMap<&'static str, OpStats>> {
    Json(state.metrics.snapshot())
}
