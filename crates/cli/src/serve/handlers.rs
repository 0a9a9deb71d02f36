//! HTTP route handlers: health, snapshots, deployments, lanes, ladder.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use policyline_core::ladder::CEILING;
use policyline_core::{calculate_canary_step, DeploymentRequest, Lane, SnapshotId};
use policyline_storage::PolicyStorage;

use super::state::AppState;
use super::{deploy_status, json_error, storage_status};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListDeploymentsQuery {
    #[serde(default)]
    active_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RollbackBody {
    snapshot_id: SnapshotId,
    target: String,
    region: String,
    #[serde(default)]
    activated_by: Option<String>,
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// GET /snapshots
pub(crate) async fn handle_list_snapshots(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_snapshots().await {
        Ok(snapshots) => {
            (StatusCode::OK, Json(serde_json::json!({ "snapshots": snapshots }))).into_response()
        }
        Err(e) => json_error(storage_status(&e), &e.to_string()).into_response(),
    }
}

/// GET /snapshots/{id}/rules
pub(crate) async fn handle_snapshot_rules(
    State(state): State<Arc<AppState>>,
    id: Result<Path<SnapshotId>, PathRejection>,
) -> Response {
    let Path(id) = match id {
        Ok(id) => id,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &e.body_text()).into_response(),
    };

    // An unknown id would otherwise read as an empty rule set.
    if let Err(e) = state.store.inner().get_snapshot(id).await {
        return json_error(storage_status(&e), &e.to_string()).into_response();
    }
    match state.store.rules_for_snapshot(id).await {
        Ok(rules) => (
            StatusCode::OK,
            Json(serde_json::json!({ "snapshotId": id, "rules": rules })),
        )
            .into_response(),
        Err(e) => json_error(storage_status(&e), &e.to_string()).into_response(),
    }
}

/// GET /deployments?activeOnly=true|false
pub(crate) async fn handle_list_deployments(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListDeploymentsQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &e.body_text()).into_response(),
    };
    match state.store.list_deployments(query.active_only).await {
        Ok(deployments) => (
            StatusCode::OK,
            Json(serde_json::json!({ "deployments": deployments })),
        )
            .into_response(),
        Err(e) => json_error(storage_status(&e), &e.to_string()).into_response(),
    }
}

/// POST /deployments
pub(crate) async fn handle_create_deployment(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(b) => b,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &e.body_text()).into_response(),
    };
    if let Err(e) = state.store.inner().get_snapshot(request.snapshot_id).await {
        return json_error(storage_status(&e), &e.to_string()).into_response();
    }

    match state.ledger.create_or_update(&request).await {
        Ok(outcome) => {
            if !outcome.current.noop {
                state.store.invalidate_deployments();
            }
            tracing::info!(
                lane = %request.lane(),
                snapshot_id = request.snapshot_id,
                percent = outcome.current.percent,
                noop = outcome.current.noop,
                "deployment upsert"
            );
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => {
            tracing::warn!(lane = %request.lane(), error = %e, "deployment upsert refused");
            json_error(deploy_status(&e), &e.to_string()).into_response()
        }
    }
}

/// POST /deployments/rollback
pub(crate) async fn handle_rollback(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RollbackBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &e.body_text()).into_response(),
    };
    let lane = Lane::new(body.target, body.region);
    let activated_by = body.activated_by.unwrap_or_else(|| state.activated_by.clone());

    match state
        .ledger
        .rollback(body.snapshot_id, &lane, &activated_by)
        .await
    {
        Ok(outcome) => {
            state.store.invalidate_deployments();
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => json_error(deploy_status(&e), &e.to_string()).into_response(),
    }
}

/// GET /lanes/{target}/{region}/events
pub(crate) async fn handle_lane_events(
    State(state): State<Arc<AppState>>,
    Path((target, region)): Path<(String, String)>,
) -> Response {
    let lane = Lane::new(target, region);
    match state.ledger.lane_events(&lane).await {
        Ok(events) => (
            StatusCode::OK,
            Json(serde_json::json!({ "lane": lane.to_string(), "events": events })),
        )
            .into_response(),
        Err(e) => json_error(deploy_status(&e), &e.to_string()).into_response(),
    }
}

/// GET /ladder/{percent}
pub(crate) async fn handle_ladder(Path(percent): Path<String>) -> Response {
    match parse_percent(&percent) {
        Ok(current) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "current": current,
                "next": calculate_canary_step(current),
            })),
        )
            .into_response(),
        Err(msg) => json_error(StatusCode::BAD_REQUEST, &msg).into_response(),
    }
}

fn parse_percent(raw: &str) -> Result<u8, String> {
    match raw.parse::<u8>() {
        Ok(p) if p <= CEILING => Ok(p),
        _ => Err(format!("percent must be an integer between 0 and {}, got '{}'", CEILING, raw)),
    }
}
