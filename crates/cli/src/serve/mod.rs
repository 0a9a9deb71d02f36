//! `policyline serve` -- HTTP JSON API over the deployment ledger.
//!
//! Backed by the in-memory store, optionally pre-loaded from a seed file.
//! List endpoints read through a TTL cache that writes invalidate.
//!
//! Endpoints:
//! - GET  /health                          - Server status
//! - GET  /snapshots                       - All snapshots
//! - GET  /snapshots/{id}/rules            - Rules owned by one snapshot
//! - GET  /deployments?activeOnly=bool     - Deployment rows
//! - POST /deployments                     - Deployment upsert
//! - POST /deployments/rollback            - Take a lane to 0%
//! - GET  /lanes/{target}/{region}/events  - Rollout events of one lane
//! - GET  /ladder/{percent}                - Next canary rung
//!
//! All responses use Content-Type: application/json. Errors are
//! `{"error": "..."}`.

mod handlers;
mod state;

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use policyline_core::{Clock, SystemClock};
use policyline_pipeline::{DeployError, DeploymentLedger};
use policyline_storage::{CachedStore, MemoryStorage, StorageError};

use self::handlers::{
    handle_create_deployment, handle_health, handle_ladder, handle_lane_events,
    handle_list_deployments, handle_list_snapshots, handle_not_found, handle_rollback,
    handle_snapshot_rules,
};
use self::state::AppState;
use crate::config::Config;
use crate::seed::SeedFile;

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

fn storage_status(err: &StorageError) -> StatusCode {
    match err {
        StorageError::SnapshotNotFound { .. } => StatusCode::NOT_FOUND,
        StorageError::LaneConflict { .. }
        | StorageError::DuplicateVersion { .. }
        | StorageError::DuplicateRuleName { .. } => StatusCode::CONFLICT,
        StorageError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
        StorageError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn deploy_status(err: &DeployError) -> StatusCode {
    match err {
        DeployError::InvalidPercent { .. } => StatusCode::BAD_REQUEST,
        DeployError::NonMonotonic { .. }
        | DeployError::SkippedRung { .. }
        | DeployError::LaneConflict { .. } => StatusCode::CONFLICT,
        DeployError::Storage(e) => storage_status(e),
    }
}

/// Start the HTTP server, optionally pre-loading a seed.
pub async fn start_server(
    config: Config,
    seed: Option<SeedFile>,
) -> Result<(), Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));

    if let Some(seed) = seed {
        let created = crate::seed::apply_seed(storage.as_ref(), seed).await?;
        tracing::info!(snapshots = created.len(), "seed loaded");
    }

    let state = Arc::new(AppState {
        store: CachedStore::new(storage.clone(), config.cache_ttl(), clock.clone()),
        ledger: DeploymentLedger::with_clock(storage, clock)
            .with_max_lane_retries(config.ledger.max_lane_retries),
        activated_by: config.pipeline.activated_by.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/snapshots", get(handle_list_snapshots))
        .route("/snapshots/{id}/rules", get(handle_snapshot_rules))
        .route(
            "/deployments",
            get(handle_list_deployments).post(handle_create_deployment),
        )
        .route("/deployments/rollback", post(handle_rollback))
        .route("/lanes/{target}/{region}/events", get(handle_lane_events))
        .route("/ladder/{percent}", get(handle_ladder))
        .fallback(handle_not_found)
        .layer(cors)
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "policyline listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down");
    Ok(())
}

/// Wait for Ctrl+C. If the handler cannot be installed, wait forever.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
