use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::entity::{EntityKind, Parameters};
use crate::server::state::AppState;
use crate::source::ControlPlaneError;

#[derive(Debug, Default, Deserialize)]
pub struct NotifyQuery {
    #[serde(rename = "ignoreCache", default)]
    pub ignore_cache: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

/// Liveness probe
pub async fn ping() -> impl IntoResponse {
    Json(StatusResponse { status: "OK" })
}

/// Resync all services in the background
pub async fn notify_services(
    State(state): State<AppState>,
    Query(query): Query<NotifyQuery>,
) -> impl IntoResponse {
    info!("Notify services requested (ignoreCache={})", query.ignore_cache);
    let listener = state.listener.clone();
    tokio::spawn(async move {
        if let Err(e) = listener.notify_services(!query.ignore_cache).await {
            error!("Forced service notification failed: {}", e);
        }
    });
    Json(StatusResponse { status: "OK" })
}

/// Resync all nodes in the background
pub async fn notify_nodes(
    State(state): State<AppState>,
    Query(query): Query<NotifyQuery>,
) -> impl IntoResponse {
    info!("Notify nodes requested (ignoreCache={})", query.ignore_cache);
    let listener = state.listener.clone();
    tokio::spawn(async move {
        if let Err(e) = listener.notify_nodes(!query.ignore_cache).await {
            error!("Forced node notification failed: {}", e);
        }
    });
    Json(StatusResponse { status: "OK" })
}

fn listing_response(
    kind: EntityKind,
    result: Result<Vec<Parameters>, ControlPlaneError>,
) -> axum::response::Response {
    match result {
        Ok(params) => Json(params).into_response(),
        Err(e) => {
            error!("Failed to list {}s: {}", kind, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Create parameters of every tracked service
pub async fn get_services(State(state): State<AppState>) -> impl IntoResponse {
    listing_response(
        EntityKind::Service,
        state.listener.service_parameters().await,
    )
}

/// Create parameters of every node
pub async fn get_nodes(State(state): State<AppState>) -> impl IntoResponse {
    listing_response(EntityKind::Node, state.listener.node_parameters().await)
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/swarm-listener/ping", get(ping))
        .route("/v1/swarm-listener/notify-services", get(notify_services))
        .route("/v1/swarm-listener/notify-nodes", get(notify_nodes))
        .route("/v1/swarm-listener/get-services", get(get_services))
        .route("/v1/swarm-listener/get-nodes", get(get_nodes))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
