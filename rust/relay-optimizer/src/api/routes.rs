//! API Routes
//!
//! Read-only HTTP endpoints for health, selection queries and metrics.
//! Nothing here takes the fleet lock.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::Metrics;
use crate::optimizer::{Optimizer, OptimizerError, RelaySelector};
use crate::types::{PeerRecord, TopologyDocument};

/// Shared API state
pub struct ApiState {
    /// Selection over the shared inventory, without waiting on an empty one
    pub selector: Arc<RelaySelector>,

    /// Optimizers running in this process
    pub optimizers: Vec<Arc<Optimizer>>,

    /// Size used when `/relays` gets no `size`
    pub default_size: usize,

    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
struct SizeQuery {
    size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SelectionQuery {
    best: usize,
    random: usize,
}

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

/// Build the router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health_check))
        .route("/status", get(get_status))

        // Selection
        .route("/relays", get(get_relays))
        .route("/relays/best", get(get_best_and_random))
        .route("/inventory", get(get_inventory))

        // Metrics
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))

        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_api_server(state: Arc<ApiState>, port: u16) -> anyhow::Result<()> {
    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("📊 HTTP API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn relay_json(peer: &PeerRecord) -> serde_json::Value {
    serde_json::json!({
        "address": peer.address,
        "port": peer.port,
        "valency": peer.valency,
        "kind": peer.kind,
        "latency_ms": peer.latency.as_millis() as u64,
    })
}

fn selection_error(e: OptimizerError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        OptimizerError::EmptyInventory => StatusCode::SERVICE_UNAVAILABLE,
        OptimizerError::InvalidSelection(_) => StatusCode::BAD_REQUEST,
        _ => {
            warn!("selection query failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

/// GET /health - Simple health check
async fn health_check() -> impl IntoResponse {
    "OK"
}

/// GET /status - Optimizer state per node
async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let mut nodes = Vec::with_capacity(state.optimizers.len());
    for optimizer in &state.optimizers {
        let node = optimizer.node();
        nodes.push(serde_json::json!({
            "name": node.name,
            "network": node.network,
            "state": optimizer.state(),
            "last_cycle": optimizer.last_report().await,
        }));
    }

    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.metrics.uptime_secs(),
        "nodes": nodes,
    }))
}

/// GET /relays?size=N - Topology document of half best, half random relays
async fn get_relays(State(state): State<Arc<ApiState>>, Query(query): Query<SizeQuery>) -> ApiResult {
    state.metrics.inc_api_queries();

    let size = query.size.unwrap_or(state.default_size);
    let relays = state.selector.relays(size).await.map_err(selection_error)?;
    let document = TopologyDocument::from_peers(&relays);

    serde_json::to_value(document)
        .map(Json)
        .map_err(|e| selection_error(OptimizerError::Task(e.to_string())))
}

/// GET /relays/best?best=B&random=R - Best and random buckets
async fn get_best_and_random(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SelectionQuery>,
) -> ApiResult {
    state.metrics.inc_api_queries();

    let selection = state
        .selector
        .best_and_random(query.best, query.random)
        .await
        .map_err(selection_error)?;

    Ok(Json(serde_json::json!({
        "best": selection.best.iter().map(relay_json).collect::<Vec<_>>(),
        "random": selection.random.iter().map(relay_json).collect::<Vec<_>>(),
    })))
}

/// GET /inventory - Every known relay, ascending by latency
async fn get_inventory(State(state): State<Arc<ApiState>>) -> ApiResult {
    let relays = state.selector.load_once().await.map_err(selection_error)?;
    state.metrics.set_inventory_size(relays.len() as u64);

    Ok(Json(serde_json::json!({
        "count": relays.len(),
        "relays": relays.iter().map(relay_json).collect::<Vec<_>>(),
    })))
}

async fn refresh_inventory_size(state: &ApiState) {
    match state.selector.load_once().await {
        Ok(relays) => state.metrics.set_inventory_size(relays.len() as u64),
        Err(e) => warn!("could not read inventory for metrics: {}", e),
    }
}

/// GET /metrics - Prometheus format metrics
async fn get_metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    refresh_inventory_size(&state).await;

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.to_prometheus(),
    )
}

/// GET /metrics/json - JSON format metrics
async fn get_metrics_json(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    refresh_inventory_size(&state).await;

    Json(state.metrics.to_json())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{encode_peer, InventoryStore, MemoryStore};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn state_with(peers: usize) -> Arc<ApiState> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..peers {
            let peer = PeerRecord::new(format!("10.0.0.{}", i), 3001)
                .with_latency(Duration::from_millis(10 * i as u64 + 5));
            store.set(&peer.inventory_key(), encode_peer(&peer).unwrap()).await.unwrap();
        }

        Arc::new(ApiState {
            selector: Arc::new(RelaySelector::new(store, "mutex".to_string(), 0, Duration::ZERO)),
            optimizers: Vec::new(),
            default_size: 4,
            metrics: Arc::new(Metrics::new()),
        })
    }

    async fn get_json(state: Arc<ApiState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_relays_document() {
        let (status, body) = get_json(state_with(10).await, "/relays?size=6").await;

        assert_eq!(status, StatusCode::OK);
        let producers = body["Producers"].as_array().unwrap();
        assert_eq!(producers.len(), 6);
        assert_eq!(producers[0]["addr"], "10.0.0.0");
        assert_eq!(producers[0]["type"], "regular");
    }

    #[tokio::test]
    async fn test_default_size() {
        let (_, body) = get_json(state_with(10).await, "/relays").await;
        assert_eq!(body["Producers"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_best_and_random_buckets() {
        let (status, body) = get_json(state_with(10).await, "/relays/best?best=2&random=3").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["best"][0]["latency_ms"], 5);
        assert_eq!(body["best"][1]["latency_ms"], 15);
        assert_eq!(body["random"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_inventory_is_unavailable() {
        let (status, body) = get_json(state_with(0).await, "/relays?size=3").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn test_zero_selection_is_rejected() {
        let (status, _) = get_json(state_with(3).await, "/relays/best?best=0&random=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_inventory_and_metrics() {
        let state = state_with(3).await;
        let (_, body) = get_json(state.clone(), "/inventory").await;
        assert_eq!(body["count"], 3);

        let (_, metrics) = get_json(state, "/metrics/json").await;
        assert_eq!(metrics["inventory_size"], 3);
    }
}
