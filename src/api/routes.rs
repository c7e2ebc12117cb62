//! API Routes
//!
//! HTTP endpoints for health, scheduler status, the peer list and metrics.
//! Every handler reads the latest published registry snapshot, never the
//! registry the scheduler is mutating.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::Metrics;
use crate::blacklist::BlacklistFilter;
use crate::config::ConfigHash;
use crate::crawler::SchedulerState;
use crate::registry::NodeRegistry;

/// Default and maximum size of the `/peers` list
const DEFAULT_PEER_LIMIT: usize = 50;
const MAX_PEER_LIMIT: usize = 1000;

/// Shared API state
pub struct ApiState {
    pub scheduler: watch::Receiver<SchedulerState>,
    pub registry: watch::Receiver<Arc<NodeRegistry>>,
    pub config_hash: watch::Receiver<ConfigHash>,
    pub blacklist: Arc<BlacklistFilter>,
    pub metrics: Arc<Metrics>,
}

/// Build the API router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health_check))
        .route("/status", get(get_status))

        // Peers
        .route("/peers", get(get_peers))

        // Metrics
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server until `shutdown` turns true
pub async fn run_api_server(
    port: u16,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("📊 HTTP API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}

/// GET /health - Simple health check
async fn health_check() -> impl IntoResponse {
    "OK"
}

/// GET /status - Scheduler, configuration, blacklist and registry state
async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let scheduler = *state.scheduler.borrow();
    let config_hash = hex::encode(*state.config_hash.borrow());
    let registry = state.registry.borrow().clone();

    let status = serde_json::json!({
        "status": if scheduler == SchedulerState::Stopped { "stopping" } else { "healthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.metrics.uptime_secs(),
        "scheduler": scheduler,
        "config_hash": config_hash,
        "blacklist": state.blacklist.stats(),
        "registry": registry.stats(),
    });

    Json(status)
}

#[derive(Debug, Deserialize)]
struct PeersQuery {
    limit: Option<usize>,
}

/// GET /peers?limit=N - Highest scored peers, best first
async fn get_peers(State(state): State<Arc<ApiState>>, Query(query): Query<PeersQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_PEER_LIMIT).min(MAX_PEER_LIMIT);
    let registry = state.registry.borrow().clone();

    let top = registry.top_n(limit);
    let mut records: Vec<_> = top.all_records().collect();
    records.sort_by(|a, b| b.score.cmp(&a.score));

    let peers: Vec<_> = records
        .iter()
        .map(|p| {
            serde_json::json!({
                "id": p.id().to_string(),
                "ip": p.ip(),
                "tcp_port": p.record.tcp_port,
                "udp_port": p.record.udp_port,
                "seq": p.seq,
                "score": p.score,
                "last_response": p.last_response,
                "client_type": p.client_info.as_ref().map(|c| c.client_type.as_str()),
                "too_many_peers": p.too_many_peers,
            })
        })
        .collect();

    Json(serde_json::json!({
        "count": peers.len(),
        "total": registry.len(),
        "peers": peers,
    }))
}

/// GET /metrics - Prometheus format metrics
async fn get_metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.to_prometheus(),
    )
}

/// GET /metrics/json - JSON format metrics
async fn get_metrics_json(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.metrics.to_json())
}
