//! Query/streaming HTTP API over the collected metrics and events.

pub mod auth;
pub mod events;
pub mod fl;
pub mod metrics;
pub mod network;
pub mod policy;
pub mod stream;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    middleware as axum_mw,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::clients::fl_server::FlServerClient;
use crate::clients::policy_engine::PolicyEngineClient;
use crate::models::Config;
use crate::monitors::fl::FlMonitor;
use crate::monitors::network::NetworkMonitor;
use crate::storage::MetricsStorage;

/// Everything a handler may need; monitors are optional because each can be
/// disabled independently.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<MetricsStorage>,
    pub config: Arc<Config>,
    pub network_monitor: Option<Arc<NetworkMonitor>>,
    pub fl_monitor: Option<Arc<FlMonitor>>,
    pub fl_client: FlServerClient,
    pub policy_client: Arc<PolicyEngineClient>,
    pub http: reqwest::Client,
    pub fl_cache: Arc<fl::FlMetricsCache>,
}

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/", get(api_docs))
        .route("/metrics", get(metrics::get_all_metrics))
        .route("/metrics/latest", get(metrics::get_latest_metrics))
        .route("/metrics/fl", get(fl::get_fl_metrics))
        .route("/metrics/fl/rounds", get(fl::get_fl_rounds))
        .route("/metrics/fl/status", get(fl::get_fl_status))
        .route("/metrics/fl/config", get(fl::get_fl_config))
        .route("/metrics/stream", get(stream::stream_info))
        .route("/metrics/stream/ws", get(stream::websocket_handler))
        .route("/events", get(events::get_events))
        .route("/events/summary", get(events::get_events_summary))
        .route("/policy/decisions", get(policy::get_policy_decisions))
        .route("/network/topology", get(network::get_network_topology))
        .route("/network/topology/live", get(network::get_live_network_topology))
        .route("/network/flows", get(network::get_network_flows))
        .route("/performance/metrics", get(network::get_performance_metrics))
        .route("/flows/statistics", get(network::get_flow_statistics))
        .route("/debug/storage", get(metrics::debug_storage))
        .route("/debug/optimize", post(metrics::optimize_database))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), auth::basic_auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(collector_status))
        .nest("/api", api_routes)
        .with_state(state.clone());

    if state.config.enable_cors {
        let origins = state.config.api_allowed_origins.clone();
        let cors = if origins.trim() == "*" {
            CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
        } else {
            let parsed: Vec<axum::http::HeaderValue> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_methods(Any)
                .allow_headers(Any)
        };
        info!("Enabling CORS with allowed origins: {}", origins);
        app = app.layer(cors);
    }

    app
}

/// Bind and serve until the shutdown flag flips.
pub async fn run_server(state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("{}:{}", state.config.api_host, state.config.api_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Cannot bind API port at {}", addr))?;
    info!("Metrics API server listening on {}", addr);

    if !state.config.api_auth_enabled {
        warn!("API authentication disabled; all endpoints are open");
    }

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("API server error")?;
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "collector_version": env!("CARGO_PKG_VERSION"),
        "monitors": {
            "policy": state.config.policy_monitor_enabled,
            "fl": state.config.fl_monitor_enabled,
            "network": state.config.network_monitor_enabled,
            "events": state.config.event_monitor_enabled,
        },
    }))
}

async fn collector_status(State(state): State<AppState>) -> Json<Value> {
    let cfg = &state.config;
    let fl_monitoring = state.fl_monitor.as_ref().map(|m| m.get_monitoring_status());
    Json(json!({
        "collector_running": true,
        "api_port": cfg.api_port,
        "storage_dir": cfg.metrics_output_dir,
        "training_mode": cfg.training_mode,
        "intervals": {
            "policy_sec": cfg.policy_monitor_enabled.then_some(cfg.policy_interval_sec),
            "fl_sec": cfg.fl_monitor_enabled.then_some(cfg.fl_interval_sec),
            "network_sec": cfg.network_monitor_enabled.then_some(cfg.network_interval_sec),
            "event_sec": cfg.event_monitor_enabled.then_some(cfg.event_interval_sec),
        },
        "urls": {
            "policy_engine": cfg.policy_monitor_enabled.then_some(cfg.policy_engine_url.clone()),
            "fl_server": cfg.fl_monitor_enabled.then_some(cfg.fl_server_url.clone()),
        },
        "fl_monitoring": fl_monitoring,
    }))
}

async fn api_docs() -> Json<Value> {
    Json(json!({
        "api": "FL Testbed Metrics Collector API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /health": "Health check",
            "GET /status": "Collector status and intervals",
            "GET /api/metrics": "All metrics with filtering options",
            "GET /api/metrics/latest": "Latest metrics snapshot by type",
            "GET /api/metrics/fl": "Federated learning metrics with round tracking",
            "GET /api/metrics/fl/rounds": "Consolidated FL rounds (formats, polling, stats, charts)",
            "GET /api/metrics/fl/status": "Current FL training status",
            "GET /api/metrics/fl/config": "FL configuration aggregated from all sources",
            "GET /api/events": "Events log with component/type/level filters",
            "GET /api/events/summary": "Event counts by component and level",
            "GET /api/policy/decisions": "Policy decisions (proxied to the Policy Engine)",
            "GET /api/network/topology": "Network topology from the latest stored snapshot",
            "GET /api/network/topology/live": "Live topology straight from the SDN controller",
            "GET /api/network/flows": "OpenFlow flows across all switches",
            "GET /api/performance/metrics": "Performance metrics with a 0-100 health score",
            "GET /api/flows/statistics": "Flow statistics with efficiency ratings",
            "POST /api/debug/optimize": "Trigger storage retention and VACUUM",
            "WS /api/metrics/stream/ws": "WebSocket subscriptions for metric updates",
        },
        "fl_rounds_features": {
            "multi_format_support": "detailed, summary and chart response formats",
            "polling_mode": "incremental updates via polling_mode=true with since_round/since_timestamp",
            "multiple_sources": "merges FL server direct access with collector storage",
            "statistics_integration": "optional training statistics with include_stats=true",
        },
        "events_features": {
            "filtering": "source_component/component, event_type, level and time range",
            "real_time": "since_id parameter returns only newer events",
            "compatibility": "canonical and legacy field names are both accepted",
        },
    }))
}
