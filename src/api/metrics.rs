//! Generic metric endpoints: paginated scans, latest snapshots, and the
//! storage debug/optimize surface.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::storage::MetricQuery;

fn default_limit() -> usize {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct MetricsParams {
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(rename = "type")]
    pub type_filter: Option<String>,
    pub source_component: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_true")]
    pub sort_desc: bool,
}

/// GET /api/metrics
pub async fn get_all_metrics(
    Query(params): Query<MetricsParams>,
    State(state): State<AppState>,
) -> Json<Value> {
    // Memory safety: hard caps on scan size.
    let limit = params.limit.min(1000);
    let query = MetricQuery {
        start_time: params.start,
        end_time: params.end,
        type_filter: params.type_filter.clone(),
        source_component: params.source_component.clone(),
        limit,
        offset: params.offset,
        sort_desc: params.sort_desc,
        ..Default::default()
    };
    let metrics = state.storage.load_metrics(&query);
    let total = state.storage.count_metrics(
        params.type_filter.as_deref(),
        params.source_component.as_deref(),
    );

    Json(json!({
        "status": "success",
        "count": metrics.len(),
        "offset": params.offset,
        "limit": limit,
        "total": total,
        "metrics": metrics.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LatestParams {
    #[serde(rename = "type")]
    pub type_filter: Option<String>,
}

/// GET /api/metrics/latest - optimized path for `fl_server`, generic
/// newest-row path for everything else.
pub async fn get_latest_metrics(
    Query(params): Query<LatestParams>,
    State(state): State<AppState>,
) -> Json<Value> {
    if params.type_filter.as_deref() == Some("fl_server") {
        let Some(latest) = state.storage.get_latest_fl_metrics() else {
            return Json(json!({
                "status": "success",
                "message": "No FL metrics found",
                "metrics": {},
            }));
        };
        let data = latest.get("data").cloned().unwrap_or_else(|| json!({}));
        let round = latest.get("round").and_then(Value::as_i64).unwrap_or(0);

        let status = if data.get("training_complete").and_then(Value::as_bool).unwrap_or(false) {
            "complete"
        } else if data.get("status").and_then(Value::as_str) == Some("unavailable") {
            "error"
        } else if data.get("evaluating").and_then(Value::as_bool).unwrap_or(false) {
            "evaluating"
        } else if data.get("aggregating").and_then(Value::as_bool).unwrap_or(false) {
            "aggregating"
        } else if round > 0 {
            "training"
        } else {
            "idle"
        };

        let timestamp = latest.get("timestamp").cloned().unwrap_or(Value::Null);
        return Json(json!({
            "status": status,
            "timestamp": timestamp,
            "round": round,
            "accuracy": latest.get("accuracy").cloned().unwrap_or(json!(0.0)),
            "loss": data.get("loss").or_else(|| data.get("latest_loss")).cloned().unwrap_or(json!(0)),
            "clients_connected": data.get("connected_clients").cloned().unwrap_or(json!(0)),
            "clients_total": data.get("total_clients").cloned().unwrap_or(json!(0)),
            "start_time": data.get("start_time").cloned().unwrap_or(timestamp.clone()),
            "last_update": timestamp,
            "training_complete": data.get("training_complete").cloned().unwrap_or(json!(false)),
            "training_duration": data.get("total_training_duration").cloned().unwrap_or(json!(0)),
            "raw_metrics": data,
        }));
    }

    let rows = state.storage.load_metrics(&MetricQuery {
        type_filter: params.type_filter,
        limit: 1,
        sort_desc: true,
        ..Default::default()
    });
    match rows.first() {
        Some(row) => Json(json!({
            "status": "success",
            "timestamp": row.timestamp,
            "metrics": row.to_json(),
        })),
        None => Json(json!({
            "status": "success",
            "message": "No metrics found",
            "metrics": {},
        })),
    }
}

/// GET /api/debug/storage
pub async fn debug_storage(State(state): State<AppState>) -> Json<Value> {
    let db_path = state.storage.db_path();
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    let sample = state.storage.load_metrics(&MetricQuery {
        limit: 5,
        sort_desc: true,
        ..Default::default()
    });
    let sample_types: Vec<&str> = sample.iter().map(|m| m.metric_type.as_str()).collect();

    Json(json!({
        "db_path": db_path.display().to_string(),
        "db_exists": db_path.exists(),
        "db_size_bytes": db_size,
        "storage_output_dir": state.config.metrics_output_dir,
        "total_metrics_count": state.storage.count_metrics(None, None),
        "fl_server_metrics_count": state.storage.count_metrics(Some("fl_server"), None),
        "sample_metrics_count": sample.len(),
        "sample_metric_types": sample_types,
    }))
}

/// POST /api/debug/optimize - manual retention + VACUUM trigger.
pub async fn optimize_database(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let storage = state.storage.clone();
    // Retention and VACUUM block; keep them off the request-serving pool.
    let stats = tokio::task::spawn_blocking(move || {
        storage.cleanup();
        storage.stats()
    })
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": e.to_string()})),
        )
    })?;

    Ok(Json(json!({
        "status": "success",
        "message": "Database optimization completed",
        "table_counts": stats.get("table_counts").cloned().unwrap_or_else(|| json!({})),
        "database_size_mb": stats.get("database_size_mb").cloned().unwrap_or(json!(0.0)),
        "optimization_time": Utc::now().to_rfc3339(),
    })))
}
