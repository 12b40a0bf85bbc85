//! FL metrics endpoints: combined metric feeds, the consolidated rounds
//! endpoint with format variants and polling mode, training status, and
//! configuration aggregation.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    response::Json,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::AppState;
use crate::models::coerce_f64;
use crate::storage::MetricQuery;

const CACHE_TTL_SECS: u64 = 10;

/// Process-local TTL cache for `/api/metrics/fl`; the whole map is flushed
/// on expiry.
pub struct FlMetricsCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    last_flush: Instant,
    map: std::collections::HashMap<String, Value>,
}

impl Default for FlMetricsCache {
    fn default() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                last_flush: Instant::now(),
                map: std::collections::HashMap::new(),
            }),
        }
    }
}

impl FlMetricsCache {
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock();
        if inner.last_flush.elapsed().as_secs() >= CACHE_TTL_SECS {
            inner.map.clear();
            inner.last_flush = Instant::now();
            return None;
        }
        inner.map.get(key).cloned()
    }

    pub fn put(&self, key: String, value: Value) {
        self.inner.lock().map.insert(key, value);
    }
}

/// Cache key: digest over the ordered, normalized parameter string.
fn cache_key(normalized_params: &str) -> String {
    let digest = Sha256::digest(normalized_params.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn default_fl_limit() -> usize {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct FlMetricsParams {
    #[serde(default = "default_fl_limit")]
    pub limit: usize,
    #[serde(default)]
    pub include_raw: bool,
    #[serde(default = "default_true")]
    pub include_rounds: bool,
    #[serde(default = "default_true")]
    pub consolidate_rounds: bool,
    #[serde(default)]
    pub rounds_only: bool,
    #[serde(default)]
    pub min_round: u64,
    pub max_round: Option<u64>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

/// GET /api/metrics/fl - combined FL server snapshots, individual round
/// metrics and training-progress records in one ordered list.
pub async fn get_fl_metrics(
    Query(params): Query<FlMetricsParams>,
    State(state): State<AppState>,
) -> Json<Value> {
    let started = Instant::now();
    let limit = params.limit.min(1000);

    let key = cache_key(&format!(
        "l{}_ir{}_inc{}_cr{}_ro{}_min{}_max{:?}_st{:?}_et{:?}",
        limit,
        params.include_raw,
        params.include_rounds,
        params.consolidate_rounds,
        params.rounds_only,
        params.min_round,
        params.max_round,
        params.start_time,
        params.end_time,
    ));
    if params.use_cache {
        if let Some(mut cached) = state.fl_cache.get(&key) {
            debug!("Returning cached FL metrics (key: {}...)", &key[..8]);
            cached["cached"] = json!(true);
            cached["cache_key"] = json!(&key[..8]);
            return Json(cached);
        }
    }

    // Individual round metrics are the primary source; snapshots and
    // training-progress records fill the gaps.
    let mut all_rows = if params.include_rounds || params.rounds_only {
        state.storage.load_metrics(&MetricQuery {
            type_prefix: Some("fl_round_".into()),
            limit: limit * 3,
            sort_desc: true,
            start_time: params.start_time.clone(),
            end_time: params.end_time.clone(),
            ..Default::default()
        })
    } else {
        Vec::new()
    };
    if !params.rounds_only {
        for type_filter in ["fl_training_progress", "fl_server"] {
            all_rows.extend(state.storage.load_metrics(&MetricQuery {
                type_filter: Some(type_filter.into()),
                limit: limit.min(500),
                sort_desc: true,
                start_time: params.start_time.clone(),
                end_time: params.end_time.clone(),
                ..Default::default()
            }));
        }
    }

    // De-duplicate by timestamp, preserving order.
    let mut seen_timestamps = std::collections::HashSet::new();
    all_rows.retain(|row| seen_timestamps.insert(row.timestamp.clone()));

    if all_rows.is_empty() {
        let response = json!({
            "metrics": [],
            "count": 0,
            "status": "success",
            "message": "No FL metrics found for the specified criteria",
            "execution_time_ms": elapsed_ms(started),
        });
        if params.use_cache {
            state.fl_cache.put(key, response.clone());
        }
        return Json(response);
    }

    let mut processed_rounds = std::collections::HashSet::new();
    let mut metrics: Vec<Value> = Vec::new();
    for row in &all_rows {
        let entry = if let Some(round_num) = round_from_type(&row.metric_type) {
            if params.consolidate_rounds && !processed_rounds.insert(round_num) {
                continue;
            }
            let mut entry = round_entry_from_metric(round_num, &row.timestamp, &row.data);
            if params.include_raw {
                entry["raw_metrics"] = row.data.clone();
            }
            entry
        } else if row.metric_type == "fl_server" || row.metric_type == "fl_training_progress" {
            snapshot_entry_from_metric(&row.timestamp, &row.data)
        } else {
            continue;
        };

        let round = entry.get("round").and_then(Value::as_u64).unwrap_or(0);
        if round < params.min_round {
            continue;
        }
        if let Some(max_round) = params.max_round {
            if round > max_round {
                continue;
            }
        }
        metrics.push(entry);
        if metrics.len() >= limit {
            break;
        }
    }

    metrics.sort_by(|a, b| {
        let ra = a.get("round").and_then(Value::as_u64).unwrap_or(0);
        let rb = b.get("round").and_then(Value::as_u64).unwrap_or(0);
        ra.cmp(&rb)
    });

    let response = json!({
        "metrics": metrics,
        "count": metrics.len(),
        "status": "success",
        "execution_time_ms": elapsed_ms(started),
        "cached": false,
    });
    if params.use_cache {
        state.fl_cache.put(key, response.clone());
    }
    Json(response)
}

fn round_from_type(metric_type: &str) -> Option<u64> {
    if metric_type.ends_with("_event") {
        return None;
    }
    metric_type.strip_prefix("fl_round_").and_then(|n| n.parse().ok())
}

/// Shape one `fl_round_<N>` payload for the combined feed.
fn round_entry_from_metric(round_num: u64, timestamp: &str, data: &Value) -> Value {
    json!({
        "timestamp": data.get("timestamp").cloned().unwrap_or_else(|| json!(timestamp)),
        "round": round_num,
        "status": data.get("status").cloned().unwrap_or(json!("unknown")),
        "clients_connected": extract_clients(data, round_num),
        "clients_total": data.get("clients").cloned().unwrap_or(json!(0)),
        "accuracy": data.get("accuracy").cloned().unwrap_or(json!(0)),
        "loss": data.get("loss").cloned().unwrap_or(json!(0)),
        "training_complete": data.get("data_state").and_then(Value::as_str) == Some("training_complete")
            || data.get("training_complete").and_then(Value::as_bool).unwrap_or(false),
        "training_duration": data.get("training_duration").cloned().unwrap_or(json!(0)),
        "data_state": data.get("data_state").cloned().unwrap_or(json!("training")),
        "source": "individual_round",
        "model_size_mb": extract_model_size(data, round_num),
    })
}

/// Shape one `fl_server` snapshot, recovering accuracy/loss from nested
/// structures when the top-level fields are missing.
fn snapshot_entry_from_metric(timestamp: &str, data: &Value) -> Value {
    let current_round = data.get("current_round").and_then(Value::as_u64).unwrap_or(0);
    let (accuracy, loss) = extract_snapshot_accuracy(data);
    json!({
        "timestamp": timestamp,
        "round": current_round,
        "status": data.get("status").cloned().unwrap_or(json!("unknown")),
        "clients_connected": data.get("connected_clients").cloned().unwrap_or(json!(0)),
        "clients_total": data.get("connected_clients").cloned().unwrap_or(json!(0)),
        "accuracy": accuracy,
        "loss": loss,
        "training_complete": data.get("training_complete").and_then(Value::as_bool).unwrap_or(false),
        "data_state": data.get("data_state").cloned().unwrap_or(json!("training")),
        "source": "fl_server",
        "model_size_mb": extract_model_size(data, current_round),
    })
}

fn extract_snapshot_accuracy(data: &Value) -> (f64, f64) {
    let mut accuracy = data.get("accuracy").and_then(Value::as_f64).unwrap_or(0.0);
    let mut loss = data.get("loss").and_then(Value::as_f64).unwrap_or(0.0);

    if accuracy == 0.0 {
        if let Some(last) = data.get("last_round_metrics") {
            accuracy = last.get("accuracy").and_then(Value::as_f64).unwrap_or(0.0);
            loss = last.get("loss").and_then(Value::as_f64).unwrap_or(loss);
        }
    }
    if accuracy == 0.0 {
        if let Some(stats) = data.get("training_stats") {
            accuracy = stats
                .get("latest_accuracy")
                .or_else(|| stats.get("best_accuracy"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
        }
    }
    (accuracy, loss)
}

/// Client-count recovery across every field name and nesting the upstream
/// systems have used.
fn extract_clients(data: &Value, round_num: u64) -> i64 {
    let direct = [
        data.get("clients"),
        data.get("clients_connected"),
        data.get("connected_clients"),
        data.get("successful_clients"),
        data.get("participating_clients"),
        data.get("num_clients"),
        data.pointer("/last_round_metrics/clients"),
        data.pointer("/training_stats/participating_clients"),
        rounds_history_field(data, round_num, "clients"),
        data.pointer("/raw_metrics/clients"),
        data.pointer("/raw_metrics/participating_clients"),
    ];
    for candidate in direct.into_iter().flatten() {
        let value = crate::models::coerce_i64(candidate, 0);
        if value > 0 {
            return value;
        }
    }
    0
}

fn extract_model_size(data: &Value, round_num: u64) -> f64 {
    let candidates = [
        data.get("model_size_mb"),
        data.get("model_size"),
        data.pointer("/last_round_metrics/model_size_mb"),
        rounds_history_field(data, round_num, "model_size_mb"),
        data.pointer("/raw_metrics/model_size_mb"),
        data.pointer("/raw_metrics/model_size"),
    ];
    for candidate in candidates.into_iter().flatten() {
        let value = coerce_f64(candidate, 0.0);
        if value > 0.0 {
            return value;
        }
    }
    0.0
}

fn rounds_history_field<'a>(data: &'a Value, round_num: u64, field: &str) -> Option<&'a Value> {
    data.get("rounds_history")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|r| r.get("round").and_then(Value::as_u64) == Some(round_num))
        .and_then(|r| r.get(field))
}

// --- /api/metrics/fl/rounds ------------------------------------------------

fn default_start_round() -> u64 {
    1
}

fn default_rounds_limit() -> usize {
    1000
}

fn default_source() -> String {
    "both".to_string()
}

fn default_format() -> String {
    "detailed".to_string()
}

fn default_sort_order() -> String {
    "asc".to_string()
}

#[derive(Debug, Deserialize)]
pub struct FlRoundsParams {
    #[serde(default = "default_start_round")]
    pub start_round: u64,
    pub end_round: Option<u64>,
    #[serde(default = "default_rounds_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    pub min_accuracy: Option<f64>,
    pub max_accuracy: Option<f64>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_sort_order")]
    pub sort_order: String,
    pub since_round: Option<u64>,
    pub since_timestamp: Option<String>,
    #[serde(default)]
    pub include_stats: bool,
    #[serde(default)]
    pub include_charts: bool,
    #[serde(default)]
    pub polling_mode: bool,
}

/// GET /api/metrics/fl/rounds - the consolidated rounds endpoint. Merges
/// collector storage with the FL server's live view, FL server winning on
/// conflicts, then shapes the result by format.
pub async fn get_fl_rounds(
    Query(params): Query<FlRoundsParams>,
    State(state): State<AppState>,
) -> Json<Value> {
    let started = Instant::now();
    let limit = params.limit.min(10_000);
    let source = params.source.to_ascii_lowercase();
    let format = params.format.to_ascii_lowercase();

    info!(
        "FL rounds request: start={}, end={:?}, limit={}, source={}, format={}",
        params.start_round, params.end_round, limit, source, format
    );

    if params.polling_mode && (params.since_round.is_some() || params.since_timestamp.is_some()) {
        return handle_fl_polling_request(&state, &params, limit).await;
    }

    // Strategy 1: FL server direct access (most up-to-date).
    let mut fl_server_rounds: Vec<Value> = Vec::new();
    let mut total_rounds: u64 = 0;
    let mut latest_round: u64 = 0;
    if source == "fl_server" || source == "both" {
        let mut qp: Vec<(String, String)> = vec![
            ("start_round".into(), params.start_round.to_string()),
            ("limit".into(), limit.to_string()),
            ("offset".into(), params.offset.to_string()),
        ];
        if let Some(end_round) = params.end_round {
            qp.push(("end_round".into(), end_round.to_string()));
        }
        if let Some(min_accuracy) = params.min_accuracy {
            qp.push(("min_accuracy".into(), min_accuracy.to_string()));
        }
        if let Some(max_accuracy) = params.max_accuracy {
            qp.push(("max_accuracy".into(), max_accuracy.to_string()));
        }
        match state.fl_client.get_rounds_raw(&qp).await {
            Ok(body) => {
                fl_server_rounds =
                    body.get("rounds").and_then(Value::as_array).cloned().unwrap_or_default();
                total_rounds = body.get("total_rounds").and_then(Value::as_u64).unwrap_or(0);
                latest_round = body.get("latest_round").and_then(Value::as_u64).unwrap_or(0);
                info!("Retrieved {} rounds from FL server", fl_server_rounds.len());
            }
            Err(e) => warn!("Failed to get rounds from FL server: {:#}", e),
        }
    }

    // Strategy 2: collector storage with enhanced extraction.
    let mut collector_rounds: Vec<Value> = Vec::new();
    if source == "collector" || source == "both" || fl_server_rounds.is_empty() {
        let round_rows = state.storage.load_metrics(&MetricQuery {
            type_prefix: Some("fl_round_".into()),
            limit: limit * 3,
            sort_desc: true,
            ..Default::default()
        });
        let server_rows = state.storage.load_metrics(&MetricQuery {
            type_filter: Some("fl_server".into()),
            limit: limit * 2,
            sort_desc: true,
            ..Default::default()
        });
        let rows: Vec<(String, String, Value)> = round_rows
            .into_iter()
            .chain(server_rows)
            .map(|r| (r.metric_type, r.timestamp, r.data))
            .collect();
        collector_rounds = extract_collector_rounds(
            &rows,
            params.start_round,
            params.end_round,
            params.min_accuracy,
            params.max_accuracy,
        );

        // The dense summary table backfills rounds that retention already
        // pruned from the metrics table.
        let seen: std::collections::HashSet<u64> = collector_rounds
            .iter()
            .filter_map(|r| r.get("round").and_then(Value::as_u64))
            .collect();
        for row in state.storage.get_fl_summary_fast(limit * 2) {
            let Some(round_num) = row.get("round").and_then(Value::as_u64) else { continue };
            if round_num == 0 || seen.contains(&round_num) || round_num < params.start_round {
                continue;
            }
            if params.end_round.is_some_and(|end| round_num > end) {
                continue;
            }
            let accuracy = row.get("accuracy").and_then(Value::as_f64).unwrap_or(0.0);
            if params.min_accuracy.is_some_and(|min| accuracy < min)
                || params.max_accuracy.is_some_and(|max| accuracy > max)
            {
                continue;
            }
            collector_rounds.push(json!({
                "round": round_num,
                "timestamp": row.get("timestamp").cloned().unwrap_or(Value::Null),
                "status": row.get("status").cloned().unwrap_or(json!("complete")),
                "accuracy": accuracy,
                "loss": row.get("loss").cloned().unwrap_or(json!(0)),
                "training_duration": row.get("training_duration").cloned().unwrap_or(json!(0)),
                "model_size_mb": row.get("model_size_mb").cloned().unwrap_or(json!(0)),
                "clients": row.get("clients_count").cloned().unwrap_or(json!(0)),
                "clients_connected": row.get("clients_count").cloned().unwrap_or(json!(0)),
                "data_source": "collector_summary",
            }));
        }

        if let Some(max) = collector_rounds
            .iter()
            .filter_map(|r| r.get("round").and_then(Value::as_u64))
            .max()
        {
            latest_round = latest_round.max(max);
        }
        info!("Retrieved {} rounds from collector storage", collector_rounds.len());
    }

    let fl_server_count = fl_server_rounds.len();
    let collector_count = collector_rounds.len();

    let mut rounds_data = merge_rounds(collector_rounds, fl_server_rounds);
    if params.sort_order.eq_ignore_ascii_case("desc") {
        rounds_data.reverse();
    }
    let total_available = rounds_data.len() as u64;
    rounds_data.truncate(limit);
    if total_rounds == 0 {
        total_rounds = total_available;
    }

    let response = build_fl_rounds_response(
        rounds_data,
        total_rounds,
        latest_round,
        limit,
        params.offset,
        &format,
        params.include_stats,
        params.include_charts,
        &params,
        fl_server_count,
        collector_count,
        started,
    );
    Json(response)
}

async fn handle_fl_polling_request(
    state: &AppState,
    params: &FlRoundsParams,
    limit: usize,
) -> Json<Value> {
    let rows = state.storage.load_metrics(&MetricQuery {
        type_prefix: Some("fl_round_".into()),
        limit: limit * 2,
        sort_desc: true,
        start_time: params.since_timestamp.clone(),
        ..Default::default()
    });

    let mut new_rounds: Vec<Value> = Vec::new();
    let mut latest_round: u64 = 0;
    for row in rows {
        let Some(round_num) = round_from_type(&row.metric_type) else { continue };
        if let Some(since_round) = params.since_round {
            if round_num <= since_round {
                continue;
            }
        }
        let data = &row.data;
        new_rounds.push(json!({
            "round": round_num,
            "timestamp": data.get("timestamp").cloned().unwrap_or_else(|| json!(row.timestamp)),
            "status": data.get("status").cloned().unwrap_or(json!("complete")),
            "accuracy": data.get("accuracy").cloned().unwrap_or(json!(0)),
            "loss": data.get("loss").cloned().unwrap_or(json!(0)),
            "training_duration": data.get("training_duration").cloned().unwrap_or(json!(0)),
            "clients": data.get("clients").cloned().unwrap_or(json!(0)),
            "data_source": data.get("data_source").cloned().unwrap_or(json!("collector")),
            "training_complete": data.get("training_complete").cloned().unwrap_or(json!(false)),
        }));
        latest_round = latest_round.max(round_num);
    }
    new_rounds.sort_by_key(|r| r.get("round").and_then(Value::as_u64).unwrap_or(0));
    new_rounds.truncate(limit);
    let has_more = new_rounds.len() == limit;

    let fl_server_latest = state
        .fl_client
        .get_rounds_latest(1)
        .await
        .map(|resp| resp.latest_round)
        .unwrap_or(0);

    Json(json!({
        "new_rounds": new_rounds,
        "count": new_rounds.len(),
        "latest_round_collector": latest_round,
        "latest_round_fl_server": fl_server_latest,
        "since_round": params.since_round,
        "has_more": has_more,
        "timestamp": Utc::now().to_rfc3339(),
        "polling_mode": true,
    }))
}

/// Extract round records from stored metric rows, applying the round and
/// accuracy filters. Deduplicates by round number (first writer wins, and
/// `fl_round_<N>` rows are fed before snapshots).
pub fn extract_collector_rounds(
    rows: &[(String, String, Value)],
    start_round: u64,
    end_round: Option<u64>,
    min_accuracy: Option<f64>,
    max_accuracy: Option<f64>,
) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (metric_type, timestamp, data) in rows {
        let round_num = round_from_type(metric_type)
            .or_else(|| data.get("round").and_then(Value::as_u64))
            .or_else(|| data.get("current_round").and_then(Value::as_u64))
            .unwrap_or(0);
        if round_num == 0 {
            continue;
        }
        if round_num < start_round {
            continue;
        }
        if let Some(end_round) = end_round {
            if round_num > end_round {
                continue;
            }
        }

        let accuracy = data
            .get("accuracy")
            .and_then(Value::as_f64)
            .filter(|a| *a > 0.0)
            .or_else(|| data.pointer("/last_round_metrics/accuracy").and_then(Value::as_f64))
            .or_else(|| {
                rounds_history_field(data, round_num, "accuracy").and_then(Value::as_f64)
            })
            .unwrap_or(0.0);
        if let Some(min_accuracy) = min_accuracy {
            if accuracy < min_accuracy {
                continue;
            }
        }
        if let Some(max_accuracy) = max_accuracy {
            if accuracy > max_accuracy {
                continue;
            }
        }
        if !seen.insert(round_num) {
            continue;
        }

        let loss = data
            .get("loss")
            .and_then(Value::as_f64)
            .filter(|l| *l > 0.0)
            .or_else(|| data.pointer("/last_round_metrics/loss").and_then(Value::as_f64))
            .or_else(|| rounds_history_field(data, round_num, "loss").and_then(Value::as_f64))
            .unwrap_or(0.0);
        let clients = extract_clients(data, round_num);

        out.push(json!({
            "round": round_num,
            "timestamp": data.get("timestamp").cloned().unwrap_or_else(|| json!(timestamp)),
            "status": data.get("status").cloned().unwrap_or(json!("complete")),
            "accuracy": accuracy,
            "loss": loss,
            "training_duration": data.get("training_duration").cloned().unwrap_or(json!(0)),
            "model_size_mb": extract_model_size(data, round_num),
            "clients": clients,
            "clients_connected": clients,
            "data_source": "collector",
        }));
    }
    out
}

/// Merge collector and FL-server rounds into one ascending list; FL server
/// data overwrites collector data for the same round.
pub fn merge_rounds(collector: Vec<Value>, fl_server: Vec<Value>) -> Vec<Value> {
    let mut map: BTreeMap<u64, Value> = BTreeMap::new();
    for round in collector {
        if let Some(n) = round.get("round").and_then(Value::as_u64) {
            map.insert(n, round);
        }
    }
    for mut round in fl_server {
        if !round.is_object() {
            continue;
        }
        let Some(n) = round.get("round").and_then(Value::as_u64) else { continue };
        if n == 0 {
            continue;
        }
        round["data_source"] = json!("fl_server");
        map.insert(n, round);
    }
    map.into_values().collect()
}

#[allow(clippy::too_many_arguments)]
fn build_fl_rounds_response(
    mut rounds_data: Vec<Value>,
    total_rounds: u64,
    latest_round: u64,
    limit: usize,
    offset: usize,
    format: &str,
    include_stats: bool,
    include_charts: bool,
    params: &FlRoundsParams,
    fl_server_count: usize,
    collector_count: usize,
    started: Instant,
) -> Value {
    if format == "summary" {
        for round in &mut rounds_data {
            if let Some(obj) = round.as_object_mut() {
                obj.remove("raw_metrics");
                obj.remove("training_duration");
                obj.remove("model_size_mb");
            }
        }
    }

    let mut response = json!({
        "rounds": rounds_data,
        "total_rounds": total_rounds,
        "returned_rounds": 0,
        "latest_round": latest_round,
        "pagination": {
            "limit": limit,
            "offset": offset,
        },
        "filters": {
            "start_round": params.start_round,
            "end_round": params.end_round,
            "min_accuracy": params.min_accuracy,
            "max_accuracy": params.max_accuracy,
            "source": params.source,
            "format": format,
            "sort_order": params.sort_order,
        },
        "sources_used": {
            "fl_server_rounds": fl_server_count,
            "collector_rounds": collector_count,
        },
    });

    let rounds = response["rounds"].as_array().cloned().unwrap_or_default();
    response["returned_rounds"] = json!(rounds.len());
    response["sources_used"]["merged_rounds"] = json!(rounds.len());
    response["pagination"]["has_more"] = json!((offset + rounds.len()) < total_rounds as usize);

    if format == "chart" || include_charts {
        let field = |name: &str| -> Vec<Value> {
            rounds.iter().map(|r| r.get(name).cloned().unwrap_or(Value::Null)).collect()
        };
        response["chart_data"] = json!({
            "accuracy": field("accuracy"),
            "loss": field("loss"),
            "rounds": field("round"),
            "timestamps": field("timestamp"),
            "clients": field("clients"),
        });
    }
    if include_charts {
        response["chart_optimization"] = json!({
            "data_optimized_for_charts": true,
            "recommended_chart_types": ["line", "area", "scatter"],
            "data_points": rounds.len(),
        });
    }

    if include_stats && !rounds.is_empty() {
        let completed: Vec<&Value> = rounds
            .iter()
            .filter(|r| r.get("accuracy").and_then(Value::as_f64).unwrap_or(0.0) > 0.0)
            .collect();
        if !completed.is_empty() {
            let accuracies: Vec<f64> = completed
                .iter()
                .filter_map(|r| r.get("accuracy").and_then(Value::as_f64))
                .collect();
            let best = accuracies.iter().cloned().fold(f64::MIN, f64::max);
            let latest = *accuracies.last().unwrap_or(&0.0);
            let average = accuracies.iter().sum::<f64>() / accuracies.len() as f64;
            let improvement = if accuracies.len() > 1 {
                accuracies[accuracies.len() - 1] - accuracies[0]
            } else {
                0.0
            };
            let duration_total: f64 = rounds
                .iter()
                .filter_map(|r| r.get("training_duration").map(|v| coerce_f64(v, 0.0)))
                .sum();
            response["statistics"] = json!({
                "total_rounds": rounds.len(),
                "completed_rounds": completed.len(),
                "best_accuracy": best,
                "latest_accuracy": latest,
                "average_accuracy": average,
                "accuracy_improvement": improvement,
                "training_duration_total": duration_total,
            });
        }
    }

    response["metadata"] = json!({
        "execution_time_ms": elapsed_ms(started),
        "response_timestamp": Utc::now().to_rfc3339(),
        "api_version": "2.0_consolidated",
    });
    response
}

// --- /api/metrics/fl/status ------------------------------------------------

/// GET /api/metrics/fl/status - single training-state snapshot preferring
/// the FL server, with stored metrics and the Policy Engine as fallbacks.
pub async fn get_fl_status(State(state): State<AppState>) -> Json<Value> {
    let mut status = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "training_active": false,
        "current_round": 0,
        "latest_accuracy": 0.0,
        "latest_loss": 0.0,
        "connected_clients": 0,
        "training_complete": false,
        "data_source": "fl_server_direct",
        "fl_server_available": false,
        "collector_monitoring": true,
        "max_rounds": Value::Null,
        "stopped_by_policy": false,
    });

    if state.fl_client.health().await {
        status["fl_server_available"] = json!(true);

        if let Ok(server_status) = state.fl_client.get_status().await {
            status["stopped_by_policy"] = json!(server_status
                .get("training_stopped_by_policy")
                .and_then(Value::as_bool)
                .unwrap_or(false));
        }
        if let Ok(metrics) = state.fl_client.get_metrics().await {
            if let Some(max_rounds) = metrics
                .get("max_rounds")
                .or_else(|| metrics.get("rounds"))
                .and_then(Value::as_u64)
            {
                status["max_rounds"] = json!(max_rounds);
            }
        }
        match state.fl_client.get_rounds_latest(1).await {
            Ok(latest) => {
                status["current_round"] = json!(latest.latest_round);
                if let Some(round) = latest.rounds.first() {
                    status["latest_accuracy"] = json!(round.accuracy);
                    status["latest_loss"] = json!(round.loss);
                    status["connected_clients"] =
                        json!(crate::models::coerce_i64(&round.clients, 0));
                    status["training_complete"] = json!(round.training_complete);
                }
            }
            Err(e) => warn!("FL rounds endpoint failed during status: {:#}", e),
        }
    }

    // max_rounds recovery chain: policy engine, then stored snapshots.
    if status["max_rounds"].is_null() {
        let url = format!("{}/check", state.config.policy_engine_url);
        let body = json!({
            "policy_type": "fl_training_parameters",
            "context": {
                "server_id": "default-server",
                "operation": "training_configuration",
                "current_round": status["current_round"],
                "timestamp": Utc::now().timestamp(),
            },
        });
        if let Ok(resp) = state.http.post(&url).json(&body).send().await {
            if resp.status().is_success() {
                if let Ok(result) = resp.json::<Value>().await {
                    if let Some(total) =
                        result.pointer("/parameters/total_rounds").and_then(Value::as_u64)
                    {
                        status["max_rounds"] = json!(total);
                    }
                }
            }
        }
    }
    if status["max_rounds"].is_null() {
        if let Some(row) = state
            .storage
            .load_metrics(&MetricQuery::latest("fl_server"))
            .into_iter()
            .next()
        {
            if let Some(max_rounds) = row
                .data
                .get("max_rounds")
                .or_else(|| row.data.get("rounds"))
                .and_then(Value::as_u64)
            {
                status["max_rounds"] = json!(max_rounds);
            }
        }
    }

    // Final determination of training_active.
    let current_round = status["current_round"].as_u64().unwrap_or(0);
    let max_rounds = status["max_rounds"].as_u64();
    let training_complete = status["training_complete"].as_bool().unwrap_or(false);
    let stopped_by_policy = status["stopped_by_policy"].as_bool().unwrap_or(false);
    let fl_server_available = status["fl_server_available"].as_bool().unwrap_or(false);

    let training_active = if stopped_by_policy || training_complete {
        false
    } else if current_round > 0 && fl_server_available {
        match max_rounds {
            Some(max) if current_round >= max => {
                status["training_complete"] = json!(true);
                false
            }
            _ => true,
        }
    } else {
        false
    };
    status["training_active"] = json!(training_active);

    info!(
        "FL status final: round {}/{}, complete: {}, active: {}",
        current_round,
        max_rounds.map(|m| m.to_string()).unwrap_or_else(|| "?".into()),
        status["training_complete"],
        training_active
    );
    Json(status)
}

// --- /api/metrics/fl/config ------------------------------------------------

/// GET /api/metrics/fl/config - aggregates configuration from storage, the
/// FL server, the Policy Engine and CONFIG_LOADED events, reporting how
/// complete the picture is.
pub async fn get_fl_config(State(state): State<AppState>) -> Json<Value> {
    let started = Instant::now();
    let mut config = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "fl_server": {},
        "policy_engine": {},
        "training_parameters": {},
        "model_config": {},
        "federation_config": {},
        "data_sources": [],
        "status": "unknown",
    });
    let mut sources: Vec<&str> = Vec::new();

    // Strategy 1: latest stored fl_server snapshot.
    if let Some(row) = state
        .storage
        .load_metrics(&MetricQuery::latest("fl_server"))
        .into_iter()
        .next()
    {
        let data = &row.data;
        let model = placeholder_aware(data.get("model"));
        let dataset = placeholder_aware(data.get("dataset"));
        config["fl_server"] = json!({
            "model": model,
            "dataset": dataset,
            "total_rounds": data.get("max_rounds").or_else(|| data.get("rounds")).cloned().unwrap_or(json!(0)),
            "current_round": data.get("current_round").cloned().unwrap_or(json!(0)),
            "min_clients": data.get("min_clients").cloned().unwrap_or(json!(0)),
            "min_available_clients": data.get("min_available_clients").cloned().unwrap_or(json!(0)),
            "training_complete": data.get("training_complete").cloned().unwrap_or(json!(false)),
            "source": "collector_storage",
        });
        if let Some(model_config) = data.get("model_config") {
            config["model_config"] = model_config.clone();
        }
        sources.push("fl_server_collector");
        let pending = config["fl_server"]["model"]
            .as_str()
            .map(|m| m.contains("Pending") || m == "unknown")
            .unwrap_or(true);
        config["status"] = json!(if pending { "minimal" } else { "partial" });
    }

    // Strategy 2: the FL server directly.
    if let Ok(metrics) = state.fl_client.get_metrics().await {
        let existing = config["fl_server"].clone();
        let pick = |key: &str, alt: Option<&str>| -> Value {
            metrics
                .get(key)
                .or_else(|| alt.and_then(|a| metrics.get(a)))
                .cloned()
                .unwrap_or_else(|| existing.get(key).cloned().unwrap_or(Value::Null))
        };
        config["fl_server"] = json!({
            "model": pick("model", None),
            "dataset": pick("dataset", None),
            "total_rounds": metrics.get("max_rounds").or_else(|| metrics.get("rounds")).cloned()
                .unwrap_or_else(|| existing.get("total_rounds").cloned().unwrap_or(json!(0))),
            "current_round": pick("current_round", None),
            "min_clients": pick("min_clients", None),
            "min_available_clients": pick("min_available_clients", None),
            "training_complete": pick("training_complete", None),
            "source": "fl_server_direct",
        });
        sources.push("fl_server_direct");
        config["status"] = json!("enhanced");
    }

    // Strategy 3: policy-derived training parameters.
    let check_url = format!("{}/check", state.config.policy_engine_url);
    let check_body = json!({
        "policy_type": "fl_training_parameters",
        "context": {
            "server_id": "default-server",
            "operation": "training_configuration",
            "model": config["fl_server"].get("model").cloned().unwrap_or(json!("unknown")),
            "dataset": config["fl_server"].get("dataset").cloned().unwrap_or(json!("unknown")),
            "timestamp": Utc::now().timestamp(),
        },
    });
    if let Ok(resp) = state.http.post(&check_url).json(&check_body).send().await {
        if resp.status().is_success() {
            if let Ok(result) = resp.json::<Value>().await {
                if let Some(parameters) = result.get("parameters").filter(|p| !p.is_null()) {
                    config["policy_engine"] = json!({
                        "policy_allowed": result.get("allowed").cloned().unwrap_or(json!(false)),
                        "policy_decision": result.get("decision").cloned().unwrap_or(json!("unknown")),
                        "total_rounds": parameters.get("total_rounds").cloned().unwrap_or(Value::Null),
                        "local_epochs": parameters.get("local_epochs").cloned().unwrap_or(Value::Null),
                        "batch_size": parameters.get("batch_size").cloned().unwrap_or(Value::Null),
                        "learning_rate": parameters.get("learning_rate").cloned().unwrap_or(Value::Null),
                        "min_clients": parameters.get("min_clients").cloned().unwrap_or(Value::Null),
                        "aggregation_strategy": parameters.get("aggregation_strategy").cloned().unwrap_or(Value::Null),
                        "privacy_mechanism": parameters.get("privacy_mechanism").cloned().unwrap_or(Value::Null),
                        "secure_aggregation": parameters.get("secure_aggregation").cloned().unwrap_or(Value::Null),
                        "source": "policy_engine",
                    });
                    config["training_parameters"] = json!({
                        "total_rounds": parameters.get("total_rounds").cloned()
                            .unwrap_or_else(|| config["fl_server"].get("total_rounds").cloned().unwrap_or(Value::Null)),
                        "local_epochs": parameters.get("local_epochs").cloned().unwrap_or(json!(1)),
                        "batch_size": parameters.get("batch_size").cloned().unwrap_or(json!(32)),
                        "learning_rate": parameters.get("learning_rate").cloned().unwrap_or(json!(0.01)),
                        "aggregation_strategy": parameters.get("aggregation_strategy").cloned().unwrap_or(json!("fedavg")),
                        "evaluation_strategy": parameters.get("evaluation_strategy").cloned().unwrap_or(json!("centralized")),
                        "privacy_mechanism": parameters.get("privacy_mechanism").cloned().unwrap_or(json!("none")),
                        "secure_aggregation": parameters.get("secure_aggregation").cloned().unwrap_or(json!(false)),
                    });
                    sources.push("policy_engine");
                    config["status"] = json!("comprehensive");
                }
            }
        }
    }

    // Strategy 4: CONFIG_LOADED event from the FL server.
    let config_events = state.storage.load_events(&crate::storage::EventQuery {
        source_component: Some("FL_SERVER".into()),
        event_type: Some("CONFIG_LOADED".into()),
        limit: 1,
        sort_desc: true,
        ..Default::default()
    });
    if let Some(event) = config_events.first() {
        if let Some(summary) = event.pointer("/details/config_summary") {
            config["federation_config"] = json!({
                "model": summary.get("model").cloned().unwrap_or(Value::Null),
                "dataset": summary.get("dataset").cloned().unwrap_or(Value::Null),
                "rounds": summary.get("rounds").cloned().unwrap_or(Value::Null),
                "min_clients": summary.get("min_clients").cloned().unwrap_or(Value::Null),
                "min_available_clients": summary.get("min_available_clients").cloned().unwrap_or(Value::Null),
                "source": "fl_server_events",
                "timestamp": event.get("timestamp").cloned().unwrap_or(Value::Null),
            });
            sources.push("fl_server_events");
        }
    }

    if config["training_parameters"].as_object().map(|o| o.is_empty()).unwrap_or(true) {
        config["training_parameters"] = json!({
            "total_rounds": config["fl_server"].get("total_rounds").cloned().unwrap_or(json!(0)),
            "local_epochs": Value::Null,
            "batch_size": Value::Null,
            "learning_rate": Value::Null,
            "aggregation_strategy": Value::Null,
            "privacy_mechanism": Value::Null,
            "secure_aggregation": Value::Null,
        });
    }
    if config["status"] == json!("unknown") && !sources.is_empty() {
        config["status"] = json!("basic");
    }

    config["data_sources"] = json!(sources);
    config["metadata"] = json!({
        "execution_time_ms": elapsed_ms(started),
        "data_sources_used": sources,
        "config_completeness": config["status"],
        "timestamp": Utc::now().to_rfc3339(),
        "api_version": "2.0",
    });
    Json(config)
}

/// Placeholder model/dataset names read as "Configuration Pending".
fn placeholder_aware(value: Option<&Value>) -> Value {
    match value.and_then(Value::as_str) {
        Some(name) => {
            let upper = name.to_ascii_uppercase();
            if upper.contains("FALLBACK") || upper.contains("UNKNOWN") || upper.contains("DEFAULT") {
                json!("Configuration Pending")
            } else {
                json!(name)
            }
        }
        None => json!("unknown"),
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_fl_server_for_same_round() {
        let collector = vec![json!({"round": 5, "accuracy": 0.70, "clients": 3, "data_source": "collector"})];
        let fl_server = vec![json!({"round": 5, "accuracy": 0.71, "clients": 4})];
        let merged = merge_rounds(collector, fl_server);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["accuracy"], 0.71);
        assert_eq!(merged[0]["clients"], 4);
        assert_eq!(merged[0]["data_source"], "fl_server");
    }

    #[test]
    fn merge_keeps_disjoint_rounds_sorted() {
        let collector = vec![
            json!({"round": 2, "accuracy": 0.5}),
            json!({"round": 1, "accuracy": 0.4}),
        ];
        let fl_server = vec![json!({"round": 3, "accuracy": 0.6})];
        let merged = merge_rounds(collector, fl_server);
        let rounds: Vec<u64> =
            merged.iter().map(|r| r["round"].as_u64().unwrap()).collect();
        assert_eq!(rounds, vec![1, 2, 3]);
    }

    #[test]
    fn collector_extraction_reads_round_metrics_and_snapshots() {
        let rows = vec![
            (
                "fl_round_3".to_string(),
                "2025-01-01T00:00:00Z".to_string(),
                json!({"accuracy": 0.842, "loss": 0.055, "clients": 4, "training_duration": 7.1, "model_size_mb": 1.73}),
            ),
            (
                "fl_server".to_string(),
                "2025-01-01T00:01:00Z".to_string(),
                json!({"current_round": 4, "last_round_metrics": {"accuracy": 0.85, "loss": 0.05},
                       "rounds_history": [{"round": 4, "clients": 5, "model_size_mb": 1.8}]}),
            ),
        ];
        let rounds = extract_collector_rounds(&rows, 1, None, None, None);
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0]["round"], 3);
        assert_eq!(rounds[0]["accuracy"], 0.842);
        assert_eq!(rounds[1]["round"], 4);
        assert_eq!(rounds[1]["accuracy"], 0.85);
        assert_eq!(rounds[1]["clients"], 5);
        assert_eq!(rounds[1]["model_size_mb"], 1.8);
    }

    #[test]
    fn collector_extraction_applies_filters_and_skips_event_mirrors() {
        let rows = vec![
            ("fl_round_1".to_string(), "t".to_string(), json!({"accuracy": 0.2})),
            ("fl_round_2".to_string(), "t".to_string(), json!({"accuracy": 0.9})),
            ("fl_round_2_event".to_string(), "t".to_string(), json!({"round": 2, "accuracy": 0.1})),
        ];
        let rounds = extract_collector_rounds(&rows, 1, None, Some(0.5), None);
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0]["round"], 2);
        assert_eq!(rounds[0]["accuracy"], 0.9);
    }

    #[test]
    fn summary_format_strips_detail_fields() {
        let params = FlRoundsParams {
            start_round: 1,
            end_round: None,
            limit: 10,
            offset: 0,
            min_accuracy: None,
            max_accuracy: None,
            source: "both".into(),
            format: "summary".into(),
            sort_order: "asc".into(),
            since_round: None,
            since_timestamp: None,
            include_stats: false,
            include_charts: false,
            polling_mode: false,
        };
        let rounds = vec![json!({
            "round": 3, "accuracy": 0.842, "loss": 0.055, "clients": 4,
            "training_duration": 7.1, "model_size_mb": 1.73,
        })];
        let response = build_fl_rounds_response(
            rounds,
            1,
            3,
            10,
            0,
            "summary",
            false,
            false,
            &params,
            1,
            0,
            Instant::now(),
        );
        let round = &response["rounds"][0];
        assert_eq!(round["round"], 3);
        assert_eq!(round["accuracy"], 0.842);
        assert_eq!(round["clients"], 4);
        assert!(round.get("training_duration").is_none());
        assert!(round.get("model_size_mb").is_none());
        assert!(response["metadata"].get("execution_time_ms").is_some());
    }

    #[test]
    fn stats_and_charts_blocks_attach_on_request() {
        let params = FlRoundsParams {
            start_round: 1,
            end_round: None,
            limit: 10,
            offset: 0,
            min_accuracy: None,
            max_accuracy: None,
            source: "both".into(),
            format: "chart".into(),
            sort_order: "asc".into(),
            since_round: None,
            since_timestamp: None,
            include_stats: true,
            include_charts: false,
            polling_mode: false,
        };
        let rounds = vec![
            json!({"round": 1, "accuracy": 0.4, "loss": 0.5, "clients": 2, "training_duration": 5.0, "timestamp": "a"}),
            json!({"round": 2, "accuracy": 0.6, "loss": 0.3, "clients": 2, "training_duration": 6.0, "timestamp": "b"}),
        ];
        let response = build_fl_rounds_response(
            rounds,
            2,
            2,
            10,
            0,
            "chart",
            true,
            false,
            &params,
            0,
            2,
            Instant::now(),
        );
        assert_eq!(response["chart_data"]["accuracy"], json!([0.4, 0.6]));
        assert_eq!(response["chart_data"]["rounds"], json!([1, 2]));
        let stats = &response["statistics"];
        assert_eq!(stats["completed_rounds"], 2);
        assert_eq!(stats["best_accuracy"], 0.6);
        assert!((stats["accuracy_improvement"].as_f64().unwrap() - 0.2).abs() < 1e-9);
        assert_eq!(stats["training_duration_total"], 11.0);
    }

    #[test]
    fn cache_flushes_whole_map_after_ttl() {
        let cache = FlMetricsCache::default();
        cache.put("k".into(), json!({"v": 1}));
        assert_eq!(cache.get("k"), Some(json!({"v": 1})));

        // Simulate expiry by rewinding the flush clock.
        cache.inner.lock().last_flush = Instant::now()
            .checked_sub(std::time::Duration::from_secs(CACHE_TTL_SECS + 1))
            .unwrap();
        assert_eq!(cache.get("k"), None);
        assert!(cache.inner.lock().map.is_empty());
    }

    #[test]
    fn cache_keys_are_stable_hex_digests() {
        let a = cache_key("l100_irfalse");
        let b = cache_key("l100_irfalse");
        let c = cache_key("l200_irfalse");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
