//! Network topology, flow, and performance endpoints.
//!
//! Topology endpoints always answer with a well-shaped object, even when no
//! data exists yet; dashboards never have to handle 404s here.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use super::AppState;
use crate::storage::MetricQuery;

#[derive(Debug, Deserialize)]
pub struct TopologyParams {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub include_metrics: Option<bool>,
}

fn empty_topology() -> Value {
    json!({
        "nodes": [],
        "links": [],
        "switches": [],
        "hosts": [],
        "timestamp": unix_now(),
    })
}

fn topology_statistics(topology: &Value) -> Value {
    let count = |key: &str| topology.get(key).and_then(Value::as_array).map(Vec::len).unwrap_or(0);
    json!({
        "total_nodes": count("nodes"),
        "total_links": count("links"),
        "total_switches": count("switches"),
        "total_hosts": count("hosts"),
    })
}

/// GET /api/network/topology - latest stored snapshot, falling back to a
/// live query, falling back to an empty shape.
pub async fn get_network_topology(
    Query(params): Query<TopologyParams>,
    State(state): State<AppState>,
) -> Json<Value> {
    let include_metrics = params.include_metrics.unwrap_or(true);

    let stored = state
        .storage
        .load_metrics(&MetricQuery::latest("network"))
        .into_iter()
        .next();

    let (network_data, topology) = match stored {
        Some(row) => {
            let topology = row
                .data
                .get("topology")
                .cloned()
                .unwrap_or_else(empty_topology);
            (row.data, topology)
        }
        None => match &state.network_monitor {
            Some(monitor) => {
                let topology = monitor.get_live_topology().await;
                (json!({"status": "live_collection", "sdn_status": "unknown"}), topology)
            }
            None => {
                let topology = empty_topology();
                let mut result = topology.clone();
                result["statistics"] = topology_statistics(&topology);
                result["timestamp"] = json!(unix_now());
                result["message"] =
                    json!("Network monitoring not available - empty topology returned");
                return Json(result);
            }
        },
    };

    let mut result = json!({
        "timestamp": topology.get("timestamp").cloned().unwrap_or_else(|| json!(unix_now())),
        "collection_time": unix_now(),
        "nodes": topology.get("nodes").cloned().unwrap_or_else(|| json!([])),
        "links": topology.get("links").cloned().unwrap_or_else(|| json!([])),
        "switches": topology.get("switches").cloned().unwrap_or_else(|| json!([])),
        "hosts": topology.get("hosts").cloned().unwrap_or_else(|| json!([])),
    });
    result["statistics"] = topology_statistics(&result);

    if include_metrics {
        result["metrics"] = json!({
            "sdn_status": network_data.get("sdn_status").cloned().unwrap_or(json!("unknown")),
            "switches_count": network_data.get("switches_count").cloned().unwrap_or(json!(0)),
            "links_count": network_data.get("links_count").cloned().unwrap_or(json!(0)),
            "hosts_count": network_data.get("hosts_count").cloned().unwrap_or(json!(0)),
            "performance": network_data.get("performance_metrics").cloned().unwrap_or_else(|| json!({})),
        });
    }

    if params.format.as_deref() == Some("summary") {
        return Json(json!({
            "summary": result["statistics"],
            "status": {
                "sdn_connected": network_data.get("sdn_status").and_then(Value::as_str)
                    == Some("connected"),
            },
            "timestamp": result["timestamp"],
        }));
    }

    Json(result)
}

/// GET /api/network/topology/live - bypasses storage entirely.
pub async fn get_live_network_topology(State(state): State<AppState>) -> Json<Value> {
    match &state.network_monitor {
        Some(monitor) => {
            let topology = monitor.get_live_topology().await;
            let statistics = topology_statistics(&topology);
            Json(json!({
                "topology": topology,
                "timestamp": unix_now(),
                "source": "live_query",
                "statistics": statistics,
            }))
        }
        None => {
            let topology = empty_topology();
            let statistics = topology_statistics(&topology);
            Json(json!({
                "topology": topology,
                "timestamp": unix_now(),
                "source": "no_monitor",
                "statistics": statistics,
                "message": "Network monitor not available - empty topology returned",
            }))
        }
    }
}

/// GET /api/network/flows - raw flow entries across all switches.
pub async fn get_network_flows(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(monitor) = &state.network_monitor else {
        return Ok(Json(json!({
            "flows": [],
            "summary": {"total_flows": 0, "switches_with_flows": 0},
            "timestamp": unix_now(),
            "source": "no_monitor",
        })));
    };

    let sdn = monitor.sdn_client();
    let switches = sdn.get_switches().await.unwrap_or_default();
    let mut all_flows: Vec<Value> = Vec::new();

    for switch in &switches {
        let flows = match sdn.get_flow_stats(switch.dpid).await {
            Ok(flows) => flows,
            Err(e) => {
                error!("Could not get flows for switch {}: {}", switch.dpid, e);
                continue;
            }
        };
        for flow in flows {
            let mut enhanced = flow;
            if !enhanced.is_object() {
                continue;
            }
            enhanced["switch_dpid"] = json!(switch.dpid.to_hex());
            enhanced["switch_name"] = json!(format!("Switch-{}", switch.dpid.to_hex()));
            all_flows.push(enhanced);
        }
    }

    let mut priority_stats = serde_json::Map::new();
    let mut table_stats = serde_json::Map::new();
    for flow in &all_flows {
        let priority = flow.get("priority").and_then(Value::as_i64).unwrap_or(0).to_string();
        let entry = priority_stats.entry(priority).or_insert(json!(0));
        *entry = json!(entry.as_i64().unwrap_or(0) + 1);

        let table = flow.get("table_id").and_then(Value::as_i64).unwrap_or(0).to_string();
        let entry = table_stats.entry(table).or_insert(json!(0));
        *entry = json!(entry.as_i64().unwrap_or(0) + 1);
    }
    let switches_with_flows = all_flows
        .iter()
        .filter_map(|f| f.get("switch_dpid").and_then(Value::as_str))
        .collect::<std::collections::HashSet<_>>()
        .len();

    Ok(Json(json!({
        "flows": all_flows,
        "summary": {
            "total_flows": all_flows.len(),
            "switches_with_flows": switches_with_flows,
            "priority_stats": priority_stats,
            "table_stats": table_stats,
        },
        "timestamp": unix_now(),
        "source": "sdn_controller",
    })))
}

/// Health score over the latest performance numbers, with the per-factor
/// impact breakdown dashboards display.
pub fn health_score(
    avg_latency_ms: f64,
    avg_bandwidth_mbps: f64,
    total_errors: f64,
    flow_count: i64,
) -> (f64, &'static str, Value) {
    let latency_impact = if avg_latency_ms > 50.0 {
        ((avg_latency_ms - 50.0) / 2.0).min(30.0)
    } else {
        0.0
    };
    let bandwidth_impact = if avg_bandwidth_mbps < 10.0 {
        ((10.0 - avg_bandwidth_mbps) * 2.0).min(20.0)
    } else {
        0.0
    };
    let error_impact = if total_errors > 0.0 { (total_errors / 10.0).min(25.0) } else { 0.0 };
    let flow_impact = if flow_count == 0 {
        15.0
    } else if flow_count > 1000 {
        ((flow_count - 1000) as f64 / 100.0).min(10.0)
    } else {
        0.0
    };

    let score = (100.0 - latency_impact - bandwidth_impact - error_impact - flow_impact)
        .clamp(0.0, 100.0);
    let score = (score * 10.0).round() / 10.0;
    let status = if score >= 90.0 {
        "excellent"
    } else if score >= 75.0 {
        "good"
    } else if score >= 50.0 {
        "fair"
    } else {
        "poor"
    };
    let factors = json!({
        "latency_impact": latency_impact,
        "bandwidth_impact": bandwidth_impact,
        "error_impact": error_impact,
        "flow_impact": flow_impact,
    });
    (score, status, factors)
}

/// GET /api/performance/metrics
pub async fn get_performance_metrics(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.network_monitor.is_none() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "Network monitor not available",
                "message": "Network monitoring service is not running",
            })),
        ));
    }

    let Some(row) = state
        .storage
        .load_metrics(&MetricQuery::latest("network"))
        .into_iter()
        .next()
    else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "No performance data available",
                "message": "Unable to collect performance metrics from SDN controller",
                "timestamp": unix_now(),
            })),
        ));
    };

    let data = row.data;
    let performance = data.get("performance_metrics").cloned().unwrap_or_else(|| json!({}));
    let avg_latency = performance
        .pointer("/latency/average_ms")
        .or_else(|| performance.pointer("/latency/average"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let avg_bandwidth = performance
        .pointer("/bandwidth/average_mbps")
        .or_else(|| performance.pointer("/bandwidth/average"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let flow_count = performance.pointer("/flows/total").and_then(Value::as_i64).unwrap_or(0);

    // Port errors are summed across every switch and port.
    let total_errors: f64 = data
        .get("port_metrics")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|switches| switches.values())
        .filter_map(Value::as_object)
        .flat_map(|ports| ports.values())
        .map(|port| {
            port.get("rx_errors").and_then(Value::as_f64).unwrap_or(0.0)
                + port.get("tx_errors").and_then(Value::as_f64).unwrap_or(0.0)
        })
        .sum();

    let (score, status, factors) = health_score(avg_latency, avg_bandwidth, total_errors, flow_count);

    let mut result = performance;
    result["network_health"] = json!({
        "score": score,
        "status": status,
        "factors": factors,
    });
    result["collection_timestamp"] = json!(unix_now());
    result["source"] = json!("sdn_controller");
    Ok(Json(result))
}

/// GET /api/flows/statistics - per-switch counts plus efficiency rating.
pub async fn get_flow_statistics(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(monitor) = &state.network_monitor else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "Network monitor not available",
                "message": "Network monitoring service is not running",
            })),
        ));
    };

    let sdn = monitor.sdn_client();
    let switches = sdn.get_switches().await.unwrap_or_default();
    let flow_stats = monitor.collect_flow_statistics(&switches).await;

    let mut total_flows = 0usize;
    let mut active_flows = 0usize;
    let mut flows_per_switch = serde_json::Map::new();
    let mut priority_distribution = serde_json::Map::new();
    for (dpid, flows) in &flow_stats {
        let flows = flows.as_array().cloned().unwrap_or_default();
        flows_per_switch.insert(dpid.clone(), json!(flows.len()));
        total_flows += flows.len();
        for flow in &flows {
            if flow.get("packet_count").and_then(Value::as_u64).unwrap_or(0) > 0 {
                active_flows += 1;
            }
            let priority = flow.get("priority").and_then(Value::as_i64).unwrap_or(0).to_string();
            let entry = priority_distribution.entry(priority).or_insert(json!(0));
            *entry = json!(entry.as_i64().unwrap_or(0) + 1);
        }
    }

    let efficiency = if total_flows > 0 {
        active_flows as f64 / total_flows as f64 * 100.0
    } else {
        0.0
    };
    let efficiency = (efficiency * 100.0).round() / 100.0;
    let rating = if efficiency >= 80.0 {
        "excellent"
    } else if efficiency >= 60.0 {
        "good"
    } else if efficiency >= 40.0 {
        "fair"
    } else {
        "poor"
    };

    Ok(Json(json!({
        "flow_statistics": flow_stats,
        "utilization_metrics": {
            "efficiency_percentage": efficiency,
            "efficiency_rating": rating,
            "total_flows": total_flows,
            "active_flows": active_flows,
            "idle_flows": total_flows - active_flows,
            "flows_per_switch": flows_per_switch,
            "priority_distribution": priority_distribution,
        },
        "collection_timestamp": unix_now(),
        "source": "sdn_controller",
    })))
}

fn unix_now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_score_factor_breakdown() {
        // 80ms latency, 5 Mbps, 40 errors, 1500 flows.
        let (score, status, factors) = health_score(80.0, 5.0, 40.0, 1500);
        assert_eq!(factors["latency_impact"], 15.0);
        assert_eq!(factors["bandwidth_impact"], 10.0);
        assert_eq!(factors["error_impact"], 4.0);
        assert_eq!(factors["flow_impact"], 5.0);
        assert_eq!(score, 66.0);
        assert_eq!(status, "fair");
    }

    #[test]
    fn healthy_network_scores_100() {
        let (score, status, _) = health_score(10.0, 50.0, 0.0, 100);
        assert_eq!(score, 100.0);
        assert_eq!(status, "excellent");
    }

    #[test]
    fn zero_flows_penalized_and_impacts_capped() {
        let (_, _, factors) = health_score(0.0, 10.0, 0.0, 0);
        assert_eq!(factors["flow_impact"], 15.0);

        let (score, status, factors) = health_score(1000.0, 0.0, 10_000.0, 50_000);
        assert_eq!(factors["latency_impact"], 30.0);
        assert_eq!(factors["bandwidth_impact"], 20.0);
        assert_eq!(factors["error_impact"], 25.0);
        assert_eq!(factors["flow_impact"], 10.0);
        assert_eq!(score, 15.0);
        assert_eq!(status, "poor");
    }
}
