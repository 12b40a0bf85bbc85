//! Network monitor: live topology view and per-port bandwidth derivation.
//!
//! Port-stat history is keyed by `<dpid>-<port_no>`; keys belonging to
//! switches that vanished from the controller are purged so the map never
//! leaks state across reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::clients::sdn::{PortStat, SdnControllerClient, SwitchInfo};
use crate::storage::MetricsStorage;

#[derive(Default)]
struct NetState {
    previous_port_stats: HashMap<String, PortStat>,
    last_stats_timestamp: Option<f64>,
    last_known_dpids: Vec<String>,
}

pub struct NetworkMonitor {
    storage: Arc<MetricsStorage>,
    sdn: SdnControllerClient,
    state: Mutex<NetState>,
}

impl NetworkMonitor {
    pub fn new(storage: Arc<MetricsStorage>, sdn: SdnControllerClient) -> Self {
        info!("NetworkMonitor initialized with SDN controller at {}", sdn.base_url());
        Self {
            storage,
            sdn,
            state: Mutex::new(NetState::default()),
        }
    }

    pub fn sdn_client(&self) -> &SdnControllerClient {
        &self.sdn
    }

    /// Assemble a live topology snapshot straight from the controller.
    /// Always returns a well-shaped object, even when every query fails.
    pub async fn get_live_topology(&self) -> Value {
        let (switches, links, hosts) = tokio::join!(
            self.sdn.get_switches(),
            self.sdn.get_topology_links(),
            self.sdn.get_topology_hosts(),
        );

        let mut nodes: Vec<Value> = Vec::new();
        let mut switch_nodes: Vec<Value> = Vec::new();
        let mut link_entries: Vec<Value> = Vec::new();
        let mut host_nodes: Vec<Value> = Vec::new();

        match switches {
            Ok(switches) => {
                for sw in &switches {
                    let node = json!({
                        "dpid": sw.dpid.to_hex(),
                        "id": sw.dpid.to_hex(),
                        "type": "switch",
                        "ports": sw.ports,
                    });
                    switch_nodes.push(node.clone());
                    nodes.push(node);
                }
            }
            Err(e) => warn!("Error getting switches from SDN controller: {}", e),
        }

        match links {
            Ok(links) => link_entries.extend(links.iter().map(coerce_link)),
            Err(e) => warn!("Error getting topology links: {}", e),
        }

        match hosts {
            Ok(hosts) => {
                for host in hosts {
                    let node = coerce_host(&host);
                    host_nodes.push(node.clone());
                    nodes.push(node);
                }
            }
            Err(e) => warn!("Error getting hosts from SDN controller: {}", e),
        }

        json!({
            "timestamp": unix_now(),
            "nodes": nodes,
            "links": link_entries,
            "switches": switch_nodes,
            "hosts": host_nodes,
            "source": "sdn_controller",
        })
    }

    /// One collection tick: topology, flow statistics, delta bandwidth,
    /// aggregation, and a `network` metric written to storage.
    pub async fn collect_metrics(&self) -> Value {
        let topology = self.get_live_topology().await;
        let current_timestamp = topology
            .get("timestamp")
            .and_then(Value::as_f64)
            .unwrap_or_else(unix_now);

        let switches = self.sdn.get_switches().await.unwrap_or_default();
        self.track_dpid_changes(&switches);

        let performance_metrics = self.sdn.get_performance_metrics().await;
        let flow_statistics = self.collect_flow_statistics(&switches).await;

        let port_metrics = self.collect_port_bandwidth(&switches, current_timestamp).await;
        self.state.lock().last_stats_timestamp = Some(current_timestamp);

        let switches_count = topology["switches"].as_array().map(Vec::len).unwrap_or(0);
        let hosts_count = topology["hosts"].as_array().map(Vec::len).unwrap_or(0);
        let links_count = topology["links"].as_array().map(Vec::len).unwrap_or(0);
        let sdn_status = if switches_count > 0 { "connected" } else { "disconnected" };

        let total_flows: usize = flow_statistics
            .values()
            .map(|flows| flows.as_array().map(Vec::len).unwrap_or(0))
            .sum();
        let active_flows: usize = flow_statistics
            .values()
            .flat_map(|flows| flows.as_array().into_iter().flatten())
            .filter(|f| f.get("packet_count").and_then(Value::as_u64).unwrap_or(0) > 0)
            .count();

        // Active-port averaging: idle ports would dilute the mean to zero.
        let mut total_bandwidth = 0.0;
        let mut max_bandwidth: f64 = 0.0;
        let mut active_ports = 0usize;
        for switch_metrics in port_metrics.values() {
            let empty_map = serde_json::Map::new();
            for port in switch_metrics.as_object().unwrap_or(&empty_map).values() {
                let bw = port.get("total_mbps").and_then(Value::as_f64).unwrap_or(0.0);
                if bw > 0.0 {
                    total_bandwidth += bw;
                    max_bandwidth = max_bandwidth.max(bw);
                    active_ports += 1;
                }
            }
        }
        let avg_bandwidth = if active_ports > 0 {
            total_bandwidth / active_ports as f64
        } else {
            0.0
        };

        let metrics = json!({
            "timestamp": current_timestamp,
            "status": if sdn_status == "connected" { "ok" } else { "error" },
            "switches_count": switches_count,
            "hosts_count": hosts_count,
            "links_count": links_count,
            "topology": topology,
            "port_metrics": port_metrics,
            "sdn_status": sdn_status,
            "performance_metrics": {
                "bandwidth": {
                    "total_mbps": round4(total_bandwidth),
                    "average_mbps": round4(avg_bandwidth),
                    "max_mbps": round4(max_bandwidth),
                    "active_ports": active_ports,
                },
                "flows": {
                    "total": total_flows,
                    "active": active_flows,
                    "per_switch_avg": if switches_count > 0 {
                        (total_flows as f64 / switches_count as f64 * 10.0).round() / 10.0
                    } else {
                        0.0
                    },
                },
                "latency": performance_metrics
                    .get("latency")
                    .cloned()
                    .unwrap_or_else(|| json!({"average_ms": 0.0, "estimated": true})),
            },
            "flow_statistics": flow_statistics,
        });

        self.storage.store_metric("network", &metrics);
        info!(
            "Network metrics collected: {} switches, {} flows, {:.2} Mbps total bandwidth",
            switches_count, total_flows, total_bandwidth
        );
        metrics
    }

    /// Per-switch flow entries with readable match/action descriptions.
    pub async fn collect_flow_statistics(
        &self,
        switches: &[SwitchInfo],
    ) -> serde_json::Map<String, Value> {
        let mut stats = serde_json::Map::new();
        for switch in switches {
            match self.sdn.get_flow_stats(switch.dpid).await {
                Ok(flows) => {
                    let processed: Vec<Value> = flows.iter().map(process_flow_entry).collect();
                    debug!("Collected {} flows for switch {}", processed.len(), switch.dpid);
                    stats.insert(switch.dpid.to_hex(), json!(processed));
                }
                Err(e) => {
                    warn!("Failed to get flow stats for switch {}: {}", switch.dpid, e);
                    stats.insert(switch.dpid.to_hex(), json!([]));
                }
            }
        }
        stats
    }

    async fn collect_port_bandwidth(
        &self,
        switches: &[SwitchInfo],
        current_timestamp: f64,
    ) -> serde_json::Map<String, Value> {
        let elapsed = {
            let state = self.state.lock();
            state.last_stats_timestamp.map(|prev| current_timestamp - prev)
        };
        let mut all_port_metrics = serde_json::Map::new();

        for switch in switches {
            let dpid_hex = switch.dpid.to_hex();
            let stats = match self.sdn.get_port_stats(switch.dpid).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!("Failed to get port stats for switch {}: {}", dpid_hex, e);
                    continue;
                }
            };

            let mut switch_port_metrics = serde_json::Map::new();
            {
                let mut state = self.state.lock();
                if let Some(elapsed) = elapsed.filter(|dt| *dt > 0.0) {
                    for stat in &stats {
                        let key = format!("{}-{}", dpid_hex, stat.port_key());
                        if let Some(prev) = state.previous_port_stats.get(&key) {
                            let (rx_mbps, tx_mbps) = port_bandwidth(prev, stat, elapsed);
                            switch_port_metrics.insert(
                                stat.port_key(),
                                json!({
                                    "rx_mbps": round4(rx_mbps),
                                    "tx_mbps": round4(tx_mbps),
                                    "total_mbps": round4(rx_mbps + tx_mbps),
                                    "rx_packets": stat.rx_packets,
                                    "tx_packets": stat.tx_packets,
                                    "rx_errors": stat.rx_errors,
                                    "tx_errors": stat.tx_errors,
                                }),
                            );
                        }
                    }
                }
                for stat in stats {
                    let key = format!("{}-{}", dpid_hex, stat.port_key());
                    state.previous_port_stats.insert(key, stat);
                }
            }

            if !switch_port_metrics.is_empty() {
                all_port_metrics.insert(dpid_hex, Value::Object(switch_port_metrics));
            }
        }

        all_port_metrics
    }

    /// Log switch arrivals/departures and drop history for vanished DPIDs.
    fn track_dpid_changes(&self, switches: &[SwitchInfo]) {
        let current: Vec<String> = switches.iter().map(|s| s.dpid.to_hex()).collect();
        let mut state = self.state.lock();

        let added: Vec<&String> =
            current.iter().filter(|d| !state.last_known_dpids.contains(d)).collect();
        let removed: Vec<String> = state
            .last_known_dpids
            .iter()
            .filter(|d| !current.contains(d))
            .cloned()
            .collect();

        if !added.is_empty() {
            info!("New switches detected: {:?}", added);
        }
        if !removed.is_empty() {
            info!("Switches disconnected: {:?}", removed);
            for dpid in &removed {
                let prefix = format!("{}-", dpid);
                state.previous_port_stats.retain(|key, _| !key.starts_with(&prefix));
            }
        }

        state.last_known_dpids = current;
    }
}

/// Delta bandwidth in Mbps, clamped to zero; non-positive elapsed time
/// yields zero rather than a division artifact.
pub fn port_bandwidth(prev: &PortStat, cur: &PortStat, elapsed_sec: f64) -> (f64, f64) {
    if elapsed_sec <= 0.0 {
        return (0.0, 0.0);
    }
    let rx_delta = cur.rx_bytes as f64 - prev.rx_bytes as f64;
    let tx_delta = cur.tx_bytes as f64 - prev.tx_bytes as f64;
    let rx_mbps = (rx_delta * 8.0 / (elapsed_sec * 1_000_000.0)).max(0.0);
    let tx_mbps = (tx_delta * 8.0 / (elapsed_sec * 1_000_000.0)).max(0.0);
    (rx_mbps, tx_mbps)
}

/// Controller links come as `{src: {dpid, ..}, dst: {..}}` or flat scalars.
fn coerce_link(link: &Value) -> Value {
    let source = link
        .pointer("/src/dpid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| value_to_string(link.get("src").unwrap_or(&Value::Null)));
    let target = link
        .pointer("/dst/dpid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| value_to_string(link.get("dst").unwrap_or(&Value::Null)));
    json!({"source": source, "target": target, "type": "direct"})
}

/// Controller hosts carry IPv4 addresses as strings or `{address}` objects.
fn coerce_host(host: &Value) -> Value {
    let ip = host
        .get("ipv4")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .map(|first| match first {
            Value::String(s) => s.clone(),
            Value::Object(obj) => obj
                .get("address")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            _ => "unknown".to_string(),
        })
        .unwrap_or_else(|| "unknown".to_string());

    let mac = host.get("mac").and_then(Value::as_str).unwrap_or("unknown");
    json!({
        "id": mac,
        "mac": mac,
        "dpid": host.pointer("/port/dpid").cloned().unwrap_or(json!("0")),
        "port": host.pointer("/port/port_no").cloned().unwrap_or(json!(0)),
        "ip": ip,
        "type": "host",
    })
}

/// Summarize one raw flow entry for dashboards.
fn process_flow_entry(flow: &Value) -> Value {
    let match_fields = flow.get("match").cloned().unwrap_or_else(|| json!({}));
    let mut match_desc: Vec<String> = Vec::new();
    if let Some(port) = match_fields.get("in_port") {
        match_desc.push(format!("in_port={}", port));
    }
    if let Some(eth_type) = match_fields.get("eth_type").and_then(Value::as_u64) {
        match eth_type {
            0x0800 => match_desc.push("IPv4".into()),
            0x0806 => match_desc.push("ARP".into()),
            other => match_desc.push(format!("eth_type=0x{:04x}", other)),
        }
    }
    if let Some(src) = match_fields.get("ipv4_src").and_then(Value::as_str) {
        match_desc.push(format!("src={}", src));
    }
    if let Some(dst) = match_fields.get("ipv4_dst").and_then(Value::as_str) {
        match_desc.push(format!("dst={}", dst));
    }

    let mut action_desc: Vec<String> = Vec::new();
    for instruction in flow
        .get("instructions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if instruction.get("type").and_then(Value::as_str) != Some("APPLY_ACTIONS") {
            continue;
        }
        for action in instruction.get("actions").and_then(Value::as_array).into_iter().flatten() {
            match action.get("type").and_then(Value::as_str).unwrap_or("unknown") {
                "OUTPUT" => {
                    let port = action.get("port").cloned().unwrap_or(json!("unknown"));
                    match port.as_str() {
                        Some("CONTROLLER") => action_desc.push("controller".into()),
                        Some("FLOOD") => action_desc.push("flood".into()),
                        _ => action_desc.push(format!("port_{}", value_to_string(&port))),
                    }
                }
                other => action_desc.push(other.to_ascii_lowercase()),
            }
        }
    }

    json!({
        "priority": flow.get("priority").cloned().unwrap_or(json!(0)),
        "table_id": flow.get("table_id").cloned().unwrap_or(json!(0)),
        "duration_sec": flow.get("duration_sec").cloned().unwrap_or(json!(0)),
        "packet_count": flow.get("packet_count").cloned().unwrap_or(json!(0)),
        "byte_count": flow.get("byte_count").cloned().unwrap_or(json!(0)),
        "idle_timeout": flow.get("idle_timeout").cloned().unwrap_or(json!(0)),
        "hard_timeout": flow.get("hard_timeout").cloned().unwrap_or(json!(0)),
        "cookie": flow.get("cookie").cloned().unwrap_or(json!(0)),
        "match_description": if match_desc.is_empty() { "any".to_string() } else { match_desc.join(", ") },
        "action_description": if action_desc.is_empty() { "unknown".to_string() } else { action_desc.join(", ") },
    })
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn unix_now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stat(rx: u64, tx: u64) -> PortStat {
        PortStat { rx_bytes: rx, tx_bytes: tx, ..Default::default() }
    }

    #[test]
    fn bandwidth_from_byte_deltas() {
        // 1_000_000 bytes over 8 seconds = 1 Mbps.
        let (rx, tx) = port_bandwidth(&stat(0, 0), &stat(1_000_000, 2_000_000), 8.0);
        assert!((rx - 1.0).abs() < 1e-9);
        assert!((tx - 2.0).abs() < 1e-9);
    }

    #[test]
    fn bandwidth_clamps_negative_deltas_and_bad_elapsed() {
        // Counter reset must not produce negative rates.
        let (rx, tx) = port_bandwidth(&stat(5_000, 5_000), &stat(100, 100), 10.0);
        assert_eq!((rx, tx), (0.0, 0.0));

        let (rx, tx) = port_bandwidth(&stat(0, 0), &stat(1_000_000, 0), 0.0);
        assert_eq!((rx, tx), (0.0, 0.0));

        let (rx, tx) = port_bandwidth(&stat(0, 0), &stat(1_000_000, 0), -1.0);
        assert_eq!((rx, tx), (0.0, 0.0));
    }

    #[test]
    fn links_coerce_from_nested_and_flat_shapes() {
        let nested = json!({"src": {"dpid": "0000000000000001", "port_no": 1},
                            "dst": {"dpid": "0000000000000002", "port_no": 2}});
        let link = coerce_link(&nested);
        assert_eq!(link["source"], "0000000000000001");
        assert_eq!(link["target"], "0000000000000002");
        assert_eq!(link["type"], "direct");

        let flat = json!({"src": "s1", "dst": "s2"});
        let link = coerce_link(&flat);
        assert_eq!(link["source"], "s1");
        assert_eq!(link["target"], "s2");
    }

    #[test]
    fn hosts_extract_ipv4_from_diverse_shapes() {
        let plain = json!({"mac": "aa:bb", "ipv4": ["10.0.0.5"], "port": {"dpid": "1", "port_no": 3}});
        assert_eq!(coerce_host(&plain)["ip"], "10.0.0.5");

        let object = json!({"mac": "aa:bb", "ipv4": [{"address": "10.0.0.6"}]});
        assert_eq!(coerce_host(&object)["ip"], "10.0.0.6");

        let none = json!({"mac": "aa:bb"});
        assert_eq!(coerce_host(&none)["ip"], "unknown");
    }

    #[test]
    fn flow_entries_get_readable_descriptions() {
        let flow = json!({
            "priority": 100,
            "packet_count": 5,
            "match": {"eth_type": 0x0800, "ipv4_src": "10.0.0.1"},
            "instructions": [{"type": "APPLY_ACTIONS",
                              "actions": [{"type": "OUTPUT", "port": "CONTROLLER"}]}],
        });
        let processed = process_flow_entry(&flow);
        assert_eq!(processed["match_description"], "IPv4, src=10.0.0.1");
        assert_eq!(processed["action_description"], "controller");
    }
}
