//! Event monitor: pulls events from every upstream, normalizes them, and
//! synthesizes events the upstreams don't emit themselves (topology
//! snapshots, low-client warnings, connectivity failures).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::clients::fl_server::FlServerClient;
use crate::clients::sdn::{SdnControllerClient, SdnError};
use crate::models::{normalize_timestamp, truncate, Event, EventLevel};
use crate::monitors::network::NetworkMonitor;
use crate::storage::MetricsStorage;

#[derive(Default)]
struct EventState {
    policy_last_event_id: Option<String>,
    previous_nodes: HashMap<String, Value>,
    previous_links: HashMap<String, Value>,
    last_switch_count: Option<usize>,
    training_complete_logged: bool,
}

pub struct EventMonitor {
    storage: Arc<MetricsStorage>,
    fl: FlServerClient,
    policy_client: Client,
    policy_base_url: String,
    sdn: SdnControllerClient,
    network_monitor: Option<Arc<NetworkMonitor>>,
    state: Mutex<EventState>,
}

impl EventMonitor {
    pub fn new(
        storage: Arc<MetricsStorage>,
        fl: FlServerClient,
        policy_engine_url: &str,
        sdn: SdnControllerClient,
        network_monitor: Option<Arc<NetworkMonitor>>,
        intervals: (u64, u64, u64),
    ) -> anyhow::Result<Self> {
        let policy_client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build event monitor client: {}", e))?;

        let monitor = Self {
            storage,
            fl,
            policy_client,
            policy_base_url: policy_engine_url.trim_end_matches('/').to_string(),
            sdn,
            network_monitor,
            state: Mutex::new(EventState::default()),
        };
        info!("EventMonitor initialized.");

        let (fl_sec, policy_sec, network_sec) = intervals;
        monitor.log_collector_event(
            "COLLECTOR_START",
            json!({
                "poll_interval_server_sec": fl_sec,
                "poll_interval_policy_sec": policy_sec,
                "poll_interval_network_sec": network_sec,
            }),
        );
        Ok(monitor)
    }

    /// One full pass across every source.
    pub async fn collect_all(&self) -> Value {
        let start = Instant::now();
        let mut total_events = 0usize;
        let mut errors: Vec<String> = Vec::new();

        let passes: [(&str, (usize, Option<String>)); 4] = [
            ("FL Server", self.collect_fl_server_events().await),
            ("Policy Engine", self.collect_policy_engine_events().await),
            ("SDN Controller", self.collect_sdn_controller_events().await),
            ("Network", self.collect_network_events().await),
        ];
        for (source, (count, error)) in passes {
            total_events += count;
            if let Some(error) = error {
                errors.push(format!("{}: {}", source, error));
            }
        }

        if !errors.is_empty() {
            warn!("Event collection completed with errors: {}", errors.join(". "));
        }
        info!(
            "Collected {} events in {:.2} seconds.",
            total_events,
            start.elapsed().as_secs_f64()
        );
        json!({"events_collected": total_events, "errors": errors.len()})
    }

    fn log_collector_event(&self, event_type: &str, details: Value) {
        let message = format!("{}", event_type);
        self.storage.store_event(&Event::new(
            "COLLECTOR",
            event_type,
            EventLevel::Info,
            message,
            details,
        ));
        debug!("Logged collector event: {}", event_type);
    }

    fn log_poll_outcome(&self, target: &str, endpoint: &str, start: Instant, error: Option<&str>) {
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        match error {
            None => self.log_collector_event(
                "POLL_TARGET_SUCCESS",
                json!({
                    "target_component": target,
                    "endpoint": endpoint,
                    "duration_ms": duration_ms,
                }),
            ),
            Some(message) => self.log_collector_event(
                "POLL_TARGET_FAILURE",
                json!({
                    "target_component": target,
                    "endpoint": endpoint,
                    "error_message": message,
                    "duration_ms": duration_ms,
                }),
            ),
        }
    }

    /// FL server events plus synthetic status-derived events.
    pub async fn collect_fl_server_events(&self) -> (usize, Option<String>) {
        let start = Instant::now();
        let resp = match self.fl.get_events(None, 100).await {
            Ok(resp) => resp,
            Err(e) => {
                let message = format!("Error connecting to FL Server: {:#}", e);
                warn!("{}", message);
                self.log_poll_outcome("FL_SERVER", "/events, /status", start, Some(&message));
                return (0, Some(message));
            }
        };

        let mut count = 0usize;
        for raw in &resp.events {
            let event = normalize_upstream_event(raw, "FL_SERVER", fl_event_level);
            self.storage.store_event(&event);
            count += 1;
        }

        // Synthetic events derived from the server status; failures here
        // never fail the whole pass.
        if let Ok(status) = self.fl.get_status().await {
            let connected_clients =
                status.get("connected_clients").and_then(Value::as_u64).unwrap_or(0);
            let current_round = status.get("current_round").and_then(Value::as_u64).unwrap_or(0);
            let training_complete =
                status.get("training_complete").and_then(Value::as_bool).unwrap_or(false);

            if current_round > 0 && connected_clients < 2 {
                self.storage.store_event(&Event::new(
                    "FL_SERVER",
                    "LOW_CLIENT_COUNT",
                    EventLevel::Warning,
                    format!(
                        "Low client count: {} clients connected in round {}",
                        connected_clients, current_round
                    ),
                    json!({
                        "connected_clients": connected_clients,
                        "current_round": current_round,
                        "recommended_minimum": 2,
                    }),
                ));
                count += 1;
            }

            let already_logged = self.state.lock().training_complete_logged;
            if training_complete && !already_logged {
                self.storage.store_event(&Event::new(
                    "FL_SERVER",
                    "TRAINING_COMPLETED",
                    EventLevel::Info,
                    format!("Federated learning training completed after {} rounds", current_round),
                    json!({
                        "total_rounds": current_round,
                        "final_client_count": connected_clients,
                    }),
                ));
                self.state.lock().training_complete_logged = true;
                count += 1;
            }
        }

        self.log_poll_outcome("FL_SERVER", "/events, /status", start, None);
        (count, None)
    }

    /// Policy Engine events with timestamp and level normalization.
    pub async fn collect_policy_engine_events(&self) -> (usize, Option<String>) {
        let start = Instant::now();
        let mut url = format!("{}/events", self.policy_base_url);
        if let Some(since) = self.state.lock().policy_last_event_id.clone() {
            url = format!("{}?since_event_id={}", url, since);
        }

        let resp = match self.policy_client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                let message = format!("Failed to collect Policy Engine events: {}", resp.status());
                error!("{}", message);
                self.log_poll_outcome("POLICY_ENGINE", "/events", start, Some(&message));
                return (0, Some(message));
            }
            Err(e) => {
                let message = format!("Error connecting to Policy Engine: {}", e);
                error!("{}", message);
                self.log_poll_outcome("POLICY_ENGINE", "/events", start, Some(&message));
                return (0, Some(message));
            }
        };

        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                let message = format!("Error decoding Policy Engine events: {}", e);
                error!("{}", message);
                self.log_poll_outcome("POLICY_ENGINE", "/events", start, Some(&message));
                return (0, Some(message));
            }
        };

        if let Some(last_event_id) = body.get("last_event_id").and_then(Value::as_str) {
            self.state.lock().policy_last_event_id = Some(last_event_id.to_string());
        }

        let events = body.get("events").and_then(Value::as_array).cloned().unwrap_or_default();
        for raw in &events {
            let event = normalize_upstream_event(raw, "POLICY_ENGINE", policy_event_level);
            self.storage.store_event(&event);
        }

        self.log_poll_outcome("POLICY_ENGINE", "/events", start, None);
        (events.len(), None)
    }

    /// SDN controller topology snapshot plus synthesized health events.
    pub async fn collect_sdn_controller_events(&self) -> (usize, Option<String>) {
        let start = Instant::now();
        let mut count = 0usize;

        let switches: Vec<String> = match self.sdn.get_switch_dpids().await {
            Ok(dpids) => dpids.iter().map(|d| d.to_hex()).collect(),
            Err(SdnError::BadStatus { status, .. }) => {
                self.storage.store_event(&Event::new(
                    "SDN_CONTROLLER",
                    "SWITCH_QUERY_FAILED",
                    EventLevel::Error,
                    format!("Failed to query switches: HTTP {}", status),
                    json!({"status_code": status}),
                ));
                self.log_poll_outcome(
                    "SDN_CONTROLLER",
                    "/stats/switches",
                    start,
                    Some(&format!("HTTP {}", status)),
                );
                return (1, Some(format!("switch query failed: HTTP {}", status)));
            }
            Err(SdnError::ControllerUnreachable(e)) => {
                self.storage.store_event(&Event::new(
                    "SDN_CONTROLLER",
                    "CONTROLLER_UNREACHABLE",
                    EventLevel::Error,
                    format!("SDN Controller unreachable: {}", e),
                    json!({"error": e, "url": self.sdn.base_url()}),
                ));
                self.log_poll_outcome("SDN_CONTROLLER", "/stats/switches", start, Some(&e));
                return (1, Some(format!("controller unreachable: {}", e)));
            }
            Err(e) => {
                let message = e.to_string();
                self.storage.store_event(&Event::new(
                    "SDN_CONTROLLER",
                    "SWITCH_CONNECTION_ERROR",
                    EventLevel::Error,
                    format!("Error connecting to switches endpoint: {}", message),
                    json!({"error": message}),
                ));
                self.log_poll_outcome("SDN_CONTROLLER", "/stats/switches", start, Some(&message));
                return (1, Some(message));
            }
        };

        if switches.is_empty() {
            self.storage.store_event(&Event::new(
                "SDN_CONTROLLER",
                "NO_SWITCHES_DETECTED",
                EventLevel::Warning,
                "No OpenFlow switches detected in the network".to_string(),
                json!({"switches_count": 0}),
            ));
            count += 1;
        } else {
            let previous = self.state.lock().last_switch_count;
            if let Some(previous) = previous {
                if previous != switches.len() {
                    self.storage.store_event(&Event::new(
                        "SDN_CONTROLLER",
                        "SWITCH_COUNT_CHANGED",
                        EventLevel::Info,
                        format!("Switch count changed from {} to {}", previous, switches.len()),
                        json!({
                            "current_switches": switches.len(),
                            "previous_switches": previous,
                            "switch_ids": switches,
                        }),
                    ));
                    count += 1;
                }
            }
        }
        self.state.lock().last_switch_count = Some(switches.len());

        let links = match self.sdn.get_topology_links().await {
            Ok(links) => links,
            Err(SdnError::BadStatus { status: 404, .. }) => {
                info!("SDN controller does not expose a links endpoint; link information unavailable");
                self.storage.store_event(&Event::new(
                    "SDN_CONTROLLER",
                    "LINKS_ENDPOINT_UNAVAILABLE",
                    EventLevel::Info,
                    "Links topology endpoint not available on this controller".to_string(),
                    json!({"endpoint": "/v1.0/topology/links"}),
                ));
                count += 1;
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to get links from SDN controller: {}", e);
                Vec::new()
            }
        };

        let hosts = self.sdn.get_topology_hosts().await.unwrap_or_else(|e| {
            debug!("Failed to get hosts from SDN controller: {}", e);
            Vec::new()
        });

        let (level, message) = if switches.is_empty() {
            (
                EventLevel::Warning,
                format!(
                    "SDN Topology Warning: No switches found, {} links, {} hosts",
                    links.len(),
                    hosts.len()
                ),
            )
        } else {
            (
                EventLevel::Info,
                format!(
                    "SDN Topology: {} switches, {} links, {} hosts",
                    switches.len(),
                    links.len(),
                    hosts.len()
                ),
            )
        };
        self.storage.store_event(&Event::new(
            "SDN_CONTROLLER",
            "TOPOLOGY_SNAPSHOT",
            level,
            message.clone(),
            json!({
                "switches": switches,
                "links": links,
                "hosts": hosts,
                "controller_info": {
                    "url": self.sdn.base_url(),
                    "status": "responsive",
                },
            }),
        ));
        count += 1;
        info!("Collected SDN topology snapshot: {}", message);

        self.log_poll_outcome(
            "SDN_CONTROLLER",
            "/stats/switches, /topology/links, /topology/hosts",
            start,
            None,
        );
        (count, None)
    }

    /// Topology diff events: node/link arrivals and departures.
    pub async fn collect_network_events(&self) -> (usize, Option<String>) {
        let Some(network_monitor) = &self.network_monitor else {
            return (0, Some("NetworkMonitor not available".to_string()));
        };

        let topology = network_monitor.get_live_topology().await;
        let (events, nodes, links) = {
            let state = self.state.lock();
            diff_topology(&state.previous_nodes, &state.previous_links, &topology)
        };

        for event in &events {
            self.storage.store_event(event);
        }
        let count = events.len();

        let mut state = self.state.lock();
        state.previous_nodes = nodes;
        state.previous_links = links;
        (count, None)
    }
}

/// Diff a fresh topology snapshot against the previous node/link maps,
/// producing connectivity events and the next maps.
#[allow(clippy::type_complexity)]
pub fn diff_topology(
    previous_nodes: &HashMap<String, Value>,
    previous_links: &HashMap<String, Value>,
    topology: &Value,
) -> (Vec<Event>, HashMap<String, Value>, HashMap<String, Value>) {
    let mut events = Vec::new();

    let current_nodes: HashMap<String, Value> = topology
        .get("nodes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|node| {
            node.get("id")
                .and_then(Value::as_str)
                .map(|id| (id.to_string(), node.clone()))
        })
        .collect();
    let current_links: HashMap<String, Value> = topology
        .get("links")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|link| {
            let key = format!(
                "{}-{}",
                link.get("source").and_then(Value::as_str).unwrap_or(""),
                link.get("target").and_then(Value::as_str).unwrap_or("")
            );
            (key, link.clone())
        })
        .collect();

    for (node_id, node) in &current_nodes {
        if !previous_nodes.contains_key(node_id) {
            events.push(network_event("NODE_CONNECTED", node, EventLevel::Info));
        }
    }
    for (node_id, node) in previous_nodes {
        if !current_nodes.contains_key(node_id) {
            events.push(network_event("NODE_DISCONNECTED", node, EventLevel::Warning));
        }
    }
    for (link_id, link) in &current_links {
        if !previous_links.contains_key(link_id) {
            events.push(network_event("LINK_ADDED", link, EventLevel::Info));
        }
    }
    for (link_id, link) in previous_links {
        if !current_links.contains_key(link_id) {
            events.push(network_event("LINK_REMOVED", link, EventLevel::Warning));
        }
    }

    (events, current_nodes, current_links)
}

fn network_event(event_type: &str, details: &Value, level: EventLevel) -> Event {
    let subject = details
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "{}-{}",
                details.get("source").and_then(Value::as_str).unwrap_or(""),
                details.get("target").and_then(Value::as_str).unwrap_or("")
            )
        });
    Event::new(
        "NETWORK",
        event_type,
        level,
        format!("{}: {}", event_type, subject),
        details.clone(),
    )
}

/// Normalize one upstream event: fill the component, derive the level when
/// unset, synthesize a message, and force the timestamp into ISO8601 UTC.
pub fn normalize_upstream_event(
    raw: &Value,
    default_component: &str,
    level_fn: fn(&str, &Value) -> EventLevel,
) -> Event {
    let source_component = raw
        .get("component")
        .or_else(|| raw.get("source_component"))
        .and_then(Value::as_str)
        .unwrap_or(default_component)
        .to_string();

    let event_type = raw
        .get("event_type")
        .or_else(|| raw.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_string();

    let details = raw.get("details").cloned().unwrap_or_else(|| json!({}));

    let event_level = raw
        .get("level")
        .or_else(|| raw.get("event_level"))
        .and_then(Value::as_str)
        .and_then(EventLevel::parse)
        .unwrap_or_else(|| level_fn(&event_type, &details));

    let message = raw
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| synthesize_message(&event_type, &details));

    let timestamp = match raw.get("timestamp") {
        Some(ts) => normalize_timestamp(ts),
        None => Utc::now().to_rfc3339(),
    };

    Event {
        event_id: raw
            .get("event_id")
            .or_else(|| raw.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        timestamp,
        source_component,
        event_type,
        event_level,
        message,
        details,
    }
}

fn synthesize_message(event_type: &str, details: &Value) -> String {
    if details.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        event_type.to_string()
    } else {
        let rendered = details.to_string();
        format!("{}: {}...", event_type, truncate(&rendered, 200))
    }
}

/// FL-specific level rules on top of the shared type patterns.
pub fn fl_event_level(event_type: &str, details: &Value) -> EventLevel {
    if event_type.to_ascii_uppercase().contains("ROUND_COMPLETED") {
        let accuracy = details.get("accuracy").and_then(Value::as_f64).unwrap_or(1.0);
        return if accuracy < 0.3 { EventLevel::Warning } else { EventLevel::Info };
    }
    EventLevel::derive_from_type(event_type)
}

/// Policy-engine-specific level rules: denials read as warnings.
pub fn policy_event_level(event_type: &str, details: &Value) -> EventLevel {
    let t = event_type.to_ascii_uppercase();
    if t.contains("ERROR") || t.contains("FAIL") || t.contains("EXCEPTION") {
        return EventLevel::Error;
    }
    if t.contains("WARNING") || t.contains("WARN") {
        return EventLevel::Warning;
    }
    if matches!(t.as_str(), "POLICY_VIOLATION" | "ACCESS_DENIED" | "UNAUTHORIZED") {
        return EventLevel::Warning;
    }
    if t.contains("DECISION") {
        let allowed = details.get("allowed").and_then(Value::as_bool).unwrap_or(true);
        let decision = details.get("decision").and_then(Value::as_str).unwrap_or("allow");
        return if !allowed || decision == "deny" {
            EventLevel::Warning
        } else {
            EventLevel::Info
        };
    }
    EventLevel::Info
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fl_round_completed_level_depends_on_accuracy() {
        assert_eq!(
            fl_event_level("ROUND_COMPLETED", &json!({"accuracy": 0.1})),
            EventLevel::Warning
        );
        assert_eq!(
            fl_event_level("ROUND_COMPLETED", &json!({"accuracy": 0.9})),
            EventLevel::Info
        );
        assert_eq!(fl_event_level("ROUND_COMPLETED", &json!({})), EventLevel::Info);
    }

    #[test]
    fn policy_denials_become_warnings() {
        assert_eq!(
            policy_event_level("POLICY_DECISION", &json!({"decision": "deny"})),
            EventLevel::Warning
        );
        assert_eq!(
            policy_event_level("POLICY_DECISION", &json!({"allowed": false})),
            EventLevel::Warning
        );
        assert_eq!(
            policy_event_level("POLICY_DECISION", &json!({"allowed": true})),
            EventLevel::Info
        );
        assert_eq!(policy_event_level("ACCESS_DENIED", &json!({})), EventLevel::Warning);
    }

    #[test]
    fn normalization_fills_component_level_message_timestamp() {
        let raw = json!({
            "type": "POLICY_CHANGED",
            "timestamp": 1735689600,
            "details": {"policy_id": "p1"},
        });
        let event = normalize_upstream_event(&raw, "POLICY_ENGINE", policy_event_level);
        assert_eq!(event.source_component, "POLICY_ENGINE");
        assert_eq!(event.event_type, "POLICY_CHANGED");
        assert_eq!(event.event_level, EventLevel::Info);
        assert!(event.timestamp.starts_with("2025-01-01T00:00:00"));
        assert!(event.message.starts_with("POLICY_CHANGED:"));
    }

    #[test]
    fn explicit_levels_are_preserved() {
        let raw = json!({"event_type": "ANYTHING", "level": "ERROR"});
        let event = normalize_upstream_event(&raw, "FL_SERVER", fl_event_level);
        assert_eq!(event.event_level, EventLevel::Error);
    }

    #[test]
    fn topology_diff_detects_churn() {
        let topo1 = json!({
            "nodes": [{"id": "s1", "type": "switch"}, {"id": "h1", "type": "host"}],
            "links": [{"source": "s1", "target": "h1"}],
        });
        let (events, nodes, links) = diff_topology(&HashMap::new(), &HashMap::new(), &topo1);
        assert_eq!(events.len(), 3); // two nodes connected, one link added

        let topo2 = json!({
            "nodes": [{"id": "s1", "type": "switch"}],
            "links": [],
        });
        let (events, _, _) = diff_topology(&nodes, &links, &topo2);
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"NODE_DISCONNECTED"));
        assert!(types.contains(&"LINK_REMOVED"));
        assert!(events
            .iter()
            .all(|e| e.event_level == EventLevel::Warning));
    }
}
