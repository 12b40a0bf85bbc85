//! Shared data model: configuration, events, policies, FL rounds.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Event severity levels accepted by storage and the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Some(EventLevel::Info),
            "WARNING" | "WARN" => Some(EventLevel::Warning),
            "ERROR" => Some(EventLevel::Error),
            _ => None,
        }
    }

    /// Derive a level from an event type when the upstream left it unset.
    pub fn derive_from_type(event_type: &str) -> Self {
        let t = event_type.to_ascii_uppercase();
        if t.contains("ERROR") || t.contains("FAIL") || t.contains("EXCEPTION") {
            EventLevel::Error
        } else if t.contains("WARNING")
            || t.contains("WARN")
            || matches!(
                t.as_str(),
                "CLIENT_DISCONNECTED"
                    | "ROUND_FAILED"
                    | "AGGREGATION_FAILED"
                    | "CLIENT_TIMEOUT"
                    | "SLOW_CLIENT"
                    | "LOW_ACCURACY"
            )
        {
            EventLevel::Warning
        } else {
            EventLevel::Info
        }
    }
}

/// A normalized event, ready for storage. `source_component`/`component` and
/// `event_type`/`type` and `event_level`/`level` are kept mutually equal on
/// the way out for dashboard compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: String,
    pub source_component: String,
    pub event_type: String,
    pub event_level: EventLevel,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl Event {
    pub fn new(
        source_component: &str,
        event_type: &str,
        event_level: EventLevel,
        message: String,
        details: Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            source_component: source_component.to_string(),
            event_type: event_type.to_string(),
            event_level,
            message,
            details,
        }
    }
}

/// A policy as fetched from the Policy Engine (or the fallback file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", alias = "policy_type", default)]
    pub policy_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub data: Value,
}

fn default_true() -> bool {
    true
}

/// One rule inside a `network_security` policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default, alias = "rule_id")]
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub r#match: RuleMatch,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub idle_timeout: u32,
    #[serde(default)]
    pub hard_timeout: u32,
}

fn default_action() -> String {
    "deny".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default, alias = "source_ip")]
    pub src_ip: Option<String>,
    #[serde(default, alias = "destination_ip")]
    pub dst_ip: Option<String>,
    #[serde(default)]
    pub src_type: Option<String>,
    #[serde(default)]
    pub dst_type: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default, alias = "source_port")]
    pub src_port: Option<u16>,
    #[serde(default, alias = "destination_port")]
    pub dst_port: Option<u16>,
}

/// One FL aggregation round as reported by the FL server. Numeric fields the
/// server is sloppy about (strings, nulls) stay as `Value` and are coerced
/// at ingestion time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlRound {
    #[serde(default)]
    pub round: u64,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub loss: f64,
    #[serde(default)]
    pub training_duration: Value,
    #[serde(default, alias = "clients_connected")]
    pub clients: Value,
    #[serde(default)]
    pub model_size_mb: Value,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub training_complete: bool,
    #[serde(default)]
    pub raw_metrics: Value,
}

/// Runtime configuration. Overlay order: defaults <- environment <- JSON
/// config file (the file wins, matching the deployment tooling).
#[derive(Debug, Clone)]
pub struct Config {
    pub policy_engine_url: String,
    pub fl_server_url: String,
    pub sdn_controller_url: String,

    pub metrics_output_dir: String,
    pub metrics_max_age_days: i64,
    pub events_max_age_days: i64,
    pub cleanup_interval_hours: i64,

    pub api_enabled: bool,
    pub api_host: String,
    pub api_port: u16,
    pub api_auth_enabled: bool,
    pub api_username: String,
    pub api_password: String,
    pub enable_cors: bool,
    pub api_allowed_origins: String,

    pub training_mode: String,
    pub policy_interval_sec: u64,
    pub fl_interval_sec: u64,
    pub network_interval_sec: u64,
    pub event_interval_sec: u64,

    pub check_policy_enabled: bool,
    pub strict_policy_mode: bool,

    pub policy_monitor_enabled: bool,
    pub fl_monitor_enabled: bool,
    pub network_monitor_enabled: bool,
    pub event_monitor_enabled: bool,
    pub flow_manager_enabled: bool,

    pub policy_fallback_enabled: bool,
    pub default_policy_file: String,

    /// NODE_IP_<TYPE> entries, keys normalized to uppercase with underscores.
    pub node_ips: HashMap<String, String>,
    pub subnet_prefix: String,
    pub client_ip_range: (u8, u8),

    pub log_level: String,
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

pub fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "t" | "yes" | "on"))
        .unwrap_or(default)
}

impl Config {
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut cfg = Self::from_env();
        if let Some(path) = config_path {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                    Ok(file) => {
                        cfg.overlay_file(&file);
                        info!("Loaded configuration overlay from {}", path.display());
                    }
                    Err(e) => warn!("Invalid JSON in config file {}: {}", path.display(), e),
                },
                Err(e) => warn!("Config file not found at {}: {}", path.display(), e),
            }
        }
        Ok(cfg)
    }

    pub fn from_env() -> Self {
        let policy_engine_url =
            env_str("POLICY_ENGINE_URL", "http://localhost:5000").trim_end_matches('/').to_string();

        let fl_server_url = env::var("FL_SERVER_URL").unwrap_or_else(|_| {
            let host = env_str("FL_SERVER_HOST", "fl-server");
            let port = env_str("FL_SERVER_PORT", "8081");
            format!("http://{}:{}", host, port)
        });
        let fl_server_url = fl_server_url.trim_end_matches('/').to_string();

        let sdn_controller_url = env::var("SDN_CONTROLLER_URL").unwrap_or_else(|_| {
            let host = env_str("SDN_CONTROLLER_HOST", "sdn-controller");
            let port = env_str("SDN_CONTROLLER_PORT", "8181");
            format!("http://{}:{}", host, port)
        });
        let sdn_controller_url = sdn_controller_url.trim_end_matches('/').to_string();

        let training_mode = env_str("TRAINING_MODE", "production").to_ascii_lowercase();
        let fast = matches!(training_mode.as_str(), "mock" | "development");

        let node_ips: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with("NODE_IP_"))
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();

        let client_ip_range = parse_client_ip_range(&env_str("CLIENT_IP_RANGE", "100-255"));

        Self {
            policy_engine_url,
            fl_server_url,
            sdn_controller_url,

            metrics_output_dir: env_str("METRICS_OUTPUT_DIR", "./logs"),
            metrics_max_age_days: env_parse("METRICS_MAX_AGE_DAYS", 14),
            events_max_age_days: env_parse("EVENTS_MAX_AGE_DAYS", 7),
            cleanup_interval_hours: env_parse("CLEANUP_INTERVAL_HOURS", 12),

            api_enabled: env_bool("API_ENABLED", true),
            api_host: env_str("API_HOST", "0.0.0.0"),
            api_port: env::var("METRICS_API_PORT")
                .or_else(|_| env::var("API_PORT"))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            api_auth_enabled: env_bool("API_AUTH_ENABLED", false),
            api_username: env_str("API_USERNAME", "admin"),
            api_password: env_str("API_PASSWORD", "securepassword"),
            enable_cors: env_bool("ENABLE_CORS", true),
            api_allowed_origins: env_str("API_ALLOWED_ORIGINS", "*"),

            policy_interval_sec: env_parse("POLICY_INTERVAL_SEC", if fast { 15 } else { 60 }),
            fl_interval_sec: env_parse("FL_INTERVAL_SEC", if fast { 10 } else { 60 }),
            network_interval_sec: env_parse("NETWORK_INTERVAL_SEC", if fast { 30 } else { 180 }),
            event_interval_sec: env_parse("EVENT_INTERVAL_SEC", if fast { 20 } else { 120 }),
            training_mode,

            check_policy_enabled: env_bool("CHECK_POLICY_ENABLED", true),
            strict_policy_mode: env_bool("STRICT_POLICY_MODE", false),

            policy_monitor_enabled: env_bool("POLICY_MONITOR_ENABLED", true),
            fl_monitor_enabled: env_bool("FL_MONITOR_ENABLED", true),
            network_monitor_enabled: env_bool("NETWORK_MONITOR_ENABLED", true),
            event_monitor_enabled: env_bool("EVENT_MONITOR_ENABLED", true),
            flow_manager_enabled: env_bool("FLOW_MANAGER_ENABLED", true),

            policy_fallback_enabled: env_bool("POLICY_FALLBACK_ENABLED", true),
            default_policy_file: env_str("DEFAULT_POLICY_FILE", "config/sdn_fallback_policies.json"),

            node_ips,
            subnet_prefix: env_str("SUBNET_PREFIX", "192.168.100"),
            client_ip_range,

            log_level: env_str("LOG_LEVEL", "INFO"),
        }
    }

    /// Apply the nested JSON config file shape used by the deployment
    /// tooling on top of the environment-derived values.
    fn overlay_file(&mut self, file: &Value) {
        if let Some(url) = file.pointer("/policy_engine/url").and_then(Value::as_str) {
            self.policy_engine_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = file.pointer("/fl_server/url").and_then(Value::as_str) {
            self.fl_server_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = file.pointer("/sdn_controller/url").and_then(Value::as_str) {
            self.sdn_controller_url = url.trim_end_matches('/').to_string();
        }
        if let Some(dir) = file.pointer("/storage/metrics_output_dir").and_then(Value::as_str) {
            self.metrics_output_dir = dir.to_string();
        }
        if let Some(level) = file.pointer("/logging/level").and_then(Value::as_str) {
            self.log_level = level.to_string();
        }
        if let Some(enabled) = file.pointer("/api/enabled").and_then(Value::as_bool) {
            self.api_enabled = enabled;
        }
        if let Some(port) = file.pointer("/api/port").and_then(Value::as_u64) {
            self.api_port = port as u16;
        }
        if let Some(mode) = file.get("training_mode").and_then(Value::as_str) {
            self.training_mode = mode.to_ascii_lowercase();
        }
        if let Some(features) = file.get("features").and_then(Value::as_object) {
            for (key, value) in features {
                let Some(enabled) = value.as_bool() else { continue };
                match key.as_str() {
                    "policy_monitor_enabled" => self.policy_monitor_enabled = enabled,
                    "fl_monitor_enabled" => self.fl_monitor_enabled = enabled,
                    "network_monitor_enabled" => self.network_monitor_enabled = enabled,
                    "event_monitor_enabled" => self.event_monitor_enabled = enabled,
                    "flow_manager_enabled" => self.flow_manager_enabled = enabled,
                    _ => {}
                }
            }
        }
        if let Some(intervals) = file.get("intervals").and_then(Value::as_object) {
            for (key, value) in intervals {
                let Some(secs) = value.as_u64() else { continue };
                match key.as_str() {
                    "policy_interval_sec" => self.policy_interval_sec = secs,
                    "fl_interval_sec" => self.fl_interval_sec = secs,
                    "network_interval_sec" => self.network_interval_sec = secs,
                    "event_interval_sec" => self.event_interval_sec = secs,
                    _ => {}
                }
            }
        }
        if let Some(ips) = file.get("node_ips").and_then(Value::as_object) {
            for (name, ip) in ips {
                if let Some(ip) = ip.as_str() {
                    let key = format!("NODE_IP_{}", name.to_ascii_uppercase().replace('-', "_"));
                    self.node_ips.insert(key, ip.to_string());
                }
            }
        }
    }

    /// Resolve a NODE_IP_<TYPE> entry; `entity_type` uses dashes
    /// (e.g. "fl-server", "fl-client-2").
    pub fn node_ip(&self, entity_type: &str) -> Option<&str> {
        let key = format!("NODE_IP_{}", entity_type.to_ascii_uppercase().replace('-', "_"));
        self.node_ips.get(&key).map(String::as_str)
    }
}

fn parse_client_ip_range(raw: &str) -> (u8, u8) {
    let mut parts = raw.splitn(2, '-');
    let start = parts.next().and_then(|s| s.trim().parse().ok());
    let end = parts.next().and_then(|s| s.trim().parse().ok());
    match (start, end) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            warn!("Failed to parse CLIENT_IP_RANGE '{}', using default 100-255", raw);
            (100, 255)
        }
    }
}

/// Best-effort timestamp normalization: RFC3339 strings pass through,
/// unix seconds/ms are converted, anything else falls back to now (UTC)
/// with a warning.
pub fn normalize_timestamp(raw: &Value) -> String {
    match raw {
        Value::String(s) => {
            if chrono::DateTime::parse_from_rfc3339(s).is_ok() {
                return s.clone();
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return naive.and_utc().to_rfc3339();
            }
            if let Ok(secs) = s.parse::<f64>() {
                return unix_to_rfc3339(secs);
            }
            warn!("Could not parse timestamp '{}', defaulting to now", truncate(s, 64));
            Utc::now().to_rfc3339()
        }
        Value::Number(n) => {
            let secs = n.as_f64().unwrap_or(0.0);
            unix_to_rfc3339(secs)
        }
        _ => Utc::now().to_rfc3339(),
    }
}

fn unix_to_rfc3339(secs: f64) -> String {
    // Values past the year 5000 are taken as milliseconds.
    let secs = if secs > 95_617_584_000.0 { secs / 1000.0 } else { secs };
    chrono::DateTime::from_timestamp(secs as i64, (secs.fract() * 1e9) as u32)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

pub fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Coerce a loosely-typed upstream value into f64, defaulting on failure.
pub fn coerce_f64(v: &Value, default: f64) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(default),
        Value::String(s) if !s.is_empty() => s.parse().unwrap_or(default),
        _ => default,
    }
}

/// Coerce a loosely-typed upstream value into i64, defaulting on failure.
pub fn coerce_i64(v: &Value, default: i64) -> i64 {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(default),
        Value::String(s) if !s.is_empty() => s.parse().unwrap_or(default),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn level_derivation_follows_type_patterns() {
        assert_eq!(EventLevel::derive_from_type("ROUND_FAILED"), EventLevel::Warning);
        assert_eq!(EventLevel::derive_from_type("CLIENT_TIMEOUT"), EventLevel::Warning);
        assert_eq!(EventLevel::derive_from_type("AGGREGATION_ERROR"), EventLevel::Error);
        assert_eq!(EventLevel::derive_from_type("SWITCH_QUERY_FAILED"), EventLevel::Error);
        assert_eq!(EventLevel::derive_from_type("ROUND_START"), EventLevel::Info);
    }

    #[test]
    fn timestamps_normalize_to_rfc3339() {
        let iso = normalize_timestamp(&json!("2025-01-01T00:00:00+00:00"));
        assert_eq!(iso, "2025-01-01T00:00:00+00:00");

        let from_secs = normalize_timestamp(&json!(1735689600));
        assert!(from_secs.starts_with("2025-01-01T00:00:00"));

        let from_ms = normalize_timestamp(&json!(1735689600000i64));
        assert!(from_ms.starts_with("2025-01-01T00:00:00"));
    }

    #[test]
    fn coercion_accepts_strings_and_numbers() {
        assert_eq!(coerce_f64(&json!("1.73"), 0.0), 1.73);
        assert_eq!(coerce_f64(&json!(1.73), 0.0), 1.73);
        assert_eq!(coerce_f64(&json!(null), 0.0), 0.0);
        assert_eq!(coerce_f64(&json!("not-a-number"), 0.0), 0.0);
        assert_eq!(coerce_i64(&json!("4"), 0), 4);
        assert_eq!(coerce_i64(&json!(4.9), 0), 4);
    }

    #[test]
    fn policy_rules_deserialize_with_aliases() {
        let policy: Policy = serde_json::from_value(json!({
            "id": "sec-1",
            "type": "network_security",
            "rules": [{
                "enabled": true,
                "match": {"source_ip": "10.0.0.1", "protocol": "tcp", "destination_port": 22},
                "action": "deny"
            }]
        }))
        .unwrap();
        assert_eq!(policy.policy_type, "network_security");
        let rule = &policy.rules[0];
        assert_eq!(rule.r#match.src_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(rule.r#match.dst_port, Some(22));
        assert_eq!(rule.action, "deny");
    }

    #[test]
    fn client_ip_range_parses_with_fallback() {
        assert_eq!(parse_client_ip_range("100-255"), (100, 255));
        assert_eq!(parse_client_ip_range("garbage"), (100, 255));
    }
}
