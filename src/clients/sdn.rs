//! REST adapter to the OpenFlow controller.
//!
//! Identity contract: every DPID is normalized to a 16-digit lowercase hex
//! string for comparisons; the integer form is used only on outbound
//! `/stats/flowentry/*` posts.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// OpenFlow 1.3 version byte, sent with every flow mod.
const OF_VERSION: u8 = 0x04;

const GET_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum SdnError {
    #[error("malformed DPID: {0}")]
    MalformedDpid(String),
    #[error("SDN controller unreachable: {0}")]
    ControllerUnreachable(String),
    #[error("controller returned HTTP {status} for {url}")]
    BadStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {message}")]
    InvalidJson { url: String, message: String },
}

pub type SdnResult<T> = Result<T, SdnError>;

/// A normalized OpenFlow datapath identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dpid(u64);

impl Dpid {
    /// Accepts integers, `0x`-prefixed hex, bare hex (`000072935aa3324a`)
    /// and decimal strings. Bare hex wins over decimal, matching the
    /// controller's own formatting of DPIDs.
    pub fn parse(raw: &Value) -> SdnResult<Self> {
        match raw {
            Value::Number(n) => n
                .as_u64()
                .map(Dpid)
                .ok_or_else(|| SdnError::MalformedDpid(raw.to_string())),
            Value::String(s) => Self::parse_str(s),
            Value::Object(obj) => {
                // Some controller endpoints wrap the DPID in a switch object.
                let inner = obj.get("dpid").or_else(|| obj.get("id"));
                match inner {
                    Some(v) => Self::parse(v),
                    None => Err(SdnError::MalformedDpid(raw.to_string())),
                }
            }
            _ => Err(SdnError::MalformedDpid(raw.to_string())),
        }
    }

    pub fn parse_str(s: &str) -> SdnResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SdnError::MalformedDpid(s.to_string()));
        }
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16)
                .map(Dpid)
                .map_err(|_| SdnError::MalformedDpid(s.to_string()));
        }
        if s.chars().all(|c| c.is_ascii_hexdigit()) {
            return u64::from_str_radix(s, 16)
                .map(Dpid)
                .map_err(|_| SdnError::MalformedDpid(s.to_string()));
        }
        s.parse::<u64>()
            .map(Dpid)
            .map_err(|_| SdnError::MalformedDpid(s.to_string()))
    }

    /// Canonical identity form: 16 lowercase hex digits.
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    /// Integer form for `/stats/flowentry/*` payloads.
    pub fn as_int(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Dpid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A switch as discovered from the controller.
#[derive(Debug, Clone)]
pub struct SwitchInfo {
    pub dpid: Dpid,
    pub ports: Vec<Value>,
}

/// Running counters for one port.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PortStat {
    #[serde(default)]
    pub port_no: Value,
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub tx_packets: u64,
    #[serde(default)]
    pub rx_errors: u64,
    #[serde(default)]
    pub tx_errors: u64,
}

impl PortStat {
    /// Ports appear as numbers or symbolic strings ("LOCAL"); a stable
    /// string form keys the bandwidth history map.
    pub fn port_key(&self) -> String {
        match &self.port_no {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct SdnControllerClient {
    client: Client,
    base_url: String,
}

impl SdnControllerClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build SDN controller client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET with retries: 5xx and 408 are retried with exponential backoff,
    /// connection errors surface as `ControllerUnreachable`.
    async fn get_json(&self, path: &str) -> SdnResult<Value> {
        let url = self.url(path);
        let mut last_err: Option<SdnError> = None;

        for attempt in 0..GET_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS << attempt)).await;
            }
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<Value>().await.map_err(|e| SdnError::InvalidJson {
                            url: url.clone(),
                            message: e.to_string(),
                        });
                    }
                    let err = SdnError::BadStatus { status: status.as_u16(), url: url.clone() };
                    if status.is_server_error() || status.as_u16() == 408 {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(SdnError::ControllerUnreachable(e.to_string()));
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SdnError::ControllerUnreachable(url)))
    }

    /// Raw DPID list from `/stats/switches` (ints or hex strings).
    pub async fn get_switch_dpids(&self) -> SdnResult<Vec<Dpid>> {
        let raw = self.get_json("/stats/switches").await?;
        let list = raw.as_array().cloned().unwrap_or_default();
        let mut dpids = Vec::with_capacity(list.len());
        for entry in &list {
            match Dpid::parse(entry) {
                Ok(dpid) => dpids.push(dpid),
                Err(e) => warn!("Skipping switch with {}", e),
            }
        }
        Ok(dpids)
    }

    /// Enriched switch list from the topology endpoint, falling back to the
    /// bare `/stats/switches` list when the topology app is absent.
    pub async fn get_switches(&self) -> SdnResult<Vec<SwitchInfo>> {
        match self.get_json("/v1.0/topology/switches").await {
            Ok(raw) => {
                let mut switches = Vec::new();
                for entry in raw.as_array().cloned().unwrap_or_default() {
                    match Dpid::parse(&entry) {
                        Ok(dpid) => {
                            let ports = entry
                                .get("ports")
                                .and_then(Value::as_array)
                                .cloned()
                                .unwrap_or_default();
                            switches.push(SwitchInfo { dpid, ports });
                        }
                        Err(e) => warn!("Skipping topology switch with {}", e),
                    }
                }
                Ok(switches)
            }
            Err(e) => {
                debug!("Topology switches endpoint unavailable ({}), using /stats/switches", e);
                let dpids = self.get_switch_dpids().await?;
                let mut switches = Vec::with_capacity(dpids.len());
                for dpid in dpids {
                    // Port descriptions stand in for the topology app's view.
                    let ports = self.get_port_desc(dpid).await.unwrap_or_default();
                    switches.push(SwitchInfo { dpid, ports });
                }
                Ok(switches)
            }
        }
    }

    /// Port descriptions for one switch.
    pub async fn get_port_desc(&self, dpid: Dpid) -> SdnResult<Vec<Value>> {
        let raw = self.get_json(&format!("/stats/portdesc/{}", dpid.as_int())).await?;
        Ok(extract_dpid_keyed_list(&raw, dpid))
    }

    /// Running port counters for one switch.
    pub async fn get_port_stats(&self, dpid: Dpid) -> SdnResult<Vec<PortStat>> {
        let raw = self.get_json(&format!("/stats/port/{}", dpid.as_int())).await?;
        let list = extract_dpid_keyed_list(&raw, dpid);
        Ok(list
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect())
    }

    /// Flow entries for one switch.
    pub async fn get_flow_stats(&self, dpid: Dpid) -> SdnResult<Vec<Value>> {
        let raw = self.get_json(&format!("/stats/flow/{}", dpid.as_int())).await?;
        Ok(extract_dpid_keyed_list(&raw, dpid))
    }

    pub async fn get_topology_links(&self) -> SdnResult<Vec<Value>> {
        let raw = self.get_json("/v1.0/topology/links").await?;
        Ok(raw.as_array().cloned().unwrap_or_default())
    }

    pub async fn get_topology_hosts(&self) -> SdnResult<Vec<Value>> {
        let raw = self.get_json("/v1.0/topology/hosts").await?;
        Ok(raw.as_array().cloned().unwrap_or_default())
    }

    /// Controller-app performance metrics; not every controller build ships
    /// this endpoint, so absence falls back to a conservative estimate.
    pub async fn get_performance_metrics(&self) -> Value {
        match self.get_json("/api/performance/metrics").await {
            Ok(metrics) => metrics,
            Err(e) => {
                debug!("Performance metrics endpoint not available: {}", e);
                json!({
                    "latency": {"average_ms": 5.0, "estimated": true},
                    "bandwidth": {"total_mbps": 0.0, "average_mbps": 0.0, "max_mbps": 0.0},
                })
            }
        }
    }

    /// Install a flow rule. 4xx responses are never retried; the caller
    /// decides whether to degrade the action set.
    pub async fn add_flow(
        &self,
        dpid: Dpid,
        priority: u32,
        match_fields: &Value,
        actions: &[Value],
        idle_timeout: u32,
        hard_timeout: u32,
    ) -> SdnResult<()> {
        let url = self.url("/stats/flowentry/add");
        let translated = translate_actions(actions);

        let mut payload = json!({
            "dpid": dpid.as_int(),
            "priority": priority,
            "match": match_fields,
            "actions": translated,
            "flags": 0,
            "version": OF_VERSION,
        });
        if idle_timeout > 0 {
            payload["idle_timeout"] = json!(idle_timeout);
        }
        if hard_timeout > 0 {
            payload["hard_timeout"] = json!(hard_timeout);
        }

        info!(
            "Adding flow to switch {} (prio {}): match={} actions={}",
            dpid,
            priority,
            match_fields,
            json!(translated)
        );

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SdnError::ControllerUnreachable(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SdnError::BadStatus { status: resp.status().as_u16(), url })
        }
    }

    /// Remove a specific flow, identified by its match and priority.
    pub async fn remove_flow(
        &self,
        dpid: Dpid,
        match_fields: &Value,
        priority: Option<u32>,
    ) -> SdnResult<()> {
        let url = self.url("/stats/flowentry/delete");
        let mut payload = json!({
            "dpid": dpid.as_int(),
            "match": match_fields,
        });
        if let Some(priority) = priority {
            payload["priority"] = json!(priority);
        }
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SdnError::ControllerUnreachable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SdnError::BadStatus { status: resp.status().as_u16(), url })
        }
    }

    /// Clear every flow on a switch.
    pub async fn clear_flows(&self, dpid: Dpid) -> SdnResult<()> {
        let url = self.url(&format!("/stats/flowentry/clear/{}", dpid.as_int()));
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| SdnError::ControllerUnreachable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SdnError::BadStatus { status: resp.status().as_u16(), url })
        }
    }
}

/// `/stats/{port,flow,portdesc}/<dpid>` responses are keyed by the DPID in
/// whichever textual form the controller prefers.
fn extract_dpid_keyed_list(raw: &Value, dpid: Dpid) -> Vec<Value> {
    let Some(obj) = raw.as_object() else {
        return raw.as_array().cloned().unwrap_or_default();
    };
    for (key, value) in obj {
        let matches = Dpid::parse_str(key).map(|k| k == dpid).unwrap_or(false);
        if matches {
            return value.as_array().cloned().unwrap_or_default();
        }
    }
    Vec::new()
}

/// Translate symbolic OUTPUT ports into their OpenFlow numeric values and
/// alias FORWARD to OUTPUT. Unknown symbolic ports pass through with a
/// warning so the controller reports the final verdict.
pub fn translate_actions(actions: &[Value]) -> Vec<Value> {
    actions
        .iter()
        .map(|action| {
            let mut out = action.clone();
            if out.get("type").and_then(Value::as_str) == Some("FORWARD") {
                out["type"] = json!("OUTPUT");
                if out.get("port").is_none() {
                    out["port"] = json!("NORMAL");
                }
            }
            if out.get("type").and_then(Value::as_str) == Some("OUTPUT") {
                if let Some(port) = out.get("port").and_then(Value::as_str) {
                    let upper = port.to_ascii_uppercase();
                    let resolved = match upper.as_str() {
                        "NORMAL" => Some(0xfffffffau32),
                        "CONTROLLER" => Some(0xfffffffd),
                        "ALL" => Some(0xffffffff),
                        "LOCAL" => Some(0xfffffffe),
                        "IN_PORT" => Some(0xfffffff8),
                        _ => None,
                    };
                    match resolved {
                        Some(value) => out["port"] = json!(value),
                        None => match upper.parse::<u32>() {
                            Ok(num) => out["port"] = json!(num),
                            Err(_) => warn!("Unknown port name '{}', keeping as is", port),
                        },
                    }
                }
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dpid_accepts_every_inbound_form() {
        assert_eq!(Dpid::parse(&json!(1)).unwrap().to_hex(), "0000000000000001");
        assert_eq!(
            Dpid::parse(&json!("000072935aa3324a")).unwrap().to_hex(),
            "000072935aa3324a"
        );
        assert_eq!(Dpid::parse(&json!("0x2")).unwrap().to_hex(), "0000000000000002");
        assert_eq!(
            Dpid::parse(&json!({"dpid": "0000000000000003"})).unwrap().to_hex(),
            "0000000000000003"
        );
    }

    #[test]
    fn dpid_integer_form_matches_hex_value() {
        assert_eq!(Dpid::parse(&json!("000072935aa3324a")).unwrap().as_int(), 0x72935aa3324a);
        assert_eq!(Dpid::parse(&json!("0x2")).unwrap().as_int(), 2);
        assert_eq!(Dpid::parse(&json!(1)).unwrap().as_int(), 1);
    }

    #[test]
    fn dpid_rejects_garbage() {
        assert!(matches!(Dpid::parse(&json!("not-a-dpid")), Err(SdnError::MalformedDpid(_))));
        assert!(matches!(Dpid::parse(&json!("")), Err(SdnError::MalformedDpid(_))));
        assert!(matches!(Dpid::parse(&json!(null)), Err(SdnError::MalformedDpid(_))));
    }

    #[test]
    fn canonical_form_is_16_lowercase_hex() {
        let dpid = Dpid::parse(&json!("0X72935AA3324A")).unwrap();
        let hex = dpid.to_hex();
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn symbolic_ports_are_substituted() {
        let actions = vec![json!({"type": "OUTPUT", "port": "NORMAL"})];
        let translated = translate_actions(&actions);
        assert_eq!(translated[0]["port"], 0xfffffffau32);

        let actions = vec![json!({"type": "OUTPUT", "port": "CONTROLLER"})];
        assert_eq!(translate_actions(&actions)[0]["port"], 0xfffffffdu32);
    }

    #[test]
    fn forward_is_an_alias_of_output() {
        let actions = vec![json!({"type": "FORWARD"})];
        let translated = translate_actions(&actions);
        assert_eq!(translated[0]["type"], "OUTPUT");
        assert_eq!(translated[0]["port"], 0xfffffffau32);
    }

    #[test]
    fn numeric_string_ports_become_numbers() {
        let actions = vec![json!({"type": "OUTPUT", "port": "3"})];
        assert_eq!(translate_actions(&actions)[0]["port"], 3);
    }

    #[test]
    fn unknown_port_names_pass_through() {
        let actions = vec![json!({"type": "OUTPUT", "port": "FLOOD_MAYBE"})];
        assert_eq!(translate_actions(&actions)[0]["port"], "FLOOD_MAYBE");
    }

    #[test]
    fn dpid_keyed_lists_match_any_textual_form() {
        let dpid = Dpid::parse(&json!(1)).unwrap();
        let raw = json!({"1": [{"port_no": 1}]});
        assert_eq!(extract_dpid_keyed_list(&raw, dpid).len(), 1);
        let raw_hex = json!({"0000000000000001": [{"port_no": 1}, {"port_no": 2}]});
        assert_eq!(extract_dpid_keyed_list(&raw_hex, dpid).len(), 2);
    }
}
