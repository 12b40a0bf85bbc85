//! Client for the remote Policy Engine service.
//!
//! Policies are re-fetched on a fixed cadence; subscribers are notified only
//! when the fetched set differs from the previous one or connectivity flips.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::models::Policy;

/// Pushed to subscribers on every meaningful refresh.
#[derive(Debug, Clone)]
pub struct PolicyUpdate {
    pub policies: Vec<Policy>,
    pub fetch_ok: bool,
}

#[derive(Default)]
struct EngineState {
    last_fetch_successful: bool,
    policies: Vec<Policy>,
}

pub struct PolicyEngineClient {
    client: Client,
    base_url: String,
    state: Mutex<EngineState>,
    subscribers: Mutex<Vec<mpsc::Sender<PolicyUpdate>>>,
}

impl PolicyEngineClient {
    pub fn new(base_url: &str) -> anyhow::Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build policy engine client: {}", e))?;
        Ok(Arc::new(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            state: Mutex::new(EngineState::default()),
            subscribers: Mutex::new(Vec::new()),
        }))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Outcome of the most recent fetch attempt.
    pub fn check_policy_engine_status(&self) -> bool {
        self.state.lock().last_fetch_successful
    }

    /// Cached policy set from the last successful fetch.
    pub fn get_policies(&self) -> Vec<Policy> {
        self.state.lock().policies.clone()
    }

    /// Register for policy-change notifications.
    pub fn subscribe(&self) -> mpsc::Receiver<PolicyUpdate> {
        let (tx, rx) = mpsc::channel(8);
        self.subscribers.lock().push(tx);
        info!("Registered policy callback");
        rx
    }

    /// Periodic refresh loop; runs until the shutdown flag flips.
    pub async fn run_refresher(
        self: Arc<Self>,
        interval_sec: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_sec.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Policy engine refresher stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One refresh pass: fetch, diff against the cached set, notify outside
    /// the lock when the set or connectivity changed.
    pub async fn refresh_once(&self) {
        let (policies, fetch_ok) = self.fetch_policies().await;

        let changed = {
            let mut state = self.state.lock();
            let changed =
                state.policies != policies || state.last_fetch_successful != fetch_ok;
            state.last_fetch_successful = fetch_ok;
            if fetch_ok {
                state.policies = policies.clone();
            }
            changed
        };

        if changed {
            self.notify(PolicyUpdate { policies, fetch_ok }).await;
        }
    }

    async fn notify(&self, update: PolicyUpdate) {
        let senders: Vec<_> = self.subscribers.lock().clone();
        for sender in senders {
            if sender.send(update.clone()).await.is_err() {
                debug!("Dropping closed policy subscriber");
            }
        }
        self.subscribers.lock().retain(|s| !s.is_closed());
    }

    /// Fetch from the v1 API, falling back to the legacy path. Returns the
    /// normalized set and whether any fetch succeeded.
    pub async fn fetch_policies(&self) -> (Vec<Policy>, bool) {
        for (endpoint, legacy) in [("/api/v1/policies", false), ("/api/policies", true)] {
            let url = format!("{}{}", self.base_url, endpoint);
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                    Ok(data) => {
                        let policies = normalize_policies(&data);
                        info!(
                            "Fetched {} policies from {} API ({})",
                            policies.len(),
                            if legacy { "legacy" } else { "v1" },
                            url
                        );
                        return (policies, true);
                    }
                    Err(e) => warn!("Invalid policy JSON from {}: {}", url, e),
                },
                Ok(resp) => {
                    warn!("Failed to fetch policies from {}: {}", url, resp.status())
                }
                Err(e) => warn!("Error connecting to {}: {}", url, e),
            }
        }
        (Vec::new(), false)
    }

    /// Validate a policy; tries v1 (wrapped `{type, data}`) then the legacy
    /// unwrapped format.
    pub async fn validate_policy(&self, policy: &Value) -> Value {
        let policy_type = policy
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("network_security");
        let wrapped = json!({"type": policy_type, "data": policy});

        let v1_url = format!("{}/api/v1/validate_policy", self.base_url);
        match self.client.post(&v1_url).json(&wrapped).send().await {
            Ok(resp) if resp.status().is_success() => {
                if let Ok(result) = resp.json::<Value>().await {
                    return result;
                }
            }
            Ok(resp) => warn!("v1 validate returned {}, trying legacy endpoint", resp.status()),
            Err(e) => warn!("Error validating policy with v1 API: {}, trying legacy", e),
        }

        let legacy_url = format!("{}/api/validate_policy", self.base_url);
        match self.client.post(&legacy_url).json(policy).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Value>()
                .await
                .unwrap_or_else(|e| validation_error(&format!("invalid response: {}", e))),
            Ok(resp) => validation_error(&format!("policy engine returned {}", resp.status())),
            Err(e) => validation_error(&format!("error validating policy: {}", e)),
        }
    }

    /// Authorization check; the engine being unreachable defaults to allow
    /// so a policy outage never severs the fabric.
    pub async fn authorize_flow(&self, src_ip: &str, dst_ip: &str, protocol: &str, port: u16) -> bool {
        let payload = json!({
            "src_ip": src_ip,
            "dst_ip": dst_ip,
            "protocol": protocol,
            "port": port,
        });
        let url = format!("{}/api/authorize_flow", self.base_url);
        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("authorized").and_then(Value::as_bool))
                .unwrap_or(true),
            Ok(resp) => {
                error!("Failed to authorize flow: {}", resp.status());
                true
            }
            Err(e) => {
                error!("Error authorizing flow: {}", e);
                true
            }
        }
    }

    /// Client priority lookup; defaults to "low" on any failure.
    pub async fn get_client_priority(&self, client_id: &str) -> String {
        let url = format!("{}/api/client_priority/{}", self.base_url, client_id);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("priority").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "low".to_string()),
            Ok(resp) => {
                error!("Failed to get client priority: {}", resp.status());
                "low".to_string()
            }
            Err(e) => {
                error!("Error getting client priority: {}", e);
                "low".to_string()
            }
        }
    }

    /// Apply a policy, then refresh so subscribers see the new set.
    pub async fn apply_policy(&self, policy: &Value) -> Value {
        let policy_type = policy
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("network_security");
        let wrapped = json!({"type": policy_type, "data": policy});
        let url = format!("{}/api/v1/policies", self.base_url);

        match self.client.post(&url).json(&wrapped).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 201 => {
                let result = resp.json::<Value>().await.unwrap_or_else(|_| json!({}));
                let policy_id = result.get("id").cloned().unwrap_or(Value::Null);
                info!("Successfully applied policy, received ID: {}", policy_id);
                self.refresh_once().await;
                json!({"status": "success", "id": policy_id, "message": "Policy applied successfully"})
            }
            Ok(resp) => {
                let status = resp.status();
                let message = resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| format!("Status code: {}", status));
                error!("Failed to apply policy: {}", message);
                json!({"status": "error", "message": format!("Failed to apply policy: {}", message)})
            }
            Err(e) => {
                error!("Error applying policy: {}", e);
                json!({"status": "error", "message": format!("Error applying policy: {}", e)})
            }
        }
    }

    /// Startup gate: `GET /check?component=collector&action=collect_metrics`.
    /// Only an explicit deny blocks (and only in strict mode); errors bypass
    /// with a warning so a dead engine cannot brick the collector.
    pub async fn check_collection_allowed(&self, strict: bool) -> bool {
        let url = format!("{}/check", self.base_url);
        let params = [("component", "collector"), ("action", "collect_metrics")];
        match self.client.get(&url).query(&params).send().await {
            Ok(resp) if resp.status().is_success() => {
                let result = resp.json::<Value>().await.unwrap_or_else(|_| json!({}));
                let allowed = result.get("allowed").and_then(Value::as_bool).unwrap_or(false);
                let reason = result
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("No reason provided");
                if allowed {
                    info!("Policy check successful: {}", reason);
                    true
                } else {
                    warn!("Policy check denied: {}", reason);
                    false
                }
            }
            Ok(resp) => {
                error!("Policy check failed. Status code: {}", resp.status());
                if strict {
                    false
                } else {
                    warn!("Bypassing policy check due to error response from Policy Engine");
                    true
                }
            }
            Err(e) => {
                error!("Failed to connect to Policy Engine for policy check: {}", e);
                warn!("Bypassing policy check due to connection error to Policy Engine");
                true
            }
        }
    }
}

fn validation_error(message: &str) -> Value {
    json!({"status": "error", "message": message})
}

/// Parse the raw policy payload (`{"policies": [...]}` or a bare list) and
/// normalize entries: type aliasing, generated policy and rule ids.
pub fn normalize_policies(data: &Value) -> Vec<Policy> {
    let entries = match data {
        Value::Object(obj) => obj.get("policies").and_then(Value::as_array).cloned(),
        Value::Array(list) => Some(list.clone()),
        _ => None,
    };
    let Some(entries) = entries else {
        warn!("Received unexpected policy data format");
        return Vec::new();
    };

    let mut policies = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let has_type = entry.get("type").or_else(|| entry.get("policy_type")).is_some();
        if !entry.is_object() || !has_type {
            warn!("Skipping invalid policy entry: {}", entry);
            continue;
        }
        let mut policy: Policy = match serde_json::from_value(entry.clone()) {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping unparseable policy entry: {}", e);
                continue;
            }
        };
        if policy.id.is_empty() {
            policy.id = format!("policy-{}", idx);
        }
        if policy.policy_type == "network" {
            policy.policy_type = "network_security".to_string();
        }
        for (rule_idx, rule) in policy.rules.iter_mut().enumerate() {
            if rule.id.is_empty() {
                rule.id = format!("{}_rule_{}", policy.id, rule_idx);
            }
        }
        policies.push(policy);
    }
    policies
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn policies_normalize_ids_and_type_aliases() {
        let data = json!({"policies": [
            {"type": "network", "rules": [{"action": "deny", "match": {}}]},
            {"id": "qos-1", "type": "qos"},
        ]});
        let policies = normalize_policies(&data);
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].id, "policy-0");
        assert_eq!(policies[0].policy_type, "network_security");
        assert_eq!(policies[0].rules[0].id, "policy-0_rule_0");
        assert_eq!(policies[1].id, "qos-1");
    }

    #[test]
    fn bare_list_and_invalid_entries() {
        let data = json!([
            {"type": "security", "id": "s1"},
            {"no_type_here": true},
            "not-an-object",
        ]);
        let policies = normalize_policies(&data);
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].id, "s1");
    }

    #[test]
    fn unexpected_shapes_produce_empty_sets() {
        assert!(normalize_policies(&json!("nope")).is_empty());
        assert!(normalize_policies(&json!({"other": 1})).is_empty());
    }
}
