//! Flow manager: translates policies into flow rules on the switches and
//! keeps a connectivity-preserving minimal ruleset whenever the policy
//! source is unreachable.
//!
//! State machine per policy-engine connection:
//! - CONNECTED: apply the engine's policy set; on re-connection the fallback
//!   rules are removed before the fresh set goes in.
//! - DISCONNECTED: load the local fallback policy file; if that fails too,
//!   install the minimal ICMP allow rule.
//!
//! All transitions run under one async mutex so fallback apply/remove never
//! interleaves with a normal policy application.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Timelike, Utc};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::clients::policy_engine::{PolicyEngineClient, PolicyUpdate};
use crate::clients::sdn::{Dpid, SdnControllerClient, SwitchInfo};
use crate::flow::rules::{
    actions_for, basic_connectivity_match, compile_rule, fallback_icmp_match,
    normal_output_actions, CompiledRule, BASIC_CONNECTIVITY_PRIORITY, ETH_TYPE_IPV4,
    FALLBACK_PRIORITY,
};
use crate::models::{Config, Policy};

/// Identity of an installed flow: the removal key.
#[derive(Debug, Clone)]
pub struct InstalledFlow {
    pub dpid: Dpid,
    pub match_fields: Value,
    pub priority: u32,
}

/// Tracking key for rules installed from the local fallback file.
const FALLBACK_TRACKING_KEY: &str = "fallback_policy_file";

pub struct FlowManager {
    sdn: SdnControllerClient,
    config: Arc<Config>,
    policy_client: Arc<PolicyEngineClient>,
    /// Serializes policy application so fallback apply/remove never
    /// interleaves with a normal apply.
    apply_lock: AsyncMutex<()>,
    connected: parking_lot::Mutex<bool>,
    /// Installed rules per client id or target key.
    installed: parking_lot::Mutex<HashMap<String, Vec<InstalledFlow>>>,
}

impl FlowManager {
    pub fn new(
        sdn: SdnControllerClient,
        config: Arc<Config>,
        policy_client: Arc<PolicyEngineClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sdn,
            config,
            policy_client,
            apply_lock: AsyncMutex::new(()),
            connected: parking_lot::Mutex::new(false),
            installed: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Long-lived worker: establish the initial state from the policy
    /// engine, then react to policy updates until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut updates = self.policy_client.subscribe();

        // Initial state: one synchronous refresh decides connected vs
        // fallback before the subscription loop takes over.
        self.policy_client.refresh_once().await;
        let initial = PolicyUpdate {
            policies: self.policy_client.get_policies(),
            fetch_ok: self.policy_client.check_policy_engine_status(),
        };
        info!(
            "Initialized FlowManager. Initial policy engine status: {}",
            if initial.fetch_ok { "Connected" } else { "Disconnected" }
        );
        self.handle_policy_update(initial).await;

        loop {
            tokio::select! {
                update = updates.recv() => {
                    match update {
                        Some(update) => self.handle_policy_update(update).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Flow manager stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Apply one policy update, driving the connection state machine.
    pub async fn handle_policy_update(&self, update: PolicyUpdate) {
        let _guard = self.apply_lock.lock().await;
        info!("FlowManager: Received {} policies to handle.", update.policies.len());

        let was_connected = *self.connected.lock();
        if update.fetch_ok {
            if !was_connected {
                info!("Policy engine connection restored. Applying policies.");
                self.remove_fallback_rules().await;
            }
            *self.connected.lock() = true;
            self.process_policies(&update.policies).await;
        } else {
            if was_connected {
                warn!("Policy engine connection lost. Applying fallback rules.");
            }
            *self.connected.lock() = false;
            match self.load_fallback_policies() {
                Some(policies) => {
                    info!("Loaded {} policies from fallback file", policies.len());
                    self.apply_fallback_file_policies(&policies).await;
                }
                None => {
                    warn!("No fallback policy file available. Applying minimal ICMP fallback rule.");
                    self.apply_fallback_rules().await;
                }
            }
        }
    }

    /// Install the fallback file's network-security rules, tracked so they
    /// can be removed wholesale when the policy engine returns.
    async fn apply_fallback_file_policies(&self, policies: &[Policy]) {
        self.installed.lock().remove(FALLBACK_TRACKING_KEY);

        let switches = match self.sdn.get_switches().await {
            Ok(switches) if !switches.is_empty() => switches,
            Ok(_) | Err(_) => {
                warn!("FlowManager: Cannot apply fallback policies: No switches found.");
                return;
            }
        };

        for policy in policies {
            if !policy.enabled {
                continue;
            }
            if policy.policy_type != "network_security" {
                warn!(
                    "FlowManager: Fallback file policy '{}' has type '{}'; only network_security is applied while disconnected",
                    policy.id, policy.policy_type
                );
                continue;
            }
            for rule in &policy.rules {
                let Ok(compiled) = compile_rule(rule, &self.config) else { continue };
                for switch in &switches {
                    match self
                        .sdn
                        .add_flow(
                            switch.dpid,
                            compiled.priority,
                            &compiled.match_fields,
                            &compiled.actions,
                            compiled.idle_timeout,
                            compiled.hard_timeout,
                        )
                        .await
                    {
                        Ok(()) => {
                            self.installed
                                .lock()
                                .entry(FALLBACK_TRACKING_KEY.to_string())
                                .or_default()
                                .push(InstalledFlow {
                                    dpid: switch.dpid,
                                    match_fields: compiled.match_fields.clone(),
                                    priority: compiled.priority,
                                });
                        }
                        Err(e) => error!(
                            "FlowManager: Failed to apply fallback rule '{}' to switch {}: {}",
                            compiled.rule_id, switch.dpid, e
                        ),
                    }
                }
            }
        }
    }

    pub fn policy_engine_connected(&self) -> bool {
        *self.connected.lock()
    }

    /// Parse the local fallback policy file; None on any failure.
    fn load_fallback_policies(&self) -> Option<Vec<Policy>> {
        if !self.config.policy_fallback_enabled {
            return None;
        }
        let path = &self.config.default_policy_file;
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Fallback policy file not found at {}: {}", path, e);
                return None;
            }
        };
        let data: Value = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(e) => {
                error!("Error decoding JSON from fallback policy file {}: {}", path, e);
                return None;
            }
        };
        if data.get("policies").and_then(Value::as_array).is_none() {
            error!(
                "Invalid format in fallback policy file {}: 'policies' key missing or not a list.",
                path
            );
            return None;
        }
        let policies = crate::clients::policy_engine::normalize_policies(&data);
        if policies.is_empty() {
            None
        } else {
            Some(policies)
        }
    }

    /// Install the minimal ICMP allow rule on every switch.
    async fn apply_fallback_rules(&self) {
        info!("FlowManager: Applying fallback ICMP allow rule.");
        let switches = match self.sdn.get_switches().await {
            Ok(switches) if !switches.is_empty() => switches,
            Ok(_) | Err(_) => {
                warn!("FlowManager: Cannot apply fallback rules: No switches found.");
                return;
            }
        };
        for switch in switches {
            let result = self
                .sdn
                .add_flow(
                    switch.dpid,
                    FALLBACK_PRIORITY,
                    &fallback_icmp_match(),
                    &[json!({"type": "FORWARD"})],
                    0,
                    0,
                )
                .await;
            match result {
                Ok(()) => debug!("FlowManager: Applied fallback ICMP rule to switch {}", switch.dpid),
                Err(e) => error!(
                    "FlowManager: Failed to apply fallback ICMP rule to switch {}: {}",
                    switch.dpid, e
                ),
            }
        }
    }

    /// Remove the fallback rules everywhere once the engine is back: both
    /// the tracked fallback-file rules and the minimal ICMP rule.
    async fn remove_fallback_rules(&self) {
        let file_rules = self.installed.lock().remove(FALLBACK_TRACKING_KEY).unwrap_or_default();
        for flow in file_rules {
            if let Err(e) = self
                .sdn
                .remove_flow(flow.dpid, &flow.match_fields, Some(flow.priority))
                .await
            {
                warn!(
                    "FlowManager: Failed to remove fallback file rule from switch {}: {}",
                    flow.dpid, e
                );
            }
        }

        info!("FlowManager: Removing fallback ICMP allow rule.");
        let switches = match self.sdn.get_switches().await {
            Ok(switches) if !switches.is_empty() => switches,
            Ok(_) | Err(_) => {
                warn!("FlowManager: Cannot remove fallback rules: No switches found.");
                return;
            }
        };
        for switch in switches {
            let result = self
                .sdn
                .remove_flow(switch.dpid, &fallback_icmp_match(), Some(FALLBACK_PRIORITY))
                .await;
            match result {
                Ok(()) => {
                    debug!("FlowManager: Removed fallback ICMP rule from switch {}", switch.dpid)
                }
                Err(e) => warn!(
                    "FlowManager: Failed to remove fallback ICMP rule from switch {}: {}. May require manual cleanup.",
                    switch.dpid, e
                ),
            }
        }
    }

    /// Dispatch each enabled policy by type.
    async fn process_policies(&self, policies: &[Policy]) {
        info!("FlowManager: Processing {} policies", policies.len());
        let mut applied = 0usize;
        let mut failed = 0usize;

        for policy in policies {
            if !policy.enabled {
                info!("FlowManager: Skipping disabled policy: {}", policy_name(policy));
                continue;
            }
            let ok = match policy.policy_type.as_str() {
                "network_security" => self.process_network_security_policy(policy).await,
                "qos" => self.process_qos_policy(policy).await,
                "security" => self.process_security_policy(policy).await,
                "bandwidth" | "bandwidth_allocation" => self.process_bandwidth_policy(policy).await,
                "time_window" => self.process_time_window_policy(policy).await,
                "traffic_priority" => self.process_traffic_priority_policy(policy).await,
                "anomaly_detection" => self.process_anomaly_policy(policy).await,
                "path_selection" => self.process_path_selection_policy(policy).await,
                other => {
                    warn!("FlowManager: Ignoring unsupported policy type: {}", other);
                    continue;
                }
            };
            if ok {
                applied += 1;
            } else {
                failed += 1;
            }
        }
        info!("FlowManager: Applied {} policies successfully, {} failed", applied, failed);
    }

    /// Compile and install every rule of a network-security policy.
    async fn process_network_security_policy(&self, policy: &Policy) -> bool {
        let name = policy_name(policy);
        info!("FlowManager: Processing network security policy: {}", name);

        let mut switches = self.sdn.get_switches().await.unwrap_or_default();
        if switches.is_empty() {
            warn!(
                "FlowManager: Initial switch check found no switches for policy {}. Waiting 2s and retrying...",
                name
            );
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            switches = self.sdn.get_switches().await.unwrap_or_default();
        }
        if switches.is_empty() {
            warn!("FlowManager: No switches available to apply policy {}", name);
            return false;
        }
        if policy.rules.is_empty() {
            info!("FlowManager: No rules found in policy {}.", name);
            return true;
        }

        let mut applied = 0usize;
        let mut failed = 0usize;
        for rule in &policy.rules {
            match compile_rule(rule, &self.config) {
                Ok(compiled) => {
                    if self.install_rule(&compiled, &switches).await {
                        applied += 1;
                    } else {
                        failed += 1;
                    }
                }
                Err(_) => continue,
            }
        }
        info!(
            "Finished processing policy '{}'. Applied rule instances: {}, Failed rule instances: {}",
            name, applied, failed
        );
        failed == 0
    }

    /// Install a compiled rule on every switch, degrading step by step:
    /// original actions -> NORMAL output -> low-priority basic connectivity.
    async fn install_rule(&self, rule: &CompiledRule, switches: &[SwitchInfo]) -> bool {
        let mut success = false;

        for switch in switches {
            // Switches without ports have not completed the controller
            // handshake; give them only the basic connectivity rule.
            if switch.ports.is_empty() {
                warn!(
                    "Switch '{}' has no ports configured, may have connectivity issues. Installing basic connectivity rule.",
                    switch.dpid
                );
                if self.install_basic_connectivity(switch.dpid).await {
                    success = true;
                }
                continue;
            }

            match self
                .sdn
                .add_flow(
                    switch.dpid,
                    rule.priority,
                    &rule.match_fields,
                    &rule.actions,
                    rule.idle_timeout,
                    rule.hard_timeout,
                )
                .await
            {
                Ok(()) => {
                    info!(
                        "Successfully added flow for rule '{}' on switch '{}'",
                        rule.rule_id, switch.dpid
                    );
                    success = true;
                    continue;
                }
                Err(e) => error!(
                    "Failed to add flow for rule '{}' on switch '{}': {}",
                    rule.rule_id, switch.dpid, e
                ),
            }

            // Retry with the plain forwarding action.
            match self
                .sdn
                .add_flow(
                    switch.dpid,
                    rule.priority,
                    &rule.match_fields,
                    &normal_output_actions(),
                    rule.idle_timeout,
                    rule.hard_timeout,
                )
                .await
            {
                Ok(()) => {
                    info!(
                        "Successfully added flow with fallback action for rule '{}' on switch '{}'",
                        rule.rule_id, switch.dpid
                    );
                    success = true;
                }
                Err(e) => {
                    error!(
                        "Failed to add flow with fallback action for rule '{}' on switch '{}': {}",
                        rule.rule_id, switch.dpid, e
                    );
                    self.install_basic_connectivity(switch.dpid).await;
                }
            }
        }

        if !success {
            // Keep the fabric reachable even when the whole rule failed.
            for switch in switches {
                self.install_basic_connectivity(switch.dpid).await;
            }
        }
        success
    }

    async fn install_basic_connectivity(&self, dpid: Dpid) -> bool {
        match self
            .sdn
            .add_flow(
                dpid,
                BASIC_CONNECTIVITY_PRIORITY,
                &basic_connectivity_match(),
                &normal_output_actions(),
                0,
                0,
            )
            .await
        {
            Ok(()) => {
                info!("Successfully added basic connectivity flow to switch '{}'", dpid);
                true
            }
            Err(e) => {
                error!(
                    "Failed to add even basic connectivity flow to switch '{}', check controller-switch communication: {}",
                    dpid, e
                );
                false
            }
        }
    }

    /// Install one flow on every switch and record it under a tracking key.
    async fn install_tracked(
        &self,
        key: &str,
        priority: u32,
        match_fields: Value,
        actions: Vec<Value>,
        idle_timeout: u32,
        hard_timeout: u32,
    ) -> bool {
        let switches = self.sdn.get_switches().await.unwrap_or_default();
        if switches.is_empty() {
            warn!("No switches available to install flow for '{}'", key);
            return false;
        }
        let mut success = false;
        for switch in &switches {
            match self
                .sdn
                .add_flow(switch.dpid, priority, &match_fields, &actions, idle_timeout, hard_timeout)
                .await
            {
                Ok(()) => {
                    self.installed.lock().entry(key.to_string()).or_default().push(InstalledFlow {
                        dpid: switch.dpid,
                        match_fields: match_fields.clone(),
                        priority,
                    });
                    success = true;
                }
                Err(e) => error!("Failed to install flow for '{}' on {}: {}", key, switch.dpid, e),
            }
        }
        success
    }

    // --- type-specific policy handlers -------------------------------------

    async fn process_qos_policy(&self, policy: &Policy) -> bool {
        let data = &policy.data;
        let client_id = data.get("client_id").and_then(Value::as_str).unwrap_or(&policy.id);
        let client_ip = data.get("client_ip").and_then(Value::as_str);
        let server_ip = data
            .get("server_ip")
            .and_then(Value::as_str)
            .or_else(|| self.config.node_ip("fl-server"));
        let (Some(client_ip), Some(server_ip)) = (client_ip, server_ip) else {
            warn!("QoS policy {} missing client/server IPs", policy.id);
            return false;
        };
        // Policies without an explicit level defer to the engine's view of
        // the client.
        let level = match data.get("priority_level").and_then(Value::as_str) {
            Some(level) => level.to_string(),
            None => self.policy_client.get_client_priority(client_id).await,
        };
        self.add_client_qos_flow(client_id, client_ip, server_ip, &level).await
    }

    async fn process_security_policy(&self, policy: &Policy) -> bool {
        let Some(target_ip) = policy.data.get("target_ip").and_then(Value::as_str) else {
            warn!("Security policy {} missing target_ip", policy.id);
            return false;
        };
        let reason = policy
            .data
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("security_policy");
        self.add_security_flow(target_ip, reason).await
    }

    async fn process_bandwidth_policy(&self, policy: &Policy) -> bool {
        let data = &policy.data;
        let client_id = data.get("client_id").and_then(Value::as_str).unwrap_or(&policy.id);
        let Some(client_ip) = data.get("client_ip").and_then(Value::as_str) else {
            warn!("Bandwidth policy {} missing client_ip", policy.id);
            return false;
        };
        let limit_mbps = data.get("limit_mbps").and_then(Value::as_f64).unwrap_or(0.0);
        if data.get("guaranteed").and_then(Value::as_bool).unwrap_or(false) {
            self.add_bandwidth_guarantee_flow(client_id, client_ip, limit_mbps).await
        } else {
            self.add_bandwidth_limit_flow(client_id, client_ip, limit_mbps).await
        }
    }

    async fn process_time_window_policy(&self, policy: &Policy) -> bool {
        let data = &policy.data;
        let client_id = data.get("client_id").and_then(Value::as_str).unwrap_or(&policy.id);
        let Some(client_ip) = data.get("client_ip").and_then(Value::as_str) else {
            warn!("Time-window policy {} missing client_ip", policy.id);
            return false;
        };
        let start_hour = data.get("start_hour").and_then(Value::as_u64).unwrap_or(0) as u32;
        let end_hour = data.get("end_hour").and_then(Value::as_u64).unwrap_or(24) as u32;
        self.add_time_based_flow(client_id, client_ip, start_hour, end_hour).await
    }

    async fn process_traffic_priority_policy(&self, policy: &Policy) -> bool {
        let data = &policy.data;
        let traffic_type = data.get("traffic_type").and_then(Value::as_str).unwrap_or("default");
        let src_ip = data.get("src_ip").and_then(Value::as_str).unwrap_or("any");
        let dst_ip = data.get("dst_ip").and_then(Value::as_str).unwrap_or("any");
        let priority = data.get("priority").and_then(Value::as_u64).unwrap_or(150) as u32;
        self.add_traffic_priority_flow(traffic_type, src_ip, dst_ip, priority).await
    }

    async fn process_anomaly_policy(&self, policy: &Policy) -> bool {
        let data = &policy.data;
        let Some(target_ip) = data.get("target_ip").and_then(Value::as_str) else {
            warn!("Anomaly-detection policy {} missing target_ip", policy.id);
            return false;
        };
        let protocol = data.get("protocol").and_then(Value::as_str).unwrap_or("any");
        let port = data.get("port").and_then(Value::as_u64).unwrap_or(0) as u16;
        self.add_anomaly_detection_flow(target_ip, protocol, port).await
    }

    async fn process_path_selection_policy(&self, policy: &Policy) -> bool {
        let data = &policy.data;
        let (Some(src_ip), Some(dst_ip)) = (
            data.get("src_ip").and_then(Value::as_str),
            data.get("dst_ip").and_then(Value::as_str),
        ) else {
            warn!("Path-selection policy {} missing src/dst", policy.id);
            return false;
        };
        let path_nodes: Vec<String> = data
            .get("path_nodes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|n| n.as_str().map(str::to_string))
            .collect();
        let protocol = data.get("protocol").and_then(Value::as_str).unwrap_or("any");
        let port = data.get("port").and_then(Value::as_u64).unwrap_or(0) as u16;
        if !self.policy_client.authorize_flow(src_ip, dst_ip, protocol, port).await {
            warn!(
                "Path selection {} -> {} rejected by the policy engine; not installing",
                src_ip, dst_ip
            );
            return false;
        }
        self.add_path_selection_flow(src_ip, dst_ip, &path_nodes).await
    }

    // --- higher-level flow APIs --------------------------------------------

    /// Validate a policy payload with the engine before installation.
    /// Returns None when the engine denies it; otherwise the (possibly
    /// adjusted) payload. Engine errors read as approval so a dead engine
    /// never blocks the fabric.
    async fn validate_with_engine(&self, kind: &str, policy: Value) -> Option<Value> {
        let validation = self.policy_client.validate_policy(&policy).await;
        let status = validation
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("approved");
        if status == "denied" {
            warn!(
                "{} policy denied: {}",
                kind,
                validation
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("no message")
            );
            return None;
        }
        match validation.get("policy") {
            Some(adjusted) if adjusted.is_object() => Some(adjusted.clone()),
            _ => Some(policy),
        }
    }

    /// Bidirectional QoS flows for an FL client; priority follows the
    /// client's priority level.
    pub async fn add_client_qos_flow(
        &self,
        client_id: &str,
        client_ip: &str,
        server_ip: &str,
        priority_level: &str,
    ) -> bool {
        let payload = json!({
            "type": "qos",
            "client_id": client_id,
            "client_ip": client_ip,
            "server_ip": server_ip,
            "priority_level": priority_level,
        });
        let Some(approved) = self.validate_with_engine("QoS", payload).await else {
            return false;
        };
        let priority_level = approved
            .get("priority_level")
            .and_then(Value::as_str)
            .unwrap_or(priority_level);

        let priority = match priority_level {
            "high" => 200,
            "medium" => 150,
            _ => 100,
        };
        let up = json!({"eth_type": ETH_TYPE_IPV4, "ipv4_src": client_ip, "ipv4_dst": server_ip});
        let down = json!({"eth_type": ETH_TYPE_IPV4, "ipv4_src": server_ip, "ipv4_dst": client_ip});
        let a = self
            .install_tracked(client_id, priority, up, normal_output_actions(), 0, 0)
            .await;
        let b = self
            .install_tracked(client_id, priority, down, normal_output_actions(), 0, 0)
            .await;
        a && b
    }

    /// Block all IPv4 traffic to and from a target address.
    pub async fn add_security_flow(&self, target_ip: &str, reason: &str) -> bool {
        let payload = json!({
            "type": "security",
            "target_ip": target_ip,
            "reason": reason,
        });
        if self.validate_with_engine("Security", payload).await.is_none() {
            return false;
        }

        info!("Blocking traffic for {} ({})", target_ip, reason);
        let key = format!("security_{}", target_ip);
        let from = json!({"eth_type": ETH_TYPE_IPV4, "ipv4_src": target_ip});
        let to = json!({"eth_type": ETH_TYPE_IPV4, "ipv4_dst": target_ip});
        let a = self.install_tracked(&key, 300, from, Vec::new(), 0, 0).await;
        let b = self.install_tracked(&key, 300, to, Vec::new(), 0, 0).await;
        a && b
    }

    /// Bandwidth limit. Metering is not available through the REST surface
    /// on every controller build, so the flow degrades to plain forwarding;
    /// partial success with a clear log, never a failure.
    pub async fn add_bandwidth_limit_flow(
        &self,
        client_id: &str,
        client_ip: &str,
        limit_mbps: f64,
    ) -> bool {
        let payload = json!({
            "type": "bandwidth",
            "client_id": client_id,
            "client_ip": client_ip,
            "limit_mbps": limit_mbps,
        });
        let Some(approved) = self.validate_with_engine("Bandwidth", payload).await else {
            return false;
        };
        let limit_mbps = approved
            .get("limit_mbps")
            .or_else(|| approved.get("bandwidth_mbps"))
            .and_then(Value::as_f64)
            .unwrap_or(limit_mbps);

        warn!(
            "Bandwidth limit of {} Mbps for {} degraded to forwarding (controller metering unavailable)",
            limit_mbps, client_id
        );
        let m = json!({"eth_type": ETH_TYPE_IPV4, "ipv4_src": client_ip});
        self.install_tracked(client_id, 120, m, normal_output_actions(), 0, 0).await
    }

    /// Bandwidth guarantee requires controller queue support; degraded the
    /// same way as limits.
    pub async fn add_bandwidth_guarantee_flow(
        &self,
        client_id: &str,
        client_ip: &str,
        guaranteed_mbps: f64,
    ) -> bool {
        let payload = json!({
            "type": "bandwidth",
            "client_id": client_id,
            "client_ip": client_ip,
            "guaranteed_mbps": guaranteed_mbps,
            "guaranteed": true,
        });
        let Some(approved) = self.validate_with_engine("Bandwidth guarantee", payload).await
        else {
            return false;
        };
        let guaranteed_mbps = approved
            .get("guaranteed_mbps")
            .and_then(Value::as_f64)
            .unwrap_or(guaranteed_mbps);

        warn!(
            "Bandwidth guarantee of {} Mbps for {} degraded to forwarding (controller queues unavailable)",
            guaranteed_mbps, client_id
        );
        let m = json!({"eth_type": ETH_TYPE_IPV4, "ipv4_dst": client_ip});
        self.install_tracked(client_id, 130, m, normal_output_actions(), 0, 0).await
    }

    /// Time-window gate: inside the window an allow flow is installed with
    /// a hard timeout running to the window's end; outside it nothing is
    /// installed.
    pub async fn add_time_based_flow(
        &self,
        client_id: &str,
        client_ip: &str,
        start_hour: u32,
        end_hour: u32,
    ) -> bool {
        let payload = json!({
            "type": "time_window",
            "client_id": client_id,
            "client_ip": client_ip,
            "start_hour": start_hour,
            "end_hour": end_hour,
        });
        let Some(approved) = self.validate_with_engine("Time-window", payload).await else {
            return false;
        };
        let start_hour = approved
            .get("start_hour")
            .and_then(Value::as_u64)
            .map(|h| h as u32)
            .unwrap_or(start_hour);
        let end_hour = approved
            .get("end_hour")
            .and_then(Value::as_u64)
            .map(|h| h as u32)
            .unwrap_or(end_hour);

        let now_hour = Utc::now().hour();
        let active = if start_hour <= end_hour {
            now_hour >= start_hour && now_hour < end_hour
        } else {
            // Window wraps midnight.
            now_hour >= start_hour || now_hour < end_hour
        };
        if !active {
            info!(
                "Time window {}-{}h for {} not currently active; no flow installed",
                start_hour, end_hour, client_id
            );
            return true;
        }

        let hours_left =
            if end_hour > now_hour { end_hour - now_hour } else { 24 - now_hour + end_hour };
        let hard_timeout = hours_left.saturating_mul(3600);
        let m = json!({"eth_type": ETH_TYPE_IPV4, "ipv4_src": client_ip});
        self.install_tracked(client_id, 140, m, normal_output_actions(), 0, hard_timeout)
            .await
    }

    /// Traffic prioritization; forwarding stays on the NORMAL pipeline.
    pub async fn add_traffic_priority_flow(
        &self,
        traffic_type: &str,
        src_ip: &str,
        dst_ip: &str,
        priority: u32,
    ) -> bool {
        let payload = json!({
            "type": "traffic_priority",
            "traffic_type": traffic_type,
            "src_ip": src_ip,
            "dst_ip": dst_ip,
            "priority": priority,
        });
        let Some(approved) = self.validate_with_engine("Traffic priority", payload).await
        else {
            return false;
        };
        let priority = approved
            .get("priority")
            .and_then(Value::as_u64)
            .map(|p| p as u32)
            .unwrap_or(priority);

        let key = format!("priority_{}", traffic_type);
        let mut m = json!({"eth_type": ETH_TYPE_IPV4});
        if src_ip != "any" {
            m["ipv4_src"] = json!(src_ip);
        }
        if dst_ip != "any" {
            m["ipv4_dst"] = json!(dst_ip);
        }
        self.install_tracked(&key, priority, m, normal_output_actions(), 0, 0).await
    }

    /// Anomaly detection watches a target's traffic. The controller REST
    /// surface exposes no meter configuration, so the meter half degrades
    /// to mirroring matched traffic to the controller; partial success.
    pub async fn add_anomaly_detection_flow(
        &self,
        target_ip: &str,
        protocol: &str,
        port: u16,
    ) -> bool {
        let payload = json!({
            "type": "anomaly_detection",
            "target_ip": target_ip,
            "protocol": protocol,
            "port": port,
        });
        let Some(approved) = self.validate_with_engine("Anomaly detection", payload).await
        else {
            return false;
        };
        let protocol = approved
            .get("protocol")
            .and_then(Value::as_str)
            .unwrap_or(protocol);
        let port = approved
            .get("port")
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .unwrap_or(port);

        warn!(
            "Anomaly detection for {} degraded to controller mirroring (controller metering unavailable)",
            target_ip
        );

        let key = format!("anomaly_{}", target_ip);
        let mut m = json!({"eth_type": ETH_TYPE_IPV4, "ipv4_dst": target_ip});
        match protocol {
            "tcp" => {
                m["ip_proto"] = json!(6);
                if port > 0 {
                    m["tcp_dst"] = json!(port);
                }
            }
            "udp" => {
                m["ip_proto"] = json!(17);
                if port > 0 {
                    m["udp_dst"] = json!(port);
                }
            }
            _ => {}
        }
        self.install_tracked(&key, 250, m, actions_for("alert"), 0, 0).await
    }

    /// Pin a src/dst pair onto an explicit switch path, one flow per hop.
    pub async fn add_path_selection_flow(
        &self,
        src_ip: &str,
        dst_ip: &str,
        path_nodes: &[String],
    ) -> bool {
        let payload = json!({
            "type": "path_selection",
            "src_ip": src_ip,
            "dst_ip": dst_ip,
            "path_nodes": path_nodes,
            "priority": 150,
        });
        let Some(approved) = self.validate_with_engine("Path selection", payload).await else {
            return false;
        };
        let adjusted_nodes: Option<Vec<String>> = approved
            .get("path_nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            });
        let path_nodes: &[String] = adjusted_nodes.as_deref().unwrap_or(path_nodes);
        let priority = approved
            .get("priority")
            .and_then(Value::as_u64)
            .map(|p| p as u32)
            .unwrap_or(150);

        if path_nodes.is_empty() {
            warn!("Path selection for {} -> {} has no path nodes", src_ip, dst_ip);
            return false;
        }
        let key = format!("path_{}_{}", src_ip, dst_ip);
        let m = json!({"eth_type": ETH_TYPE_IPV4, "ipv4_src": src_ip, "ipv4_dst": dst_ip});
        let mut success = true;
        for node in path_nodes {
            let dpid = match Dpid::parse_str(node) {
                Ok(dpid) => dpid,
                Err(e) => {
                    warn!("Skipping path node with {}", e);
                    success = false;
                    continue;
                }
            };
            match self.sdn.add_flow(dpid, priority, &m, &normal_output_actions(), 0, 0).await {
                Ok(()) => {
                    self.installed.lock().entry(key.clone()).or_default().push(InstalledFlow {
                        dpid,
                        match_fields: m.clone(),
                        priority,
                    });
                }
                Err(e) => {
                    error!("Failed to add path flow on {}: {}", dpid, e);
                    success = false;
                }
            }
        }
        success
    }

    /// Remove every flow recorded for a client or target key.
    pub async fn remove_client_flows(&self, client_id: &str) -> bool {
        let flows = self.installed.lock().remove(client_id).unwrap_or_default();
        if flows.is_empty() {
            debug!("No tracked flows for '{}'", client_id);
            return true;
        }
        let mut ok = true;
        for flow in flows {
            if let Err(e) = self
                .sdn
                .remove_flow(flow.dpid, &flow.match_fields, Some(flow.priority))
                .await
            {
                error!("Failed to remove flow for '{}' on {}: {}", client_id, flow.dpid, e);
                ok = false;
            }
        }
        ok
    }

    /// Tracked flows, optionally for a single key.
    pub fn get_active_flows(&self, client_id: Option<&str>) -> Vec<Value> {
        let installed = self.installed.lock();
        let render = |key: &str, flow: &InstalledFlow| {
            json!({
                "client_id": key,
                "switch_dpid": flow.dpid.to_hex(),
                "match": flow.match_fields,
                "priority": flow.priority,
            })
        };
        match client_id {
            Some(key) => installed
                .get(key)
                .into_iter()
                .flatten()
                .map(|f| render(key, f))
                .collect(),
            None => installed
                .iter()
                .flat_map(|(key, flows)| flows.iter().map(move |f| render(key, f)))
                .collect(),
        }
    }

    /// Wipe every flow from every switch and forget the tracking state.
    pub async fn clear_all_flows(&self) -> bool {
        let switches = self.sdn.get_switches().await.unwrap_or_default();
        let mut ok = true;
        for switch in switches {
            if let Err(e) = self.sdn.clear_flows(switch.dpid).await {
                error!("Failed to clear flows on {}: {}", switch.dpid, e);
                ok = false;
            }
        }
        self.installed.lock().clear();
        ok
    }
}

fn policy_name(policy: &Policy) -> String {
    policy
        .name
        .clone()
        .unwrap_or_else(|| format!("Policy {}", policy.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_rule_matches_icmp_over_ipv4() {
        let m = fallback_icmp_match();
        assert_eq!(m["eth_type"], ETH_TYPE_IPV4);
        assert_eq!(m["ip_proto"], 1);
        assert_eq!(FALLBACK_PRIORITY, 10);
    }

    #[test]
    fn policy_names_fall_back_to_ids() {
        let policy = Policy {
            id: "p9".into(),
            policy_type: "qos".into(),
            name: None,
            enabled: true,
            rules: Vec::new(),
            data: Value::Null,
        };
        assert_eq!(policy_name(&policy), "Policy p9");
    }
}
