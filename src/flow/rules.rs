//! Policy-to-flow compilation for `network_security` rules.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::models::{Config, PolicyRule};

pub const FALLBACK_PRIORITY: u32 = 10;
pub const BASIC_CONNECTIVITY_PRIORITY: u32 = 1;

pub const ETH_TYPE_IPV4: u32 = 0x0800;
pub const ETH_TYPE_ARP: u32 = 0x0806;

/// The minimal connectivity-preserving rule: ICMP over IPv4, forwarded.
pub fn fallback_icmp_match() -> Value {
    json!({"eth_type": ETH_TYPE_IPV4, "ip_proto": 1})
}

pub fn basic_connectivity_match() -> Value {
    json!({"eth_type": ETH_TYPE_IPV4})
}

pub fn normal_output_actions() -> Vec<Value> {
    vec![json!({"type": "OUTPUT", "port": "NORMAL"})]
}

/// A rule compiled down to OpenFlow terms, ready for installation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub rule_id: String,
    pub match_fields: Value,
    pub actions: Vec<Value>,
    pub priority: u32,
    pub idle_timeout: u32,
    pub hard_timeout: u32,
}

/// Why a rule produced no flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileSkip {
    Disabled,
    /// An all-match non-allow rule would isolate the controller from its
    /// switches; never install it.
    TooGeneric,
}

/// Resolve `src_ip`/`dst_ip` values that may be literals, wildcards, or
/// entity-type tokens mapped through NODE_IP_<TYPE> configuration.
pub fn resolve_ip(entity_type: Option<&str>, ip: Option<&str>, config: &Config) -> String {
    let normalized = ip
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty() && v != "*" && v != "any");
    if let Some(ip) = normalized {
        return ip;
    }

    let Some(entity_type) = entity_type else {
        return "any".to_string();
    };
    let entity_type = entity_type.to_ascii_lowercase();

    // Generic "fl-client" means any client.
    if entity_type == "fl-client" {
        return "any".to_string();
    }

    match config.node_ip(&entity_type) {
        Some(ip) => {
            debug!("Resolved type '{}' to IP: {}", entity_type, ip);
            ip.to_string()
        }
        None => {
            debug!("Could not resolve type '{}' to a specific IP. Defaulting to 'any'.", entity_type);
            "any".to_string()
        }
    }
}

/// Compile a single network-security rule. Match construction, action
/// translation, and specificity-based priority live here; installation is
/// the manager's concern.
pub fn compile_rule(rule: &PolicyRule, config: &Config) -> Result<CompiledRule, CompileSkip> {
    if !rule.enabled {
        info!("Skipping disabled rule: '{}'", rule.id);
        return Err(CompileSkip::Disabled);
    }

    let m = &rule.r#match;
    let src_ip = resolve_ip(m.src_type.as_deref(), m.src_ip.as_deref(), config);
    let dst_ip = resolve_ip(m.dst_type.as_deref(), m.dst_ip.as_deref(), config);
    let protocol = m
        .protocol
        .as_deref()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "any".to_string());
    let action = rule.action.to_ascii_lowercase();

    info!("Processing rule '{}' (Action: {}, Protocol: {})", rule.id, action, protocol);

    let mut match_fields = json!({"eth_type": ETH_TYPE_IPV4});
    match protocol.as_str() {
        "tcp" => match_fields["ip_proto"] = json!(6),
        "udp" => match_fields["ip_proto"] = json!(17),
        "icmp" => match_fields["ip_proto"] = json!(1),
        "arp" => match_fields["eth_type"] = json!(ETH_TYPE_ARP),
        _ => {}
    }
    if src_ip != "any" {
        match_fields["ipv4_src"] = json!(src_ip);
    }
    if dst_ip != "any" {
        match_fields["ipv4_dst"] = json!(dst_ip);
    }
    let ports_apply = matches!(protocol.as_str(), "tcp" | "udp");
    if ports_apply {
        if let Some(port) = m.src_port {
            match_fields[format!("{}_src", protocol)] = json!(port);
        }
        if let Some(port) = m.dst_port {
            match_fields[format!("{}_dst", protocol)] = json!(port);
        }
    }

    // Priority rises with specificity: each constrained side is worth 10,
    // the protocol 10, each port 5 on top.
    let src_constrained = src_ip != "any" || (ports_apply && m.src_port.is_some());
    let dst_constrained = dst_ip != "any" || (ports_apply && m.dst_port.is_some());
    let mut priority = 100;
    if src_constrained {
        priority += 10;
    }
    if dst_constrained {
        priority += 10;
    }
    if protocol != "any" {
        priority += 10;
    }
    if ports_apply && m.src_port.is_some() {
        priority += 5;
    }
    if ports_apply && m.dst_port.is_some() {
        priority += 5;
    }

    let unconstrained =
        src_ip == "any" && dst_ip == "any" && protocol == "any" && m.src_port.is_none() && m.dst_port.is_none();
    if unconstrained && !matches!(action.as_str(), "allow" | "accept" | "permit") {
        warn!(
            "Rule '{}' is too generic (matches all traffic) and action is not 'allow'. Skipping to prevent network disruption.",
            rule.id
        );
        return Err(CompileSkip::TooGeneric);
    }

    Ok(CompiledRule {
        rule_id: rule.id.clone(),
        match_fields,
        actions: actions_for(&action),
        priority,
        idle_timeout: rule.idle_timeout,
        hard_timeout: rule.hard_timeout,
    })
}

/// Map a policy action keyword onto OpenFlow actions. An empty action list
/// is a drop.
pub fn actions_for(action: &str) -> Vec<Value> {
    match action {
        "allow" | "accept" | "permit" => normal_output_actions(),
        "deny" => Vec::new(),
        "alert" => vec![json!({"type": "OUTPUT", "port": "CONTROLLER"})],
        "rate_limit" => {
            warn!("Rate limiting not fully implemented, treating as 'allow'");
            normal_output_actions()
        }
        other => {
            warn!("Unknown action type: {}, defaulting to allow", other);
            normal_output_actions()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleMatch;
    use serde_json::json;

    fn test_config() -> Config {
        let mut config = Config::from_env();
        config.node_ips.insert("NODE_IP_FL_SERVER".into(), "192.168.100.10".into());
        config.node_ips.insert("NODE_IP_FL_CLIENT_2".into(), "192.168.100.102".into());
        config
    }

    fn rule(m: RuleMatch, action: &str) -> PolicyRule {
        PolicyRule {
            id: "r1".into(),
            enabled: true,
            r#match: m,
            action: action.into(),
            priority: None,
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }

    #[test]
    fn deny_tcp_ssh_compiles_to_priority_125() {
        let compiled = compile_rule(
            &rule(
                RuleMatch {
                    protocol: Some("tcp".into()),
                    dst_port: Some(22),
                    ..Default::default()
                },
                "deny",
            ),
            &test_config(),
        )
        .unwrap();
        assert_eq!(compiled.priority, 125);
        assert_eq!(compiled.match_fields["eth_type"], ETH_TYPE_IPV4);
        assert_eq!(compiled.match_fields["ip_proto"], 6);
        assert_eq!(compiled.match_fields["tcp_dst"], 22);
        assert!(compiled.actions.is_empty());
    }

    #[test]
    fn all_match_deny_is_refused() {
        let skip = compile_rule(&rule(RuleMatch::default(), "deny"), &test_config());
        assert_eq!(skip, Err(CompileSkip::TooGeneric));

        let skip = compile_rule(&rule(RuleMatch::default(), "alert"), &test_config());
        assert_eq!(skip, Err(CompileSkip::TooGeneric));
    }

    #[test]
    fn all_match_allow_is_permitted() {
        let compiled = compile_rule(&rule(RuleMatch::default(), "allow"), &test_config()).unwrap();
        assert_eq!(compiled.priority, 100);
        assert_eq!(compiled.actions, normal_output_actions());
    }

    #[test]
    fn entity_types_resolve_through_node_ips() {
        let config = test_config();
        assert_eq!(resolve_ip(Some("fl-server"), None, &config), "192.168.100.10");
        assert_eq!(resolve_ip(Some("fl-client-2"), None, &config), "192.168.100.102");
        assert_eq!(resolve_ip(Some("fl-client"), None, &config), "any");
        assert_eq!(resolve_ip(Some("unknown-thing"), None, &config), "any");
        // A literal IP wins over the type token.
        assert_eq!(resolve_ip(Some("fl-server"), Some("10.1.1.1"), &config), "10.1.1.1");
        assert_eq!(resolve_ip(None, Some("*"), &config), "any");
        assert_eq!(resolve_ip(None, Some(""), &config), "any");
    }

    #[test]
    fn arp_overrides_eth_type_without_ip_proto() {
        let compiled = compile_rule(
            &rule(
                RuleMatch { protocol: Some("arp".into()), src_ip: Some("10.0.0.1".into()), ..Default::default() },
                "allow",
            ),
            &test_config(),
        )
        .unwrap();
        assert_eq!(compiled.match_fields["eth_type"], ETH_TYPE_ARP);
        assert!(compiled.match_fields.get("ip_proto").is_none());
    }

    #[test]
    fn ports_apply_only_to_tcp_and_udp() {
        let compiled = compile_rule(
            &rule(
                RuleMatch {
                    protocol: Some("icmp".into()),
                    dst_port: Some(80),
                    src_ip: Some("10.0.0.1".into()),
                    ..Default::default()
                },
                "allow",
            ),
            &test_config(),
        )
        .unwrap();
        assert!(compiled.match_fields.get("icmp_dst").is_none());
        assert!(compiled.match_fields.get("tcp_dst").is_none());
        // src 10 + proto 10, no port contribution
        assert_eq!(compiled.priority, 120);
    }

    #[test]
    fn fully_specified_rule_priority() {
        let compiled = compile_rule(
            &rule(
                RuleMatch {
                    src_ip: Some("10.0.0.1".into()),
                    dst_ip: Some("10.0.0.2".into()),
                    protocol: Some("udp".into()),
                    src_port: Some(5000),
                    dst_port: Some(6000),
                    ..Default::default()
                },
                "alert",
            ),
            &test_config(),
        )
        .unwrap();
        assert_eq!(compiled.priority, 140);
        assert_eq!(compiled.match_fields["udp_src"], 5000);
        assert_eq!(compiled.match_fields["udp_dst"], 6000);
        assert_eq!(compiled.actions, vec![json!({"type": "OUTPUT", "port": "CONTROLLER"})]);
    }

    #[test]
    fn action_mapping_matches_contract() {
        assert_eq!(actions_for("allow"), normal_output_actions());
        assert_eq!(actions_for("permit"), normal_output_actions());
        assert!(actions_for("deny").is_empty());
        assert_eq!(actions_for("alert")[0]["port"], "CONTROLLER");
        assert_eq!(actions_for("rate_limit"), normal_output_actions());
        assert_eq!(actions_for("mystery"), normal_output_actions());
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut r = rule(RuleMatch::default(), "allow");
        r.enabled = false;
        assert_eq!(compile_rule(&r, &test_config()), Err(CompileSkip::Disabled));
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let r = rule(
            RuleMatch {
                src_ip: Some("10.0.0.1".into()),
                protocol: Some("tcp".into()),
                dst_port: Some(443),
                ..Default::default()
            },
            "deny",
        );
        let config = test_config();
        assert_eq!(compile_rule(&r, &config), compile_rule(&r, &config));
    }
}
