use gf_core::blocklist::Blocklist;
use gf_core::{BYPASS_MARK, Policy, ResolvedIp};
use ipnet::IpNet;
use serde_json::{Value, json};

/// The one table this sidecar owns inside its network namespace.
pub const TABLE_NAME: &str = "ghostfence";
/// OUTPUT-hook chain carrying the egress rules.
pub const CHAIN_NAME: &str = "egress";
/// Default element timeout for the dynamic allow sets, seconds.
pub const DYN_SET_TIMEOUT: u32 = 300;

/// Knobs that shape the ruleset beyond the policy itself. Fixed at
/// construction; a policy change re-renders with the same options.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub block_dot: bool,
    pub block_doh: bool,
    pub doh_blocklist: Blocklist,
}

/// Render the full egress ruleset for `nft -j -f -`. With `include_delete`
/// the payload first deletes the table so the apply starts from a clean
/// slate; the retry path omits the delete when the table does not exist yet.
pub fn render_ruleset(
    policy: &Policy,
    options: &FilterOptions,
    include_delete: bool,
) -> serde_json::Result<String> {
    let mut nftables = Vec::new();

    if include_delete {
        nftables.push(json!({"delete": {"table": {"family": "inet", "name": TABLE_NAME}}}));
    }
    nftables.push(json!({"table": {"family": "inet", "name": TABLE_NAME}}));

    let sets = policy.static_ip_sets();
    nftables.push(static_set("allow_v4", "ipv4_addr", &sets.allow_v4));
    nftables.push(static_set("allow_v6", "ipv6_addr", &sets.allow_v6));
    nftables.push(static_set("deny_v4", "ipv4_addr", &sets.deny_v4));
    nftables.push(static_set("deny_v6", "ipv6_addr", &sets.deny_v6));

    nftables.push(dynamic_set("dyn_allow_v4", "ipv4_addr"));
    nftables.push(dynamic_set("dyn_allow_v6", "ipv6_addr"));

    let doh_list = (options.block_doh && !options.doh_blocklist.is_empty())
        .then_some(&options.doh_blocklist);
    if let Some(list) = doh_list {
        nftables.push(static_set("doh_block_v4", "ipv4_addr", &list.v4));
        nftables.push(static_set("doh_block_v6", "ipv6_addr", &list.v6));
    }

    let default_policy = match policy.default_action {
        gf_core::Action::Allow => "accept",
        gf_core::Action::Deny => "drop",
    };
    nftables.push(json!({
        "chain": {
            "family": "inet",
            "table": TABLE_NAME,
            "name": CHAIN_NAME,
            "type": "filter",
            "hook": "output",
            "prio": 0,
            "policy": default_policy,
        }
    }));

    // Rule order is the enforcement contract: first match wins.
    nftables.push(ct_state_accept_rule());
    nftables.push(rule(vec![match_mark(BYPASS_MARK), accept_expr()]));
    nftables.push(rule(vec![match_iface("oifname", "lo"), accept_expr()]));

    if options.block_dot {
        for proto in ["tcp", "udp"] {
            nftables.push(rule(vec![
                match_l4proto(proto),
                match_port(proto, "dport", 853),
                drop_expr(),
            ]));
        }
    }

    if options.block_doh {
        match doh_list {
            Some(_) => {
                nftables.push(rule(vec![
                    match_l4proto("tcp"),
                    match_port("tcp", "dport", 443),
                    match_daddr_set("ip", "doh_block_v4"),
                    drop_expr(),
                ]));
                nftables.push(rule(vec![
                    match_l4proto("tcp"),
                    match_port("tcp", "dport", 443),
                    match_daddr_set("ip6", "doh_block_v6"),
                    drop_expr(),
                ]));
            }
            // No blocklist: all HTTPS is assumed DoH-capable.
            None => nftables.push(rule(vec![
                match_l4proto("tcp"),
                match_port("tcp", "dport", 443),
                drop_expr(),
            ])),
        }
    }

    nftables.push(rule(vec![match_daddr_set("ip", "deny_v4"), drop_expr()]));
    nftables.push(rule(vec![match_daddr_set("ip6", "deny_v6"), drop_expr()]));

    nftables.push(rule(vec![match_daddr_set("ip", "dyn_allow_v4"), accept_expr()]));
    nftables.push(rule(vec![match_daddr_set("ip6", "dyn_allow_v6"), accept_expr()]));

    nftables.push(rule(vec![match_daddr_set("ip", "allow_v4"), accept_expr()]));
    nftables.push(rule(vec![match_daddr_set("ip6", "allow_v6"), accept_expr()]));

    if policy.default_action == gf_core::Action::Deny {
        nftables.push(rule(vec![json!({"counter": null}), drop_expr()]));
    }

    serde_json::to_string_pretty(&json!({"nftables": nftables}))
}

/// Dynamic set an address belongs to, by family.
pub fn dynamic_set_for(addr: &std::net::IpAddr) -> &'static str {
    match addr {
        std::net::IpAddr::V4(_) => "dyn_allow_v4",
        std::net::IpAddr::V6(_) => "dyn_allow_v6",
    }
}

/// Render an `add element` payload installing one resolved address with its
/// clamped TTL.
pub fn render_element_add(entry: &ResolvedIp) -> serde_json::Result<String> {
    let payload = json!({
        "nftables": [{
            "add": {
                "element": {
                    "family": "inet",
                    "table": TABLE_NAME,
                    "name": dynamic_set_for(&entry.addr),
                    "elem": [{
                        "elem": {
                            "val": entry.addr.to_string(),
                            "timeout": entry.clamped_ttl(),
                        }
                    }],
                }
            }
        }]
    });
    serde_json::to_string_pretty(&payload)
}

/// Render a `delete element` payload for one address. Issued best-effort
/// before the add so a re-resolved address gets a fresh timeout instead of
/// an EEXIST rejection.
pub fn render_element_delete(entry: &ResolvedIp) -> serde_json::Result<String> {
    let payload = json!({
        "nftables": [{
            "delete": {
                "element": {
                    "family": "inet",
                    "table": TABLE_NAME,
                    "name": dynamic_set_for(&entry.addr),
                    "elem": [entry.addr.to_string()],
                }
            }
        }]
    });
    serde_json::to_string_pretty(&payload)
}

fn static_set(name: &str, addr_type: &str, elements: &[IpNet]) -> Value {
    let mut set = json!({
        "family": "inet",
        "table": TABLE_NAME,
        "name": name,
        "type": addr_type,
        "flags": ["interval"],
    });
    if !elements.is_empty() {
        set["elem"] = Value::Array(elements.iter().map(prefix_elem).collect());
    }
    json!({"set": set})
}

fn dynamic_set(name: &str, addr_type: &str) -> Value {
    json!({
        "set": {
            "family": "inet",
            "table": TABLE_NAME,
            "name": name,
            "type": addr_type,
            "flags": ["timeout"],
            "timeout": DYN_SET_TIMEOUT,
        }
    })
}

fn prefix_elem(net: &IpNet) -> Value {
    json!({"prefix": {"addr": net.addr().to_string(), "len": net.prefix_len()}})
}

fn rule(expr: Vec<Value>) -> Value {
    json!({
        "rule": {
            "family": "inet",
            "table": TABLE_NAME,
            "chain": CHAIN_NAME,
            "expr": expr,
        }
    })
}

fn ct_state_accept_rule() -> Value {
    rule(vec![
        json!({
            "match": {
                "left": {"ct": {"key": "state"}},
                "op": "in",
                "right": ["established", "related"],
            }
        }),
        accept_expr(),
    ])
}

fn match_iface(key: &str, iface: &str) -> Value {
    json!({
        "match": {
            "left": {"meta": {"key": key}},
            "op": "==",
            "right": iface,
        }
    })
}

fn match_mark(mark: u32) -> Value {
    json!({
        "match": {
            "left": {"meta": {"key": "mark"}},
            "op": "==",
            "right": mark,
        }
    })
}

fn match_l4proto(proto: &str) -> Value {
    json!({
        "match": {
            "left": {"meta": {"key": "l4proto"}},
            "op": "==",
            "right": proto,
        }
    })
}

fn match_port(proto: &str, field: &str, port: u16) -> Value {
    json!({
        "match": {
            "left": {"payload": {"protocol": proto, "field": field}},
            "op": "==",
            "right": port,
        }
    })
}

fn match_daddr_set(protocol: &str, set: &str) -> Value {
    json!({
        "match": {
            "left": {"payload": {"protocol": protocol, "field": "daddr"}},
            "op": "==",
            "right": format!("@{}", set),
        }
    })
}

fn accept_expr() -> Value {
    json!({"accept": null})
}

fn drop_expr() -> Value {
    json!({"drop": null})
}

#[cfg(test)]
mod tests {
    use super::*;
    use gf_core::blocklist::Blocklist;

    fn load_ruleset(value: &str) -> Vec<Value> {
        let doc: Value = serde_json::from_str(value).expect("valid JSON");
        doc.get("nftables")
            .and_then(|v| v.as_array())
            .cloned()
            .expect("nftables array")
    }

    fn chain_exprs(entries: &[Value]) -> Vec<Value> {
        entries
            .iter()
            .filter_map(|entry| {
                entry
                    .get("rule")
                    .and_then(|rule| rule.get("expr"))
                    .and_then(|expr| expr.as_array())
                    .map(|expr| Value::Array(expr.clone()))
            })
            .collect()
    }

    fn expr_has_key(exprs: &Value, key: &str) -> bool {
        exprs
            .as_array()
            .unwrap()
            .iter()
            .any(|expr| expr.get(key).is_some())
    }

    fn expr_matches_right(exprs: &Value, right: &Value) -> bool {
        exprs.as_array().unwrap().iter().any(|expr| {
            expr.get("match")
                .and_then(|m| m.get("right"))
                .map(|r| r == right)
                .unwrap_or(false)
        })
    }

    fn set_names(entries: &[Value]) -> Vec<String> {
        entries
            .iter()
            .filter_map(|entry| entry.get("set"))
            .filter_map(|set| set.get("name").and_then(|n| n.as_str()))
            .map(String::from)
            .collect()
    }

    fn deny_policy() -> Policy {
        Policy::parse(
            r#"{"defaultAction":"deny","egress":[
                {"action":"allow","target":"1.2.3.4"},
                {"action":"deny","target":"10.0.0.0/8"},
                {"action":"allow","target":"good.test"}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn renders_delete_step_only_when_asked() {
        let opts = FilterOptions::default();
        let with = load_ruleset(&render_ruleset(&deny_policy(), &opts, true).unwrap());
        let without = load_ruleset(&render_ruleset(&deny_policy(), &opts, false).unwrap());

        assert!(with[0].get("delete").is_some());
        assert!(without.iter().all(|e| e.get("delete").is_none()));
        assert_eq!(with.len(), without.len() + 1);
    }

    #[test]
    fn declares_static_and_dynamic_sets() {
        let payload = render_ruleset(&deny_policy(), &FilterOptions::default(), true).unwrap();
        let names = set_names(&load_ruleset(&payload));
        assert_eq!(
            names,
            vec![
                "allow_v4",
                "allow_v6",
                "deny_v4",
                "deny_v6",
                "dyn_allow_v4",
                "dyn_allow_v6"
            ]
        );

        let entries = load_ruleset(&payload);
        let dyn_v4 = entries
            .iter()
            .filter_map(|e| e.get("set"))
            .find(|s| s["name"] == "dyn_allow_v4")
            .unwrap();
        assert_eq!(dyn_v4["flags"], json!(["timeout"]));
        assert_eq!(dyn_v4["timeout"], json!(DYN_SET_TIMEOUT));
    }

    #[test]
    fn static_set_elements_are_prefixes() {
        let payload = render_ruleset(&deny_policy(), &FilterOptions::default(), true).unwrap();
        let entries = load_ruleset(&payload);
        let allow_v4 = entries
            .iter()
            .filter_map(|e| e.get("set"))
            .find(|s| s["name"] == "allow_v4")
            .unwrap();
        assert_eq!(
            allow_v4["elem"],
            json!([{"prefix": {"addr": "1.2.3.4", "len": 32}}])
        );
    }

    #[test]
    fn default_deny_gets_drop_policy_and_counter() {
        let payload = render_ruleset(&deny_policy(), &FilterOptions::default(), true).unwrap();
        let entries = load_ruleset(&payload);

        let chain = entries
            .iter()
            .filter_map(|e| e.get("chain"))
            .next()
            .unwrap();
        assert_eq!(chain["policy"], "drop");
        assert_eq!(chain["hook"], "output");

        let rules = chain_exprs(&entries);
        let last = rules.last().unwrap();
        assert!(expr_has_key(last, "counter"));
        assert!(expr_has_key(last, "drop"));
    }

    #[test]
    fn default_allow_has_no_terminal_drop() {
        let p = Policy::parse(r#"{"defaultAction":"allow"}"#).unwrap();
        let entries = load_ruleset(&render_ruleset(&p, &FilterOptions::default(), true).unwrap());

        let chain = entries
            .iter()
            .filter_map(|e| e.get("chain"))
            .next()
            .unwrap();
        assert_eq!(chain["policy"], "accept");

        let rules = chain_exprs(&entries);
        assert!(rules.iter().all(|r| !expr_has_key(r, "counter")));
    }

    #[test]
    fn rule_order_matches_enforcement_contract() {
        let opts = FilterOptions {
            block_dot: true,
            block_doh: true,
            doh_blocklist: Blocklist::default(),
        };
        let entries = load_ruleset(&render_ruleset(&deny_policy(), &opts, true).unwrap());
        let rules = chain_exprs(&entries);

        let position = |right: &Value| {
            rules
                .iter()
                .position(|r| expr_matches_right(r, right))
                .unwrap()
        };

        let ct = rules
            .iter()
            .position(|r| {
                r.as_array()
                    .unwrap()
                    .iter()
                    .any(|e| e.get("match").and_then(|m| m.get("left")).and_then(|l| l.get("ct")).is_some())
            })
            .unwrap();
        let mark = position(&json!(BYPASS_MARK));
        let loopback = position(&json!("lo"));
        let dot = position(&json!(853));
        let doh = position(&json!(443));
        let deny = position(&json!("@deny_v4"));
        let dyn_allow = position(&json!("@dyn_allow_v4"));
        let allow = position(&json!("@allow_v4"));

        assert!(ct < mark && mark < loopback && loopback < dot);
        assert!(dot < doh && doh < deny && deny < dyn_allow && dyn_allow < allow);
        assert!(allow < rules.len() - 1, "terminal counting drop comes last");
    }

    #[test]
    fn doh_blocklist_scopes_the_443_drop() {
        let scoped = FilterOptions {
            block_dot: false,
            block_doh: true,
            doh_blocklist: Blocklist::parse("1.1.1.1,2606:4700::/32"),
        };
        let entries = load_ruleset(&render_ruleset(&deny_policy(), &scoped, true).unwrap());
        let names = set_names(&entries);
        assert!(names.contains(&"doh_block_v4".to_string()));
        assert!(names.contains(&"doh_block_v6".to_string()));

        let rules = chain_exprs(&entries);
        assert!(rules.iter().any(|r| expr_matches_right(r, &json!("@doh_block_v4"))));
        // Scoped blocking must not drop all of 443.
        assert!(!rules.iter().any(|r| {
            expr_matches_right(r, &json!(443)) && !expr_matches_right(r, &json!("@doh_block_v4")) && !expr_matches_right(r, &json!("@doh_block_v6"))
        }));
    }

    #[test]
    fn doh_without_blocklist_drops_all_443() {
        let opts = FilterOptions {
            block_dot: false,
            block_doh: true,
            doh_blocklist: Blocklist::default(),
        };
        let entries = load_ruleset(&render_ruleset(&deny_policy(), &opts, true).unwrap());
        assert!(!set_names(&entries).contains(&"doh_block_v4".to_string()));

        let rules = chain_exprs(&entries);
        let blanket = rules
            .iter()
            .find(|r| expr_matches_right(r, &json!(443)))
            .unwrap();
        assert!(expr_has_key(blanket, "drop"));
    }

    #[test]
    fn disabled_protocol_blocks_render_nothing() {
        let entries = load_ruleset(
            &render_ruleset(&deny_policy(), &FilterOptions::default(), true).unwrap(),
        );
        let rules = chain_exprs(&entries);
        assert!(!rules.iter().any(|r| expr_matches_right(r, &json!(853))));
        assert!(!rules.iter().any(|r| expr_matches_right(r, &json!(443))));
    }

    #[test]
    fn element_add_clamps_timeouts_and_picks_family_set() {
        let v4 = load_ruleset(
            &render_element_add(&ResolvedIp::new("1.2.3.4".parse().unwrap(), 30)).unwrap(),
        );
        let elem = &v4[0]["add"]["element"];
        assert_eq!(elem["name"], "dyn_allow_v4");
        assert_eq!(elem["elem"][0]["elem"]["val"], "1.2.3.4");
        assert_eq!(elem["elem"][0]["elem"]["timeout"], json!(gf_core::MIN_TTL));

        let v6 = load_ruleset(
            &render_element_add(&ResolvedIp::new("2001:db8::1".parse().unwrap(), 86400)).unwrap(),
        );
        let elem = &v6[0]["add"]["element"];
        assert_eq!(elem["name"], "dyn_allow_v6");
        assert_eq!(elem["elem"][0]["elem"]["timeout"], json!(gf_core::MAX_TTL));
    }

    #[test]
    fn element_delete_names_the_bare_address() {
        let parsed = load_ruleset(
            &render_element_delete(&ResolvedIp::new("1.2.3.4".parse().unwrap(), 30)).unwrap(),
        );
        let elem = &parsed[0]["delete"]["element"];
        assert_eq!(elem["name"], "dyn_allow_v4");
        assert_eq!(elem["elem"], json!(["1.2.3.4"]));
    }
}
