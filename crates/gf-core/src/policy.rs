use ipnet::IpNet;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid policy JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("empty rule target")]
    EmptyTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

/// One typed rule target. Classification at parse time is IP first, then
/// CIDR, then domain fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Domain(String),
    Ip(IpAddr),
    Cidr(IpNet),
}

impl RuleTarget {
    fn classify(raw: &str) -> Result<Self, ParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParseError::EmptyTarget);
        }
        if let Ok(addr) = trimmed.parse::<IpAddr>() {
            return Ok(Self::Ip(addr));
        }
        if let Ok(net) = trimmed.parse::<IpNet>() {
            return Ok(Self::Cidr(net));
        }
        Ok(Self::Domain(trimmed.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for RuleTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(d) => write!(f, "{}", d),
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::Cidr(net) => write!(f, "{}", net),
        }
    }
}

impl Serialize for RuleTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub action: Action,
    pub target: RuleTarget,
}

impl Serialize for Rule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Rule", 2)?;
        state.serialize_field("action", &self.action)?;
        state.serialize_field("target", &self.target)?;
        state.end()
    }
}

/// Derived status mode reported by the policy plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    DenyAll,
    AllowAll,
    Enforcing,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DenyAll => "deny_all",
            Self::AllowAll => "allow_all",
            Self::Enforcing => "enforcing",
        }
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// An egress policy: a default action plus an ordered rule list.
///
/// Serializes back to the external document shape
/// `{"defaultAction": ..., "egress": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Policy {
    #[serde(rename = "defaultAction")]
    pub default_action: Action,
    #[serde(rename = "egress")]
    pub rules: Vec<Rule>,
}

// Raw document shape accepted on the wire; normalization happens in parse().
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PolicyDoc {
    #[serde(rename = "defaultAction")]
    default_action: Option<String>,
    egress: Vec<RuleDoc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuleDoc {
    action: Option<String>,
    target: Option<String>,
}

impl Policy {
    pub fn deny_all() -> Self {
        Self {
            default_action: Action::Deny,
            rules: Vec::new(),
        }
    }

    /// Parse the external JSON document. An empty body, `null`, or `{}` is
    /// equivalent to deny-all.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Self::deny_all());
        }

        let doc: PolicyDoc = serde_json::from_str(trimmed)?;

        let default_action = match doc.default_action {
            Some(raw) => parse_action(&raw)?,
            None => Action::Deny,
        };

        let mut rules = Vec::with_capacity(doc.egress.len());
        for rule in doc.egress {
            let action = match rule.action {
                Some(raw) => parse_action(&raw)?,
                // A rule that names no action denies its target.
                None => Action::Deny,
            };
            let target = RuleTarget::classify(rule.target.as_deref().unwrap_or(""))?;
            rules.push(Rule { action, target });
        }

        Ok(Self {
            default_action,
            rules,
        })
    }

    /// Evaluate a DNS name against the domain rules, first match wins.
    /// Case and a trailing dot are insignificant.
    pub fn evaluate(&self, name: &str) -> Action {
        let name = name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase();

        for rule in &self.rules {
            if let RuleTarget::Domain(pattern) = &rule.target {
                if domain_matches(pattern, &name) {
                    return rule.action;
                }
            }
        }

        self.default_action
    }

    /// Bucket every IP and CIDR rule by family and action, policy order
    /// preserved. Plain addresses become host-length prefixes.
    pub fn static_ip_sets(&self) -> StaticIpSets {
        let mut sets = StaticIpSets::default();

        for rule in &self.rules {
            let net = match &rule.target {
                RuleTarget::Ip(addr) => IpNet::from(*addr),
                RuleTarget::Cidr(net) => *net,
                RuleTarget::Domain(_) => continue,
            };

            let bucket = match (rule.action, &net) {
                (Action::Allow, IpNet::V4(_)) => &mut sets.allow_v4,
                (Action::Allow, IpNet::V6(_)) => &mut sets.allow_v6,
                (Action::Deny, IpNet::V4(_)) => &mut sets.deny_v4,
                (Action::Deny, IpNet::V6(_)) => &mut sets.deny_v6,
            };
            bucket.push(net);
        }

        sets
    }

    /// Return a copy with ALLOW rules for the given addresses appended.
    /// Used at bootstrap to let the nameserver seed list through the filter.
    pub fn with_extra_allow_ips(&self, ips: &[IpAddr]) -> Self {
        let mut policy = self.clone();
        policy.rules.extend(ips.iter().map(|ip| Rule {
            action: Action::Allow,
            target: RuleTarget::Ip(*ip),
        }));
        policy
    }

    pub fn mode(&self) -> Mode {
        match (self.default_action, self.rules.is_empty()) {
            (Action::Deny, true) => Mode::DenyAll,
            (Action::Allow, true) => Mode::AllowAll,
            _ => Mode::Enforcing,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct StaticIpSets {
    pub allow_v4: Vec<IpNet>,
    pub allow_v6: Vec<IpNet>,
    pub deny_v4: Vec<IpNet>,
    pub deny_v6: Vec<IpNet>,
}

fn parse_action(raw: &str) -> Result<Action, ParseError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "allow" => Ok(Action::Allow),
        "deny" => Ok(Action::Deny),
        other => Err(ParseError::UnknownAction(other.to_string())),
    }
}

/// Exact match, or `*.STEM` matching any strict subdomain of STEM.
/// The wildcard never matches the stem itself.
fn domain_matches(pattern: &str, name: &str) -> bool {
    if let Some(stem) = pattern.strip_prefix("*.") {
        return match name.strip_suffix(stem) {
            Some(head) => head.ends_with('.'),
            None => false,
        };
    }
    pattern == name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(json: &str) -> Policy {
        Policy::parse(json).expect("valid policy")
    }

    #[test]
    fn empty_inputs_are_deny_all() {
        for raw in ["", "   ", "null", "{}"] {
            let p = policy(raw);
            assert_eq!(p, Policy::deny_all(), "input {:?}", raw);
            assert_eq!(p.mode(), Mode::DenyAll);
        }
    }

    #[test]
    fn missing_default_action_is_deny() {
        let p = policy(r#"{"egress":[{"action":"allow","target":"a.example"}]}"#);
        assert_eq!(p.default_action, Action::Deny);
    }

    #[test]
    fn actions_and_domains_are_normalized() {
        let p = policy(
            r#"{"defaultAction":"ALLOW","egress":[{"action":"Deny","target":"  API.Example.COM "}]}"#,
        );
        assert_eq!(p.default_action, Action::Allow);
        assert_eq!(
            p.rules[0].target,
            RuleTarget::Domain("api.example.com".into())
        );
        assert_eq!(p.rules[0].action, Action::Deny);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = Policy::parse(r#"{"egress":[{"action":"block","target":"x.test"}]}"#);
        assert!(matches!(err, Err(ParseError::UnknownAction(a)) if a == "block"));
    }

    #[test]
    fn empty_target_is_rejected() {
        for raw in [
            r#"{"egress":[{"action":"allow","target":"  "}]}"#,
            r#"{"egress":[{"action":"allow"}]}"#,
        ] {
            assert!(matches!(Policy::parse(raw), Err(ParseError::EmptyTarget)));
        }
    }

    #[test]
    fn rule_without_action_denies() {
        let p = policy(r#"{"defaultAction":"allow","egress":[{"target":"bad.test"}]}"#);
        assert_eq!(p.evaluate("bad.test"), Action::Deny);
        assert_eq!(p.evaluate("good.test"), Action::Allow);
    }

    #[test]
    fn targets_classify_ip_then_cidr_then_domain() {
        let p = policy(
            r#"{"egress":[
                {"action":"allow","target":"10.1.2.3"},
                {"action":"allow","target":"10.0.0.0/8"},
                {"action":"allow","target":"fd00::1"},
                {"action":"allow","target":"example.com"}
            ]}"#,
        );
        assert!(matches!(p.rules[0].target, RuleTarget::Ip(IpAddr::V4(_))));
        assert!(matches!(p.rules[1].target, RuleTarget::Cidr(IpNet::V4(_))));
        assert!(matches!(p.rules[2].target, RuleTarget::Ip(IpAddr::V6(_))));
        assert!(matches!(p.rules[3].target, RuleTarget::Domain(_)));
    }

    #[test]
    fn evaluate_ignores_case_and_trailing_dot() {
        let p = policy(r#"{"defaultAction":"deny","egress":[{"action":"allow","target":"api.example.com"}]}"#);
        assert_eq!(p.evaluate("api.example.com"), Action::Allow);
        assert_eq!(p.evaluate("api.example.com."), Action::Allow);
        assert_eq!(p.evaluate("API.EXAMPLE.COM"), Action::Allow);
        assert_eq!(p.evaluate("other.example.com."), Action::Deny);
    }

    #[test]
    fn wildcard_matches_strict_subdomains_only() {
        let p = policy(r#"{"defaultAction":"deny","egress":[{"action":"allow","target":"*.pypi.org"}]}"#);
        assert_eq!(p.evaluate("files.pypi.org."), Action::Allow);
        assert_eq!(p.evaluate("a.b.pypi.org"), Action::Allow);
        assert_eq!(p.evaluate("pypi.org."), Action::Deny);
        assert_eq!(p.evaluate("evil.pypi.org.attacker.com."), Action::Deny);
        assert_eq!(p.evaluate("notpypi.org"), Action::Deny);
    }

    #[test]
    fn first_matching_rule_wins() {
        let p = policy(
            r#"{"defaultAction":"deny","egress":[
                {"action":"deny","target":"blocked.example.com"},
                {"action":"allow","target":"*.example.com"}
            ]}"#,
        );
        assert_eq!(p.evaluate("blocked.example.com"), Action::Deny);
        assert_eq!(p.evaluate("ok.example.com"), Action::Allow);
    }

    #[test]
    fn static_sets_partition_by_family_and_action() {
        let p = policy(
            r#"{"egress":[
                {"action":"allow","target":"1.2.3.4"},
                {"action":"deny","target":"10.0.0.0/8"},
                {"action":"allow","target":"2001:db8::/32"},
                {"action":"deny","target":"fd00::1"},
                {"action":"allow","target":"skip.example.com"}
            ]}"#,
        );
        let sets = p.static_ip_sets();
        assert_eq!(sets.allow_v4, vec!["1.2.3.4/32".parse::<IpNet>().unwrap()]);
        assert_eq!(sets.deny_v4, vec!["10.0.0.0/8".parse::<IpNet>().unwrap()]);
        assert_eq!(
            sets.allow_v6,
            vec!["2001:db8::/32".parse::<IpNet>().unwrap()]
        );
        assert_eq!(sets.deny_v6, vec!["fd00::1/128".parse::<IpNet>().unwrap()]);

        let total = sets.allow_v4.len() + sets.allow_v6.len() + sets.deny_v4.len() + sets.deny_v6.len();
        let ip_rules = p
            .rules
            .iter()
            .filter(|r| !matches!(r.target, RuleTarget::Domain(_)))
            .count();
        assert_eq!(total, ip_rules);
    }

    #[test]
    fn extra_allow_ips_appends_and_empty_is_identity() {
        let p = policy(r#"{"defaultAction":"deny","egress":[{"action":"allow","target":"a.test"}]}"#);
        assert_eq!(p.with_extra_allow_ips(&[]), p);

        let merged = p.with_extra_allow_ips(&["127.0.0.1".parse().unwrap(), "9.9.9.9".parse().unwrap()]);
        assert_eq!(merged.rules.len(), 3);
        assert_eq!(
            merged.rules[2].target,
            RuleTarget::Ip("9.9.9.9".parse().unwrap())
        );
        assert_eq!(merged.rules[2].action, Action::Allow);
    }

    #[test]
    fn mode_derivation() {
        assert_eq!(policy("{}").mode(), Mode::DenyAll);
        assert_eq!(policy(r#"{"defaultAction":"allow"}"#).mode(), Mode::AllowAll);
        assert_eq!(
            policy(r#"{"defaultAction":"allow","egress":[{"action":"deny","target":"x.test"}]}"#).mode(),
            Mode::Enforcing
        );
    }

    #[test]
    fn round_trips_through_serialization() {
        let p = policy(
            r#"{"defaultAction":"Allow","egress":[
                {"action":"deny","target":"Tracker.Example"},
                {"action":"allow","target":"192.0.2.7"},
                {"action":"allow","target":"10.0.0.0/8"}
            ]}"#,
        );
        let text = serde_json::to_string(&p).unwrap();
        assert_eq!(Policy::parse(&text).unwrap(), p);
    }
}
