use anyhow::{Context, Result};
use clap::Parser;
use gf_core::blocklist::Blocklist;
use gf_core::resolv::{DEFAULT_MAX_NS, MAX_NS_CEILING};
use gf_nft::FilterOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
    Dns,
    DnsNft,
}

impl EnforcementMode {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dns" => Ok(Self::Dns),
            "dns+nft" => Ok(Self::DnsNft),
            other => Err(format!("unknown enforcement mode '{}'", other)),
        }
    }
}

fn parse_truthy(raw: &str) -> Result<bool, String> {
    Ok(matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

#[derive(Parser, Debug)]
#[command(name = "gfence")]
#[command(version, about = "FQDN egress enforcement sidecar", long_about = None)]
pub struct Config {
    /// Enforcement mode: "dns" (proxy only) or "dns+nft" (proxy + packet filter)
    #[arg(long, env = "EGRESS_MODE", default_value = "dns", value_parser = EnforcementMode::parse)]
    pub mode: EnforcementMode,

    /// Seed policy JSON; empty means deny-all
    #[arg(long, env = "EGRESS_RULES")]
    pub rules: Option<String>,

    /// Policy API listen address; a bare ":port" binds all interfaces
    #[arg(long, env = "EGRESS_HTTP_ADDR", default_value = ":18080")]
    pub http_addr: String,

    /// Shared secret required on policy API requests; unset leaves the API open
    #[arg(long, env = "EGRESS_TOKEN")]
    pub token: Option<String>,

    /// Header carrying the shared secret
    #[arg(long, env = "EGRESS_TOKEN_HEADER")]
    pub token_header: Option<String>,

    /// Drop workload HTTPS traffic assumed to be DNS-over-HTTPS
    #[arg(
        long,
        env = "EGRESS_BLOCK_DOH_443",
        default_value = "false",
        value_parser = parse_truthy,
        action = clap::ArgAction::Set
    )]
    pub block_doh: bool,

    /// Drop workload DNS-over-TLS traffic on port 853
    #[arg(
        long,
        env = "EGRESS_BLOCK_DOT_853",
        default_value = "true",
        value_parser = parse_truthy,
        action = clap::ArgAction::Set
    )]
    pub block_dot: bool,

    /// Comma-separated IPs/CIDRs limiting the DoH drop to known resolvers
    #[arg(long, env = "EGRESS_DOH_BLOCKLIST")]
    pub doh_blocklist: Option<String>,

    /// Nameservers admitted into the allow-IP seed; 0 means uncapped
    #[arg(long, env = "EGRESS_MAX_NS", default_value_t = DEFAULT_MAX_NS)]
    pub max_ns: usize,

    /// Log verbosity (tracing env-filter syntax)
    #[arg(long, env = "EGRESS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Resolver file consulted once at startup
    #[arg(long, env = "EGRESS_RESOLV_CONF", default_value = "/etc/resolv.conf")]
    pub resolv_conf: PathBuf,
}

impl Config {
    /// Nameserver cap with the ceiling applied.
    pub fn max_ns_capped(&self) -> usize {
        if self.max_ns > MAX_NS_CEILING {
            warn!(
                "EGRESS_MAX_NS={} exceeds ceiling, using {}",
                self.max_ns, MAX_NS_CEILING
            );
            return MAX_NS_CEILING;
        }
        self.max_ns
    }

    pub fn http_listen_addr(&self) -> Result<SocketAddr> {
        parse_listen_addr(&self.http_addr)
    }

    pub fn filter_options(&self) -> FilterOptions {
        FilterOptions {
            block_dot: self.block_dot,
            block_doh: self.block_doh,
            doh_blocklist: self
                .doh_blocklist
                .as_deref()
                .map(Blocklist::parse)
                .unwrap_or_default(),
        }
    }
}

/// Accept both full socket addresses and the ":port" shorthand.
pub fn parse_listen_addr(raw: &str) -> Result<SocketAddr> {
    let candidate = if raw.starts_with(':') {
        format!("0.0.0.0{}", raw)
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .with_context(|| format!("invalid listen address '{}'", raw))
}
