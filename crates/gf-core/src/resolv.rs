use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use tracing::warn;

/// Upstream used when the resolver file yields nothing usable.
pub const FALLBACK_UPSTREAM: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

/// Nameserver cap applied when `EGRESS_MAX_NS` is unset.
pub const DEFAULT_MAX_NS: usize = 3;
/// Hard ceiling on the nameserver cap.
pub const MAX_NS_CEILING: usize = 10;

/// Nameservers discovered from a resolv.conf-style file, read once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    pub nameservers: Vec<IpAddr>,
}

impl ResolvConf {
    /// Read and parse the resolver file. An unreadable file is treated as
    /// empty so the proxy can still start on the fallback upstream.
    pub fn read(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                warn!("failed to read resolver file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut nameservers = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut fields = line.split_whitespace();
            if fields.next() != Some("nameserver") {
                continue;
            }
            match fields.next().map(str::parse::<IpAddr>) {
                Some(Ok(addr)) => nameservers.push(addr),
                Some(Err(_)) | None => warn!("skipping malformed nameserver line: {}", line),
            }
        }

        Self { nameservers }
    }

    /// Select the upstream resolver: first non-loopback entry, else first
    /// loopback entry, else the public fallback.
    pub fn upstream(&self) -> SocketAddr {
        let addr = self
            .nameservers
            .iter()
            .find(|ip| !ip.is_loopback())
            .or_else(|| self.nameservers.first())
            .copied()
            .unwrap_or(FALLBACK_UPSTREAM);
        SocketAddr::new(addr, 53)
    }

    /// Build the bootstrap allow-IP seed: loopback (so redirected proxy
    /// traffic passes the filter) plus validated nameservers. `max_ns` of 0
    /// means uncapped; the cap only counts validated nameservers.
    pub fn seed_allow_ips(&self, max_ns: usize) -> Vec<IpAddr> {
        let mut seed: Vec<IpAddr> = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];

        let mut kept = 0usize;
        for ip in &self.nameservers {
            if ip.is_unspecified() || ip.is_loopback() {
                continue;
            }
            if seed.contains(ip) {
                continue;
            }
            if max_ns != 0 && kept >= max_ns {
                break;
            }
            seed.push(*ip);
            kept += 1;
        }

        seed
    }
}
