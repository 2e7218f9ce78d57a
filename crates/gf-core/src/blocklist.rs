use ipnet::IpNet;
use std::net::IpAddr;
use tracing::warn;

/// Per-family DoH blocklist split out of a comma-separated IP/CIDR string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Blocklist {
    pub v4: Vec<IpNet>,
    pub v6: Vec<IpNet>,
}

impl Blocklist {
    /// Parse a comma-separated list of IPs and CIDRs. Invalid entries are
    /// logged and skipped rather than failing startup.
    pub fn parse(raw: &str) -> Self {
        let mut list = Self::default();

        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let net = if let Ok(addr) = entry.parse::<IpAddr>() {
                IpNet::from(addr)
            } else if let Ok(net) = entry.parse::<IpNet>() {
                net
            } else {
                warn!("skipping invalid DoH blocklist entry '{}'", entry);
                continue;
            };

            match net {
                IpNet::V4(_) => list.v4.push(net),
                IpNet::V6(_) => list.v6.push(net),
            }
        }

        list
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}
