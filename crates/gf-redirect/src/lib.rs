use gf_core::BYPASS_MARK;
use thiserror::Error;
use tracing::{info, warn};

/// Chain in the nat table that steers workload DNS into the proxy.
pub const NAT_CHAIN: &str = "GHOSTFENCE_DNS";

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("failed to run iptables: {0}")]
    Io(#[from] std::io::Error),
    #[error("iptables rejected rule: {stderr}")]
    Rejected { stderr: String },
}

impl RedirectError {
    /// True when the failure looks like a missing CAP_NET_ADMIN rather than
    /// a broken rule. The bootstrap degrades instead of dying on these.
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Rejected { stderr }
            if stderr.contains("Permission denied") || stderr.contains("Operation not permitted"))
    }
}

/// One iptables invocation; `tolerated` steps may fail (chain already
/// present, jump not installed yet) so re-running overwrites cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesStep {
    pub args: Vec<String>,
    pub tolerated: bool,
}

impl IptablesStep {
    fn required(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
            tolerated: false,
        }
    }

    fn tolerated(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
            tolerated: true,
        }
    }
}

/// Build the invocation plan that redirects port-53 traffic to the proxy.
/// Packets carrying the bypass mark return untouched so the proxy's own
/// upstream queries can leave the namespace.
pub fn redirect_steps(proxy_port: u16) -> Vec<IptablesStep> {
    let mark = format!("0x{:x}", BYPASS_MARK);
    let port = proxy_port.to_string();

    vec![
        IptablesStep::tolerated(&["-t", "nat", "-N", NAT_CHAIN]),
        IptablesStep::required(&["-t", "nat", "-F", NAT_CHAIN]),
        IptablesStep::tolerated(&["-t", "nat", "-D", "OUTPUT", "-j", NAT_CHAIN]),
        IptablesStep::required(&["-t", "nat", "-A", "OUTPUT", "-j", NAT_CHAIN]),
        IptablesStep::required(&[
            "-t", "nat", "-A", NAT_CHAIN, "-m", "mark", "--mark", &mark, "-j", "RETURN",
        ]),
        IptablesStep::required(&[
            "-t", "nat", "-A", NAT_CHAIN, "-p", "udp", "--dport", "53", "-j", "REDIRECT",
            "--to-ports", &port,
        ]),
        IptablesStep::required(&[
            "-t", "nat", "-A", NAT_CHAIN, "-p", "tcp", "--dport", "53", "-j", "REDIRECT",
            "--to-ports", &port,
        ]),
    ]
}

/// Install the NAT redirect. Failure usually means the process lacks
/// CAP_NET_ADMIN; the caller decides whether that is fatal.
pub async fn setup_redirect(proxy_port: u16) -> Result<(), RedirectError> {
    for step in redirect_steps(proxy_port) {
        let output = tokio::process::Command::new("iptables")
            .args(&step.args)
            .output()
            .await?;

        if !output.status.success() && !step.tolerated {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("iptables {:?} failed: {}", step.args, stderr);
            return Err(RedirectError::Rejected { stderr });
        }
    }

    info!(chain = NAT_CHAIN, port = proxy_port, "installed port-53 NAT redirect");
    Ok(())
}
