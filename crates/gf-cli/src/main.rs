mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, EnforcementMode};
use gf_api::ApiContext;
use gf_core::resolv::ResolvConf;
use gf_core::{PROXY_PORT, Policy};
use gf_dns::DnsProxy;
use gf_nft::FilterController;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Grace period for draining policy API connections on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tokio::runtime::Runtime::new()?.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    // Seed policy; a malformed EGRESS_RULES value must fail the boot.
    let initial_policy = Policy::parse(config.rules.as_deref().unwrap_or(""))
        .context("invalid EGRESS_RULES policy")?;

    let resolv = ResolvConf::read(&config.resolv_conf);
    let upstream = resolv.upstream();
    let seed_ips = resolv.seed_allow_ips(config.max_ns_capped());
    info!(
        upstream = %upstream,
        seeds = seed_ips.len(),
        mode = initial_policy.mode().as_str(),
        "bootstrap configuration loaded"
    );

    let controller = (config.mode == EnforcementMode::DnsNft)
        .then(|| Arc::new(FilterController::new(config.filter_options())));

    // Proxy listeners come up before the redirect points traffic at them.
    let proxy = DnsProxy::new(upstream, initial_policy.clone());
    let proxy_addr = SocketAddr::from(([127, 0, 0, 1], PROXY_PORT));
    let mut proxy_task = tokio::spawn(proxy.clone().run(proxy_addr));

    match gf_redirect::setup_redirect(PROXY_PORT).await {
        Ok(()) => {}
        Err(e) if e.is_permission() => {
            // Without CAP_NET_ADMIN nothing can be enforced, but the sidecar
            // stays up so operators see why.
            warn!("cannot install DNS redirect, enforcement disabled: {}", e);
        }
        Err(e) => {
            return Err(anyhow::Error::from(e).context("failed to install the port-53 NAT redirect"));
        }
    }

    let filter = match controller {
        Some(controller) => {
            let merged = initial_policy.with_extra_allow_ips(&seed_ips);
            match controller.apply_static(&merged).await {
                Ok(()) => {
                    let hooked = controller.clone();
                    proxy.set_on_resolved(Arc::new(move |resolved| {
                        let hooked = hooked.clone();
                        Box::pin(async move {
                            // The client keeps its DNS answer either way; a
                            // lost add only means the next packet is dropped.
                            if let Err(e) = hooked.add_resolved_ips(&resolved).await {
                                warn!("dynamic allow-set update failed: {}", e);
                            }
                        })
                    }));
                    Some(controller)
                }
                Err(e) => {
                    warn!(
                        "initial filter apply failed, degrading to dns-only enforcement: {}",
                        e
                    );
                    None
                }
            }
        }
        None => None,
    };

    let ctx = ApiContext::new(
        proxy.clone(),
        filter,
        seed_ips,
        config.token.clone(),
        config.token_header.clone(),
    );
    let http_addr = config.http_listen_addr()?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut api_task = tokio::spawn(gf_api::serve(ctx, http_addr, async move {
        let _ = shutdown_rx.await;
    }));

    tokio::select! {
        signal = wait_for_signal() => {
            signal?;
            info!("shutdown signal received");
        }
        result = &mut proxy_task => {
            return Err(task_error(result, "DNS proxy"));
        }
        result = &mut api_task => {
            return Err(task_error(result, "policy API"));
        }
    }

    // Stop accepting API requests, drain in flight, then give up.
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut api_task).await {
        Ok(Ok(Ok(()))) => info!("policy API stopped"),
        Ok(Ok(Err(e))) => warn!("policy API shutdown error: {}", e),
        Ok(Err(e)) => warn!("policy API task failed: {}", e),
        Err(_) => {
            warn!("policy API did not drain within grace period, aborting");
            api_task.abort();
        }
    }

    proxy_task.abort();
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

fn task_error(result: Result<Result<()>, tokio::task::JoinError>, what: &str) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow::anyhow!("{} exited unexpectedly", what),
        Ok(Err(e)) => e.context(format!("{} failed", what)),
        Err(e) => anyhow::anyhow!("{} task panicked: {}", what, e),
    }
}
