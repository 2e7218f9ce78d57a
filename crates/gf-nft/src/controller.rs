use crate::backend::{ApplyError, NftBackend, NftCli};
use crate::ruleset::{FilterOptions, render_element_add, render_element_delete, render_ruleset};
use gf_core::{Policy, ResolvedIp};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Sole owner of the sidecar's kernel filter state. Every mutation — full
/// ruleset apply or dynamic-set add — runs under one mutex so an add can
/// never interleave with a table reset.
pub struct FilterController {
    backend: Arc<dyn NftBackend>,
    options: FilterOptions,
    apply_lock: Mutex<()>,
}

impl FilterController {
    pub fn new(options: FilterOptions) -> Self {
        Self::with_backend(options, Arc::new(NftCli))
    }

    pub fn with_backend(options: FilterOptions, backend: Arc<dyn NftBackend>) -> Self {
        Self {
            backend,
            options,
            apply_lock: Mutex::new(()),
        }
    }

    /// Atomically reconcile the filter table against `policy`. The first
    /// attempt deletes and recreates the table; if that fails because the
    /// table does not exist yet, retry once without the delete step.
    pub async fn apply_static(&self, policy: &Policy) -> Result<(), ApplyError> {
        let _guard = self.apply_lock.lock().await;

        let payload = render_ruleset(policy, &self.options, true)?;
        match self.backend.apply(&payload).await {
            Ok(()) => {}
            Err(e) if e.is_missing_table() => {
                debug!("filter table absent, retrying apply without delete step");
                let payload = render_ruleset(policy, &self.options, false)?;
                self.backend.apply(&payload).await?;
            }
            Err(e) => return Err(e),
        }

        info!(
            mode = policy.mode().as_str(),
            rules = policy.rules.len(),
            "applied egress filter ruleset"
        );
        Ok(())
    }

    /// Install resolved addresses into the dynamic allow sets with their
    /// clamped TTLs. Each address is deleted best-effort first so re-adding
    /// refreshes the timeout instead of tripping over the existing element.
    pub async fn add_resolved_ips(&self, entries: &[ResolvedIp]) -> Result<(), ApplyError> {
        if entries.is_empty() {
            return Ok(());
        }

        let _guard = self.apply_lock.lock().await;
        for entry in entries {
            let delete = render_element_delete(entry)?;
            if let Err(e) = self.backend.apply(&delete).await {
                debug!(addr = %entry.addr, "no stale dynamic entry to delete: {}", e);
            }
            let add = render_element_add(entry)?;
            self.backend.apply(&add).await?;
        }

        debug!(count = entries.len(), "extended dynamic allow set");
        Ok(())
    }
}
