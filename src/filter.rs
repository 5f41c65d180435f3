//! Active filter bookkeeping and the firewall collaborator seam.
//!
//! A filter is a temporary block of traffic from one address to another.
//! [`FilterTable`] tracks which blocks this process currently owns and
//! drives the external [`FirewallDriver`] that performs the actual kernel
//! rule changes. Time is passed in explicitly (`now_ms`) so expiry is
//! deterministic under test.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

/// Default duration a flow stays blocked. A victim-side router drops its
/// block early once a party closer to the attacker takes over.
pub const LONG_FILTER_MS: u64 = 120_000;

/// Errors from the firewall collaborator.
///
/// Install failures are hard errors: the caller must not acknowledge a
/// block it never applied. Uninstall failures are expected and benign —
/// the rule usually just expired already.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("firewall install failed: {0}")]
    Install(String),

    #[error("firewall uninstall failed: {0}")]
    Uninstall(String),
}

/// External collaborator that applies and removes kernel-level block
/// rules.
pub trait FirewallDriver: Send + Sync {
    /// Add a rule dropping traffic from `src` to `dst`. `via_forwarding`
    /// selects the forwarded-traffic chain (routers) over the local
    /// output chain (hosts).
    fn install(&self, src: Ipv4Addr, dst: Ipv4Addr, via_forwarding: bool)
        -> Result<(), FilterError>;

    /// Remove a previously added rule.
    fn uninstall(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        via_forwarding: bool,
    ) -> Result<(), FilterError>;
}

/// One currently active block entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveFilter {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub installed_at_ms: u64,
    pub duration_ms: u64,
    pub via_forwarding: bool,
}

impl ActiveFilter {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.installed_at_ms.saturating_add(self.duration_ms)
    }
}

/// Tracks the block rules this process owns.
///
/// Entries are keyed by (src, dst, via_forwarding); installing an
/// already-present entry refreshes its deadline instead of stacking a
/// duplicate kernel rule. Removal is idempotent: protocol-driven early
/// uninstall and timeout expiry can race on the same entry.
pub struct FilterTable {
    entries: HashMap<(Ipv4Addr, Ipv4Addr, bool), ActiveFilter>,
    firewall: Arc<dyn FirewallDriver>,
}

impl FilterTable {
    /// Create a table backed by the given firewall driver.
    pub fn new(firewall: Arc<dyn FirewallDriver>) -> Self {
        Self {
            entries: HashMap::new(),
            firewall,
        }
    }

    /// Install a block from `src` to `dst` for `duration_ms`.
    ///
    /// Driver failure is surfaced; no entry is recorded in that case.
    pub fn install(
        &mut self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        duration_ms: u64,
        via_forwarding: bool,
        now_ms: u64,
    ) -> Result<(), FilterError> {
        let key = (src, dst, via_forwarding);

        if let Some(existing) = self.entries.get_mut(&key) {
            debug!(%src, %dst, "refreshing existing filter");
            existing.installed_at_ms = now_ms;
            existing.duration_ms = duration_ms;
            return Ok(());
        }

        self.firewall.install(src, dst, via_forwarding)?;
        info!(%src, %dst, duration_ms, via_forwarding, "filter installed");

        self.entries.insert(
            key,
            ActiveFilter {
                src,
                dst,
                installed_at_ms: now_ms,
                duration_ms,
                via_forwarding,
            },
        );
        Ok(())
    }

    /// Remove a block early. Removing an absent entry is a no-op.
    pub fn uninstall(&mut self, src: Ipv4Addr, dst: Ipv4Addr, via_forwarding: bool) {
        if self.entries.remove(&(src, dst, via_forwarding)).is_none() {
            debug!(%src, %dst, "filter already removed");
            return;
        }

        info!(%src, %dst, "filter removed");
        if let Err(e) = self.firewall.uninstall(src, dst, via_forwarding) {
            // Usually means the rule already timed out on the kernel side.
            debug!(%src, %dst, error = %e, "benign uninstall failure");
        }
    }

    /// True if any unexpired block covers (src, dst), on either chain.
    pub fn contains(&self, src: Ipv4Addr, dst: Ipv4Addr, now_ms: u64) -> bool {
        [true, false].iter().any(|&fwd| {
            self.entries
                .get(&(src, dst, fwd))
                .map(|f| !f.is_expired(now_ms))
                .unwrap_or(false)
        })
    }

    /// Remove all expired entries, issuing their firewall uninstalls.
    /// Returns how many were removed.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, f)| f.is_expired(now_ms))
            .map(|(k, _)| *k)
            .collect();

        for key in &expired {
            self.entries.remove(key);
            info!(src = %key.0, dst = %key.1, "filter timed out");
            if let Err(e) = self.firewall.uninstall(key.0, key.1, key.2) {
                debug!(src = %key.0, dst = %key.1, error = %e, "benign uninstall failure");
            }
        }

        expired.len()
    }

    /// Number of tracked entries (including not-yet-purged expired ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Firewall driver backed by the `iptables` command.
///
/// Rule changes run asynchronously so protocol handling never blocks on
/// process execution; only a failure to spawn is surfaced synchronously.
/// Nonzero exit on uninstall is normal (rule already gone) and logged at
/// debug.
pub struct IptablesDriver;

impl IptablesDriver {
    fn run(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        via_forwarding: bool,
        remove: bool,
    ) -> Result<(), FilterError> {
        let chain = if via_forwarding { "FORWARD" } else { "OUTPUT" };
        let action = if remove { "-D" } else { "-I" };

        let child = tokio::process::Command::new("iptables")
            .args([
                action,
                chain,
                "-s",
                &format!("{}/32", src),
                "-d",
                &format!("{}/32", dst),
                "-j",
                "DROP",
            ])
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) if remove => return Err(FilterError::Uninstall(e.to_string())),
            Err(e) => return Err(FilterError::Install(e.to_string())),
        };

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) if remove => {
                    debug!(%status, "iptables rule removal failed (likely already gone)");
                }
                Ok(status) => warn!(%status, "iptables rule insertion failed"),
                Err(e) => warn!(error = %e, "failed to wait for iptables"),
            }
        });

        Ok(())
    }
}

impl FirewallDriver for IptablesDriver {
    fn install(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        via_forwarding: bool,
    ) -> Result<(), FilterError> {
        Self::run(src, dst, via_forwarding, false)
    }

    fn uninstall(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        via_forwarding: bool,
    ) -> Result<(), FilterError> {
        Self::run(src, dst, via_forwarding, true)
    }
}
