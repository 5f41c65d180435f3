//! Protocol engines: the decision logic behind a running node.
//!
//! Engines are pure state machines. They take a decoded message plus the
//! current time and return the messages to send in response; the daemon
//! loop owns the socket and the clock. This keeps every protocol decision
//! unit-testable without networking.

mod host;
mod router;

pub use host::HostEngine;
pub use router::RouterEngine;

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::FilterMessage;

/// How long an opened counter-connection handshake stays answerable.
pub const DEFAULT_PENDING_TTL_MS: u64 = 30_000;

/// How long an honored filter request is remembered for escalation.
pub const DEFAULT_SHADOW_TTL_MS: u64 = 600_000;

/// How a node responds to filter requests aimed at it.
///
/// `Comply` is honest operation. `Ignore` and `Lie` model uncooperative
/// or malicious parties for testing the escalation path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceMode {
    /// Install requested filters and acknowledge.
    Comply,
    /// Drop filter requests silently.
    Ignore,
    /// Acknowledge without installing anything.
    Lie,
}

impl fmt::Display for ComplianceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComplianceMode::Comply => "comply",
            ComplianceMode::Ignore => "ignore",
            ComplianceMode::Lie => "lie",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ComplianceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "comply" => Ok(ComplianceMode::Comply),
            "ignore" => Ok(ComplianceMode::Ignore),
            "lie" => Ok(ComplianceMode::Lie),
            other => Err(format!(
                "unknown compliance mode '{}' (expected comply, ignore or lie)",
                other
            )),
        }
    }
}

/// Filter durations and table TTLs for an engine.
#[derive(Clone, Copy, Debug)]
pub struct Timings {
    /// How long installed blocks last absent an early uninstall.
    pub long_filter_ms: u64,
    /// How long an answered handshake waits for its Ack.
    pub pending_ttl_ms: u64,
    /// How long a relinquished flow is remembered for escalation.
    pub shadow_ttl_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            long_filter_ms: crate::filter::LONG_FILTER_MS,
            pending_ttl_ms: DEFAULT_PENDING_TTL_MS,
            shadow_ttl_ms: DEFAULT_SHADOW_TTL_MS,
        }
    }
}

/// A message an engine wants sent, and to whom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub msg: FilterMessage,
    pub to: Ipv4Addr,
}

struct Pending {
    claim: crate::protocol::FlowClaim,
    created_at_ms: u64,
}

/// Handshakes this node has answered with a SynAck and is waiting to see
/// completed. Keyed by the nonce we issued; an Ack carrying an unknown
/// nonce is a forgery.
pub struct PendingHandshakes {
    entries: HashMap<u64, Pending>,
    ttl_ms: u64,
}

impl PendingHandshakes {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms,
        }
    }

    /// Remember an issued nonce and the claim it vouches for.
    pub fn insert(&mut self, nonce: u64, claim: crate::protocol::FlowClaim, now_ms: u64) {
        self.entries.insert(
            nonce,
            Pending {
                claim,
                created_at_ms: now_ms,
            },
        );
    }

    /// Consume a nonce, returning its claim if it was outstanding and
    /// unexpired. Each nonce answers at most one Ack.
    pub fn take(&mut self, nonce: u64, now_ms: u64) -> Option<crate::protocol::FlowClaim> {
        let pending = self.entries.remove(&nonce)?;
        if now_ms >= pending.created_at_ms.saturating_add(self.ttl_ms) {
            return None;
        }
        Some(pending.claim)
    }

    /// Drop handshakes that were never completed.
    pub fn purge_expired(&mut self, now_ms: u64) {
        let ttl = self.ttl_ms;
        self.entries
            .retain(|_, p| now_ms < p.created_at_ms.saturating_add(ttl));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Flows this router has already relinquished to a party closer to the
/// attacker. A repeat request for a shadowed flow means that party did
/// not actually stop the traffic.
pub struct ShadowFilters {
    entries: HashMap<(Ipv4Addr, Ipv4Addr), u64>,
    ttl_ms: u64,
}

impl ShadowFilters {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms,
        }
    }

    /// Remember that (attacker, victim) was handed off at `now_ms`.
    pub fn record(&mut self, attacker: Ipv4Addr, victim: Ipv4Addr, now_ms: u64) {
        self.entries.insert((attacker, victim), now_ms);
    }

    /// True if the flow was handed off within the TTL.
    pub fn contains(&self, attacker: Ipv4Addr, victim: Ipv4Addr, now_ms: u64) -> bool {
        self.entries
            .get(&(attacker, victim))
            .map(|&at| now_ms < at.saturating_add(self.ttl_ms))
            .unwrap_or(false)
    }

    /// Forget stale hand-offs.
    pub fn purge_expired(&mut self, now_ms: u64) {
        let ttl = self.ttl_ms;
        self.entries
            .retain(|_, &mut at| now_ms < at.saturating_add(ttl));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
