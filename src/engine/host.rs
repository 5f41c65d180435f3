//! End-host protocol logic.
//!
//! Hosts sit at the edge and play both ends of the protocol. As a
//! victim, a host turns the route record stripped from offending
//! traffic into the `FilterReq` that starts a negotiation. As an
//! accused attacker, it receives the final `FilterReq` relayed by its
//! router: a compliant host blocks its own outgoing flow on the local
//! output chain and acknowledges, while the other modes model hosts
//! that will not cooperate.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::auth::NonceAuthenticator;
use crate::filter::{FilterTable, FirewallDriver};
use crate::protocol::{FilterMessage, FlowClaim};
use crate::record::RouteRecord;

use super::{ComplianceMode, Outbound, Timings};

/// Protocol engine for a non-forwarding end host.
pub struct HostEngine {
    auth: Arc<NonceAuthenticator>,
    mode: ComplianceMode,
    timings: Timings,
    filters: FilterTable,
}

impl HostEngine {
    pub fn new(
        auth: Arc<NonceAuthenticator>,
        mode: ComplianceMode,
        firewall: Arc<dyn FirewallDriver>,
        timings: Timings,
    ) -> Self {
        Self {
            auth,
            mode,
            timings,
            filters: FilterTable::new(firewall),
        }
    }

    /// Victim-side origination: ask for a flow to be stopped, using the
    /// route record stripped from the offending traffic as evidence.
    ///
    /// The request goes to the last hop in the record, the router
    /// nearest this victim; that router escalates toward the attacker
    /// through the counter-connection. Deciding *which* traffic is an
    /// attack is the local policy module's job, not this engine's.
    /// Returns nothing when the record carries no hops to ask.
    pub fn request_filter(
        &self,
        attacker: Ipv4Addr,
        victim: Ipv4Addr,
        route: RouteRecord,
    ) -> Option<Outbound> {
        let Some(nearest) = route.path.last() else {
            warn!(%attacker, %victim, "offending flow recorded no hops, nobody to ask");
            return None;
        };
        let to = nearest.address;

        info!(%attacker, %victim, router = %to, "requesting filter for offending flow");
        Some(Outbound {
            msg: FilterMessage::FilterReq(FlowClaim {
                attacker,
                victim,
                route,
            }),
            to,
        })
    }

    /// Process one decoded message, returning the replies to send.
    pub fn handle_message(
        &mut self,
        from: Ipv4Addr,
        msg: FilterMessage,
        now_ms: u64,
    ) -> Vec<Outbound> {
        if !msg.authentic(&self.auth) {
            warn!(%from, kind = %msg.message_type(), "discarding unauthenticated message");
            return Vec::new();
        }

        let FilterMessage::FilterReq(claim) = msg else {
            // Hosts never take part in the counter-connection.
            warn!(%from, kind = %msg.message_type(), "unexpected message for a host");
            return Vec::new();
        };

        self.on_filter_req(from, claim, now_ms)
    }

    fn on_filter_req(&mut self, from: Ipv4Addr, claim: FlowClaim, now_ms: u64) -> Vec<Outbound> {
        match self.mode {
            ComplianceMode::Ignore => {
                debug!(%from, "ignoring filter request");
                Vec::new()
            }
            ComplianceMode::Lie => {
                info!(attacker = %claim.attacker, victim = %claim.victim,
                    "acknowledging without blocking");
                vec![Outbound {
                    msg: FilterMessage::FilterAck(claim),
                    to: from,
                }]
            }
            ComplianceMode::Comply => {
                if let Err(e) = self.filters.install(
                    claim.attacker,
                    claim.victim,
                    self.timings.long_filter_ms,
                    false,
                    now_ms,
                ) {
                    error!(victim = %claim.victim, error = %e,
                        "cannot block own flow, not acknowledging");
                    return Vec::new();
                }
                vec![Outbound {
                    msg: FilterMessage::FilterAck(claim),
                    to: from,
                }]
            }
        }
    }

    /// Periodic maintenance: let old blocks lapse.
    pub fn tick(&mut self, now_ms: u64) {
        let purged = self.filters.purge_expired(now_ms);
        if purged > 0 {
            debug!(purged, "expired filters removed");
        }
    }
}
