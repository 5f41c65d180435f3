//! Router-side protocol logic.
//!
//! A router plays two roles depending on which end of the offending flow
//! it sits on. Near the victim it receives the initial `FilterReq`,
//! blocks the flow temporarily and opens the counter-connection toward
//! the attacker's side. Near the attacker it answers the handshake and,
//! once the requester has proven itself, takes over blocking the flow and
//! asks the attacking host itself to stop.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::auth::NonceAuthenticator;
use crate::filter::{FilterTable, FirewallDriver};
use crate::protocol::{FilterMessage, FlowClaim};

use super::{ComplianceMode, Outbound, PendingHandshakes, ShadowFilters, Timings};

/// Protocol engine for a forwarding router.
pub struct RouterEngine {
    auth: Arc<NonceAuthenticator>,
    mode: ComplianceMode,
    timings: Timings,
    filters: FilterTable,
    pending: PendingHandshakes,
    shadow: ShadowFilters,
}

impl RouterEngine {
    pub fn new(
        auth: Arc<NonceAuthenticator>,
        mode: ComplianceMode,
        firewall: Arc<dyn FirewallDriver>,
        timings: Timings,
    ) -> Self {
        Self {
            auth,
            mode,
            filters: FilterTable::new(firewall),
            pending: PendingHandshakes::new(timings.pending_ttl_ms),
            shadow: ShadowFilters::new(timings.shadow_ttl_ms),
            timings,
        }
    }

    /// Process one decoded message, returning the replies to send.
    ///
    /// Messages whose route record does not verify are discarded without
    /// a reply; answering forgeries would turn this node into a
    /// reflector.
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

        debug!(%from, kind = %msg.message_type(), "handling message");
        match msg {
            FilterMessage::FilterReq(claim) => self.on_filter_req(from, claim, now_ms),
            FilterMessage::CounterConnectionSyn { claim, .. } => {
                self.on_syn(from, claim, now_ms)
            }
            FilterMessage::CounterConnectionSynAck { claim, nonce } => {
                self.on_syn_ack(from, claim, nonce)
            }
            FilterMessage::CounterConnectionAck { nonce, .. } => {
                self.on_ack(from, nonce, now_ms)
            }
            FilterMessage::FilterAck(claim) => self.on_filter_ack(claim, now_ms),
        }
    }

    /// Victim-side entry point: block the flow, acknowledge, and open the
    /// counter-connection toward the attacker's side. The block outlives
    /// the handshake and is only released early when the other side takes
    /// over.
    fn on_filter_req(
        &mut self,
        from: Ipv4Addr,
        claim: FlowClaim,
        now_ms: u64,
    ) -> Vec<Outbound> {
        if let Err(e) = self.filters.install(
            claim.attacker,
            claim.victim,
            self.timings.long_filter_ms,
            true,
            now_ms,
        ) {
            error!(attacker = %claim.attacker, victim = %claim.victim, error = %e,
                "cannot block flow, dropping request");
            return Vec::new();
        }

        let mut out = vec![Outbound {
            msg: FilterMessage::FilterAck(claim.clone()),
            to: from,
        }];

        if self.shadow.contains(claim.attacker, claim.victim, now_ms) {
            // The party that took this flow over last time is letting it
            // through again.
            info!(attacker = %claim.attacker, victim = %claim.victim,
                "repeat request for relinquished flow, escalating");
            return out;
        }

        let Some(first_hop) = claim.route.path.first() else {
            warn!(attacker = %claim.attacker, victim = %claim.victim,
                "route has no hops, nowhere to open counter-connection");
            return out;
        };

        let to = first_hop.address;
        out.push(Outbound {
            msg: FilterMessage::CounterConnectionSyn { claim, nonce: 0 },
            to,
        });
        out
    }

    /// Attacker-side: answer the handshake with a fresh nonce.
    fn on_syn(&mut self, from: Ipv4Addr, claim: FlowClaim, now_ms: u64) -> Vec<Outbound> {
        if self.mode == ComplianceMode::Ignore {
            debug!(%from, "ignoring counter-connection open");
            return Vec::new();
        }

        let nonce: u64 = rand::random();
        self.pending.insert(nonce, claim.clone(), now_ms);

        vec![Outbound {
            msg: FilterMessage::CounterConnectionSynAck { claim, nonce },
            to: from,
        }]
    }

    /// Victim-side: echo the nonce back to complete the handshake.
    fn on_syn_ack(&mut self, from: Ipv4Addr, claim: FlowClaim, nonce: u64) -> Vec<Outbound> {
        if self.mode == ComplianceMode::Ignore {
            return Vec::new();
        }

        vec![Outbound {
            msg: FilterMessage::CounterConnectionAck { claim, nonce },
            to: from,
        }]
    }

    /// Attacker-side: the requester proved it can receive at its claimed
    /// address. Take over blocking the flow and tell the attacking host
    /// to stop too.
    fn on_ack(&mut self, from: Ipv4Addr, nonce: u64, now_ms: u64) -> Vec<Outbound> {
        if self.mode == ComplianceMode::Ignore {
            return Vec::new();
        }

        let Some(claim) = self.pending.take(nonce, now_ms) else {
            warn!(%from, nonce, "Ack with unknown nonce, likely forged");
            return Vec::new();
        };

        if self.mode != ComplianceMode::Comply {
            // A lying router lets the handshake complete and then does
            // nothing with it.
            debug!(%from, "handshake complete, taking no action");
            return Vec::new();
        }

        if let Err(e) = self.filters.install(
            claim.attacker,
            claim.victim,
            self.timings.long_filter_ms,
            false,
            now_ms,
        ) {
            error!(attacker = %claim.attacker, victim = %claim.victim, error = %e,
                "cannot block flow, not acknowledging");
            return Vec::new();
        }

        vec![
            Outbound {
                msg: FilterMessage::FilterReq(claim.clone()),
                to: claim.attacker,
            },
            Outbound {
                msg: FilterMessage::FilterAck(claim),
                to: from,
            },
        ]
    }

    /// Victim-side: the attacker's side took the flow over, so the
    /// temporary block here can go. Remember the hand-off so a repeat
    /// request is recognized as non-compliance.
    fn on_filter_ack(&mut self, claim: FlowClaim, now_ms: u64) -> Vec<Outbound> {
        if self.mode != ComplianceMode::Comply {
            return Vec::new();
        }

        self.filters.uninstall(claim.attacker, claim.victim, true);
        self.shadow.record(claim.attacker, claim.victim, now_ms);
        Vec::new()
    }

    /// Periodic maintenance: expire filters, stale handshakes and old
    /// hand-off records.
    pub fn tick(&mut self, now_ms: u64) {
        let purged = self.filters.purge_expired(now_ms);
        if purged > 0 {
            debug!(purged, "expired filters removed");
        }
        self.pending.purge_expired(now_ms);
        self.shadow.purge_expired(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterError;
    use crate::protocol::MessageType;
    use crate::record::RouteRecord;

    struct NullDriver;

    impl FirewallDriver for NullDriver {
        fn install(&self, _: Ipv4Addr, _: Ipv4Addr, _: bool) -> Result<(), FilterError> {
            Ok(())
        }
        fn uninstall(&self, _: Ipv4Addr, _: Ipv4Addr, _: bool) -> Result<(), FilterError> {
            Ok(())
        }
    }

    struct FailingDriver;

    impl FirewallDriver for FailingDriver {
        fn install(&self, _: Ipv4Addr, _: Ipv4Addr, _: bool) -> Result<(), FilterError> {
            Err(FilterError::Install("denied".into()))
        }
        fn uninstall(&self, _: Ipv4Addr, _: Ipv4Addr, _: bool) -> Result<(), FilterError> {
            Ok(())
        }
    }

    const VICTIM: Ipv4Addr = Ipv4Addr::new(10, 4, 32, 1);
    const VICTIM_ROUTER: Ipv4Addr = Ipv4Addr::new(10, 4, 32, 2);
    const ATTACKER_ROUTER: Ipv4Addr = Ipv4Addr::new(10, 4, 32, 3);
    const ATTACKER: Ipv4Addr = Ipv4Addr::new(10, 4, 32, 4);

    fn make_auth() -> Arc<NonceAuthenticator> {
        Arc::new(NonceAuthenticator::new(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]))
    }

    fn make_engine(auth: &Arc<NonceAuthenticator>, mode: ComplianceMode) -> RouterEngine {
        RouterEngine::new(auth.clone(), mode, Arc::new(NullDriver), Timings::default())
    }

    /// Path as recorded on the offending traffic: the attacker-side
    /// router stamps first, the victim-side router last.
    fn make_claim(auth: &NonceAuthenticator) -> FlowClaim {
        let mut route = RouteRecord::new(6);
        route.add_hop(auth, ATTACKER_ROUTER, VICTIM);
        route.add_hop(auth, VICTIM_ROUTER, VICTIM);

        FlowClaim {
            attacker: ATTACKER,
            victim: VICTIM,
            route,
        }
    }

    #[test]
    fn test_unauthenticated_message_is_dropped() {
        let auth = make_auth();
        let mut engine = make_engine(&auth, ComplianceMode::Comply);

        let mut claim = make_claim(&auth);
        claim.route.path[0].nonce = [0; 8];
        claim.route.path[1].nonce = [0; 8];

        let out = engine.handle_message(VICTIM, FilterMessage::FilterReq(claim), 0);
        assert!(out.is_empty());
        assert!(!engine.filters.contains(ATTACKER, VICTIM, 0));
    }

    #[test]
    fn test_filter_req_blocks_acks_and_opens_counter_connection() {
        let auth = make_auth();
        let mut engine = make_engine(&auth, ComplianceMode::Comply);
        let claim = make_claim(&auth);

        let out = engine.handle_message(VICTIM, FilterMessage::FilterReq(claim), 0);

        assert!(engine.filters.contains(ATTACKER, VICTIM, 0));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].msg.message_type(), MessageType::FilterAck);
        assert_eq!(out[0].to, VICTIM);
        assert_eq!(out[1].msg.message_type(), MessageType::CounterConnectionSyn);
        assert_eq!(out[1].to, ATTACKER_ROUTER);
    }

    #[test]
    fn test_filter_req_single_hop_targets_that_hop() {
        let auth = make_auth();
        let mut engine = make_engine(&auth, ComplianceMode::Comply);

        let mut claim = make_claim(&auth);
        claim.route.path.truncate(1);

        let out = engine.handle_message(VICTIM, FilterMessage::FilterReq(claim), 0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].to, ATTACKER_ROUTER);
    }

    #[test]
    fn test_full_counter_connection_handshake() {
        let auth = make_auth();
        let mut victim_router = make_engine(&auth, ComplianceMode::Comply);
        let mut attacker_router = make_engine(&auth, ComplianceMode::Comply);
        let claim = make_claim(&auth);

        // Victim asks its router to block the flow.
        let out = victim_router.handle_message(VICTIM, FilterMessage::FilterReq(claim), 0);
        let syn = out[1].clone();
        assert_eq!(syn.to, ATTACKER_ROUTER);

        // Attacker-side router answers with a fresh nonce.
        let out = attacker_router.handle_message(VICTIM_ROUTER, syn.msg, 10);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].msg.message_type(),
            MessageType::CounterConnectionSynAck
        );
        assert_eq!(out[0].to, VICTIM_ROUTER);
        let nonce = out[0].msg.handshake_nonce().unwrap();
        assert_eq!(attacker_router.pending.len(), 1);

        // Victim-side router echoes the nonce.
        let out = victim_router.handle_message(ATTACKER_ROUTER, out[0].msg.clone(), 20);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg.message_type(), MessageType::CounterConnectionAck);
        assert_eq!(out[0].msg.handshake_nonce(), Some(nonce));

        // Attacker-side router takes the flow over.
        let out = attacker_router.handle_message(VICTIM_ROUTER, out[0].msg.clone(), 30);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].msg.message_type(), MessageType::FilterReq);
        assert_eq!(out[0].to, ATTACKER);
        assert_eq!(out[1].msg.message_type(), MessageType::FilterAck);
        assert_eq!(out[1].to, VICTIM_ROUTER);
        assert!(attacker_router.filters.contains(ATTACKER, VICTIM, 30));
        assert!(attacker_router.pending.is_empty());

        // Victim-side router drops its temporary block and remembers the
        // hand-off.
        let out = victim_router.handle_message(ATTACKER_ROUTER, out[1].msg.clone(), 40);
        assert!(out.is_empty());
        assert!(!victim_router.filters.contains(ATTACKER, VICTIM, 40));
        assert!(victim_router.shadow.contains(ATTACKER, VICTIM, 40));
    }

    #[test]
    fn test_repeat_request_after_handoff_escalates() {
        let auth = make_auth();
        let mut engine = make_engine(&auth, ComplianceMode::Comply);
        let claim = make_claim(&auth);

        engine.shadow.record(ATTACKER, VICTIM, 0);

        let out = engine.handle_message(VICTIM, FilterMessage::FilterReq(claim), 100);

        // Flow is blocked again and acknowledged, but no new
        // counter-connection is opened toward the non-compliant side.
        assert!(engine.filters.contains(ATTACKER, VICTIM, 100));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg.message_type(), MessageType::FilterAck);
    }

    #[test]
    fn test_ack_with_unknown_nonce_is_rejected() {
        let auth = make_auth();
        let mut engine = make_engine(&auth, ComplianceMode::Comply);
        let claim = make_claim(&auth);

        let out = engine.handle_message(
            VICTIM_ROUTER,
            FilterMessage::CounterConnectionAck {
                claim,
                nonce: 0xBAD,
            },
            0,
        );

        assert!(out.is_empty());
        assert!(!engine.filters.contains(ATTACKER, VICTIM, 0));
    }

    #[test]
    fn test_stale_handshake_is_rejected() {
        let auth = make_auth();
        let mut engine = make_engine(&auth, ComplianceMode::Comply);
        let claim = make_claim(&auth);

        let out = engine.handle_message(
            VICTIM_ROUTER,
            FilterMessage::CounterConnectionSyn {
                claim: claim.clone(),
                nonce: 0,
            },
            0,
        );
        let nonce = out[0].msg.handshake_nonce().unwrap();

        let late = crate::engine::DEFAULT_PENDING_TTL_MS + 1;
        let out = engine.handle_message(
            VICTIM_ROUTER,
            FilterMessage::CounterConnectionAck { claim, nonce },
            late,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_ignore_mode_drops_handshake() {
        let auth = make_auth();
        let mut engine = make_engine(&auth, ComplianceMode::Ignore);
        let claim = make_claim(&auth);

        let out = engine.handle_message(
            VICTIM_ROUTER,
            FilterMessage::CounterConnectionSyn {
                claim: claim.clone(),
                nonce: 0,
            },
            0,
        );
        assert!(out.is_empty());
        assert!(engine.pending.is_empty());

        let out = engine.handle_message(
            ATTACKER_ROUTER,
            FilterMessage::CounterConnectionSynAck { claim, nonce: 7 },
            0,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_lying_router_completes_handshake_without_blocking() {
        let auth = make_auth();
        let mut engine = make_engine(&auth, ComplianceMode::Lie);
        let claim = make_claim(&auth);

        // Participates in the handshake like a compliant router.
        let out = engine.handle_message(
            VICTIM_ROUTER,
            FilterMessage::CounterConnectionSyn {
                claim: claim.clone(),
                nonce: 0,
            },
            0,
        );
        assert_eq!(
            out[0].msg.message_type(),
            MessageType::CounterConnectionSynAck
        );
        let nonce = out[0].msg.handshake_nonce().unwrap();

        // Then never blocks and never bothers the host.
        let out = engine.handle_message(
            VICTIM_ROUTER,
            FilterMessage::CounterConnectionAck { claim, nonce },
            10,
        );
        assert!(out.is_empty());
        assert!(engine.pending.is_empty());
        assert!(!engine.filters.contains(ATTACKER, VICTIM, 10));
    }

    #[test]
    fn test_firewall_failure_produces_no_reply() {
        let auth = make_auth();
        let mut engine = RouterEngine::new(
            auth.clone(),
            ComplianceMode::Comply,
            Arc::new(FailingDriver),
            Timings::default(),
        );
        let claim = make_claim(&auth);

        let out = engine.handle_message(VICTIM, FilterMessage::FilterReq(claim), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_tick_expires_filters() {
        let auth = make_auth();
        let mut engine = make_engine(&auth, ComplianceMode::Comply);
        let claim = make_claim(&auth);

        engine.handle_message(VICTIM, FilterMessage::FilterReq(claim), 0);
        assert!(engine.filters.contains(ATTACKER, VICTIM, 0));

        engine.tick(crate::filter::LONG_FILTER_MS);
        assert!(engine.filters.is_empty());
    }
}
