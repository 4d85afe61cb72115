//! Two-phase expert discovery.
//!
//! Phase 1 (`Local`) queries the Layer 2 mesh; phase 2 (`Backbone`) escalates to
//! Layer 3. The host drives both the phase change and the timeouts: discovery
//! only collects offers, scores them and picks a proposer and critic.

use serde::Deserialize;

use crate::protocol::{ExpertOffer, RoutingRequest};

/// Reputation used for every node when no lookup is supplied.
pub const DEFAULT_REPUTATION: u32 = 50;

/// Latency at or below this saturates the latency term.
const LATENCY_SATURATION_MS: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    /// Layer 2 mesh.
    Local,
    /// Layer 3 backbone.
    Backbone,
}

/// Timeouts and scoring weights. Fixed for the lifetime of a discovery run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub local_timeout_ms: u64,
    pub backbone_timeout_ms: u64,
    pub reputation_weight: f64,
    pub latency_weight: f64,
    /// Fewer offers than this makes a phase inconclusive.
    pub min_offers: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            local_timeout_ms: 200,
            backbone_timeout_ms: 2000,
            reputation_weight: 0.6,
            latency_weight: 0.4,
            min_offers: 1,
        }
    }
}

/// External reputation store, 0..=100 per node.
pub trait ReputationLookup {
    fn reputation(&self, node_id: &str) -> u32;
}

impl<F> ReputationLookup for F
where
    F: Fn(&str) -> u32,
{
    fn reputation(&self, node_id: &str) -> u32 {
        self(node_id)
    }
}

/// Outcome of `select_experts`. All offers are kept for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResult {
    pub phase: DiscoveryPhase,
    pub proposer: Option<ExpertOffer>,
    pub critic: Option<ExpertOffer>,
    pub all_offers: Vec<ExpertOffer>,
}

impl DiscoveryResult {
    pub fn success(&self) -> bool {
        self.proposer.is_some()
    }
}

/// Offer collector for one request. Single owner; callers serialize `add_offer`.
#[derive(Debug, Clone)]
pub struct ExpertDiscovery {
    config: DiscoveryConfig,
    offers: Vec<ExpertOffer>,
    phase: DiscoveryPhase,
}

impl ExpertDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            offers: Vec::new(),
            phase: DiscoveryPhase::Local,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Clear offers and return to `Local` for a new request.
    pub fn reset(&mut self) {
        self.offers.clear();
        self.phase = DiscoveryPhase::Local;
    }

    /// Register an incoming offer. No dedup and no request-id check: the caller filters.
    pub fn add_offer(&mut self, offer: ExpertOffer) {
        self.offers.push(offer);
    }

    pub fn offers(&self) -> &[ExpertOffer] {
        &self.offers
    }

    /// True once at least `min_offers` offers have arrived.
    pub fn is_sufficient(&self) -> bool {
        self.offers.len() >= self.config.min_offers
    }

    /// `reputation_weight * min(rep / 100, 1) + latency_weight * min(1000 / latency, 1)`. Higher is better.
    pub fn score_offer(&self, offer: &ExpertOffer, reputation: u32) -> f64 {
        let rep_normalized = (reputation as f64 / 100.0).min(1.0);
        let latency = offer.bid.est_latency_ms.max(1) as f64;
        let lat_normalized = (LATENCY_SATURATION_MS / latency).min(1.0);
        rep_normalized * self.config.reputation_weight + lat_normalized * self.config.latency_weight
    }

    /// Pick the best proposer (matches the primary intent) and critic (matches a
    /// secondary intent, never the proposer's own offer). Never errors; see `DiscoveryResult::success`.
    pub fn select_experts(
        &self,
        request: &RoutingRequest,
        reputation: Option<&dyn ReputationLookup>,
    ) -> DiscoveryResult {
        if self.offers.is_empty() {
            tracing::debug!(request_id = %request.id, phase = ?self.phase, "no offers to select from");
            return DiscoveryResult {
                phase: self.phase,
                proposer: None,
                critic: None,
                all_offers: Vec::new(),
            };
        }

        let mut scored: Vec<(usize, f64)> = self
            .offers
            .iter()
            .enumerate()
            .map(|(i, offer)| {
                let rep = reputation
                    .map(|r| r.reputation(&offer.guardian_id))
                    .unwrap_or(DEFAULT_REPUTATION);
                (i, self.score_offer(offer, rep))
            })
            .collect();
        // Stable: ties keep arrival order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let intent = &request.intent;
        let proposer_idx = scored
            .iter()
            .map(|&(i, _)| i)
            .find(|&i| self.offers[i].has_capability(&intent.primary));

        // Exclusion is by position, so a value-equal duplicate of the proposer can still be critic.
        let critic_idx = if intent.secondary.is_empty() {
            None
        } else {
            scored.iter().map(|&(i, _)| i).find(|&i| {
                Some(i) != proposer_idx
                    && intent
                        .secondary
                        .iter()
                        .any(|skill| self.offers[i].has_capability(skill))
            })
        };

        let proposer = proposer_idx.map(|i| self.offers[i].clone());
        let critic = critic_idx.map(|i| self.offers[i].clone());
        tracing::info!(
            request_id = %request.id,
            phase = ?self.phase,
            offers = self.offers.len(),
            proposer = proposer.as_ref().map(|o| o.guardian_id.as_str()),
            critic = critic.as_ref().map(|o| o.guardian_id.as_str()),
            "expert selection"
        );

        DiscoveryResult {
            phase: self.phase,
            proposer,
            critic,
            all_offers: self.offers.clone(),
        }
    }

    /// One-way `Local -> Backbone` transition.
    pub fn escalate_to_backbone(&mut self) {
        if self.phase == DiscoveryPhase::Local {
            tracing::info!("escalating discovery to backbone");
        }
        self.phase = DiscoveryPhase::Backbone;
    }

    pub fn current_phase(&self) -> DiscoveryPhase {
        self.phase
    }

    /// Timeout the host should enforce for the current phase.
    pub fn timeout_ms(&self) -> u64 {
        match self.phase {
            DiscoveryPhase::Local => self.config.local_timeout_ms,
            DiscoveryPhase::Backbone => self.config.backbone_timeout_ms,
        }
    }
}

impl Default for ExpertDiscovery {
    fn default() -> Self {
        Self::new(DiscoveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_payload;
    use crate::protocol::{Bid, Intent, IntentConstraints};

    fn request(primary: &str, secondary: &[&str]) -> RoutingRequest {
        RoutingRequest::new(
            "req_001",
            "!node_moderator",
            Intent::new(primary, secondary.iter().map(|s| s.to_string()).collect(), 0.9),
            IntentConstraints::default(),
            hash_payload("prompt"),
        )
    }

    fn offer(guardian: &str, caps: &[&str], latency: u32) -> ExpertOffer {
        ExpertOffer {
            req_id: "req_001".into(),
            guardian_id: guardian.into(),
            expert_type: "model".into(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            bid: Bid {
                cost: 0.1,
                est_latency_ms: latency,
            },
            signature: String::new(),
        }
    }

    #[test]
    fn initial_phase_and_escalation() {
        let mut d = ExpertDiscovery::default();
        assert_eq!(d.current_phase(), DiscoveryPhase::Local);
        assert_eq!(d.timeout_ms(), 200);
        d.escalate_to_backbone();
        assert_eq!(d.current_phase(), DiscoveryPhase::Backbone);
        assert_eq!(d.timeout_ms(), 2000);
        d.escalate_to_backbone();
        assert_eq!(d.current_phase(), DiscoveryPhase::Backbone);
    }

    #[test]
    fn no_offers_is_failure() {
        let d = ExpertDiscovery::default();
        let r = d.select_experts(&request("code", &["security"]), None);
        assert!(!r.success());
        assert!(r.all_offers.is_empty());
    }

    #[test]
    fn single_matching_offer_is_proposer() {
        let mut d = ExpertDiscovery::default();
        let coder = offer("!node_coder", &["code", "python"], 500);
        d.add_offer(coder.clone());
        let r = d.select_experts(&request("code", &["security"]), None);
        assert!(r.success());
        assert_eq!(r.proposer, Some(coder));
        assert_eq!(r.critic, None);
    }

    #[test]
    fn proposer_and_critic() {
        let mut d = ExpertDiscovery::default();
        let coder = offer("!node_coder", &["code", "python"], 500);
        let auditor = offer("!node_security", &["security", "audit"], 600);
        d.add_offer(coder.clone());
        d.add_offer(auditor.clone());
        let r = d.select_experts(&request("code", &["security"]), None);
        assert_eq!(r.proposer, Some(coder));
        assert_eq!(r.critic, Some(auditor));
        assert_eq!(r.all_offers.len(), 2);
        assert_eq!(r.phase, DiscoveryPhase::Local);
    }

    #[test]
    fn offers_without_primary_capability_fail() {
        let mut d = ExpertDiscovery::default();
        d.add_offer(offer("!node_security", &["security"], 100));
        let r = d.select_experts(&request("code", &["security"]), None);
        assert!(!r.success());
        // The critic search still runs; absence of a proposer is what reports failure.
        assert_eq!(r.all_offers.len(), 1);
    }

    #[test]
    fn no_secondary_means_no_critic() {
        let mut d = ExpertDiscovery::default();
        d.add_offer(offer("!a", &["math"], 100));
        d.add_offer(offer("!b", &["math", "code"], 100));
        let r = d.select_experts(&request("math", &[]), None);
        assert_eq!(r.proposer.unwrap().guardian_id, "!a");
        assert!(r.critic.is_none());
    }

    #[test]
    fn reputation_lookup_changes_ranking() {
        let mut d = ExpertDiscovery::default();
        d.add_offer(offer("!low", &["code"], 500));
        d.add_offer(offer("!high", &["code"], 500));
        let lookup = |id: &str| -> u32 {
            if id == "!high" {
                95
            } else {
                10
            }
        };
        let r = d.select_experts(&request("code", &[]), Some(&lookup));
        assert_eq!(r.proposer.unwrap().guardian_id, "!high");

        // Without a lookup both score equally and arrival order wins.
        let r = d.select_experts(&request("code", &[]), None);
        assert_eq!(r.proposer.unwrap().guardian_id, "!low");
    }

    #[test]
    fn value_equal_duplicate_can_be_critic() {
        let mut d = ExpertDiscovery::default();
        let dup = offer("!twin", &["code", "security"], 300);
        d.add_offer(dup.clone());
        d.add_offer(dup.clone());
        let r = d.select_experts(&request("code", &["security"]), None);
        assert_eq!(r.proposer, Some(dup.clone()));
        assert_eq!(r.critic, Some(dup));
    }

    #[test]
    fn score_reputation_and_latency() {
        let d = ExpertDiscovery::default();
        let o = offer("!n", &["code"], 500);
        assert!(d.score_offer(&o, 90) > d.score_offer(&o, 30));

        let fast = offer("!fast", &["code"], 100);
        let slow = offer("!slow", &["code"], 2000);
        assert!(d.score_offer(&fast, 50) > d.score_offer(&slow, 50));
    }

    #[test]
    fn score_formula() {
        let d = ExpertDiscovery::default();
        // 1000ms saturates; 2000ms halves the latency term.
        let at_1000 = d.score_offer(&offer("!n", &[], 1000), 100);
        assert!((at_1000 - 1.0).abs() < 1e-12);
        let at_2000 = d.score_offer(&offer("!n", &[], 2000), 50);
        assert!((at_2000 - (0.5 * 0.6 + 0.5 * 0.4)).abs() < 1e-12);
        // Reputation above 100 is capped.
        assert_eq!(
            d.score_offer(&offer("!n", &[], 500), 250),
            d.score_offer(&offer("!n", &[], 500), 100)
        );
    }

    #[test]
    fn reset_clears_state() {
        let mut d = ExpertDiscovery::default();
        d.add_offer(offer("!n", &["code"], 500));
        d.escalate_to_backbone();
        d.reset();
        assert_eq!(d.current_phase(), DiscoveryPhase::Local);
        assert!(d.offers().is_empty());
    }

    #[test]
    fn custom_config() {
        let mut d = ExpertDiscovery::new(DiscoveryConfig {
            local_timeout_ms: 100,
            backbone_timeout_ms: 5000,
            reputation_weight: 0.7,
            latency_weight: 0.3,
            min_offers: 2,
        });
        assert_eq!(d.timeout_ms(), 100);
        d.add_offer(offer("!n", &["code"], 500));
        assert!(!d.is_sufficient());
        d.add_offer(offer("!m", &["code"], 500));
        assert!(d.is_sufficient());
        d.escalate_to_backbone();
        assert_eq!(d.timeout_ms(), 5000);
    }
}
