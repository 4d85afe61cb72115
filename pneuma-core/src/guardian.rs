//! Guardian side: answer routing requests with offers and turn session
//! invitations into debate assignments for the local model.

use std::collections::VecDeque;

use serde::Deserialize;

use crate::envelope::Envelope;
use crate::integrity::verify_payload;
use crate::protocol::{Bid, DebateMetadata, DebatePacket, ExpertOffer, Role, RoutingRequest};
use crate::session::{fit_field, SessionInit, REQUEST_ID_LEN};

/// Requests awaiting a `SessionInit`, and critics awaiting round 1. Oldest are dropped first.
const MAX_PENDING: usize = 64;

/// What this node's model can do and what it charges.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardianProfile {
    /// Filled from the node identity when omitted.
    #[serde(default)]
    pub node_id: String,
    pub expert_type: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub cost: f64,
    pub est_latency_ms: u32,
    /// Assignments the local model works on at once. No offers while saturated.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    2
}

impl GuardianProfile {
    fn matches(&self, request: &RoutingRequest) -> bool {
        self.capabilities.iter().any(|c| request.intent.mentions(c))
    }
}

/// Work handed to the local model: answer `prompt` for `round`, optionally
/// critiquing `prior` (the proposer's round-1 content).
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub session_id: String,
    pub round: u32,
    pub role: Role,
    pub prompt: String,
    pub prior: Option<String>,
}

impl Assignment {
    pub fn respond(
        &self,
        content: impl Into<String>,
        confidence: f64,
        citations: Vec<String>,
    ) -> DebatePacket {
        DebatePacket {
            session_id: self.session_id.clone(),
            round: self.round,
            role: self.role,
            content: content.into(),
            metadata: DebateMetadata {
                confidence: confidence.clamp(0.0, 1.0),
                citations,
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuardianError {
    #[error("session {0:?} refers to a request this node never offered on")]
    UnknownRequest(String),
    #[error("prompt failed to decrypt")]
    Decrypt,
    #[error("prompt does not match the announced payload hash")]
    IntegrityMismatch,
}

#[derive(Debug, Clone)]
struct ParkedCritic {
    session_id: String,
    prompt: String,
}

/// Offer/assignment state for one Guardian node. Single owner.
#[derive(Debug)]
pub struct Guardian {
    profile: GuardianProfile,
    pending: VecDeque<RoutingRequest>,
    parked: VecDeque<ParkedCritic>,
    in_flight: usize,
}

impl Guardian {
    pub fn new(profile: GuardianProfile) -> Self {
        Self {
            profile,
            pending: VecDeque::new(),
            parked: VecDeque::new(),
            in_flight: 0,
        }
    }

    pub fn profile(&self) -> &GuardianProfile {
        &self.profile
    }

    pub fn node_id(&self) -> &str {
        &self.profile.node_id
    }

    /// Assignments handed out and not yet released.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_saturated(&self) -> bool {
        self.in_flight >= self.profile.max_concurrent
    }

    /// The host finished an assignment: reply sent or generation failed.
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    fn acquire(&mut self, session_id: &str) -> bool {
        if self.is_saturated() {
            tracing::warn!(%session_id, in_flight = self.in_flight, "at capacity, declining assignment");
            return false;
        }
        self.in_flight += 1;
        true
    }

    /// Build an offer if this node can serve `request` within its constraints.
    /// Each request id gets at most one offer.
    pub fn offer_for(&mut self, request: &RoutingRequest) -> Option<ExpertOffer> {
        if request.origin == self.profile.node_id {
            return None;
        }
        if self.pending.iter().any(|r| r.id == request.id) {
            return None;
        }
        if self.is_saturated() {
            tracing::debug!(request_id = %request.id, in_flight = self.in_flight, "at capacity, not offering");
            return None;
        }
        let c = &request.constraints;
        if !self.profile.matches(request)
            || self.profile.cost > c.cost_cap
            || self.profile.est_latency_ms > c.max_latency_ms
        {
            tracing::debug!(request_id = %request.id, intent = %request.intent.primary, "not offering");
            return None;
        }

        if self.pending.len() == MAX_PENDING {
            self.pending.pop_front();
        }
        self.pending.push_back(request.clone());
        tracing::info!(request_id = %request.id, intent = %request.intent.primary, "offering");

        Some(ExpertOffer {
            req_id: request.id.clone(),
            guardian_id: self.profile.node_id.clone(),
            expert_type: self.profile.expert_type.clone(),
            capabilities: self.profile.capabilities.clone(),
            bid: Bid {
                cost: self.profile.cost,
                est_latency_ms: self.profile.est_latency_ms,
            },
            signature: String::new(),
        })
    }

    /// Proposer: returns the round-1 assignment. Critic: parks the prompt and
    /// returns `None` until the proposer's packet arrives. Sessions not naming
    /// this node are ignored, and so are assignments arriving at capacity.
    /// Every returned assignment must be handed back with `release`.
    pub fn on_session_init(
        &mut self,
        init: &SessionInit,
        envelope: &Envelope,
    ) -> Result<Option<Assignment>, GuardianError> {
        let Some(role) = init.role_of(&self.profile.node_id) else {
            return Ok(None);
        };
        let idx = self
            .pending
            .iter()
            .position(|r| fit_field(&r.id, REQUEST_ID_LEN) == init.request_id)
            .ok_or_else(|| GuardianError::UnknownRequest(init.request_id.clone()))?;

        let prompt = envelope
            .decrypt_json(&init.encrypted_prompt, init.request_id.as_bytes())
            .ok_or(GuardianError::Decrypt)?;
        if !verify_payload(&prompt, &self.pending[idx].payload_hash) {
            return Err(GuardianError::IntegrityMismatch);
        }
        self.pending.remove(idx);
        tracing::info!(session_id = %init.session_id, %role, "joined debate");

        match role {
            Role::Proposer if !self.acquire(&init.session_id) => Ok(None),
            Role::Proposer => Ok(Some(Assignment {
                session_id: init.session_id.clone(),
                round: 1,
                role,
                prompt,
                prior: None,
            })),
            Role::Critic => {
                if self.parked.len() == MAX_PENDING {
                    self.parked.pop_front();
                }
                self.parked.push_back(ParkedCritic {
                    session_id: init.session_id.clone(),
                    prompt,
                });
                Ok(None)
            }
        }
    }

    /// Wake a parked critic on the proposer's round-1 packet.
    pub fn on_debate_packet(&mut self, packet: &DebatePacket) -> Option<Assignment> {
        if packet.round != 1 || !packet.is_proposer() {
            return None;
        }
        let idx = self
            .parked
            .iter()
            .position(|p| p.session_id == packet.session_id)?;
        let parked = self.parked.remove(idx)?;
        if !self.acquire(&packet.session_id) {
            return None;
        }
        Some(Assignment {
            session_id: packet.session_id.clone(),
            round: 2,
            role: Role::Critic,
            prompt: parked.prompt,
            prior: Some(packet.content.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_payload;
    use crate::protocol::{Intent, IntentConstraints};

    const PROMPT: &str = "How do I fix an SQL injection in my login code?";

    fn profile(node_id: &str, caps: &[&str]) -> GuardianProfile {
        GuardianProfile {
            node_id: node_id.into(),
            expert_type: "qwen-2.5-coder-7b".into(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            cost: 0.1,
            est_latency_ms: 500,
            max_concurrent: 2,
        }
    }

    fn request() -> RoutingRequest {
        RoutingRequest::new(
            "req_0123456789ab",
            "!moderator",
            Intent::new("code", vec!["security".into()], 0.9),
            IntentConstraints::default(),
            hash_payload(PROMPT),
        )
    }

    fn init(envelope: &Envelope, critic: Option<&str>) -> SessionInit {
        SessionInit {
            session_id: SessionInit::new_session_id(),
            request_id: "req_0123456789ab".into(),
            proposer_id: "!coder".into(),
            critic_id: critic.map(str::to_owned),
            encrypted_prompt: envelope
                .encrypt_json(PROMPT, b"req_0123456789ab")
                .unwrap(),
        }
    }

    #[test]
    fn offers_on_primary_or_secondary_match() {
        let mut coder = Guardian::new(profile("!coder", &["code", "python"]));
        let offer = coder.offer_for(&request()).unwrap();
        assert_eq!(offer.req_id, "req_0123456789ab");
        assert_eq!(offer.guardian_id, "!coder");
        assert_eq!(offer.bid.est_latency_ms, 500);

        let mut auditor = Guardian::new(profile("!auditor", &["security"]));
        assert!(auditor.offer_for(&request()).is_some());

        let mut poet = Guardian::new(profile("!poet", &["creative"]));
        assert!(poet.offer_for(&request()).is_none());
    }

    #[test]
    fn respects_constraints_and_dedups() {
        let mut g = Guardian::new(GuardianProfile {
            est_latency_ms: 5000,
            ..profile("!slow", &["code"])
        });
        assert!(g.offer_for(&request()).is_none());

        let mut g = Guardian::new(GuardianProfile {
            cost: 0.9,
            ..profile("!pricey", &["code"])
        });
        assert!(g.offer_for(&request()).is_none());

        let mut g = Guardian::new(profile("!coder", &["code"]));
        assert!(g.offer_for(&request()).is_some());
        assert!(g.offer_for(&request()).is_none());

        let mut own = Guardian::new(profile("!moderator", &["code"]));
        assert!(own.offer_for(&request()).is_none());
    }

    #[test]
    fn proposer_gets_round_one() {
        let env = Envelope::new(&[3u8; 32]).unwrap();
        let mut g = Guardian::new(profile("!coder", &["code"]));
        g.offer_for(&request()).unwrap();
        let init = init(&env, Some("!auditor"));
        let job = g.on_session_init(&init, &env).unwrap().unwrap();
        assert_eq!(job.round, 1);
        assert_eq!(job.role, Role::Proposer);
        assert_eq!(job.prompt, PROMPT);
        assert!(job.prior.is_none());

        let packet = job.respond("Use parameterized queries.", 1.4, vec!["OWASP".into()]);
        assert_eq!(packet.session_id, init.session_id);
        assert_eq!(packet.round, 1);
        assert!(packet.is_proposer());
        assert_eq!(packet.metadata.confidence, 1.0);
    }

    #[test]
    fn critic_waits_for_proposer() {
        let env = Envelope::new(&[3u8; 32]).unwrap();
        let mut g = Guardian::new(profile("!auditor", &["security"]));
        g.offer_for(&request()).unwrap();
        let init = init(&env, Some("!auditor"));
        assert_eq!(g.on_session_init(&init, &env).unwrap(), None);

        let opening = DebatePacket {
            session_id: init.session_id.clone(),
            round: 1,
            role: Role::Proposer,
            content: "Use parameterized queries.".into(),
            metadata: DebateMetadata::default(),
        };
        let job = g.on_debate_packet(&opening).unwrap();
        assert_eq!(job.round, 2);
        assert_eq!(job.role, Role::Critic);
        assert_eq!(job.prompt, PROMPT);
        assert_eq!(job.prior.as_deref(), Some("Use parameterized queries."));
        assert!(g.on_debate_packet(&opening).is_none());
    }

    #[test]
    fn ignores_foreign_sessions() {
        let env = Envelope::new(&[3u8; 32]).unwrap();
        let mut g = Guardian::new(profile("!bystander", &["code"]));
        g.offer_for(&request()).unwrap();
        assert_eq!(g.on_session_init(&init(&env, None), &env).unwrap(), None);
    }

    #[test]
    fn rejects_bad_prompt() {
        let env = Envelope::new(&[3u8; 32]).unwrap();
        let mut g = Guardian::new(profile("!coder", &["code"]));

        assert!(matches!(
            g.on_session_init(&init(&env, None), &env),
            Err(GuardianError::UnknownRequest(_))
        ));

        g.offer_for(&request()).unwrap();
        let other_key = Envelope::new(&[4u8; 32]).unwrap();
        assert!(matches!(
            g.on_session_init(&init(&env, None), &other_key),
            Err(GuardianError::Decrypt)
        ));

        let mut tampered = init(&env, None);
        tampered.encrypted_prompt = env
            .encrypt_json("something else", b"req_0123456789ab")
            .unwrap();
        assert!(matches!(
            g.on_session_init(&tampered, &env),
            Err(GuardianError::IntegrityMismatch)
        ));
    }

    #[test]
    fn profile_from_toml() {
        let p: GuardianProfile = toml::from_str(
            r#"
            expert_type = "llama-3-8b"
            capabilities = ["code", "math"]
            est_latency_ms = 800
            "#,
        )
        .unwrap();
        assert!(p.node_id.is_empty());
        assert_eq!(p.cost, 0.0);
        assert_eq!(p.capabilities, vec!["code", "math"]);
        assert_eq!(p.max_concurrent, 2);
    }

    fn numbered_request(n: usize) -> RoutingRequest {
        RoutingRequest {
            id: format!("req_{n:012}"),
            ..request()
        }
    }

    fn numbered_init(envelope: &Envelope, n: usize) -> SessionInit {
        let id = format!("req_{n:012}");
        SessionInit {
            session_id: SessionInit::new_session_id(),
            request_id: id.clone(),
            proposer_id: "!coder".into(),
            critic_id: None,
            encrypted_prompt: envelope.encrypt_json(PROMPT, id.as_bytes()).unwrap(),
        }
    }

    #[test]
    fn no_offers_at_capacity() {
        let env = Envelope::new(&[3u8; 32]).unwrap();
        let mut g = Guardian::new(GuardianProfile {
            max_concurrent: 1,
            ..profile("!coder", &["code"])
        });
        g.offer_for(&numbered_request(1)).unwrap();
        g.offer_for(&numbered_request(2)).unwrap();

        assert!(g.on_session_init(&numbered_init(&env, 1), &env).unwrap().is_some());
        assert_eq!(g.in_flight(), 1);
        assert!(g.is_saturated());
        assert!(g.offer_for(&numbered_request(3)).is_none());
        // Accepted earlier, but the model is busy now.
        assert_eq!(g.on_session_init(&numbered_init(&env, 2), &env).unwrap(), None);
        assert_eq!(g.in_flight(), 1);

        g.release();
        assert_eq!(g.in_flight(), 0);
        assert!(g.offer_for(&numbered_request(3)).is_some());
        g.release();
        assert_eq!(g.in_flight(), 0);
    }

    #[test]
    fn woken_critic_counts_against_capacity() {
        let env = Envelope::new(&[3u8; 32]).unwrap();
        let mut g = Guardian::new(GuardianProfile {
            max_concurrent: 1,
            ..profile("!auditor", &["security"])
        });
        g.offer_for(&request()).unwrap();
        let init = init(&env, Some("!auditor"));
        assert_eq!(g.on_session_init(&init, &env).unwrap(), None);
        assert_eq!(g.in_flight(), 0);

        let opening = DebatePacket {
            session_id: init.session_id.clone(),
            round: 1,
            role: Role::Proposer,
            content: "Use parameterized queries.".into(),
            metadata: DebateMetadata::default(),
        };
        assert!(g.on_debate_packet(&opening).is_some());
        assert!(g.is_saturated());
        assert!(g.offer_for(&numbered_request(9)).is_none());
    }
}
