//! Pneuma wire protocol: message types and protocol constants.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Hard cap on debate rounds. A session ends after round 2 regardless of content.
pub const MAX_ROUNDS: u32 = 2;

/// Per-round response timeout. Enforced by the host, never by the core.
pub const TIMEOUT_SECONDS: u64 = 30;

/// Discriminator values carried in the `"type"` field of JSON messages.
pub const ROUTE_REQ: &str = "route_req";
pub const EXPERT_OFFER: &str = "expert_offer";
pub const DEBATE: &str = "debate";

fn default_confidence() -> f64 {
    0.9
}

/// Structured metadata from the gating network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// e.g. "code", "security", "general".
    pub primary: String,
    #[serde(default)]
    pub secondary: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

impl Intent {
    pub fn new(primary: impl Into<String>, secondary: Vec<String>, confidence: f64) -> Self {
        Self {
            primary: primary.into(),
            secondary,
            confidence,
        }
    }

    /// True if `capability` is the primary or one of the secondary intents.
    pub fn mentions(&self, capability: &str) -> bool {
        self.primary == capability || self.secondary.iter().any(|s| s == capability)
    }
}

/// User-tunable routing constraints. Missing wire fields take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConstraints {
    #[serde(rename = "max_latency")]
    pub max_latency_ms: u32,
    pub min_reputation: u8,
    pub cost_cap: f64,
    pub prefer_local: bool,
}

impl Default for IntentConstraints {
    fn default() -> Self {
        Self {
            max_latency_ms: 2000,
            min_reputation: 50,
            cost_cap: 0.5,
            prefer_local: true,
        }
    }
}

/// Broadcast by the Moderator to find experts for a prompt.
/// The prompt itself travels separately (encrypted); `payload_hash` binds the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub id: String,
    /// Moderator node ID, e.g. "!node_a1b2".
    pub origin: String,
    pub intent: Intent,
    #[serde(default)]
    pub constraints: IntentConstraints,
    /// Unix seconds.
    pub timestamp: u64,
    /// Hex SHA-256 of the full prompt.
    pub payload_hash: String,
}

impl RoutingRequest {
    /// Build a request stamped with the current wall-clock time.
    pub fn new(
        id: impl Into<String>,
        origin: impl Into<String>,
        intent: Intent,
        constraints: IntentConstraints,
        payload_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            origin: origin.into(),
            intent,
            constraints,
            timestamp: unix_now(),
            payload_hash: payload_hash.into(),
        }
    }
}

/// Guardian's cost and latency estimate for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    /// Token cost.
    pub cost: f64,
    #[serde(rename = "est_latency")]
    pub est_latency_ms: u32,
}

/// Sent by a Guardian in answer to a `RoutingRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertOffer {
    /// ID of the `RoutingRequest` this answers.
    pub req_id: String,
    pub guardian_id: String,
    /// Model identifier, e.g. "qwen-2.5-coder-7b".
    pub expert_type: String,
    pub capabilities: Vec<String>,
    pub bid: Bid,
    #[serde(default)]
    pub signature: String,
}

impl ExpertOffer {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Metadata attached to debate content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateMetadata {
    pub confidence: f64,
    pub citations: Vec<String>,
}

impl Default for DebateMetadata {
    fn default() -> Self {
        Self {
            confidence: default_confidence(),
            citations: Vec::new(),
        }
    }
}

/// Debate role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Proposer,
    Critic,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Proposer => "proposer",
            Role::Critic => "critic",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One exchange in a debate session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebatePacket {
    pub session_id: String,
    /// 1 or 2. Out-of-range rounds still decode; see `is_valid_round`.
    pub round: u32,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: DebateMetadata,
}

impl DebatePacket {
    pub fn is_valid_round(&self) -> bool {
        (1..=MAX_ROUNDS).contains(&self.round)
    }

    pub fn is_proposer(&self) -> bool {
        self.role == Role::Proposer
    }

    pub fn is_critic(&self) -> bool {
        self.role == Role::Critic
    }
}

/// All JSON protocol messages. `SessionInit` is binary and lives in `session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    RoutingRequest(RoutingRequest),
    ExpertOffer(ExpertOffer),
    Debate(DebatePacket),
}

impl Message {
    /// Wire discriminator for this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RoutingRequest(_) => ROUTE_REQ,
            Message::ExpertOffer(_) => EXPERT_OFFER,
            Message::Debate(_) => DEBATE,
        }
    }
}

impl From<RoutingRequest> for Message {
    fn from(m: RoutingRequest) -> Self {
        Message::RoutingRequest(m)
    }
}

impl From<ExpertOffer> for Message {
    fn from(m: ExpertOffer) -> Self {
        Message::ExpertOffer(m)
    }
}

impl From<DebatePacket> for Message {
    fn from(m: DebatePacket) -> Self {
        Message::Debate(m)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(round: u32, role: Role) -> DebatePacket {
        DebatePacket {
            session_id: "sess".into(),
            round,
            role,
            content: "text".into(),
            metadata: DebateMetadata::default(),
        }
    }

    #[test]
    fn round_validity() {
        assert!(!packet(0, Role::Proposer).is_valid_round());
        assert!(packet(1, Role::Proposer).is_valid_round());
        assert!(packet(2, Role::Critic).is_valid_round());
        assert!(!packet(3, Role::Critic).is_valid_round());
    }

    #[test]
    fn role_predicates() {
        let p = packet(1, Role::Proposer);
        assert!(p.is_proposer());
        assert!(!p.is_critic());
        let c = packet(2, Role::Critic);
        assert!(c.is_critic());
        assert_eq!(c.role.to_string(), "critic");
    }

    #[test]
    fn constraint_defaults() {
        let c = IntentConstraints::default();
        assert_eq!(c.max_latency_ms, 2000);
        assert_eq!(c.min_reputation, 50);
        assert_eq!(c.cost_cap, 0.5);
        assert!(c.prefer_local);
    }

    #[test]
    fn intent_mentions() {
        let intent = Intent::new("code", vec!["security".into()], 0.9);
        assert!(intent.mentions("code"));
        assert!(intent.mentions("security"));
        assert!(!intent.mentions("math"));
    }

    #[test]
    fn message_kind() {
        let m: Message = packet(1, Role::Proposer).into();
        assert_eq!(m.kind(), DEBATE);
    }
}
