//! Host-driven Moderator: the host passes user input, received bytes and timer
//! expiries; the moderator returns actions. No I/O, no clock.

use std::time::Duration;

use crate::discovery::{
    DiscoveryConfig, DiscoveryPhase, DiscoveryResult, ExpertDiscovery, ReputationLookup,
};
use crate::envelope::{Envelope, EnvelopeError};
use crate::protocol::{
    DebatePacket, IntentConstraints, Message, RoutingRequest, TIMEOUT_SECONDS,
};
use crate::router::IntentClassifier;
use crate::session::{fit_field, DebateSession, SessionInit, SessionStatus, REQUEST_ID_LEN};
use crate::wire::{self, EncodeError, FrameEncodeError};

/// Network layer an action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Layer 2: local mesh, JSON messages.
    Mesh,
    /// Layer 3: backbone, length-prefixed frames.
    Backbone,
}

impl From<DiscoveryPhase> for Layer {
    fn from(phase: DiscoveryPhase) -> Self {
        match phase {
            DiscoveryPhase::Local => Layer::Mesh,
            DiscoveryPhase::Backbone => Layer::Backbone,
        }
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Already encoded for `layer`.
    Broadcast { layer: Layer, bytes: Vec<u8> },
    /// Binary `SessionInit` for the selected experts.
    SendSessionInit {
        layer: Layer,
        recipients: Vec<String>,
        bytes: Vec<u8>,
    },
    /// Call `on_timeout` after this long, replacing any earlier deadline.
    ArmTimer(Duration),
    DiscoveryFailed { request_id: String },
    DebateComplete {
        session_id: String,
        request_id: String,
        transcript: Vec<DebatePacket>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ModeratorError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

struct ActiveRequest {
    request: RoutingRequest,
    prompt: String,
    discovery: ExpertDiscovery,
    session: Option<DebateSession>,
}

pub struct Moderator {
    node_id: String,
    classifier: IntentClassifier,
    envelope: Envelope,
    discovery_config: DiscoveryConfig,
    reputation: Option<Box<dyn ReputationLookup + Send + Sync>>,
    active: Option<ActiveRequest>,
}

fn round_timeout() -> Duration {
    Duration::from_secs(TIMEOUT_SECONDS)
}

fn encode_for(layer: Layer, msg: &Message) -> Result<Vec<u8>, ModeratorError> {
    Ok(match layer {
        Layer::Mesh => wire::encode_message(msg)?,
        Layer::Backbone => wire::encode_frame(msg)?,
    })
}

impl Moderator {
    pub fn new(node_id: impl Into<String>, envelope: Envelope, discovery_config: DiscoveryConfig) -> Self {
        Self {
            node_id: node_id.into(),
            classifier: IntentClassifier::new(),
            envelope,
            discovery_config,
            reputation: None,
            active: None,
        }
    }

    pub fn with_reputation(mut self, lookup: impl ReputationLookup + Send + Sync + 'static) -> Self {
        self.reputation = Some(Box::new(lookup));
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn active_request_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.request.id.as_str())
    }

    /// Start routing `text`. Any request still in flight is abandoned.
    pub fn submit(
        &mut self,
        text: &str,
        request_id: &str,
        constraints: Option<IntentConstraints>,
    ) -> Result<Vec<OutboundAction>, ModeratorError> {
        if let Some(old) = self.active.take() {
            tracing::info!(request_id = %old.request.id, "superseded by new request");
        }
        let request =
            self.classifier
                .create_routing_request(text, &self.node_id, request_id, constraints);
        let mut discovery = ExpertDiscovery::new(self.discovery_config.clone());
        if !request.constraints.prefer_local {
            discovery.escalate_to_backbone();
        }

        let layer = Layer::from(discovery.current_phase());
        let bytes = encode_for(layer, &Message::RoutingRequest(request.clone()))?;
        let timer = Duration::from_millis(discovery.timeout_ms());
        tracing::info!(request_id, intent = %request.intent.primary, ?layer, "broadcasting routing request");

        self.active = Some(ActiveRequest {
            request,
            prompt: text.to_owned(),
            discovery,
            session: None,
        });
        Ok(vec![
            OutboundAction::Broadcast { layer, bytes },
            OutboundAction::ArmTimer(timer),
        ])
    }

    /// JSON message from the mesh.
    pub fn on_message(&mut self, bytes: &[u8]) -> Vec<OutboundAction> {
        match wire::parse(bytes) {
            Some(msg) => self.handle(msg),
            None => Vec::new(),
        }
    }

    /// Frame from the backbone.
    pub fn on_backbone_frame(&mut self, bytes: &[u8]) -> Vec<OutboundAction> {
        match wire::decode_frame(bytes) {
            Ok((msg, _)) => self.handle(msg),
            Err(e) => {
                tracing::debug!(error = %e, "dropping backbone frame");
                Vec::new()
            }
        }
    }

    fn handle(&mut self, msg: Message) -> Vec<OutboundAction> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        match msg {
            Message::ExpertOffer(offer) => {
                if active.session.is_none() && offer.req_id == active.request.id {
                    tracing::debug!(guardian = %offer.guardian_id, "offer received");
                    active.discovery.add_offer(offer);
                }
                Vec::new()
            }
            Message::Debate(packet) => {
                let Some(session) = active.session.as_mut() else {
                    return Vec::new();
                };
                if packet.session_id != session.session_id() {
                    return Vec::new();
                }
                match session.record(packet) {
                    Ok(SessionStatus::Complete) => self.finish().into_iter().collect(),
                    Ok(SessionStatus::AwaitingRound(round)) => {
                        tracing::debug!(round, "awaiting next round");
                        vec![OutboundAction::ArmTimer(round_timeout())]
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping debate packet");
                        Vec::new()
                    }
                }
            }
            Message::RoutingRequest(_) => Vec::new(),
        }
    }

    /// The most recently armed timer fired.
    pub fn on_timeout(&mut self) -> Result<Vec<OutboundAction>, ModeratorError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(Vec::new());
        };
        if let Some(session) = active.session.as_mut() {
            tracing::info!(session_id = %session.session_id(), "debate round timed out");
            session.expire();
            return Ok(self.finish().into_iter().collect());
        }

        if active.discovery.is_sufficient() {
            let result = active
                .discovery
                .select_experts(&active.request, self.reputation.as_deref().map(|r| r as &dyn ReputationLookup));
            if result.success() {
                return self.start_session(result);
            }
        }

        if active.discovery.current_phase() == DiscoveryPhase::Local {
            active.discovery.escalate_to_backbone();
            let bytes = encode_for(
                Layer::Backbone,
                &Message::RoutingRequest(active.request.clone()),
            )?;
            let timer = Duration::from_millis(active.discovery.timeout_ms());
            return Ok(vec![
                OutboundAction::Broadcast {
                    layer: Layer::Backbone,
                    bytes,
                },
                OutboundAction::ArmTimer(timer),
            ]);
        }

        let request_id = active.request.id.clone();
        tracing::info!(%request_id, "discovery exhausted");
        self.active = None;
        Ok(vec![OutboundAction::DiscoveryFailed { request_id }])
    }

    fn start_session(&mut self, result: DiscoveryResult) -> Result<Vec<OutboundAction>, ModeratorError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(Vec::new());
        };
        let Some(proposer) = result.proposer else {
            return Ok(Vec::new());
        };
        let aad = fit_field(&active.request.id, REQUEST_ID_LEN);
        let init = SessionInit {
            session_id: SessionInit::new_session_id(),
            request_id: active.request.id.clone(),
            proposer_id: proposer.guardian_id,
            critic_id: result.critic.map(|c| c.guardian_id),
            encrypted_prompt: self.envelope.encrypt_json(&active.prompt, aad.as_bytes())?,
        };
        let recipients: Vec<String> = std::iter::once(init.proposer_id.clone())
            .chain(init.critic_id.clone())
            .collect();
        tracing::info!(session_id = %init.session_id, ?recipients, "opening debate session");

        let bytes = init.to_bytes();
        active.session = Some(DebateSession::from_init(&init));
        Ok(vec![
            OutboundAction::SendSessionInit {
                layer: Layer::from(result.phase),
                recipients,
                bytes,
            },
            OutboundAction::ArmTimer(round_timeout()),
        ])
    }

    fn finish(&mut self) -> Option<OutboundAction> {
        let active = self.active.take()?;
        let session = active.session?;
        let session_id = session.session_id().to_owned();
        let request_id = active.request.id;
        let transcript = session.into_transcript();
        tracing::info!(%session_id, rounds = transcript.len(), "debate complete");
        Some(OutboundAction::DebateComplete {
            session_id,
            request_id,
            transcript,
        })
    }

    /// Drop all per-request state. Experts are not notified.
    pub fn cancel(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::info!(request_id = %active.request.id, "request cancelled");
        }
    }
}
