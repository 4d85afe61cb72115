//! Role loops: drive the core state machines from stdin, the mesh socket and timers.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use pneuma_core::session::{fit_field, REQUEST_ID_LEN};
use pneuma_core::wire;
use pneuma_core::{
    Assignment, DebatePacket, Envelope, Guardian, Layer, Message, Moderator, OutboundAction,
    SessionInit,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cortex::Cortex;
use crate::mesh::{Datagram, Mesh};

/// Confidence reported with generated debate content.
const RESPONSE_CONFIDENCE: f64 = 0.9;
/// Offer layers remembered per request.
const MAX_OFFER_LAYERS: usize = 64;

/// `req_` + 12 hex chars: exactly the SessionInit request field width.
pub fn new_request_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}", &id[..12])
}

/// `None` (logged) when the message cannot go out on `layer`, e.g. a frame over the size cap.
fn encode_for(layer: Layer, msg: &Message) -> Option<Datagram> {
    let encoded = match layer {
        Layer::Mesh => wire::encode_message(msg).map(Datagram::Json).map_err(|e| e.to_string()),
        Layer::Backbone => wire::encode_frame(msg).map(Datagram::Frame).map_err(|e| e.to_string()),
    };
    match encoded {
        Ok(datagram) => Some(datagram),
        Err(error) => {
            tracing::warn!(%error, ?layer, "dropping outgoing message");
            None
        }
    }
}

fn decode_datagram(datagram: &Datagram) -> Option<(Layer, Message)> {
    match datagram {
        Datagram::Json(b) => wire::parse(b).map(|m| (Layer::Mesh, m)),
        Datagram::Frame(b) => match wire::decode_frame(b) {
            Ok((m, _)) => Some((Layer::Backbone, m)),
            Err(e) => {
                tracing::debug!(error = %e, "dropping backbone frame");
                None
            }
        },
        Datagram::SessionInit(_) => None,
    }
}

async fn send(mesh: &Mesh, layer: Layer, datagram: Datagram) {
    if let Err(e) = mesh.send(layer, &datagram).await {
        tracing::warn!(error = %e, ?layer, "mesh send failed");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Read prompts from stdin, route each one, print the debate outcome.
pub async fn run_moderator(mut moderator: Moderator, mesh: Mesh) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut deadline: Option<Instant> = None;
    tracing::info!(node_id = %moderator.node_id(), "moderator ready; reading prompts from stdin");

    loop {
        let actions = tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(text) if !text.trim().is_empty() => {
                    moderator.submit(text.trim(), &new_request_id(), None)?
                }
                Some(_) => Vec::new(),
                None => {
                    stdin_open = false;
                    Vec::new()
                }
            },
            received = mesh.recv() => {
                let (datagram, _) = received?;
                match datagram {
                    Datagram::Json(b) => moderator.on_message(&b),
                    Datagram::Frame(b) => moderator.on_backbone_frame(&b),
                    Datagram::SessionInit(_) => Vec::new(),
                }
            }
            _ = sleep_until(deadline) => {
                deadline = None;
                moderator.on_timeout()?
            }
        };

        for action in actions {
            match action {
                OutboundAction::Broadcast { layer, bytes } => {
                    send(&mesh, layer, Datagram::message(layer, bytes)).await;
                }
                OutboundAction::SendSessionInit {
                    layer,
                    recipients,
                    bytes,
                } => {
                    tracing::debug!(?recipients, "sending session init");
                    send(&mesh, layer, Datagram::SessionInit(bytes)).await;
                }
                OutboundAction::ArmTimer(after) => deadline = Some(Instant::now() + after),
                OutboundAction::DiscoveryFailed { request_id } => {
                    tracing::warn!(%request_id, "no experts available");
                    println!("[{request_id}] no experts available");
                }
                OutboundAction::DebateComplete {
                    request_id,
                    transcript,
                    ..
                } => match transcript.last() {
                    Some(last) => println!("[{request_id}] {}: {}", last.role, last.content),
                    None => println!("[{request_id}] experts did not respond"),
                },
            }
        }
    }
}

/// What the guardian loop should do next.
#[derive(Debug)]
enum Work {
    Send(Layer, Datagram),
    Generate(Layer, Assignment),
}

/// Guardian state plus the layer each offer went out on, so answers follow the request.
struct GuardianNode {
    guardian: Guardian,
    envelope: Envelope,
    offer_layers: VecDeque<(String, Layer)>,
}

impl GuardianNode {
    fn new(guardian: Guardian, envelope: Envelope) -> Self {
        Self {
            guardian,
            envelope,
            offer_layers: VecDeque::new(),
        }
    }

    fn offer_layer(&self, request_id: &str) -> Layer {
        self.offer_layers
            .iter()
            .find(|(id, _)| fit_field(id, REQUEST_ID_LEN) == request_id)
            .map_or(Layer::Mesh, |&(_, layer)| layer)
    }

    fn on_datagram(&mut self, datagram: Datagram) -> Vec<Work> {
        if let Datagram::SessionInit(bytes) = &datagram {
            let init = match SessionInit::from_bytes(bytes) {
                Ok(init) => init,
                Err(e) => {
                    tracing::debug!(error = %e, "dropping session init");
                    return Vec::new();
                }
            };
            return match self.guardian.on_session_init(&init, &self.envelope) {
                Ok(Some(assignment)) => {
                    vec![Work::Generate(self.offer_layer(&init.request_id), assignment)]
                }
                Ok(None) => Vec::new(),
                Err(e) => {
                    tracing::warn!(error = %e, session_id = %init.session_id, "rejecting session");
                    Vec::new()
                }
            };
        }

        let Some((layer, msg)) = decode_datagram(&datagram) else {
            return Vec::new();
        };
        match msg {
            Message::RoutingRequest(request) => {
                let Some(offer) = self.guardian.offer_for(&request) else {
                    return Vec::new();
                };
                let Some(datagram) = encode_for(layer, &offer.into()) else {
                    return Vec::new();
                };
                if self.offer_layers.len() == MAX_OFFER_LAYERS {
                    self.offer_layers.pop_front();
                }
                self.offer_layers.push_back((request.id, layer));
                vec![Work::Send(layer, datagram)]
            }
            Message::Debate(packet) => self
                .guardian
                .on_debate_packet(&packet)
                .map(|a| Work::Generate(layer, a))
                .into_iter()
                .collect(),
            Message::ExpertOffer(_) => Vec::new(),
        }
    }

    /// A spawned generation finished; `packet` is `None` when it failed.
    fn on_generated(&mut self, layer: Layer, packet: Option<DebatePacket>) -> Vec<Work> {
        self.guardian.release();
        let Some(packet) = packet else {
            return Vec::new();
        };
        tracing::info!(session_id = %packet.session_id, round = packet.round, "sending debate response");
        encode_for(layer, &packet.into())
            .map(|datagram| Work::Send(layer, datagram))
            .into_iter()
            .collect()
    }
}

type Generated = (Layer, Option<DebatePacket>);

fn spawn_generation(
    cortex: Arc<dyn Cortex>,
    layer: Layer,
    assignment: Assignment,
    done: mpsc::UnboundedSender<Generated>,
) {
    tokio::spawn(async move {
        let packet = match cortex.generate(&assignment).await {
            Ok(content) => Some(assignment.respond(content, RESPONSE_CONFIDENCE, Vec::new())),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    session_id = %assignment.session_id,
                    round = assignment.round,
                    "generation failed"
                );
                None
            }
        };
        let _ = done.send((layer, packet));
    });
}

/// Answer routing requests and debate assignments with the local cortex.
pub async fn run_guardian(
    guardian: Guardian,
    envelope: Envelope,
    mesh: Mesh,
    cortex: Arc<dyn Cortex>,
) -> Result<()> {
    tracing::info!(
        node_id = %guardian.node_id(),
        capabilities = ?guardian.profile().capabilities,
        "guardian ready"
    );
    let mut node = GuardianNode::new(guardian, envelope);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Generated>();

    loop {
        let work = tokio::select! {
            received = mesh.recv() => {
                let (datagram, _) = received?;
                node.on_datagram(datagram)
            }
            Some((layer, packet)) = done_rx.recv() => node.on_generated(layer, packet),
        };

        for item in work {
            match item {
                Work::Send(layer, datagram) => send(&mesh, layer, datagram).await,
                Work::Generate(layer, assignment) => {
                    spawn_generation(cortex.clone(), layer, assignment, done_tx.clone())
                }
            }
        }
    }
}
