//! Debate sessions: the binary `SessionInit` that opens one and the tracker
//! that enforces the round cap while it runs.

use crate::protocol::{DebatePacket, Role, MAX_ROUNDS};
use crate::wire::DecodeError;

pub const SESSION_ID_LEN: usize = 32;
pub const REQUEST_ID_LEN: usize = 16;
pub const NODE_ID_LEN: usize = 16;
/// session_id + request_id + proposer_id + critic_id.
pub const HEADER_LEN: usize = SESSION_ID_LEN + REQUEST_ID_LEN + 2 * NODE_ID_LEN;

/// Longest prefix of `s` that fits in `width` bytes without splitting a character,
/// minus trailing NULs (they are indistinguishable from padding).
/// This is what a fixed-width header field carries for `s`.
pub fn fit_field(s: &str, width: usize) -> &str {
    let mut end = s.len().min(width);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].trim_end_matches('\0')
}

fn put_field(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = fit_field(value, width).as_bytes();
    out.extend_from_slice(bytes);
    out.resize(out.len() + width - bytes.len(), 0);
}

fn read_field(raw: &[u8], name: &'static str) -> Result<String, DecodeError> {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    std::str::from_utf8(&raw[..end])
        .map(str::to_owned)
        .map_err(|_| DecodeError::Utf8(name))
}

/// Sent once after expert selection. Carries the encrypted prompt to the chosen Guardians.
///
/// Header fields hold `fit_field` of each id: over-long ids are cut and trailing
/// NULs do not survive `from_bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInit {
    pub session_id: String,
    pub request_id: String,
    pub proposer_id: String,
    pub critic_id: Option<String>,
    /// AEAD blob (see `envelope`).
    pub encrypted_prompt: Vec<u8>,
}

impl SessionInit {
    /// Fresh session ID: 32 hex chars, exactly the header width.
    pub fn new_session_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// 80-byte header (each field UTF-8, truncated and zero-padded) followed by the blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.encrypted_prompt.len());
        put_field(&mut out, &self.session_id, SESSION_ID_LEN);
        put_field(&mut out, &self.request_id, REQUEST_ID_LEN);
        put_field(&mut out, &self.proposer_id, NODE_ID_LEN);
        put_field(&mut out, self.critic_id.as_deref().unwrap_or(""), NODE_ID_LEN);
        out.extend_from_slice(&self.encrypted_prompt);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Truncated(bytes.len()));
        }
        let (session, rest) = bytes.split_at(SESSION_ID_LEN);
        let (request, rest) = rest.split_at(REQUEST_ID_LEN);
        let (proposer, rest) = rest.split_at(NODE_ID_LEN);
        let (critic, prompt) = rest.split_at(NODE_ID_LEN);

        let session_id = read_field(session, "session_id")?;
        let proposer_id = read_field(proposer, "proposer_id")?;
        if session_id.is_empty() {
            return Err(DecodeError::Invalid("session_id"));
        }
        if proposer_id.is_empty() {
            return Err(DecodeError::Invalid("proposer_id"));
        }
        let critic_id = read_field(critic, "critic_id")?;
        Ok(Self {
            session_id,
            request_id: read_field(request, "request_id")?,
            proposer_id,
            critic_id: (!critic_id.is_empty()).then_some(critic_id),
            encrypted_prompt: prompt.to_vec(),
        })
    }

    /// True if this session names `node_id` (compared at header width) as proposer or critic.
    pub fn role_of(&self, node_id: &str) -> Option<Role> {
        let me = fit_field(node_id, NODE_ID_LEN);
        if self.proposer_id == me {
            Some(Role::Proposer)
        } else if self.critic_id.as_deref() == Some(me) {
            Some(Role::Critic)
        } else {
            None
        }
    }
}

/// Where a session stands after recording a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    AwaitingRound(u32),
    Complete,
}

#[derive(Debug, thiserror::Error)]
pub enum DebateError {
    #[error("packet belongs to session {0:?}")]
    WrongSession(String),
    #[error("session is closed")]
    Closed,
    #[error("round {0} exceeds the round limit")]
    RoundLimitExceeded(u32),
    #[error("expected round {expected}, got {got}")]
    UnexpectedRound { expected: u32, got: u32 },
    #[error("round 1 must come from the proposer")]
    ProposerFirst,
}

/// Orchestrator-side view of one debate. Round 1 is the proposer's opening;
/// round 2 is the rebuttal. Terminal after round `MAX_ROUNDS`, after round 1 when
/// there is no critic, or once the host reports the round timer elapsed.
#[derive(Debug, Clone)]
pub struct DebateSession {
    session_id: String,
    request_id: String,
    proposer_id: String,
    critic_id: Option<String>,
    transcript: Vec<DebatePacket>,
    expired: bool,
}

impl DebateSession {
    pub fn from_init(init: &SessionInit) -> Self {
        Self {
            session_id: init.session_id.clone(),
            request_id: init.request_id.clone(),
            proposer_id: init.proposer_id.clone(),
            critic_id: init.critic_id.clone(),
            transcript: Vec::new(),
            expired: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn proposer_id(&self) -> &str {
        &self.proposer_id
    }

    pub fn critic_id(&self) -> Option<&str> {
        self.critic_id.as_deref()
    }

    pub fn next_round(&self) -> u32 {
        self.transcript.len() as u32 + 1
    }

    pub fn is_terminal(&self) -> bool {
        self.expired
            || self.transcript.len() as u32 >= MAX_ROUNDS
            || (self.critic_id.is_none() && !self.transcript.is_empty())
    }

    pub fn record(&mut self, packet: DebatePacket) -> Result<SessionStatus, DebateError> {
        if self.is_terminal() {
            return Err(DebateError::Closed);
        }
        if packet.session_id != self.session_id {
            return Err(DebateError::WrongSession(packet.session_id));
        }
        if packet.round > MAX_ROUNDS {
            return Err(DebateError::RoundLimitExceeded(packet.round));
        }
        let expected = self.next_round();
        if packet.round != expected {
            return Err(DebateError::UnexpectedRound {
                expected,
                got: packet.round,
            });
        }
        if packet.round == 1 && !packet.is_proposer() {
            return Err(DebateError::ProposerFirst);
        }
        self.transcript.push(packet);
        Ok(self.status())
    }

    /// The host's round timer elapsed without a response.
    pub fn expire(&mut self) {
        self.expired = true;
    }

    pub fn status(&self) -> SessionStatus {
        if self.is_terminal() {
            SessionStatus::Complete
        } else {
            SessionStatus::AwaitingRound(self.next_round())
        }
    }

    pub fn transcript(&self) -> &[DebatePacket] {
        &self.transcript
    }

    pub fn into_transcript(self) -> Vec<DebatePacket> {
        self.transcript
    }
}
