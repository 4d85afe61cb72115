//! Wire encodings.
//!
//! Layer 2 (mesh): JSON object with a `"type"` discriminator.
//! Layer 3 (backbone): length-prefix (4 bytes LE) + bincode payload.
//! Both paths validate field ranges; a message either decodes whole or not at all.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::protocol::{
    Bid, DebateMetadata, DebatePacket, ExpertOffer, Intent, IntentConstraints, Message,
    RoutingRequest, DEBATE, EXPERT_OFFER, ROUTE_REQ,
};

const TYPE_FIELD: &str = "type";
const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 64 * 1024;

/// A message kind with a JSON wire form.
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    /// Value of the `"type"` discriminator.
    const KIND: &'static str;

    /// Range and presence checks applied on both encode and decode.
    fn validate(&self) -> Result<(), DecodeError>;

    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.validate().map_err(EncodeError::Invalid)?;
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert(TYPE_FIELD.to_owned(), Value::from(Self::KIND));
        }
        Ok(serde_json::to_vec(&value)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let kind = discriminator(&value)?.to_owned();
        if kind != Self::KIND {
            return Err(DecodeError::WrongType {
                expected: Self::KIND,
                found: kind,
            });
        }
        from_value(value)
    }
}

/// Error decoding a message. Receivers treat every variant as "no result".
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing \"type\" discriminator")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("expected message type {expected:?}, found {found:?}")]
    WrongType {
        expected: &'static str,
        found: String,
    },
    #[error("invalid field: {0}")]
    Invalid(&'static str),
    #[error("truncated header: {0} bytes")]
    Truncated(usize),
    #[error("field {0} is not valid utf-8")]
    Utf8(&'static str),
}

/// Error encoding a message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("refusing to encode invalid message: {0}")]
    Invalid(DecodeError),
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),
}

fn discriminator(value: &Value) -> Result<&str, DecodeError> {
    value
        .get(TYPE_FIELD)
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)
}

fn from_value<T: WireMessage>(value: Value) -> Result<T, DecodeError> {
    let msg: T = serde_json::from_value(value)?;
    msg.validate()?;
    Ok(msg)
}

fn check(ok: bool, field: &'static str) -> Result<(), DecodeError> {
    if ok {
        Ok(())
    } else {
        Err(DecodeError::Invalid(field))
    }
}

fn unit_interval(x: f64) -> bool {
    x.is_finite() && (0.0..=1.0).contains(&x)
}

fn non_negative(x: f64) -> bool {
    x.is_finite() && x >= 0.0
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Intent {
    fn validate(&self) -> Result<(), DecodeError> {
        check(!self.primary.is_empty(), "intent.primary")?;
        check(unit_interval(self.confidence), "intent.confidence")
    }
}

impl IntentConstraints {
    fn validate(&self) -> Result<(), DecodeError> {
        check(self.max_latency_ms > 0, "constraints.max_latency")?;
        check(self.min_reputation <= 100, "constraints.min_reputation")?;
        check(non_negative(self.cost_cap), "constraints.cost_cap")
    }
}

impl Bid {
    fn validate(&self) -> Result<(), DecodeError> {
        check(non_negative(self.cost), "bid.cost")?;
        check(self.est_latency_ms > 0, "bid.est_latency")
    }
}

impl DebateMetadata {
    fn validate(&self) -> Result<(), DecodeError> {
        check(unit_interval(self.confidence), "metadata.confidence")
    }
}

impl WireMessage for RoutingRequest {
    const KIND: &'static str = ROUTE_REQ;

    fn validate(&self) -> Result<(), DecodeError> {
        check(!self.id.is_empty(), "id")?;
        check(!self.origin.is_empty(), "origin")?;
        check(is_sha256_hex(&self.payload_hash), "payload_hash")?;
        self.intent.validate()?;
        self.constraints.validate()
    }
}

impl WireMessage for ExpertOffer {
    const KIND: &'static str = EXPERT_OFFER;

    fn validate(&self) -> Result<(), DecodeError> {
        check(!self.req_id.is_empty(), "req_id")?;
        check(!self.guardian_id.is_empty(), "guardian_id")?;
        self.bid.validate()
    }
}

impl WireMessage for DebatePacket {
    const KIND: &'static str = DEBATE;

    fn validate(&self) -> Result<(), DecodeError> {
        check(!self.session_id.is_empty(), "session_id")?;
        self.metadata.validate()
    }
}

impl Message {
    pub fn validate(&self) -> Result<(), DecodeError> {
        match self {
            Message::RoutingRequest(m) => m.validate(),
            Message::ExpertOffer(m) => m.validate(),
            Message::Debate(m) => m.validate(),
        }
    }
}

/// Encode any message as tagged JSON.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    match msg {
        Message::RoutingRequest(m) => m.encode(),
        Message::ExpertOffer(m) => m.encode(),
        Message::Debate(m) => m.encode(),
    }
}

/// Decode tagged JSON, dispatching on the discriminator.
pub fn decode_message(bytes: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let kind = discriminator(&value)?.to_owned();
    match kind.as_str() {
        ROUTE_REQ => from_value(value).map(Message::RoutingRequest),
        EXPERT_OFFER => from_value(value).map(Message::ExpertOffer),
        DEBATE => from_value(value).map(Message::Debate),
        _ => Err(DecodeError::UnknownType(kind)),
    }
}

/// Soft parse: `None` on malformed input, unknown type, or missing fields.
pub fn parse(bytes: &[u8]) -> Option<Message> {
    match decode_message(bytes) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!(error = %e, len = bytes.len(), "dropping unparseable message");
            None
        }
    }
}

/// Encode a message into a single backbone frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    msg.validate().map_err(FrameEncodeError::Invalid)?;
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("refusing to encode invalid message: {0}")]
    Invalid(DecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg: Message =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    msg.validate().map_err(FrameDecodeError::Invalid)?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("invalid message: {0}")]
    Invalid(DecodeError),
}
