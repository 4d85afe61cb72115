//! Pneuma routing protocol reference implementation.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod protocol;
pub mod wire;

pub use protocol::{
    DebatePacket, ExpertOffer, Intent, IntentConstraints, Message, Role, RoutingRequest,
    MAX_ROUNDS, TIMEOUT_SECONDS,
};
pub use wire::{
    decode_frame, decode_message, encode_frame, encode_message, parse, DecodeError, EncodeError,
    FrameDecodeError, FrameEncodeError, WireMessage,
};
pub use envelope::{derive_session_key, Envelope, EnvelopeError};
pub use session::{DebateSession, SessionInit};
pub use moderator::{Layer, Moderator, OutboundAction};
pub use guardian::{Assignment, Guardian, GuardianProfile};

pub mod discovery;
pub mod envelope;
pub mod guardian;
pub mod integrity;
pub mod moderator;
pub mod router;
pub mod session;
