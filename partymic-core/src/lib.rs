//! Runtime-free core of PartyMic.
//!
//! Everything in this crate is deterministic, synchronous logic that the
//! async agents in the `partymic` crate drive:
//!
//! - [`types`]: party, guest and nonce identifiers plus session keys
//! - [`signaling`]: the offer/answer message codec, offer dedup and answer
//!   correlation
//! - [`state`]: the pure session lifecycle state machine
//! - [`status`]: the human-readable status line derived from a state
//! - [`audio`]: the microphone processing graph (gain, compressor, reverb)
//!   and the G.711 transport codec

pub mod audio;
pub mod error;
pub mod signaling;
pub mod state;
pub mod status;
pub mod types;

pub use error::SessionError;
pub use signaling::{
    OfferDedup, PendingOffer, SIGNAL_EVENT, SessionDescriptor, SignalCodecError, SignalKind,
    SignalingMessage,
};
pub use state::{
    FailureReason, InvalidTransition, SessionEvent, SessionMachine, SessionState, Transition,
    next_state,
};
pub use status::{Locale, status_text};
pub use types::{GuestId, Nonce, PartyId, Role, SessionKey, SessionPolicy};
