//! Offer/answer signaling messages.
//!
//! Each session exchanges exactly two messages over the party channel:
//!
//! ```json
//! { "offer":  { "type": "offer",  "sdp": "..." }, "guestId": "...", "nonce": "..." }
//! { "answer": { "type": "answer", "sdp": "..." }, "guestId": "...", "nonce": "..." }
//! ```
//!
//! `guestId` and `nonce` are optional on decode so bare `{ "offer": ... }`
//! payloads are still understood.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{GuestId, Nonce};

/// Pub/sub event name used for all signaling payloads.
pub const SIGNAL_EVENT: &str = "signal";

const OFFER_KEY: &str = "offer";
const ANSWER_KEY: &str = "answer";
const GUEST_KEY: &str = "guestId";
const NONCE_KEY: &str = "nonce";

/// How many handled offers [`OfferDedup`] remembers.
pub const DEDUP_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SignalCodecError {
    #[error("signaling payload is not a JSON object")]
    NotAnObject,

    #[error("signaling payload carries neither an offer nor an answer")]
    UnknownKind,

    #[error("signaling payload carries both an offer and an answer")]
    Ambiguous,

    #[error("invalid {field} field: {source}")]
    InvalidField {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed signaling JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opaque negotiation blob produced by the peer transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescriptor(Value);

impl SessionDescriptor {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Descriptor in the usual `{ "type": ..., "sdp": ... }` shape.
    pub fn from_sdp(kind: SignalKind, sdp: impl Into<String>) -> Self {
        Self(serde_json::json!({
            "type": kind.as_str(),
            "sdp": sdp.into(),
        }))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// The `sdp` field, when the descriptor has one.
    pub fn sdp(&self) -> Option<&str> {
        self.0.get("sdp").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => OFFER_KEY,
            SignalKind::Answer => ANSWER_KEY,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One offer or answer, with the routing fields that correlate them.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    pub kind: SignalKind,
    pub descriptor: SessionDescriptor,
    pub guest_id: Option<GuestId>,
    pub nonce: Option<Nonce>,
}

impl SignalingMessage {
    pub fn offer(descriptor: SessionDescriptor, guest_id: GuestId, nonce: Nonce) -> Self {
        Self {
            kind: SignalKind::Offer,
            descriptor,
            guest_id: Some(guest_id),
            nonce: Some(nonce),
        }
    }

    /// Answer to `offer`, echoing its guest id and nonce.
    pub fn answer_to(offer: &SignalingMessage, descriptor: SessionDescriptor) -> Self {
        Self {
            kind: SignalKind::Answer,
            descriptor,
            guest_id: offer.guest_id.clone(),
            nonce: offer.nonce.clone(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SignalKind::Offer
    }

    pub fn is_answer(&self) -> bool {
        self.kind == SignalKind::Answer
    }

    pub fn encode(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.kind.as_str().to_string(), self.descriptor.0.clone());
        if let Some(guest) = &self.guest_id {
            map.insert(GUEST_KEY.to_string(), Value::String(guest.as_str().to_string()));
        }
        if let Some(nonce) = &self.nonce {
            map.insert(NONCE_KEY.to_string(), Value::String(nonce.as_str().to_string()));
        }
        Value::Object(map)
    }

    pub fn decode(payload: &Value) -> Result<Self, SignalCodecError> {
        let map = payload.as_object().ok_or(SignalCodecError::NotAnObject)?;

        let (kind, descriptor) = match (map.get(OFFER_KEY), map.get(ANSWER_KEY)) {
            (Some(_), Some(_)) => return Err(SignalCodecError::Ambiguous),
            (Some(d), None) => (SignalKind::Offer, d),
            (None, Some(d)) => (SignalKind::Answer, d),
            (None, None) => return Err(SignalCodecError::UnknownKind),
        };

        let guest_id = optional_field::<GuestId>(map, GUEST_KEY)?;
        let nonce = optional_field::<Nonce>(map, NONCE_KEY)?;

        Ok(Self {
            kind,
            descriptor: SessionDescriptor(descriptor.clone()),
            guest_id,
            nonce,
        })
    }

    pub fn decode_str(payload: &str) -> Result<Self, SignalCodecError> {
        let value: Value = serde_json::from_str(payload)?;
        Self::decode(&value)
    }
}

fn optional_field<T: for<'de> Deserialize<'de>>(
    map: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<T>, SignalCodecError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|source| SignalCodecError::InvalidField { field, source }),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum OfferFingerprint {
    Nonce(Option<GuestId>, Nonce),
    Descriptor(SessionDescriptor),
}

/// Remembers which offers were already handled so that redelivered copies
/// are dropped.
#[derive(Debug)]
pub struct OfferDedup {
    seen: VecDeque<OfferFingerprint>,
    capacity: usize,
}

impl Default for OfferDedup {
    fn default() -> Self {
        Self::new(DEDUP_CAPACITY)
    }
}

impl OfferDedup {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: VecDeque::with_capacity(capacity.min(DEDUP_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Returns true the first time an offer is seen. Offers with a nonce are
    /// identified by `(guestId, nonce)`, bare offers by their descriptor.
    pub fn first_sighting(&mut self, offer: &SignalingMessage) -> bool {
        let fingerprint = match &offer.nonce {
            Some(nonce) => OfferFingerprint::Nonce(offer.guest_id.clone(), nonce.clone()),
            None => OfferFingerprint::Descriptor(offer.descriptor.clone()),
        };
        if self.seen.contains(&fingerprint) {
            return false;
        }
        if self.seen.len() == self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(fingerprint);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// The initiator's outstanding offer; decides which answer to apply.
#[derive(Debug, Clone)]
pub struct PendingOffer {
    nonce: Nonce,
    answered: bool,
}

impl PendingOffer {
    pub fn new(nonce: Nonce) -> Self {
        Self {
            nonce,
            answered: false,
        }
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn is_answered(&self) -> bool {
        self.answered
    }

    /// Accept at most one answer. An answer carrying a different nonce is
    /// ignored; one with no nonce is taken only while none has been applied.
    pub fn admit(&mut self, message: &SignalingMessage) -> bool {
        if !message.is_answer() || self.answered {
            return false;
        }
        match &message.nonce {
            Some(nonce) if *nonce != self.nonce => false,
            _ => {
                self.answered = true;
                true
            }
        }
    }
}
