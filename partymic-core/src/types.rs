//! Identifiers shared by both sides of a singing session.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Prefix of every party's signaling channel name.
pub const CHANNEL_PREFIX: &str = "webrtc-party-";

fn random_hex_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Identifier of a party; scopes the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the pub/sub channel carrying this party's offers and answers.
    pub fn channel_name(&self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.0)
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PartyId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a singer's device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuestId(String);

impl GuestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random 16 hex character id.
    pub fn generate() -> Self {
        Self(random_hex_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GuestId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Per-offer correlation token. The answer echoes the nonce of the offer it
/// responds to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(random_hex_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which end of the peer connection a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The singer: captures audio and sends the offer.
    Initiator,
    /// The host: receives the offer, answers and plays the audio.
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// How a listener keys its responder sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// At most one microphone session per party; later offers are dropped
    /// while one is negotiating or connected.
    #[default]
    OnePerParty,
    /// One session per `(party, guest)` so several guests can sing at once.
    PerGuest,
}

/// Registry key of a responder session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub party_id: PartyId,
    pub guest_id: Option<GuestId>,
}

impl SessionKey {
    /// Key an incoming offer according to `policy`. Under
    /// [`SessionPolicy::OnePerParty`] the guest component is always `None`.
    pub fn for_offer(policy: SessionPolicy, party_id: &PartyId, guest_id: Option<&GuestId>) -> Self {
        let guest_id = match policy {
            SessionPolicy::OnePerParty => None,
            SessionPolicy::PerGuest => guest_id.cloned(),
        };
        Self {
            party_id: party_id.clone(),
            guest_id,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.guest_id {
            Some(guest) => write!(f, "{}/{}", self.party_id, guest),
            None => write!(f, "{}", self.party_id),
        }
    }
}
