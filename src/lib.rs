// Runtime-free logic lives in the core crate
pub use partymic_core as core;
pub use partymic_core::audio;

pub mod config;
pub mod media;
pub mod relay;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{AgentConfig, ConfigError, RelayServerConfig};
pub use partymic_core::{
    GuestId, Locale, Nonce, PartyId, Role, SessionError, SessionKey, SessionPolicy, SessionState,
};
pub use session::{ListenerAgent, ListenerHandle, SingerAgent, SingerSession};
