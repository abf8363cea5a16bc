use std::path::Path;
use std::time::Duration;

use partymic_core::audio::AudioGraphConfig;
use partymic_core::{GuestId, Locale, PartyId, SessionPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::CaptureConstraints;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Settings shared by the singer and listener agents.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub party_id: PartyId,
    /// Generated per agent when absent.
    pub guest_id: Option<GuestId>,
    pub locale: Locale,
    pub session_policy: SessionPolicy,
    pub audio: AudioGraphConfig,
    pub capture: CaptureConstraints,
    pub ice_servers: Vec<String>,
    pub negotiation_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            party_id: PartyId::new(""),
            guest_id: None,
            locale: Locale::default(),
            session_policy: SessionPolicy::default(),
            audio: AudioGraphConfig::default(),
            capture: CaptureConstraints::default(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            negotiation_timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    pub fn for_party(party_id: impl Into<PartyId>) -> Self {
        Self {
            party_id: party_id.into(),
            ..Default::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServerConfig {
    pub bind_addr: String,
    /// Joins beyond this many connections per room are refused.
    pub max_room_members: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_room_members: 64,
        }
    }
}

impl RelayServerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partymic_core::audio::EffectKind;
    use std::io::Write;

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::for_party("42");
        assert_eq!(config.party_id.channel_name(), "webrtc-party-42");
        assert_eq!(config.session_policy, SessionPolicy::OnePerParty);
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(30));
        assert!(config.audio.start_muted);
        assert!(config.capture.echo_cancellation);
    }

    #[test]
    fn test_agent_config_from_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "party_id": "7",
                "locale": "es",
                "session_policy": "per_guest",
                "audio": {{ "effect": "reverb", "start_muted": false }}
            }}"#
        )
        .unwrap();

        let config = AgentConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.party_id.as_str(), "7");
        assert_eq!(config.locale, Locale::Es);
        assert_eq!(config.session_policy, SessionPolicy::PerGuest);
        assert_eq!(config.audio.effect, EffectKind::Reverb);
        assert!(!config.audio.start_muted);
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            AgentConfig::from_json_file(file.path()),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            AgentConfig::from_json_file("/nonexistent/partymic.json"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_relay_server_defaults() {
        let config: RelayServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.max_room_members, 64);
    }
}
