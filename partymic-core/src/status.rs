//! The single human-readable status line shown to users.

use serde::{Deserialize, Serialize};

use crate::state::{FailureReason, SessionState};
use crate::types::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Es,
}

/// Status text for `state` as seen by the `role` side.
pub fn status_text(role: Role, state: &SessionState, locale: Locale) -> String {
    use Locale::{En, Es};
    use SessionState as S;

    let text = match (state, role, locale) {
        (S::Idle, Role::Initiator, En) => "Microphone off",
        (S::Idle, Role::Initiator, Es) => "Micrófono apagado",
        (S::Idle, Role::Responder, En) => "Waiting for a singer",
        (S::Idle, Role::Responder, Es) => "Esperando a un cantante",
        (S::RequestingMedia, _, En) => "Requesting microphone...",
        (S::RequestingMedia, _, Es) => "Solicitando micrófono...",
        (S::Negotiating, Role::Initiator, En) => "Microphone ready, connecting...",
        (S::Negotiating, Role::Initiator, Es) => "Micrófono listo, conectando...",
        (S::Negotiating, Role::Responder, En) => "Singer found, connecting...",
        (S::Negotiating, Role::Responder, Es) => "Cantante encontrado, conectando...",
        (S::Connected, Role::Initiator, En) => "Connected",
        (S::Connected, Role::Initiator, Es) => "Conectado",
        (S::Connected, Role::Responder, En) => "Singer connected",
        (S::Connected, Role::Responder, Es) => "Cantante conectado",
        (S::Closed, _, En) => "Disconnected",
        (S::Closed, _, Es) => "Desconectado",
        (S::Failed(reason), _, locale) => return failure_text(reason, locale),
    };
    text.to_string()
}

fn failure_text(reason: &FailureReason, locale: Locale) -> String {
    match (reason, locale) {
        (FailureReason::MediaDenied, Locale::En) => "Error: Microphone denied".to_string(),
        (FailureReason::MediaDenied, Locale::Es) => {
            "Error: Permiso de micrófono denegado".to_string()
        }
        (FailureReason::Negotiation(r), Locale::En) => format!("Error: Connection failed ({r})"),
        (FailureReason::Negotiation(r), Locale::Es) => format!("Error: Falló la conexión ({r})"),
        (FailureReason::ChannelUnavailable(_), Locale::En) => {
            "Error: Signaling channel unavailable".to_string()
        }
        (FailureReason::ChannelUnavailable(_), Locale::Es) => {
            "Error: Canal de señalización no disponible".to_string()
        }
    }
}
