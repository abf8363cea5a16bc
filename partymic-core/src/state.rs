//! Session lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SessionError;
use crate::signaling::SessionDescriptor;
use crate::types::Role;

/// Why a session ended in [`SessionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// The user or platform refused microphone access.
    MediaDenied,
    /// The transport could not establish or keep a media path.
    Negotiation(String),
    /// The signaling relay could not be reached.
    ChannelUnavailable(String),
}

/// Current state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum SessionState {
    /// Nothing started yet.
    #[default]
    Idle,
    /// Initiator: waiting for the platform to grant the microphone.
    RequestingMedia,
    /// Descriptors are being exchanged.
    Negotiating,
    /// Media path is live.
    Connected,
    /// Torn down normally.
    Closed,
    /// Torn down by an error. Terminal.
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    /// A responder in this state keeps its slot and drops further offers.
    pub fn is_occupied(&self) -> bool {
        matches!(self, Self::Negotiating | Self::Connected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    CaptureRequested,
    CaptureGranted,
    CaptureDenied,
    OfferReceived,
    TransportConnected,
    CloseRequested,
    TransportClosed,
    TransportFailed(String),
    ChannelUnavailable(String),
}

impl SessionEvent {
    fn is_close(&self) -> bool {
        matches!(self, Self::CloseRequested | Self::TransportClosed)
    }

    /// Events that arrive late from a transport or relay that is already
    /// gone. They never revive a terminal session.
    fn is_late_teardown(&self) -> bool {
        matches!(
            self,
            Self::CloseRequested
                | Self::TransportClosed
                | Self::TransportFailed(_)
                | Self::ChannelUnavailable(_)
                | Self::TransportConnected
        )
    }
}

/// Compute the state reached from `current` on `event` for a session
/// playing `role`.
pub fn next_state(
    role: Role,
    current: &SessionState,
    event: &SessionEvent,
) -> Result<SessionState, InvalidTransition> {
    use SessionEvent as E;
    use SessionState as S;

    let next = match (role, current, event) {
        (Role::Initiator, S::Idle, E::CaptureRequested) => S::RequestingMedia,
        (Role::Initiator, S::RequestingMedia, E::CaptureGranted) => S::Negotiating,
        (Role::Initiator, S::RequestingMedia, E::CaptureDenied) => {
            S::Failed(FailureReason::MediaDenied)
        }
        (Role::Responder, S::Idle, E::OfferReceived) => S::Negotiating,

        (_, S::Negotiating | S::Connected, E::TransportConnected) => S::Connected,

        (_, S::Closed | S::Failed(_), e) if e.is_late_teardown() => current.clone(),

        (_, S::Idle | S::RequestingMedia | S::Negotiating | S::Connected, e) if e.is_close() => {
            S::Closed
        }
        (_, S::Idle | S::RequestingMedia | S::Negotiating | S::Connected, E::TransportFailed(r)) => {
            S::Failed(FailureReason::Negotiation(r.clone()))
        }
        (
            _,
            S::Idle | S::RequestingMedia | S::Negotiating | S::Connected,
            E::ChannelUnavailable(r),
        ) => S::Failed(FailureReason::ChannelUnavailable(r.clone())),

        (role, current, event) => {
            return Err(InvalidTransition {
                role,
                current_state: format!("{:?}", current),
                attempted: format!("{:?}", event),
            });
        }
    };
    Ok(next)
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// One session's state plus the descriptors negotiated so far.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    role: Role,
    state: SessionState,
    local_descriptor: Option<SessionDescriptor>,
    remote_descriptor: Option<SessionDescriptor>,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl SessionMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: SessionState::Idle,
            local_descriptor: None,
            remote_descriptor: None,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Apply an event. Returns error if the event is not valid here.
    pub fn apply(&mut self, event: SessionEvent) -> Result<Transition, InvalidTransition> {
        let next = next_state(self.role, &self.state, &event)?;
        let from = std::mem::replace(&mut self.state, next);

        if from != self.state {
            match &self.state {
                SessionState::Connected => self.connected_at = Some(Utc::now()),
                s if s.is_terminal() => self.ended_at = Some(Utc::now()),
                _ => {}
            }
        }

        Ok(Transition {
            from,
            to: self.state.clone(),
        })
    }

    pub fn local_descriptor(&self) -> Option<&SessionDescriptor> {
        self.local_descriptor.as_ref()
    }

    pub fn remote_descriptor(&self) -> Option<&SessionDescriptor> {
        self.remote_descriptor.as_ref()
    }

    pub fn set_local_descriptor(&mut self, descriptor: SessionDescriptor) -> Result<(), SessionError> {
        if self.local_descriptor.is_some() {
            return Err(SessionError::DescriptorAlreadySet("local"));
        }
        self.local_descriptor = Some(descriptor);
        Ok(())
    }

    pub fn set_remote_descriptor(
        &mut self,
        descriptor: SessionDescriptor,
    ) -> Result<(), SessionError> {
        if self.remote_descriptor.is_some() {
            return Err(SessionError::DescriptorAlreadySet("remote"));
        }
        self.remote_descriptor = Some(descriptor);
        Ok(())
    }

    /// Time spent connected, once the session has ended after connecting.
    pub fn connected_duration(&self) -> Option<chrono::Duration> {
        match (self.connected_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub role: Role,
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {} ({})",
            self.attempted, self.current_state, self.role
        )
    }
}

impl std::error::Error for InvalidTransition {}
