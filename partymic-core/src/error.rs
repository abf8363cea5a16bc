//! Session-level error types.

use thiserror::Error;

use crate::signaling::SignalCodecError;
use crate::state::{FailureReason, InvalidTransition};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("microphone access denied")]
    MediaDenied,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("signaling channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("invalid session state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("{0} descriptor already set")]
    DescriptorAlreadySet(&'static str),

    #[error("signaling codec error: {0}")]
    Codec(#[from] SignalCodecError),
}

impl From<FailureReason> for SessionError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::MediaDenied => SessionError::MediaDenied,
            FailureReason::Negotiation(r) => SessionError::Negotiation(r),
            FailureReason::ChannelUnavailable(r) => SessionError::ChannelUnavailable(r),
        }
    }
}
