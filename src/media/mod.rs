//! Media collaborators: microphone capture, the peer transport and the
//! playback sink. Agents only see the traits here; concrete backends live in
//! the submodules.

#[cfg(feature = "cpal")]
pub mod device;
pub mod webrtc;

use std::sync::Arc;

use async_trait::async_trait;
use partymic_core::{Role, SessionDescriptor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Length of one audio frame on every channel.
pub const FRAME_MS: u32 = 20;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    Denied,
    #[error("no input device available")]
    NoDevice,
    #[error("audio device error: {0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] ::webrtc::Error),
    #[error("invalid session descriptor: {0}")]
    Descriptor(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer connection closed")]
    Closed,
}

/// Processing hints passed to the platform. Backends may ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Stops the hardware side of a captured track.
pub trait TrackControl: Send + Sync {
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// Live microphone audio: mono `f32` frames at `sample_rate`.
pub struct CapturedTrack {
    pub sample_rate: u32,
    pub frames: mpsc::Receiver<Vec<f32>>,
    pub control: Arc<dyn TrackControl>,
}

impl CapturedTrack {
    pub fn stop(&self) {
        self.control.stop();
    }
}

/// Output of the audio graph, handed to the initiator connection.
pub struct ProcessedAudio {
    pub sample_rate: u32,
    pub frames: mpsc::Receiver<Vec<f32>>,
}

/// Audio arriving from the remote peer.
pub struct RemoteTrack {
    pub id: String,
    pub sample_rate: u32,
    pub frames: mpsc::Receiver<Vec<f32>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Events produced by a peer connection.
#[derive(Debug)]
pub enum PeerEvent {
    /// The complete local descriptor. Emitted once per negotiation.
    Signal(SessionDescriptor),
    /// A remote media track became available.
    Stream(RemoteTrack),
    /// A media path is live.
    Connect,
    /// The connection was closed.
    Close,
    /// The connection failed.
    Error(String),
}

#[async_trait]
pub trait MicrophoneCapture: Send + Sync {
    async fn request_capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<CapturedTrack, CaptureError>;
}

/// Represents one side of a peer-to-peer media connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Apply the descriptor received from the other side. On the responder
    /// this also produces the answer, reported through `PeerEvent::Signal`.
    async fn apply_remote_descriptor(
        &self,
        descriptor: SessionDescriptor,
    ) -> Result<(), TransportError>;

    /// Tear the connection down. Must not block.
    fn destroy(&self) -> Result<(), TransportError>;
}

/// A factory responsible for creating peer connections.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Creates a connection for `role` along with its event stream. The
    /// initiator passes the processed microphone audio to transmit.
    async fn create(
        &self,
        role: Role,
        audio: Option<ProcessedAudio>,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), TransportError>;
}

/// Identifies one attached track within a [`PlaybackSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackId(pub u64);

impl std::fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "playback-{}", self.0)
    }
}

/// Where the host plays the singers' voices.
///
/// Every attached track plays until it is detached or its frames end, so
/// several singers can be heard at once.
pub trait PlaybackSink: Send + Sync {
    fn attach(&self, track: RemoteTrack) -> PlaybackId;
    /// Stop one track. Unknown or already detached ids are ignored.
    fn detach(&self, id: PlaybackId);
}
