//! In-process stand-ins for the microphone, the peer transport and the
//! playback sink.

use std::collections::HashMap;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use partymic_core::audio::DEFAULT_SAMPLE_RATE;
use partymic_core::{Role, SessionDescriptor, SignalKind};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::media::{
    CaptureConstraints, CaptureError, CapturedTrack, FRAME_MS, MicrophoneCapture, PeerConnection,
    PeerConnectionFactory, PeerEvent, PlaybackId, PlaybackSink, ProcessedAudio, RemoteTrack,
    TrackControl, TransportError,
};

const EVENT_CAPACITY: usize = 32;
const FRAME_CAPACITY: usize = 32;
const OFFER_PREFIX: &str = "loopback-offer-";
const ANSWER_PREFIX: &str = "loopback-answer-";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct FakeTrack {
    stopped: AtomicBool,
}

impl TrackControl for FakeTrack {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Microphone that either refuses access or produces a 440 Hz tone in
/// 20 ms frames until its track is stopped.
pub struct FakeMicrophone {
    grant: bool,
    sample_rate: u32,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeMicrophone {
    pub fn granting() -> Self {
        Self {
            grant: true,
            sample_rate: DEFAULT_SAMPLE_RATE,
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn denying() -> Self {
        Self {
            grant: false,
            ..Self::granting()
        }
    }

    /// Number of tracks handed out so far.
    pub fn capture_count(&self) -> usize {
        lock(&self.tracks).len()
    }

    /// True once every track handed out has been stopped.
    pub fn all_stopped(&self) -> bool {
        lock(&self.tracks).iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MicrophoneCapture for FakeMicrophone {
    async fn request_capture(
        &self,
        _constraints: &CaptureConstraints,
    ) -> Result<CapturedTrack, CaptureError> {
        if !self.grant {
            return Err(CaptureError::Denied);
        }
        let track = Arc::new(FakeTrack::default());
        lock(&self.tracks).push(Arc::clone(&track));

        let (tx, frames) = mpsc::channel(FRAME_CAPACITY);
        let sample_rate = self.sample_rate;
        let control = Arc::clone(&track);
        tokio::spawn(async move {
            let frame_len = (sample_rate * FRAME_MS / 1000) as usize;
            let step = TAU * 440.0 / sample_rate as f32;
            let mut phase = 0.0f32;
            let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS as u64));
            loop {
                ticker.tick().await;
                if control.is_stopped() {
                    break;
                }
                let frame: Vec<f32> = (0..frame_len)
                    .map(|_| {
                        let s = 0.5 * phase.sin();
                        phase = (phase + step) % TAU;
                        s
                    })
                    .collect();
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(CapturedTrack {
            sample_rate,
            frames,
            control: track,
        })
    }
}

/// What [`PeerConnection::destroy`] does on loopback connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestroyBehavior {
    #[default]
    Ok,
    Fail,
    Panic,
}

struct Link {
    initiator: Option<mpsc::Sender<PeerEvent>>,
    responder: Option<mpsc::Sender<PeerEvent>>,
    audio: Option<ProcessedAudio>,
}

#[derive(Default)]
struct NetworkState {
    links: Mutex<HashMap<u64, Link>>,
    next_link: AtomicU64,
    failure: Mutex<Option<String>>,
    destroy: Mutex<DestroyBehavior>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

/// Peer transport that pairs initiators and responders inside the process.
///
/// Offers and answers carry the link id in their `sdp`, so they still have
/// to travel through the signaling relay. Once the initiator applies the
/// answer both sides connect and the responder receives the initiator's
/// processed audio as its remote track. Destroying either side reports
/// `PeerEvent::Close` to the other, as the WebRTC transport does.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<NetworkState>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later negotiation ends with `PeerEvent::Error(reason)` on both
    /// sides instead of connecting.
    pub fn fail_negotiation(&self, reason: impl Into<String>) {
        *lock(&self.state.failure) = Some(reason.into());
    }

    pub fn set_destroy_behavior(&self, behavior: DestroyBehavior) {
        *lock(&self.state.destroy) = behavior;
    }

    pub fn created_count(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> usize {
        self.state.destroyed.load(Ordering::SeqCst)
    }
}

fn parse_link(descriptor: &SessionDescriptor, prefix: &str) -> Result<u64, TransportError> {
    descriptor
        .sdp()
        .and_then(|sdp| sdp.strip_prefix(prefix))
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| TransportError::Descriptor(format!("not a {prefix} descriptor")))
}

#[async_trait]
impl PeerConnectionFactory for LoopbackNetwork {
    async fn create(
        &self,
        role: Role,
        audio: Option<ProcessedAudio>,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), TransportError> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);

        let link = match role {
            Role::Initiator => {
                let id = self.state.next_link.fetch_add(1, Ordering::SeqCst);
                lock(&self.state.links).insert(
                    id,
                    Link {
                        initiator: Some(events.clone()),
                        responder: None,
                        audio,
                    },
                );
                let offer =
                    SessionDescriptor::from_sdp(SignalKind::Offer, format!("{OFFER_PREFIX}{id}"));
                let _ = events.try_send(PeerEvent::Signal(offer));
                Some(id)
            }
            Role::Responder => None,
        };

        let connection = LoopbackConnection {
            network: Arc::clone(&self.state),
            role,
            link: Mutex::new(link),
            events,
        };
        Ok((Arc::new(connection), rx))
    }
}

struct LoopbackConnection {
    network: Arc<NetworkState>,
    role: Role,
    link: Mutex<Option<u64>>,
    events: mpsc::Sender<PeerEvent>,
}

impl LoopbackConnection {
    async fn accept_offer(&self, descriptor: &SessionDescriptor) -> Result<(), TransportError> {
        let id = parse_link(descriptor, OFFER_PREFIX)?;
        {
            let mut links = lock(&self.network.links);
            let link = links
                .get_mut(&id)
                .ok_or_else(|| TransportError::Negotiation(format!("unknown offer {id}")))?;
            link.responder = Some(self.events.clone());
        }
        *lock(&self.link) = Some(id);
        let answer =
            SessionDescriptor::from_sdp(SignalKind::Answer, format!("{ANSWER_PREFIX}{id}"));
        let _ = self.events.send(PeerEvent::Signal(answer)).await;
        Ok(())
    }

    async fn accept_answer(&self, descriptor: &SessionDescriptor) -> Result<(), TransportError> {
        let id = parse_link(descriptor, ANSWER_PREFIX)?;
        if *lock(&self.link) != Some(id) {
            return Err(TransportError::Descriptor(format!(
                "answer {id} does not belong to this connection"
            )));
        }
        let (responder, audio) = {
            let mut links = lock(&self.network.links);
            let link = links.get_mut(&id).ok_or(TransportError::Closed)?;
            (link.responder.clone(), link.audio.take())
        };
        let responder = responder.ok_or(TransportError::Closed)?;

        let failure = lock(&self.network.failure).clone();
        if let Some(reason) = failure {
            let _ = responder.send(PeerEvent::Error(reason.clone())).await;
            let _ = self.events.send(PeerEvent::Error(reason)).await;
            return Ok(());
        }

        if let Some(audio) = audio {
            let track = RemoteTrack {
                id: format!("loopback-{id}"),
                sample_rate: audio.sample_rate,
                frames: audio.frames,
            };
            let _ = responder.send(PeerEvent::Stream(track)).await;
        }
        let _ = responder.send(PeerEvent::Connect).await;
        let _ = self.events.send(PeerEvent::Connect).await;
        Ok(())
    }

    fn other_side(&self) -> Option<mpsc::Sender<PeerEvent>> {
        let id = (*lock(&self.link))?;
        let links = lock(&self.network.links);
        let link = links.get(&id)?;
        match self.role {
            Role::Initiator => link.responder.clone(),
            Role::Responder => link.initiator.clone(),
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn apply_remote_descriptor(
        &self,
        descriptor: SessionDescriptor,
    ) -> Result<(), TransportError> {
        match self.role {
            Role::Responder => self.accept_offer(&descriptor).await,
            Role::Initiator => self.accept_answer(&descriptor).await,
        }
    }

    fn destroy(&self) -> Result<(), TransportError> {
        self.network.destroyed.fetch_add(1, Ordering::SeqCst);
        let behavior = *lock(&self.network.destroy);
        match behavior {
            DestroyBehavior::Ok => {}
            DestroyBehavior::Fail => return Err(TransportError::Closed),
            DestroyBehavior::Panic => panic!("loopback connection destroy panicked"),
        }
        if let Some(peer) = self.other_side() {
            let _ = peer.try_send(PeerEvent::Close);
        }
        Ok(())
    }
}

/// Playback sink that counts what it is given. Each attached track gets its
/// own reader task counting into the shared frame total.
#[derive(Default)]
pub struct RecordingSink {
    attached: AtomicUsize,
    detached: AtomicUsize,
    frames: Arc<AtomicUsize>,
    next_id: AtomicU64,
    readers: Mutex<HashMap<PlaybackId, AbortHandle>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_count(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn detach_count(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Tracks attached, not detached, and still delivering.
    pub fn playing_count(&self) -> usize {
        lock(&self.readers)
            .values()
            .filter(|reader| !reader.is_finished())
            .count()
    }

    /// Wait until at least `count` frames were played.
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.frame_count() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl PlaybackSink for RecordingSink {
    fn attach(&self, mut track: RemoteTrack) -> PlaybackId {
        self.attached.fetch_add(1, Ordering::SeqCst);
        let id = PlaybackId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let frames = Arc::clone(&self.frames);
        let reader = tokio::spawn(async move {
            while track.frames.recv().await.is_some() {
                frames.fetch_add(1, Ordering::SeqCst);
            }
        });
        lock(&self.readers).insert(id, reader.abort_handle());
        id
    }

    fn detach(&self, id: PlaybackId) {
        if let Some(reader) = lock(&self.readers).remove(&id) {
            self.detached.fetch_add(1, Ordering::SeqCst);
            reader.abort();
        }
    }
}
