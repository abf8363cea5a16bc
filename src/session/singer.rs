//! The singer side: capture the microphone, run it through the audio graph
//! and offer it to the party's listener.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use partymic_core::audio::{AudioGraph, EffectKind, PreparedEffect};
use partymic_core::{
    GuestId, Nonce, PendingOffer, Role, SessionError, SessionEvent, SessionState,
    SignalingMessage, status_text,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{SessionResources, SessionTracker, lock_resources};
use crate::config::AgentConfig;
use crate::media::{
    CaptureError, MicrophoneCapture, PeerConnection, PeerConnectionFactory, PeerEvent,
    ProcessedAudio,
};
use crate::relay::SignalingRelay;
use crate::signaling::{PartyChannel, SignalStream};

const PROCESSED_FRAME_CAPACITY: usize = 32;

fn lock_graph(graph: &Mutex<AudioGraph>) -> MutexGuard<'_, AudioGraph> {
    graph.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Starts singer sessions for one guest in one party.
///
/// The agent outlives its sessions: every [`start`](Self::start) builds a
/// fresh session, while the status and state channels keep reporting the
/// most recent one.
pub struct SingerAgent {
    config: AgentConfig,
    guest_id: GuestId,
    channel: PartyChannel,
    microphone: Arc<dyn MicrophoneCapture>,
    peers: Arc<dyn PeerConnectionFactory>,
    state: Arc<watch::Sender<SessionState>>,
    status: Arc<watch::Sender<String>>,
}

impl SingerAgent {
    pub fn new(
        config: AgentConfig,
        relay: Arc<dyn SignalingRelay>,
        microphone: Arc<dyn MicrophoneCapture>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let guest_id = config.guest_id.clone().unwrap_or_else(GuestId::generate);
        let channel = PartyChannel::new(relay, config.party_id.clone());
        let (state, _) = watch::channel(SessionState::Idle);
        let (status, _) = watch::channel(status_text(
            Role::Initiator,
            &SessionState::Idle,
            config.locale,
        ));
        Self {
            config,
            guest_id,
            channel,
            microphone,
            peers,
            state: Arc::new(state),
            status: Arc::new(status),
        }
    }

    pub fn guest_id(&self) -> &GuestId {
        &self.guest_id
    }

    pub fn status(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Acquire the microphone and start negotiating.
    ///
    /// Errors are also reflected in the status line. Once this returns `Ok`
    /// the session keeps running in the background until it is stopped or
    /// its transport ends.
    pub async fn start(&self) -> Result<SingerSession, SessionError> {
        let label = format!("{}/{}", self.config.party_id, self.guest_id);
        let mut tracker = SessionTracker::new(
            Role::Initiator,
            self.config.locale,
            label.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.status),
        );
        let mut resources = SessionResources::new(label.clone());

        tracker.apply(SessionEvent::CaptureRequested);
        let track = match self.microphone.request_capture(&self.config.capture).await {
            Ok(track) => track,
            Err(e) => {
                if !matches!(e, CaptureError::Denied) {
                    warn!("Microphone capture for {label} failed: {e}");
                }
                tracker.apply(SessionEvent::CaptureDenied);
                return Err(SessionError::MediaDenied);
            }
        };
        resources.set_track(Arc::clone(&track.control));
        tracker.apply(SessionEvent::CaptureGranted);

        let mut audio_config = self.config.audio.clone();
        audio_config.sample_rate = track.sample_rate;
        let graph = Arc::new(Mutex::new(AudioGraph::new(&audio_config)));

        let answers = match self.channel.on_answer().await {
            Ok(answers) => answers,
            Err(e) => {
                tracker.apply(SessionEvent::ChannelUnavailable(e.to_string()));
                resources.release();
                return Err(SessionError::ChannelUnavailable(e.to_string()));
            }
        };
        resources.set_subscription(Arc::clone(self.channel.relay()), answers.handle().clone());

        let (processed_tx, processed_rx) = mpsc::channel(PROCESSED_FRAME_CAPACITY);
        let pump = tokio::spawn(run_pump(track.frames, Arc::clone(&graph), processed_tx));
        resources.set_pump(pump.abort_handle());

        let processed = ProcessedAudio {
            sample_rate: track.sample_rate,
            frames: processed_rx,
        };
        let (connection, events) = match self.peers.create(Role::Initiator, Some(processed)).await
        {
            Ok(created) => created,
            Err(e) => {
                tracker.apply(SessionEvent::TransportFailed(e.to_string()));
                resources.release();
                return Err(SessionError::Negotiation(e.to_string()));
            }
        };
        resources.set_connection(Arc::clone(&connection));
        let resources = Arc::new(Mutex::new(resources));

        let (stop_tx, stop_rx) = oneshot::channel();
        let driver = SingerDriver {
            tracker,
            resources: Arc::clone(&resources),
            channel: self.channel.clone(),
            guest_id: self.guest_id.clone(),
            connection,
            events,
            answers,
            pending: None,
        };
        let timeout = self.config.negotiation_timeout();
        let task = tokio::spawn(driver.run(stop_rx, timeout));
        info!("Singer session {label} started");

        Ok(SingerSession {
            guest_id: self.guest_id.clone(),
            graph,
            resources,
            stop: Some(stop_tx),
            driver: Some(task),
            state: self.state.subscribe(),
        })
    }
}

/// Pulls captured frames through the graph and hands them to the transport.
async fn run_pump(
    mut frames: mpsc::Receiver<Vec<f32>>,
    graph: Arc<Mutex<AudioGraph>>,
    out: mpsc::Sender<Vec<f32>>,
) {
    while let Some(mut frame) = frames.recv().await {
        lock_graph(&graph).process(&mut frame);
        if out.send(frame).await.is_err() {
            break;
        }
    }
    debug!("Audio pump finished");
}

struct SingerDriver {
    tracker: SessionTracker,
    resources: Arc<Mutex<SessionResources>>,
    channel: PartyChannel,
    guest_id: GuestId,
    connection: Arc<dyn PeerConnection>,
    events: mpsc::Receiver<PeerEvent>,
    answers: SignalStream,
    pending: Option<PendingOffer>,
}

impl SingerDriver {
    async fn run(
        mut self,
        mut stop: oneshot::Receiver<()>,
        timeout: std::time::Duration,
    ) -> SessionState {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while !self.tracker.state().is_terminal() {
            let connected = self.tracker.state().is_connected();
            tokio::select! {
                _ = &mut stop => {
                    self.tracker.apply(SessionEvent::CloseRequested);
                }
                event = self.events.recv() => self.on_peer_event(event).await,
                answer = self.answers.next() => match answer {
                    Some(answer) => self.on_answer(answer).await,
                    None => {
                        self.tracker.apply(SessionEvent::ChannelUnavailable(
                            "answer subscription ended".to_string(),
                        ));
                    }
                },
                _ = &mut deadline, if !connected => {
                    self.tracker.apply(SessionEvent::TransportFailed(
                        "negotiation timed out".to_string(),
                    ));
                }
            }
        }

        lock_resources(&self.resources).release();
        self.tracker.state().clone()
    }

    async fn on_peer_event(&mut self, event: Option<PeerEvent>) {
        match event {
            Some(PeerEvent::Signal(descriptor)) => {
                if self.pending.is_some() {
                    debug!(
                        "Ignoring extra local descriptor for session {}",
                        self.tracker.label()
                    );
                    return;
                }
                if let Err(e) = self
                    .tracker
                    .machine_mut()
                    .set_local_descriptor(descriptor.clone())
                {
                    warn!("Session {}: {e}", self.tracker.label());
                    return;
                }
                let nonce = Nonce::generate();
                match self
                    .channel
                    .publish_offer(descriptor, self.guest_id.clone(), nonce.clone())
                    .await
                {
                    Ok(_) => {
                        info!(
                            "Sent offer for session {} on {} (nonce {nonce})",
                            self.tracker.label(),
                            self.channel.name()
                        );
                        self.pending = Some(PendingOffer::new(nonce));
                    }
                    Err(e) => {
                        self.tracker
                            .apply(SessionEvent::ChannelUnavailable(e.to_string()));
                    }
                }
            }
            Some(PeerEvent::Connect) => {
                self.tracker.apply(SessionEvent::TransportConnected);
            }
            Some(PeerEvent::Close) | None => {
                self.tracker.apply(SessionEvent::TransportClosed);
            }
            Some(PeerEvent::Error(reason)) => {
                self.tracker.apply(SessionEvent::TransportFailed(reason));
            }
            Some(PeerEvent::Stream(track)) => {
                debug!("Singer ignoring remote track {}", track.id);
            }
        }
    }

    async fn on_answer(&mut self, answer: SignalingMessage) {
        let Some(pending) = self.pending.as_mut() else {
            debug!(
                "Ignoring answer received before our offer for session {}",
                self.tracker.label()
            );
            return;
        };
        if !pending.admit(&answer) {
            debug!(
                "Ignoring answer (nonce {:?}) not meant for session {}",
                answer.nonce,
                self.tracker.label()
            );
            return;
        }
        info!(
            "Received signaling answer for session {}",
            self.tracker.label()
        );
        if let Err(e) = self
            .tracker
            .machine_mut()
            .set_remote_descriptor(answer.descriptor.clone())
        {
            warn!("Session {}: {e}", self.tracker.label());
            return;
        }
        if let Err(e) = self
            .connection
            .apply_remote_descriptor(answer.descriptor)
            .await
        {
            self.tracker
                .apply(SessionEvent::TransportFailed(e.to_string()));
        }
    }
}

/// A running singer session.
///
/// Dropping it closes the session. The microphone and the subscription are
/// released before `drop` returns; the final state is published by the
/// background task shortly after.
pub struct SingerSession {
    guest_id: GuestId,
    graph: Arc<Mutex<AudioGraph>>,
    resources: Arc<Mutex<SessionResources>>,
    stop: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<SessionState>>,
    state: watch::Receiver<SessionState>,
}

impl SingerSession {
    pub fn guest_id(&self) -> &GuestId {
        &self.guest_id
    }

    pub fn current_state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Close the session and release everything it holds. Calling it again,
    /// or on a session that already ended, only returns the final state.
    pub async fn stop(&mut self) -> SessionState {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(driver) = self.driver.take() {
            match driver.await {
                Ok(state) => return state,
                Err(e) => warn!("Singer session task ended abnormally: {e}"),
            }
        }
        self.current_state()
    }

    /// Returns the gain actually applied, clamped to `[0, 2]`.
    pub fn set_gain(&self, gain: f32) -> f32 {
        lock_graph(&self.graph).set_gain(gain)
    }

    pub fn set_muted(&self, muted: bool) {
        lock_graph(&self.graph).set_muted(muted);
    }

    /// The replacement node is built before the graph is locked, so the
    /// audio pump keeps running while a reverb is prepared.
    pub fn set_effect(&self, effect: EffectKind) {
        let sample_rate = lock_graph(&self.graph).sample_rate();
        let prepared = PreparedEffect::new(effect, sample_rate);
        lock_graph(&self.graph).install_effect(prepared);
    }

    pub fn effective_gain(&self) -> f32 {
        lock_graph(&self.graph).effective_gain()
    }

    pub fn effect(&self) -> EffectKind {
        lock_graph(&self.graph).effect()
    }

    pub fn graph(&self) -> Arc<Mutex<AudioGraph>> {
        Arc::clone(&self.graph)
    }
}

impl Drop for SingerSession {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
            lock_resources(&self.resources).release();
        }
    }
}
