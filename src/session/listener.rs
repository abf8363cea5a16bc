//! The listener side: answer offers on the party channel and play the
//! singer's audio.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use partymic_core::{
    FailureReason, Locale, PartyId, Role, SessionError, SessionEvent, SessionKey, SessionPolicy,
    SessionState, SignalingMessage, status_text,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{SessionResources, SessionTracker};
use crate::config::AgentConfig;
use crate::media::{PeerConnectionFactory, PeerEvent, PlaybackSink};
use crate::relay::SignalingRelay;
use crate::signaling::{PartyChannel, SignalStream};

struct ResponderEntry {
    state: watch::Receiver<SessionState>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<SessionState>>,
}

/// Waits for singers in one party and answers them.
pub struct ListenerAgent {
    config: AgentConfig,
    channel: PartyChannel,
    peers: Arc<dyn PeerConnectionFactory>,
    sink: Arc<dyn PlaybackSink>,
    status: Arc<watch::Sender<String>>,
}

impl ListenerAgent {
    pub fn new(
        config: AgentConfig,
        relay: Arc<dyn SignalingRelay>,
        peers: Arc<dyn PeerConnectionFactory>,
        sink: Arc<dyn PlaybackSink>,
    ) -> Self {
        let channel = PartyChannel::new(relay, config.party_id.clone());
        let (status, _) = watch::channel(status_text(
            Role::Responder,
            &SessionState::Idle,
            config.locale,
        ));
        Self {
            config,
            channel,
            peers,
            sink,
            status: Arc::new(status),
        }
    }

    /// Status of the most recently changed session.
    pub fn status(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }

    /// Subscribe to offers and answer them in the background until the
    /// returned handle is stopped or dropped.
    pub async fn listen(&self) -> Result<ListenerHandle, SessionError> {
        let offers = match self.channel.on_offer().await {
            Ok(offers) => offers,
            Err(e) => {
                let reason = FailureReason::ChannelUnavailable(e.to_string());
                warn!("Listener for {} cannot subscribe: {e}", self.channel.name());
                self.status.send_replace(status_text(
                    Role::Responder,
                    &SessionState::Failed(reason.clone()),
                    self.config.locale,
                ));
                return Err(reason.into());
            }
        };
        let mut subscription =
            SessionResources::new(format!("listener {}", self.channel.name()));
        subscription.set_subscription(Arc::clone(self.channel.relay()), offers.handle().clone());

        let sessions = Arc::new(DashMap::new());
        let dispatcher = Dispatcher {
            party_id: self.config.party_id.clone(),
            policy: self.config.session_policy,
            locale: self.config.locale,
            timeout: self.config.negotiation_timeout(),
            channel: self.channel.clone(),
            peers: Arc::clone(&self.peers),
            sink: Arc::clone(&self.sink),
            status: Arc::clone(&self.status),
            sessions: Arc::clone(&sessions),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(dispatcher.run(offers, subscription, stop_rx));
        info!(
            "Listening for singers on {} ({:?})",
            self.channel.name(),
            self.config.session_policy
        );

        Ok(ListenerHandle {
            sessions,
            stop: Some(stop_tx),
            dispatcher: Some(task),
        })
    }
}

struct Dispatcher {
    party_id: PartyId,
    policy: SessionPolicy,
    locale: Locale,
    timeout: Duration,
    channel: PartyChannel,
    peers: Arc<dyn PeerConnectionFactory>,
    sink: Arc<dyn PlaybackSink>,
    status: Arc<watch::Sender<String>>,
    sessions: Arc<DashMap<SessionKey, ResponderEntry>>,
}

impl Dispatcher {
    async fn run(
        self,
        mut offers: SignalStream,
        mut subscription: SessionResources,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut stop => break,
                offer = offers.next() => match offer {
                    Some(offer) => self.on_offer(offer),
                    None => {
                        warn!("Offer subscription on {} ended", self.channel.name());
                        let reason =
                            FailureReason::ChannelUnavailable("offer subscription ended".to_string());
                        self.status.send_replace(status_text(
                            Role::Responder,
                            &SessionState::Failed(reason),
                            self.locale,
                        ));
                        break;
                    }
                },
            }
        }
        subscription.release();
        debug!("Offer dispatcher for {} finished", self.channel.name());
    }

    /// Forget sessions that reached a terminal state. Their tasks have
    /// already released everything.
    fn prune_ended(&self) {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| !entry.state.borrow().is_terminal());
        let pruned = before - self.sessions.len();
        if pruned > 0 {
            debug!(
                "Pruned {pruned} ended session(s) on {}",
                self.channel.name()
            );
        }
    }

    fn on_offer(&self, offer: SignalingMessage) {
        self.prune_ended();
        let key = SessionKey::for_offer(self.policy, &self.party_id, offer.guest_id.as_ref());
        if let Some(existing) = self.sessions.get(&key) {
            let state = existing.state.borrow().clone();
            if state.is_occupied() {
                debug!("Dropping offer for session {key}: already {state:?}");
                return;
            }
        }
        info!(
            "Received signaling offer for session {key} (nonce {:?})",
            offer.nonce
        );

        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let mut tracker = SessionTracker::new(
            Role::Responder,
            self.locale,
            key.to_string(),
            Arc::new(state_tx),
            Arc::clone(&self.status),
        );
        // Applied here so the slot reads as occupied before the next offer
        tracker.apply(SessionEvent::OfferReceived);

        let (stop_tx, stop_rx) = oneshot::channel();
        let driver = ResponderDriver {
            resources: SessionResources::new(key.to_string()),
            tracker,
            channel: self.channel.clone(),
            sink: Arc::clone(&self.sink),
            answered: false,
        };
        let task = tokio::spawn(driver.run(
            offer,
            Arc::clone(&self.peers),
            stop_rx,
            self.timeout,
        ));
        self.sessions.insert(
            key,
            ResponderEntry {
                state: state_rx,
                stop: Some(stop_tx),
                task: Some(task),
            },
        );
    }
}

struct ResponderDriver {
    tracker: SessionTracker,
    resources: SessionResources,
    channel: PartyChannel,
    sink: Arc<dyn PlaybackSink>,
    answered: bool,
}

impl ResponderDriver {
    async fn run(
        mut self,
        offer: SignalingMessage,
        peers: Arc<dyn PeerConnectionFactory>,
        mut stop: oneshot::Receiver<()>,
        timeout: Duration,
    ) -> SessionState {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        if let Some(mut events) = self.connect(&offer, peers.as_ref()).await {
            while !self.tracker.state().is_terminal() {
                let connected = self.tracker.state().is_connected();
                tokio::select! {
                    _ = &mut stop => {
                        self.tracker.apply(SessionEvent::CloseRequested);
                    }
                    event = events.recv() => self.on_peer_event(&offer, event).await,
                    _ = &mut deadline, if !connected => {
                        self.tracker.apply(SessionEvent::TransportFailed(
                            "negotiation timed out".to_string(),
                        ));
                    }
                }
            }
        }

        self.resources.release();
        self.tracker.state().clone()
    }

    /// Create the connection and hand it the offer. The answer comes back
    /// as a `PeerEvent::Signal`.
    async fn connect(
        &mut self,
        offer: &SignalingMessage,
        peers: &dyn PeerConnectionFactory,
    ) -> Option<mpsc::Receiver<PeerEvent>> {
        let (connection, events) = match peers.create(Role::Responder, None).await {
            Ok(created) => created,
            Err(e) => {
                self.tracker
                    .apply(SessionEvent::TransportFailed(e.to_string()));
                return None;
            }
        };
        self.resources.set_connection(Arc::clone(&connection));

        if let Err(e) = self
            .tracker
            .machine_mut()
            .set_remote_descriptor(offer.descriptor.clone())
        {
            warn!("Session {}: {e}", self.tracker.label());
        }
        if let Err(e) = connection
            .apply_remote_descriptor(offer.descriptor.clone())
            .await
        {
            self.tracker
                .apply(SessionEvent::TransportFailed(e.to_string()));
            return None;
        }
        Some(events)
    }

    async fn on_peer_event(&mut self, offer: &SignalingMessage, event: Option<PeerEvent>) {
        match event {
            Some(PeerEvent::Signal(descriptor)) => {
                if self.answered {
                    debug!(
                        "Ignoring extra local descriptor for session {}",
                        self.tracker.label()
                    );
                    return;
                }
                self.answered = true;
                if let Err(e) = self
                    .tracker
                    .machine_mut()
                    .set_local_descriptor(descriptor.clone())
                {
                    warn!("Session {}: {e}", self.tracker.label());
                }
                match self.channel.publish_answer(offer, descriptor).await {
                    Ok(_) => info!("Sent answer for session {}", self.tracker.label()),
                    Err(e) => {
                        self.tracker
                            .apply(SessionEvent::ChannelUnavailable(e.to_string()));
                    }
                }
            }
            Some(PeerEvent::Stream(track)) => {
                info!(
                    "Playing remote track {} for session {}",
                    track.id,
                    self.tracker.label()
                );
                let id = self.sink.attach(track);
                self.resources.set_playback(Arc::clone(&self.sink), id);
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
        }
    }
}

/// Controls a running listener.
///
/// Dropping the handle stops the dispatcher and every session it started.
pub struct ListenerHandle {
    sessions: Arc<DashMap<SessionKey, ResponderEntry>>,
    stop: Option<oneshot::Sender<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Number of sessions that are negotiating or connected.
    pub fn session_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.state.borrow().is_terminal())
            .count()
    }

    pub fn session_state(&self, key: &SessionKey) -> Option<SessionState> {
        self.sessions
            .get(key)
            .map(|entry| entry.state.borrow().clone())
    }

    pub fn session_watch(&self, key: &SessionKey) -> Option<watch::Receiver<SessionState>> {
        self.sessions.get(key).map(|entry| entry.state.clone())
    }

    pub fn sessions(&self) -> Vec<(SessionKey, SessionState)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.state.borrow().clone()))
            .collect()
    }

    /// Stop taking offers, close every session and unsubscribe. A second
    /// call does nothing.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(dispatcher) = self.dispatcher.take()
            && let Err(e) = dispatcher.await
        {
            warn!("Offer dispatcher ended abnormally: {e}");
        }

        let mut tasks = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            if let Some(stop) = entry.stop.take() {
                let _ = stop.send(());
            }
            if let Some(task) = entry.task.take() {
                tasks.push((entry.key().clone(), task));
            }
        }
        for (key, task) in tasks {
            match task.await {
                Ok(state) => debug!("Session {key} ended as {state:?}"),
                Err(e) => warn!("Session {key} task ended abnormally: {e}"),
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        for mut entry in self.sessions.iter_mut() {
            if let Some(stop) = entry.stop.take() {
                let _ = stop.send(());
            }
        }
    }
}
