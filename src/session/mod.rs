//! Session runtime: the singer and listener agents plus the pieces they
//! share.
//!
//! Each session is driven by one task that feeds relay deliveries and
//! transport events into a [`SessionMachine`]. Everything a session acquires
//! is owned by a [`SessionResources`] and released in one place when the
//! session ends, whatever the reason.

pub mod listener;
pub mod singer;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use partymic_core::{Locale, Role, SessionEvent, SessionMachine, SessionState, status_text};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::media::{PeerConnection, PlaybackId, PlaybackSink, TrackControl};
use crate::relay::{SignalingRelay, SubscriptionHandle};

pub use listener::{ListenerAgent, ListenerHandle};
pub use singer::{SingerAgent, SingerSession};

pub(crate) fn lock_resources(
    resources: &Mutex<SessionResources>,
) -> MutexGuard<'_, SessionResources> {
    resources
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything one session holds that must be given back when it ends.
///
/// [`release`](Self::release) stops the microphone track and cancels the
/// relay subscription even when destroying the connection fails or panics.
pub struct SessionResources {
    label: String,
    track: Option<Arc<dyn TrackControl>>,
    connection: Option<Arc<dyn PeerConnection>>,
    subscription: Option<(Arc<dyn SignalingRelay>, SubscriptionHandle)>,
    playback: Option<(Arc<dyn PlaybackSink>, PlaybackId)>,
    pump: Option<AbortHandle>,
    released: bool,
}

impl SessionResources {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            track: None,
            connection: None,
            subscription: None,
            playback: None,
            pump: None,
            released: false,
        }
    }

    pub fn set_track(&mut self, track: Arc<dyn TrackControl>) {
        self.track = Some(track);
    }

    pub fn set_connection(&mut self, connection: Arc<dyn PeerConnection>) {
        self.connection = Some(connection);
    }

    pub fn set_subscription(&mut self, relay: Arc<dyn SignalingRelay>, handle: SubscriptionHandle) {
        self.subscription = Some((relay, handle));
    }

    /// Record a track playing on `sink`. A track recorded earlier is
    /// detached first.
    pub fn set_playback(&mut self, sink: Arc<dyn PlaybackSink>, id: PlaybackId) {
        if let Some((previous, previous_id)) = self.playback.replace((sink, id)) {
            previous.detach(previous_id);
        }
    }

    pub fn set_pump(&mut self, pump: AbortHandle) {
        self.pump = Some(pump);
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Give everything back. Safe to call any number of times.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        debug!("Releasing resources of session {}", self.label);

        let label = self.label.clone();
        let _stop_track = scopeguard::guard(self.track.take(), |track| {
            if let Some(track) = track {
                track.stop();
                debug!("Stopped microphone track of session {label}");
            }
        });
        let _unsubscribe = scopeguard::guard(self.subscription.take(), |subscription| {
            if let Some((relay, handle)) = subscription {
                relay.unsubscribe(&handle);
            }
        });

        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some((sink, id)) = self.playback.take() {
            sink.detach(id);
        }
        if let Some(connection) = self.connection.take() {
            match catch_unwind(AssertUnwindSafe(|| connection.destroy())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "Failed to close connection of session {}: {e}",
                    self.label
                ),
                Err(_) => warn!(
                    "Closing the connection of session {} panicked",
                    self.label
                ),
            }
        }
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns a session's state machine and publishes every change to the
/// agent's watch channels.
pub struct SessionTracker {
    machine: SessionMachine,
    locale: Locale,
    label: String,
    state: Arc<watch::Sender<SessionState>>,
    status: Arc<watch::Sender<String>>,
}

impl SessionTracker {
    pub fn new(
        role: Role,
        locale: Locale,
        label: impl Into<String>,
        state: Arc<watch::Sender<SessionState>>,
        status: Arc<watch::Sender<String>>,
    ) -> Self {
        let tracker = Self {
            machine: SessionMachine::new(role),
            locale,
            label: label.into(),
            state,
            status,
        };
        tracker.publish();
        tracker
    }

    pub fn state(&self) -> &SessionState {
        self.machine.state()
    }

    pub fn machine(&self) -> &SessionMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut SessionMachine {
        &mut self.machine
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Feed one event into the machine. Events that are not valid in the
    /// current state are logged and dropped.
    pub fn apply(&mut self, event: SessionEvent) -> &SessionState {
        match self.machine.apply(event) {
            Ok(transition) if transition.changed() => {
                info!(
                    "Session {} ({}): {:?} -> {:?}",
                    self.label,
                    self.machine.role(),
                    transition.from,
                    transition.to
                );
                if let Some(reason) = transition.to.failure() {
                    warn!("Session {} failed: {reason:?}", self.label);
                }
                if transition.to.is_terminal()
                    && let Some(duration) = self.machine.connected_duration()
                {
                    info!(
                        "Session {} was connected for {}s",
                        self.label,
                        duration.num_seconds()
                    );
                }
                self.publish();
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring event for session {}: {e}", self.label),
        }
        self.machine.state()
    }

    fn publish(&self) {
        let state = self.machine.state().clone();
        self.status
            .send_replace(status_text(self.machine.role(), &state, self.locale));
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TransportError;
    use crate::relay::InMemoryRelay;
    use async_trait::async_trait;
    use partymic_core::{FailureReason, SessionDescriptor};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Track(AtomicBool);

    impl TrackControl for Track {
        fn stop(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
        fn is_stopped(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    enum Destroy {
        Ok,
        Fail,
        Panic,
    }

    struct Connection {
        destroy: Destroy,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeerConnection for Connection {
        async fn apply_remote_descriptor(
            &self,
            _descriptor: SessionDescriptor,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        fn destroy(&self) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.destroy {
                Destroy::Ok => Ok(()),
                Destroy::Fail => Err(TransportError::Closed),
                Destroy::Panic => panic!("destroy exploded"),
            }
        }
    }

    async fn resources_with(
        destroy: Destroy,
    ) -> (
        SessionResources,
        Arc<Track>,
        Arc<Connection>,
        Arc<InMemoryRelay>,
    ) {
        let relay = Arc::new(InMemoryRelay::new());
        let sub = relay.subscribe("webrtc-party-1", "signal").await.unwrap();
        let track = Arc::new(Track::default());
        let connection = Arc::new(Connection {
            destroy,
            calls: AtomicUsize::new(0),
        });

        let mut resources = SessionResources::new("test");
        resources.set_track(track.clone());
        resources.set_connection(connection.clone());
        resources.set_subscription(relay.clone(), sub.handle().clone());
        (resources, track, connection, relay)
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (mut resources, track, connection, relay) = resources_with(Destroy::Ok).await;
        resources.release();
        resources.release();
        drop(resources);

        assert!(track.is_stopped());
        assert_eq!(connection.calls.load(Ordering::SeqCst), 1);
        assert_eq!(relay.subscriber_count("webrtc-party-1"), 0);
    }

    #[tokio::test]
    async fn test_track_stops_when_destroy_fails() {
        let (mut resources, track, _connection, relay) = resources_with(Destroy::Fail).await;
        resources.release();
        assert!(track.is_stopped());
        assert_eq!(relay.subscriber_count("webrtc-party-1"), 0);
    }

    #[tokio::test]
    async fn test_track_stops_when_destroy_panics() {
        let (mut resources, track, _connection, relay) = resources_with(Destroy::Panic).await;
        resources.release();
        assert!(resources.is_released());
        assert!(track.is_stopped());
        assert_eq!(relay.subscriber_count("webrtc-party-1"), 0);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let (resources, track, connection, _relay) = resources_with(Destroy::Ok).await;
        drop(resources);
        assert!(track.is_stopped());
        assert_eq!(connection.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tracker_publishes_status_and_state() {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (status_tx, status_rx) = watch::channel(String::new());
        let mut tracker = SessionTracker::new(
            Role::Initiator,
            Locale::En,
            "t",
            Arc::new(state_tx),
            Arc::new(status_tx),
        );
        assert_eq!(*status_rx.borrow(), "Microphone off");

        tracker.apply(SessionEvent::CaptureRequested);
        tracker.apply(SessionEvent::CaptureDenied);
        assert_eq!(
            *state_rx.borrow(),
            SessionState::Failed(FailureReason::MediaDenied)
        );
        assert!(status_rx.borrow().contains("denied"));

        // Closing a failed session changes nothing
        tracker.apply(SessionEvent::CloseRequested);
        assert!(matches!(*state_rx.borrow(), SessionState::Failed(_)));
    }

    #[test]
    fn test_tracker_ignores_invalid_events() {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (status_tx, _status_rx) = watch::channel(String::new());
        let mut tracker = SessionTracker::new(
            Role::Responder,
            Locale::Es,
            "t",
            Arc::new(state_tx),
            Arc::new(status_tx),
        );
        tracker.apply(SessionEvent::CaptureGranted);
        assert_eq!(*tracker.state(), SessionState::Idle);
        assert_eq!(*state_rx.borrow(), SessionState::Idle);
    }
}
