// tests/party_session_test.rs
//
// Singer and listener agents talking over the in-memory relay with the
// loopback peer network standing in for WebRTC.

use std::sync::Arc;
use std::time::Duration;

use partymic::audio::EffectKind;
use partymic::core::{FailureReason, SessionDescriptor, SignalKind, SignalingMessage};
use partymic::relay::InMemoryRelay;
use partymic::signaling::PartyChannel;
use partymic::test_utils::{DestroyBehavior, FakeMicrophone, LoopbackNetwork, RecordingSink};
use partymic::{
    AgentConfig, GuestId, ListenerAgent, Locale, Nonce, PartyId, SessionError, SessionKey,
    SessionPolicy, SessionState, SingerAgent,
};
use tokio::sync::watch;

const CHANNEL: &str = "webrtc-party-42";
const WAIT: Duration = Duration::from_secs(5);

struct Party {
    relay: Arc<InMemoryRelay>,
    network: LoopbackNetwork,
    sink: Arc<RecordingSink>,
}

impl Party {
    fn new() -> Self {
        Self::with_relay(InMemoryRelay::new())
    }

    fn with_relay(relay: InMemoryRelay) -> Self {
        Self {
            relay: Arc::new(relay),
            network: LoopbackNetwork::new(),
            sink: Arc::new(RecordingSink::new()),
        }
    }

    fn singer(&self, guest: &str, mic: &Arc<FakeMicrophone>) -> SingerAgent {
        let mut config = AgentConfig::for_party("42");
        config.guest_id = Some(GuestId::new(guest));
        self.singer_with(config, mic)
    }

    fn singer_with(&self, config: AgentConfig, mic: &Arc<FakeMicrophone>) -> SingerAgent {
        SingerAgent::new(
            config,
            self.relay.clone(),
            mic.clone(),
            Arc::new(self.network.clone()),
        )
    }

    fn listener(&self, policy: SessionPolicy) -> ListenerAgent {
        let mut config = AgentConfig::for_party("42");
        config.session_policy = policy;
        ListenerAgent::new(
            config,
            self.relay.clone(),
            Arc::new(self.network.clone()),
            self.sink.clone(),
        )
    }
}

fn party_key() -> SessionKey {
    SessionKey::for_offer(SessionPolicy::OnePerParty, &PartyId::new("42"), None)
}

async fn wait_until(
    mut state: watch::Receiver<SessionState>,
    check: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    tokio::time::timeout(WAIT, state.wait_for(check))
        .await
        .expect("timed out waiting for session state")
        .expect("state channel closed")
        .clone()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_singer_reaches_listener_and_audio_flows() {
    let party = Party::new();
    let mic = Arc::new(FakeMicrophone::granting());

    let listener = party.listener(SessionPolicy::OnePerParty);
    let listener_status = listener.status();
    let handle = listener.listen().await.unwrap();
    assert_eq!(*listener_status.borrow(), "Waiting for a singer");

    let singer = party.singer("alice", &mic);
    let singer_status = singer.status();
    let session = singer.start().await.unwrap();

    wait_until(session.state_watch(), |s| s.is_connected()).await;
    let listener_state = wait_until(handle.session_watch(&party_key()).unwrap(), |s| {
        s.is_connected()
    })
    .await;
    assert_eq!(listener_state, SessionState::Connected);
    assert_eq!(*singer_status.borrow(), "Connected");
    assert_eq!(*listener_status.borrow(), "Singer connected");

    let published = party.relay.published(CHANNEL);
    assert_eq!(published.len(), 2);
    assert!(published[0].get("offer").is_some());
    assert_eq!(published[0]["guestId"], "alice");
    assert!(published[1].get("answer").is_some());
    assert_eq!(published[1]["nonce"], published[0]["nonce"]);

    assert_eq!(party.sink.attach_count(), 1);
    assert!(party.sink.wait_for_frames(3, WAIT).await);
}

#[tokio::test]
async fn test_capture_denied_publishes_nothing() {
    let party = Party::new();
    let mic = Arc::new(FakeMicrophone::denying());
    let singer = party.singer("alice", &mic);
    let status = singer.status();

    let result = singer.start().await;
    assert!(matches!(result, Err(SessionError::MediaDenied)));
    assert_eq!(
        *singer.state().borrow(),
        SessionState::Failed(FailureReason::MediaDenied)
    );
    assert!(status.borrow().contains("denied"));
    assert!(party.relay.published(CHANNEL).is_empty());
    assert_eq!(party.network.created_count(), 0);
}

#[tokio::test]
async fn test_capture_denied_in_spanish() {
    let party = Party::new();
    let mic = Arc::new(FakeMicrophone::denying());
    let mut config = AgentConfig::for_party("42");
    config.locale = Locale::Es;
    let singer = party.singer_with(config, &mic);

    assert!(singer.start().await.is_err());
    assert!(singer.status().borrow().contains("denegado"));
}

#[tokio::test]
async fn test_rapid_offers_create_one_responder_session() {
    let party = Party::new();
    let handle = party
        .listener(SessionPolicy::OnePerParty)
        .listen()
        .await
        .unwrap();

    let mic = Arc::new(FakeMicrophone::granting());
    let alice = party.singer("alice", &mic);
    let bob = party.singer("bob", &mic);
    let (a, b) = tokio::join!(alice.start(), bob.start());
    let (a, b) = (a.unwrap(), b.unwrap());

    eventually(|| handle.session_watch(&party_key()).is_some()).await;
    wait_until(handle.session_watch(&party_key()).unwrap(), |s| s.is_connected()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let connected = [a.current_state(), b.current_state()]
        .iter()
        .filter(|s| s.is_connected())
        .count();
    assert_eq!(connected, 1);
    // Two initiators and a single responder
    assert_eq!(party.network.created_count(), 3);
    assert_eq!(handle.sessions().len(), 1);
    assert_eq!(party.sink.attach_count(), 1);
}

#[tokio::test]
async fn test_connected_listener_ignores_second_offer() {
    let party = Party::new();
    let handle = party
        .listener(SessionPolicy::OnePerParty)
        .listen()
        .await
        .unwrap();
    let mic = Arc::new(FakeMicrophone::granting());

    let first = party.singer("alice", &mic).start().await.unwrap();
    wait_until(first.state_watch(), |s| s.is_connected()).await;

    let second = party.singer("bob", &mic).start().await.unwrap();
    eventually(|| party.relay.published(CHANNEL).len() == 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(second.current_state(), SessionState::Negotiating);
    assert_eq!(
        handle.session_state(&party_key()),
        Some(SessionState::Connected)
    );
    assert_eq!(party.network.created_count(), 3);
    assert_eq!(party.sink.attach_count(), 1);
}

#[tokio::test]
async fn test_per_guest_policy_allows_two_singers() {
    let party = Party::new();
    let handle = party
        .listener(SessionPolicy::PerGuest)
        .listen()
        .await
        .unwrap();
    let mic = Arc::new(FakeMicrophone::granting());

    let mut alice = party.singer("alice", &mic).start().await.unwrap();
    let bob = party.singer("bob", &mic).start().await.unwrap();
    wait_until(alice.state_watch(), |s| s.is_connected()).await;
    wait_until(bob.state_watch(), |s| s.is_connected()).await;

    assert_eq!(handle.session_count(), 2);
    let guest_key = |guest: &str| {
        SessionKey::for_offer(
            SessionPolicy::PerGuest,
            &PartyId::new("42"),
            Some(&GuestId::new(guest)),
        )
    };
    assert_eq!(
        handle.session_state(&guest_key("alice")),
        Some(SessionState::Connected)
    );
    assert_eq!(party.sink.attach_count(), 2);
    eventually(|| party.sink.playing_count() == 2).await;

    // Alice leaving must not silence Bob
    alice.stop().await;
    wait_until(handle.session_watch(&guest_key("alice")).unwrap(), |s| {
        s.is_terminal()
    })
    .await;
    eventually(|| party.sink.detach_count() == 1).await;
    assert_eq!(party.sink.playing_count(), 1);
    assert_eq!(
        handle.session_state(&guest_key("bob")),
        Some(SessionState::Connected)
    );

    let before = party.sink.frame_count();
    assert!(party.sink.wait_for_frames(before + 5, WAIT).await);
}

#[tokio::test]
async fn test_ended_sessions_are_forgotten_on_next_offer() {
    let party = Party::new();
    let handle = party
        .listener(SessionPolicy::PerGuest)
        .listen()
        .await
        .unwrap();
    let mic = Arc::new(FakeMicrophone::granting());

    for guest in ["alice", "bob", "carol"] {
        let mut session = party.singer(guest, &mic).start().await.unwrap();
        wait_until(session.state_watch(), |s| s.is_connected()).await;
        session.stop().await;
        eventually(|| handle.session_count() == 0).await;
    }
    // Only the last ended session is still listed
    assert_eq!(handle.sessions().len(), 1);

    let dave = party.singer("dave", &mic).start().await.unwrap();
    wait_until(dave.state_watch(), |s| s.is_connected()).await;
    let dave_key = SessionKey::for_offer(
        SessionPolicy::PerGuest,
        &PartyId::new("42"),
        Some(&GuestId::new("dave")),
    );
    wait_until(handle.session_watch(&dave_key).unwrap(), |s| s.is_connected()).await;
    let sessions = handle.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].1, SessionState::Connected);
}

#[tokio::test]
async fn test_redelivered_signaling_is_handled_once() {
    let party = Party::with_relay(InMemoryRelay::new().with_redelivery());
    let handle = party
        .listener(SessionPolicy::OnePerParty)
        .listen()
        .await
        .unwrap();
    let mic = Arc::new(FakeMicrophone::granting());

    let session = party.singer("alice", &mic).start().await.unwrap();
    wait_until(session.state_watch(), |s| s.is_connected()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(session.current_state(), SessionState::Connected);
    assert_eq!(party.network.created_count(), 2);
    assert_eq!(handle.sessions().len(), 1);
    assert_eq!(party.sink.attach_count(), 1);
}

#[tokio::test]
async fn test_answer_with_foreign_nonce_is_ignored() {
    let party = Party::new();
    let mic = Arc::new(FakeMicrophone::granting());
    let session = party.singer("alice", &mic).start().await.unwrap();
    eventually(|| party.relay.published(CHANNEL).len() == 1).await;

    let offer = SignalingMessage::decode(&party.relay.published(CHANNEL)[0]).unwrap();
    let link = offer
        .descriptor
        .sdp()
        .and_then(|sdp| sdp.strip_prefix("loopback-offer-"))
        .unwrap()
        .to_string();
    let stranger = SignalingMessage::offer(
        offer.descriptor.clone(),
        GuestId::new("alice"),
        Nonce::new("someone-else"),
    );
    let channel = PartyChannel::new(party.relay.clone(), PartyId::new("42"));
    channel
        .publish_answer(
            &stranger,
            SessionDescriptor::from_sdp(SignalKind::Answer, format!("loopback-answer-{link}")),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.current_state(), SessionState::Negotiating);
}

#[tokio::test]
async fn test_stop_closes_both_sides_and_releases_microphone() {
    let party = Party::new();
    let handle = party
        .listener(SessionPolicy::OnePerParty)
        .listen()
        .await
        .unwrap();
    let mic = Arc::new(FakeMicrophone::granting());
    let singer = party.singer("alice", &mic);
    let mut session = singer.start().await.unwrap();
    wait_until(session.state_watch(), |s| s.is_connected()).await;

    assert_eq!(session.stop().await, SessionState::Closed);
    assert!(mic.all_stopped());
    assert_eq!(*singer.status().borrow(), "Disconnected");

    wait_until(handle.session_watch(&party_key()).unwrap(), |s| {
        *s == SessionState::Closed
    })
    .await;
    eventually(|| party.sink.detach_count() == 1).await;
    // Only the listener's offer subscription is left
    assert_eq!(party.relay.subscriber_count(CHANNEL), 1);

    // Closing again is a no-op
    assert_eq!(session.stop().await, SessionState::Closed);
}

#[tokio::test]
async fn test_listener_accepts_a_new_singer_after_close() {
    let party = Party::new();
    let handle = party
        .listener(SessionPolicy::OnePerParty)
        .listen()
        .await
        .unwrap();
    let mic = Arc::new(FakeMicrophone::granting());

    let mut first = party.singer("alice", &mic).start().await.unwrap();
    wait_until(first.state_watch(), |s| s.is_connected()).await;
    first.stop().await;
    wait_until(handle.session_watch(&party_key()).unwrap(), |s| s.is_terminal()).await;

    let second = party.singer("bob", &mic).start().await.unwrap();
    wait_until(second.state_watch(), |s| s.is_connected()).await;
    assert_eq!(party.sink.attach_count(), 2);
}

#[tokio::test]
async fn test_transport_failure_reports_connection_failed() {
    let party = Party::new();
    party.network.fail_negotiation("ice failed");
    let handle = party
        .listener(SessionPolicy::OnePerParty)
        .listen()
        .await
        .unwrap();
    let mic = Arc::new(FakeMicrophone::granting());
    let singer = party.singer("alice", &mic);
    let status = singer.status();
    let session = singer.start().await.unwrap();

    let end = wait_until(session.state_watch(), |s| s.is_terminal()).await;
    assert_eq!(
        end,
        SessionState::Failed(FailureReason::Negotiation("ice failed".to_string()))
    );
    assert!(status.borrow().contains("Connection failed"));
    eventually(|| mic.all_stopped()).await;

    let listener_end =
        wait_until(handle.session_watch(&party_key()).unwrap(), |s| s.is_terminal()).await;
    assert!(matches!(listener_end, SessionState::Failed(_)));
    eventually(|| party.relay.subscriber_count(CHANNEL) == 1).await;
}

#[tokio::test]
async fn test_negotiation_times_out_without_listener() {
    let party = Party::new();
    let mic = Arc::new(FakeMicrophone::granting());
    let mut config = AgentConfig::for_party("42");
    config.negotiation_timeout_secs = 1;
    let session = party.singer_with(config, &mic).start().await.unwrap();

    let end = wait_until(session.state_watch(), |s| s.is_terminal()).await;
    assert_eq!(
        end,
        SessionState::Failed(FailureReason::Negotiation(
            "negotiation timed out".to_string()
        ))
    );
    eventually(|| mic.all_stopped()).await;
    eventually(|| party.relay.subscriber_count(CHANNEL) == 0).await;
}

#[tokio::test]
async fn test_unavailable_channel_fails_both_agents() {
    let party = Party::new();
    party.relay.set_available(false);

    let listener = party.listener(SessionPolicy::OnePerParty);
    assert!(matches!(
        listener.listen().await,
        Err(SessionError::ChannelUnavailable(_))
    ));
    assert_eq!(
        *listener.status().borrow(),
        "Error: Signaling channel unavailable"
    );

    let mic = Arc::new(FakeMicrophone::granting());
    let singer = party.singer("alice", &mic);
    assert!(matches!(
        singer.start().await,
        Err(SessionError::ChannelUnavailable(_))
    ));
    assert_eq!(
        *singer.status().borrow(),
        "Error: Signaling channel unavailable"
    );
    assert!(mic.all_stopped());
}

#[tokio::test]
async fn test_relay_loss_mid_negotiation_fails_session() {
    let party = Party::new();
    let mic = Arc::new(FakeMicrophone::granting());
    let session = party.singer("alice", &mic).start().await.unwrap();
    eventually(|| party.relay.published(CHANNEL).len() == 1).await;

    party.relay.set_available(false);
    let end = wait_until(session.state_watch(), |s| s.is_terminal()).await;
    assert!(matches!(
        end,
        SessionState::Failed(FailureReason::ChannelUnavailable(_))
    ));
    eventually(|| mic.all_stopped()).await;
}

#[tokio::test]
async fn test_microphone_stops_when_destroy_fails() {
    for behavior in [DestroyBehavior::Fail, DestroyBehavior::Panic] {
        let party = Party::new();
        party.network.set_destroy_behavior(behavior);
        let _handle = party
            .listener(SessionPolicy::OnePerParty)
            .listen()
            .await
            .unwrap();
        let mic = Arc::new(FakeMicrophone::granting());
        let mut session = party.singer("alice", &mic).start().await.unwrap();
        wait_until(session.state_watch(), |s| s.is_connected()).await;

        assert_eq!(session.stop().await, SessionState::Closed);
        assert!(mic.all_stopped(), "{behavior:?}");
        assert_eq!(party.network.destroyed_count(), 1, "{behavior:?}");
        assert_eq!(party.relay.subscriber_count(CHANNEL), 1, "{behavior:?}");
    }
}

#[tokio::test]
async fn test_dropping_the_session_closes_it() {
    let party = Party::new();
    let mic = Arc::new(FakeMicrophone::granting());
    let singer = party.singer("alice", &mic);
    let session = singer.start().await.unwrap();
    let state = singer.state();
    drop(session);
    // Released before the background task gets to run
    assert!(mic.all_stopped());
    assert_eq!(party.relay.subscriber_count(CHANNEL), 0);

    let end = wait_until(state, |s| s.is_terminal()).await;
    assert_eq!(end, SessionState::Closed);
}

#[tokio::test]
async fn test_listener_stop_closes_sessions_and_unsubscribes() {
    let party = Party::new();
    let mut handle = party
        .listener(SessionPolicy::OnePerParty)
        .listen()
        .await
        .unwrap();
    let mic = Arc::new(FakeMicrophone::granting());
    let session = party.singer("alice", &mic).start().await.unwrap();
    wait_until(session.state_watch(), |s| s.is_connected()).await;

    handle.stop().await;
    assert_eq!(
        handle.session_state(&party_key()),
        Some(SessionState::Closed)
    );
    assert_eq!(handle.session_count(), 0);

    // The singer sees the transport close
    let end = wait_until(session.state_watch(), |s| s.is_terminal()).await;
    assert_eq!(end, SessionState::Closed);
    eventually(|| party.relay.subscriber_count(CHANNEL) == 0).await;
    handle.stop().await;
}

#[tokio::test]
async fn test_gain_and_effect_controls_on_running_session() {
    let party = Party::new();
    let mic = Arc::new(FakeMicrophone::granting());
    let session = party.singer("alice", &mic).start().await.unwrap();

    // Starts muted
    assert_eq!(session.effective_gain(), 0.0);
    assert_eq!(session.set_gain(3.0), 2.0);
    session.set_muted(false);
    assert_eq!(session.effective_gain(), 2.0);

    session.set_effect(EffectKind::Reverb);
    session.set_effect(EffectKind::None);
    session.set_effect(EffectKind::Reverb);
    assert_eq!(session.effect(), EffectKind::Reverb);
    let graph = session.graph();
    assert_eq!(graph.lock().unwrap().effect_node_count(), 1);
}
