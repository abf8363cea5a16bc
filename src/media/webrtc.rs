//! Peer transport on the `webrtc` crate.
//!
//! Negotiation is non-trickle: the local description is only reported after
//! ICE gathering completes, so exactly one offer and one answer cross the
//! relay. Audio travels as PCMU (G.711 µ-law, 8 kHz mono, 20 ms frames).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use partymic_core::audio::g711::{self, PCMU_FRAME_MS, PCMU_FRAME_SAMPLES, PCMU_SAMPLE_RATE};
use partymic_core::{Role, SessionDescriptor};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::goodbye::Goodbye;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    PeerConnection, PeerConnectionFactory, PeerEvent, ProcessedAudio, RemoteTrack, TransportError,
};

const EVENT_CHANNEL_CAPACITY: usize = 32;
const REMOTE_FRAME_CAPACITY: usize = 64;
const RTCP_BUFFER_SIZE: usize = 1500;
const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(3);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const GOODBYE_REASON: &[u8] = b"singer left";

type TaskList = Arc<Mutex<Vec<AbortHandle>>>;

fn lock_tasks(tasks: &Mutex<Vec<AbortHandle>>) -> MutexGuard<'_, Vec<AbortHandle>> {
    tasks.lock().unwrap_or_else(|e| e.into_inner())
}

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: PCMU_SAMPLE_RATE,
        channels: 1,
        ..Default::default()
    }
}

/// Creates `webrtc` peer connections using the configured STUN servers.
///
/// Either side leaving is reported to the other as `PeerEvent::Close`: the
/// initiator says goodbye over RTCP before closing, and a lost ICE path or
/// an ended remote track count as closure too.
#[derive(Debug, Clone)]
pub struct WebRtcPeerFactory {
    ice_servers: Vec<String>,
    include_loopback: bool,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            include_loopback: false,
        }
    }

    /// Also gather loopback candidates, so two peers in one host can reach
    /// each other without any other interface.
    pub fn with_loopback_candidates(mut self) -> Self {
        self.include_loopback = true;
        self
    }

    fn create_api(&self) -> Result<webrtc::api::API, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ICE_FAILED_TIMEOUT),
            Some(ICE_KEEPALIVE_INTERVAL),
        );
        setting_engine.set_include_loopback_candidate(self.include_loopback);

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        role: Role,
        audio: Option<ProcessedAudio>,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), TransportError> {
        let api = self.create_api()?;
        let pc = Arc::new(api.new_peer_connection(self.rtc_configuration()).await?);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                info!("Peer connection state ({role}): {state}");
                let event = match state {
                    RTCPeerConnectionState::Connected => Some(PeerEvent::Connect),
                    RTCPeerConnectionState::Failed => {
                        Some(PeerEvent::Error("peer connection failed".to_string()))
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        Some(PeerEvent::Close)
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = tx.send(event).await;
                }
            })
        }));

        let tasks: TaskList = Arc::new(Mutex::new(Vec::new()));
        let mut sender = None;
        match role {
            Role::Initiator => {
                let track = Arc::new(TrackLocalStaticSample::new(
                    pcmu_capability(),
                    "audio".to_owned(),
                    "partymic".to_owned(),
                ));
                let rtp_sender = pc
                    .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
                sender = Some(Arc::clone(&rtp_sender));

                // RTCP must be drained for the interceptors to work
                lock_tasks(&tasks).push(
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
                        while rtp_sender.read(&mut buf).await.is_ok() {}
                    })
                    .abort_handle(),
                );

                match audio {
                    Some(audio) => lock_tasks(&tasks)
                        .push(tokio::spawn(write_pcmu(audio, track)).abort_handle()),
                    None => warn!("Initiator connection created without an audio source"),
                }

                let offer = pc.create_offer(None).await?;
                let descriptor = gather_local_descriptor(&pc, offer).await?;
                events_tx
                    .send(PeerEvent::Signal(descriptor))
                    .await
                    .map_err(|_| TransportError::Closed)?;
            }
            Role::Responder => {
                let track_tx = events_tx.clone();
                let track_tasks = Arc::clone(&tasks);
                pc.on_track(Box::new(
                    move |track: Arc<TrackRemote>,
                          receiver: Arc<RTCRtpReceiver>,
                          _transceiver: Arc<RTCRtpTransceiver>| {
                        let tx = track_tx.clone();
                        let tasks = Arc::clone(&track_tasks);
                        Box::pin(async move {
                            let (frames_tx, frames_rx) = mpsc::channel(REMOTE_FRAME_CAPACITY);
                            let remote = RemoteTrack {
                                id: track.id(),
                                sample_rate: PCMU_SAMPLE_RATE,
                                frames: frames_rx,
                            };
                            info!("Remote track {} arrived", remote.id);
                            let ssrc = track.ssrc();
                            {
                                let mut tasks = lock_tasks(&tasks);
                                tasks.push(
                                    tokio::spawn(read_pcmu(track, frames_tx, tx.clone()))
                                        .abort_handle(),
                                );
                                tasks.push(
                                    tokio::spawn(watch_goodbye(receiver, ssrc, tx.clone()))
                                        .abort_handle(),
                                );
                            }
                            let _ = tx.send(PeerEvent::Stream(remote)).await;
                        })
                    },
                ));
            }
        }

        let peer = WebRtcPeer {
            role,
            pc,
            sender,
            events: events_tx,
            tasks,
        };
        Ok((Arc::new(peer), events_rx))
    }
}

struct WebRtcPeer {
    role: Role,
    pc: Arc<RTCPeerConnection>,
    sender: Option<Arc<RTCRtpSender>>,
    events: mpsc::Sender<PeerEvent>,
    tasks: TaskList,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn apply_remote_descriptor(
        &self,
        descriptor: SessionDescriptor,
    ) -> Result<(), TransportError> {
        let remote: RTCSessionDescription = serde_json::from_value(descriptor.into_value())
            .map_err(|e| TransportError::Descriptor(e.to_string()))?;
        self.pc.set_remote_description(remote).await?;

        if self.role == Role::Responder {
            let answer = self.pc.create_answer(None).await?;
            let local = gather_local_descriptor(&self.pc, answer).await?;
            self.events
                .send(PeerEvent::Signal(local))
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    fn destroy(&self) -> Result<(), TransportError> {
        for task in lock_tasks(&self.tasks).drain(..) {
            task.abort();
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|_| TransportError::Closed)?;
        let pc = Arc::clone(&self.pc);
        let sender = self.sender.clone();
        handle.spawn(async move {
            if let Some(sender) = sender {
                send_goodbye(&pc, &sender).await;
            }
            if let Err(e) = pc.close().await {
                warn!("Failed to close peer connection: {e}");
            }
        });
        Ok(())
    }
}

/// Set the local description and wait for ICE gathering so the returned
/// descriptor carries every candidate.
async fn gather_local_descriptor(
    pc: &RTCPeerConnection,
    description: RTCSessionDescription,
) -> Result<SessionDescriptor, TransportError> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description).await?;
    let _ = gathered.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| TransportError::Descriptor("no local description".to_string()))?;
    let value =
        serde_json::to_value(&local).map_err(|e| TransportError::Descriptor(e.to_string()))?;
    Ok(SessionDescriptor::new(value))
}

async fn write_pcmu(mut audio: ProcessedAudio, track: Arc<TrackLocalStaticSample>) {
    let mut pending: Vec<f32> = Vec::with_capacity(PCMU_FRAME_SAMPLES * 2);
    while let Some(frame) = audio.frames.recv().await {
        pending.extend(g711::resample_linear(
            &frame,
            audio.sample_rate,
            PCMU_SAMPLE_RATE,
        ));
        while pending.len() >= PCMU_FRAME_SAMPLES {
            let chunk: Vec<f32> = pending.drain(..PCMU_FRAME_SAMPLES).collect();
            let sample = Sample {
                data: Bytes::from(g711::encode_frame(&chunk)),
                duration: Duration::from_millis(PCMU_FRAME_MS as u64),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("Dropping PCMU frame: {e}");
            }
        }
    }
    debug!("Processed audio ended, PCMU writer stopping");
}

/// Decode the remote PCMU stream. The track ending means the other side is
/// gone; playback stopping locally does not.
async fn read_pcmu(
    track: Arc<TrackRemote>,
    frames: mpsc::Sender<Vec<f32>>,
    events: mpsc::Sender<PeerEvent>,
) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if frames.send(g711::decode_frame(&packet.payload)).await.is_err() {
                    debug!("Remote track {} no longer played", track.id());
                    return;
                }
            }
            Err(e) => {
                debug!("Remote track ended: {e}");
                let _ = events.send(PeerEvent::Close).await;
                return;
            }
        }
    }
}

async fn send_goodbye(pc: &RTCPeerConnection, sender: &RTCRtpSender) {
    let sources: Vec<u32> = sender
        .get_parameters()
        .await
        .encodings
        .iter()
        .map(|encoding| encoding.ssrc)
        .collect();
    let packets: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![Box::new(Goodbye {
        sources,
        reason: Bytes::from_static(GOODBYE_REASON),
    })];
    if let Err(e) = pc.write_rtcp(&packets).await {
        debug!("Could not send RTCP goodbye: {e}");
    }
}

fn is_goodbye_for(packet: &(dyn RtcpPacket + Send + Sync), ssrc: u32) -> bool {
    packet
        .as_any()
        .downcast_ref::<Goodbye>()
        .is_some_and(|bye| bye.sources.is_empty() || bye.sources.contains(&ssrc))
}

async fn watch_goodbye(
    receiver: Arc<RTCRtpReceiver>,
    ssrc: u32,
    events: mpsc::Sender<PeerEvent>,
) {
    while let Ok((packets, _)) = receiver.read_rtcp().await {
        if packets.iter().any(|packet| is_goodbye_for(packet.as_ref(), ssrc)) {
            info!("Remote peer said goodbye on track {ssrc}");
            let _ = events.send(PeerEvent::Close).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pcmu_capability() {
        let cap = pcmu_capability();
        assert_eq!(cap.mime_type, "audio/PCMU");
        assert_eq!(cap.clock_rate, 8_000);
        assert_eq!(cap.channels, 1);
    }

    #[test]
    fn test_empty_ice_server_list() {
        let factory = WebRtcPeerFactory::new(Vec::new());
        assert!(factory.rtc_configuration().ice_servers.is_empty());

        let factory = WebRtcPeerFactory::new(vec!["stun:stun.example.org:3478".into()]);
        let config = factory.rtc_configuration();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.example.org:3478"]);
    }

    #[test]
    fn test_goodbye_matches_track() {
        let bye = Goodbye {
            sources: vec![7],
            reason: Bytes::from_static(GOODBYE_REASON),
        };
        assert!(is_goodbye_for(&bye, 7));
        assert!(!is_goodbye_for(&bye, 8));

        let anonymous = Goodbye {
            sources: Vec::new(),
            reason: Bytes::new(),
        };
        assert!(is_goodbye_for(&anonymous, 8));
    }

    async fn next_signal(events: &mut mpsc::Receiver<PeerEvent>) -> SessionDescriptor {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
                Ok(Some(PeerEvent::Signal(descriptor))) => return descriptor,
                Ok(Some(other)) => debug!("Skipping {other:?} while waiting for a descriptor"),
                Ok(None) => panic!("event stream ended before a descriptor"),
                Err(_) => panic!("no descriptor within 10s"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_responder_sees_close_when_initiator_leaves() {
        let factory = WebRtcPeerFactory::new(Vec::new()).with_loopback_candidates();

        let (audio_tx, audio_rx) = mpsc::channel(8);
        let audio = ProcessedAudio {
            sample_rate: PCMU_SAMPLE_RATE,
            frames: audio_rx,
        };
        let (initiator, mut init_events) =
            factory.create(Role::Initiator, Some(audio)).await.unwrap();
        let offer = next_signal(&mut init_events).await;

        let (responder, mut resp_events) = factory.create(Role::Responder, None).await.unwrap();
        responder.apply_remote_descriptor(offer).await.unwrap();
        let answer = next_signal(&mut resp_events).await;
        initiator.apply_remote_descriptor(answer).await.unwrap();

        tokio::spawn(async move {
            let frame = vec![0.1_f32; PCMU_FRAME_SAMPLES];
            while audio_tx.send(frame.clone()).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(PCMU_FRAME_MS as u64)).await;
            }
        });

        // Connected with the singer's track playing
        let mut track = None;
        let mut connected = false;
        while track.is_none() || !connected {
            let event = tokio::time::timeout(Duration::from_secs(15), resp_events.recv())
                .await
                .expect("responder never connected");
            match event {
                Some(PeerEvent::Stream(remote)) => track = Some(remote),
                Some(PeerEvent::Connect) => connected = true,
                other => panic!("unexpected responder event {other:?}"),
            }
        }
        let mut track = track.unwrap();
        assert!(track.frames.recv().await.is_some());
        tokio::spawn(async move { while track.frames.recv().await.is_some() {} });

        initiator.destroy().unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(8), async {
            loop {
                match resp_events.recv().await {
                    Some(PeerEvent::Close) => return true,
                    Some(PeerEvent::Error(e)) => panic!("responder failed instead: {e}"),
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await;
        assert!(matches!(closed, Ok(true)), "responder never saw the close");
        responder.destroy().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_remote_descriptor_is_rejected() {
        let factory = WebRtcPeerFactory::new(Vec::new());
        let (peer, _events) = factory.create(Role::Responder, None).await.unwrap();

        let result = peer
            .apply_remote_descriptor(SessionDescriptor::new(json!({ "bogus": true })))
            .await;
        assert!(matches!(result, Err(TransportError::Descriptor(_))));
        peer.destroy().unwrap();
    }
}
