//! Local microphone and speakers through `cpal`.
//!
//! Audio runs on a dedicated thread per stream since `cpal::Stream` is
//! `!Send`. The thread owns the stream and exits when its stop flag is set
//! or its channel closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use log::{error, info, warn};
use partymic_core::audio::g711::resample_linear;
use tokio::sync::{mpsc, oneshot};

use super::{
    CaptureConstraints, CaptureError, CapturedTrack, FRAME_MS, MicrophoneCapture, PlaybackId,
    PlaybackSink, RemoteTrack, TrackControl,
};

const CAPTURE_FRAME_CAPACITY: usize = 64;
const IDLE_POLL: Duration = Duration::from_millis(1);

fn lock_buffer(buffer: &Mutex<Vec<f32>>) -> MutexGuard<'_, Vec<f32>> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct StopFlag(Arc<AtomicBool>);

impl TrackControl for StopFlag {
    fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The default input device of the default host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MicrophoneCapture for CpalMicrophone {
    async fn request_capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<CapturedTrack, CaptureError> {
        // cpal exposes no processing switches; the constraints are hints only
        info!("Opening microphone with {constraints:?}");
        let (tx, frames) = mpsc::channel(CAPTURE_FRAME_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        std::thread::spawn(move || run_capture(tx, thread_stop, ready_tx));

        let sample_rate = ready_rx
            .await
            .map_err(|_| CaptureError::Device("capture thread exited".to_string()))??;
        Ok(CapturedTrack {
            sample_rate,
            frames,
            control: Arc::new(StopFlag(stop)),
        })
    }
}

fn run_capture(
    tx: mpsc::Sender<Vec<f32>>,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<u32, CaptureError>>,
) {
    let opened = open_input(&stop);
    let (stream, buffer, sample_rate) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            error!("Microphone unavailable: {e}");
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(sample_rate)).is_err() {
        return;
    }
    info!("Microphone capture started at {sample_rate} Hz");

    let frame_len = (sample_rate * FRAME_MS / 1000) as usize;
    while !stop.load(Ordering::Relaxed) && !tx.is_closed() {
        let frame: Option<Vec<f32>> = {
            let mut buffer = lock_buffer(&buffer);
            (buffer.len() >= frame_len).then(|| buffer.drain(..frame_len).collect())
        };
        match frame {
            Some(frame) => {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(frame) {
                    warn!("Capture consumer is behind; dropping a frame");
                }
            }
            None => std::thread::sleep(IDLE_POLL),
        }
    }

    drop(stream);
    info!("Microphone capture stopped");
}

fn open_input(
    stop: &Arc<AtomicBool>,
) -> Result<(cpal::Stream, Arc<Mutex<Vec<f32>>>, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
    info!(
        "Audio input device: {}",
        device.name().unwrap_or_default()
    );

    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let config: StreamConfig = supported.into();
    let channels = config.channels.max(1) as usize;
    let sample_rate = config.sample_rate.0;

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::clone(&buffer);
    let error_stop = Arc::clone(stop);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut buffer = lock_buffer(&writer);
                if channels == 1 {
                    buffer.extend_from_slice(data);
                } else {
                    buffer.extend(
                        data.chunks(channels)
                            .map(|chunk| chunk.iter().sum::<f32>() / channels as f32),
                    );
                }
            },
            move |err| {
                error!("Audio input error: {err}");
                error_stop.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    stream
        .play()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    Ok((stream, buffer, sample_rate))
}

/// Plays remote tracks on the default output device.
///
/// Each attached track opens its own output stream and the system mixer
/// combines them, so several singers are heard together.
#[derive(Default)]
pub struct CpalPlaybackSink {
    next_id: AtomicU64,
    playing: Mutex<HashMap<PlaybackId, Arc<AtomicBool>>>,
}

impl CpalPlaybackSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn playing(&self) -> MutexGuard<'_, HashMap<PlaybackId, Arc<AtomicBool>>> {
        self.playing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PlaybackSink for CpalPlaybackSink {
    fn attach(&self, track: RemoteTrack) -> PlaybackId {
        let id = PlaybackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let stop = Arc::new(AtomicBool::new(false));
        self.playing().insert(id, Arc::clone(&stop));

        std::thread::spawn(move || {
            let track_id = track.id.clone();
            if let Err(e) = run_playback(track, stop) {
                error!("Playback of track {track_id} ({id}) failed: {e}");
            }
        });
        id
    }

    fn detach(&self, id: PlaybackId) {
        if let Some(stop) = self.playing().remove(&id) {
            stop.store(true, Ordering::Relaxed);
        }
    }
}

impl Drop for CpalPlaybackSink {
    fn drop(&mut self) {
        for (_, stop) in self.playing().drain() {
            stop.store(true, Ordering::Relaxed);
        }
    }
}

fn run_playback(mut track: RemoteTrack, stop: Arc<AtomicBool>) -> Result<(), CaptureError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(CaptureError::NoDevice)?;
    info!(
        "Audio output device: {}",
        device.name().unwrap_or_default()
    );

    let supported = device
        .default_output_config()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let config: StreamConfig = supported.into();
    let output_channels = config.channels.max(1) as usize;
    let output_rate = config.sample_rate.0;

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let reader = Arc::clone(&buffer);
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut buffer = lock_buffer(&reader);
                let wanted = data.len() / output_channels;
                for (i, sample) in data.iter_mut().enumerate() {
                    *sample = buffer.get(i / output_channels).copied().unwrap_or(0.0);
                }
                let consumed = wanted.min(buffer.len());
                buffer.drain(..consumed);
            },
            move |err| {
                error!("Audio output error: {err}");
            },
            None,
        )
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    stream
        .play()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    info!(
        "Playing track {} ({} Hz -> {output_rate} Hz)",
        track.id, track.sample_rate
    );

    while !stop.load(Ordering::Relaxed) {
        match track.frames.try_recv() {
            Ok(frame) => {
                let resampled = resample_linear(&frame, track.sample_rate, output_rate);
                lock_buffer(&buffer).extend_from_slice(&resampled);
            }
            Err(mpsc::error::TryRecvError::Empty) => std::thread::sleep(IDLE_POLL),
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }
    }

    drop(stream);
    info!("Playback of track {} stopped", track.id);
    Ok(())
}
