//! Recorder bridge: encodes the master surface into buffered chunks.

mod chunks;
mod gif_encoder;
mod postprocess;

pub use chunks::{Chunk, ChunkMerger, ChunkStore, ConcatMerger, ConsolidationOutcome, Consolidator};
pub use gif_encoder::{GifChunkEncoder, GifEncoderBackend, GifInspector, GIF_MIME};
pub use postprocess::{
    extension_for_mime, extract_thumbnail, new_object_url, process_recording, Artifact, MediaInspector,
    RecordingOutput, ThumbnailSize,
};

use image::RgbaImage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::compositor::Compositor;
use crate::error::{RecorderError, Result};

/// Containers in order of preference. Faster-encoding codecs come first.
pub const MIME_PREFERENCES: &[&str] = &[
    "video/webm;codecs=vp8,opus",
    "video/webm;codecs=vp9,opus",
    "video/webm",
    "video/mp4",
    GIF_MIME,
];

/// Frames queued for the encoder thread before new ones are dropped.
const ENCODER_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target video bitrate in bits per second.
    pub bitrate: u32,
    pub has_audio: bool,
}

/// An encoder producing a byte stream that is valid when concatenated.
pub trait ChunkEncoder: Send {
    fn encode(&mut self, frame: &RgbaImage, timestamp: Duration) -> Result<()>;
    /// Bytes produced since the previous call.
    fn request_data(&mut self) -> Result<Vec<u8>>;
    /// Flushes everything left, including any trailer.
    fn finish(self: Box<Self>) -> Result<Vec<u8>>;
}

pub trait EncoderBackend: Send + Sync {
    fn is_type_supported(&self, mime_type: &str) -> bool;
    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn ChunkEncoder>>;
}

/// First container in [`MIME_PREFERENCES`] the backend supports.
pub fn select_mime(backend: &dyn EncoderBackend) -> Result<&'static str> {
    MIME_PREFERENCES
        .iter()
        .copied()
        .find(|mime| backend.is_type_supported(mime))
        .ok_or_else(|| {
            RecorderError::UnsupportedContainer(
                MIME_PREFERENCES.iter().map(|m| m.to_string()).collect(),
            )
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncoderState {
    #[default]
    Inactive,
    Recording,
    Paused,
}

enum EncoderCommand {
    Frame(RgbaImage, Duration),
    Flush,
    Finish(oneshot::Sender<Result<()>>),
}

#[derive(Debug)]
struct MediaClock {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl MediaClock {
    fn elapsed(&self) -> Duration {
        self.accumulated + self.running_since.map(|t| t.elapsed()).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct BridgeCounters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    encoded: Arc<AtomicU64>,
}

/// Drives a [`ChunkEncoder`] on its own thread.
///
/// Frames carry timestamps from a media clock that stops while paused, so
/// paused stretches leave no gap in the output. Encoded bytes land in the
/// [`ChunkStore`] on every flush.
pub struct RecorderBridge {
    mime_type: String,
    state: Mutex<EncoderState>,
    clock: Mutex<MediaClock>,
    commands: Mutex<Option<SyncSender<EncoderCommand>>>,
    counters: BridgeCounters,
}

impl RecorderBridge {
    pub fn start(
        backend: &dyn EncoderBackend,
        config: EncoderConfig,
        chunks: Arc<ChunkStore>,
    ) -> Result<Self> {
        let encoder = backend.create(&config)?;
        let (tx, rx) = mpsc::sync_channel(ENCODER_QUEUE_DEPTH);
        let encoded = Arc::new(AtomicU64::new(0));
        let generation = chunks.generation();

        let thread_encoded = Arc::clone(&encoded);
        thread::Builder::new()
            .name("recorder-encoder".to_string())
            .spawn(move || run_encoder(encoder, rx, chunks, generation, thread_encoded))
            .map_err(|e| RecorderError::Encoder(format!("could not start encoder thread: {}", e)))?;

        info!(
            mime = %config.mime_type,
            width = config.width,
            height = config.height,
            bitrate = config.bitrate,
            "recorder started"
        );

        Ok(Self {
            mime_type: config.mime_type,
            state: Mutex::new(EncoderState::Recording),
            clock: Mutex::new(MediaClock {
                accumulated: Duration::ZERO,
                running_since: Some(Instant::now()),
            }),
            commands: Mutex::new(Some(tx)),
            counters: BridgeCounters {
                encoded,
                ..Default::default()
            },
        })
    }

    fn state_lock(&self) -> MutexGuard<'_, EncoderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn state(&self) -> EncoderState {
        *self.state_lock()
    }

    /// Media time recorded so far, excluding paused stretches.
    pub fn media_time(&self) -> Duration {
        self.clock.lock().unwrap_or_else(|e| e.into_inner()).elapsed()
    }

    pub fn pause(&self) -> bool {
        let mut state = self.state_lock();
        if *state != EncoderState::Recording {
            return false;
        }
        *state = EncoderState::Paused;
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        clock.accumulated = clock.elapsed();
        clock.running_since = None;
        true
    }

    pub fn resume(&self) -> bool {
        let mut state = self.state_lock();
        if *state != EncoderState::Paused {
            return false;
        }
        *state = EncoderState::Recording;
        self.clock.lock().unwrap_or_else(|e| e.into_inner()).running_since = Some(Instant::now());
        true
    }

    fn send(&self, command: EncoderCommand) -> bool {
        let commands = self.commands.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = commands.as_ref() else {
            return false;
        };
        match tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                debug!("encoder thread is gone");
                false
            }
        }
    }

    /// Queues a frame at the current media time. Dropped when not
    /// recording or when the encoder is behind.
    pub fn submit_frame(&self, frame: RgbaImage) -> bool {
        if self.state() != EncoderState::Recording {
            return false;
        }
        let timestamp = self.media_time();
        let queued = self.send(EncoderCommand::Frame(frame, timestamp));
        if queued {
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queued
    }

    /// Asks the encoder thread to move its pending output into the store.
    /// A flush that finds the queue full is skipped; its bytes go out with
    /// the next one.
    pub fn request_data(&self) -> bool {
        self.send(EncoderCommand::Flush)
    }

    pub fn frames_submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn frames_encoded(&self) -> u64 {
        self.counters.encoded.load(Ordering::Relaxed)
    }

    /// Drains queued frames, writes the trailer into the store and stops
    /// the encoder thread.
    pub async fn finish(&self) -> Result<()> {
        let tx = self
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| RecorderError::Encoder("recorder already stopped".to_string()))?;
        *self.state_lock() = EncoderState::Inactive;

        let (reply_tx, reply_rx) = oneshot::channel();
        // The queue may be full; wait for room off the runtime.
        let sent = tokio::task::spawn_blocking(move || tx.send(EncoderCommand::Finish(reply_tx)))
            .await
            .map_err(|e| RecorderError::Runtime(e.to_string()))?;
        if sent.is_err() {
            return Err(RecorderError::Encoder("encoder thread exited".to_string()));
        }
        reply_rx
            .await
            .map_err(|_| RecorderError::Encoder("encoder thread exited".to_string()))?
    }

    /// Stops the encoder thread without collecting its output.
    pub fn discard(&self) {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).take();
        *self.state_lock() = EncoderState::Inactive;
    }
}

impl Drop for RecorderBridge {
    fn drop(&mut self) {
        self.discard();
    }
}

fn run_encoder(
    mut encoder: Box<dyn ChunkEncoder>,
    rx: Receiver<EncoderCommand>,
    chunks: Arc<ChunkStore>,
    generation: u64,
    encoded: Arc<AtomicU64>,
) {
    let mut failures = 0u64;
    while let Ok(command) = rx.recv() {
        match command {
            EncoderCommand::Frame(frame, timestamp) => match encoder.encode(&frame, timestamp) {
                Ok(()) => {
                    encoded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 {
                        warn!(error = %e, "encoder rejected a frame");
                    }
                }
            },
            EncoderCommand::Flush => match encoder.request_data() {
                Ok(bytes) => {
                    chunks.push_for(generation, bytes);
                }
                Err(e) => warn!(error = %e, "encoder flush failed"),
            },
            EncoderCommand::Finish(reply) => {
                let result = encoder.finish().map(|tail| {
                    chunks.push_for(generation, tail);
                });
                let _ = reply.send(result);
                debug!(failures, "encoder thread finished");
                return;
            }
        }
    }
    debug!("encoder discarded");
}

/// Feeds the master surface to the recorder at `fps` and flushes every
/// `timeslice`.
pub(crate) async fn run_recorder_pump(
    bridge: Arc<RecorderBridge>,
    compositor: Arc<Mutex<Compositor>>,
    alive: Arc<AtomicBool>,
    fps: u32,
    timeslice: Duration,
) {
    let mut frames = time::interval(Duration::from_secs_f64(1.0 / fps.max(1) as f64));
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut flushes = time::interval_at(Instant::now() + timeslice, timeslice);
    flushes.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = frames.tick() => {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                if bridge.state() != EncoderState::Recording {
                    continue;
                }
                let frame = compositor.lock().unwrap_or_else(|e| e.into_inner()).capture_frame();
                if let Ok(frame) = frame {
                    bridge.submit_frame(frame);
                }
            }
            _ = flushes.tick() => {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                if !bridge.request_data() {
                    debug!("encoder busy, flush deferred");
                }
            }
        }
    }
    debug!(
        submitted = bridge.frames_submitted(),
        dropped = bridge.frames_dropped(),
        "recorder pump finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingBackend;

    fn config(mime_type: &str) -> EncoderConfig {
        EncoderConfig {
            mime_type: mime_type.to_string(),
            width: 16,
            height: 16,
            fps: 30,
            bitrate: 5_000_000,
            has_audio: false,
        }
    }

    #[test]
    fn test_select_mime_prefers_faster_codecs() {
        let backend = CountingBackend::new(&["video/webm", "video/webm;codecs=vp8,opus", "image/gif"]);
        assert_eq!(select_mime(&backend).unwrap(), "video/webm;codecs=vp8,opus");

        let gif_only = GifEncoderBackend::new();
        assert_eq!(select_mime(&gif_only).unwrap(), GIF_MIME);

        let none = CountingBackend::new(&[]);
        assert!(matches!(
            select_mime(&none),
            Err(RecorderError::UnsupportedContainer(list)) if list.len() == MIME_PREFERENCES.len()
        ));
    }

    #[tokio::test]
    async fn test_frames_flush_into_store_and_finish_writes_tail() {
        let backend = CountingBackend::new(&["video/webm"]);
        let chunks = Arc::new(ChunkStore::new());
        let bridge = RecorderBridge::start(&backend, config("video/webm"), Arc::clone(&chunks)).unwrap();

        for _ in 0..3 {
            while !bridge.submit_frame(RgbaImage::new(16, 16)) {
                tokio::task::yield_now().await;
            }
        }
        while !bridge.request_data() {
            tokio::task::yield_now().await;
        }
        bridge.finish().await.unwrap();

        // one byte per frame, then a one-byte trailer
        assert_eq!(chunks.total_bytes(), 4);
        assert_eq!(chunks.len(), 2);
        assert_eq!(bridge.frames_encoded(), 3);
        assert_eq!(bridge.state(), EncoderState::Inactive);
        assert!(bridge.finish().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_media_clock() {
        let backend = CountingBackend::new(&["video/webm"]);
        let bridge =
            RecorderBridge::start(&backend, config("video/webm"), Arc::new(ChunkStore::new())).unwrap();

        time::sleep(Duration::from_secs(2)).await;
        assert!(bridge.pause());
        assert!(!bridge.pause());
        assert!(!bridge.submit_frame(RgbaImage::new(16, 16)));
        time::sleep(Duration::from_secs(5)).await;
        assert!(bridge.resume());
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(bridge.media_time(), Duration::from_secs(3));
        bridge.discard();
        assert_eq!(bridge.state(), EncoderState::Inactive);
    }

    #[tokio::test]
    async fn test_discarded_output_never_reaches_store() {
        let backend = CountingBackend::new(&["video/webm"]);
        let chunks = Arc::new(ChunkStore::new());
        let bridge = RecorderBridge::start(&backend, config("video/webm"), Arc::clone(&chunks)).unwrap();
        bridge.submit_frame(RgbaImage::new(16, 16));
        chunks.clear();
        bridge.request_data();
        bridge.discard();
        time::sleep(Duration::from_millis(20)).await;
        assert!(chunks.is_empty());
    }
}
