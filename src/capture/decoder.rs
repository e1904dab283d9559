use image::RgbaImage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::{MediaStream, TrackSettings};
use crate::error::{RecorderError, Result};

const MIN_DECODE_INTERVAL_MS: u64 = 16;

/// A stream bound to a persistent, muted decoder.
///
/// The decoder thread keeps pulling frames for as long as the video is live,
/// so readers always sample the most recent frame without waiting on the
/// source.
pub struct DecodedVideo {
    label: String,
    settings: TrackSettings,
    has_audio: bool,
    stream: Arc<dyn MediaStream>,
    latest: Arc<Mutex<Option<Arc<RgbaImage>>>>,
    alive: Arc<AtomicBool>,
    decoded: Arc<AtomicU64>,
}

impl DecodedVideo {
    /// Starts decoding and resolves once the first frame is available.
    pub async fn play(stream: Box<dyn MediaStream>, fps: u32) -> Result<Arc<Self>> {
        let stream: Arc<dyn MediaStream> = Arc::from(stream);
        let label = stream.label().to_string();
        let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64)
            .max(Duration::from_millis(MIN_DECODE_INTERVAL_MS));

        let video = Arc::new(Self {
            label: label.clone(),
            settings: stream.track_settings(),
            has_audio: stream.has_audio(),
            stream: Arc::clone(&stream),
            latest: Arc::new(Mutex::new(None)),
            alive: Arc::new(AtomicBool::new(true)),
            decoded: Arc::new(AtomicU64::new(0)),
        });

        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let latest = Arc::clone(&video.latest);
        let alive = Arc::clone(&video.alive);
        let decoded = Arc::clone(&video.decoded);

        let spawned = thread::Builder::new()
            .name(format!("decode-{}", label))
            .spawn(move || {
                let mut ready_tx = Some(ready_tx);
                while alive.load(Ordering::SeqCst) {
                    match stream.read_frame() {
                        Ok(frame) => {
                            *latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(frame));
                            decoded.fetch_add(1, Ordering::Relaxed);
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        Err(e) => {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Err(e));
                                break;
                            }
                            debug!(error = %e, "decoder skipped a frame");
                        }
                    }
                    thread::sleep(interval);
                }
            });

        if let Err(e) = spawned {
            video.stop();
            return Err(RecorderError::DeviceUnavailable(format!(
                "could not start decoder for {}: {}",
                video.label, e
            )));
        }

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(label = %video.label, "decoder playing");
                Ok(video)
            }
            Ok(Err(e)) => {
                video.stop();
                Err(e)
            }
            Err(_) => {
                video.stop();
                Err(RecorderError::DeviceUnavailable(format!(
                    "{} ended before its first frame",
                    video.label
                )))
            }
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn track_settings(&self) -> TrackSettings {
        self.settings
    }

    pub fn has_audio(&self) -> bool {
        self.has_audio
    }

    /// The most recently decoded frame, if any.
    pub fn current_frame(&self) -> Option<Arc<RgbaImage>> {
        if !self.is_live() {
            return None;
        }
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_ready(&self) -> bool {
        self.current_frame().is_some()
    }

    /// Intrinsic size of the decoded video.
    pub fn video_size(&self) -> Option<(u32, u32)> {
        self.current_frame().map(|f| (f.width(), f.height()))
    }

    pub fn frames_decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stops decoding and every track of the underlying stream.
    pub fn stop(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.stream.stop();
            debug!(label = %self.label, "stream tracks stopped");
        }
    }
}

impl Drop for DecodedVideo {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DecodedVideo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedVideo")
            .field("label", &self.label)
            .field("live", &self.is_live())
            .finish()
    }
}
