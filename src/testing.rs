//! Fakes for the capability traits, shared by unit tests across modules.

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::annotation::ClientRect;
use crate::capture::{
    BoundingBox, CameraRequest, CaptureTarget, DecodedVideo, DisplayRequest, MediaDevices,
    MediaStream, TrackSettings, VideoSink,
};
use crate::compositor::PreviewSurface;
use crate::error::{RecorderError, Result};
use crate::recording::{Chunk, ChunkEncoder, ChunkMerger, ConcatMerger, EncoderBackend, EncoderConfig};

/// A stream whose every frame is one solid color.
pub struct SolidStream {
    label: String,
    width: u32,
    height: u32,
    color: [u8; 4],
    failing: bool,
    stopped: Arc<AtomicBool>,
}

impl SolidStream {
    pub fn new(label: &str, width: u32, height: u32, color: [u8; 4]) -> Self {
        Self {
            label: label.to_string(),
            width,
            height,
            color,
            failing: false,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Every read fails, as a device unplugged mid-negotiation would.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    fn sharing_stop(mut self, stopped: Arc<AtomicBool>) -> Self {
        self.stopped = stopped;
        self
    }
}

impl MediaStream for SolidStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn track_settings(&self) -> TrackSettings {
        TrackSettings::new(self.width, self.height)
    }

    fn has_audio(&self) -> bool {
        false
    }

    fn read_frame(&self) -> Result<RgbaImage> {
        if self.failing {
            return Err(RecorderError::DeviceUnavailable(format!(
                "{} produced no frames",
                self.label
            )));
        }
        Ok(RgbaImage::from_pixel(self.width, self.height, Rgba(self.color)))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Hands out solid-color streams, or refuses them.
pub struct FakeDevices {
    deny_display: bool,
    deny_camera: bool,
    display_stopped: Arc<AtomicBool>,
    camera_stopped: Arc<AtomicBool>,
    display_requests: Arc<AtomicU64>,
}

impl FakeDevices {
    pub const DISPLAY_WIDTH: u32 = 320;
    pub const DISPLAY_HEIGHT: u32 = 180;

    pub fn new() -> Self {
        Self {
            deny_display: false,
            deny_camera: false,
            display_stopped: Arc::new(AtomicBool::new(false)),
            camera_stopped: Arc::new(AtomicBool::new(false)),
            display_requests: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn deny_display(mut self) -> Self {
        self.deny_display = true;
        self
    }

    pub fn deny_camera(mut self) -> Self {
        self.deny_camera = true;
        self
    }

    /// Set once any display stream handed out has been stopped.
    pub fn display_stopped(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.display_stopped)
    }

    pub fn camera_stopped(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.camera_stopped)
    }

    pub fn display_requests(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.display_requests)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_display_media(&self, _request: DisplayRequest) -> Result<Box<dyn MediaStream>> {
        self.display_requests.fetch_add(1, Ordering::SeqCst);
        if self.deny_display {
            return Err(RecorderError::PermissionDenied("screen".to_string()));
        }
        let stream = SolidStream::new(
            "screen",
            Self::DISPLAY_WIDTH,
            Self::DISPLAY_HEIGHT,
            [0, 160, 0, 255],
        )
        .sharing_stop(Arc::clone(&self.display_stopped));
        Ok(Box::new(stream))
    }

    async fn get_user_media(&self, request: CameraRequest) -> Result<Box<dyn MediaStream>> {
        if self.deny_camera {
            return Err(RecorderError::PermissionDenied("camera".to_string()));
        }
        let stream = SolidStream::new("camera", request.width, request.height, [0, 0, 200, 255])
            .sharing_stop(Arc::clone(&self.camera_stopped));
        Ok(Box::new(stream))
    }
}

/// A workspace element that renders as a solid color.
pub struct RecordingTarget {
    width: f64,
    height: f64,
    delay: Option<Duration>,
    snapshots: Arc<AtomicU64>,
}

impl RecordingTarget {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            delay: None,
            snapshots: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Each snapshot takes `delay` to render.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn snapshot_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.snapshots)
    }
}

#[async_trait]
impl CaptureTarget for RecordingTarget {
    fn bounding_box(&self) -> Option<BoundingBox> {
        Some(BoundingBox {
            width: self.width,
            height: self.height,
        })
    }

    async fn snapshot(&self) -> Result<RgbaImage> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(RgbaImage::from_pixel(
            self.width as u32,
            self.height as u32,
            Rgba([240, 240, 240, 255]),
        ))
    }
}

/// A preview that counts presented frames.
pub struct FakePreview {
    size: Mutex<(u32, u32)>,
    presented: AtomicU64,
}

impl FakePreview {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: Mutex::new((width, height)),
            presented: AtomicU64::new(0),
        }
    }

    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::SeqCst)
    }
}

impl PreviewSurface for FakePreview {
    fn size(&self) -> (u32, u32) {
        *self.size.lock().unwrap()
    }

    fn resize(&self, width: u32, height: u32) {
        *self.size.lock().unwrap() = (width, height);
    }

    fn present(&self, _frame: &RgbaImage) -> Result<()> {
        self.presented.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn client_rect(&self) -> ClientRect {
        let (width, height) = self.size();
        ClientRect {
            left: 0.0,
            top: 0.0,
            width: width as f32,
            height: height as f32,
        }
    }
}

/// Remembers what was last attached.
#[derive(Default)]
pub struct FakeSink {
    attached: Mutex<Option<Arc<DecodedVideo>>>,
    attaches: AtomicU64,
}

impl FakeSink {
    pub fn is_attached(&self) -> bool {
        self.attached.lock().unwrap().is_some()
    }

    pub fn attaches(&self) -> u64 {
        self.attaches.load(Ordering::SeqCst)
    }
}

impl VideoSink for FakeSink {
    fn attach(&self, video: Option<Arc<DecodedVideo>>) {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        *self.attached.lock().unwrap() = video;
    }
}

/// Supports the listed containers. Its encoder emits one byte per frame
/// and a one-byte trailer.
pub struct CountingBackend {
    supported: Vec<String>,
}

impl CountingBackend {
    pub fn new(supported: &[&str]) -> Self {
        Self {
            supported: supported.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EncoderBackend for CountingBackend {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|s| s == mime_type)
    }

    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn ChunkEncoder>> {
        if !self.is_type_supported(&config.mime_type) {
            return Err(RecorderError::Encoder(format!(
                "{} not supported",
                config.mime_type
            )));
        }
        Ok(Box::new(CountingEncoder::default()))
    }
}

#[derive(Default)]
struct CountingEncoder {
    pending: Vec<u8>,
}

impl ChunkEncoder for CountingEncoder {
    fn encode(&mut self, _frame: &RgbaImage, _timestamp: Duration) -> Result<()> {
        self.pending.push(1);
        Ok(())
    }

    fn request_data(&mut self) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>> {
        let mut tail = std::mem::take(&mut self.pending);
        tail.push(0xff);
        Ok(tail)
    }
}

enum Failure {
    Error,
    Panic,
    Truncate,
}

/// A merger that fails in a chosen way.
pub struct FailingMerger(Failure);

impl FailingMerger {
    pub fn error() -> Self {
        Self(Failure::Error)
    }

    pub fn panic() -> Self {
        Self(Failure::Panic)
    }

    /// Succeeds, but loses the final byte.
    pub fn truncating() -> Self {
        Self(Failure::Truncate)
    }
}

impl ChunkMerger for FailingMerger {
    fn merge(&self, chunks: &[Chunk]) -> Result<Vec<u8>> {
        match self.0 {
            Failure::Error => Err(RecorderError::Consolidation("merge refused".to_string())),
            Failure::Panic => panic!("merger blew up"),
            Failure::Truncate => {
                let mut merged = ConcatMerger.merge(chunks)?;
                merged.pop();
                Ok(merged)
            }
        }
    }
}

/// Concatenates after a delay.
pub struct SlowMerger {
    delay: Duration,
}

impl SlowMerger {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ChunkMerger for SlowMerger {
    fn merge(&self, chunks: &[Chunk]) -> Result<Vec<u8>> {
        std::thread::sleep(self.delay);
        ConcatMerger.merge(chunks)
    }
}
