use async_trait::async_trait;
use image::RgbaImage;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use xcap::{Monitor, Window};

use super::{CameraRequest, DisplayRequest, DisplaySurface, MediaDevices, MediaStream, TrackSettings};
use crate::error::{RecorderError, Result};

const MAX_CAPTURE_DIMENSION: u32 = 16384;
const MAX_CAPTURE_PIXELS: u64 = 256 * 1024 * 1024;

/// Native capture through `xcap`. Only display surfaces are available; camera
/// requests report the device as unavailable.
#[derive(Debug, Clone, Default)]
pub struct NativeDevices {
    monitor_id: Option<u32>,
    window_id: Option<u32>,
}

impl NativeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_monitor(mut self, monitor_id: u32) -> Self {
        self.monitor_id = Some(monitor_id);
        self
    }

    pub fn with_window(mut self, window_id: u32) -> Self {
        self.window_id = Some(window_id);
        self
    }
}

#[async_trait]
impl MediaDevices for NativeDevices {
    async fn get_display_media(&self, request: DisplayRequest) -> Result<Box<dyn MediaStream>> {
        if request.audio {
            debug!("system audio is not captured by the native backend");
        }
        let monitor_id = self.monitor_id;
        let window_id = self.window_id;
        tokio::task::spawn_blocking(move || -> Result<Box<dyn MediaStream>> {
            match request.surface {
                DisplaySurface::Monitor => Ok(Box::new(ScreenStream::open(monitor_id)?)),
                DisplaySurface::Window => Ok(Box::new(WindowStream::open(window_id)?)),
            }
        })
        .await
        .map_err(|e| RecorderError::Runtime(e.to_string()))?
    }

    async fn get_user_media(&self, _request: CameraRequest) -> Result<Box<dyn MediaStream>> {
        Err(RecorderError::DeviceUnavailable(
            "camera capture is not supported by the native backend".to_string(),
        ))
    }
}

fn check_dimensions(img: &RgbaImage) -> Result<()> {
    if img.width() > MAX_CAPTURE_DIMENSION || img.height() > MAX_CAPTURE_DIMENSION {
        return Err(RecorderError::Decode(
            "captured image dimensions exceed safety limit".to_string(),
        ));
    }
    let pixel_count = (img.width() as u64).saturating_mul(img.height() as u64);
    if pixel_count > MAX_CAPTURE_PIXELS {
        return Err(RecorderError::Decode(
            "captured image exceeds maximum pixel count".to_string(),
        ));
    }
    Ok(())
}

struct ScreenStream {
    monitor_id: u32,
    label: String,
    width: u32,
    height: u32,
    stopped: AtomicBool,
}

impl ScreenStream {
    fn open(monitor_id: Option<u32>) -> Result<Self> {
        let monitors = Monitor::all()
            .map_err(|e| RecorderError::PermissionDenied(format!("screen capture: {}", e)))?;

        let monitor = match monitor_id {
            Some(id) => monitors.into_iter().find(|m| m.id() == id),
            None => {
                let mut all = monitors.into_iter();
                let first = all.next();
                all.find(|m| m.is_primary()).or(first)
            }
        }
        .ok_or_else(|| RecorderError::DeviceUnavailable("no monitor found".to_string()))?;

        if monitor.is_primary() {
            debug!(monitor = monitor.name(), "capturing primary monitor");
        }

        Ok(Self {
            monitor_id: monitor.id(),
            label: format!("screen:{}", monitor.name()),
            width: monitor.width(),
            height: monitor.height(),
            stopped: AtomicBool::new(false),
        })
    }

    fn find_monitor(&self) -> Result<Monitor> {
        Monitor::all()
            .map_err(|e| RecorderError::DeviceUnavailable(e.to_string()))?
            .into_iter()
            .find(|m| m.id() == self.monitor_id)
            .ok_or_else(|| RecorderError::DeviceUnavailable(format!("monitor {} not found", self.monitor_id)))
    }
}

impl MediaStream for ScreenStream {
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
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RecorderError::DeviceUnavailable("stream stopped".to_string()));
        }
        let img = self
            .find_monitor()?
            .capture_image()
            .map_err(|e| RecorderError::Decode(e.to_string()))?;
        check_dimensions(&img)?;
        Ok(img)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct WindowStream {
    window_id: u32,
    label: String,
    width: u32,
    height: u32,
    stopped: AtomicBool,
}

impl WindowStream {
    fn open(window_id: Option<u32>) -> Result<Self> {
        let windows = Window::all()
            .map_err(|e| RecorderError::PermissionDenied(format!("window capture: {}", e)))?;

        let window = match window_id {
            Some(id) => windows.into_iter().find(|w| w.id() == id),
            None => windows
                .into_iter()
                .find(|w| !w.is_minimized() && !w.title().is_empty() && w.width() > 0),
        }
        .ok_or_else(|| RecorderError::DeviceUnavailable("no capturable window found".to_string()))?;

        Ok(Self {
            window_id: window.id(),
            label: format!("window:{}", window.title()),
            width: window.width(),
            height: window.height(),
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaStream for WindowStream {
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
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RecorderError::DeviceUnavailable("stream stopped".to_string()));
        }
        let window = Window::all()
            .map_err(|e| RecorderError::DeviceUnavailable(e.to_string()))?
            .into_iter()
            .find(|w| w.id() == self.window_id)
            .ok_or_else(|| RecorderError::DeviceUnavailable(format!("window {} not found", self.window_id)))?;
        let img = window
            .capture_image()
            .map_err(|e| RecorderError::Decode(e.to_string()))?;
        check_dimensions(&img)?;
        Ok(img)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
