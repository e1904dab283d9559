//! Capture sources: screen, window, camera and workspace (DOM-like) targets.
//!
//! Hardware access sits behind small capability traits so the rest of the
//! engine only ever sees decoded frames.

mod decoder;
mod manager;
mod screen;

pub use decoder::DecodedVideo;
pub use manager::{HeldSources, PrimarySource, SourceManager};
pub use screen::NativeDevices;

use async_trait::async_trait;
use image::RgbaImage;
use std::sync::Arc;

use crate::error::Result;

/// Resolution reported by a live video track, when it reports one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl TrackSettings {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
        }
    }
}

/// A live media stream as handed out by [`MediaDevices`].
pub trait MediaStream: Send + Sync {
    fn label(&self) -> &str;
    fn track_settings(&self) -> TrackSettings;
    fn has_audio(&self) -> bool;
    /// Blocks until the next frame is decoded.
    fn read_frame(&self) -> Result<RgbaImage>;
    /// Stops every track of the stream. Must be idempotent.
    fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplaySurface {
    Monitor,
    Window,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayRequest {
    pub surface: DisplaySurface,
    pub audio: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraRequest {
    pub width: u32,
    pub height: u32,
}

/// Platform entry point for acquiring streams. Both calls may suspend while
/// the user or the OS grants permission.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_display_media(&self, request: DisplayRequest) -> Result<Box<dyn MediaStream>>;
    async fn get_user_media(&self, request: CameraRequest) -> Result<Box<dyn MediaStream>>;
}

/// Rendered size of a capture target in layout pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub width: f64,
    pub height: f64,
}

/// An element rendered by the host UI that can be snapshotted into pixels.
#[async_trait]
pub trait CaptureTarget: Send + Sync {
    fn bounding_box(&self) -> Option<BoundingBox>;
    /// Renders the element to an image. Comparatively expensive.
    async fn snapshot(&self) -> Result<RgbaImage>;
}

/// A preview element a live stream can be attached to.
pub trait VideoSink: Send + Sync {
    fn attach(&self, video: Option<Arc<DecodedVideo>>);
}

#[derive(Debug, Clone)]
pub struct MonitorInfo {
    pub id: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct WindowInfo {
    pub id: u32,
    pub title: String,
    pub app_name: String,
    pub width: u32,
    pub height: u32,
}

pub fn list_monitors() -> anyhow::Result<Vec<MonitorInfo>> {
    let screens = xcap::Monitor::all()?;
    let monitors: Vec<MonitorInfo> = screens
        .into_iter()
        .map(|s| MonitorInfo {
            id: s.id(),
            name: s.name().to_string(),
            width: s.width(),
            height: s.height(),
            is_primary: s.is_primary(),
        })
        .collect();
    Ok(monitors)
}

pub fn list_windows() -> anyhow::Result<Vec<WindowInfo>> {
    let windows = xcap::Window::all()?;
    let mut window_infos: Vec<WindowInfo> = windows
        .into_iter()
        .filter(|w| !w.title().is_empty() && w.width() > 50 && w.height() > 50 && !w.is_minimized())
        .map(|w| WindowInfo {
            id: w.id(),
            title: w.title().to_string(),
            app_name: w.app_name().to_string(),
            width: w.width(),
            height: w.height(),
        })
        .collect();
    window_infos.sort_by(|a, b| a.title.cmp(&b.title));
    Ok(window_infos)
}
