use std::sync::Arc;
use tracing::{info, warn};

use super::{CameraRequest, CaptureTarget, DecodedVideo, DisplayRequest, DisplaySurface, MediaDevices};
use crate::error::{RecorderError, Result};
use crate::settings::{Settings, SourceKind};

const DEFAULT_DECODE_FPS: u32 = 30;
const WEBCAM_WIDTH: u32 = 320;
const WEBCAM_HEIGHT: u32 = 240;
const CAMERA_WIDTH: u32 = 1280;
const CAMERA_HEIGHT: u32 = 720;

/// What the compositor draws as the bottom layer.
#[derive(Clone)]
pub enum PrimarySource {
    Stream(Arc<DecodedVideo>),
    Workspace(Arc<dyn CaptureTarget>),
}

impl PrimarySource {
    pub fn video(&self) -> Option<&Arc<DecodedVideo>> {
        match self {
            PrimarySource::Stream(video) => Some(video),
            PrimarySource::Workspace(_) => None,
        }
    }
}

/// Streams held by the current session.
#[derive(Default)]
pub struct HeldSources {
    pub primary: Option<PrimarySource>,
    pub webcam: Option<Arc<DecodedVideo>>,
}

impl HeldSources {
    pub fn primary_video(&self) -> Option<&Arc<DecodedVideo>> {
        self.primary.as_ref().and_then(|p| p.video())
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.webcam.is_none()
    }

    /// Stops every track of every held stream. Safe to call repeatedly.
    pub fn release_all(&mut self) {
        if let Some(PrimarySource::Stream(video)) = self.primary.take() {
            video.stop();
        }
        if let Some(webcam) = self.webcam.take() {
            webcam.stop();
        }
    }
}

/// Acquires primary and webcam streams and binds them to decoders.
pub struct SourceManager {
    devices: Arc<dyn MediaDevices>,
    decode_fps: u32,
    webcam_request: CameraRequest,
}

impl SourceManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            decode_fps: DEFAULT_DECODE_FPS,
            webcam_request: CameraRequest {
                width: WEBCAM_WIDTH,
                height: WEBCAM_HEIGHT,
            },
        }
    }

    pub fn with_decode_fps(mut self, fps: u32) -> Self {
        self.decode_fps = fps.max(1);
        self
    }

    pub fn with_webcam_resolution(mut self, width: u32, height: u32) -> Self {
        self.webcam_request = CameraRequest { width, height };
        self
    }

    pub async fn acquire_primary(
        &self,
        settings: &Settings,
        target: Option<Arc<dyn CaptureTarget>>,
    ) -> Result<PrimarySource> {
        match settings.selected_source {
            SourceKind::Screen | SourceKind::Window => {
                let surface = if settings.selected_source == SourceKind::Window {
                    DisplaySurface::Window
                } else {
                    DisplaySurface::Monitor
                };
                let request = DisplayRequest {
                    surface,
                    audio: settings.include_system_audio,
                };
                let stream = self.devices.get_display_media(request).await?;
                info!(label = stream.label(), audio = stream.has_audio(), "display stream acquired");
                let video = DecodedVideo::play(stream, self.decode_fps).await?;
                Ok(PrimarySource::Stream(video))
            }
            SourceKind::Workspace => target
                .map(PrimarySource::Workspace)
                .ok_or(RecorderError::NoCaptureTarget),
            SourceKind::Camera => {
                let request = CameraRequest {
                    width: CAMERA_WIDTH,
                    height: CAMERA_HEIGHT,
                };
                let stream = self.devices.get_user_media(request).await?;
                info!(label = stream.label(), "camera stream acquired as primary source");
                let video = DecodedVideo::play(stream, self.decode_fps).await?;
                Ok(PrimarySource::Stream(video))
            }
        }
    }

    /// Best effort: a missing or refused webcam never fails the session.
    pub async fn acquire_webcam(&self, settings: &Settings) -> Option<Arc<DecodedVideo>> {
        if !settings.include_webcam || settings.selected_source == SourceKind::Camera {
            return None;
        }

        let acquired = match self.devices.get_user_media(self.webcam_request).await {
            Ok(stream) => DecodedVideo::play(stream, self.decode_fps).await,
            Err(e) => Err(e),
        };

        match acquired {
            Ok(video) => Some(video),
            Err(e) => {
                warn!(error = %e, "could not get webcam stream, recording without it");
                None
            }
        }
    }
}
