use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RecorderError, Result};
use crate::recording::ThumbnailSize;

const MAX_FPS: u32 = 120;

/// Cadences and limits of the engine. Stable across sessions, unlike
/// [`crate::settings::Settings`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineOptions {
    /// Frame rate fed to the encoder.
    pub stream_fps: u32,
    /// Snapshot rate for workspace capture.
    pub dom_capture_fps: u32,
    /// Redraw rate for live streams.
    pub live_fps: u32,
    pub preview_fps: u32,
    /// Interval between encoder flushes.
    pub timeslice_ms: u64,
    pub cleanup_interval_secs: u64,
    /// Chunk count above which a consolidation round runs.
    pub cleanup_threshold: usize,
    /// Newest chunks left untouched by a consolidation round.
    pub cleanup_keep_recent: usize,
    pub webcam_width: u32,
    pub webcam_height: u32,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            stream_fps: 30,
            dom_capture_fps: 10,
            live_fps: 60,
            preview_fps: 60,
            timeslice_ms: 1000,
            cleanup_interval_secs: 30,
            cleanup_threshold: 120,
            cleanup_keep_recent: 20,
            webcam_width: 320,
            webcam_height: 240,
            thumbnail_width: 640,
            thumbnail_height: 360,
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<()> {
        let rates = [
            ("stream_fps", self.stream_fps),
            ("dom_capture_fps", self.dom_capture_fps),
            ("live_fps", self.live_fps),
            ("preview_fps", self.preview_fps),
        ];
        for (name, fps) in rates {
            if fps == 0 || fps > MAX_FPS {
                return Err(RecorderError::InvalidSettings(format!(
                    "{} must be between 1 and {}",
                    name, MAX_FPS
                )));
            }
        }
        if self.timeslice_ms == 0 || self.cleanup_interval_secs == 0 {
            return Err(RecorderError::InvalidSettings(
                "flush and cleanup intervals must be positive".to_string(),
            ));
        }
        if self.cleanup_keep_recent >= self.cleanup_threshold {
            return Err(RecorderError::InvalidSettings(
                "cleanup_keep_recent must be below cleanup_threshold".to_string(),
            ));
        }
        if self.webcam_width == 0
            || self.webcam_height == 0
            || self.thumbnail_width == 0
            || self.thumbnail_height == 0
        {
            return Err(RecorderError::InvalidSettings(
                "webcam and thumbnail sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn thumbnail_size(&self) -> ThumbnailSize {
        ThumbnailSize {
            width: self.thumbnail_width,
            height: self.thumbnail_height,
        }
    }
}
