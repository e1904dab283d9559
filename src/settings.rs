use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use crate::error::{RecorderError, Result};

const SMALL_MULTIPLIER: f32 = 0.15;
const MEDIUM_MULTIPLIER: f32 = 0.20;
const LARGE_MULTIPLIER: f32 = 0.30;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    #[default]
    Workspace,
    Screen,
    Window,
    Camera,
}

impl SourceKind {
    pub fn is_display(&self) -> bool {
        matches!(self, SourceKind::Screen | SourceKind::Window)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceKind::Workspace => "Workspace",
            SourceKind::Screen => "Screen",
            SourceKind::Window => "Window",
            SourceKind::Camera => "Camera",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WebcamPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
    Center,
}

impl WebcamPosition {
    /// Order used when cycling with the arrow keys.
    pub fn cycle() -> &'static [WebcamPosition] {
        &[
            WebcamPosition::TopLeft,
            WebcamPosition::TopRight,
            WebcamPosition::BottomRight,
            WebcamPosition::BottomLeft,
            WebcamPosition::Center,
        ]
    }

    pub fn next(self) -> Self {
        let order = Self::cycle();
        let index = order.iter().position(|p| *p == self).unwrap_or(0);
        order[(index + 1) % order.len()]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WebcamSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl WebcamSize {
    /// Fraction of the frame width taken by the webcam overlay.
    pub fn multiplier(&self) -> f32 {
        match self {
            WebcamSize::Small => SMALL_MULTIPLIER,
            WebcamSize::Medium => MEDIUM_MULTIPLIER,
            WebcamSize::Large => LARGE_MULTIPLIER,
        }
    }

    pub fn next(self) -> Self {
        match self {
            WebcamSize::Small => WebcamSize::Medium,
            WebcamSize::Medium => WebcamSize::Large,
            WebcamSize::Large => WebcamSize::Small,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WebcamShape {
    Rectangle,
    #[default]
    Circle,
}

impl WebcamShape {
    pub fn toggled(self) -> Self {
        match self {
            WebcamShape::Rectangle => WebcamShape::Circle,
            WebcamShape::Circle => WebcamShape::Rectangle,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
}

impl Quality {
    /// Target video bitrate in bits per second.
    pub fn bitrate(&self) -> u32 {
        match self {
            Quality::Low => 1_000_000,
            Quality::Medium => 2_500_000,
            Quality::High => 5_000_000,
        }
    }

    pub fn all() -> &'static [Quality] {
        &[Quality::Low, Quality::Medium, Quality::High]
    }
}

/// Configuration snapshot for a recording session.
///
/// The engine never mutates a snapshot in place: updates build a new value and
/// swap it in, so a frame or a session always observes one consistent set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub selected_source: SourceKind,
    pub include_webcam: bool,
    pub include_system_audio: bool,
    pub include_mic_audio: bool,
    pub webcam_position: WebcamPosition,
    pub webcam_size: WebcamSize,
    pub webcam_shape: WebcamShape,
    /// Hard cap in seconds.
    pub max_duration: u32,
    pub quality: Quality,
    /// Seconds counted down before recording begins.
    pub countdown_duration: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            selected_source: SourceKind::Workspace,
            include_webcam: false,
            include_system_audio: true,
            include_mic_audio: true,
            webcam_position: WebcamPosition::BottomRight,
            webcam_size: WebcamSize::Medium,
            webcam_shape: WebcamShape::Circle,
            max_duration: 600,
            quality: Quality::High,
            countdown_duration: 3,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.max_duration == 0 {
            return Err(RecorderError::InvalidSettings(
                "max_duration must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn merged(&self, patch: &SettingsPatch) -> Settings {
        Settings {
            selected_source: patch.selected_source.unwrap_or(self.selected_source),
            include_webcam: patch.include_webcam.unwrap_or(self.include_webcam),
            include_system_audio: patch
                .include_system_audio
                .unwrap_or(self.include_system_audio),
            include_mic_audio: patch.include_mic_audio.unwrap_or(self.include_mic_audio),
            webcam_position: patch.webcam_position.unwrap_or(self.webcam_position),
            webcam_size: patch.webcam_size.unwrap_or(self.webcam_size),
            webcam_shape: patch.webcam_shape.unwrap_or(self.webcam_shape),
            max_duration: patch.max_duration.unwrap_or(self.max_duration),
            quality: patch.quality.unwrap_or(self.quality),
            countdown_duration: patch.countdown_duration.unwrap_or(self.countdown_duration),
        }
    }
}

/// Partial update applied over the current [`Settings`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub selected_source: Option<SourceKind>,
    pub include_webcam: Option<bool>,
    pub include_system_audio: Option<bool>,
    pub include_mic_audio: Option<bool>,
    pub webcam_position: Option<WebcamPosition>,
    pub webcam_size: Option<WebcamSize>,
    pub webcam_shape: Option<WebcamShape>,
    pub max_duration: Option<u32>,
    pub quality: Option<Quality>,
    pub countdown_duration: Option<u32>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == SettingsPatch::default()
    }
}

/// The current settings snapshot, shared between the engine and its loops.
///
/// Readers take an `Arc` to one complete snapshot; writers swap in a new one.
#[derive(Debug, Default)]
pub struct SharedSettings(RwLock<Arc<Settings>>);

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self(RwLock::new(Arc::new(settings)))
    }

    pub fn load(&self) -> Arc<Settings> {
        Arc::clone(&self.0.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn store(&self, settings: Settings) -> Arc<Settings> {
        let settings = Arc::new(settings);
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&settings);
        settings
    }
}
