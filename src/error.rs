use thiserror::Error;

use crate::engine::Phase;

/// Result alias used by the recording engine.
pub type Result<T> = std::result::Result<T, RecorderError>;

/// Errors surfaced by the recording engine and its capability backends.
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Permission denied for {0}")]
    PermissionDenied(String),
    #[error("No capture target registered for workspace capture")]
    NoCaptureTarget,
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("No stream available for recording")]
    NoStream,
    #[error("Cannot {action} while {phase}")]
    InvalidState { action: &'static str, phase: Phase },
    #[error("No supported container among {0:?}")]
    UnsupportedContainer(Vec<String>),
    #[error("Encoder error: {0}")]
    Encoder(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Chunk consolidation failed: {0}")]
    Consolidation(String),
    #[error("Recording produced no data")]
    EmptyRecording,
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
    #[error("Recording session was cancelled")]
    Cancelled,
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<image::ImageError> for RecorderError {
    fn from(value: image::ImageError) -> Self {
        RecorderError::Decode(value.to_string())
    }
}

impl From<gif::EncodingError> for RecorderError {
    fn from(value: gif::EncodingError) -> Self {
        RecorderError::Encoder(value.to_string())
    }
}
