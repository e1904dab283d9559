//! Recording and compositing engine for asynchronous code reviews.
//!
//! [`RecordingEngine`] owns one recording session at a time: it acquires the
//! capture sources, composites them with the webcam overlay and the
//! annotation layer onto a master surface, feeds that surface to an encoder
//! and hands back an [`Artifact`] when the session ends.

pub mod annotation;
pub mod capture;
pub mod compositor;
pub mod config;
pub mod engine;
pub mod error;
pub mod recording;
pub mod settings;
pub mod shortcuts;
pub mod upload;

#[cfg(test)]
mod testing;

pub use engine::{format_time, EngineOptions, EngineSnapshot, Phase, RecordingEngine, TimelineEvent};
pub use error::{RecorderError, Result};
pub use recording::Artifact;
pub use settings::{Settings, SettingsPatch};
