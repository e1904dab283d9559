use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;

const THUMBNAIL_SEEK_SECONDS: f64 = 2.0;
const THUMBNAIL_JPEG_QUALITY: u8 = 80;

/// Decodes a finished blob. Both calls may be slow and are run off the
/// async runtime.
pub trait MediaInspector: Send + Sync {
    /// Total duration in seconds.
    fn duration(&self, blob: &[u8], mime_type: &str) -> Result<f64>;
    /// The frame shown at `seconds`, clamped to the last frame.
    fn frame_at(&self, blob: &[u8], mime_type: &str, seconds: f64) -> Result<RgbaImage>;
}

/// The output of one completed session. Never modified after creation.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub session_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub mime_type: String,
    pub blob: Vec<u8>,
    pub object_url: String,
    /// JPEG bytes, when extraction succeeded.
    pub thumbnail: Option<Vec<u8>>,
    /// Seconds, when extraction succeeded.
    pub duration: Option<f64>,
}

impl Artifact {
    pub fn size(&self) -> usize {
        self.blob.len()
    }

    pub fn extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or_default().trim();
    match base {
        "video/webm" => "webm",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "image/gif" => "gif",
        _ => "bin",
    }
}

pub fn new_object_url() -> String {
    format!("blob:reviewcap/{}", Uuid::new_v4())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl Default for ThumbnailSize {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
        }
    }
}

/// Seeks to 2s, or half the duration for shorter clips, and encodes that
/// frame as a JPEG at the fixed thumbnail size.
pub fn extract_thumbnail(
    inspector: &dyn MediaInspector,
    blob: &[u8],
    mime_type: &str,
    duration: Option<f64>,
    size: ThumbnailSize,
) -> Result<Vec<u8>> {
    let at = duration
        .map(|d| (d / 2.0).min(THUMBNAIL_SEEK_SECONDS))
        .unwrap_or(0.0);
    let frame = inspector.frame_at(blob, mime_type, at)?;
    let resized = DynamicImage::ImageRgba8(frame)
        .resize_exact(size.width.max(1), size.height.max(1), FilterType::Triangle)
        .to_rgb8();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, THUMBNAIL_JPEG_QUALITY).encode_image(&resized)?;
    Ok(jpeg)
}

pub struct RecordingOutput {
    pub session_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub mime_type: String,
    pub blob: Vec<u8>,
}

/// Builds the artifact. Duration and thumbnail are best effort; a failure
/// in either is logged and the artifact is delivered without it.
pub fn process_recording(
    output: RecordingOutput,
    inspector: &dyn MediaInspector,
    thumbnail_size: ThumbnailSize,
) -> Artifact {
    let duration = match inspector.duration(&output.blob, &output.mime_type) {
        Ok(d) if d.is_finite() && d > 0.0 => Some(d),
        Ok(d) => {
            warn!(session = %output.session_id, duration = d, "recording reported no usable duration");
            None
        }
        Err(e) => {
            warn!(session = %output.session_id, error = %e, "failed to extract duration");
            None
        }
    };

    let thumbnail = match extract_thumbnail(
        inspector,
        &output.blob,
        &output.mime_type,
        duration,
        thumbnail_size,
    ) {
        Ok(jpeg) => Some(jpeg),
        Err(e) => {
            warn!(session = %output.session_id, error = %e, "failed to generate thumbnail");
            None
        }
    };

    let artifact = Artifact {
        session_id: output.session_id,
        recorded_at: output.recorded_at,
        mime_type: output.mime_type,
        blob: output.blob,
        object_url: new_object_url(),
        thumbnail,
        duration,
    };
    info!(
        session = %artifact.session_id,
        bytes = artifact.size(),
        duration = ?artifact.duration,
        thumbnail = artifact.thumbnail.is_some(),
        "recording processed"
    );
    artifact
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecorderError;
    use image::Rgba;
    use std::sync::Mutex;

    struct StubInspector {
        duration: Option<f64>,
        seeks: Mutex<Vec<f64>>,
    }

    impl StubInspector {
        fn new(duration: Option<f64>) -> Self {
            Self {
                duration,
                seeks: Mutex::new(Vec::new()),
            }
        }
    }

    impl MediaInspector for StubInspector {
        fn duration(&self, _blob: &[u8], _mime_type: &str) -> Result<f64> {
            self.duration
                .ok_or_else(|| RecorderError::Decode("no metadata".to_string()))
        }

        fn frame_at(&self, _blob: &[u8], _mime_type: &str, seconds: f64) -> Result<RgbaImage> {
            self.seeks.lock().unwrap().push(seconds);
            Ok(RgbaImage::from_pixel(32, 18, Rgba([0, 128, 255, 255])))
        }
    }

    fn output() -> RecordingOutput {
        RecordingOutput {
            session_id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            mime_type: "image/gif".to_string(),
            blob: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_thumbnail_seeks_to_two_seconds_or_half() {
        let inspector = StubInspector::new(Some(10.0));
        let artifact = process_recording(output(), &inspector, ThumbnailSize::default());
        assert_eq!(artifact.duration, Some(10.0));

        let inspector_short = StubInspector::new(Some(3.0));
        process_recording(output(), &inspector_short, ThumbnailSize::default());

        assert_eq!(*inspector.seeks.lock().unwrap(), vec![2.0]);
        assert_eq!(*inspector_short.seeks.lock().unwrap(), vec![1.5]);

        let thumbnail = artifact.thumbnail.unwrap();
        let decoded = image::load_from_memory(&thumbnail).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
    }

    #[test]
    fn test_missing_duration_still_delivers_artifact() {
        let inspector = StubInspector::new(None);
        let artifact = process_recording(output(), &inspector, ThumbnailSize::default());
        assert_eq!(artifact.duration, None);
        assert!(artifact.thumbnail.is_some());
        assert_eq!(artifact.blob, vec![1, 2, 3]);
        assert!(artifact.object_url.starts_with("blob:reviewcap/"));
    }

    #[test]
    fn test_extension_for_mime() {
        assert_eq!(extension_for_mime("video/webm;codecs=vp8,opus"), "webm");
        assert_eq!(extension_for_mime("image/gif"), "gif");
        assert_eq!(extension_for_mime("application/octet-stream"), "bin");
    }
}
