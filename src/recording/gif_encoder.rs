use gif::{Encoder, Frame, Repeat};
use image::codecs::gif::GifDecoder;
use image::imageops::{self, FilterType};
use image::{AnimationDecoder, RgbaImage};
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::postprocess::MediaInspector;
use super::{ChunkEncoder, EncoderBackend, EncoderConfig};
use crate::error::{RecorderError, Result};

pub const GIF_MIME: &str = "image/gif";

const DEFAULT_MAX_DIMENSION: u32 = 960;
const MAX_GIF_DIMENSION: u32 = 4096;
const MIN_DELAY_CS: u64 = 1;

/// Built-in container: an animated GIF streamed out in chunks.
#[derive(Debug, Clone, Copy)]
pub struct GifEncoderBackend {
    max_dimension: u32,
}

impl Default for GifEncoderBackend {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

impl GifEncoderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames larger than this on either side are scaled down.
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension.clamp(16, MAX_GIF_DIMENSION);
        self
    }

    fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        if width <= self.max_dimension && height <= self.max_dimension {
            return (width, height);
        }
        let scale = (self.max_dimension as f32 / width as f32)
            .min(self.max_dimension as f32 / height as f32);
        (
            ((width as f32 * scale) as u32).max(1),
            ((height as f32 * scale) as u32).max(1),
        )
    }
}

impl EncoderBackend for GifEncoderBackend {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        mime_type == GIF_MIME
    }

    fn create(&self, config: &EncoderConfig) -> Result<Box<dyn ChunkEncoder>> {
        if !self.is_type_supported(&config.mime_type) {
            return Err(RecorderError::UnsupportedContainer(vec![config.mime_type.clone()]));
        }
        if config.width == 0 || config.height == 0 {
            return Err(RecorderError::Encoder("frame has zero dimension".to_string()));
        }
        let (width, height) = self.output_size(config.width, config.height);
        Ok(Box::new(GifChunkEncoder::new(width, height, config)?))
    }
}

/// `Write` target whose bytes are drained on every flush.
#[derive(Debug, Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Streams frames into an animated GIF.
///
/// A frame's delay is only known once the next frame arrives, so one frame
/// is held back. Delays are derived from cumulative timestamps so rounding
/// to centiseconds never drifts.
pub struct GifChunkEncoder {
    encoder: Encoder<SharedSink>,
    sink: SharedSink,
    width: u32,
    height: u32,
    speed: i32,
    frame_period: Duration,
    pending: Option<(RgbaImage, Duration)>,
    written_cs: u64,
}

impl GifChunkEncoder {
    fn new(width: u32, height: u32, config: &EncoderConfig) -> Result<Self> {
        if width > u16::MAX as u32 || height > u16::MAX as u32 {
            return Err(RecorderError::Encoder(
                "dimensions too large for GIF format".to_string(),
            ));
        }
        let sink = SharedSink::default();
        let mut encoder = Encoder::new(sink.clone(), width as u16, height as u16, &[])?;
        encoder.set_repeat(Repeat::Infinite)?;

        Ok(Self {
            encoder,
            sink,
            width,
            height,
            speed: speed_for_bitrate(config.bitrate),
            frame_period: Duration::from_secs_f64(1.0 / config.fps.max(1) as f64),
            pending: None,
            written_cs: 0,
        })
    }

    fn write_pending(&mut self, until: Duration) -> Result<()> {
        let Some((image, _)) = self.pending.take() else {
            return Ok(());
        };
        let end_cs = (until.as_millis() as u64 + 5) / 10;
        let delay = end_cs.saturating_sub(self.written_cs).max(MIN_DELAY_CS);

        let mut rgba = image.into_raw();
        let mut frame =
            Frame::from_rgba_speed(self.width as u16, self.height as u16, &mut rgba, self.speed);
        frame.delay = delay.min(u16::MAX as u64) as u16;
        self.encoder.write_frame(&frame)?;
        self.written_cs += delay;
        Ok(())
    }
}

impl ChunkEncoder for GifChunkEncoder {
    fn encode(&mut self, frame: &RgbaImage, timestamp: Duration) -> Result<()> {
        let image = if frame.dimensions() == (self.width, self.height) {
            frame.clone()
        } else {
            imageops::resize(frame, self.width, self.height, FilterType::Triangle)
        };
        self.write_pending(timestamp)?;
        self.pending = Some((image, timestamp));
        Ok(())
    }

    fn request_data(&mut self) -> Result<Vec<u8>> {
        Ok(self.sink.take())
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>> {
        if let Some((_, last)) = &self.pending {
            let end = *last + self.frame_period;
            self.write_pending(end)?;
        }
        let sink = self.sink.clone();
        self.encoder
            .into_inner()
            .map_err(|e| RecorderError::Encoder(e.to_string()))?;
        Ok(sink.take())
    }
}

fn speed_for_bitrate(bitrate: u32) -> i32 {
    match bitrate {
        b if b >= 5_000_000 => 10,
        b if b >= 2_500_000 => 20,
        _ => 30,
    }
}

/// Reads duration and frames back out of a GIF blob.
#[derive(Debug, Clone, Copy, Default)]
pub struct GifInspector;

impl GifInspector {
    fn frames(blob: &[u8]) -> Result<image::Frames<'_>> {
        let decoder = GifDecoder::new(Cursor::new(blob))?;
        Ok(decoder.into_frames())
    }
}

impl MediaInspector for GifInspector {
    fn duration(&self, blob: &[u8], mime_type: &str) -> Result<f64> {
        if mime_type != GIF_MIME {
            return Err(RecorderError::Decode(format!("cannot inspect {}", mime_type)));
        }
        let mut total_ms = 0.0;
        for frame in Self::frames(blob)? {
            let (numer, denom) = frame?.delay().numer_denom_ms();
            total_ms += numer as f64 / denom.max(1) as f64;
        }
        Ok(total_ms / 1000.0)
    }

    fn frame_at(&self, blob: &[u8], mime_type: &str, seconds: f64) -> Result<RgbaImage> {
        if mime_type != GIF_MIME {
            return Err(RecorderError::Decode(format!("cannot decode {}", mime_type)));
        }
        let target_ms = seconds.max(0.0) * 1000.0;
        let mut elapsed_ms = 0.0;
        let mut last = None;
        for frame in Self::frames(blob)? {
            let frame = frame?;
            let (numer, denom) = frame.delay().numer_denom_ms();
            let end_ms = elapsed_ms + numer as f64 / denom.max(1) as f64;
            if target_ms < end_ms {
                return Ok(frame.into_buffer());
            }
            elapsed_ms = end_ms;
            last = Some(frame);
        }
        last.map(|f| f.into_buffer())
            .ok_or_else(|| RecorderError::Decode("GIF has no frames".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn config(width: u32, height: u32) -> EncoderConfig {
        EncoderConfig {
            mime_type: GIF_MIME.to_string(),
            width,
            height,
            fps: 10,
            bitrate: 5_000_000,
            has_audio: false,
        }
    }

    fn encode_solid(frames: &[(Rgba<u8>, u64)]) -> Vec<u8> {
        let backend = GifEncoderBackend::new();
        let mut encoder = backend.create(&config(32, 24)).unwrap();
        let mut blob = Vec::new();
        for (color, at_ms) in frames {
            let image = RgbaImage::from_pixel(32, 24, *color);
            encoder.encode(&image, Duration::from_millis(*at_ms)).unwrap();
            blob.extend(encoder.request_data().unwrap());
        }
        blob.extend(encoder.finish().unwrap());
        blob
    }

    #[test]
    fn test_chunks_concatenate_to_valid_gif() {
        let blob = encode_solid(&[
            (Rgba([255, 0, 0, 255]), 0),
            (Rgba([0, 255, 0, 255]), 100),
            (Rgba([0, 0, 255, 255]), 200),
        ]);
        assert!(blob.starts_with(b"GIF89a"));
        assert_eq!(blob.last(), Some(&0x3B));

        let duration = GifInspector.duration(&blob, GIF_MIME).unwrap();
        assert!((duration - 0.3).abs() < 1e-6, "duration {duration}");
    }

    #[test]
    fn test_irregular_timestamps_do_not_drift() {
        let blob = encode_solid(&[
            (Rgba([0, 0, 0, 255]), 0),
            (Rgba([0, 0, 0, 255]), 33),
            (Rgba([0, 0, 0, 255]), 66),
            (Rgba([0, 0, 0, 255]), 1000),
        ]);
        // last frame lasts one period at 10 fps
        let duration = GifInspector.duration(&blob, GIF_MIME).unwrap();
        assert!((duration - 1.1).abs() < 1e-6, "duration {duration}");
    }

    #[test]
    fn test_frame_at_seeks_by_delay() {
        let blob = encode_solid(&[
            (Rgba([255, 0, 0, 255]), 0),
            (Rgba([0, 0, 255, 255]), 1000),
        ]);
        let first = GifInspector.frame_at(&blob, GIF_MIME, 0.5).unwrap();
        let second = GifInspector.frame_at(&blob, GIF_MIME, 1.05).unwrap();
        let past_end = GifInspector.frame_at(&blob, GIF_MIME, 60.0).unwrap();
        assert!(first.get_pixel(4, 4)[0] > 200);
        assert!(second.get_pixel(4, 4)[2] > 200);
        assert_eq!(second.get_pixel(4, 4), past_end.get_pixel(4, 4));
    }

    #[test]
    fn test_large_frames_are_scaled_down() {
        let backend = GifEncoderBackend::new().with_max_dimension(64);
        assert_eq!(backend.output_size(1920, 1080), (64, 36));
        assert_eq!(backend.output_size(32, 24), (32, 24));
    }

    #[test]
    fn test_only_gif_is_supported() {
        let backend = GifEncoderBackend::new();
        assert!(backend.is_type_supported(GIF_MIME));
        assert!(!backend.is_type_supported("video/webm"));
        let mut webm = config(32, 24);
        webm.mime_type = "video/webm".to_string();
        assert!(matches!(
            backend.create(&webm),
            Err(RecorderError::UnsupportedContainer(_))
        ));
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        assert!(GifInspector.duration(b"not a gif", GIF_MIME).is_err());
        assert!(GifInspector.duration(b"GIF89a", "video/webm").is_err());
    }
}
