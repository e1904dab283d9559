//! Flattens primary source, webcam picture-in-picture and annotations onto
//! the master surface.

mod loops;
mod pip;
mod scheduler;

pub use loops::{CompositeContext, LoopStats, PreviewSlot};
pub use pip::{pip_rect, PipCache, PipRect};
pub use scheduler::{FrameScheduler, TickPlan};

pub(crate) use loops::{run_dom_capture, run_live_capture, run_preview};

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use crate::annotation::ClientRect;
use crate::capture::{BoundingBox, TrackSettings};
use crate::error::{RecorderError, Result};
use crate::settings::{Settings, WebcamShape};

pub const DEFAULT_SURFACE_WIDTH: u32 = 1920;
pub const DEFAULT_SURFACE_HEIGHT: u32 = 1080;
pub const MIN_SURFACE_WIDTH: u32 = 1280;
pub const MIN_SURFACE_HEIGHT: u32 = 720;

const PIP_FRAME_WIDTH: u32 = 2;
const PIP_FRAME_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// A visible surface the master surface is mirrored onto.
pub trait PreviewSurface: Send + Sync {
    fn size(&self) -> (u32, u32);
    fn resize(&self, width: u32, height: u32);
    fn present(&self, frame: &RgbaImage) -> Result<()>;
    /// Rendered rectangle in display coordinates, used to map pointer input.
    fn client_rect(&self) -> ClientRect;
}

/// Surface size for workspace capture: the target's box clamped to at least
/// 1280x720, or 1920x1080 when the box is unknown.
pub fn surface_size_for_target(bbox: Option<BoundingBox>) -> (u32, u32) {
    match bbox {
        Some(b) if b.width > 0.0 && b.height > 0.0 => (
            (b.width.round() as u32).max(MIN_SURFACE_WIDTH),
            (b.height.round() as u32).max(MIN_SURFACE_HEIGHT),
        ),
        _ => (DEFAULT_SURFACE_WIDTH, DEFAULT_SURFACE_HEIGHT),
    }
}

/// Surface size for live streams: the reported track resolution, or
/// 1920x1080 when the track does not report one.
pub fn surface_size_for_track(settings: TrackSettings) -> (u32, u32) {
    match (settings.width, settings.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => (DEFAULT_SURFACE_WIDTH, DEFAULT_SURFACE_HEIGHT),
    }
}

/// Owner of the master surface.
#[derive(Debug)]
pub struct Compositor {
    surface: RgbaImage,
    pip_cache: PipCache,
    allocations: u64,
    composited: u64,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compositor {
    pub fn new() -> Self {
        Self {
            surface: RgbaImage::new(0, 0),
            pip_cache: PipCache::default(),
            allocations: 0,
            composited: 0,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        self.surface.dimensions()
    }

    pub fn surface(&self) -> &RgbaImage {
        &self.surface
    }

    /// Number of times the surface buffer was (re)allocated.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn frames_composited(&self) -> u64 {
        self.composited
    }

    /// Reallocates the surface only when the dimensions change. Returns
    /// whether a reallocation happened.
    pub fn ensure_size(&mut self, width: u32, height: u32) -> bool {
        if self.surface.dimensions() == (width, height) {
            return false;
        }
        self.surface = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]));
        self.allocations += 1;
        true
    }

    /// Copy of the current surface for the encoder. Fails while the surface
    /// is unallocated.
    pub fn capture_frame(&self) -> Result<RgbaImage> {
        if self.surface.width() == 0 || self.surface.height() == 0 {
            return Err(RecorderError::NoStream);
        }
        Ok(self.surface.clone())
    }

    /// Draws one frame in the fixed order primary, webcam, annotations.
    pub fn compose(
        &mut self,
        primary: &RgbaImage,
        webcam: Option<&RgbaImage>,
        annotations: Option<&RgbaImage>,
        settings: &Settings,
    ) {
        if self.surface.width() == 0 || self.surface.height() == 0 {
            return;
        }
        self.draw_primary(primary);
        if let Some(webcam) = webcam {
            self.draw_webcam(webcam, settings);
        }
        if let Some(annotations) = annotations {
            self.draw_annotations(annotations);
        }
        self.composited += 1;
    }

    fn draw_primary(&mut self, frame: &RgbaImage) {
        if frame.width() == 0 || frame.height() == 0 {
            return;
        }
        let (width, height) = self.surface.dimensions();
        if frame.dimensions() == (width, height) {
            self.surface.copy_from_slice(frame.as_raw());
        } else {
            let scaled = imageops::resize(frame, width, height, FilterType::Triangle);
            self.surface.copy_from_slice(scaled.as_raw());
        }
        // The master surface is opaque.
        for pixel in self.surface.pixels_mut() {
            pixel[3] = 255;
        }
    }

    fn draw_webcam(&mut self, frame: &RgbaImage, settings: &Settings) {
        if frame.width() == 0 || frame.height() == 0 {
            return;
        }
        let (width, height) = self.surface.dimensions();
        let rect = self
            .pip_cache
            .get(width, height, settings.webcam_position, settings.webcam_size);
        if rect.is_empty() {
            return;
        }

        let x = rect.x.round() as i64;
        let y = rect.y.round() as i64;
        let w = rect.width.round() as u32;
        let h = rect.height.round() as u32;

        match settings.webcam_shape {
            WebcamShape::Rectangle => {
                let border = PIP_FRAME_WIDTH as i64;
                fill_rect(
                    &mut self.surface,
                    x - border,
                    y - border,
                    w + 2 * PIP_FRAME_WIDTH,
                    h + 2 * PIP_FRAME_WIDTH,
                    PIP_FRAME_COLOR,
                );
                let scaled = imageops::resize(frame, w, h, FilterType::Triangle);
                blit(&mut self.surface, &scaled, x, y, |_, _| true);
            }
            WebcamShape::Circle => {
                let radius = rect.width.min(rect.height) / 2.0;
                let (cx, cy) = rect.center();

                // Letterbox the camera inside the clip by aspect ratio.
                let aspect = frame.width() as f32 / frame.height() as f32;
                let (draw_w, draw_h) = if aspect > rect.width / rect.height {
                    (rect.width, rect.width / aspect)
                } else {
                    (rect.height * aspect, rect.height)
                };
                let draw_x = cx - draw_w / 2.0;
                let draw_y = cy - draw_h / 2.0;

                let scaled = imageops::resize(
                    frame,
                    draw_w.round().max(1.0) as u32,
                    draw_h.round().max(1.0) as u32,
                    FilterType::Triangle,
                );
                let origin_x = draw_x.round() as i64;
                let origin_y = draw_y.round() as i64;
                let r2 = radius * radius;
                blit(&mut self.surface, &scaled, origin_x, origin_y, |px, py| {
                    let dx = px as f32 + 0.5 - cx;
                    let dy = py as f32 + 0.5 - cy;
                    dx * dx + dy * dy <= r2
                });
            }
        }
    }

    fn draw_annotations(&mut self, layer: &RgbaImage) {
        let width = self.surface.width().min(layer.width());
        let height = self.surface.height().min(layer.height());
        for y in 0..height {
            for x in 0..width {
                let src = layer.get_pixel(x, y);
                if src[3] == 0 {
                    continue;
                }
                blend_over(self.surface.get_pixel_mut(x, y), src);
            }
        }
    }

    /// Blanks the surface pixels, keeping its size.
    pub fn clear(&mut self) {
        for pixel in self.surface.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 255]);
        }
    }

    /// Mirrors the surface onto a preview, resizing the preview to match.
    pub fn present_to(&self, preview: &dyn PreviewSurface) -> Result<()> {
        let (width, height) = self.surface.dimensions();
        if width == 0 || height == 0 {
            return Ok(());
        }
        if preview.size() != (width, height) {
            preview.resize(width, height);
        }
        preview.present(&self.surface)
    }
}

/// Source-over blend onto an opaque destination.
fn blend_over(dst: &mut Rgba<u8>, src: &Rgba<u8>) {
    let alpha = src[3] as u32;
    if alpha == 255 {
        *dst = Rgba([src[0], src[1], src[2], 255]);
        return;
    }
    for c in 0..3 {
        dst[c] = ((src[c] as u32 * alpha + dst[c] as u32 * (255 - alpha) + 127) / 255) as u8;
    }
    dst[3] = 255;
}

fn fill_rect(image: &mut RgbaImage, x: i64, y: i64, w: u32, h: u32, color: Rgba<u8>) {
    let (img_w, img_h) = (image.width() as i64, image.height() as i64);
    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = (x + w as i64).min(img_w);
    let y1 = (y + h as i64).min(img_h);
    for py in y0..y1 {
        for px in x0..x1 {
            image.put_pixel(px as u32, py as u32, color);
        }
    }
}

/// Copies `src` onto `dst` at (`x`, `y`), skipping pixels outside `dst` or
/// rejected by `mask` (which receives destination coordinates).
fn blit<F>(dst: &mut RgbaImage, src: &RgbaImage, x: i64, y: i64, mask: F)
where
    F: Fn(i64, i64) -> bool,
{
    let (dst_w, dst_h) = (dst.width() as i64, dst.height() as i64);
    for (sx, sy, pixel) in src.enumerate_pixels() {
        let px = x + sx as i64;
        let py = y + sy as i64;
        if px < 0 || py < 0 || px >= dst_w || py >= dst_h || !mask(px, py) {
            continue;
        }
        dst.put_pixel(px as u32, py as u32, Rgba([pixel[0], pixel[1], pixel[2], 255]));
    }
}
