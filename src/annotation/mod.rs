//! Pointer-driven annotation raster with linear undo/redo history.

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RecorderError, Result};

const DEFAULT_STROKE_WIDTH: f32 = 3.0;
const DEFAULT_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);
/// Oldest snapshots are discarded beyond this many.
const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    #[default]
    Pen,
    Arrow,
    Rect,
    Circle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnotationTool {
    pub kind: ToolKind,
    pub color: Rgba<u8>,
    pub stroke_width: f32,
}

impl Default for AnnotationTool {
    fn default() -> Self {
        Self {
            kind: ToolKind::Pen,
            color: DEFAULT_COLOR,
            stroke_width: DEFAULT_STROKE_WIDTH,
        }
    }
}

impl AnnotationTool {
    pub fn new(kind: ToolKind, color: &str, stroke_width: f32) -> Result<Self> {
        let color = parse_hex_color(color)
            .ok_or_else(|| RecorderError::InvalidSettings(format!("invalid color '{}'", color)))?;
        if !(stroke_width > 0.0 && stroke_width.is_finite()) {
            return Err(RecorderError::InvalidSettings(format!(
                "invalid stroke width {}",
                stroke_width
            )));
        }
        Ok(Self {
            kind,
            color,
            stroke_width,
        })
    }
}

/// Parses `#rrggbb` (or `rrggbb`) into an opaque colour.
pub fn parse_hex_color(value: &str) -> Option<Rgba<u8>> {
    let hex = value.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some(Rgba([channel(0)?, channel(2)?, channel(4)?, 255]))
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Rendered rectangle of an element in display coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClientRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// Maps a display-space point into raster pixels, compensating for any
/// scaling between the raster and its rendered element.
pub fn to_raster(point: Point, rect: ClientRect, raster_width: u32, raster_height: u32) -> Point {
    let scale_x = if rect.width > 0.0 {
        raster_width as f32 / rect.width
    } else {
        1.0
    };
    let scale_y = if rect.height > 0.0 {
        raster_height as f32 / rect.height
    } else {
        1.0
    };
    Point {
        x: (point.x - rect.left) * scale_x,
        y: (point.y - rect.top) * scale_y,
    }
}

/// The annotation raster drawn over every composite frame.
///
/// `history` holds full-frame snapshots and `history_index` points at the
/// one currently shown, or is -1 when the layer is back to blank.
#[derive(Debug)]
pub struct AnnotationLayer {
    raster: RgbaImage,
    tool: AnnotationTool,
    drawing: bool,
    last_point: Option<Point>,
    history: Vec<RgbaImage>,
    history_index: isize,
    blank: bool,
}

impl AnnotationLayer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            raster: RgbaImage::from_pixel(width, height, TRANSPARENT),
            tool: AnnotationTool::default(),
            drawing: false,
            last_point: None,
            history: Vec::new(),
            history_index: -1,
            blank: true,
        }
    }

    pub fn raster(&self) -> &RgbaImage {
        &self.raster
    }

    pub fn size(&self) -> (u32, u32) {
        self.raster.dimensions()
    }

    pub fn is_blank(&self) -> bool {
        self.blank
    }

    pub fn is_drawing(&self) -> bool {
        self.drawing
    }

    pub fn tool(&self) -> AnnotationTool {
        self.tool
    }

    pub fn set_tool(&mut self, tool: AnnotationTool) {
        if tool.kind != ToolKind::Pen {
            debug!(kind = ?tool.kind, "shape tools draw as freehand strokes");
        }
        self.tool = tool;
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn history_index(&self) -> isize {
        self.history_index
    }

    pub fn can_undo(&self) -> bool {
        self.history_index >= 0
    }

    pub fn can_redo(&self) -> bool {
        self.history_index + 1 < self.history.len() as isize
    }

    pub fn pointer_down(&mut self, pos: Point) {
        if !pos.is_finite() {
            return;
        }
        self.drawing = true;
        self.last_point = Some(pos);
    }

    pub fn pointer_move(&mut self, pos: Point) {
        if !self.drawing || !pos.is_finite() {
            return;
        }
        let from = self.last_point.unwrap_or(pos);
        draw_line(
            &mut self.raster,
            from,
            pos,
            self.tool.color,
            self.tool.stroke_width,
        );
        self.last_point = Some(pos);
        self.blank = false;
    }

    /// Ends the stroke and commits a snapshot, discarding any redo states.
    pub fn pointer_up(&mut self) {
        if !self.drawing {
            return;
        }
        self.drawing = false;
        self.last_point = None;

        self.history.truncate((self.history_index + 1) as usize);
        self.history.push(self.raster.clone());
        if self.history.len() > MAX_HISTORY {
            self.history.remove(0);
        }
        self.history_index = self.history.len() as isize - 1;
    }

    pub fn undo(&mut self) -> bool {
        if self.history_index < 0 {
            return false;
        }
        self.history_index -= 1;
        self.restore_current();
        true
    }

    pub fn redo(&mut self) -> bool {
        if !self.can_redo() {
            return false;
        }
        self.history_index += 1;
        self.restore_current();
        true
    }

    /// Blanks the raster and forgets all history.
    pub fn clear(&mut self) {
        self.blank_raster();
        self.history.clear();
        self.history_index = -1;
        self.drawing = false;
        self.last_point = None;
    }

    /// Matches the raster to a new surface size. Existing strokes and
    /// history no longer line up and are dropped.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.raster.dimensions() == (width, height) {
            return;
        }
        self.raster = RgbaImage::from_pixel(width, height, TRANSPARENT);
        self.history.clear();
        self.history_index = -1;
        self.drawing = false;
        self.last_point = None;
        self.blank = true;
    }

    fn restore_current(&mut self) {
        match usize::try_from(self.history_index)
            .ok()
            .and_then(|i| self.history.get(i))
        {
            Some(snapshot) => {
                self.raster.copy_from_slice(snapshot.as_raw());
                self.blank = self.raster.pixels().all(|p| p[3] == 0);
            }
            None => self.blank_raster(),
        }
    }

    fn blank_raster(&mut self) {
        for pixel in self.raster.pixels_mut() {
            *pixel = TRANSPARENT;
        }
        self.blank = true;
    }
}

/// Thick line with round caps and joins, stamped as overlapping disks.
/// Only the part of the segment that can touch the raster is stamped.
fn draw_line(image: &mut RgbaImage, p1: Point, p2: Point, color: Rgba<u8>, width: f32) {
    let radius = width / 2.0;
    let Some((p1, p2)) = clip_segment(p1, p2, image.width(), image.height(), radius) else {
        return;
    };
    let dx = p2.x - p1.x;
    let dy = p2.y - p1.y;
    let dist = (dx * dx + dy * dy).sqrt();
    let steps = (dist * 2.0).max(1.0) as i32;

    for i in 0..=steps {
        let t = i as f32 / steps as f32;
        draw_disk(image, p1.x + dx * t, p1.y + dy * t, radius, color);
    }
}

/// Liang-Barsky clip of `p1..p2` against the raster grown by `margin`.
fn clip_segment(p1: Point, p2: Point, width: u32, height: u32, margin: f32) -> Option<(Point, Point)> {
    let (min_x, min_y) = (-margin, -margin);
    let (max_x, max_y) = (width as f32 + margin, height as f32 + margin);
    let dx = p2.x - p1.x;
    let dy = p2.y - p1.y;
    let (mut t0, mut t1) = (0.0f32, 1.0f32);

    for (p, q) in [
        (-dx, p1.x - min_x),
        (dx, max_x - p1.x),
        (-dy, p1.y - min_y),
        (dy, max_y - p1.y),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            t0 = t0.max(r);
        } else {
            t1 = t1.min(r);
        }
        if t0 > t1 {
            return None;
        }
    }

    let at = |t: f32| Point::new(p1.x + dx * t, p1.y + dy * t);
    Some((at(t0), at(t1)))
}

fn draw_disk(image: &mut RgbaImage, cx: f32, cy: f32, radius: f32, color: Rgba<u8>) {
    let (img_width, img_height) = (image.width() as i32, image.height() as i32);
    let r = radius.ceil() as i32;
    let cx_i = cx.round() as i32;
    let cy_i = cy.round() as i32;

    for dy in -r..=r {
        for dx in -r..=r {
            if (dx * dx + dy * dy) as f32 > radius * radius {
                continue;
            }
            let px = cx_i + dx;
            let py = cy_i + dy;
            if px >= 0 && px < img_width && py >= 0 && py < img_height {
                image.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}
