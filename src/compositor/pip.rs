use crate::settings::{WebcamPosition, WebcamSize};

const PIP_PADDING: f32 = 20.0;

/// Placement of the webcam overlay on the master surface, in surface pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PipRect {
    pub fn is_empty(&self) -> bool {
        self.width < 1.0 || self.height < 1.0
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Webcam overlay geometry. Width is a fraction of the frame width, height
/// keeps a 4:3 ratio, and the overlay sits 20px from the chosen edges.
pub fn pip_rect(
    frame_width: u32,
    frame_height: u32,
    position: WebcamPosition,
    size: WebcamSize,
) -> PipRect {
    if frame_width == 0 || frame_height == 0 {
        return PipRect::default();
    }

    let frame_width = frame_width as f32;
    let frame_height = frame_height as f32;
    let width = frame_width * size.multiplier();
    let height = width * 3.0 / 4.0;

    let right = frame_width - width - PIP_PADDING;
    let bottom = frame_height - height - PIP_PADDING;

    let (x, y) = match position {
        WebcamPosition::TopLeft => (PIP_PADDING, PIP_PADDING),
        WebcamPosition::TopRight => (right, PIP_PADDING),
        WebcamPosition::BottomLeft => (PIP_PADDING, bottom),
        WebcamPosition::BottomRight => (right, bottom),
        WebcamPosition::Center => ((frame_width - width) / 2.0, (frame_height - height) / 2.0),
    };

    PipRect { x, y, width, height }
}

type PipKey = (u32, u32, WebcamPosition, WebcamSize);

/// Memoises [`pip_rect`] for the last set of inputs.
#[derive(Debug, Default)]
pub struct PipCache {
    key: Option<PipKey>,
    rect: PipRect,
    recomputes: u64,
}

impl PipCache {
    pub fn get(
        &mut self,
        frame_width: u32,
        frame_height: u32,
        position: WebcamPosition,
        size: WebcamSize,
    ) -> PipRect {
        let key = (frame_width, frame_height, position, size);
        if self.key != Some(key) {
            self.rect = pip_rect(frame_width, frame_height, position, size);
            self.key = Some(key);
            self.recomputes += 1;
        }
        self.rect
    }

    pub fn recomputes(&self) -> u64 {
        self.recomputes
    }
}
