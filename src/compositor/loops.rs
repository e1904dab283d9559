use image::RgbaImage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{Compositor, FrameScheduler, PreviewSurface};
use crate::annotation::AnnotationLayer;
use crate::capture::{CaptureTarget, DecodedVideo};
use crate::settings::SharedSettings;

/// Where the preview loop looks for its surface; registration can happen
/// while a session is running.
pub type PreviewSlot = Arc<Mutex<Option<Arc<dyn PreviewSurface>>>>;

/// Counters shared by the compositor loops of one session.
#[derive(Debug, Default)]
pub struct LoopStats {
    composited: AtomicU64,
    dropped: AtomicU64,
    presented: AtomicU64,
    skipped: AtomicU64,
}

impl LoopStats {
    pub fn composited(&self) -> u64 {
        self.composited.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }

    /// Ticks that found no usable source frame.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Everything a capture loop needs to draw one frame.
#[derive(Clone)]
pub struct CompositeContext {
    pub compositor: Arc<Mutex<Compositor>>,
    pub annotations: Arc<Mutex<AnnotationLayer>>,
    pub settings: Arc<SharedSettings>,
    pub webcam: Option<Arc<DecodedVideo>>,
    pub alive: Arc<AtomicBool>,
    pub stats: Arc<LoopStats>,
}

impl CompositeContext {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Draws `primary` plus the current webcam frame and annotation raster.
    pub fn composite(&self, primary: &RgbaImage) {
        let settings = self.settings.load();
        let webcam = if settings.include_webcam {
            self.webcam.as_ref().and_then(|w| w.current_frame())
        } else {
            None
        };

        // Lock order: annotations, then compositor.
        let annotations = self.annotations.lock().unwrap_or_else(|e| e.into_inner());
        let overlay = (!annotations.is_blank()).then(|| annotations.raster());
        let mut compositor = self.compositor.lock().unwrap_or_else(|e| e.into_inner());
        compositor.compose(primary, webcam.as_deref(), overlay, &settings);
        self.stats.composited.fetch_add(1, Ordering::Relaxed);
    }
}

fn frame_interval(fps: u32) -> time::Interval {
    let mut ticker = time::interval(Duration::from_secs_f64(1.0 / fps.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Redraws from a live stream at display cadence. A source without a
/// decoded frame is retried on the next tick.
pub(crate) async fn run_live_capture(ctx: CompositeContext, video: Arc<DecodedVideo>, fps: u32) {
    let mut ticker = frame_interval(fps);
    loop {
        ticker.tick().await;
        if !ctx.is_alive() {
            break;
        }
        match video.current_frame() {
            Some(frame) => ctx.composite(&frame),
            None => {
                ctx.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    debug!(label = video.label(), "live capture loop finished");
}

/// Snapshots a workspace target on a drift-corrected schedule. Snapshots
/// are skipped while paused; a failed snapshot is retried on the next tick.
pub(crate) async fn run_dom_capture(
    ctx: CompositeContext,
    target: Arc<dyn CaptureTarget>,
    paused: Arc<AtomicBool>,
    fps: u32,
) {
    let mut scheduler = FrameScheduler::new(fps);
    while ctx.is_alive() {
        let now = Instant::now();
        let plan = scheduler.tick(now);
        if plan.dropped > 0 {
            ctx.stats.dropped.fetch_add(plan.dropped, Ordering::Relaxed);
            if scheduler.should_log(now) {
                warn!(
                    dropped = scheduler.total_dropped(),
                    "workspace capture falling behind, dropping frames"
                );
            }
        }

        if !paused.load(Ordering::SeqCst) {
            match target.snapshot().await {
                Ok(frame) if ctx.is_alive() => ctx.composite(&frame),
                Ok(_) => break,
                Err(e) => {
                    ctx.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "workspace snapshot failed, retrying next tick");
                }
            }
        }

        time::sleep_until(plan.next_at).await;
    }
    debug!(dropped = scheduler.total_dropped(), "workspace capture loop finished");
}

/// Mirrors the master surface onto whatever preview is registered.
pub(crate) async fn run_preview(
    compositor: Arc<Mutex<Compositor>>,
    preview: PreviewSlot,
    alive: Arc<AtomicBool>,
    stats: Arc<LoopStats>,
    fps: u32,
) {
    let mut ticker = frame_interval(fps);
    loop {
        ticker.tick().await;
        if !alive.load(Ordering::SeqCst) {
            break;
        }
        let Some(surface) = preview.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            continue;
        };
        let presented = compositor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .present_to(surface.as_ref());
        match presented {
            Ok(()) => {
                stats.presented.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => debug!(error = %e, "preview present failed"),
        }
    }
    debug!("preview loop finished");
}
