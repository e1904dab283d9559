//! Session state machine and timers.
//!
//! The engine is a cloneable handle. Lifecycle calls other than `start` are
//! synchronous and may be made from any thread; background work runs on the
//! tokio runtime captured when the engine was built.

mod options;
#[cfg(test)]
mod tests;

pub use options::EngineOptions;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::annotation::{to_raster, AnnotationLayer, AnnotationTool, Point};
use crate::capture::{
    CaptureTarget, DecodedVideo, HeldSources, MediaDevices, PrimarySource, SourceManager,
    VideoSink,
};
use crate::compositor::{
    self, surface_size_for_target, surface_size_for_track, CompositeContext, Compositor,
    LoopStats, PreviewSlot, PreviewSurface,
};
use crate::error::{RecorderError, Result};
use crate::recording::{
    self, process_recording, select_mime, Artifact, Chunk, ChunkMerger, ChunkStore, ConcatMerger,
    Consolidator, EncoderBackend, EncoderConfig, EncoderState, MediaInspector, RecorderBridge,
    RecordingOutput,
};
use crate::settings::{
    SettingsPatch, SharedSettings, Settings, WebcamPosition, WebcamSize,
};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    /// Sources are being acquired.
    Starting,
    Countdown,
    Recording,
    Paused,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Countdown => "counting down",
            Phase::Recording => "recording",
            Phase::Paused => "paused",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Observable engine state, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct EngineSnapshot {
    pub phase: Phase,
    pub countdown: u32,
    pub recording_time: u32,
    pub processing: bool,
    pub preview_ready: bool,
    pub session_id: Option<Uuid>,
    pub has_webcam: bool,
    pub encoder_state: EncoderState,
}

impl EngineSnapshot {
    pub fn is_recording(&self) -> bool {
        matches!(self.phase, Phase::Recording | Phase::Paused)
    }

    pub fn is_paused(&self) -> bool {
        self.phase == Phase::Paused
    }
}

/// One entry of the session timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub kind: String,
    /// Milliseconds since recording began.
    pub time_ms: u64,
    pub data: serde_json::Value,
}

/// `MM:SS`, minutes not capped at 59.
pub fn format_time(seconds: u32) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

type Callback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&RecorderError) + Send + Sync>;
type ArtifactCallback = Arc<dyn Fn(&Arc<Artifact>) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    on_start: Option<Callback>,
    on_end: Option<Callback>,
    on_pause: Option<Callback>,
    on_resume: Option<Callback>,
    on_error: Option<ErrorCallback>,
    on_artifact_ready: Option<ArtifactCallback>,
}

#[derive(Default)]
struct Registry {
    preview: PreviewSlot,
    primary_sink: Option<Arc<dyn VideoSink>>,
    webcam_sink: Option<Arc<dyn VideoSink>>,
    capture_target: Option<Arc<dyn CaptureTarget>>,
}

/// A spawned loop: a liveness flag the loop checks every tick, plus the
/// task itself.
struct LoopHandle {
    name: &'static str,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    fn spawn<F>(runtime: &Handle, name: &'static str, make: impl FnOnce(Arc<AtomicBool>) -> F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let task = runtime.spawn(make(Arc::clone(&alive)));
        Self { name, alive, task }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Clears the flag and aborts the task.
    fn kill(self) {
        self.alive.store(false, Ordering::SeqCst);
        self.task.abort();
        debug!(name = self.name, "loop stopped");
    }
}

/// Kills the consolidation sweep when dropped.
struct SweepGuard(Option<LoopHandle>);

impl SweepGuard {
    fn stop_ticking(&self) {
        if let Some(sweep) = &self.0 {
            sweep.alive.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        if let Some(sweep) = self.0.take() {
            sweep.kill();
        }
    }
}

#[derive(Default)]
struct SessionState {
    phase: Phase,
    generation: u64,
    countdown: u32,
    recording_time: u32,
    processing: bool,
    preview_ready: bool,
    session_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    started_instant: Option<Instant>,
    sources: HeldSources,
    bridge: Option<Arc<RecorderBridge>>,
    loops: Vec<LoopHandle>,
    sweep: Option<LoopHandle>,
    timer: Option<LoopHandle>,
    finalize: Option<JoinHandle<()>>,
    paused: Arc<AtomicBool>,
    stats: Option<Arc<LoopStats>>,
    events: Vec<TimelineEvent>,
    artifact: Option<Arc<Artifact>>,
}

impl SessionState {
    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            phase: self.phase,
            countdown: self.countdown,
            recording_time: self.recording_time,
            processing: self.processing,
            preview_ready: self.preview_ready,
            session_id: self.session_id,
            has_webcam: self.sources.webcam.is_some(),
            encoder_state: self
                .bridge
                .as_ref()
                .map(|b| b.state())
                .unwrap_or_default(),
        }
    }

    fn kill_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.kill();
        }
    }

    /// Stops every loop and timer and releases every stream.
    fn teardown(&mut self) {
        self.kill_timer();
        for handle in self.loops.drain(..) {
            handle.kill();
        }
        if let Some(sweep) = self.sweep.take() {
            sweep.kill();
        }
        if let Some(finalize) = self.finalize.take() {
            finalize.abort();
        }
        if let Some(bridge) = self.bridge.take() {
            bridge.discard();
        }
        self.sources.release_all();
        self.paused.store(false, Ordering::SeqCst);
    }
}

struct EngineInner {
    runtime: Handle,
    sources: SourceManager,
    backend: Arc<dyn EncoderBackend>,
    inspector: Arc<dyn MediaInspector>,
    merger: Arc<dyn ChunkMerger>,
    options: EngineOptions,
    settings: Arc<SharedSettings>,
    compositor: Arc<Mutex<Compositor>>,
    annotations: Arc<Mutex<AnnotationLayer>>,
    chunks: Arc<ChunkStore>,
    registry: Mutex<Registry>,
    callbacks: Mutex<Callbacks>,
    state: Mutex<SessionState>,
    watch: watch::Sender<EngineSnapshot>,
}

pub struct EngineBuilder {
    devices: Arc<dyn MediaDevices>,
    backend: Arc<dyn EncoderBackend>,
    inspector: Arc<dyn MediaInspector>,
    merger: Arc<dyn ChunkMerger>,
    options: EngineOptions,
    settings: Settings,
    runtime: Option<Handle>,
}

impl EngineBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn merger(mut self, merger: Arc<dyn ChunkMerger>) -> Self {
        self.merger = merger;
        self
    }

    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<RecordingEngine> {
        self.options.validate()?;
        self.settings.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| RecorderError::Runtime(e.to_string()))?,
        };
        let sources = SourceManager::new(self.devices)
            .with_decode_fps(self.options.stream_fps)
            .with_webcam_resolution(self.options.webcam_width, self.options.webcam_height);
        let (watch, _) = watch::channel(EngineSnapshot::default());

        Ok(RecordingEngine {
            inner: Arc::new(EngineInner {
                runtime,
                sources,
                backend: self.backend,
                inspector: self.inspector,
                merger: self.merger,
                options: self.options,
                settings: Arc::new(SharedSettings::new(self.settings)),
                compositor: Arc::new(Mutex::new(Compositor::new())),
                annotations: Arc::new(Mutex::new(AnnotationLayer::new(0, 0))),
                chunks: Arc::new(ChunkStore::new()),
                registry: Mutex::new(Registry::default()),
                callbacks: Mutex::new(Callbacks::default()),
                state: Mutex::new(SessionState::default()),
                watch,
            }),
        })
    }
}

/// The recording engine. Clones share one engine.
#[derive(Clone)]
pub struct RecordingEngine {
    inner: Arc<EngineInner>,
}

impl RecordingEngine {
    pub fn builder(
        devices: Arc<dyn MediaDevices>,
        backend: Arc<dyn EncoderBackend>,
        inspector: Arc<dyn MediaInspector>,
    ) -> EngineBuilder {
        EngineBuilder {
            devices,
            backend,
            inspector,
            merger: Arc::new(ConcatMerger),
            options: EngineOptions::default(),
            settings: Settings::default(),
            runtime: None,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn callbacks(&self) -> Callbacks {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn notify(&self) {
        let snapshot = self.state().snapshot();
        self.inner.watch.send_replace(snapshot);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state().generation == generation
    }

    fn weak(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    fn from_weak(weak: &Weak<EngineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ---- registration -------------------------------------------------

    pub fn set_preview_surface(&self, surface: Option<Arc<dyn PreviewSurface>>) {
        let preview = Arc::clone(&self.registry().preview);
        *preview.lock().unwrap_or_else(|e| e.into_inner()) = surface;
    }

    pub fn set_primary_sink(&self, sink: Option<Arc<dyn VideoSink>>) {
        self.registry().primary_sink = sink;
    }

    pub fn set_webcam_sink(&self, sink: Option<Arc<dyn VideoSink>>) {
        self.registry().webcam_sink = sink;
    }

    pub fn set_capture_target(&self, target: Option<Arc<dyn CaptureTarget>>) {
        self.registry().capture_target = target;
    }

    // ---- callbacks ----------------------------------------------------

    fn with_callbacks(&self, update: impl FnOnce(&mut Callbacks)) {
        update(&mut self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner()));
    }

    pub fn on_start(&self, f: impl Fn() + Send + Sync + 'static) {
        self.with_callbacks(|c| c.on_start = Some(Arc::new(f)));
    }

    pub fn on_end(&self, f: impl Fn() + Send + Sync + 'static) {
        self.with_callbacks(|c| c.on_end = Some(Arc::new(f)));
    }

    pub fn on_pause(&self, f: impl Fn() + Send + Sync + 'static) {
        self.with_callbacks(|c| c.on_pause = Some(Arc::new(f)));
    }

    pub fn on_resume(&self, f: impl Fn() + Send + Sync + 'static) {
        self.with_callbacks(|c| c.on_resume = Some(Arc::new(f)));
    }

    pub fn on_error(&self, f: impl Fn(&RecorderError) + Send + Sync + 'static) {
        self.with_callbacks(|c| c.on_error = Some(Arc::new(f)));
    }

    pub fn on_artifact_ready(&self, f: impl Fn(&Arc<Artifact>) + Send + Sync + 'static) {
        self.with_callbacks(|c| c.on_artifact_ready = Some(Arc::new(f)));
    }

    fn emit_error(&self, err: &RecorderError) {
        if let Some(cb) = self.callbacks().on_error {
            cb(err);
        }
    }

    // ---- configuration ------------------------------------------------

    pub fn settings(&self) -> Arc<Settings> {
        self.inner.settings.load()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Merges `patch` over the current settings and swaps in the result.
    /// A running session picks up webcam layout changes on its next frame.
    pub fn update_settings(&self, patch: &SettingsPatch) -> Result<Arc<Settings>> {
        let merged = self.inner.settings.load().merged(patch);
        merged.validate()?;
        let stored = self.inner.settings.store(merged);
        self.notify();
        Ok(stored)
    }

    pub fn set_webcam_position(&self, position: WebcamPosition) -> Result<Arc<Settings>> {
        self.update_settings(&SettingsPatch {
            webcam_position: Some(position),
            ..Default::default()
        })
    }

    pub fn set_webcam_size(&self, size: WebcamSize) -> Result<Arc<Settings>> {
        self.update_settings(&SettingsPatch {
            webcam_size: Some(size),
            ..Default::default()
        })
    }

    pub fn cycle_webcam_position(&self) -> Result<Arc<Settings>> {
        self.set_webcam_position(self.settings().webcam_position.next())
    }

    pub fn cycle_webcam_size(&self) -> Result<Arc<Settings>> {
        self.set_webcam_size(self.settings().webcam_size.next())
    }

    pub fn toggle_webcam_shape(&self) -> Result<Arc<Settings>> {
        self.update_settings(&SettingsPatch {
            webcam_shape: Some(self.settings().webcam_shape.toggled()),
            ..Default::default()
        })
    }

    // ---- lifecycle ----------------------------------------------------

    /// Acquires sources, runs the countdown and begins recording.
    ///
    /// Only valid from `Idle`. On failure everything acquired so far is
    /// released, `on_error` fires and the engine is back to `Idle`. A
    /// `cancel()` or `reset()` while this is pending makes it return
    /// [`RecorderError::Cancelled`].
    pub async fn start(&self) -> Result<()> {
        let generation = {
            let mut state = self.state();
            if state.phase != Phase::Idle {
                return Err(RecorderError::InvalidState {
                    action: "start",
                    phase: state.phase,
                });
            }
            state.generation += 1;
            state.phase = Phase::Starting;
            state.session_id = Some(Uuid::new_v4());
            state.artifact = None;
            state.preview_ready = false;
            state.generation
        };
        self.notify();

        match self.run_start(generation).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail_start(generation, e)),
        }
    }

    async fn run_start(&self, generation: u64) -> Result<()> {
        let settings = self.inner.settings.load();
        settings.validate()?;
        let target = self.registry().capture_target.clone();

        let primary = self.inner.sources.acquire_primary(&settings, target).await?;
        self.hold(generation, |sources| sources.primary = Some(primary.clone()))?;

        let webcam = self.inner.sources.acquire_webcam(&settings).await;
        if let Some(webcam) = &webcam {
            self.hold(generation, |sources| sources.webcam = Some(Arc::clone(webcam)))?;
        }

        {
            let registry = self.registry();
            if let Some(sink) = &registry.primary_sink {
                sink.attach(primary.video().cloned());
            }
            if let Some(sink) = &registry.webcam_sink {
                sink.attach(webcam.clone());
            }
        }

        let (width, height) = match &primary {
            PrimarySource::Workspace(target) => surface_size_for_target(target.bounding_box()),
            PrimarySource::Stream(video) => surface_size_for_track(video.track_settings()),
        };
        self.inner
            .annotations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(width, height);
        self.inner
            .compositor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ensure_size(width, height);
        debug!(width, height, "master surface sized");

        let mime_type = select_mime(self.inner.backend.as_ref())?;

        if settings.countdown_duration > 0 {
            self.run_countdown(generation, settings.countdown_duration)
                .await?;
        }

        self.begin_recording(generation, &settings, mime_type)
    }

    /// Stores an acquired source unless the attempt was cancelled, in
    /// which case the source is released on the spot.
    fn hold(&self, generation: u64, store: impl FnOnce(&mut HeldSources)) -> Result<()> {
        let mut state = self.state();
        let mut fresh = HeldSources::default();
        if state.generation != generation {
            store(&mut fresh);
            fresh.release_all();
            return Err(RecorderError::Cancelled);
        }
        store(&mut state.sources);
        Ok(())
    }

    async fn run_countdown(&self, generation: u64, seconds: u32) -> Result<()> {
        {
            let mut state = self.state();
            if state.generation != generation {
                return Err(RecorderError::Cancelled);
            }
            state.phase = Phase::Countdown;
            state.countdown = seconds;
        }
        self.notify();

        for remaining in (0..seconds).rev() {
            time::sleep(TICK).await;
            {
                let mut state = self.state();
                if state.generation != generation {
                    return Err(RecorderError::Cancelled);
                }
                state.countdown = remaining;
            }
            self.notify();
        }
        Ok(())
    }

    fn begin_recording(&self, generation: u64, settings: &Settings, mime_type: &str) -> Result<()> {
        let inner = &self.inner;
        let mut state = self.state();
        if state.generation != generation {
            return Err(RecorderError::Cancelled);
        }

        let primary = state.sources.primary.clone().ok_or(RecorderError::NoStream)?;
        if primary.video().is_some_and(|v| !v.is_live()) {
            return Err(RecorderError::NoStream);
        }
        let (width, height) = inner
            .compositor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .size();

        inner.chunks.clear();
        let config = EncoderConfig {
            mime_type: mime_type.to_string(),
            width,
            height,
            fps: inner.options.stream_fps,
            bitrate: settings.quality.bitrate(),
            has_audio: primary.video().is_some_and(|v| v.has_audio()),
        };
        let bridge = Arc::new(RecorderBridge::start(
            inner.backend.as_ref(),
            config,
            Arc::clone(&inner.chunks),
        )?);

        let stats = Arc::new(LoopStats::default());
        let preview = Arc::clone(&self.registry().preview);
        let webcam = state.sources.webcam.clone();
        let paused = Arc::clone(&state.paused);
        paused.store(false, Ordering::SeqCst);

        let capture = LoopHandle::spawn(&inner.runtime, "capture", |alive| {
            let ctx = CompositeContext {
                compositor: Arc::clone(&inner.compositor),
                annotations: Arc::clone(&inner.annotations),
                settings: Arc::clone(&inner.settings),
                webcam,
                alive,
                stats: Arc::clone(&stats),
            };
            let options = inner.options.clone();
            async move {
                match primary {
                    PrimarySource::Stream(video) => {
                        compositor::run_live_capture(ctx, video, options.live_fps).await
                    }
                    PrimarySource::Workspace(target) => {
                        compositor::run_dom_capture(ctx, target, paused, options.dom_capture_fps)
                            .await
                    }
                }
            }
        });
        let preview_loop = LoopHandle::spawn(&inner.runtime, "preview", |alive| {
            compositor::run_preview(
                Arc::clone(&inner.compositor),
                preview,
                alive,
                Arc::clone(&stats),
                inner.options.preview_fps,
            )
        });
        let pump = LoopHandle::spawn(&inner.runtime, "recorder", |alive| {
            recording::run_recorder_pump(
                Arc::clone(&bridge),
                Arc::clone(&inner.compositor),
                alive,
                inner.options.stream_fps,
                inner.options.timeslice(),
            )
        });
        let consolidator = Arc::new(Consolidator::new(
            Arc::clone(&inner.chunks),
            Arc::clone(&inner.merger),
            inner.options.cleanup_threshold,
            inner.options.cleanup_keep_recent,
        ));
        let sweep = LoopHandle::spawn(&inner.runtime, "consolidation", |alive| {
            consolidator.run_sweep(alive, inner.options.cleanup_interval())
        });

        state.loops = vec![capture, preview_loop, pump];
        state.sweep = Some(sweep);
        state.bridge = Some(bridge);
        state.stats = Some(stats);
        state.phase = Phase::Recording;
        state.countdown = 0;
        state.recording_time = 0;
        state.events.clear();
        state.started_at = Some(Utc::now());
        state.started_instant = Some(Instant::now());
        state.timer = Some(self.spawn_timer(generation));
        let session = state.session_id.unwrap_or_default();
        drop(state);

        info!(session = %session, source = settings.selected_source.display_name(), mime = mime_type, "recording started");
        self.notify();
        if let Some(cb) = self.callbacks().on_start {
            cb();
        }
        Ok(())
    }

    fn fail_start(&self, generation: u64, err: RecorderError) -> RecorderError {
        if !self.is_current(generation) {
            debug!("start aborted by cancel");
            return RecorderError::Cancelled;
        }
        error!(error = %err, "failed to start recording");
        self.teardown_session();
        self.emit_error(&err);
        err
    }

    /// Elapsed-time counter; the first increment lands one second after
    /// it is spawned.
    fn spawn_timer(&self, generation: u64) -> LoopHandle {
        let weak = self.weak();
        LoopHandle::spawn(&self.inner.runtime, "elapsed", move |alive| async move {
            let mut ticker = time::interval_at(Instant::now() + TICK, TICK);
            loop {
                ticker.tick().await;
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let Some(engine) = Self::from_weak(&weak) else {
                    break;
                };
                let reached = {
                    let mut state = engine.state();
                    if state.generation != generation || state.phase != Phase::Recording {
                        break;
                    }
                    state.recording_time += 1;
                    state.recording_time >= engine.inner.settings.load().max_duration
                };
                engine.notify();
                if reached {
                    info!("maximum duration reached");
                    alive.store(false, Ordering::SeqCst);
                    if let Err(e) = engine.stop() {
                        warn!(error = %e, "auto-stop failed");
                    }
                    break;
                }
            }
        })
    }

    pub fn pause(&self) -> Result<()> {
        {
            let mut state = self.state();
            if state.phase != Phase::Recording {
                return Err(RecorderError::InvalidState {
                    action: "pause",
                    phase: state.phase,
                });
            }
            if let Some(bridge) = &state.bridge {
                bridge.pause();
            }
            state.paused.store(true, Ordering::SeqCst);
            state.kill_timer();
            state.phase = Phase::Paused;
        }
        debug!("recording paused");
        self.notify();
        if let Some(cb) = self.callbacks().on_pause {
            cb();
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        {
            let mut state = self.state();
            if state.phase != Phase::Paused {
                return Err(RecorderError::InvalidState {
                    action: "resume",
                    phase: state.phase,
                });
            }
            if let Some(bridge) = &state.bridge {
                bridge.resume();
            }
            state.paused.store(false, Ordering::SeqCst);
            state.phase = Phase::Recording;
            let generation = state.generation;
            state.timer = Some(self.spawn_timer(generation));
        }
        debug!("recording resumed");
        self.notify();
        if let Some(cb) = self.callbacks().on_resume {
            cb();
        }
        Ok(())
    }

    pub fn toggle_pause(&self) -> Result<()> {
        match self.phase() {
            Phase::Paused => self.resume(),
            _ => self.pause(),
        }
    }

    /// Ends the session. The phase flips to `Stopped` and `on_end` fires
    /// before this returns; the artifact follows through
    /// `on_artifact_ready` once post-processing completes.
    pub fn stop(&self) -> Result<()> {
        let generation = {
            let mut state = self.state();
            if !matches!(state.phase, Phase::Recording | Phase::Paused) {
                return Err(RecorderError::InvalidState {
                    action: "stop",
                    phase: state.phase,
                });
            }
            state.phase = Phase::Stopped;
            state.processing = true;
            state.kill_timer();
            state.paused.store(false, Ordering::SeqCst);
            state.generation
        };
        info!(recording_time = self.recording_time(), "recording stopped");
        self.notify();
        if let Some(cb) = self.callbacks().on_end {
            cb();
        }

        let engine = self.clone();
        let task = self
            .inner
            .runtime
            .spawn(async move { engine.finalize(generation).await });
        let mut state = self.state();
        if state.generation == generation {
            state.finalize = Some(task);
        } else {
            task.abort();
        }
        Ok(())
    }

    async fn finalize(&self, generation: u64) {
        let (loops, sweep, bridge, session_id, recorded_at) = {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            (
                std::mem::take(&mut state.loops),
                state.sweep.take(),
                state.bridge.take(),
                state.session_id.unwrap_or_default(),
                state.started_at.unwrap_or_else(Utc::now),
            )
        };

        for handle in loops {
            handle.kill();
        }
        // An in-flight round must finish before the sweep goes away; the
        // guard also covers this task being aborted while it waits.
        let sweep = SweepGuard(sweep);
        sweep.stop_ticking();
        self.inner.chunks.settled().await;
        drop(sweep);

        let mut mime_type = String::new();
        if let Some(bridge) = bridge {
            mime_type = bridge.mime_type().to_string();
            if let Err(e) = bridge.finish().await {
                warn!(session = %session_id, error = %e, "encoder did not finish cleanly");
            }
        }

        {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.sources.release_all();
        }
        self.detach_sinks();

        let blob = self.inner.chunks.assemble();
        if blob.is_empty() {
            {
                let mut state = self.state();
                if state.generation != generation {
                    return;
                }
                state.processing = false;
            }
            warn!(session = %session_id, "recording produced no data");
            self.notify();
            self.emit_error(&RecorderError::EmptyRecording);
            return;
        }

        let output = RecordingOutput {
            session_id,
            recorded_at,
            mime_type,
            blob,
        };
        let inspector = Arc::clone(&self.inner.inspector);
        let thumbnail_size = self.inner.options.thumbnail_size();
        let processed = tokio::task::spawn_blocking(move || {
            process_recording(output, inspector.as_ref(), thumbnail_size)
        })
        .await;

        let artifact = match processed {
            Ok(artifact) => Arc::new(artifact),
            Err(e) => {
                {
                    let mut state = self.state();
                    if state.generation != generation {
                        return;
                    }
                    state.processing = false;
                }
                let err = RecorderError::Runtime(format!("post-processing failed: {}", e));
                error!(session = %session_id, error = %err, "post-processing failed");
                self.notify();
                self.emit_error(&err);
                return;
            }
        };

        {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.processing = false;
            state.preview_ready = true;
            state.artifact = Some(Arc::clone(&artifact));
            state.finalize = None;
        }
        self.notify();
        if let Some(cb) = self.callbacks().on_artifact_ready {
            cb(&artifact);
        }
    }

    /// Abandons the session: encoder output is dropped and no artifact is
    /// produced.
    pub fn cancel(&self) {
        if let Some(bridge) = self.state().bridge.take() {
            bridge.discard();
        }
        info!("recording cancelled");
        self.reset();
    }

    /// Returns to a pristine `Idle`. Safe to call in any phase, any number
    /// of times.
    pub fn reset(&self) {
        self.teardown_session();
        self.state().artifact = None;
        self.inner
            .annotations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inner
            .compositor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.notify();
    }

    fn teardown_session(&self) {
        {
            let mut state = self.state();
            state.generation += 1;
            state.teardown();
            state.phase = Phase::Idle;
            state.countdown = 0;
            state.recording_time = 0;
            state.processing = false;
            state.preview_ready = false;
            state.session_id = None;
            state.started_at = None;
            state.started_instant = None;
            state.stats = None;
            state.events.clear();
        }
        self.inner.chunks.clear();
        self.detach_sinks();
        self.notify();
    }

    fn detach_sinks(&self) {
        let registry = self.registry();
        if let Some(sink) = &registry.primary_sink {
            sink.attach(None);
        }
        if let Some(sink) = &registry.webcam_sink {
            sink.attach(None);
        }
    }

    // ---- annotation ---------------------------------------------------

    fn annotations(&self) -> MutexGuard<'_, AnnotationLayer> {
        self.inner.annotations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Display coordinates to annotation raster coordinates, through the
    /// registered preview's rendered rectangle.
    fn map_pointer(&self, pos: Point) -> Point {
        let preview = self.registry().preview.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let (width, height) = self.annotations().size();
        match preview {
            Some(surface) => to_raster(pos, surface.client_rect(), width, height),
            None => pos,
        }
    }

    pub fn set_tool(&self, tool: AnnotationTool) {
        self.annotations().set_tool(tool);
    }

    pub fn pointer_down(&self, pos: Point) {
        let pos = self.map_pointer(pos);
        self.annotations().pointer_down(pos);
    }

    pub fn pointer_move(&self, pos: Point) {
        let pos = self.map_pointer(pos);
        self.annotations().pointer_move(pos);
    }

    pub fn pointer_up(&self) {
        self.annotations().pointer_up();
    }

    pub fn undo(&self) -> bool {
        self.annotations().undo()
    }

    pub fn redo(&self) -> bool {
        self.annotations().redo()
    }

    pub fn clear_annotations(&self) {
        self.annotations().clear();
    }

    pub fn annotation_history(&self) -> (isize, usize) {
        let layer = self.annotations();
        (layer.history_index(), layer.history_len())
    }

    // ---- timeline -----------------------------------------------------

    /// Records a timeline event. Ignored unless a recording is running.
    pub fn add_event(&self, kind: &str, data: serde_json::Value) -> bool {
        let mut state = self.state();
        if !matches!(state.phase, Phase::Recording | Phase::Paused) {
            return false;
        }
        let time_ms = state
            .started_instant
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        state.events.push(TimelineEvent {
            kind: kind.to_string(),
            time_ms,
            data,
        });
        true
    }

    pub fn recording_events(&self) -> Vec<TimelineEvent> {
        self.state().events.clone()
    }

    // ---- queries ------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.state().snapshot()
    }

    /// Receives a fresh [`EngineSnapshot`] on every state change.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.inner.watch.subscribe()
    }

    pub fn recording_time(&self) -> u32 {
        self.state().recording_time
    }

    pub fn formatted_time(&self) -> String {
        format_time(self.recording_time())
    }

    pub fn countdown(&self) -> u32 {
        self.state().countdown
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.state().session_id
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().started_at
    }

    pub fn primary_stream(&self) -> Option<Arc<DecodedVideo>> {
        self.state().sources.primary_video().cloned()
    }

    pub fn webcam_stream(&self) -> Option<Arc<DecodedVideo>> {
        self.state().sources.webcam.clone()
    }

    pub fn has_active_session(&self) -> bool {
        let state = self.state();
        !state.sources.is_empty()
            || matches!(
                state.phase,
                Phase::Starting | Phase::Countdown | Phase::Recording | Phase::Paused
            )
    }

    pub fn encoder_state(&self) -> EncoderState {
        self.state()
            .bridge
            .as_ref()
            .map(|b| b.state())
            .unwrap_or_default()
    }

    pub fn mime_type(&self) -> Option<String> {
        self.state().bridge.as_ref().map(|b| b.mime_type().to_string())
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.chunks.len()
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.inner.chunks.chunks()
    }

    pub fn artifact(&self) -> Option<Arc<Artifact>> {
        self.state().artifact.clone()
    }

    pub fn loop_stats(&self) -> Option<Arc<LoopStats>> {
        self.state().stats.clone()
    }

    /// Loops and timers of the current session still running.
    pub fn active_loops(&self) -> usize {
        let state = self.state();
        state.loops.iter().filter(|l| l.is_alive()).count()
            + state.sweep.iter().filter(|l| l.is_alive()).count()
            + state.timer.iter().filter(|l| l.is_alive()).count()
    }

    /// Copy of the master surface.
    pub fn surface(&self) -> image::RgbaImage {
        self.inner
            .compositor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .surface()
            .clone()
    }
}

impl fmt::Debug for RecordingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingEngine")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
