use super::*;
use crate::recording::{GifEncoderBackend, GifInspector, GIF_MIME};
use crate::settings::{SourceKind, WebcamPosition};
use crate::testing::{CountingBackend, FakeDevices, FakePreview, FakeSink, RecordingTarget};
use tokio::sync::mpsc;

type Log = Arc<Mutex<Vec<String>>>;

fn quick_options() -> EngineOptions {
    EngineOptions {
        stream_fps: 10,
        dom_capture_fps: 5,
        live_fps: 10,
        preview_fps: 10,
        ..Default::default()
    }
}

fn settings(source: SourceKind) -> Settings {
    Settings {
        selected_source: source,
        countdown_duration: 0,
        ..Default::default()
    }
}

fn engine(devices: FakeDevices, settings: Settings) -> RecordingEngine {
    RecordingEngine::builder(
        Arc::new(devices),
        Arc::new(CountingBackend::new(&["video/webm"])),
        Arc::new(GifInspector),
    )
    .options(quick_options())
    .settings(settings)
    .build()
    .unwrap()
}

fn workspace_engine(countdown: u32) -> RecordingEngine {
    let engine = engine(
        FakeDevices::new(),
        Settings {
            countdown_duration: countdown,
            ..settings(SourceKind::Workspace)
        },
    );
    engine.set_capture_target(Some(Arc::new(RecordingTarget::new(1280.0, 720.0))));
    engine
}

fn record_callbacks(engine: &RecordingEngine) -> Log {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    engine.on_start(move || l.lock().unwrap().push("start".to_string()));
    let l = Arc::clone(&log);
    engine.on_end(move || l.lock().unwrap().push("end".to_string()));
    let l = Arc::clone(&log);
    engine.on_pause(move || l.lock().unwrap().push("pause".to_string()));
    let l = Arc::clone(&log);
    engine.on_resume(move || l.lock().unwrap().push("resume".to_string()));
    let l = Arc::clone(&log);
    engine.on_error(move |e| l.lock().unwrap().push(format!("error: {}", e)));
    log
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn artifacts(engine: &RecordingEngine) -> mpsc::UnboundedReceiver<Arc<Artifact>> {
    let (tx, rx) = mpsc::unbounded_channel();
    engine.on_artifact_ready(move |artifact| {
        let _ = tx.send(Arc::clone(artifact));
    });
    rx
}

#[tokio::test(start_paused = true)]
async fn test_session_stops_itself_at_max_duration() {
    let engine = RecordingEngine::builder(
        Arc::new(FakeDevices::new()),
        Arc::new(GifEncoderBackend::new()),
        Arc::new(GifInspector),
    )
    .options(quick_options())
    .settings(Settings {
        max_duration: 5,
        ..settings(SourceKind::Screen)
    })
    .build()
    .unwrap();
    let log = record_callbacks(&engine);
    let mut ready = artifacts(&engine);

    engine.start().await.unwrap();
    assert_eq!(engine.phase(), Phase::Recording);
    assert_eq!(engine.mime_type().as_deref(), Some(GIF_MIME));

    let artifact = ready.recv().await.unwrap();
    assert_eq!(engine.phase(), Phase::Stopped);
    assert_eq!(engine.recording_time(), 5);
    assert!(!artifact.blob.is_empty());
    assert_eq!(artifact.mime_type, GIF_MIME);
    assert!(artifact.thumbnail.is_some());
    assert_eq!(entries(&log), vec!["start", "end"]);

    let snapshot = engine.snapshot();
    assert!(!snapshot.processing);
    assert!(snapshot.preview_ready);
    assert!(engine.primary_stream().is_none());
    assert_eq!(engine.active_loops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_calls_outside_their_phase_fail() {
    let engine = workspace_engine(0);
    let log = record_callbacks(&engine);

    assert!(matches!(engine.pause(), Err(RecorderError::InvalidState { .. })));
    assert!(matches!(engine.stop(), Err(RecorderError::InvalidState { .. })));

    engine.start().await.unwrap();
    assert!(matches!(
        engine.start().await,
        Err(RecorderError::InvalidState { action: "start", phase: Phase::Recording })
    ));
    assert!(engine.resume().is_err());
    assert_eq!(engine.phase(), Phase::Recording);

    engine.pause().unwrap();
    assert!(engine.pause().is_err());
    assert!(engine.start().await.is_err());
    engine.resume().unwrap();

    assert_eq!(entries(&log), vec!["start", "pause", "resume"]);
    engine.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_start_during_countdown_is_rejected() {
    let engine = workspace_engine(3);
    let pending = tokio::spawn({
        let engine = engine.clone();
        async move { engine.start().await }
    });

    time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(engine.phase(), Phase::Countdown);
    assert_eq!(engine.countdown(), 2);
    assert!(engine.start().await.is_err());

    pending.await.unwrap().unwrap();
    assert_eq!(engine.phase(), Phase::Recording);
    assert_eq!(engine.countdown(), 0);
    engine.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_countdown_aborts_start() {
    let engine = workspace_engine(3);
    let log = record_callbacks(&engine);
    let pending = tokio::spawn({
        let engine = engine.clone();
        async move { engine.start().await }
    });

    time::sleep(Duration::from_millis(1500)).await;
    engine.cancel();

    assert!(matches!(pending.await.unwrap(), Err(RecorderError::Cancelled)));
    assert_eq!(engine.phase(), Phase::Idle);
    assert!(!engine.has_active_session());
    assert!(entries(&log).is_empty());

    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.phase(), Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_releases_streams_and_stops_loops() {
    let devices = FakeDevices::new();
    let display_stopped = devices.display_stopped();
    let camera_stopped = devices.camera_stopped();
    let engine = engine(
        devices,
        Settings {
            include_webcam: true,
            ..settings(SourceKind::Screen)
        },
    );
    let sink = Arc::new(FakeSink::default());
    let webcam_sink = Arc::new(FakeSink::default());
    engine.set_primary_sink(Some(sink.clone()));
    engine.set_webcam_sink(Some(webcam_sink.clone()));

    engine.start().await.unwrap();
    assert!(engine.snapshot().has_webcam);
    assert!(sink.is_attached());
    assert!(webcam_sink.is_attached());
    time::sleep(Duration::from_millis(500)).await;

    let stats = engine.loop_stats().unwrap();
    assert!(stats.composited() > 0);
    assert!(engine.active_loops() > 0);

    engine.cancel();
    assert!(engine.primary_stream().is_none());
    assert!(engine.webcam_stream().is_none());
    assert!(display_stopped.load(Ordering::SeqCst));
    assert!(camera_stopped.load(Ordering::SeqCst));
    assert_eq!(engine.active_loops(), 0);
    assert!(!sink.is_attached());
    assert!(!webcam_sink.is_attached());
    assert_eq!(engine.chunk_count(), 0);

    let frozen = stats.composited();
    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(stats.composited(), frozen);

    engine.reset();
    engine.reset();
    assert_eq!(engine.phase(), Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_denied_webcam_is_not_an_error() {
    let engine = engine(
        FakeDevices::new().deny_camera(),
        Settings {
            include_webcam: true,
            ..settings(SourceKind::Screen)
        },
    );
    let log = record_callbacks(&engine);

    engine.start().await.unwrap();
    assert_eq!(engine.phase(), Phase::Recording);
    assert!(engine.webcam_stream().is_none());
    assert!(!engine.snapshot().has_webcam);
    assert_eq!(entries(&log), vec!["start"]);
    engine.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_workspace_without_target_fails_back_to_idle() {
    let engine = engine(FakeDevices::new(), settings(SourceKind::Workspace));
    let log = record_callbacks(&engine);

    let result = engine.start().await;
    assert!(matches!(result, Err(RecorderError::NoCaptureTarget)));
    assert_eq!(engine.phase(), Phase::Idle);
    assert!(!engine.has_active_session());
    assert_eq!(entries(&log).len(), 1);
    assert!(entries(&log)[0].starts_with("error: No capture target"));
}

#[tokio::test(start_paused = true)]
async fn test_denied_screen_reports_permission_error() {
    let engine = engine(FakeDevices::new().deny_display(), settings(SourceKind::Screen));
    let log = record_callbacks(&engine);

    assert!(matches!(
        engine.start().await,
        Err(RecorderError::PermissionDenied(_))
    ));
    assert_eq!(engine.phase(), Phase::Idle);
    assert_eq!(entries(&log), vec!["error: Permission denied for screen"]);
}

#[tokio::test(start_paused = true)]
async fn test_pause_freezes_recording_time() {
    let engine = workspace_engine(0);
    engine.start().await.unwrap();

    time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(engine.recording_time(), 2);

    engine.toggle_pause().unwrap();
    assert_eq!(engine.phase(), Phase::Paused);
    assert_eq!(engine.encoder_state(), EncoderState::Paused);
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.recording_time(), 2);

    engine.toggle_pause().unwrap();
    time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(engine.recording_time(), 3);
    assert_eq!(engine.formatted_time(), "00:03");
    engine.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_stop_fires_end_before_artifact() {
    let engine = workspace_engine(0);
    let log = record_callbacks(&engine);
    let mut ready = artifacts(&engine);

    engine.start().await.unwrap();
    time::sleep(Duration::from_millis(2500)).await;
    engine.stop().unwrap();

    assert_eq!(engine.phase(), Phase::Stopped);
    assert!(engine.snapshot().processing);
    assert_eq!(entries(&log), vec!["start", "end"]);
    assert!(engine.stop().is_err());

    let artifact = ready.recv().await.unwrap();
    assert!(!artifact.blob.is_empty());
    assert_eq!(artifact.mime_type, "video/webm");
    assert_eq!(engine.artifact().map(|a| a.session_id), Some(artifact.session_id));

    // A stopped engine has to be reset before the next session.
    assert!(engine.start().await.is_err());
    engine.reset();
    assert!(engine.artifact().is_none());
    engine.start().await.unwrap();
    assert_ne!(engine.session_id(), Some(artifact.session_id));
    engine.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_redo_after_new_stroke_is_a_no_op() {
    let engine = workspace_engine(0);
    engine.start().await.unwrap();

    let stroke = |from: (f32, f32), to: (f32, f32)| {
        engine.pointer_down(Point::new(from.0, from.1));
        engine.pointer_move(Point::new(to.0, to.1));
        engine.pointer_up();
    };

    stroke((10.0, 10.0), (200.0, 200.0));
    assert!(engine.undo());
    stroke((300.0, 50.0), (400.0, 90.0));
    assert!(!engine.redo());
    assert_eq!(engine.annotation_history(), (0, 1));

    engine.clear_annotations();
    assert_eq!(engine.annotation_history(), (-1, 0));
    engine.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_pointer_maps_through_preview_rect() {
    let engine = workspace_engine(0);
    let preview = Arc::new(FakePreview::new(640, 360));
    engine.set_preview_surface(Some(preview.clone()));
    engine.start().await.unwrap();

    time::sleep(Duration::from_millis(500)).await;
    assert!(preview.presented() > 0);
    assert_eq!(preview.size(), (1280, 720));

    // The preview now reports the surface size, so mapping is 1:1.
    assert_eq!(engine.map_pointer(Point::new(40.0, 30.0)), Point::new(40.0, 30.0));
    engine.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_events_only_recorded_while_recording() {
    let engine = workspace_engine(0);
    assert!(!engine.add_event("comment", serde_json::json!({ "line": 3 })));

    engine.start().await.unwrap();
    time::sleep(Duration::from_millis(1500)).await;
    assert!(engine.add_event("comment", serde_json::json!({ "line": 3 })));

    let events = engine.recording_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "comment");
    assert_eq!(events[0].time_ms, 1500);

    engine.cancel();
    assert!(engine.recording_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_webcam_controls_swap_settings() {
    let engine = workspace_engine(0);
    let mut updates = engine.subscribe();

    let before = engine.settings();
    let after = engine.cycle_webcam_position().unwrap();
    assert_eq!(after.webcam_position, before.webcam_position.next());
    assert_eq!(before.webcam_position, WebcamPosition::BottomRight);
    assert!(updates.has_changed().unwrap());
    assert_eq!(updates.borrow_and_update().phase, Phase::Idle);

    engine.toggle_webcam_shape().unwrap();
    assert_eq!(engine.settings().webcam_shape, before.webcam_shape.toggled());
    assert!(engine
        .update_settings(&SettingsPatch {
            max_duration: Some(0),
            ..Default::default()
        })
        .is_err());
    assert_eq!(engine.settings().max_duration, before.max_duration);
}

#[test]
fn test_format_time() {
    assert_eq!(format_time(0), "00:00");
    assert_eq!(format_time(65), "01:05");
    assert_eq!(format_time(3600), "60:00");
}

#[tokio::test(start_paused = true)]
async fn test_sweep_is_killed_when_finalize_is_aborted() {
    let held = Arc::new(());
    let in_sweep = Arc::clone(&held);
    let sweep = LoopHandle::spawn(&Handle::current(), "consolidation", move |_alive| async move {
        let _held = in_sweep;
        std::future::pending::<()>().await;
    });

    let finalize = tokio::spawn(async move {
        let guard = SweepGuard(Some(sweep));
        guard.stop_ticking();
        std::future::pending::<()>().await;
        drop(guard);
    });
    tokio::task::yield_now().await;
    assert_eq!(Arc::strong_count(&held), 2);

    finalize.abort();
    let _ = finalize.await;
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert_eq!(Arc::strong_count(&held), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_start_then_cancel_releases_sources() {
    let devices = FakeDevices::new();
    let display_stopped = devices.display_stopped();
    let engine = engine(
        devices,
        Settings {
            countdown_duration: 3,
            ..settings(SourceKind::Screen)
        },
    );

    tokio::select! {
        _ = engine.start() => panic!("countdown should still be running"),
        _ = time::sleep(Duration::from_millis(1500)) => {}
    }
    assert_eq!(engine.phase(), Phase::Countdown);

    engine.cancel();
    assert_eq!(engine.phase(), Phase::Idle);
    assert!(!engine.has_active_session());
    assert!(display_stopped.load(Ordering::SeqCst));
    assert_eq!(engine.active_loops(), 0);
}
