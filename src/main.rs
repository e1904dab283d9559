use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reviewcap::capture::{self, NativeDevices};
use reviewcap::config::Config;
use reviewcap::recording::{GifEncoderBackend, GifInspector};
use reviewcap::settings::{Quality, SettingsPatch, SourceKind};
use reviewcap::upload::ArtifactUploader;
use reviewcap::{format_time, Artifact, RecorderError, RecordingEngine};

#[derive(Parser)]
#[command(name = "reviewcap", version, about = "Record a screen walkthrough for a code review")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record the screen or a window into the output directory.
    Record(RecordArgs),
    /// Show or initialise the configuration file.
    Config {
        /// Write the default configuration, replacing any existing file.
        #[arg(long)]
        init: bool,
    },
    /// List monitors and windows that can be recorded.
    Sources,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    Screen,
    Window,
}

#[derive(Clone, Copy, ValueEnum)]
enum QualityArg {
    Low,
    Medium,
    High,
}

#[derive(clap::Args)]
struct RecordArgs {
    #[arg(long, value_enum, default_value = "screen")]
    source: SourceArg,
    /// Monitor or window id from `reviewcap sources`.
    #[arg(long)]
    id: Option<u32>,
    /// Stop after this many seconds. Without it, recording runs until
    /// Ctrl-C or the configured maximum duration.
    #[arg(long)]
    seconds: Option<u64>,
    #[arg(long)]
    countdown: Option<u32>,
    #[arg(long, value_enum)]
    quality: Option<QualityArg>,
    /// Overlay a camera picture-in-picture when a camera is available.
    #[arg(long)]
    webcam: bool,
    /// Upload the recording to the configured endpoint for this review.
    #[arg(long)]
    review: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Record(args) => record(args).await,
        Command::Config { init } => show_config(init),
        Command::Sources => list_sources(),
    }
}

fn show_config(init: bool) -> Result<()> {
    let path = Config::config_path().ok_or_else(|| anyhow!("no config directory available"))?;
    if init {
        Config::default().save()?;
        println!("wrote defaults to {}", path.display());
    } else {
        let config = Config::load()?;
        println!("# {}", path.display());
        print!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

fn list_sources() -> Result<()> {
    println!("Monitors:");
    for monitor in capture::list_monitors()? {
        let primary = if monitor.is_primary { " (primary)" } else { "" };
        println!(
            "  {:>10}  {}x{}  {}{}",
            monitor.id, monitor.width, monitor.height, monitor.name, primary
        );
    }
    println!("Windows:");
    for window in capture::list_windows()? {
        println!(
            "  {:>10}  {}x{}  {} - {}",
            window.id, window.width, window.height, window.app_name, window.title
        );
    }
    Ok(())
}

async fn record(args: RecordArgs) -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    config.ensure_output_dir()?;

    let mut devices = NativeDevices::new();
    let source = match args.source {
        SourceArg::Screen => {
            if let Some(id) = args.id {
                devices = devices.with_monitor(id);
            }
            SourceKind::Screen
        }
        SourceArg::Window => {
            let id = args
                .id
                .ok_or_else(|| anyhow!("--id is required for window capture"))?;
            devices = devices.with_window(id);
            SourceKind::Window
        }
    };

    let settings = config.recording.merged(&SettingsPatch {
        selected_source: Some(source),
        include_webcam: Some(args.webcam),
        countdown_duration: args.countdown,
        quality: args.quality.map(|q| match q {
            QualityArg::Low => Quality::Low,
            QualityArg::Medium => Quality::Medium,
            QualityArg::High => Quality::High,
        }),
        ..Default::default()
    });

    let engine = RecordingEngine::builder(
        Arc::new(devices),
        Arc::new(GifEncoderBackend::new()),
        Arc::new(GifInspector),
    )
    .options(config.engine.clone())
    .settings(settings)
    .build()?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<std::result::Result<Arc<Artifact>, String>>();
    let tx = done_tx.clone();
    engine.on_artifact_ready(move |artifact| {
        let _ = tx.send(Ok(Arc::clone(artifact)));
    });
    engine.on_error(move |e: &RecorderError| {
        let _ = done_tx.send(Err(e.to_string()));
    });
    engine.on_start(|| info!("recording, press Ctrl-C to stop"));

    tokio::select! {
        started = engine.start() => started?,
        _ = tokio::signal::ctrl_c() => {
            engine.cancel();
            info!("interrupted before recording began");
            return Ok(());
        }
    }

    let mut updates = engine.subscribe();
    let limit = args.seconds.map(Duration::from_secs);
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if !snapshot.is_recording() {
                    break;
                }
            }
        }
    }

    if engine.snapshot().is_recording() {
        engine.stop()?;
    }
    info!(elapsed = %format_time(engine.recording_time()), "finishing recording");

    let artifact = match done_rx.recv().await {
        Some(Ok(artifact)) => artifact,
        Some(Err(reason)) => return Err(anyhow!(reason)),
        None => return Err(anyhow!("engine shut down before the recording was ready")),
    };

    let path = config.output_path(&artifact.mime_type);
    fs::write(&path, &artifact.blob).with_context(|| format!("failed to write {}", path.display()))?;
    println!("{}", path.display());

    if config.output.save_thumbnail {
        if let Some(thumbnail) = &artifact.thumbnail {
            let thumb_path = path.with_extension("jpg");
            if let Err(e) = fs::write(&thumb_path, thumbnail) {
                warn!(error = %e, "failed to write thumbnail");
            }
        }
    }

    if let Some(review_id) = args.review {
        let upload_config = config.upload.clone();
        let uploaded = tokio::task::spawn_blocking(move || {
            ArtifactUploader::new(upload_config)?.upload(&artifact, &review_id)
        })
        .await??;
        println!("{}", uploaded.url);
    }

    engine.reset();
    Ok(())
}
