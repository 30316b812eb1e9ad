use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facewatch_core::{DistanceMetric, OnnxProvider};
use facewatch_hw::{Camera, MediaSource, StillImage};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod recognition;
mod render;

use config::Config;
use engine::{EngineError, EngineHandle};
use recognition::{MatchSettings, RecognitionLoop};
use render::{ConsoleOverlay, Overlays, PngOverlay};

#[derive(Parser)]
#[command(name = "facewatch", version, about = "Register a face, then recognize it live from a webcam")]
struct Cli {
    /// TOML config file (overrides FACEWATCH_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize registered faces; type a name + Enter to register the face in view
    Run(RunArgs),
    /// List V4L2 capture devices
    Devices,
}

#[derive(Args)]
struct RunArgs {
    /// Camera device (e.g. /dev/video0)
    #[arg(short, long)]
    device: Option<String>,
    /// Use a still image instead of the camera
    #[arg(long, conflicts_with = "device")]
    image: Option<PathBuf>,
    /// Directory holding det_10g.onnx and w600k_r50.onnx
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Match distance threshold
    #[arg(short, long)]
    threshold: Option<f32>,
    /// Distance metric: euclidean or cosine
    #[arg(long)]
    metric: Option<DistanceMetric>,
    /// Pause between recognition ticks, in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,
    /// Write the annotated frame to this PNG every tick
    #[arg(long)]
    overlay: Option<PathBuf>,
    /// Print one JSON line per tick instead of text on change
    #[arg(long)]
    json: bool,
    /// Register the face in the first frame under this name (repeatable)
    #[arg(short, long)]
    register: Vec<String>,
    /// Run a single recognition tick and exit
    #[arg(long)]
    once: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.camera_device = device.clone();
        }
        if let Some(dir) = &self.model_dir {
            config.model_dir = dir.clone();
        }
        if let Some(threshold) = self.threshold {
            config.match_threshold = threshold;
        }
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        if let Some(ms) = self.interval_ms {
            config.tick_interval_ms = ms;
        }
        if let Some(path) = &self.overlay {
            config.overlay_path = Some(path.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}\t{} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        Commands::Run(args) => {
            let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
            args.apply(&mut config);
            config.validate()?;
            run(config, args).await
        }
    }
}

/// Open the media source, load models, and assemble the recognition loop.
/// Runs on the engine thread.
fn build_loop(config: &Config, image: Option<PathBuf>, json: bool) -> Result<RecognitionLoop, EngineError> {
    let mut source: Box<dyn MediaSource> = match image {
        Some(path) => Box::new(StillImage::open(&path)?),
        None => {
            let mut camera = Camera::open(&config.camera_device, config.capture_width, config.capture_height)?;
            if config.warmup_frames > 0 {
                let failed = camera.discard_frames(config.warmup_frames);
                tracing::info!(count = config.warmup_frames, failed, "discarded warmup frames");
            }
            Box::new(camera)
        }
    };

    let ready = source.wait_ready(config.ready_attempts)?;
    tracing::info!(width = ready.width(), height = ready.height(), "video ready");

    let provider = OnnxProvider::load(&config.model_dir, config.detector_options())?;

    let mut overlays = Overlays::new();
    overlays.push(ConsoleOverlay::new(std::io::stdout(), json));
    if let Some(path) = &config.overlay_path {
        tracing::info!(path = %path.display(), "writing overlay PNG each tick");
        overlays.push(PngOverlay::new(path.clone(), config.display_size())?);
    }

    Ok(RecognitionLoop::new(
        source,
        Box::new(provider),
        Box::new(overlays),
        MatchSettings {
            threshold: config.match_threshold,
            metric: config.metric,
        },
    ))
}

async fn run(config: Config, args: RunArgs) -> Result<()> {
    tracing::info!(
        threshold = config.match_threshold,
        metric = ?config.metric,
        interval_ms = config.tick_interval_ms,
        "facewatch starting"
    );

    let interval = (!args.once).then(|| config.tick_interval());
    let image = args.image.clone();
    let json = args.json;
    let build_config = config.clone();
    let engine = engine::spawn_engine(move || build_loop(&build_config, image, json), interval)
        .await
        .context("starting recognition engine")?;

    for label in &args.register {
        register(&engine, label).await?;
    }

    if args.once {
        if engine.tick().await?.is_none() {
            println!("No faces registered; nothing to recognize");
        }
        return Ok(());
    }

    interactive(&engine).await
}

/// Reports the outcome to the user; only engine faults are returned as errors.
async fn register(engine: &EngineHandle, label: &str) -> Result<(), EngineError> {
    match engine.register(label).await {
        Ok(reg) => {
            println!("Registered face for {}!", reg.label);
            Ok(())
        }
        Err(e) if e.is_user_warning() => {
            eprintln!("{e}");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn interactive(engine: &EngineHandle) -> Result<()> {
    eprintln!("Type a name and press Enter to register the face in view (/status, /quit).");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "/quit" => break,
                    "/status" => {
                        let status = engine.status().await?;
                        println!("{}", serde_json::to_string_pretty(&status)?);
                    }
                    _ => {
                        if let Err(e) = register(engine, &line).await {
                            eprintln!("error: {e}");
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("facewatch shutting down");
    Ok(())
}
