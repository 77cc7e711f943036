use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use pillvision::capture::{CaptureOrchestrator, Esp32Cam, FileSource};
use pillvision::config::{Config, LoggingConfig};
use pillvision::detection::DetectionAdapter;
use pillvision::ensemble::EnsembleAggregator;
use pillvision::error::Error;
use pillvision::history::SqliteHistory;
use pillvision::link::{self, ResultDispatcher};
use pillvision::models::{FusedDetection, TriggerSource};
use pillvision::service;
use pillvision::session::SessionPipeline;

#[derive(Parser)]
#[command(name = "pillvision")]
#[command(about = "Pill detection for a dispenser: ESP32-CAM capture, ensemble detection, serial reporting")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", default_value = "pillvision.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for controller triggers and run a detection session for each
    Run,
    /// Run one detection session over image files instead of the camera
    Detect {
        #[arg(value_name = "IMAGE", required = true)]
        images: Vec<PathBuf>,
    },
    /// Capture from the camera and print the ensemble result
    Capture,
    /// Grab a single frame from the camera
    CameraTest {
        /// Save the frame here
        #[arg(long, value_name = "FILE")]
        save: Option<PathBuf>,
    },
    /// Send a command to the controller and print its reply
    LinkTest {
        #[arg(long, default_value = "status")]
        command: String,
    },
    /// Show camera, model and history status
    Status,
    /// Print recent sessions from the history database
    History {
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "pillvision=debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = Config::load(Some(args.config.as_path()))?;
    init_logging(&config.logging, args.verbose)?;

    match args.command {
        Command::Run => run(&config).await,
        Command::Detect { images } => detect(&config, images).await,
        Command::Capture => capture(&config).await,
        Command::CameraTest { save } => camera_test(&config, save).await,
        Command::LinkTest { command } => link_test(&config, command).await,
        Command::Status => status(&config).await,
        Command::History { limit } => history(&config, limit).await,
    }
}

async fn connect_camera(config: &Config) -> anyhow::Result<Esp32Cam> {
    let mut camera = Esp32Cam::new(&config.camera.esp32cam_ip, tokio::runtime::Handle::current());
    if !camera.test_connection().await {
        return Err(Error::Configuration(format!(
            "ESP32-CAM not reachable at {}",
            config.camera.esp32cam_ip
        ))
        .into());
    }
    Ok(camera)
}

async fn run(config: &Config) -> anyhow::Result<()> {
    info!("Initializing pill detection service");
    let adapter = DetectionAdapter::from_config(&config.model)?;
    let camera = connect_camera(config).await?;

    let link_config = config.link.clone();
    let (listener, dispatcher) = tokio::task::spawn_blocking(move || link::open_serial(&link_config)).await??;
    let history = SqliteHistory::open(&config.database.path).await?;

    let capture = CaptureOrchestrator::from_config(camera, &config.camera, &config.capture);
    let mut pipeline = SessionPipeline::new(
        capture,
        adapter,
        EnsembleAggregator::from_config(&config.ensemble),
        dispatcher,
        history.clone(),
    )
    .with_capture_plan(config.capture.num_images, config.camera.capture_delay());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    service::run_triggered(&mut pipeline, listener, shutdown).await;

    history.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn detect(config: &Config, images: Vec<PathBuf>) -> anyhow::Result<()> {
    let count = images.len();
    let adapter = DetectionAdapter::from_config(&config.model)?;
    let history = SqliteHistory::open(&config.database.path).await?;

    let capture = CaptureOrchestrator::new(FileSource::new(images)).with_flash_delay(Duration::ZERO);
    let mut pipeline = SessionPipeline::new(
        capture,
        adapter,
        EnsembleAggregator::from_config(&config.ensemble),
        ResultDispatcher::new(std::io::stdout()),
        history.clone(),
    )
    .with_capture_plan(count, Duration::ZERO);

    let session = pipeline.run_session(TriggerSource::Manual).await;
    history.close().await;

    println!("\n=== Detection Session {} ===", session.session_id);
    println!("Outcome: {:?}", session.outcome);
    println!("Images used: {}/{}", session.images_captured, count);
    print_detections(&session.final_detections);
    Ok(())
}

async fn capture(config: &Config) -> anyhow::Result<()> {
    let adapter = DetectionAdapter::from_config(&config.model)?;
    let camera = connect_camera(config).await?;
    let mut orchestrator = CaptureOrchestrator::from_config(camera, &config.camera, &config.capture);

    let requested = config.capture.num_images;
    let delay = config.camera.capture_delay();
    let aggregator = EnsembleAggregator::from_config(&config.ensemble);
    let (images_captured, detections) = tokio::task::spawn_blocking(move || {
        let batch = orchestrator.capture_batch(requested, delay);
        let per_image: Vec<_> = batch
            .images
            .iter()
            .enumerate()
            .map(|(i, image)| adapter.detect(image, i))
            .collect();
        (batch.len(), aggregator.aggregate(&per_image))
    })
    .await?;

    if images_captured == 0 {
        return Err(Error::AllCapturesFailed { requested }.into());
    }

    println!("\n=== Detection Results ===");
    println!("Images captured: {}", images_captured);
    print_detections(&detections);
    Ok(())
}

async fn camera_test(config: &Config, save: Option<PathBuf>) -> anyhow::Result<()> {
    let mut camera = connect_camera(config).await?;
    let frame = camera.capture_frame().await?;
    println!("Camera test OK - frame size: {}x{}", frame.width(), frame.height());

    if let Some(path) = save {
        frame.to_rgb8().save(&path)?;
        println!("Frame saved to {}", path.display());
    }
    Ok(())
}

async fn link_test(config: &Config, command: String) -> anyhow::Result<()> {
    let link_config = config.link.clone();
    let response = tokio::task::spawn_blocking(move || -> pillvision::Result<String> {
        let (mut listener, mut dispatcher) = link::open_serial(&link_config)?;
        dispatcher.send_command(&command, listener.get_mut())
    })
    .await??;
    println!("Controller response: {}", response);
    Ok(())
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let mut camera = Esp32Cam::new(&config.camera.esp32cam_ip, tokio::runtime::Handle::current());
    let camera_connected = camera.test_connection().await;
    let flash_on = camera_connected && camera.flash_status().await;
    let adapter = DetectionAdapter::from_config(&config.model)?;
    let history = SqliteHistory::open(&config.database.path).await?;
    let sessions = history.session_count().await?;
    history.close().await;

    println!("\n=== System Status ===");
    println!(
        "ESP32-CAM: {} (flash {})",
        if camera_connected { "Connected" } else { "Disconnected" },
        if flash_on { "on" } else { "off" }
    );
    println!("Controller port: {} @ {}", config.link.port, config.link.baud_rate);
    println!("Detector: {}", if adapter.uses_primary() { "Model" } else { "Fallback" });
    println!("Sessions recorded: {}", sessions);
    println!("Images per detection: {}", config.capture.num_images);
    Ok(())
}

async fn history(config: &Config, limit: i64) -> anyhow::Result<()> {
    let history = SqliteHistory::open(&config.database.path).await?;
    let sessions = history.recent_sessions(limit).await?;

    if sessions.is_empty() {
        println!("No sessions recorded.");
    }
    for record in &sessions {
        println!(
            "{}  {}  {:<7} images={} detections={} {:.2}s {}",
            record.session_id,
            record.timestamp,
            record.trigger_source,
            record.images_captured,
            record.detections_count,
            record.processing_time,
            if record.success { "ok" } else { "empty" }
        );
        for stored in history.detections_for(&record.session_id).await? {
            println!(
                "    {} {:.3} x{} [{}, {}, {}, {}]",
                stored.pill_type,
                stored.confidence,
                stored.detection_count,
                stored.bbox.x1,
                stored.bbox.y1,
                stored.bbox.x2,
                stored.bbox.y2
            );
        }
    }
    history.close().await;
    Ok(())
}

fn print_detections(detections: &[FusedDetection]) {
    println!("Detections found: {}", detections.len());
    for (i, detection) in detections.iter().enumerate() {
        println!(
            "  {}. {} - Confidence: {:.3} - Count: {}",
            i + 1,
            detection.class_label,
            detection.confidence,
            detection.support_count
        );
    }
}
