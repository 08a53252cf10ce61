use anyhow::{Context, Result};
use clap::Parser;
use nutflix::analyzer::{HeadlessMonitor, MotionDetector};
use nutflix::backend::{BackendSelector, PlatformSignals};
use nutflix::camera::{CameraManager, CameraStatus, StatusCallback};
use nutflix::config::{BackendChoice, NutflixConfig};
use nutflix::frame::CameraId;
use nutflix::logging::{init_logging, LogOverrides};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nutflix")]
#[command(about = "Dual-camera capture and motion detection for wildlife feeders")]
#[command(version)]
#[command(long_about = "Runs CritterCam and NutCam side by side, keeps the latest frame of each \
fresh, and reports motion on either camera. Picks the best capture backend for the host, \
preferring the vendor camera stack on Raspberry Pi.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "nutflix.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without opening cameras")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Print detected platform signals and backend order, then exit
    #[arg(long, help = "Show which capture backends would be tried, in order")]
    list_backends: bool,

    /// Force a capture backend
    #[arg(long, value_enum, value_name = "BACKEND")]
    backend: Option<BackendChoice>,

    /// Use synthetic test-pattern cameras
    #[arg(long, help = "Run without cameras using synthetic frames")]
    test_pattern: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

impl Args {
    fn log_overrides(&self) -> LogOverrides {
        let level = if self.debug {
            Some("debug")
        } else if self.verbose {
            Some("info")
        } else if self.quiet {
            Some("error")
        } else {
            None
        };
        LogOverrides {
            level: level.map(str::to_string),
            format: self.log_format.clone(),
            detailed: self.debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let mut config = match NutflixConfig::load_validated(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration validation failed: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(backend) = args.backend {
        config.cameras.backend = backend;
    }
    if args.test_pattern {
        config.cameras.debug_mode = true;
    }

    let _log_guard = init_logging(&config.logging, &args.log_overrides())?;

    info!("Starting Nutflix v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    if args.validate_config {
        info!("Configuration validation successful");
        println!("✓ Configuration is valid");
        return Ok(());
    }

    if args.list_backends {
        print_backends(&config)?;
        return Ok(());
    }

    let status: StatusCallback = Arc::new(|camera: CameraId, status: CameraStatus| match status {
        CameraStatus::Ready => info!("{} is ready", camera.label()),
        CameraStatus::Error { reason } => error!("{} went offline: {}", camera.label(), reason),
    });

    // Opening cameras can block on subprocess startup
    let cameras_config = config.cameras.clone();
    let cameras = tokio::task::spawn_blocking(move || {
        CameraManager::initialize(&cameras_config, Some(status))
    })
    .await
    .context("camera initialization task failed")?
    .context("failed to initialize cameras")?;
    let cameras = Arc::new(cameras);

    for camera in cameras.camera_info() {
        info!(
            "{} on index {} via {} ({})",
            camera.camera.label(),
            camera.index,
            camera.backend,
            camera.state
        );
    }

    let detector = MotionDetector::new(config.motion_detection.clone());
    let mut monitor = HeadlessMonitor::new(Arc::clone(&cameras), detector, config.monitor.clone());
    monitor.start();

    info!("Nutflix is running, press Ctrl+C to stop");
    let reason = wait_for_shutdown_signal().await;
    info!("Shutdown initiated: {}", reason);

    let summary = monitor.stop().await;
    let releasing = Arc::clone(&cameras);
    if let Err(e) = tokio::task::spawn_blocking(move || releasing.shutdown()).await {
        warn!("Camera shutdown task failed: {}", e);
    }

    for camera in CameraId::ALL {
        info!(
            "{}: {} frames analyzed, {} motion detections",
            camera.label(),
            summary.frames_analyzed(camera),
            summary.motion_detections(camera)
        );
    }
    info!("Nutflix shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl+C"
}

fn print_backends(config: &NutflixConfig) -> Result<()> {
    let signals = PlatformSignals::detect();
    let order = BackendSelector::preference_order(&signals, &config.cameras);
    let report = serde_json::json!({
        "platform": signals,
        "preference": order,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Nutflix Configuration File");
    println!("# Every key is optional; missing keys take the values shown here.");
    println!("# Environment overrides use NUTFLIX_<SECTION>__<KEY>, e.g. NUTFLIX_CAMERAS__FPS=15");
    println!();
    println!("{}", NutflixConfig::default_toml()?);
    Ok(())
}
