//! # Lapse Harness CLI (`lapse`)
//!
//! The `lapse` binary runs the capture service and a few one-shot helpers
//! for setting up a camera in the field.
//!
//! ## Usage
//!
//! ```bash
//! lapse --config ./config/lapse.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lapse run` | Run the service until SIGINT/SIGTERM/SIGABRT |
//! | `lapse check` | Validate the config and print the job topology |
//! | `lapse dark` | Print the current dark state and next transition |
//! | `lapse capture` | Take one image into the image directory |
//!
//! Log verbosity follows `RUST_LOG` (default `lapse_harness=info`).

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lapse_harness::capture::{backend_from_config, CaptureJob};
use lapse_harness::config::{self, Config};
use lapse_harness::counters::EventCounters;
use lapse_harness::dark::{DarkMode, DarkTimeOracle};
use lapse_harness::gpio::{Gpio, NoGpio, SysfsGpio};
use lapse_harness::job::RetryPolicy;
use lapse_harness::models::JobKind;
use lapse_harness::orchestrator::Orchestrator;
use lapse_harness::queue::{HandoffQueue, OverflowPolicy};
use lapse_harness::shutdown::{self, Shutdown};

/// Lapse Harness: unattended time-lapse capture with archival, upload and
/// remote control.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lapse.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lapse",
    about = "Unattended time-lapse capture service",
    version,
    long_about = "Lapse Harness captures stills on a timer or sensor trigger, archives them \
    locally with retention, uploads them to remote storage, and takes pause/resume/rearm \
    commands from a remote operator over HTTP polling or a WebSocket push channel."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lapse.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service.
    ///
    /// Starts every enabled job and the configured control transports, then
    /// runs until a termination signal arrives or a job fails fatally.
    Run,

    /// Validate the configuration and print what `run` would start.
    Check,

    /// Print whether it is dark now and when that changes.
    Dark,

    /// Take a single image and print its path.
    ///
    /// Uses the configured backend, dark-time policy and reflector. The
    /// image is not queued for archive or upload.
    Capture,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lapse_harness=info,lapse=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run => run(cfg).await?,
        Commands::Check => check(&cfg),
        Commands::Dark => dark(&cfg)?,
        Commands::Capture => capture_once(&cfg).await?,
    }

    Ok(())
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(cfg)?;
    orchestrator
        .run(async {
            match shutdown::wait_for_signal().await {
                Ok(signal) => tracing::info!(signal, "Received termination signal"),
                Err(e) => {
                    tracing::error!(error = %e, "Cannot install signal handlers");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
}

fn check(cfg: &Config) {
    let schedule = &cfg.schedule;
    println!("Device: {}", cfg.device_id());
    println!(
        "Queue: capacity={} overflow={}",
        cfg.queue.capacity, cfg.queue.overflow
    );
    println!();
    println!("{:<10} {:<10} DETAIL", "JOB", "EVERY");

    let capture_detail = format!(
        "backend={} trigger={} dir={}",
        cfg.camera.backend,
        cfg.camera.trigger,
        cfg.camera.image_dir.display()
    );
    print_job(JobKind::Capture, schedule.capture_interval_secs, &capture_detail);

    if cfg.archive.enabled {
        let detail = format!(
            "keep_days={} max_images={}",
            cfg.archive
                .keep_days
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".into()),
            cfg.archive
                .max_images
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".into()),
        );
        print_job(JobKind::Archive, schedule.archive_interval_secs, &detail);
    }
    if cfg.upload.enabled {
        let detail = format!(
            "store={} root={} log={}",
            cfg.upload.store,
            cfg.upload.remote_root,
            cfg.upload.log_path.display()
        );
        print_job(JobKind::Upload, schedule.upload_interval_secs, &detail);
    }

    let mut transports = Vec::new();
    if let Some(poll) = &cfg.control.poll {
        transports.push(format!("poll={}", poll.status_url));
    }
    if let Some(push) = &cfg.control.push {
        transports.push(format!("push={}", push.bind));
    }
    if transports.is_empty() {
        transports.push("none".to_string());
    }
    print_job(
        JobKind::Control,
        schedule.control_interval_secs,
        &transports.join(" "),
    );

    println!();
    println!("Dark mode: {}", cfg.dark.mode);
    println!("Shutdown grace: {}s", schedule.shutdown_grace_secs);
    let periods = schedule.periods.len() + usize::from(schedule.active_from.is_some());
    if periods == 0 {
        println!("Capture periods: all day");
    } else {
        println!("Capture periods: {}", periods);
    }
    if schedule.start_date.is_some() || schedule.stop_date.is_some() {
        println!(
            "Capture dates: {} to {}",
            schedule.start_date.as_deref().unwrap_or("-"),
            schedule.stop_date.as_deref().unwrap_or("-")
        );
    }
}

fn print_job(kind: JobKind, every_secs: u64, detail: &str) {
    println!("{:<10} {:<10} {}", kind.name(), format!("{}s", every_secs), detail);
}

fn dark(cfg: &Config) -> anyhow::Result<()> {
    let mut oracle = DarkTimeOracle::new(DarkMode::from_config(&cfg.dark)?);
    let state = oracle.evaluate(&Local::now());
    println!("Mode: {}", cfg.dark.mode);
    println!("Dark: {}", if state.is_dark { "yes" } else { "no" });
    match state.next_transition_at {
        Some(at) => println!(
            "Next transition: {}",
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z")
        ),
        None => println!("Next transition: none expected"),
    }
    Ok(())
}

async fn capture_once(cfg: &Config) -> anyhow::Result<()> {
    let gpio: Arc<dyn Gpio> = if cfg.gpio.reflector_pin.is_some() {
        Arc::new(SysfsGpio::open(&cfg.gpio).context("Failed to open GPIO pins")?)
    } else {
        Arc::new(NoGpio)
    };
    let counters = Arc::new(EventCounters::new());
    let handle = counters.register(JobKind::Capture, RetryPolicy::default())?;
    let queue = Arc::new(HandoffQueue::new(1, OverflowPolicy::DropOldest));
    let mut job = CaptureJob::new(
        cfg,
        backend_from_config(&cfg.camera)?,
        gpio,
        queue,
        counters,
        handle,
    )?;
    let artifact = job.acquire(Local::now(), &Shutdown::never()).await?;
    println!("{}", artifact.path.display());
    Ok(())
}
