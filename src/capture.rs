//! Image acquisition: capture backends and the capture job.
//!
//! A [`CaptureBackend`] produces one image file at a given path. Exactly one
//! backend is selected at startup from `camera.backend`:
//!
//! | Backend | Program | Notes |
//! |---------|---------|-------|
//! | `still` | `rpicam-still` | Raspberry Pi camera via libcamera; honours long exposure |
//! | `webcam` | `fswebcam` | USB webcam; long exposure skips extra frames |
//! | `fake` | none | writes a placeholder JPEG, for bench testing |
//!
//! [`CaptureJob`] runs one cycle per trigger:
//!
//! ```text
//! window? ─▶ dark? ─▶ name/rotate ─▶ acquire ─▶ enqueue ─▶ report
//! ```
//!
//! The window check consults the [`CaptureSchedule`]: an optional date
//! range and any number of daily periods, each of which may set its own
//! capture interval. Leaving the schedule ends the capture sequence.
//! Image names have one-second resolution, so a second cycle within the
//! same second is skipped rather than overwriting the first image.
//!
//! When it is dark exactly one of two policies applies: the reflector is
//! switched on around the acquisition, or long-exposure parameters are
//! passed to the backend.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::config::{CameraConfig, Config};
use crate::counters::{EventCounters, JobHandle};
use crate::dark::{DarkMode, DarkTimeOracle};
use crate::error::{Error, Result};
use crate::gpio::Gpio;
use crate::job::Job;
use crate::models::{Activity, Artifact, CaptureSchedule, JobKind};
use crate::queue::{HandoffQueue, PushOutcome};
use crate::shutdown::Shutdown;

// ═══════════════════════════════════════════════════════════════════════
// Backends
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureParams {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub rotation: u16,
    pub long_exposure: bool,
    pub gain: f32,
    pub shutter_us: u64,
}

impl CaptureParams {
    pub fn from_config(cfg: &CameraConfig) -> Self {
        Self {
            width: cfg.width,
            height: cfg.height,
            quality: cfg.quality,
            rotation: cfg.rotation,
            long_exposure: false,
            gain: cfg.dark_gain,
            shutter_us: cfg.dark_shutter_us,
        }
    }
}

/// Produce one image file at `target`.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn capture(&self, target: &Path, params: &CaptureParams) -> Result<()>;
}

/// Build the backend named by `camera.backend`.
pub fn backend_from_config(cfg: &CameraConfig) -> Result<Arc<dyn CaptureBackend>> {
    let timeout = Duration::from_secs(cfg.timeout_secs);
    Ok(match cfg.backend.as_str() {
        "still" => Arc::new(StillBackend {
            program: cfg.program.clone().unwrap_or_else(|| "rpicam-still".into()),
            timeout,
        }),
        "webcam" => Arc::new(WebcamBackend {
            program: cfg.program.clone().unwrap_or_else(|| "fswebcam".into()),
            device: cfg.device.clone(),
            timeout,
        }),
        "fake" => Arc::new(FakeBackend),
        other => return Err(Error::Config(format!("unknown camera backend '{}'", other))),
    })
}

/// Run a capture program with a timeout and check it produced `target`.
async fn run_capture_program(
    program: &str,
    args: &[String],
    target: &Path,
    timeout: Duration,
) -> Result<()> {
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| Error::Capture(format!("{} timed out after {:?}", program, timeout)))?
        .map_err(|e| Error::Capture(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Capture(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }
    if !target.exists() {
        return Err(Error::Capture(format!(
            "{} produced no file at {}",
            program,
            target.display()
        )));
    }
    Ok(())
}

/// `rpicam-still` (libcamera) for the Raspberry Pi camera.
pub struct StillBackend {
    program: String,
    timeout: Duration,
}

impl StillBackend {
    fn args(target: &Path, p: &CaptureParams) -> Vec<String> {
        let mut args = vec![
            "--nopreview".to_string(),
            "--immediate".to_string(),
            "--width".to_string(),
            p.width.to_string(),
            "--height".to_string(),
            p.height.to_string(),
            "-q".to_string(),
            p.quality.to_string(),
            "--rotation".to_string(),
            p.rotation.to_string(),
        ];
        if p.long_exposure {
            args.extend([
                "--gain".to_string(),
                p.gain.to_string(),
                "--shutter".to_string(),
                p.shutter_us.to_string(),
            ]);
        }
        args.push("-o".to_string());
        args.push(target.display().to_string());
        args
    }
}

#[async_trait]
impl CaptureBackend for StillBackend {
    fn name(&self) -> &str {
        "still"
    }

    async fn capture(&self, target: &Path, params: &CaptureParams) -> Result<()> {
        // The exposure itself can take several seconds.
        let budget = if params.long_exposure {
            self.timeout + Duration::from_micros(params.shutter_us.saturating_mul(2))
        } else {
            self.timeout
        };
        run_capture_program(&self.program, &Self::args(target, params), target, budget).await
    }
}

/// `fswebcam` for USB webcams.
pub struct WebcamBackend {
    program: String,
    device: String,
    timeout: Duration,
}

impl WebcamBackend {
    fn args(&self, target: &Path, p: &CaptureParams) -> Vec<String> {
        let mut args = vec![
            "-d".to_string(),
            self.device.clone(),
            "-r".to_string(),
            format!("{}x{}", p.width, p.height),
            "--jpeg".to_string(),
            p.quality.to_string(),
            "--no-banner".to_string(),
        ];
        if p.rotation != 0 {
            args.extend(["--rotate".to_string(), p.rotation.to_string()]);
        }
        if p.long_exposure {
            // Let auto-exposure settle in low light.
            args.extend(["-S".to_string(), "20".to_string()]);
        }
        args.push(target.display().to_string());
        args
    }
}

#[async_trait]
impl CaptureBackend for WebcamBackend {
    fn name(&self) -> &str {
        "webcam"
    }

    async fn capture(&self, target: &Path, params: &CaptureParams) -> Result<()> {
        run_capture_program(&self.program, &self.args(target, params), target, self.timeout).await
    }
}

/// Writes a minimal JPEG (SOI + EOI markers).
pub struct FakeBackend;

#[async_trait]
impl CaptureBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn capture(&self, target: &Path, _params: &CaptureParams) -> Result<()> {
        tokio::fs::write(target, [0xFF, 0xD8, 0xFF, 0xD9])
            .await
            .map_err(|e| Error::Capture(format!("fake capture {}: {}", target.display(), e)))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Capture job
// ═══════════════════════════════════════════════════════════════════════

/// What to do when the oracle reports dark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DarkPolicy {
    LongExposure,
    Reflector,
}

impl DarkPolicy {
    pub fn from_config(cfg: &CameraConfig) -> Self {
        match cfg.dark_policy.as_str() {
            "reflector" => DarkPolicy::Reflector,
            _ => DarkPolicy::LongExposure,
        }
    }
}

pub struct CaptureJob {
    camera_id: String,
    image_dir: PathBuf,
    backend: Arc<dyn CaptureBackend>,
    gpio: Arc<dyn Gpio>,
    oracle: DarkTimeOracle,
    dark_policy: DarkPolicy,
    params: CaptureParams,
    schedule: CaptureSchedule,
    queue: Arc<HandoffQueue>,
    counters: Arc<EventCounters>,
    handle: JobHandle,
    in_window: bool,
    interval: Option<Duration>,
    last: Option<Artifact>,
}

impl CaptureJob {
    pub fn new(
        config: &Config,
        backend: Arc<dyn CaptureBackend>,
        gpio: Arc<dyn Gpio>,
        queue: Arc<HandoffQueue>,
        counters: Arc<EventCounters>,
        handle: JobHandle,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            camera_id: config.camera.id.clone(),
            image_dir: config.camera.image_dir.clone(),
            backend,
            gpio,
            oracle: DarkTimeOracle::new(DarkMode::from_config(&config.dark)?),
            dark_policy: DarkPolicy::from_config(&config.camera),
            params: CaptureParams::from_config(&config.camera),
            schedule: config.schedule.capture_schedule()?,
            queue,
            counters,
            handle,
            in_window: true,
            interval: None,
            last: None,
        })
    }

    /// Most recent artifact produced by this job.
    pub fn last_artifact(&self) -> Option<&Artifact> {
        self.last.as_ref()
    }

    /// Acquire one image for `now` without touching the queue.
    pub async fn acquire(&mut self, now: DateTime<Local>, shutdown: &Shutdown) -> Result<Artifact> {
        let dark = self.oracle.evaluate(&now);
        self.counters.set_dark(dark.clone());

        let mut params = self.params.clone();
        let reflector = dark.is_dark && self.dark_policy == DarkPolicy::Reflector;
        params.long_exposure = dark.is_dark && self.dark_policy == DarkPolicy::LongExposure;

        let artifact = Artifact::new(&self.image_dir, &self.camera_id, now.naive_local());
        if artifact.path.exists() {
            return Err(Error::Capture(format!(
                "{} already exists",
                artifact.path.display()
            )));
        }
        if let Some(day_dir) = artifact.path.parent() {
            tokio::fs::create_dir_all(day_dir).await.map_err(|e| {
                Error::Capture(format!("cannot create {}: {}", day_dir.display(), e))
            })?;
        }

        shutdown.checkpoint()?;

        if reflector {
            self.gpio.set_reflector(true)?;
        }
        let result = self.backend.capture(&artifact.path, &params).await;
        if reflector {
            if let Err(e) = self.gpio.set_reflector(false) {
                tracing::warn!(error = %e, "Failed to switch reflector off");
            }
        }
        result?;

        tracing::info!(
            artifact = %artifact.name(),
            backend = self.backend.name(),
            dark = dark.is_dark,
            long_exposure = params.long_exposure,
            reflector,
            "Captured image"
        );
        Ok(artifact)
    }

    async fn enqueue(&self, artifact: Artifact) {
        match self.queue.push(artifact).await {
            Ok(PushOutcome::Accepted) => {}
            Ok(PushOutcome::Evicted(old)) => {
                self.handle.bump("dropped", 1);
                tracing::warn!(evicted = %old.name(), "Hand-off queue full, dropped oldest artifact");
            }
            Err(e) => {
                self.handle.bump("rejected", 1);
                tracing::warn!(error = %e, "Hand-off queue full, artifact not queued");
            }
        }
    }
}

#[async_trait]
impl Job for CaptureJob {
    fn kind(&self) -> JobKind {
        JobKind::Capture
    }

    async fn run_cycle(&mut self, shutdown: &Shutdown) -> Result<()> {
        self.cycle_at(Local::now(), shutdown).await
    }

    fn interval_hint(&self) -> Option<Duration> {
        self.interval
    }
}

impl CaptureJob {
    async fn cycle_at(&mut self, now: DateTime<Local>, shutdown: &Shutdown) -> Result<()> {
        let outside = match self.schedule.activity_at(now.naive_local()) {
            Activity::Active { interval } => {
                self.interval = interval;
                None
            }
            Activity::OutsideDates => Some("outside capture dates"),
            Activity::OutsideWindow => Some("outside capture window"),
        };
        if let Some(reason) = outside {
            if self.in_window {
                tracing::info!(reason, "Capture schedule closed, ending capture sequence");
                self.queue.mark_sequence_end();
            }
            self.in_window = false;
            self.interval = None;
            self.handle.set_detail(reason);
            return Ok(());
        }
        self.in_window = true;

        let target = Artifact::new(&self.image_dir, &self.camera_id, now.naive_local());
        if target.path.exists() {
            self.handle.bump("duplicates", 1);
            tracing::debug!(artifact = %target.name(), "Image for this second already taken, skipping");
            return Ok(());
        }

        shutdown.checkpoint()?;
        let artifact = self.acquire(now, shutdown).await?;
        self.handle.bump("captured", 1);
        self.handle.set_detail(artifact.name());
        self.last = Some(artifact.clone());
        self.enqueue(artifact).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(long: bool) -> CaptureParams {
        CaptureParams {
            width: 1280,
            height: 720,
            quality: 85,
            rotation: 180,
            long_exposure: long,
            gain: 8.0,
            shutter_us: 5_000_000,
        }
    }

    #[test]
    fn test_still_args_with_long_exposure() {
        let args = StillBackend::args(Path::new("/img/a.jpg"), &params(true));
        let joined = args.join(" ");
        assert!(joined.contains("--width 1280 --height 720 -q 85 --rotation 180"));
        assert!(joined.contains("--gain 8 --shutter 5000000"));
        assert!(joined.ends_with("-o /img/a.jpg"));
    }

    #[test]
    fn test_still_args_without_long_exposure() {
        let args = StillBackend::args(Path::new("/img/a.jpg"), &params(false));
        assert!(!args.iter().any(|a| a == "--shutter"));
    }

    #[test]
    fn test_webcam_args() {
        let backend = WebcamBackend {
            program: "fswebcam".into(),
            device: "/dev/video2".into(),
            timeout: Duration::from_secs(5),
        };
        let args = backend.args(Path::new("/img/b.jpg"), &params(false));
        assert_eq!(&args[..4], &["-d", "/dev/video2", "-r", "1280x720"]);
        assert!(args.contains(&"--rotate".to_string()));
        assert_eq!(args.last().unwrap(), "/img/b.jpg");
    }

    #[tokio::test]
    async fn test_missing_program_is_capture_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("x.jpg");
        let err = run_capture_program(
            "definitely-not-a-camera-program",
            &[],
            &target,
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Capture(_)));
    }

    #[tokio::test]
    async fn test_program_that_writes_nothing_is_capture_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("x.jpg");
        let err = run_capture_program("true", &[], &target, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("produced no file"));
    }

    struct RecordingGpio {
        calls: std::sync::Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Gpio for RecordingGpio {
        fn set_reflector(&self, on: bool) -> Result<()> {
            self.calls.lock().unwrap().push(on);
            Ok(())
        }

        async fn wait_trigger(&self) -> Result<crate::gpio::TriggerEvent> {
            std::future::pending().await
        }
    }

    struct RecordingBackend {
        seen: std::sync::Mutex<Vec<CaptureParams>>,
    }

    #[async_trait]
    impl CaptureBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn capture(&self, target: &Path, params: &CaptureParams) -> Result<()> {
            self.seen.lock().unwrap().push(params.clone());
            tokio::fs::write(target, b"jpg").await?;
            Ok(())
        }
    }

    fn job_for(
        policy: &str,
        dir: &Path,
    ) -> (CaptureJob, Arc<RecordingGpio>, Arc<RecordingBackend>) {
        let text = format!(
            r#"
[camera]
id = "CAM1"
image_dir = "{}"
backend = "fake"
dark_policy = "{}"

[gpio]
reflector_pin = 17

[dark]
mode = "fixed"
start = "22:00"
stop = "05:00"
"#,
            dir.display(),
            policy
        );
        let config = crate::config::parse_config(&text).unwrap();
        let gpio = Arc::new(RecordingGpio {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let backend = Arc::new(RecordingBackend {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let counters = Arc::new(EventCounters::new());
        let handle = counters
            .register(JobKind::Capture, crate::job::RetryPolicy::default())
            .unwrap();
        let queue = Arc::new(HandoffQueue::new(
            4,
            crate::queue::OverflowPolicy::DropOldest,
        ));
        let job = CaptureJob::new(
            &config,
            backend.clone(),
            gpio.clone(),
            queue,
            counters,
            handle,
        )
        .unwrap();
        (job, gpio, backend)
    }

    fn local(h: u32, m: u32) -> DateTime<Local> {
        use chrono::TimeZone;
        Local
            .with_ymd_and_hms(2024, 3, 5, h, m, 0)
            .earliest()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dark_reflector_policy_toggles_gpio_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut job, gpio, backend) = job_for("reflector", tmp.path());
        let artifact = job
            .acquire(local(23, 30), &Shutdown::never())
            .await
            .unwrap();
        assert_eq!(artifact.name(), "050324-233000-CAM1.jpg");
        assert!(artifact.path.starts_with(tmp.path().join("050324")));
        assert_eq!(*gpio.calls.lock().unwrap(), vec![true, false]);
        assert!(!backend.seen.lock().unwrap()[0].long_exposure);
    }

    #[tokio::test]
    async fn test_dark_exposure_policy_leaves_reflector_alone() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut job, gpio, backend) = job_for("exposure", tmp.path());
        job.acquire(local(23, 30), &Shutdown::never()).await.unwrap();
        assert!(gpio.calls.lock().unwrap().is_empty());
        assert!(backend.seen.lock().unwrap()[0].long_exposure);
    }

    #[tokio::test]
    async fn test_daylight_uses_neither_policy() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut job, gpio, backend) = job_for("reflector", tmp.path());
        job.acquire(local(12, 0), &Shutdown::never()).await.unwrap();
        assert!(gpio.calls.lock().unwrap().is_empty());
        assert!(!backend.seen.lock().unwrap()[0].long_exposure);
    }

    #[tokio::test]
    async fn test_acquire_stops_at_checkpoint() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut job, _gpio, backend) = job_for("exposure", tmp.path());
        let (trigger, shutdown) = crate::shutdown::channel();
        trigger.request();
        let err = job.acquire(local(12, 0), &shutdown).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fake_backend_writes_jpeg_markers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("f.jpg");
        FakeBackend.capture(&target, &params(false)).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), vec![0xFF, 0xD8, 0xFF, 0xD9]);
    }

    fn scheduled_job(
        dir: &Path,
        schedule: &str,
    ) -> (CaptureJob, Arc<HandoffQueue>, crate::queue::ConsumerId, Arc<EventCounters>) {
        let text = format!(
            "[camera]\nid = \"CAM1\"\nimage_dir = \"{}\"\nbackend = \"fake\"\n\n{}",
            dir.display(),
            schedule
        );
        let config = crate::config::parse_config(&text).unwrap();
        let counters = Arc::new(EventCounters::new());
        let handle = counters
            .register(JobKind::Capture, crate::job::RetryPolicy::default())
            .unwrap();
        let queue = Arc::new(HandoffQueue::new(
            8,
            crate::queue::OverflowPolicy::DropOldest,
        ));
        let consumer = queue.register_consumer("test");
        let job = CaptureJob::new(
            &config,
            Arc::new(FakeBackend),
            Arc::new(crate::gpio::NoGpio),
            queue.clone(),
            counters.clone(),
            handle,
        )
        .unwrap();
        (job, queue, consumer, counters)
    }

    #[tokio::test]
    async fn test_same_second_cycle_is_skipped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut job, queue, _consumer, counters) = scheduled_job(tmp.path(), "");
        job.cycle_at(local(12, 0), &Shutdown::never()).await.unwrap();
        job.cycle_at(local(12, 0), &Shutdown::never()).await.unwrap();

        assert_eq!(queue.len(), 1);
        let state = counters.get(JobKind::Capture).unwrap();
        assert_eq!(state.event("captured"), 1);
        assert_eq!(state.event("duplicates"), 1);

        let err = job
            .acquire(local(12, 0), &Shutdown::never())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_periods_set_interval_and_end_sequence() {
        let tmp = tempfile::TempDir::new().unwrap();
        let schedule = r#"
[[schedule.period]]
from = "06:00"
until = "12:00"
interval_secs = 30

[[schedule.period]]
from = "12:00"
until = "18:00"
"#;
        let (mut job, queue, consumer, _counters) = scheduled_job(tmp.path(), schedule);

        job.cycle_at(local(7, 0), &Shutdown::never()).await.unwrap();
        assert_eq!(job.interval_hint(), Some(Duration::from_secs(30)));
        job.cycle_at(local(13, 0), &Shutdown::never()).await.unwrap();
        assert_eq!(job.interval_hint(), None);
        assert_eq!(queue.len(), 2);

        job.cycle_at(local(19, 0), &Shutdown::never()).await.unwrap();
        assert_eq!(queue.len(), 2);
        queue.pop(consumer).unwrap();
        queue.pop(consumer).unwrap();
        assert!(queue.take_sequence_end(consumer));
    }

    #[tokio::test]
    async fn test_outside_dates_captures_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let schedule = "[schedule]\nstart_date = \"2024-03-06\"\n";
        let (mut job, queue, _consumer, counters) = scheduled_job(tmp.path(), schedule);
        job.cycle_at(local(12, 0), &Shutdown::never()).await.unwrap();
        assert!(queue.is_empty());
        let state = counters.get(JobKind::Capture).unwrap();
        assert_eq!(state.event("captured"), 0);
        assert_eq!(state.detail, "outside capture dates");
    }
}
