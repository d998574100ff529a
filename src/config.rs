//! TOML configuration.
//!
//! Only `[camera]` is required; every other section falls back to defaults
//! suitable for a single Raspberry Pi camera writing to local disk.
//!
//! ```toml
//! [camera]
//! id = "CAM1"
//! image_dir = "/var/lib/lapse/images"
//! backend = "still"            # still | webcam | fake
//!
//! [schedule]
//! capture_interval_secs = 60
//!
//! [dark]
//! mode = "astronomical"        # off | fixed | astronomical
//! latitude = 51.48
//! longitude = -0.0
//!
//! [upload]
//! enabled = true
//! store = "s3"
//!
//! [upload.s3]
//! bucket = "lapse-frames"
//! region = "eu-west-2"
//!
//! [control.push]
//! bind = "0.0.0.0:8765"
//! status_tokens = ["viewer-token"]
//! command_tokens = ["operator-token"]
//! ```

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use std::time::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{CapturePeriod, CaptureSchedule, TimeWindow};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub camera: CameraConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dark: DarkConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

// ============ Camera ============

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    /// Camera identifier, the last component of every artifact name.
    pub id: String,
    pub image_dir: PathBuf,
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Override for the capture program (`rpicam-still` / `fswebcam`).
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default = "default_video_device")]
    pub device: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub rotation: u16,
    #[serde(default = "default_capture_timeout")]
    pub timeout_secs: u64,
    /// `timer` or `sensor`.
    #[serde(default = "default_trigger")]
    pub trigger: String,
    #[serde(default = "default_debounce")]
    pub debounce_secs: u64,
    /// `exposure` or `reflector`.
    #[serde(default = "default_dark_policy")]
    pub dark_policy: String,
    #[serde(default = "default_dark_gain")]
    pub dark_gain: f32,
    #[serde(default = "default_dark_shutter")]
    pub dark_shutter_us: u64,
}

fn default_backend() -> String {
    "still".to_string()
}
fn default_video_device() -> String {
    "/dev/video0".to_string()
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_quality() -> u8 {
    90
}
fn default_capture_timeout() -> u64 {
    10
}
fn default_trigger() -> String {
    "timer".to_string()
}
fn default_debounce() -> u64 {
    5
}
fn default_dark_policy() -> String {
    "exposure".to_string()
}
fn default_dark_gain() -> f32 {
    8.0
}
fn default_dark_shutter() -> u64 {
    5_000_000
}

// ============ Schedule ============

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_capture_interval")]
    pub capture_interval_secs: u64,
    #[serde(default = "default_archive_interval")]
    pub archive_interval_secs: u64,
    #[serde(default = "default_upload_interval")]
    pub upload_interval_secs: u64,
    #[serde(default = "default_control_interval")]
    pub control_interval_secs: u64,
    /// Daily capture window start, `HH:MM[:SS]`.
    #[serde(default)]
    pub active_from: Option<String>,
    /// Daily capture window end, `HH:MM[:SS]`.
    #[serde(default)]
    pub active_until: Option<String>,
    /// Further daily windows, `[[schedule.period]]`.
    #[serde(default, rename = "period")]
    pub periods: Vec<PeriodConfig>,
    /// First capture day, `YYYY-MM-DD`.
    #[serde(default)]
    pub start_date: Option<String>,
    /// Last capture day, `YYYY-MM-DD`.
    #[serde(default)]
    pub stop_date: Option<String>,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            capture_interval_secs: default_capture_interval(),
            archive_interval_secs: default_archive_interval(),
            upload_interval_secs: default_upload_interval(),
            control_interval_secs: default_control_interval(),
            active_from: None,
            active_until: None,
            periods: Vec::new(),
            start_date: None,
            stop_date: None,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// One `[[schedule.period]]` entry.
#[derive(Debug, Deserialize, Clone)]
pub struct PeriodConfig {
    pub from: String,
    pub until: String,
    /// Capture interval inside this period; defaults to `capture_interval_secs`.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl ScheduleConfig {
    /// Resolve the capture calendar. `active_from`/`active_until` is listed
    /// first, ahead of any `[[schedule.period]]`.
    pub fn capture_schedule(&self) -> Result<CaptureSchedule> {
        let mut periods = Vec::new();
        if let (Some(from), Some(until)) = (&self.active_from, &self.active_until) {
            periods.push(CapturePeriod {
                window: TimeWindow::new(parse_time_of_day(from)?, parse_time_of_day(until)?),
                interval: None,
            });
        }
        for period in &self.periods {
            periods.push(CapturePeriod {
                window: TimeWindow::new(
                    parse_time_of_day(&period.from)?,
                    parse_time_of_day(&period.until)?,
                ),
                interval: period.interval_secs.map(Duration::from_secs),
            });
        }
        Ok(CaptureSchedule {
            periods,
            start_date: self.start_date.as_deref().map(parse_date).transpose()?,
            stop_date: self.stop_date.as_deref().map(parse_date).transpose()?,
        })
    }
}

fn default_capture_interval() -> u64 {
    60
}
fn default_archive_interval() -> u64 {
    60
}
fn default_upload_interval() -> u64 {
    120
}
fn default_control_interval() -> u64 {
    30
}
fn default_shutdown_grace() -> u64 {
    10
}

// ============ Retry ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            backoff_factor: default_backoff_factor(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_backoff() -> u64 {
    900
}

// ============ Queue ============

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// `drop_oldest` or `block`.
    #[serde(default = "default_overflow")]
    pub overflow: String,
    #[serde(default = "default_block_timeout")]
    pub block_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            overflow: default_overflow(),
            block_timeout_ms: default_block_timeout(),
        }
    }
}

fn default_capacity() -> usize {
    32
}
fn default_overflow() -> String {
    "drop_oldest".to_string()
}
fn default_block_timeout() -> u64 {
    2000
}

// ============ Dark time ============

#[derive(Debug, Deserialize, Clone)]
pub struct DarkConfig {
    /// `off`, `fixed`, or `astronomical`.
    #[serde(default = "default_dark_mode")]
    pub mode: String,
    #[serde(default = "default_dark_start")]
    pub start: String,
    #[serde(default = "default_dark_stop")]
    pub stop: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default = "default_elevation_threshold")]
    pub elevation_threshold_deg: f64,
}

impl Default for DarkConfig {
    fn default() -> Self {
        Self {
            mode: default_dark_mode(),
            start: default_dark_start(),
            stop: default_dark_stop(),
            latitude: None,
            longitude: None,
            elevation_threshold_deg: default_elevation_threshold(),
        }
    }
}

fn default_dark_mode() -> String {
    "off".to_string()
}
fn default_dark_start() -> String {
    "22:00".to_string()
}
fn default_dark_stop() -> String {
    "05:00".to_string()
}
fn default_elevation_threshold() -> f64 {
    -2.5
}

// ============ GPIO ============

#[derive(Debug, Deserialize, Clone)]
pub struct GpioConfig {
    #[serde(default)]
    pub reflector_pin: Option<u32>,
    #[serde(default)]
    pub sensor_pin: Option<u32>,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            reflector_pin: None,
            sensor_pin: None,
            sysfs_root: default_sysfs_root(),
            poll_ms: default_poll_ms(),
        }
    }
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}
fn default_poll_ms() -> u64 {
    100
}

// ============ Local archive ============

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_archive_batch")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Remove day folders older than this many days.
    #[serde(default)]
    pub keep_days: Option<u32>,
    /// Cap on images kept under `image_dir`.
    #[serde(default)]
    pub max_images: Option<usize>,
    #[serde(default = "default_true")]
    pub prune_uploaded_only: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_archive_batch(),
            max_attempts: default_max_attempts(),
            keep_days: None,
            max_images: None,
            prune_uploaded_only: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_archive_batch() -> usize {
    20
}
fn default_max_attempts() -> u32 {
    3
}

// ============ Remote upload ============

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `dir` or `s3`.
    #[serde(default = "default_store")]
    pub store: String,
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
    /// Fixed name of the rolling "latest" object; `None` disables it.
    #[serde(default = "default_snapshot_name")]
    pub snapshot_name: Option<String>,
    #[serde(default = "default_upload_batch")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_upload_timeout")]
    pub timeout_secs: u64,
    /// Target directory for the `dir` store.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub s3: Option<S3StoreConfig>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store: default_store(),
            remote_root: default_remote_root(),
            snapshot_name: default_snapshot_name(),
            batch_size: default_upload_batch(),
            max_attempts: default_max_attempts(),
            log_path: default_log_path(),
            timeout_secs: default_upload_timeout(),
            dir: None,
            s3: None,
        }
    }
}

fn default_store() -> String {
    "dir".to_string()
}
fn default_remote_root() -> String {
    "images".to_string()
}
fn default_snapshot_name() -> Option<String> {
    Some("latest.jpg".to_string())
}
fn default_upload_batch() -> usize {
    10
}
fn default_log_path() -> PathBuf {
    PathBuf::from("./upload_log.jsonl")
}
fn default_upload_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3StoreConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix prepended to every object key.
    #[serde(default)]
    pub prefix: String,
    /// S3-compatible endpoint (MinIO, Garage); path-style addressing is used.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

// ============ Control channel ============

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ControlConfig {
    /// Device identifier reported to operators; defaults to `camera.id`.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub poll: Option<PollConfig>,
    #[serde(default)]
    pub push: Option<PushConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollConfig {
    pub status_url: String,
    #[serde(default)]
    pub command_url: Option<String>,
    pub write_key: String,
    #[serde(default)]
    pub read_key: String,
    #[serde(default = "default_poll_timeout")]
    pub timeout_secs: u64,
}

fn default_poll_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct PushConfig {
    #[serde(default = "default_push_bind")]
    pub bind: String,
    #[serde(default)]
    pub status_tokens: Vec<String>,
    #[serde(default)]
    pub command_tokens: Vec<String>,
    /// Lines of `recv_key,send_key,client_id`.
    #[serde(default)]
    pub tokens_file: Option<PathBuf>,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_push_bind() -> String {
    "0.0.0.0:8765".to_string()
}
fn default_max_clients() -> usize {
    3
}
fn default_handshake_timeout() -> u64 {
    2
}

// ============ Supervisor ============

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_true")]
    pub notify: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { notify: true }
    }
}

impl Config {
    /// Identifier reported on the control channel.
    pub fn device_id(&self) -> &str {
        self.control.device_id.as_deref().unwrap_or(&self.camera.id)
    }
}

/// Parse a `HH:MM` or `HH:MM:SS` time of day.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .with_context(|| format!("Invalid time of day '{}', expected HH:MM[:SS]", s))
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate camera
    if config.camera.id.trim().is_empty() {
        bail!("camera.id must not be empty");
    }
    if config.camera.id.contains(|c| c == '/' || c == '\\') {
        bail!("camera.id must not contain path separators");
    }
    match config.camera.backend.as_str() {
        "still" | "webcam" | "fake" => {}
        other => bail!(
            "Unknown camera backend: '{}'. Must be still, webcam, or fake.",
            other
        ),
    }
    match config.camera.trigger.as_str() {
        "timer" => {}
        "sensor" => {
            if config.gpio.sensor_pin.is_none() {
                bail!("gpio.sensor_pin must be set when camera.trigger is 'sensor'");
            }
        }
        other => bail!("Unknown camera trigger: '{}'. Must be timer or sensor.", other),
    }
    match config.camera.dark_policy.as_str() {
        "exposure" => {}
        "reflector" => {
            if config.gpio.reflector_pin.is_none() {
                bail!("gpio.reflector_pin must be set when camera.dark_policy is 'reflector'");
            }
        }
        other => bail!(
            "Unknown dark policy: '{}'. Must be exposure or reflector.",
            other
        ),
    }
    if config.camera.quality == 0 || config.camera.quality > 100 {
        bail!("camera.quality must be in 1..=100");
    }
    if config.camera.timeout_secs == 0 {
        bail!("camera.timeout_secs must be > 0");
    }

    // Validate schedule
    let s = &config.schedule;
    for (name, value) in [
        ("capture_interval_secs", s.capture_interval_secs),
        ("archive_interval_secs", s.archive_interval_secs),
        ("upload_interval_secs", s.upload_interval_secs),
        ("control_interval_secs", s.control_interval_secs),
    ] {
        if value == 0 {
            bail!("schedule.{} must be > 0", name);
        }
    }
    match (&s.active_from, &s.active_until) {
        (Some(from), Some(until)) => {
            parse_time_of_day(from)?;
            parse_time_of_day(until)?;
        }
        (None, None) => {}
        _ => bail!("schedule.active_from and schedule.active_until must be set together"),
    }
    if s.periods.iter().any(|p| p.interval_secs == Some(0)) {
        bail!("schedule.period.interval_secs must be > 0");
    }
    let calendar = s.capture_schedule()?;
    if let (Some(start), Some(stop)) = (calendar.start_date, calendar.stop_date) {
        if start > stop {
            bail!("schedule.start_date must not be after schedule.stop_date");
        }
    }

    // Validate retry
    if config.retry.failure_threshold == 0 {
        bail!("retry.failure_threshold must be >= 1");
    }
    if !config.retry.backoff_factor.is_finite() || config.retry.backoff_factor < 1.0 {
        bail!("retry.backoff_factor must be >= 1.0");
    }

    // Validate queue
    if config.queue.capacity == 0 {
        bail!("queue.capacity must be > 0");
    }
    match config.queue.overflow.as_str() {
        "drop_oldest" | "block" => {}
        other => bail!(
            "Unknown queue overflow policy: '{}'. Must be drop_oldest or block.",
            other
        ),
    }

    // Validate dark time
    match config.dark.mode.as_str() {
        "off" => {}
        "fixed" => {
            parse_time_of_day(&config.dark.start)?;
            parse_time_of_day(&config.dark.stop)?;
        }
        "astronomical" => {
            let (Some(lat), Some(lon)) = (config.dark.latitude, config.dark.longitude) else {
                bail!("dark.latitude and dark.longitude are required in astronomical mode");
            };
            if !(-90.0..=90.0).contains(&lat) {
                bail!("dark.latitude must be in [-90, 90]");
            }
            if !(-180.0..=180.0).contains(&lon) {
                bail!("dark.longitude must be in [-180, 180]");
            }
        }
        other => bail!(
            "Unknown dark mode: '{}'. Must be off, fixed, or astronomical.",
            other
        ),
    }

    // Validate consumers
    if config.archive.batch_size == 0 || config.upload.batch_size == 0 {
        bail!("archive.batch_size and upload.batch_size must be > 0");
    }
    if config.archive.max_attempts == 0 || config.upload.max_attempts == 0 {
        bail!("archive.max_attempts and upload.max_attempts must be >= 1");
    }
    if config.upload.enabled {
        match config.upload.store.as_str() {
            "dir" => {
                if config.upload.dir.is_none() {
                    bail!("upload.dir must be set when upload.store is 'dir'");
                }
            }
            "s3" => {
                if config.upload.s3.is_none() {
                    bail!("[upload.s3] must be present when upload.store is 's3'");
                }
            }
            other => bail!("Unknown upload store: '{}'. Must be dir or s3.", other),
        }
    }

    // Validate control
    if let Some(push) = &config.control.push {
        if push.max_clients == 0 {
            bail!("control.push.max_clients must be >= 1");
        }
        if push.status_tokens.is_empty()
            && push.command_tokens.is_empty()
            && push.tokens_file.is_none()
        {
            bail!("control.push needs status_tokens, command_tokens, or tokens_file");
        }
    }

    Ok(config)
}
