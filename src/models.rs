//! Core data models shared by the jobs and the control channel.
//!
//! These types flow through the pipeline: an [`Artifact`] is produced by
//! the capture job and consumed by the archive and upload jobs, a
//! [`RemoteCommand`] travels from a control transport to the orchestrator,
//! and a [`StatusSnapshot`] travels the other way.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dark::DarkState;
use crate::error::{Error, Result};
use crate::job::{JobState, JobStatus};
use crate::queue::QueueStats;

// ============ Artifacts ============

/// One captured image file plus its identifying metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub camera_id: String,
    pub captured_at: NaiveDateTime,
    /// Capture date as `DDMMYY`, also the local and remote subfolder.
    pub day_bucket: String,
}

impl Artifact {
    /// Build the artifact for a capture taken at `captured_at` under `image_dir`.
    pub fn new(image_dir: &Path, camera_id: &str, captured_at: NaiveDateTime) -> Self {
        let day_bucket = day_bucket(&captured_at);
        let path = image_dir
            .join(&day_bucket)
            .join(artifact_name(&captured_at, camera_id));
        Self {
            path,
            camera_id: camera_id.to_string(),
            captured_at,
            day_bucket,
        }
    }

    /// File name, `DDMMYY-HHMMSS-CAMID.jpg`.
    pub fn name(&self) -> String {
        artifact_name(&self.captured_at, &self.camera_id)
    }

    /// Remote object path, `<root>/<DDMMYY>/<name>`.
    pub fn remote_key(&self, root: &str) -> String {
        let root = root.trim_matches('/');
        if root.is_empty() {
            format!("{}/{}", self.day_bucket, self.name())
        } else {
            format!("{}/{}/{}", root, self.day_bucket, self.name())
        }
    }
}

/// `DDMMYY` for the given capture time.
pub fn day_bucket(at: &NaiveDateTime) -> String {
    at.format("%d%m%y").to_string()
}

/// `DDMMYY-HHMMSS-CAMID.jpg` for the given capture time and camera.
pub fn artifact_name(at: &NaiveDateTime, camera_id: &str) -> String {
    format!("{}-{}.jpg", at.format("%d%m%y-%H%M%S"), camera_id)
}

/// Recover the capture time from an artifact file name.
pub fn parse_artifact_time(name: &str) -> Option<NaiveDateTime> {
    let stamp = name.get(..13)?;
    NaiveDateTime::parse_from_str(stamp, "%d%m%y-%H%M%S").ok()
}

// ============ Time windows ============

/// A daily `[start, stop)` time-of-day window that may wrap past midnight.
///
/// `start == stop` is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub stop: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, stop: NaiveTime) -> Self {
        Self { start, stop }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start == self.stop {
            false
        } else if self.start < self.stop {
            t >= self.start && t < self.stop
        } else {
            t >= self.start || t < self.stop
        }
    }
}

/// A daily capture period, optionally with its own capture interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePeriod {
    pub window: TimeWindow,
    pub interval: Option<Duration>,
}

/// Whether capture should run at a given moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Inside a period; `interval` overrides the configured one.
    Active { interval: Option<Duration> },
    OutsideDates,
    OutsideWindow,
}

/// Calendar range plus daily periods during which the capture job works.
///
/// No periods means all day. `start_date` and `stop_date` are inclusive.
/// Where periods overlap the first listed wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSchedule {
    pub periods: Vec<CapturePeriod>,
    pub start_date: Option<NaiveDate>,
    pub stop_date: Option<NaiveDate>,
}

impl CaptureSchedule {
    pub fn activity_at(&self, at: NaiveDateTime) -> Activity {
        let day = at.date();
        if self.start_date.is_some_and(|d| day < d) || self.stop_date.is_some_and(|d| day > d) {
            return Activity::OutsideDates;
        }
        if self.periods.is_empty() {
            return Activity::Active { interval: None };
        }
        self.periods
            .iter()
            .find(|p| p.window.contains(at.time()))
            .map_or(Activity::OutsideWindow, |p| Activity::Active {
                interval: p.interval,
            })
    }
}

// ============ Jobs ============

/// The fixed job topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Capture,
    Archive,
    Upload,
    Control,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Capture,
        JobKind::Archive,
        JobKind::Upload,
        JobKind::Control,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Capture => "capture",
            JobKind::Archive => "archive",
            JobKind::Upload => "upload",
            JobKind::Control => "control",
        }
    }

    /// Field number used by the poll transport's status payload.
    pub fn field_id(&self) -> u8 {
        match self {
            JobKind::Capture => 1,
            JobKind::Archive => 2,
            JobKind::Upload => 3,
            JobKind::Control => 4,
        }
    }

    fn parse_alias(s: &str) -> Option<Self> {
        match s {
            "capture" | "cam" | "camera" => Some(JobKind::Capture),
            "archive" | "dir" | "local" => Some(JobKind::Archive),
            "upload" | "dbx" | "remote" => Some(JobKind::Upload),
            "control" | "rc" | "ctl" => Some(JobKind::Control),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============ Remote commands ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTarget {
    Job(JobKind),
    All,
}

impl CommandTarget {
    /// Jobs addressed by this target.
    pub fn jobs(&self) -> Vec<JobKind> {
        match self {
            CommandTarget::Job(kind) => vec![*kind],
            CommandTarget::All => JobKind::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandVerb {
    Pause,
    Resume,
    Rearm,
    ForceCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Poll,
    Push,
}

/// A control instruction from a remote operator, normalized across transports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteCommand {
    pub target: CommandTarget,
    pub verb: CommandVerb,
    pub arguments: Vec<String>,
    pub received_at: DateTime<Utc>,
    pub source: Transport,
}

impl RemoteCommand {
    /// Parse `target/verb[/arg...]`, e.g. `capture/pause` or `all/resume`.
    ///
    /// Older controllers send numeric codes instead of verb names:
    ///
    /// | Input | Meaning |
    /// |-------|---------|
    /// | `<job>/0` (stop) | pause |
    /// | `<job>/1` (pause) | pause |
    /// | `<job>/2` (init) | re-arm |
    /// | `<job>/3` (run) | resume |
    /// | `<job>/4`..`6` (reschedule, end of day, end) | rejected |
    /// | `sch/1`, `sch/0` | resume or pause every job |
    /// | `cmd/1`, `cmd/0` | rejected, commands are always accepted |
    pub fn parse(input: &str, source: Transport) -> Result<Self> {
        let normalized = input.trim().to_ascii_lowercase();
        let mut parts = normalized.split('/').map(str::trim);

        let target = match parts.next() {
            Some("all") | Some("*") => CommandTarget::All,
            Some("sch") => {
                let verb = match parts.next() {
                    Some("1") => CommandVerb::Resume,
                    Some("0") => CommandVerb::Pause,
                    _ => {
                        return Err(Error::Command(format!(
                            "'{}' expects sch/0 or sch/1",
                            input.trim()
                        )))
                    }
                };
                return Ok(Self::new(CommandTarget::All, verb, Vec::new(), source));
            }
            Some("cmd") => {
                return Err(Error::Command(
                    "command mode switch is not supported, commands are always accepted"
                        .to_string(),
                ))
            }
            Some(t) => JobKind::parse_alias(t)
                .map(CommandTarget::Job)
                .ok_or_else(|| Error::Command(format!("unknown target in '{}'", input.trim())))?,
            None => return Err(Error::Command("empty command".to_string())),
        };

        let verb = match parts.next() {
            Some("pause") => CommandVerb::Pause,
            Some("resume") => CommandVerb::Resume,
            Some("rearm") | Some("re-arm") => CommandVerb::Rearm,
            Some("force") | Some("force-cycle") | Some("force_cycle") | Some("run") => {
                CommandVerb::ForceCycle
            }
            Some("0") | Some("1") => CommandVerb::Pause,
            Some("2") => CommandVerb::Rearm,
            Some("3") => CommandVerb::Resume,
            Some(code @ ("4" | "5" | "6")) => {
                return Err(Error::Command(format!("command code {} is not supported", code)));
            }
            Some(other) => {
                return Err(Error::Command(format!("unknown verb '{}'", other)));
            }
            None => {
                return Err(Error::Command(format!(
                    "missing verb in '{}'",
                    input.trim()
                )));
            }
        };

        let arguments = parts.filter(|p| !p.is_empty()).map(String::from).collect();
        Ok(Self::new(target, verb, arguments, source))
    }

    fn new(
        target: CommandTarget,
        verb: CommandVerb,
        arguments: Vec<String>,
        source: Transport,
    ) -> Self {
        Self {
            target,
            verb,
            arguments,
            received_at: Utc::now(),
            source,
        }
    }
}

// ============ Status ============

/// Point-in-time view of every job, handed to each transport by value.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub taken_at: DateTime<Utc>,
    pub jobs: Vec<JobState>,
    pub dark: Option<DarkState>,
    pub queue: Option<QueueStats>,
}

impl StatusSnapshot {
    pub fn job(&self, kind: JobKind) -> Option<&JobState> {
        self.jobs.iter().find(|j| j.job == kind)
    }

    /// One-line summary, `capture:Idle ok=12 || upload:Degraded err=2 ...`.
    pub fn summary_line(&self) -> String {
        let mut parts: Vec<String> = self
            .jobs
            .iter()
            .map(|j| {
                let mut s = format!("{}:{:?}", j.job, j.status);
                if j.paused {
                    s.push_str("(paused)");
                }
                s.push_str(&format!(" ok={}", j.ok_count));
                if j.status != JobStatus::Idle && j.consecutive_errors > 0 {
                    s.push_str(&format!(" err={}", j.consecutive_errors));
                }
                if !j.detail.is_empty() {
                    s.push_str(&format!(" {}", j.detail));
                }
                s
            })
            .collect();
        if let Some(dark) = &self.dark {
            parts.push(if dark.is_dark { "dark" } else { "light" }.to_string());
        }
        parts.join(" || ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_artifact_naming() {
        let a = Artifact::new(Path::new("/data/img"), "CAM1", at(2024, 3, 5, 14, 3, 22));
        assert_eq!(a.name(), "050324-140322-CAM1.jpg");
        assert_eq!(a.day_bucket, "050324");
        assert_eq!(a.path, PathBuf::from("/data/img/050324/050324-140322-CAM1.jpg"));
        assert_eq!(a.remote_key("/images/"), "images/050324/050324-140322-CAM1.jpg");
        assert_eq!(a.remote_key(""), "050324/050324-140322-CAM1.jpg");
    }

    #[test]
    fn test_parse_artifact_time() {
        assert_eq!(
            parse_artifact_time("050324-140322-CAM1.jpg"),
            Some(at(2024, 3, 5, 14, 3, 22))
        );
        assert_eq!(parse_artifact_time("notes.txt"), None);
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        let w = TimeWindow::new(t(22, 0), t(5, 0));
        assert!(w.contains(t(23, 30)));
        assert!(w.contains(t(0, 0)));
        assert!(w.contains(t(22, 0)));
        assert!(!w.contains(t(5, 0)));
        assert!(!w.contains(t(6, 0)));

        let day = TimeWindow::new(t(6, 0), t(20, 0));
        assert!(day.contains(t(12, 0)));
        assert!(!day.contains(t(21, 0)));

        let empty = TimeWindow::new(t(6, 0), t(6, 0));
        assert!(!empty.contains(t(6, 0)));
    }

    #[test]
    fn test_parse_command() {
        let cmd = RemoteCommand::parse("capture/pause", Transport::Poll).unwrap();
        assert_eq!(cmd.target, CommandTarget::Job(JobKind::Capture));
        assert_eq!(cmd.verb, CommandVerb::Pause);
        assert!(cmd.arguments.is_empty());

        let cmd = RemoteCommand::parse(" DBX/Re-Arm ", Transport::Push).unwrap();
        assert_eq!(cmd.target, CommandTarget::Job(JobKind::Upload));
        assert_eq!(cmd.verb, CommandVerb::Rearm);
        assert_eq!(cmd.source, Transport::Push);

        let cmd = RemoteCommand::parse("all/force/now", Transport::Poll).unwrap();
        assert_eq!(cmd.target, CommandTarget::All);
        assert_eq!(cmd.verb, CommandVerb::ForceCycle);
        assert_eq!(cmd.arguments, vec!["now".to_string()]);
    }

    #[test]
    fn test_parse_command_rejects_garbage() {
        assert!(RemoteCommand::parse("", Transport::Poll).is_err());
        assert!(RemoteCommand::parse("capture", Transport::Poll).is_err());
        assert!(RemoteCommand::parse("toaster/pause", Transport::Poll).is_err());
        assert!(RemoteCommand::parse("capture/explode", Transport::Poll).is_err());
    }

    #[test]
    fn test_parse_numeric_command_codes() {
        let cmd = RemoteCommand::parse("cam/1", Transport::Poll).unwrap();
        assert_eq!(cmd.target, CommandTarget::Job(JobKind::Capture));
        assert_eq!(cmd.verb, CommandVerb::Pause);
        assert_eq!(
            RemoteCommand::parse("dbx/2", Transport::Poll).unwrap().verb,
            CommandVerb::Rearm
        );
        assert_eq!(
            RemoteCommand::parse("dir/3", Transport::Poll).unwrap().verb,
            CommandVerb::Resume
        );
        assert_eq!(
            RemoteCommand::parse("cam/0", Transport::Poll).unwrap().verb,
            CommandVerb::Pause
        );
        let err = RemoteCommand::parse("cam/5", Transport::Poll).unwrap_err();
        assert!(err.to_string().contains("not supported"));
        assert!(RemoteCommand::parse("cam/9", Transport::Poll).is_err());
    }

    #[test]
    fn test_parse_scheduler_and_mode_switches() {
        let cmd = RemoteCommand::parse("sch/0", Transport::Poll).unwrap();
        assert_eq!(cmd.target, CommandTarget::All);
        assert_eq!(cmd.verb, CommandVerb::Pause);
        let cmd = RemoteCommand::parse("sch/1", Transport::Push).unwrap();
        assert_eq!(cmd.verb, CommandVerb::Resume);
        assert_eq!(cmd.source, Transport::Push);
        assert!(RemoteCommand::parse("sch/7", Transport::Poll).is_err());
        assert!(RemoteCommand::parse("cmd/1", Transport::Poll).is_err());
    }

    #[test]
    fn test_capture_schedule_periods_and_dates() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        let schedule = CaptureSchedule {
            periods: vec![
                CapturePeriod {
                    window: TimeWindow::new(t(6, 0), t(12, 0)),
                    interval: Some(Duration::from_secs(30)),
                },
                CapturePeriod {
                    window: TimeWindow::new(t(12, 0), t(18, 0)),
                    interval: None,
                },
            ],
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            stop_date: NaiveDate::from_ymd_opt(2024, 3, 31),
        };
        assert_eq!(
            schedule.activity_at(at(2024, 3, 5, 7, 0, 0)),
            Activity::Active {
                interval: Some(Duration::from_secs(30))
            }
        );
        assert_eq!(
            schedule.activity_at(at(2024, 3, 5, 13, 0, 0)),
            Activity::Active { interval: None }
        );
        assert_eq!(
            schedule.activity_at(at(2024, 3, 5, 20, 0, 0)),
            Activity::OutsideWindow
        );
        assert_eq!(
            schedule.activity_at(at(2024, 3, 31, 7, 0, 0)),
            Activity::Active {
                interval: Some(Duration::from_secs(30))
            }
        );
        assert_eq!(
            schedule.activity_at(at(2024, 4, 1, 7, 0, 0)),
            Activity::OutsideDates
        );
        assert_eq!(
            CaptureSchedule::default().activity_at(at(2024, 4, 1, 3, 0, 0)),
            Activity::Active { interval: None }
        );
    }
}
