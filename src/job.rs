//! Job life-cycle state machine and retry policy.
//!
//! Every periodic job (capture, archive, upload, control) runs discrete
//! cycles. A cycle moves the job's [`JobState`] through:
//!
//! ```text
//!              begin                succeed
//!   Idle ───────────────▶ Running ───────────▶ Idle
//!   Degraded ───────────▶    │
//!                            │ fail
//!                            ▼
//!            consecutive_errors < threshold ──▶ Degraded
//!            consecutive_errors ≥ threshold ──▶ Failed   (parked until rearm)
//! ```
//!
//! [`RetryPolicy::next_delay`] stretches the interval between cycles while a
//! job keeps failing and snaps back to the nominal interval after one
//! success. `Stopped` is set by the orchestrator at shutdown.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;
use crate::models::JobKind;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Idle,
    Running,
    Degraded,
    Failed,
    Stopped,
}

impl JobStatus {
    /// Numeric code published on the poll transport.
    pub fn code(&self) -> u8 {
        match self {
            JobStatus::Idle => 0,
            JobStatus::Running => 1,
            JobStatus::Degraded => 2,
            JobStatus::Failed => 3,
            JobStatus::Stopped => 4,
        }
    }
}

/// Per-job telemetry record.
#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    pub job: JobKind,
    pub status: JobStatus,
    pub paused: bool,
    pub run_count: u64,
    pub ok_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Short human-readable status line set by the job.
    pub detail: String,
    /// Job-specific event counters (`captured`, `dropped`, `uploaded`, ...).
    pub events: BTreeMap<String, u64>,
}

impl JobState {
    pub fn new(job: JobKind) -> Self {
        Self {
            job,
            status: JobStatus::Idle,
            paused: false,
            run_count: 0,
            ok_count: 0,
            error_count: 0,
            consecutive_errors: 0,
            last_run_at: None,
            last_error: None,
            detail: String::new(),
            events: BTreeMap::new(),
        }
    }

    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.run_count += 1;
        self.last_run_at = Some(now);
    }

    pub fn succeed(&mut self) {
        self.status = JobStatus::Idle;
        self.consecutive_errors = 0;
        self.ok_count += 1;
    }

    pub fn fail(&mut self, message: impl Into<String>, threshold: u32) {
        self.error_count += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error = Some(message.into());
        self.status = if self.consecutive_errors >= threshold {
            JobStatus::Failed
        } else {
            JobStatus::Degraded
        };
    }

    /// Cycle abandoned at a shutdown checkpoint; counts neither way.
    pub fn interrupt(&mut self) {
        self.status = JobStatus::Stopped;
    }

    /// Clear a failure so the job is scheduled again.
    pub fn rearm(&mut self) {
        if self.status != JobStatus::Stopped {
            self.status = JobStatus::Idle;
        }
        self.consecutive_errors = 0;
    }

    pub fn stop(&mut self) {
        self.status = JobStatus::Stopped;
    }

    /// Failed or paused jobs are not scheduled.
    pub fn is_parked(&self) -> bool {
        self.paused || self.status == JobStatus::Failed
    }

    /// Poll transport status code: status plus 16 when paused.
    pub fn status_code(&self) -> u8 {
        self.status.code() + if self.paused { 16 } else { 0 }
    }

    pub fn bump(&mut self, event: &str, n: u64) {
        *self.events.entry(event.to_string()).or_insert(0) += n;
    }

    pub fn event(&self, event: &str) -> u64 {
        self.events.get(event).copied().unwrap_or(0)
    }
}

// ============ Retry policy ============

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failures that turn Degraded into Failed.
    pub failure_threshold: u32,
    /// Multiplier per consecutive failure, `>= 1.0`.
    pub backoff_factor: f64,
    /// Cap on the backed-off delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(failure_threshold: u32, backoff_factor: f64, max_delay: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            backoff_factor: if backoff_factor.is_finite() {
                backoff_factor.max(1.0)
            } else {
                1.0
            },
            max_delay,
        }
    }

    pub fn from_config(cfg: &crate::config::RetryConfig) -> Self {
        Self::new(
            cfg.failure_threshold,
            cfg.backoff_factor,
            Duration::from_secs(cfg.max_backoff_secs),
        )
    }

    /// Same backoff, but the job never reaches Failed.
    pub fn never_fail(self) -> Self {
        Self {
            failure_threshold: u32::MAX,
            ..self
        }
    }

    /// Delay before the next cycle after `consecutive_errors` failures in a row.
    pub fn next_delay(&self, nominal: Duration, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return nominal;
        }
        let exponent = consecutive_errors.min(i32::MAX as u32) as i32;
        let secs = nominal.as_secs_f64() * self.backoff_factor.powi(exponent);
        let backed_off = if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        };
        backed_off.max(nominal)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 2.0, Duration::from_secs(900))
    }
}

// ============ Job trait ============

/// A periodic job driven by the orchestrator.
///
/// `run_cycle` performs one cycle. It should call
/// [`Shutdown::checkpoint`] between its discrete steps and return
/// [`Error::Cancelled`](crate::error::Error::Cancelled) when asked to stop.
/// Any other error is folded into the job's state by the caller.
#[async_trait]
pub trait Job: Send {
    fn kind(&self) -> JobKind;

    async fn run_cycle(&mut self, shutdown: &Shutdown) -> Result<()>;

    /// Interval to the next cycle when it differs from the configured one.
    /// Read after every cycle.
    fn interval_hint(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_resets_consecutive_errors() {
        let mut s = JobState::new(JobKind::Upload);
        s.begin(Utc::now());
        s.fail("timeout", 3);
        assert_eq!(s.status, JobStatus::Degraded);
        s.begin(Utc::now());
        s.succeed();
        assert_eq!(s.status, JobStatus::Idle);
        assert_eq!(s.consecutive_errors, 0);
        assert_eq!(s.ok_count, 1);
        assert_eq!(s.error_count, 1);
        assert_eq!(s.run_count, 2);
    }

    #[test]
    fn test_degraded_never_exceeds_threshold() {
        let threshold = 4;
        let mut s = JobState::new(JobKind::Capture);
        for _ in 0..10 {
            s.begin(Utc::now());
            s.fail("camera busy", threshold);
            if s.status == JobStatus::Degraded {
                assert!(s.consecutive_errors < threshold);
            }
            if s.consecutive_errors >= threshold {
                assert_eq!(s.status, JobStatus::Failed);
            }
        }
        assert_eq!(s.status, JobStatus::Failed);
        assert!(s.is_parked());
    }

    #[test]
    fn test_threshold_crossing_fails_in_one_cycle() {
        let mut s = JobState::new(JobKind::Archive);
        s.fail("a", 2);
        assert_eq!(s.status, JobStatus::Degraded);
        s.fail("b", 2);
        assert_eq!(s.status, JobStatus::Failed);
        assert_eq!(s.last_error.as_deref(), Some("b"));
    }

    #[test]
    fn test_rearm_clears_failure() {
        let mut s = JobState::new(JobKind::Upload);
        s.fail("x", 1);
        assert_eq!(s.status, JobStatus::Failed);
        s.rearm();
        assert_eq!(s.status, JobStatus::Idle);
        assert_eq!(s.consecutive_errors, 0);
        assert!(!s.is_parked());
    }

    #[test]
    fn test_status_code_includes_pause_flag() {
        let mut s = JobState::new(JobKind::Capture);
        s.fail("x", 5);
        assert_eq!(s.status_code(), 2);
        s.paused = true;
        assert_eq!(s.status_code(), 18);
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let policy = RetryPolicy::new(100, 2.0, Duration::from_secs(60));
        let nominal = Duration::from_secs(5);
        let mut last = Duration::ZERO;
        for n in 0..40 {
            let d = policy.next_delay(nominal, n);
            assert!(d >= last, "delay decreased at {} failures", n);
            assert!(d <= Duration::from_secs(60));
            last = d;
        }
        assert_eq!(policy.next_delay(nominal, 1), Duration::from_secs(10));
        assert_eq!(policy.next_delay(nominal, 3), Duration::from_secs(40));
        assert_eq!(policy.next_delay(nominal, 4), Duration::from_secs(60));
        assert_eq!(policy.next_delay(nominal, u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_resets_after_one_success() {
        let policy = RetryPolicy::default();
        let nominal = Duration::from_secs(30);
        let mut s = JobState::new(JobKind::Upload);
        for _ in 0..3 {
            s.fail("offline", policy.failure_threshold);
        }
        assert!(policy.next_delay(nominal, s.consecutive_errors) > nominal);
        s.succeed();
        assert_eq!(policy.next_delay(nominal, s.consecutive_errors), nominal);
    }

    #[test]
    fn test_nominal_above_cap_is_kept() {
        let policy = RetryPolicy::new(3, 2.0, Duration::from_secs(10));
        let nominal = Duration::from_secs(60);
        assert_eq!(policy.next_delay(nominal, 2), nominal);
    }

    #[test]
    fn test_never_fail_policy() {
        let policy = RetryPolicy::default().never_fail();
        let mut s = JobState::new(JobKind::Control);
        for _ in 0..1000 {
            s.fail("unreachable", policy.failure_threshold);
        }
        assert_eq!(s.status, JobStatus::Degraded);
    }
}
