//! Per-job telemetry registry.
//!
//! [`EventCounters`] is created once by the orchestrator and shared by
//! reference with every job. Each job owns exactly one entry through its
//! [`JobHandle`]; the control channel reads all entries to build a
//! [`StatusSnapshot`]. Entries are independently locked, so a job updating
//! its own state never contends with another job.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::dark::DarkState;
use crate::error::{Error, Result};
use crate::job::{JobState, JobStatus, RetryPolicy};
use crate::models::{JobKind, StatusSnapshot};
use crate::queue::QueueStats;

type Entry = Arc<Mutex<JobState>>;

/// Shared registry of [`JobState`] records, keyed by job.
#[derive(Debug, Default)]
pub struct EventCounters {
    entries: RwLock<BTreeMap<JobKind, Entry>>,
    dark: RwLock<Option<DarkState>>,
}

impl EventCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for `kind` and return its single writer.
    pub fn register(&self, kind: JobKind, policy: RetryPolicy) -> Result<JobHandle> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&kind) {
            return Err(Error::Invariant(format!("job '{}' registered twice", kind)));
        }
        let entry = Arc::new(Mutex::new(JobState::new(kind)));
        entries.insert(kind, entry.clone());
        Ok(JobHandle {
            kind,
            policy,
            entry,
        })
    }

    /// Copy of one job's state.
    pub fn get(&self, kind: JobKind) -> Option<JobState> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&kind).map(|e| lock(e).clone())
    }

    pub fn jobs(&self) -> Vec<JobKind> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.keys().copied().collect()
    }

    pub fn set_dark(&self, state: DarkState) {
        *self.dark.write().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    pub fn dark(&self) -> Option<DarkState> {
        self.dark.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self, device_id: &str, queue: Option<QueueStats>) -> StatusSnapshot {
        let jobs = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries.values().map(|e| lock(e).clone()).collect()
        };
        StatusSnapshot {
            device_id: device_id.to_string(),
            taken_at: Utc::now(),
            jobs,
            dark: self.dark(),
            queue,
        }
    }

    pub fn mark_all_stopped(&self) {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values() {
            lock(entry).stop();
        }
    }
}

fn lock(entry: &Entry) -> MutexGuard<'_, JobState> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Writer for one job's entry. Cloning is cheap; only the owning job and
/// its scheduler hold one.
#[derive(Debug, Clone)]
pub struct JobHandle {
    kind: JobKind,
    policy: RetryPolicy,
    entry: Entry,
}

impl JobHandle {
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn state(&self) -> JobState {
        lock(&self.entry).clone()
    }

    pub fn status(&self) -> JobStatus {
        lock(&self.entry).status
    }

    pub fn consecutive_errors(&self) -> u32 {
        lock(&self.entry).consecutive_errors
    }

    pub fn is_parked(&self) -> bool {
        lock(&self.entry).is_parked()
    }

    pub fn begin_cycle(&self) {
        lock(&self.entry).begin(Utc::now());
    }

    pub fn record_success(&self) {
        lock(&self.entry).succeed();
    }

    /// Fold a cycle error into the state; returns the resulting status.
    pub fn record_failure(&self, err: &Error) -> JobStatus {
        let mut state = lock(&self.entry);
        state.fail(err.to_string(), self.policy.failure_threshold);
        state.status
    }

    pub fn record_interrupted(&self) {
        lock(&self.entry).interrupt();
    }

    pub fn set_paused(&self, paused: bool) {
        lock(&self.entry).paused = paused;
    }

    pub fn rearm(&self) {
        lock(&self.entry).rearm();
    }

    pub fn mark_stopped(&self) {
        lock(&self.entry).stop();
    }

    pub fn set_detail(&self, detail: impl Into<String>) {
        lock(&self.entry).detail = detail.into();
    }

    pub fn bump(&self, event: &str, n: u64) {
        if n > 0 {
            lock(&self.entry).bump(event, n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice_is_invariant_error() {
        let counters = EventCounters::new();
        counters
            .register(JobKind::Capture, RetryPolicy::default())
            .unwrap();
        let err = counters
            .register(JobKind::Capture, RetryPolicy::default())
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_handle_updates_visible_in_snapshot() {
        let counters = EventCounters::new();
        let policy = RetryPolicy::new(2, 2.0, std::time::Duration::from_secs(60));
        let capture = counters.register(JobKind::Capture, policy).unwrap();
        let upload = counters.register(JobKind::Upload, policy).unwrap();

        capture.begin_cycle();
        capture.bump("captured", 1);
        capture.record_success();

        upload.begin_cycle();
        upload.record_failure(&Error::Upload("503".into()));
        upload.begin_cycle();
        let status = upload.record_failure(&Error::Upload("503".into()));
        assert_eq!(status, JobStatus::Failed);

        let snap = counters.snapshot("CAM1", None);
        assert_eq!(snap.device_id, "CAM1");
        assert_eq!(snap.jobs.len(), 2);
        let cap = snap.job(JobKind::Capture).unwrap();
        assert_eq!(cap.ok_count, 1);
        assert_eq!(cap.event("captured"), 1);
        let up = snap.job(JobKind::Upload).unwrap();
        assert_eq!(up.status, JobStatus::Failed);
        assert_eq!(up.last_error.as_deref(), Some("Upload error: 503"));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let counters = EventCounters::new();
        let h = counters
            .register(JobKind::Archive, RetryPolicy::default())
            .unwrap();
        let before = counters.snapshot("dev", None);
        h.begin_cycle();
        h.record_success();
        assert_eq!(before.job(JobKind::Archive).unwrap().ok_count, 0);
        assert_eq!(counters.get(JobKind::Archive).unwrap().ok_count, 1);
    }

    #[test]
    fn test_mark_all_stopped() {
        let counters = EventCounters::new();
        let a = counters
            .register(JobKind::Archive, RetryPolicy::default())
            .unwrap();
        let c = counters
            .register(JobKind::Control, RetryPolicy::default())
            .unwrap();
        a.begin_cycle();
        counters.mark_all_stopped();
        assert_eq!(a.status(), JobStatus::Stopped);
        assert_eq!(c.status(), JobStatus::Stopped);
    }

    #[test]
    fn test_concurrent_writers_do_not_interfere() {
        let counters = Arc::new(EventCounters::new());
        let mut threads = Vec::new();
        for kind in JobKind::ALL {
            let handle = counters.register(kind, RetryPolicy::default()).unwrap();
            threads.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    handle.begin_cycle();
                    handle.bump("ticks", 1);
                    handle.record_success();
                }
            }));
        }
        let reader = {
            let counters = counters.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let snap = counters.snapshot("dev", None);
                    assert!(snap.jobs.len() <= 4);
                }
            })
        };
        for t in threads {
            t.join().unwrap();
        }
        reader.join().unwrap();
        for kind in JobKind::ALL {
            let s = counters.get(kind).unwrap();
            assert_eq!(s.ok_count, 500);
            assert_eq!(s.event("ticks"), 500);
        }
    }
}
