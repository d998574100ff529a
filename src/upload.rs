//! Remote upload job.
//!
//! Consumes artifacts from the hand-off queue and copies each one to the
//! configured [`RemoteStore`] under `<remote_root>/<DDMMYY>/<name>`.
//! Artifacts already present in the [`UploadLog`] are skipped, which makes
//! a restart resume where the previous run stopped. After each batch the
//! newest uploaded image is also written under the fixed snapshot name.
//!
//! The log is flushed when the day changes and when the capture job
//! signals the end of its daily sequence.

use async_trait::async_trait;
use chrono::{Local, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::counters::JobHandle;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::models::{day_bucket, Artifact, JobKind};
use crate::pending::{PendingEntry, PendingList};
use crate::queue::{ConsumerId, HandoffQueue};
use crate::shutdown::Shutdown;
use crate::storage::RemoteStore;
use crate::upload_log::UploadLog;

pub struct RemoteUploadJob {
    store: Arc<dyn RemoteStore>,
    queue: Arc<HandoffQueue>,
    consumer: ConsumerId,
    handle: JobHandle,
    log: Arc<UploadLog>,
    pending: PendingList,
    batch_size: usize,
    remote_root: String,
    snapshot_name: Option<String>,
    timeout: Duration,
    current_day: Option<String>,
}

impl RemoteUploadJob {
    pub fn new(
        config: &Config,
        store: Arc<dyn RemoteStore>,
        queue: Arc<HandoffQueue>,
        consumer: ConsumerId,
        handle: JobHandle,
        log: Arc<UploadLog>,
    ) -> Self {
        let cfg = &config.upload;
        Self {
            store,
            queue,
            consumer,
            handle,
            log,
            pending: PendingList::new(cfg.max_attempts),
            batch_size: cfg.batch_size.max(1),
            remote_root: cfg.remote_root.clone(),
            snapshot_name: cfg.snapshot_name.clone().filter(|s| !s.is_empty()),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            current_day: None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    async fn upload_one(&self, artifact: &Artifact) -> Result<()> {
        let key = artifact.remote_key(&self.remote_root);
        tokio::time::timeout(self.timeout, self.store.upload(&artifact.path, &key))
            .await
            .map_err(|_| Error::Upload(format!("{} timed out after {:?}", key, self.timeout)))??;
        tracing::info!(artifact = %artifact.name(), remote = %key, store = self.store.name(), "Uploaded image");
        Ok(())
    }

    async fn upload_snapshot(&self, artifact: &Artifact) {
        let Some(name) = self.snapshot_name.as_deref() else {
            return;
        };
        let res = tokio::time::timeout(
            self.timeout,
            self.store.upload_snapshot(&artifact.path, name),
        )
        .await;
        match res {
            Ok(Ok(())) => tracing::debug!(snapshot = name, source = %artifact.name(), "Snapshot updated"),
            Ok(Err(e)) => tracing::warn!(snapshot = name, error = %e, "Snapshot upload failed"),
            Err(_) => tracing::warn!(snapshot = name, "Snapshot upload timed out"),
        }
    }

    fn flush_log(&self, reason: &str) {
        match self.log.flush() {
            Ok(0) => {}
            Ok(n) => tracing::debug!(records = n, reason, "Upload log flushed"),
            Err(e) => tracing::warn!(error = %e, reason, "Upload log flush failed, will retry"),
        }
    }
}

#[async_trait]
impl Job for RemoteUploadJob {
    fn kind(&self) -> JobKind {
        JobKind::Upload
    }

    async fn run_cycle(&mut self, shutdown: &Shutdown) -> Result<()> {
        let today = day_bucket(&Local::now().naive_local());
        if self.current_day.as_deref().is_some_and(|d| d != today) {
            self.flush_log("day rollover");
        }
        self.current_day = Some(today);

        let mut batch: VecDeque<PendingEntry> = self.pending.take(self.batch_size).into();
        while batch.len() < self.batch_size {
            match self.queue.pop(self.consumer) {
                Ok(artifact) => batch.push_back(PendingEntry::new(artifact)),
                Err(Error::EmptyQueue) => break,
                Err(e) => {
                    self.pending.restore(batch.into());
                    return Err(e);
                }
            }
        }

        let total = batch.len();
        let mut uploaded = 0u64;
        let mut skipped = 0u64;
        let mut newest: Option<Artifact> = None;
        let mut failures = Vec::new();
        while let Some(entry) = batch.pop_front() {
            if shutdown.is_requested() {
                batch.push_front(entry);
                self.pending.restore(batch.into());
                return Err(Error::Cancelled);
            }
            let name = entry.artifact.name();
            if self.log.contains(&name) {
                skipped += 1;
                continue;
            }
            match self.upload_one(&entry.artifact).await {
                Ok(()) => {
                    self.log.record(&name, Utc::now());
                    uploaded += 1;
                    if newest
                        .as_ref()
                        .map_or(true, |n| entry.artifact.captured_at >= n.captured_at)
                    {
                        newest = Some(entry.artifact);
                    }
                }
                Err(e) => {
                    failures.push(format!("{}: {}", name, e));
                    if let Some(dead) = self.pending.record_failure(entry, e.to_string()) {
                        self.handle.bump("failed_permanently", 1);
                        tracing::error!(
                            artifact = %name,
                            attempts = dead.attempts,
                            error = %e,
                            "Giving up on uploading image"
                        );
                    } else {
                        tracing::warn!(artifact = %name, error = %e, "Upload failed, will retry");
                    }
                }
            }
        }
        self.handle.bump("uploaded", uploaded);
        self.handle.bump("skipped", skipped);

        if let Some(artifact) = newest.as_ref() {
            self.upload_snapshot(artifact).await;
        }

        if self.queue.take_sequence_end(self.consumer) {
            self.flush_log("end of capture sequence");
        }

        self.handle.set_detail(format!(
            "logged={} pending={} unflushed={}",
            self.log.len(),
            self.pending.len(),
            self.log.unflushed_len()
        ));

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Upload(format!(
                "{} of {} failed; first: {}",
                failures.len(),
                total,
                failures[0]
            )))
        }
    }
}
