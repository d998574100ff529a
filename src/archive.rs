//! Local archive job.
//!
//! Consumes artifacts from the hand-off queue, confirms each image landed
//! on disk, keeps a per-day index, and enforces the retention policy on the
//! image directory:
//!
//! - `keep_days`: day folders (`DDMMYY`) older than N days are removed.
//!   With `prune_uploaded_only` and an upload log, images missing from the
//!   log survive and so does their folder. Log records for removed days
//!   are forgotten.
//! - `max_images`: the oldest images beyond the cap are deleted. With
//!   `prune_uploaded_only` and an upload log, only images recorded in the
//!   log are eligible.
//!
//! Retention walks the file system, so it runs on the blocking pool.

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::Config;
use crate::counters::JobHandle;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::models::{parse_artifact_time, Artifact, JobKind};
use crate::pending::{PendingEntry, PendingList};
use crate::queue::{ConsumerId, HandoffQueue};
use crate::shutdown::Shutdown;
use crate::upload_log::UploadLog;

/// Images archived for one day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayIndex {
    pub images: u64,
    pub bytes: u64,
    pub last: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    pub keep_days: Option<u32>,
    pub max_images: Option<usize>,
    pub prune_uploaded_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub days_removed: usize,
    pub images_removed: usize,
}

pub struct LocalArchiveJob {
    image_dir: PathBuf,
    queue: Arc<HandoffQueue>,
    consumer: ConsumerId,
    handle: JobHandle,
    pending: PendingList,
    batch_size: usize,
    retention: RetentionPolicy,
    upload_log: Option<Arc<UploadLog>>,
    index: BTreeMap<String, DayIndex>,
}

impl LocalArchiveJob {
    pub fn new(
        config: &Config,
        queue: Arc<HandoffQueue>,
        consumer: ConsumerId,
        handle: JobHandle,
        upload_log: Option<Arc<UploadLog>>,
    ) -> Self {
        let cfg = &config.archive;
        Self {
            image_dir: config.camera.image_dir.clone(),
            queue,
            consumer,
            handle,
            pending: PendingList::new(cfg.max_attempts),
            batch_size: cfg.batch_size.max(1),
            retention: RetentionPolicy {
                keep_days: cfg.keep_days,
                max_images: cfg.max_images,
                prune_uploaded_only: cfg.prune_uploaded_only,
            },
            upload_log,
            index: BTreeMap::new(),
        }
    }

    pub fn day_index(&self) -> &BTreeMap<String, DayIndex> {
        &self.index
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn archive_one(&mut self, artifact: &Artifact) -> Result<()> {
        let meta = std::fs::metadata(&artifact.path).map_err(|e| {
            Error::Archive(format!("{} missing: {}", artifact.path.display(), e))
        })?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(Error::Archive(format!(
                "{} is empty or not a file",
                artifact.path.display()
            )));
        }
        let day = self.index.entry(artifact.day_bucket.clone()).or_default();
        day.images += 1;
        day.bytes += meta.len();
        day.last = Some(artifact.name());
        tracing::debug!(artifact = %artifact.name(), bytes = meta.len(), "Archived image");
        Ok(())
    }
}

#[async_trait]
impl Job for LocalArchiveJob {
    fn kind(&self) -> JobKind {
        JobKind::Archive
    }

    async fn run_cycle(&mut self, shutdown: &Shutdown) -> Result<()> {
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
        let mut archived = 0u64;
        let mut failures = Vec::new();
        while let Some(entry) = batch.pop_front() {
            if shutdown.is_requested() {
                batch.push_front(entry);
                self.pending.restore(batch.into());
                return Err(Error::Cancelled);
            }
            match self.archive_one(&entry.artifact) {
                Ok(()) => archived += 1,
                Err(e) => {
                    let name = entry.artifact.name();
                    failures.push(format!("{}: {}", name, e));
                    if let Some(dead) = self.pending.record_failure(entry, e.to_string()) {
                        self.handle.bump("failed_permanently", 1);
                        tracing::error!(
                            artifact = %name,
                            attempts = dead.attempts,
                            error = %e,
                            "Giving up on archiving image"
                        );
                    }
                }
            }
        }
        self.handle.bump("archived", archived);

        let today = Local::now().date_naive();
        let image_dir = self.image_dir.clone();
        let policy = self.retention.clone();
        let log = self.upload_log.clone();
        let retention = tokio::task::spawn_blocking(move || {
            enforce_retention(&image_dir, &policy, today, log.as_deref())
        })
        .await
        .map_err(|e| Error::Archive(format!("retention task: {}", e)))
        .and_then(|r| r);
        match retention {
            Ok(report) => {
                self.handle.bump("pruned", report.images_removed as u64);
                self.handle.bump("days_removed", report.days_removed as u64);
            }
            Err(e) => failures.push(format!("retention: {}", e)),
        }

        let today_count = self
            .index
            .get(&crate::models::day_bucket(&Local::now().naive_local()))
            .map(|d| d.images)
            .unwrap_or(0);
        self.handle.set_detail(format!(
            "today={} pending={}",
            today_count,
            self.pending.len()
        ));

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Archive(format!(
                "{} of {} failed; first: {}",
                failures.len(),
                total.max(failures.len()),
                failures[0]
            )))
        }
    }
}

/// Apply `policy` to `image_dir`.
pub fn enforce_retention(
    image_dir: &Path,
    policy: &RetentionPolicy,
    today: NaiveDate,
    uploaded: Option<&UploadLog>,
) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();
    if !image_dir.is_dir() {
        return Ok(report);
    }

    if let Some(keep_days) = policy.keep_days {
        let cutoff = today - chrono::Duration::days(i64::from(keep_days));
        for entry in std::fs::read_dir(image_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(day) = NaiveDate::parse_from_str(&name, "%d%m%y") else {
                continue;
            };
            if day >= cutoff {
                continue;
            }
            match (policy.prune_uploaded_only, uploaded) {
                (true, Some(log)) => {
                    let (removed, kept) = prune_expired_day(&entry.path(), log)?;
                    report.images_removed += removed;
                    if kept == 0 {
                        std::fs::remove_dir(entry.path())
                            .map_err(|e| Error::Archive(format!("remove {}: {}", name, e)))?;
                        tracing::info!(day = %name, "Removed expired day folder");
                        report.days_removed += 1;
                    } else {
                        tracing::warn!(
                            day = %name,
                            kept,
                            "Keeping expired day folder with images not yet uploaded"
                        );
                    }
                }
                _ => {
                    std::fs::remove_dir_all(entry.path())
                        .map_err(|e| Error::Archive(format!("remove {}: {}", name, e)))?;
                    tracing::info!(day = %name, "Removed expired day folder");
                    report.days_removed += 1;
                }
            }
        }
        if let Some(log) = uploaded {
            log.forget_before(cutoff)?;
        }
    }

    if let Some(max_images) = policy.max_images {
        let mut images: Vec<(chrono::NaiveDateTime, PathBuf, String)> = WalkDir::new(image_dir)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if !name.ends_with(".jpg") {
                    return None;
                }
                parse_artifact_time(&name).map(|at| (at, e.into_path(), name))
            })
            .collect();

        if images.len() > max_images {
            images.sort();
            let mut excess = images.len() - max_images;
            for (_, path, name) in images {
                if excess == 0 {
                    break;
                }
                if let (true, Some(log)) = (policy.prune_uploaded_only, uploaded) {
                    if !log.contains(&name) {
                        continue;
                    }
                }
                std::fs::remove_file(&path)
                    .map_err(|e| Error::Archive(format!("remove {}: {}", name, e)))?;
                report.images_removed += 1;
                excess -= 1;
                if let Some(parent) = path.parent() {
                    if parent != image_dir {
                        // Fails while the folder still has images.
                        let _ = std::fs::remove_dir(parent);
                    }
                }
            }
            if report.images_removed > 0 {
                tracing::info!(removed = report.images_removed, max_images, "Pruned old images");
            }
        }
    }

    Ok(report)
}

/// Delete everything in an expired day folder except images missing from
/// the upload log. Returns `(removed, kept)` image counts.
fn prune_expired_day(day_dir: &Path, log: &UploadLog) -> Result<(usize, usize)> {
    let mut removed = 0;
    let mut kept = 0;
    for entry in WalkDir::new(day_dir).min_depth(1).contents_first(true) {
        let entry = entry.map_err(|e| Error::Archive(e.to_string()))?;
        let path = entry.path();
        if entry.file_type().is_dir() {
            // Fails while the folder still holds kept images.
            let _ = std::fs::remove_dir(path);
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let is_image = name.ends_with(".jpg");
        if is_image && !log.contains(&name) {
            tracing::debug!(artifact = %name, "Expired image not uploaded, keeping");
            kept += 1;
            continue;
        }
        std::fs::remove_file(path)
            .map_err(|e| Error::Archive(format!("remove {}: {}", path.display(), e)))?;
        if is_image {
            tracing::debug!(artifact = %name, "Removed expired uploaded image");
            removed += 1;
        }
    }
    Ok((removed, kept))
}
