//! Durable record of uploaded artifacts.
//!
//! The log is a JSON-lines file, one `{"artifact": ..., "uploaded_at": ...}`
//! record per uploaded image. Records are buffered in memory and appended
//! by [`UploadLog::flush`], which the upload job calls on day rollover and
//! at the end of a capture sequence, and the orchestrator calls on shutdown.
//!
//! Every name already in the file is loaded on open, so an artifact is
//! recorded at most once across restarts. Records for day buckets that
//! retention has already deleted are dropped by [`UploadLog::forget_before`],
//! which rewrites the file in place.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::models::parse_artifact_time;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub artifact: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LogState {
    known: HashSet<String>,
    unflushed: Vec<UploadRecord>,
}

#[derive(Debug)]
pub struct UploadLog {
    path: PathBuf,
    state: Mutex<LogState>,
    /// Serializes appends against rewrites of the file.
    io: Mutex<()>,
}

/// Whether `artifact` was captured before `cutoff`. Names that do not parse
/// are kept.
fn captured_before(artifact: &str, cutoff: NaiveDate) -> bool {
    parse_artifact_time(artifact).is_some_and(|at| at.date() < cutoff)
}

impl UploadLog {
    /// Open the log at `path`, loading any records already written.
    pub fn open(path: &Path) -> Result<Self> {
        let mut known = HashSet::new();
        if path.exists() {
            let file = std::fs::File::open(path)?;
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<UploadRecord>(&line) {
                    Ok(record) => {
                        known.insert(record.artifact);
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = lineno + 1,
                            error = %e,
                            "Skipping malformed upload log line"
                        );
                    }
                }
            }
        }
        tracing::debug!(path = %path.display(), records = known.len(), "Upload log opened");
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LogState {
                known,
                unflushed: Vec::new(),
            }),
            io: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an upload. Returns `false` if `artifact` was already recorded.
    pub fn record(&self, artifact: &str, uploaded_at: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        if !state.known.insert(artifact.to_string()) {
            return false;
        }
        state.unflushed.push(UploadRecord {
            artifact: artifact.to_string(),
            uploaded_at,
        });
        true
    }

    pub fn contains(&self, artifact: &str) -> bool {
        self.lock().known.contains(artifact)
    }

    pub fn len(&self) -> usize {
        self.lock().known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unflushed_len(&self) -> usize {
        self.lock().unflushed.len()
    }

    /// Append buffered records to the file and sync it.
    ///
    /// On failure the records stay buffered for the next flush.
    pub fn flush(&self) -> Result<usize> {
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());
        let batch = std::mem::take(&mut self.lock().unflushed);
        if batch.is_empty() {
            return Ok(0);
        }
        match self.append(&batch) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), records = batch.len(), "Upload log flushed");
                Ok(batch.len())
            }
            Err(e) => {
                let mut state = self.lock();
                let newer = std::mem::replace(&mut state.unflushed, batch);
                state.unflushed.extend(newer);
                Err(e)
            }
        }
    }

    /// Drop every record for an image captured before `cutoff` and rewrite
    /// the file without them. Returns how many names were forgotten.
    pub fn forget_before(&self, cutoff: NaiveDate) -> Result<usize> {
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());
        let forgotten = {
            let mut state = self.lock();
            let before = state.known.len();
            state.known.retain(|name| !captured_before(name, cutoff));
            state.unflushed.retain(|r| !captured_before(&r.artifact, cutoff));
            before - state.known.len()
        };
        if forgotten == 0 || !self.path.exists() {
            return Ok(forgotten);
        }

        let file = std::fs::File::open(&self.path)?;
        let mut out = String::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            match serde_json::from_str::<UploadRecord>(&line) {
                Ok(record) if !captured_before(&record.artifact, cutoff) => {
                    out.push_str(&line);
                    out.push('\n');
                }
                _ => {}
            }
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(out.as_bytes())?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        tracing::info!(
            path = %self.path.display(),
            forgotten,
            cutoff = %cutoff,
            "Upload log compacted"
        );
        Ok(forgotten)
    }

    fn append(&self, records: &[UploadRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut out = String::new();
        for record in records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(out.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}
