//! Retry bookkeeping for queue consumers.
//!
//! Items popped from the hand-off queue belong to the consumer from then on.
//! An item that fails is parked here and retried at the start of later
//! cycles until it has used `max_attempts`, after which the consumer gives
//! up on it and reports it.

use std::collections::VecDeque;

use crate::models::Artifact;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub artifact: Artifact,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl PendingEntry {
    pub fn new(artifact: Artifact) -> Self {
        Self {
            artifact,
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug)]
pub struct PendingList {
    entries: VecDeque<PendingEntry>,
    max_attempts: u32,
}

impl PendingList {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove up to `n` entries from the front, oldest first.
    pub fn take(&mut self, n: usize) -> Vec<PendingEntry> {
        let n = n.min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    /// Put untried entries back at the front, keeping their order.
    pub fn restore(&mut self, entries: Vec<PendingEntry>) {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    /// Count a failed attempt. Returns the entry when it has no attempts
    /// left; otherwise it goes to the back of the list.
    pub fn record_failure(
        &mut self,
        mut entry: PendingEntry,
        error: impl Into<String>,
    ) -> Option<PendingEntry> {
        entry.attempts += 1;
        entry.last_error = Some(error.into());
        if entry.attempts >= self.max_attempts {
            Some(entry)
        } else {
            self.entries.push_back(entry);
            None
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.artifact.name()).collect()
    }
}
