//! Bounded hand-off queue between the capture job and its consumers.
//!
//! The queue holds [`Artifact`]s in capture order. Each consumer registers
//! once and gets its own cursor, so the archive job and the upload job each
//! see every artifact exactly once without competing for it. An artifact is
//! retained until the slowest cursor has moved past it; capacity counts
//! retained artifacts.
//!
//! When the queue is full the configured [`OverflowPolicy`] applies:
//!
//! | Policy | Behavior | Accounting |
//! |--------|----------|------------|
//! | `DropOldest` | evict the head, accept the new artifact | `dropped`, per consumer that missed it |
//! | `Block` | wait for space up to a timeout, then reject | `rejected` |
//!
//! `pop` never waits: consumers run on their own schedule and get
//! [`Error::EmptyQueue`] when caught up.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::models::Artifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    Block { timeout: Duration },
}

impl OverflowPolicy {
    pub fn from_config(cfg: &QueueConfig) -> Self {
        match cfg.overflow.as_str() {
            "block" => OverflowPolicy::Block {
                timeout: Duration::from_millis(cfg.block_timeout_ms),
            },
            _ => OverflowPolicy::DropOldest,
        }
    }
}

/// Handle returned by [`HandoffQueue::register_consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerId(usize);

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Accepted,
    /// Accepted after evicting this artifact from the head.
    Evicted(Artifact),
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStats {
    pub name: String,
    pub pending: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub retained: usize,
    pub pushed: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub consumers: Vec<ConsumerStats>,
}

#[derive(Debug)]
struct Cursor {
    name: String,
    /// Sequence number of the next artifact to deliver.
    next: u64,
    delivered: u64,
    dropped: u64,
    sequence_end: bool,
}

#[derive(Debug, Default)]
struct Inner {
    buf: VecDeque<Artifact>,
    /// Sequence number of `buf[0]`.
    head_seq: u64,
    cursors: Vec<Cursor>,
    pushed: u64,
    dropped: u64,
    rejected: u64,
}

impl Inner {
    fn tail_seq(&self) -> u64 {
        self.head_seq + self.buf.len() as u64
    }

    fn cursor(&mut self, id: ConsumerId) -> Result<&mut Cursor> {
        self.cursors
            .get_mut(id.0)
            .ok_or_else(|| Error::Invariant(format!("unknown queue consumer #{}", id.0)))
    }

    /// Release artifacts every cursor has moved past. Returns how many.
    fn trim(&mut self) -> usize {
        let min_next = self
            .cursors
            .iter()
            .map(|c| c.next)
            .min()
            .unwrap_or_else(|| self.tail_seq());
        let mut released = 0;
        while self.head_seq < min_next && !self.buf.is_empty() {
            self.buf.pop_front();
            self.head_seq += 1;
            released += 1;
        }
        released
    }

    fn evict_head(&mut self) -> Option<Artifact> {
        let evicted = self.buf.pop_front()?;
        self.head_seq += 1;
        let head = self.head_seq;
        for c in self.cursors.iter_mut().filter(|c| c.next < head) {
            c.next = head;
            c.dropped += 1;
        }
        self.dropped += 1;
        Some(evicted)
    }
}

/// FIFO of captured artifacts with one cursor per consumer.
#[derive(Debug)]
pub struct HandoffQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: OverflowPolicy,
    space: Notify,
}

impl HandoffQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            policy,
            space: Notify::new(),
        }
    }

    pub fn from_config(cfg: &QueueConfig) -> Self {
        Self::new(cfg.capacity, OverflowPolicy::from_config(cfg))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Add a consumer. It sees artifacts pushed from now on.
    pub fn register_consumer(&self, name: &str) -> ConsumerId {
        let mut inner = self.lock();
        let next = inner.tail_seq();
        inner.cursors.push(Cursor {
            name: name.to_string(),
            next,
            delivered: 0,
            dropped: 0,
            sequence_end: false,
        });
        ConsumerId(inner.cursors.len() - 1)
    }

    /// Enqueue at the tail, applying the overflow policy when full.
    pub async fn push(&self, artifact: Artifact) -> Result<PushOutcome> {
        let deadline = match self.policy {
            OverflowPolicy::Block { timeout } => Some(tokio::time::Instant::now() + timeout),
            OverflowPolicy::DropOldest => None,
        };

        loop {
            {
                let mut inner = self.lock();
                if inner.buf.len() < self.capacity {
                    inner.buf.push_back(artifact);
                    inner.pushed += 1;
                    inner.trim();
                    return Ok(PushOutcome::Accepted);
                }
                if self.policy == OverflowPolicy::DropOldest {
                    let evicted = inner.evict_head();
                    inner.buf.push_back(artifact);
                    inner.pushed += 1;
                    return Ok(match evicted {
                        Some(a) => PushOutcome::Evicted(a),
                        None => PushOutcome::Accepted,
                    });
                }
            }

            let Some(deadline) = deadline else {
                return Err(Error::Invariant("overflow policy without deadline".into()));
            };
            if tokio::time::timeout_at(deadline, self.space.notified())
                .await
                .is_err()
            {
                let mut inner = self.lock();
                if inner.buf.len() < self.capacity {
                    continue;
                }
                inner.rejected += 1;
                return Err(Error::QueueOverflow(format!(
                    "{} rejected, queue full ({} retained)",
                    artifact.name(),
                    inner.buf.len()
                )));
            }
        }
    }

    /// Next artifact for `consumer`, or [`Error::EmptyQueue`].
    pub fn pop(&self, consumer: ConsumerId) -> Result<Artifact> {
        let mut inner = self.lock();
        let head = inner.head_seq;
        let tail = inner.tail_seq();
        let next = inner.cursor(consumer)?.next;
        if next < head || next > tail {
            return Err(Error::Invariant(format!(
                "queue cursor {} outside [{}, {}]",
                next, head, tail
            )));
        }
        if next == tail {
            return Err(Error::EmptyQueue);
        }
        let artifact = inner.buf[(next - head) as usize].clone();
        let cursor = inner.cursor(consumer)?;
        cursor.next += 1;
        cursor.delivered += 1;
        let released = inner.trim();
        drop(inner);
        if released > 0 {
            self.space.notify_one();
        }
        Ok(artifact)
    }

    /// The artifact `pop` would return, without consuming it.
    pub fn peek(&self, consumer: ConsumerId) -> Option<Artifact> {
        let mut inner = self.lock();
        let head = inner.head_seq;
        let next = inner.cursor(consumer).ok()?.next;
        let idx = next.checked_sub(head)? as usize;
        inner.buf.get(idx).cloned()
    }

    /// Retained artifacts.
    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Artifacts not yet delivered to `consumer`.
    pub fn pending(&self, consumer: ConsumerId) -> usize {
        let mut inner = self.lock();
        let tail = inner.tail_seq();
        match inner.cursor(consumer) {
            Ok(c) => tail.saturating_sub(c.next) as usize,
            Err(_) => 0,
        }
    }

    /// Flag the end of a capture sequence for every consumer.
    pub fn mark_sequence_end(&self) {
        let mut inner = self.lock();
        for c in inner.cursors.iter_mut() {
            c.sequence_end = true;
        }
    }

    /// True once per sequence end, after `consumer` has drained the queue.
    pub fn take_sequence_end(&self, consumer: ConsumerId) -> bool {
        let mut inner = self.lock();
        let tail = inner.tail_seq();
        match inner.cursor(consumer) {
            Ok(c) if c.sequence_end && c.next == tail => {
                c.sequence_end = false;
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        let tail = inner.tail_seq();
        QueueStats {
            capacity: self.capacity,
            retained: inner.buf.len(),
            pushed: inner.pushed,
            dropped: inner.dropped,
            rejected: inner.rejected,
            consumers: inner
                .cursors
                .iter()
                .map(|c| ConsumerStats {
                    name: c.name.clone(),
                    pending: tail.saturating_sub(c.next),
                    delivered: c.delivered,
                    dropped: c.dropped,
                })
                .collect(),
        }
    }
}
