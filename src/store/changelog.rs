//! Sequenced Change Log
//!
//! The proxy's single source of sequence numbers. `append` runs under the write
//! lock, so numbers are strictly increasing and gap free at the source.
//! Readers are lazy and restartable: they remember the next sequence they want
//! and take the read lock only for the event they are about to return.

use crate::error::{Result, SyncError};
use crate::model::types::{Assignment, ChangeEvent};

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

struct LogInner {
    /// Contiguous run of retained events, oldest first.
    events: VecDeque<ChangeEvent>,
    /// Last sequence handed out (0 before the first append).
    head: u64,
}

pub struct ChangeLog {
    inner: RwLock<LogInner>,
    retention: Option<usize>,
}

impl ChangeLog {
    /// An unbounded log.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(LogInner {
                events: VecDeque::new(),
                head: 0,
            }),
            retention: None,
        })
    }

    /// A log that keeps at most `retention` events.
    pub fn with_retention(retention: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(LogInner {
                events: VecDeque::new(),
                head: 0,
            }),
            retention: Some(retention.max(1)),
        })
    }

    /// Stamps `assignment` with the next sequence number.
    pub fn append(&self, assignment: Assignment) -> ChangeEvent {
        let mut inner = self.inner.write();
        inner.head += 1;
        let event = ChangeEvent::new(inner.head, assignment);
        inner.events.push_back(event.clone());

        if let Some(limit) = self.retention {
            while inner.events.len() > limit {
                inner.events.pop_front();
            }
        }

        tracing::debug!(
            "Appended change #{} for {} (v{})",
            event.sequence,
            event.assignment.player,
            event.assignment.version
        );
        event
    }

    pub fn head(&self) -> u64 {
        self.inner.read().head
    }

    /// Oldest sequence still readable, if any event is retained.
    pub fn first_retained(&self) -> Option<u64> {
        self.inner.read().events.front().map(|e| e.sequence)
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().events.is_empty()
    }

    /// Events with `sequence >= from` up to the head at the time of the call.
    ///
    /// Fails with `SequenceGap` when `from` is older than the retention window:
    /// the caller cannot bridge that gap and has to resync from a snapshot.
    pub fn read_from(self: &Arc<Self>, from: u64) -> Result<ChangeLogReader> {
        let from = from.max(1);
        let inner = self.inner.read();
        let oldest = inner
            .events
            .front()
            .map(|e| e.sequence)
            .unwrap_or(inner.head + 1);

        if from < oldest {
            return Err(SyncError::SequenceGap {
                expected: from,
                received: oldest,
            });
        }

        Ok(ChangeLogReader {
            log: self.clone(),
            next: from,
            end: inner.head,
            truncated: false,
        })
    }

    fn event_at(&self, sequence: u64) -> Option<ChangeEvent> {
        let inner = self.inner.read();
        let oldest = inner.events.front()?.sequence;
        if sequence < oldest {
            return None;
        }
        inner.events.get((sequence - oldest) as usize).cloned()
    }
}

/// Finite, lazy iterator over a range of the change log.
pub struct ChangeLogReader {
    log: Arc<ChangeLog>,
    next: u64,
    end: u64,
    truncated: bool,
}

impl ChangeLogReader {
    /// Sequence the next call to `next()` will return. Pass it to
    /// `ChangeLog::read_from` to resume later.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// True if retention dropped an event before this reader got to it.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for ChangeLogReader {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<ChangeEvent> {
        if self.truncated || self.next > self.end {
            return None;
        }
        match self.log.event_at(self.next) {
            Some(event) => {
                self.next += 1;
                Some(event)
            }
            None => {
                tracing::warn!("Change #{} was trimmed while being read", self.next);
                self.truncated = true;
                None
            }
        }
    }
}
