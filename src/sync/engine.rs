//! Reconciliation of the proxy's change stream into the local cache.
//!
//! ```text
//! Disconnected --connect--> Resyncing --RESYNC_END--> Live
//!      ^                        ^                       |
//!      |                        +-------- gap ----------+
//!      +------------------- disconnect -----------------+
//! ```
//!
//! Snapshot entries are staged and only reach the cache once `RESYNC_END`
//! confirms the whole snapshot arrived. Every message is tagged with the
//! connection generation it came from; anything from an older generation is
//! ignored.

use crate::cache::local::LocalCache;
use crate::channel::protocol::SyncMessage;
use crate::error::SyncError;
use crate::model::types::{Assignment, ChangeEvent};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Disconnected,
    Resyncing,
    Live,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Disconnected => "disconnected",
            EngineState::Resyncing => "resyncing",
            EngineState::Live => "live",
        };
        f.write_str(name)
    }
}

/// What the connection driver has to do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    None,
    /// Ask the proxy for a fresh snapshot right away.
    RequestResync,
    /// The proxy could not serve a snapshot; ask again after a backoff.
    RetryResync,
}

struct Staging {
    epoch: Uuid,
    sequence: u64,
    expected: usize,
    entries: Vec<Assignment>,
}

struct EngineInner {
    state: EngineState,
    generation: u64,
    cursor: u64,
    epoch: Option<Uuid>,
    staging: Option<Staging>,
}

#[derive(Default)]
struct EngineStats {
    applied: AtomicU64,
    duplicates: AtomicU64,
    gaps: AtomicU64,
    resyncs_completed: AtomicU64,
    resyncs_abandoned: AtomicU64,
    resyncs_failed: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatsSnapshot {
    pub applied: u64,
    pub duplicates: u64,
    pub gaps: u64,
    pub resyncs_completed: u64,
    pub resyncs_abandoned: u64,
    pub resyncs_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: EngineState,
    pub generation: u64,
    pub cursor: u64,
    pub epoch: Option<Uuid>,
    pub degraded: bool,
    pub cache_size: usize,
    pub stale_entries: usize,
    pub stats: EngineStatsSnapshot,
}

pub struct ReconciliationEngine {
    cache: Arc<LocalCache>,
    inner: Mutex<EngineInner>,
    state_tx: watch::Sender<EngineState>,
    stats: EngineStats,
}

impl ReconciliationEngine {
    pub fn new(cache: Arc<LocalCache>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(EngineState::Disconnected);
        cache.set_degraded(true);
        Arc::new(Self {
            cache,
            inner: Mutex::new(EngineInner {
                state: EngineState::Disconnected,
                generation: 0,
                cursor: 0,
                epoch: None,
                staging: None,
            }),
            state_tx,
            stats: EngineStats::default(),
        })
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    /// Current state without taking the engine lock.
    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Waits until the engine reaches `target`. Returns false on timeout.
    pub async fn wait_for(&self, target: EngineState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    fn transition(&self, inner: &mut EngineInner, to: EngineState) {
        if inner.state != to {
            tracing::info!(
                "Sync engine {} -> {} (generation {}, cursor {})",
                inner.state,
                to,
                inner.generation,
                inner.cursor
            );
        }
        inner.state = to;
        self.cache.set_degraded(to != EngineState::Live);
        self.state_tx.send_replace(to);
    }

    fn abandon_staging(&self, inner: &mut EngineInner, why: &str) {
        if let Some(staging) = inner.staging.take() {
            tracing::warn!(
                "Abandoning snapshot at #{} after {}/{} entries: {}",
                staging.sequence,
                staging.entries.len(),
                staging.expected,
                why
            );
            self.stats.resyncs_abandoned.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A new connection is up. Returns its generation; the caller must send a
    /// resync request on it.
    pub async fn on_connect(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        self.abandon_staging(&mut inner, "superseded by a new connection");
        self.transition(&mut inner, EngineState::Resyncing);
        inner.generation
    }

    /// The connection of `generation` is gone. Any half-received snapshot is
    /// discarded; the cache keeps serving its last confirmed state.
    pub async fn on_disconnect(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            tracing::debug!(
                "Ignoring disconnect of stale generation {} (current {})",
                generation,
                inner.generation
            );
            return;
        }
        self.abandon_staging(&mut inner, "connection lost");
        self.transition(&mut inner, EngineState::Disconnected);
    }

    /// Re-enters `Resyncing` after a failed snapshot. Returns false if the
    /// generation is no longer current.
    pub async fn begin_resync(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return false;
        }
        inner.staging = None;
        self.transition(&mut inner, EngineState::Resyncing);
        true
    }

    pub async fn handle(&self, generation: u64, message: SyncMessage) -> EngineAction {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            tracing::debug!(
                "Dropping {} from stale generation {} (current {})",
                message.kind(),
                generation,
                inner.generation
            );
            return EngineAction::None;
        }

        match message {
            SyncMessage::Change {
                sequence_number, ..
            } => {
                let Some(assignment) = message.assignment() else {
                    return EngineAction::None;
                };
                self.on_change(&mut inner, ChangeEvent::new(sequence_number, assignment))
            }
            SyncMessage::ResyncStart {
                epoch,
                sequence_number,
                entries,
            } => {
                if inner.state != EngineState::Resyncing {
                    tracing::warn!(
                        "Unexpected snapshot start at #{} while {}",
                        sequence_number,
                        inner.state
                    );
                    return EngineAction::None;
                }
                self.abandon_staging(&mut inner, "a new snapshot started");
                tracing::debug!(
                    "Receiving snapshot at #{} ({} entries, epoch {})",
                    sequence_number,
                    entries,
                    epoch
                );
                inner.staging = Some(Staging {
                    epoch,
                    sequence: sequence_number,
                    expected: entries,
                    entries: Vec::with_capacity(entries),
                });
                EngineAction::None
            }
            SyncMessage::ResyncEntry { .. } => {
                if let Some(assignment) = message.assignment()
                    && let Some(staging) = inner.staging.as_mut()
                {
                    staging.entries.push(assignment);
                }
                EngineAction::None
            }
            SyncMessage::ResyncEnd {
                epoch,
                sequence_number,
            } => self.finish_resync(&mut inner, epoch, sequence_number),
            SyncMessage::ResyncFailed { reason } => {
                if inner.state != EngineState::Resyncing {
                    return EngineAction::None;
                }
                tracing::warn!("Proxy could not serve a snapshot: {}", reason);
                self.stats.resyncs_failed.fetch_add(1, Ordering::Relaxed);
                inner.staging = None;
                self.transition(&mut inner, EngineState::Disconnected);
                EngineAction::RetryResync
            }
            SyncMessage::Pong { .. } | SyncMessage::AssignResult { .. } => EngineAction::None,
        }
    }

    fn on_change(&self, inner: &mut EngineInner, event: ChangeEvent) -> EngineAction {
        if inner.state != EngineState::Live {
            // Covered by the snapshot that is on its way.
            tracing::trace!("Ignoring change #{} while {}", event.sequence, inner.state);
            return EngineAction::None;
        }

        let expected = inner.cursor + 1;
        if event.sequence == expected {
            self.cache.apply(&event);
            inner.cursor = event.sequence;
            self.stats.applied.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Applied change #{} for {} (v{})",
                event.sequence,
                event.assignment.player,
                event.assignment.version
            );
            EngineAction::None
        } else if event.sequence < expected {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Discarded duplicate change #{} (cursor {})",
                event.sequence,
                inner.cursor
            );
            EngineAction::None
        } else {
            let gap = SyncError::SequenceGap {
                expected,
                received: event.sequence,
            };
            tracing::warn!("{}, requesting a full snapshot", gap);
            self.stats.gaps.fetch_add(1, Ordering::Relaxed);
            self.transition(inner, EngineState::Resyncing);
            EngineAction::RequestResync
        }
    }

    fn finish_resync(&self, inner: &mut EngineInner, epoch: Uuid, sequence: u64) -> EngineAction {
        let Some(staging) = inner.staging.take() else {
            tracing::warn!("Snapshot end at #{} without a matching start", sequence);
            return EngineAction::None;
        };

        if staging.epoch != epoch
            || staging.sequence != sequence
            || staging.entries.len() != staging.expected
        {
            tracing::warn!(
                "Snapshot at #{} is inconsistent ({}/{} entries), requesting another",
                sequence,
                staging.entries.len(),
                staging.expected
            );
            self.stats.resyncs_abandoned.fetch_add(1, Ordering::Relaxed);
            return EngineAction::RequestResync;
        }

        if let Some(previous) = inner.epoch
            && previous != epoch
        {
            tracing::info!(
                "Proxy epoch changed ({} -> {}), dropping cached state",
                previous,
                epoch
            );
            self.cache.invalidate_all();
        }

        let mut installed = 0usize;
        for assignment in staging.entries {
            if self.cache.revalidate(&ChangeEvent::new(sequence, assignment)) {
                installed += 1;
            }
        }

        inner.cursor = sequence;
        inner.epoch = Some(epoch);
        self.stats.resyncs_completed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Snapshot at #{} applied ({} of {} entries installed)",
            sequence,
            installed,
            staging.expected
        );
        self.transition(inner, EngineState::Live);
        EngineAction::None
    }

    pub async fn cursor(&self) -> u64 {
        self.inner.lock().await.cursor
    }

    pub async fn status(&self) -> EngineStatus {
        let inner = self.inner.lock().await;
        EngineStatus {
            state: inner.state,
            generation: inner.generation,
            cursor: inner.cursor,
            epoch: inner.epoch,
            degraded: self.cache.is_degraded(),
            cache_size: self.cache.len(),
            stale_entries: self.cache.stale_count(),
            stats: self.stats(),
        }
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            applied: self.stats.applied.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            gaps: self.stats.gaps.load(Ordering::Relaxed),
            resyncs_completed: self.stats.resyncs_completed.load(Ordering::Relaxed),
            resyncs_abandoned: self.stats.resyncs_abandoned.load(Ordering::Relaxed),
            resyncs_failed: self.stats.resyncs_failed.load(Ordering::Relaxed),
        }
    }
}
