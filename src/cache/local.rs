//! Per-node read cache of resolved cape state.
//!
//! Entries are stored as `Arc<CacheEntry>` and only ever swapped as a whole;
//! a reader sees either the old record or the new one, never a mix.

use crate::model::types::{Assignment, ChangeEvent, PlayerId};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub assignment: Assignment,
    /// Record version at the time it was installed.
    pub fetched_at_version: u64,
    /// Sequence number of the event (or snapshot) that installed this record.
    pub fetched_at_sequence: u64,
    /// After this instant the record has not been confirmed by the proxy for a
    /// full TTL. It is still served, but callers can tell.
    pub stale_until: Instant,
}

impl CacheEntry {
    pub fn is_stale(&self) -> bool {
        Instant::now() >= self.stale_until
    }
}

pub struct LocalCache {
    entries: DashMap<PlayerId, Arc<CacheEntry>>,
    ttl: Duration,
    degraded: AtomicBool,
}

impl LocalCache {
    /// A fresh cache starts degraded: nothing has been confirmed by the proxy yet.
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            ttl,
            degraded: AtomicBool::new(true),
        })
    }

    fn make_entry(&self, event: &ChangeEvent) -> Arc<CacheEntry> {
        Arc::new(CacheEntry {
            assignment: event.assignment.clone(),
            fetched_at_version: event.assignment.version,
            fetched_at_sequence: event.sequence,
            stale_until: Instant::now() + self.ttl,
        })
    }

    /// `None` means the player was never assigned anything (as far as this
    /// node knows). A cleared cape is `Some` with `CapeState::NoCape`.
    pub fn lookup(&self, player: &PlayerId) -> Option<Assignment> {
        self.entries
            .get(player)
            .map(|entry| entry.value().assignment.clone())
    }

    pub fn lookup_entry(&self, player: &PlayerId) -> Option<CacheEntry> {
        self.entries
            .get(player)
            .map(|entry| entry.value().as_ref().clone())
    }

    /// Installs the event's assignment if it is newer than what is cached.
    /// Older or equal versions are dropped, which makes re-delivery harmless.
    pub fn apply(&self, event: &ChangeEvent) -> bool {
        let incoming = event.assignment.version;
        match self.entries.entry(event.assignment.player) {
            Entry::Occupied(mut occupied) => {
                if incoming > occupied.get().assignment.version {
                    occupied.insert(self.make_entry(event));
                    true
                } else {
                    tracing::trace!(
                        "Discarded v{} for {} (cached v{})",
                        incoming,
                        event.assignment.player,
                        occupied.get().assignment.version
                    );
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.make_entry(event));
                true
            }
        }
    }

    /// Like `apply`, but a record with the same version is re-installed so its
    /// staleness deadline restarts. Only used once a full snapshot confirmed it.
    pub fn revalidate(&self, event: &ChangeEvent) -> bool {
        let incoming = event.assignment.version;
        match self.entries.entry(event.assignment.player) {
            Entry::Occupied(mut occupied) => {
                if incoming >= occupied.get().assignment.version {
                    occupied.insert(self.make_entry(event));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.make_entry(event));
                true
            }
        }
    }

    /// Forgets everything. Lookups report not-found until the next resync.
    pub fn invalidate_all(&self) {
        let dropped = self.entries.len();
        self.entries.clear();
        tracing::info!("Invalidated local cache ({} entries dropped)", dropped);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::SeqCst);
    }

    /// True while the node is not live against the proxy and answers from
    /// last-known state.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stale_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| now >= entry.value().stale_until)
            .count()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
