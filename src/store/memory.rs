//! Authoritative assignment records.
//!
//! Every write appends a new version to the player's history; only the highest
//! version is authoritative, older ones stay around for audit until the
//! history limit pushes them out.

use crate::error::{Result, SyncError};
use crate::model::catalog::CapeCatalog;
use crate::model::types::{Assignment, CapeState, PlayerId, now_ms};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Versions kept per player unless configured otherwise.
const DEFAULT_HISTORY_LIMIT: usize = 32;

pub struct AssignmentStore {
    /// `Player -> versions`, oldest first. Never empty once inserted.
    records: DashMap<PlayerId, Vec<Assignment>>,
    catalog: Arc<CapeCatalog>,
    /// False until persisted state has been loaded.
    available: AtomicBool,
    history_limit: usize,
}

impl AssignmentStore {
    pub fn new(catalog: Arc<CapeCatalog>) -> Self {
        Self {
            records: DashMap::new(),
            catalog,
            available: AtomicBool::new(false),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Replaces the in-memory state with a persisted history and opens the
    /// store for reads and writes.
    pub fn load(&self, history: Vec<Assignment>) {
        self.records.clear();
        let mut loaded = 0usize;
        for assignment in history {
            self.records
                .entry(assignment.player)
                .or_default()
                .push(assignment);
            loaded += 1;
        }
        for mut entry in self.records.iter_mut() {
            let versions = entry.value_mut();
            versions.sort_by_key(|a| a.version);
            versions.dedup_by_key(|a| a.version);
            let excess = versions.len().saturating_sub(self.history_limit);
            versions.drain(..excess);
        }
        self.mark_available();
        tracing::info!(
            "Loaded {} assignment versions for {} players",
            loaded,
            self.records.len()
        );
    }

    pub fn mark_available(&self) {
        self.available.store(true, Ordering::SeqCst);
    }

    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(SyncError::StoreUnavailable(
                "persisted assignments not loaded".to_string(),
            ))
        }
    }

    /// Writes a new version for `player`.
    ///
    /// With `expected_version = Some(v)` the write only succeeds if the current
    /// version is exactly `v` (0 for a player that was never assigned).
    /// `None` skips the check.
    pub fn set(
        &self,
        player: PlayerId,
        cape: CapeState,
        expected_version: Option<u64>,
    ) -> Result<Assignment> {
        self.ensure_available()?;

        if let CapeState::Cape(id) = &cape
            && !self.catalog.contains(id)
        {
            return Err(SyncError::UnknownCape(id.to_string()));
        }

        // The entry guard holds the shard lock, so the version check and the
        // push are atomic with respect to other writers of this player.
        match self.records.entry(player) {
            Entry::Occupied(mut occupied) => {
                let versions = occupied.get_mut();
                let current = versions.last().map(|a| a.version).unwrap_or(0);
                check_expected(player, expected_version, current)?;

                let assignment = Assignment {
                    player,
                    cape,
                    version: current + 1,
                    updated_at: now_ms(),
                };
                versions.push(assignment.clone());
                if versions.len() > self.history_limit {
                    versions.remove(0);
                }
                Ok(assignment)
            }
            Entry::Vacant(vacant) => {
                check_expected(player, expected_version, 0)?;

                let assignment = Assignment {
                    player,
                    cape,
                    version: 1,
                    updated_at: now_ms(),
                };
                vacant.insert(vec![assignment.clone()]);
                Ok(assignment)
            }
        }
    }

    /// The authoritative (highest) version for `player`.
    pub fn get(&self, player: &PlayerId) -> Result<Assignment> {
        self.ensure_available()?;
        self.records
            .get(player)
            .and_then(|versions| versions.last().cloned())
            .ok_or(SyncError::NotFound(*player))
    }

    /// Retained versions for `player`, oldest first.
    pub fn history(&self, player: &PlayerId) -> Result<Vec<Assignment>> {
        self.ensure_available()?;
        self.records
            .get(player)
            .map(|versions| versions.clone())
            .ok_or(SyncError::NotFound(*player))
    }

    /// Highest version of every player, ordered by player id.
    pub fn snapshot_all(&self) -> Result<Vec<Assignment>> {
        self.ensure_available()?;
        let mut snapshot: Vec<Assignment> = self
            .records
            .iter()
            .filter_map(|entry| entry.value().last().cloned())
            .collect();
        snapshot.sort_by_key(|a| a.player);
        Ok(snapshot)
    }

    /// Every retained version of every player, for persistence.
    pub fn export(&self) -> Vec<Assignment> {
        self.records
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    pub fn player_count(&self) -> usize {
        self.records.len()
    }

    pub fn catalog(&self) -> &Arc<CapeCatalog> {
        &self.catalog
    }
}

fn check_expected(player: PlayerId, expected: Option<u64>, current: u64) -> Result<()> {
    match expected {
        Some(expected) if expected != current => Err(SyncError::Conflict {
            player,
            expected,
            current,
        }),
        _ => Ok(()),
    }
}
