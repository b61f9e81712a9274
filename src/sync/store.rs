//! The snapshot store: sole owner of cached data.
//!
//! Readers load an `Arc<Snapshot>` from an `ArcSwap` without locking, and
//! it never changes underneath them. Writers are serialised by a mutex and
//! go through the mutation methods below, each of which clones the current
//! snapshot, edits the copy, and swaps it in whole. When a
//! `KeyValueStore` is attached, every committed change is persisted under a
//! single versioned key.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::db::models::{
    HistoricalRecord, LeaderboardEntry, LeaderboardSlice, Roster, Scope, Snapshot, Tournament,
    UserSlice,
};
use crate::db::KeyValueStore;
use crate::error::SyncError;

use super::lifecycle::Resolution;

/// Fixed key the snapshot is persisted under
pub const SNAPSHOT_KEY: &str = "fairway-sync/snapshot";

/// Bump whenever `Snapshot` changes shape incompatibly
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct PersistedSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    snapshot: Snapshot,
}

struct StoreInner {
    current: ArcSwap<Snapshot>,
    /// Serialises writers; readers never take it
    write_lock: Mutex<()>,
    persistence: Option<Arc<dyn KeyValueStore>>,
}

/// Shared handle to the snapshot store. Clone is cheap.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<StoreInner>,
}

impl SnapshotStore {
    /// Store without persistence
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::with_snapshot(Snapshot::default(), None)
    }

    /// Store backed by `kv`, starting from whatever compatible snapshot it holds.
    pub fn open(kv: Arc<dyn KeyValueStore>) -> Self {
        let snapshot = load_persisted(kv.as_ref()).unwrap_or_default();
        Self::with_snapshot(snapshot, Some(kv))
    }

    fn with_snapshot(snapshot: Snapshot, persistence: Option<Arc<dyn KeyValueStore>>) -> Self {
        SnapshotStore {
            inner: Arc::new(StoreInner {
                current: ArcSwap::from_pointee(snapshot),
                write_lock: Mutex::new(()),
                persistence,
            }),
        }
    }

    /// Current snapshot. Later writes never alter the returned value.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.current.load_full()
    }

    /// Copy, edit, swap. An unchanged copy is neither swapped nor persisted.
    fn update<R>(
        &self,
        edit: impl FnOnce(&mut Snapshot) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let _writer = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self.inner.current.load();
        let mut next = Snapshot::clone(&current);
        let out = edit(&mut next)?;
        if next != **current {
            let next = Arc::new(next);
            self.inner.current.store(Arc::clone(&next));
            self.persist(&next);
        }
        Ok(out)
    }

    fn persist(&self, snapshot: &Snapshot) {
        let Some(kv) = &self.inner.persistence else {
            return;
        };
        let envelope = PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            snapshot: snapshot.clone(),
        };
        let result = serde_json::to_string(&envelope)
            .map_err(anyhow::Error::from)
            .and_then(|raw| kv.set(SNAPSHOT_KEY, &raw));
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist snapshot; keeping in-memory copy");
        }
    }

    fn replace_scope<T>(
        &self,
        scope: Scope,
        as_of: DateTime<Utc>,
        apply: impl FnOnce(&mut Snapshot, T),
        value: T,
    ) -> Result<(), SyncError> {
        self.update(|snap| {
            if let Some(newer) = snap.scope_updated.get(&scope).filter(|t| **t > as_of) {
                return Err(SyncError::StaleWriteRejected(format!(
                    "{} as of {} is older than cached {}",
                    scope, as_of, newer
                )));
            }
            apply(snap, value);
            snap.scope_updated.insert(scope, as_of);
            Ok(())
        })
    }

    /// Swap in a freshly fetched tournament list.
    pub fn replace_tournaments(
        &self,
        tournaments: Vec<Tournament>,
        as_of: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.replace_scope(
            Scope::Tournaments,
            as_of,
            |snap, t| snap.tournaments = t,
            tournaments,
        )
    }

    /// Swap in a freshly fetched roster list.
    pub fn replace_rosters(
        &self,
        rosters: Vec<Roster>,
        as_of: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.replace_scope(Scope::Rosters, as_of, |snap, r| snap.rosters = r, rosters)
    }

    /// Move `last_updated` forward. Never moves it back.
    pub fn advance_last_updated(&self, to: DateTime<Utc>) -> Result<(), SyncError> {
        self.update(|snap| {
            if to < snap.last_updated {
                return Err(SyncError::StaleWriteRejected(format!(
                    "last_updated {} is behind {}",
                    to, snap.last_updated
                )));
            }
            snap.last_updated = to;
            Ok(())
        })
    }

    /// Record the latest lifecycle resolution's active/next pointers.
    pub fn set_lifecycle(&self, resolution: &Resolution) {
        let _ = self.update(|snap| {
            snap.active_tournament_id = resolution.active_id().map(str::to_string);
            snap.next_tournament_id = resolution.next_id().map(str::to_string);
            Ok(())
        });
    }

    /// Swap in a live leaderboard. Rejected when it is older than the cached
    /// slice for the same tournament, or the tournament is already history.
    pub fn replace_leaderboard(&self, slice: LeaderboardSlice) -> Result<(), SyncError> {
        self.update(|snap| {
            if snap
                .historical
                .get(&slice.tournament_id)
                .is_some_and(HistoricalRecord::is_captured)
            {
                return Err(SyncError::StaleWriteRejected(format!(
                    "tournament {} already has a final leaderboard",
                    slice.tournament_id
                )));
            }
            if let Some(existing) = &snap.leaderboard {
                if existing.tournament_id == slice.tournament_id
                    && existing.fetched_at > slice.fetched_at
                {
                    return Err(SyncError::StaleWriteRejected(format!(
                        "leaderboard for {} fetched at {} is older than cached {}",
                        slice.tournament_id, slice.fetched_at, existing.fetched_at
                    )));
                }
            }
            snap.leaderboard = Some(slice);
            Ok(())
        })
    }

    /// Freeze the final leaderboard of a finished tournament. Returns
    /// `false` if one was already captured; a captured record is never
    /// replaced. A record previously marked missing is upgraded.
    pub fn commit_historical(
        &self,
        tournament_id: &str,
        entries: Vec<LeaderboardEntry>,
        captured_at: DateTime<Utc>,
    ) -> bool {
        let committed = self.update(|snap| {
            if snap
                .historical
                .get(tournament_id)
                .is_some_and(HistoricalRecord::is_captured)
            {
                return Ok(false);
            }
            snap.historical.insert(
                tournament_id.to_string(),
                HistoricalRecord::Captured {
                    entries,
                    captured_at,
                },
            );
            if snap
                .leaderboard
                .as_ref()
                .is_some_and(|l| l.tournament_id == tournament_id)
            {
                snap.leaderboard = None;
            }
            Ok(true)
        });
        let committed = committed.unwrap_or(false);
        if committed {
            info!(tournament = tournament_id, "Final leaderboard captured");
        }
        committed
    }

    /// Note that a tournament finished without a capturable leaderboard.
    /// No-op if any record already exists.
    pub fn mark_historical_missing(&self, tournament_id: &str, marked_at: DateTime<Utc>) -> bool {
        self.update(|snap| {
            if snap.historical.contains_key(tournament_id) {
                return Ok(false);
            }
            snap.historical.insert(
                tournament_id.to_string(),
                HistoricalRecord::Missing { marked_at },
            );
            Ok(true)
        })
        .unwrap_or(false)
    }

    pub fn set_user(&self, user: UserSlice) {
        let _ = self.update(|snap| {
            snap.user = Some(user);
            Ok(())
        });
    }

    /// Drop user-specific data, leaving public slices alone. Returns whether
    /// there was anything to drop.
    pub fn clear_user(&self) -> bool {
        self.update(|snap| Ok(snap.user.take().is_some()))
            .unwrap_or(false)
    }
}

fn load_persisted(kv: &dyn KeyValueStore) -> Option<Snapshot> {
    let raw = match kv.get(SNAPSHOT_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "Failed to read persisted snapshot; starting empty");
            return None;
        }
    };

    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Persisted snapshot is not valid JSON; discarding");
            discard(kv);
            return None;
        }
    };

    let version = value.get("version").and_then(serde_json::Value::as_u64);
    if version != Some(u64::from(SNAPSHOT_VERSION)) {
        warn!(
            found = ?version,
            expected = SNAPSHOT_VERSION,
            "Persisted snapshot has an incompatible version; discarding"
        );
        discard(kv);
        return None;
    }

    match serde_json::from_value::<PersistedSnapshot>(value) {
        Ok(persisted) => {
            debug!(
                saved_at = %persisted.saved_at,
                tournaments = persisted.snapshot.tournaments.len(),
                historical = persisted.snapshot.historical.len(),
                "Loaded persisted snapshot"
            );
            Some(persisted.snapshot)
        }
        Err(e) => {
            warn!(error = %e, "Persisted snapshot does not match the current shape; discarding");
            discard(kv);
            None
        }
    }
}

fn discard(kv: &dyn KeyValueStore) {
    if let Err(e) = kv.clear(SNAPSHOT_KEY) {
        warn!(error = %e, "Failed to clear discarded snapshot");
    }
}
