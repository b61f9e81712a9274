//! Decide which cached scopes are stale and refetch them.
//!
//! The remote publishes one invalidation marker per scope. A scope is
//! refetched when its marker is newer than both the last full check and the
//! scope's own last refresh, or when the global marker is newer than the last
//! full check. `last_updated` only moves once every required scope landed.
//! All store writes go through the caller's `TaskGuard`, so a check owned by
//! a stopped task writes nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::schedule::TaskGuard;
use super::single_flight::SingleFlight;
use super::store::SnapshotStore;
use crate::db::models::{InvalidationMarkers, Scope, Snapshot};
use crate::error::SyncError;
use crate::remote::RemoteSource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Refetch every scope without consulting markers
    pub force: bool,
    /// Forced checks only share a flight with callers of the same
    /// generation, so a force requested mid-check gets its own fetch.
    pub generation: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshResult {
    pub refreshed: bool,
    pub scopes: BTreeSet<Scope>,
}

struct CachedMarkers {
    expires: Instant,
    fetched_at: DateTime<Utc>,
    markers: InvalidationMarkers,
}

pub struct InvalidationCoordinator {
    remote: Arc<dyn RemoteSource>,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    marker_ttl: Duration,
    cached: Mutex<Option<CachedMarkers>>,
    flights: SingleFlight<(bool, u64), Result<RefreshResult, SyncError>>,
}

impl InvalidationCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        store: SnapshotStore,
        clock: Arc<dyn Clock>,
        marker_ttl: Duration,
    ) -> Self {
        InvalidationCoordinator {
            remote,
            store,
            clock,
            marker_ttl,
            cached: Mutex::new(None),
            flights: SingleFlight::new(),
        }
    }

    /// Compare markers against the store and refetch whatever is stale.
    /// Concurrent calls with the same options share one check, committed
    /// through the guard of the caller that started it.
    pub async fn check_and_refresh(
        self: &Arc<Self>,
        options: RefreshOptions,
        guard: &TaskGuard,
    ) -> Result<RefreshResult, SyncError> {
        let this = Arc::clone(self);
        let guard = guard.clone();
        let key = (options.force, if options.force { options.generation } else { 0 });
        self.flights
            .run(key, move || async move { this.run_check(options, &guard).await })
            .await
    }

    /// Forget cached markers so the next check asks the remote again.
    pub fn expire_markers(&self) {
        self.cache().take();
    }

    fn cache(&self) -> MutexGuard<'_, Option<CachedMarkers>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached_markers(&self) -> Option<(DateTime<Utc>, InvalidationMarkers)> {
        self.cache()
            .as_ref()
            .filter(|c| Instant::now() < c.expires)
            .map(|c| (c.fetched_at, c.markers.clone()))
    }

    /// Markers plus the wall-clock instant they were read at.
    async fn markers(&self) -> Result<(DateTime<Utc>, InvalidationMarkers), SyncError> {
        if let Some(cached) = self.cached_markers() {
            debug!("Using cached invalidation markers");
            return Ok(cached);
        }
        let fetched_at = self.clock.now();
        let markers = self.remote.get_invalidation_markers().await?;
        *self.cache() = Some(CachedMarkers {
            expires: Instant::now() + self.marker_ttl,
            fetched_at,
            markers: markers.clone(),
        });
        Ok((fetched_at, markers))
    }

    async fn run_check(
        &self,
        options: RefreshOptions,
        guard: &TaskGuard,
    ) -> Result<RefreshResult, SyncError> {
        // Data fetched after `basis` is at least as new as every marker read
        // at `basis`, so `basis` is what the store may claim freshness up to.
        let (basis, scopes) = if options.force {
            (self.clock.now(), Scope::DATA.into_iter().collect())
        } else {
            let (fetched_at, markers) = self.markers().await?;
            (fetched_at, stale_scopes(&self.store.snapshot(), &markers))
        };

        if scopes.is_empty() {
            guard.commit(|| self.advance(basis));
            return Ok(RefreshResult::default());
        }

        debug!(scopes = ?scopes, force = options.force, "Refreshing stale scopes");

        let tournaments = async {
            if scopes.contains(&Scope::Tournaments) {
                Some(self.remote.get_tournaments().await)
            } else {
                None
            }
        };
        let rosters = async {
            if scopes.contains(&Scope::Rosters) {
                Some(self.remote.get_rosters().await)
            } else {
                None
            }
        };
        let (tournaments, rosters) = futures_util::future::join(tournaments, rosters).await;

        let committed = guard.commit(|| {
            let mut first_error = None;
            if let Some(result) = tournaments {
                let applied = result.and_then(|t| self.store.replace_tournaments(t, basis));
                record(Scope::Tournaments, applied, &mut first_error);
            }
            if let Some(result) = rosters {
                let applied = result.and_then(|r| self.store.replace_rosters(r, basis));
                record(Scope::Rosters, applied, &mut first_error);
            }
            if first_error.is_none() {
                self.advance(basis);
            }
            first_error
        });

        match committed {
            None => {
                debug!(scopes = ?scopes, "Owning task stopped; refresh discarded");
                return Ok(RefreshResult::default());
            }
            Some(Some(err)) => return Err(err),
            Some(None) => {}
        }

        info!(scopes = ?scopes, "Cache refreshed");
        Ok(RefreshResult {
            refreshed: true,
            scopes,
        })
    }

    fn advance(&self, to: DateTime<Utc>) {
        if let Err(e) = self.store.advance_last_updated(to) {
            debug!("Discarded last_updated move: {}", e);
        }
    }
}

/// Fold one scope's outcome into the check. Stale writes count as success:
/// a newer refresh already covered the scope.
fn record(scope: Scope, outcome: Result<(), SyncError>, first_error: &mut Option<SyncError>) {
    match outcome {
        Ok(()) => {}
        Err(SyncError::StaleWriteRejected(reason)) => {
            debug!(scope = %scope, "Discarded stale refresh: {}", reason);
        }
        Err(e) => {
            warn!(scope = %scope, "Scope refresh failed: {}", e);
            first_error.get_or_insert(e);
        }
    }
}

/// Data scopes whose markers are newer than what the snapshot holds.
fn stale_scopes(snapshot: &Snapshot, markers: &InvalidationMarkers) -> BTreeSet<Scope> {
    let global_stale = markers
        .global
        .as_ref()
        .is_some_and(|m| m.timestamp > snapshot.last_updated);
    if global_stale {
        return Scope::DATA.into_iter().collect();
    }
    Scope::DATA
        .into_iter()
        .filter(|scope| {
            markers
                .get(*scope)
                .is_some_and(|m| m.timestamp > snapshot.scope_freshness(*scope))
        })
        .collect()
}
