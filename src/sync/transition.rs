//! Freeze the final leaderboard when the active tournament changes.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::lifecycle::Resolution;
use super::schedule::TaskGuard;
use super::store::SnapshotStore;
use super::{emit, SyncEvent};
use crate::db::models::{HistoricalRecord, LeaderboardEntry};
use crate::remote::RemoteSource;

/// What happened to the tournament that stopped being active
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured,
    AlreadyCaptured,
    /// No final leaderboard could be obtained; recorded as missing
    Missing,
    /// The owning task was stopped before the result could be written
    Abandoned,
}

pub struct TransitionCapturer {
    remote: Arc<dyn RemoteSource>,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<SyncEvent>,
    /// Held across a capture, so observations are handled one at a time
    last_active: Mutex<Option<String>>,
}

impl TransitionCapturer {
    /// The previous active tournament starts out as whatever the store last
    /// recorded, so a transition that happened while the process was down
    /// is still captured.
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        store: SnapshotStore,
        clock: Arc<dyn Clock>,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        let last_active = store.snapshot().active_tournament_id.clone();
        TransitionCapturer {
            remote,
            store,
            clock,
            events,
            last_active: Mutex::new(last_active),
        }
    }

    /// Feed the latest resolution. When the active tournament differs from
    /// the previous one, the previous one's final leaderboard is captured.
    ///
    /// The previous tournament is only forgotten once its capture (or its
    /// missing record) is committed. An abandoned or cancelled capture leaves
    /// it in place for the next observation.
    pub async fn observe(
        &self,
        resolution: &Resolution,
        guard: &TaskGuard,
    ) -> Option<CaptureOutcome> {
        let current = resolution.active_id().map(str::to_string);
        let mut last = self.last_active.lock().await;
        if *last == current {
            return None;
        }
        let Some(previous) = last.clone() else {
            *last = current;
            return None;
        };

        info!(
            from = %previous,
            to = current.as_deref().unwrap_or("none"),
            "Active tournament changed"
        );
        let outcome = self.capture(&previous, guard).await;
        if outcome == CaptureOutcome::Abandoned {
            debug!(tournament = %previous, "Capture abandoned; will retry on next evaluation");
        } else {
            *last = current;
        }
        Some(outcome)
    }

    async fn capture(&self, tournament_id: &str, guard: &TaskGuard) -> CaptureOutcome {
        let snapshot = self.store.snapshot();
        if snapshot
            .historical
            .get(tournament_id)
            .is_some_and(HistoricalRecord::is_captured)
        {
            debug!(tournament = tournament_id, "Final leaderboard already captured");
            return CaptureOutcome::AlreadyCaptured;
        }

        let candidate = match snapshot.live_leaderboard_for(tournament_id) {
            Some(slice) => Some(slice.entries.clone()),
            None => self.fetch_final(tournament_id).await,
        };

        let now = self.clock.now();
        let outcome = guard.commit(|| match candidate {
            Some(entries) => {
                if self.store.commit_historical(tournament_id, entries, now) {
                    emit(
                        &self.events,
                        SyncEvent::HistoryCaptured {
                            tournament_id: tournament_id.to_string(),
                        },
                    );
                    CaptureOutcome::Captured
                } else {
                    CaptureOutcome::AlreadyCaptured
                }
            }
            None => {
                warn!(
                    tournament = tournament_id,
                    "No final leaderboard available; recording it as missing"
                );
                self.store.mark_historical_missing(tournament_id, now);
                emit(
                    &self.events,
                    SyncEvent::HistoryMissing {
                        tournament_id: tournament_id.to_string(),
                    },
                );
                CaptureOutcome::Missing
            }
        });
        outcome.unwrap_or(CaptureOutcome::Abandoned)
    }

    /// One attempt, no retries. An empty leaderboard counts as a failure.
    async fn fetch_final(&self, tournament_id: &str) -> Option<Vec<LeaderboardEntry>> {
        match self.remote.get_leaderboard(tournament_id).await {
            Ok(entries) if !entries.is_empty() => Some(entries),
            Ok(_) => {
                warn!(tournament = tournament_id, "Final leaderboard is empty");
                None
            }
            Err(e) => {
                warn!(tournament = tournament_id, "Final leaderboard fetch failed: {}", e);
                None
            }
        }
    }
}
