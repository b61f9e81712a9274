//! Live leaderboard polling for the active tournament.
//!
//! One session per tournament. Each tick re-checks that the tournament is
//! still active, then fetches its leaderboard once. Failures back off
//! exponentially; a schema error or `max_retries` consecutive failures end
//! the session and report upward.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::lifecycle;
use super::schedule::{spawn_scheduled, Next, TaskGuard, TaskHandle};
use super::store::SnapshotStore;
use super::{emit, PollEnd, SyncEvent};
use crate::db::models::LeaderboardSlice;
use crate::error::SyncError;
use crate::remote::RemoteSource;

/// Retry and backoff settings for leaderboard polling
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub backoff_factor: f64,
    pub max_backoff_exponent: u32,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Fraction of the delay added or removed at random (0.0 = none)
    pub jitter: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            interval: Duration::from_secs(180),
            backoff_factor: 2.0,
            max_backoff_exponent: 4,
            max_delay: Duration::from_secs(1800),
            max_retries: 3,
            jitter: 0.0,
        }
    }
}

impl PollerConfig {
    /// `interval * factor^min(retries, max_exponent)`, capped at `max_delay`.
    pub fn backoff_delay(&self, interval: Duration, retries: u32) -> Duration {
        let exponent = retries.min(self.max_backoff_exponent);
        let secs = interval.as_secs_f64() * self.backoff_factor.powi(exponent as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Polling,
}

/// Handle to one tournament's polling session. Clones refer to the same
/// session.
#[derive(Debug, Clone, PartialEq)]
pub struct PollHandle {
    tournament_id: String,
    task: TaskHandle,
}

impl PollHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

/// Marks a tournament as having a fetch in flight until dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    tournament_id: String,
}

impl InFlight {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, tournament_id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tournament_id.to_string());
        inserted.then(|| InFlight {
            set: Arc::clone(set),
            tournament_id: tournament_id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.tournament_id);
    }
}

/// Everything a session's ticks need, shared with the spawned task.
struct PollContext {
    remote: Arc<dyn RemoteSource>,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    config: PollerConfig,
    events: mpsc::Sender<SyncEvent>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// Tournaments whose session gave up; written before the session ends
    failed: Mutex<HashSet<String>>,
}

impl PollContext {
    fn failed(&self) -> MutexGuard<'_, HashSet<String>> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Session {
    tournament_id: String,
    interval: Duration,
    retries: AtomicU32,
}

pub struct LeaderboardPoller {
    ctx: Arc<PollContext>,
    sessions: Mutex<HashMap<String, PollHandle>>,
}

impl LeaderboardPoller {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        store: SnapshotStore,
        clock: Arc<dyn Clock>,
        config: PollerConfig,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        LeaderboardPoller {
            ctx: Arc::new(PollContext {
                remote,
                store,
                clock,
                config,
                events,
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                failed: Mutex::new(HashSet::new()),
            }),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, PollHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start polling `tournament_id`, fetching immediately. If a session for
    /// it is already running, that session's handle is returned instead.
    /// Starting explicitly clears an earlier failure for the tournament.
    pub fn start(&self, tournament_id: &str, interval: Duration) -> PollHandle {
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(tournament_id).filter(|h| h.is_running()) {
            return existing.clone();
        }
        self.ctx.failed().remove(tournament_id);

        let session = Arc::new(Session {
            tournament_id: tournament_id.to_string(),
            interval,
            retries: AtomicU32::new(0),
        });
        let ctx = Arc::clone(&self.ctx);
        let task = spawn_scheduled("leaderboard-poll", Duration::ZERO, move |guard| {
            let ctx = Arc::clone(&ctx);
            let session = Arc::clone(&session);
            async move { tick(&ctx, &session, &guard).await }
        });

        info!(tournament = tournament_id, interval = ?interval, "Leaderboard polling started");
        let handle = PollHandle {
            tournament_id: tournament_id.to_string(),
            task,
        };
        sessions.insert(tournament_id.to_string(), handle.clone());
        handle
    }

    /// Stop a session. Safe to call more than once; no store write from it
    /// happens after this returns.
    pub fn stop(&self, handle: &PollHandle) {
        handle.task.stop();
        let mut sessions = self.sessions();
        if sessions.get(&handle.tournament_id) == Some(handle) {
            sessions.remove(&handle.tournament_id);
            info!(tournament = %handle.tournament_id, "Leaderboard polling stopped");
        }
    }

    /// Stop every session except the one for `keep`.
    pub fn stop_all_except(&self, keep: Option<&str>) {
        let doomed: Vec<PollHandle> = self
            .sessions()
            .values()
            .filter(|h| Some(h.tournament_id.as_str()) != keep)
            .cloned()
            .collect();
        for handle in doomed {
            self.stop(&handle);
        }
    }

    pub fn stop_all(&self) {
        self.stop_all_except(None);
    }

    pub fn state(&self, tournament_id: &str) -> SessionState {
        let mut sessions = self.sessions();
        match sessions.get(tournament_id) {
            Some(h) if h.is_running() => SessionState::Polling,
            Some(_) => {
                sessions.remove(tournament_id);
                SessionState::Idle
            }
            None => SessionState::Idle,
        }
    }

    pub fn is_polling(&self, tournament_id: &str) -> bool {
        self.state(tournament_id) == SessionState::Polling
    }

    /// Whether the last session for `tournament_id` gave up. Set by the
    /// session itself before it ends, so no caller sees it idle but unmarked.
    pub fn has_failed(&self, tournament_id: &str) -> bool {
        self.ctx.failed().contains(tournament_id)
    }

    /// Forget every failure so the next evaluation may poll again.
    pub fn clear_failed(&self) {
        self.ctx.failed().clear();
    }

    /// Tournaments with a running session
    pub fn polling(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions()
            .values()
            .filter(|h| h.is_running())
            .map(|h| h.tournament_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

async fn tick(ctx: &PollContext, session: &Session, guard: &TaskGuard) -> Next {
    let id = session.tournament_id.as_str();
    let snapshot = ctx.store.snapshot();
    if !lifecycle::is_active(&snapshot.tournaments, id, ctx.clock.now()) {
        info!(tournament = id, "Tournament no longer active; polling ended");
        guard.commit(|| {
            emit(
                &ctx.events,
                SyncEvent::PollingEnded {
                    tournament_id: id.to_string(),
                    reason: PollEnd::NoLongerActive,
                },
            )
        });
        return Next::Done;
    }

    let Some(_flight) = InFlight::acquire(&ctx.in_flight, id) else {
        debug!(tournament = id, "Previous fetch still in flight; skipping tick");
        return Next::After(session.interval);
    };

    let fetched_at: DateTime<Utc> = ctx.clock.now();
    match ctx.remote.get_leaderboard(id).await {
        Ok(entries) => {
            session.retries.store(0, Ordering::SeqCst);
            let count = entries.len();
            let slice = LeaderboardSlice {
                tournament_id: id.to_string(),
                entries,
                fetched_at,
            };
            match guard.commit(|| ctx.store.replace_leaderboard(slice)) {
                None => return Next::Done,
                Some(Err(e)) => debug!(tournament = id, "Discarded leaderboard: {}", e),
                Some(Ok(())) => {
                    emit(
                        &ctx.events,
                        SyncEvent::LeaderboardUpdated {
                            tournament_id: id.to_string(),
                            entries: count,
                        },
                    );
                }
            }
            Next::After(session.interval)
        }
        Err(e) if !e.is_retryable() => {
            error!(tournament = id, "Leaderboard response rejected, polling stopped: {}", e);
            end_failed(ctx, guard, id, e);
            Next::Done
        }
        Err(e) => {
            let retries = session.retries.fetch_add(1, Ordering::SeqCst) + 1;
            if retries >= ctx.config.max_retries {
                error!(
                    tournament = id,
                    retries, "Leaderboard polling gave up: {}", e
                );
                end_failed(ctx, guard, id, e);
                return Next::Done;
            }
            let delay = ctx
                .config
                .jittered(ctx.config.backoff_delay(session.interval, retries));
            warn!(
                tournament = id,
                retries,
                retry_in = ?delay,
                "Leaderboard fetch failed: {}", e
            );
            Next::After(delay)
        }
    }
}

fn end_failed(ctx: &PollContext, guard: &TaskGuard, tournament_id: &str, err: SyncError) {
    guard.commit(|| {
        ctx.failed().insert(tournament_id.to_string());
        emit(
            &ctx.events,
            SyncEvent::PollingEnded {
                tournament_id: tournament_id.to_string(),
                reason: PollEnd::Failed(err),
            },
        )
    });
}
