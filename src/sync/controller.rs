//! Top-level owner of the sync engine.
//!
//! `SyncController` wires the coordinators to one store, tracks the
//! engine's lifecycle state and the last surfaced failure, and offers the
//! recovery operations. `start` spawns the background loops; the returned
//! `ControllerHandle` stops them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::invalidation::{InvalidationCoordinator, RefreshOptions, RefreshResult};
use super::lifecycle::{self, Resolution};
use super::poller::{LeaderboardPoller, PollerConfig};
use super::schedule::{spawn_periodic, spawn_scheduled, Next, TaskGuard, TaskHandle};
use super::single_flight::SingleFlight;
use super::store::SnapshotStore;
use super::transition::{CaptureOutcome, TransitionCapturer};
use super::{PollEnd, SyncEvent, EVENT_BUFFER};
use crate::db::models::Identity;
use crate::error::SyncError;
use crate::identity::{IdentityCoordinator, IdentityProvider};
use crate::remote::RemoteSource;

/// Timing knobs for the engine
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub transition_interval: Duration,
    pub invalidation_interval: Duration,
    pub marker_ttl: Duration,
    pub poller: PollerConfig,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            transition_interval: Duration::from_secs(300),
            invalidation_interval: Duration::from_secs(600),
            marker_ttl: Duration::from_secs(30),
            poller: PollerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(SyncError),
}

/// Operation a surfaced failure came from, and what `retry` re-runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailedOperation {
    Initialize,
    Refresh,
    Polling { tournament_id: String },
    Identity { user_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub operation: FailedOperation,
    pub error: SyncError,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: LifecycleState,
    pub active_tournament_id: Option<String>,
    pub next_tournament_id: Option<String>,
    pub polling: Vec<String>,
    pub last_updated: DateTime<Utc>,
    pub signed_in_user: Option<String>,
    pub historical: usize,
    pub last_error: Option<SyncFailure>,
}

pub struct SyncController {
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    invalidation: Arc<InvalidationCoordinator>,
    poller: Arc<LeaderboardPoller>,
    capturer: TransitionCapturer,
    identity: Arc<IdentityCoordinator>,
    identity_provider: Arc<dyn IdentityProvider>,
    state: Mutex<LifecycleState>,
    init: SingleFlight<(), Result<RefreshResult, SyncError>>,
    /// Bumped by every `force_refresh`
    force_requested: AtomicU64,
    /// Highest force generation a successful check has served
    force_served: AtomicU64,
    last_error: Mutex<Option<SyncFailure>>,
    events: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncController {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        store: SnapshotStore,
        identity_provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let invalidation = Arc::new(InvalidationCoordinator::new(
            Arc::clone(&remote),
            store.clone(),
            Arc::clone(&clock),
            settings.marker_ttl,
        ));
        let poller = Arc::new(LeaderboardPoller::new(
            Arc::clone(&remote),
            store.clone(),
            Arc::clone(&clock),
            settings.poller.clone(),
            tx.clone(),
        ));
        let capturer =
            TransitionCapturer::new(Arc::clone(&remote), store.clone(), Arc::clone(&clock), tx);
        let identity = Arc::new(IdentityCoordinator::new(
            remote,
            store.clone(),
            Arc::clone(&clock),
        ));

        Arc::new(SyncController {
            store,
            clock,
            settings,
            invalidation,
            poller,
            capturer,
            identity,
            identity_provider,
            state: Mutex::new(LifecycleState::Uninitialized),
            init: SingleFlight::new(),
            force_requested: AtomicU64::new(0),
            force_served: AtomicU64::new(0),
            last_error: Mutex::new(None),
            events: Mutex::new(Some(rx)),
        })
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn state(&self) -> LifecycleState {
        lock(&self.state).clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    pub fn status(&self) -> SyncStatus {
        let snapshot = self.store.snapshot();
        SyncStatus {
            state: self.state(),
            active_tournament_id: snapshot.active_tournament_id.clone(),
            next_tournament_id: snapshot.next_tournament_id.clone(),
            polling: self.poller.polling(),
            last_updated: snapshot.last_updated,
            signed_in_user: snapshot.user.as_ref().map(|u| u.user_id.clone()),
            historical: snapshot.historical.len(),
            last_error: lock(&self.last_error).clone(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Bring the engine to `Ready`: one invalidation check, then one
    /// evaluation. A no-op once ready; concurrent callers share one attempt.
    pub async fn ensure_initialized(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.is_ready() {
            return Ok(());
        }
        self.initialize_shared().await.map(|_| ())
    }

    async fn initialize_shared(self: &Arc<Self>) -> Result<RefreshResult, SyncError> {
        let this = Arc::clone(self);
        self.init.run((), move || async move { this.initialize().await }).await
    }

    async fn initialize(&self) -> Result<RefreshResult, SyncError> {
        *lock(&self.state) = LifecycleState::Initializing;
        info!("Initializing sync engine");

        let guard = TaskGuard::unscoped();
        match self.refresh(&guard).await {
            Ok(result) => {
                self.evaluate(&guard).await;
                *lock(&self.state) = LifecycleState::Ready;
                self.clear_failure(|op| {
                    matches!(op, FailedOperation::Initialize | FailedOperation::Refresh)
                });
                info!(
                    tournaments = self.store.snapshot().tournaments.len(),
                    "Sync engine ready"
                );
                Ok(result)
            }
            Err(e) => {
                error!("Sync engine initialization failed: {}", e);
                *lock(&self.state) = LifecycleState::Failed(e.clone());
                self.record_failure(FailedOperation::Initialize, e.clone());
                Err(e)
            }
        }
    }

    // ── Refresh ──────────────────────────────────────────────────────────────

    /// One invalidation check, forced while any `force_refresh` is still
    /// unserved. Success only marks the generation read before the check as
    /// served, so a force requested mid-check forces the next one too.
    async fn refresh(&self, guard: &TaskGuard) -> Result<RefreshResult, SyncError> {
        let generation = self.force_requested.load(Ordering::SeqCst);
        let force = generation > self.force_served.load(Ordering::SeqCst);
        let options = RefreshOptions { force, generation };
        let result = self.invalidation.check_and_refresh(options, guard).await?;
        if force {
            self.force_served.fetch_max(generation, Ordering::SeqCst);
        }
        Ok(result)
    }

    /// Run an invalidation check and re-evaluate if anything changed.
    pub async fn check_for_updates(&self) -> Result<RefreshResult, SyncError> {
        self.check_with(&TaskGuard::unscoped()).await
    }

    async fn check_with(&self, guard: &TaskGuard) -> Result<RefreshResult, SyncError> {
        match self.refresh(guard).await {
            Ok(result) => {
                self.clear_failure(|op| *op == FailedOperation::Refresh);
                if result.refreshed {
                    self.evaluate(guard).await;
                }
                Ok(result)
            }
            Err(e) => {
                self.record_failure(FailedOperation::Refresh, e.clone());
                Err(e)
            }
        }
    }

    /// Refetch every scope regardless of markers and restart any polling that
    /// was given up on. Until a forced check succeeds, every later check is
    /// forced too.
    pub async fn force_refresh(self: &Arc<Self>) -> Result<RefreshResult, SyncError> {
        info!("Forced refresh requested");
        self.force_requested.fetch_add(1, Ordering::SeqCst);
        self.poller.clear_failed();
        self.invalidation.expire_markers();
        if !self.is_ready() {
            return self.initialize_shared().await;
        }
        self.check_for_updates().await
    }

    /// Re-run whatever last failed. With nothing failed this is an ordinary
    /// update check.
    pub async fn retry(self: &Arc<Self>) -> Result<(), SyncError> {
        self.poller.clear_failed();
        if !self.is_ready() {
            return self.ensure_initialized().await;
        }
        let operation = lock(&self.last_error).as_ref().map(|f| f.operation.clone());
        info!(operation = ?operation, "Retrying");
        match operation {
            None | Some(FailedOperation::Initialize) | Some(FailedOperation::Refresh) => {
                self.check_for_updates().await.map(|_| ())
            }
            Some(FailedOperation::Polling { .. }) => {
                self.clear_failure(|op| matches!(op, FailedOperation::Polling { .. }));
                self.evaluate(&TaskGuard::unscoped()).await;
                Ok(())
            }
            Some(FailedOperation::Identity { .. }) => {
                self.sync_identity(self.identity_provider.current_identity())
                    .await
            }
        }
    }

    // ── Evaluation ───────────────────────────────────────────────────────────

    /// Resolve the lifecycle against the store, capture any finished
    /// tournament, and make polling match the active tournament.
    ///
    /// The new active pointer is persisted only after the capture settles,
    /// so a capture cut short by shutdown is picked up again on restart.
    pub async fn evaluate(&self, guard: &TaskGuard) -> Resolution {
        let snapshot = self.store.snapshot();
        let resolution = lifecycle::resolve(&snapshot.tournaments, self.clock.now());
        if guard.is_stopped() {
            return resolution;
        }

        if self.capturer.observe(&resolution, guard).await == Some(CaptureOutcome::Abandoned) {
            return resolution;
        }
        if guard
            .commit(|| self.store.set_lifecycle(&resolution))
            .is_none()
        {
            return resolution;
        }

        if let Some(id) = resolution.active_id() {
            if self.poller.has_failed(id) {
                debug!(tournament = id, "Polling suspended after failure; awaiting retry");
            } else if !self.poller.is_polling(id) {
                self.poller.start(id, self.settings.poller.interval);
            }
        }
        self.poller.stop_all_except(resolution.active_id());
        resolution
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    async fn sync_identity(&self, identity: Option<Identity>) -> Result<(), SyncError> {
        let user_id = identity.as_ref().map(|i| i.user_id.clone());
        match self.identity.on_identity_change(identity).await {
            Ok(()) => {
                self.clear_failure(|op| matches!(op, FailedOperation::Identity { .. }));
                Ok(())
            }
            Err(e) => {
                if let Some(user_id) = user_id {
                    self.record_failure(FailedOperation::Identity { user_id }, e.clone());
                }
                Err(e)
            }
        }
    }

    // ── Failures ─────────────────────────────────────────────────────────────

    fn record_failure(&self, operation: FailedOperation, error: SyncError) {
        *lock(&self.last_error) = Some(SyncFailure {
            operation,
            error,
            at: self.clock.now(),
        });
    }

    fn clear_failure(&self, matches: impl Fn(&FailedOperation) -> bool) {
        let mut last = lock(&self.last_error);
        if last.as_ref().is_some_and(|f| matches(&f.operation)) {
            *last = None;
        }
    }

    async fn handle_event(&self, event: SyncEvent, guard: &TaskGuard) {
        match event {
            SyncEvent::PollingEnded {
                tournament_id,
                reason: PollEnd::Failed(e),
            } => {
                error!(tournament = %tournament_id, "Polling failed: {}", e);
                self.record_failure(FailedOperation::Polling { tournament_id }, e);
            }
            SyncEvent::PollingEnded {
                tournament_id,
                reason: PollEnd::NoLongerActive,
            } => {
                debug!(tournament = %tournament_id, "Polling ended; re-evaluating");
                self.evaluate(guard).await;
            }
            SyncEvent::LeaderboardUpdated {
                tournament_id,
                entries,
            } => {
                debug!(tournament = %tournament_id, entries, "Leaderboard updated");
                self.clear_failure(|op| match op {
                    FailedOperation::Polling { tournament_id: id } => *id == tournament_id,
                    _ => false,
                });
            }
            SyncEvent::HistoryCaptured { tournament_id } => {
                debug!(tournament = %tournament_id, "History captured");
            }
            SyncEvent::HistoryMissing { tournament_id } => {
                warn!(tournament = %tournament_id, "History recorded without a final leaderboard");
            }
        }
    }

    // ── Background loops ─────────────────────────────────────────────────────

    /// Spawn the invalidation loop, the transition loop, and the listeners
    /// for engine events and identity changes.
    pub fn start(self: &Arc<Self>) -> ControllerHandle {
        let mut tasks = Vec::new();

        let this = Arc::clone(self);
        let every = self.settings.invalidation_interval;
        tasks.push(spawn_periodic("invalidation", every, every, move |guard| {
            let this = Arc::clone(&this);
            async move {
                if !this.is_ready() {
                    let _ = this.ensure_initialized().await;
                } else if let Err(e) = this.check_with(&guard).await {
                    warn!("Invalidation check failed: {}", e);
                }
            }
        }));

        let this = Arc::clone(self);
        tasks.push(spawn_periodic(
            "transition",
            Duration::ZERO,
            self.settings.transition_interval,
            move |guard| {
                let this = Arc::clone(&this);
                async move {
                    if this.is_ready() {
                        this.evaluate(&guard).await;
                    }
                }
            },
        ));

        if let Some(rx) = lock(&self.events).take() {
            let this = Arc::clone(self);
            let mut rx = Some(rx);
            tasks.push(spawn_scheduled("sync-events", Duration::ZERO, move |guard| {
                let this = Arc::clone(&this);
                let rx = rx.take();
                async move {
                    if let Some(mut rx) = rx {
                        while let Some(event) = rx.recv().await {
                            this.handle_event(event, &guard).await;
                        }
                    }
                    Next::Done
                }
            }));
        }

        let this = Arc::clone(self);
        let mut identity_rx = Some(self.identity_provider.subscribe());
        tasks.push(spawn_scheduled("identity", Duration::ZERO, move |_guard| {
            let this = Arc::clone(&this);
            let rx = identity_rx.take();
            async move {
                if let Some(mut rx) = rx {
                    let initial = rx.borrow_and_update().clone();
                    let _ = this.sync_identity(initial).await;
                    while rx.changed().await.is_ok() {
                        let identity = rx.borrow_and_update().clone();
                        let _ = this.sync_identity(identity).await;
                    }
                }
                Next::Done
            }
        }));

        info!(
            invalidation = ?self.settings.invalidation_interval,
            transition = ?self.settings.transition_interval,
            poll = ?self.settings.poller.interval,
            "Background sync started"
        );
        ControllerHandle {
            tasks,
            poller: Arc::clone(&self.poller),
        }
    }
}

/// Stops everything `SyncController::start` spawned, plus every polling
/// session.
pub struct ControllerHandle {
    tasks: Vec<TaskHandle>,
    poller: Arc<LeaderboardPoller>,
}

impl ControllerHandle {
    /// Idempotent. No background store write happens after it returns.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.stop();
        }
        self.poller.stop_all();
        info!("Background sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{
        InvalidationMarker, InvalidationMarkers, LeaderboardEntry, Roster, Scope, Tournament,
    };
    use crate::db::{KeyValueStore, MemoryStore};
    use crate::identity::LocalIdentityProvider;
    use crate::remote::mock::{Call, MockRemote};
    use crate::sync::clock::ManualClock;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 8, 14, 0, 0).unwrap()
    }

    fn open_tournament() -> Tournament {
        Tournament {
            id: "pga".into(),
            name: "PGA Championship".into(),
            start: now() - ChronoDuration::days(1),
            end: now() + ChronoDuration::days(2),
            current_round: 2,
            course_id: Some("valhalla".into()),
        }
    }

    fn entries(score: i32) -> Vec<LeaderboardEntry> {
        vec![LeaderboardEntry {
            tournament_id: "pga".into(),
            entrant_id: "g1".into(),
            name: "Golfer One".into(),
            position: "1".into(),
            total_score: score,
            round_scores: vec![Some(66), Some(69), None, None],
            thru: Some("F".into()),
        }]
    }

    struct Fixture {
        remote: Arc<MockRemote>,
        clock: Arc<ManualClock>,
        identity: Arc<LocalIdentityProvider>,
        controller: Arc<SyncController>,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(MockRemote::new());
        remote.set_markers(InvalidationMarkers {
            global: None,
            tournaments: Some(InvalidationMarker {
                timestamp: now() - ChronoDuration::hours(2),
                source: "admin".into(),
                scope: Scope::Tournaments,
            }),
            rosters: None,
        });
        remote.set_tournaments(vec![open_tournament()]);
        remote.set_rosters(vec![Roster {
            id: "r1".into(),
            owner_id: "u1".into(),
            name: "Fore Play".into(),
            golfer_ids: vec!["g1".into()],
        }]);
        remote.set_leaderboard("pga", Ok(entries(-6)));

        let clock = Arc::new(ManualClock::new(now()));
        let identity = Arc::new(LocalIdentityProvider::new(None));
        let controller = SyncController::new(
            remote.clone(),
            SnapshotStore::in_memory(),
            identity.clone(),
            clock.clone(),
            SyncSettings::default(),
        );
        Fixture {
            remote,
            clock,
            identity,
            controller,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_initialized_runs_once() {
        let f = fixture();
        f.remote.set_latency(Duration::from_millis(100));
        assert_eq!(f.controller.state(), LifecycleState::Uninitialized);

        let a = f.controller.ensure_initialized();
        let b = f.controller.ensure_initialized();
        let (a, b) = futures_util::future::join(a, b).await;
        a.unwrap();
        b.unwrap();
        assert_eq!(f.remote.calls(Call::Markers), 1);
        assert_eq!(f.remote.calls(Call::Tournaments), 1);

        f.controller.ensure_initialized().await.unwrap();
        assert_eq!(f.remote.calls(Call::Markers), 1);

        let status = f.controller.status();
        assert_eq!(status.state, LifecycleState::Ready);
        assert_eq!(status.active_tournament_id.as_deref(), Some("pga"));
        assert_eq!(status.polling, vec!["pga".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initialization_recovers_on_retry() {
        let f = fixture();
        f.remote
            .fail_tournaments_once(SyncError::Network("connection reset".into()));

        let err = f.controller.ensure_initialized().await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
        let status = f.controller.status();
        assert!(matches!(status.state, LifecycleState::Failed(_)));
        assert_eq!(
            status.last_error.map(|e| e.operation),
            Some(FailedOperation::Initialize)
        );

        f.controller.retry().await.unwrap();
        f.controller.retry().await.unwrap();
        let status = f.controller.status();
        assert_eq!(status.state, LifecycleState::Ready);
        assert!(status.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_tournament_is_captured_and_polling_stops() {
        let f = fixture();
        f.controller.ensure_initialized().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.controller.store().snapshot().leaderboard.is_some());

        f.clock.advance(ChronoDuration::days(3));
        let resolution = f.controller.evaluate(&TaskGuard::unscoped()).await;
        assert!(resolution.active.is_none());

        let snap = f.controller.store().snapshot();
        assert!(snap.historical["pga"].is_captured());
        assert!(snap.active_tournament_id.is_none());
        assert!(f.controller.status().polling.is_empty());

        // later evaluations leave the frozen record alone
        f.controller.evaluate(&TaskGuard::unscoped()).await;
        assert_eq!(f.controller.store().snapshot().historical["pga"], snap.historical["pga"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_ignores_markers() {
        let f = fixture();
        f.controller.ensure_initialized().await.unwrap();
        f.remote.reset_calls();

        let result = f.controller.force_refresh().await.unwrap();
        assert_eq!(result.scopes, std::collections::BTreeSet::from(Scope::DATA));
        assert_eq!(f.remote.calls(Call::Markers), 0);
        assert_eq!(f.remote.calls(Call::Tournaments), 1);
        assert_eq!(f.remote.calls(Call::Rosters), 1);

        // the next ordinary check is back to markers
        f.controller.check_for_updates().await.unwrap();
        assert_eq!(f.remote.calls(Call::Tournaments), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_failure_surfaces_until_retry() {
        let f = fixture();
        f.remote
            .set_leaderboard("pga", Err(SyncError::Schema("position missing".into())));
        f.controller.ensure_initialized().await.unwrap();
        let handle = f.controller.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = f.controller.status();
        assert_eq!(
            status.last_error.map(|e| e.operation),
            Some(FailedOperation::Polling {
                tournament_id: "pga".into()
            })
        );
        assert!(status.polling.is_empty());

        // the transition loop does not restart a failed session on its own
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(f.remote.leaderboard_calls("pga"), 1);

        f.remote.set_leaderboard("pga", Ok(entries(-7)));
        f.controller.retry().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = f.controller.status();
        assert!(status.last_error.is_none());
        assert_eq!(status.polling, vec!["pga".to_string()]);

        handle.shutdown();
        handle.shutdown();
        let calls = f.remote.total_calls();
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(f.remote.total_calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_changes_reach_user_slice() {
        let f = fixture();
        f.controller.ensure_initialized().await.unwrap();
        let handle = f.controller.start();

        f.identity.sign_in(Identity::new("u1"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.controller.status().signed_in_user.as_deref(), Some("u1"));

        f.identity.sign_out();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let snap = f.controller.store().snapshot();
        assert!(snap.user.is_none());
        assert_eq!(snap.tournaments.len(), 1);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_requested_mid_check_is_not_lost() {
        let f = fixture();
        f.controller.ensure_initialized().await.unwrap();
        f.remote.reset_calls();
        f.remote.set_latency(Duration::from_millis(100));

        let first = f.controller.force_refresh();
        let second = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.controller.force_refresh().await
        };
        let (first, second) = futures_util::future::join(first, second).await;
        first.unwrap();
        second.unwrap();
        // the later request did not ride on the check already under way
        assert_eq!(f.remote.calls(Call::Tournaments), 2);
        assert_eq!(f.remote.calls(Call::Markers), 0);

        // both generations served: back to marker checks
        f.controller.check_for_updates().await.unwrap();
        assert_eq!(f.remote.calls(Call::Markers), 1);
        assert_eq!(f.remote.calls(Call::Tournaments), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_cut_short_by_shutdown_resumes_after_restart() {
        let f = fixture();
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let open_controller = || {
            SyncController::new(
                f.remote.clone(),
                SnapshotStore::open(Arc::clone(&kv)),
                f.identity.clone(),
                f.clock.clone(),
                SyncSettings::default(),
            )
        };

        // polling never produces a live slice to fall back on
        f.remote
            .set_leaderboard("pga", Err(SyncError::Schema("position missing".into())));
        let controller = open_controller();
        controller.ensure_initialized().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(controller.store().snapshot().leaderboard.is_none());

        f.clock.advance(ChronoDuration::days(3));
        f.remote.set_leaderboard("pga", Ok(entries(-9)));
        f.remote.set_latency(Duration::from_secs(10));
        let handle = controller.start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.remote.leaderboard_calls("pga") >= 2);
        handle.shutdown();

        let snap = controller.store().snapshot();
        assert!(snap.historical.is_empty());
        assert_eq!(snap.active_tournament_id.as_deref(), Some("pga"));
        drop(controller);

        f.remote.set_latency(Duration::ZERO);
        let restarted = open_controller();
        restarted.ensure_initialized().await.unwrap();
        let snap = restarted.store().snapshot();
        assert!(snap.historical["pga"].is_captured());
        assert!(snap.active_tournament_id.is_none());
    }

    #[test]
    fn test_status_serializes_state_and_error() {
        let state = LifecycleState::Failed(SyncError::AuthRequired);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"]["kind"], "auth_required");

        let op = FailedOperation::Polling {
            tournament_id: "pga".into(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "polling");
        assert_eq!(json["tournament_id"], "pga");
    }
}
