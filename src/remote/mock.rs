//! Scripted in-process remote for tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::source::RemoteSource;
use crate::db::models::{
    InvalidationMarker, InvalidationMarkers, LeaderboardEntry, Roster, Scope, Tournament,
};
use crate::error::SyncError;

/// Responses for one operation: queued one-shot results first, then the
/// steady-state default.
struct Script<T> {
    queued: VecDeque<Result<T, SyncError>>,
    default: Result<T, SyncError>,
}

impl<T: Clone> Script<T> {
    fn new(default: Result<T, SyncError>) -> Self {
        Script {
            queued: VecDeque::new(),
            default,
        }
    }

    fn next(&mut self) -> Result<T, SyncError> {
        self.queued.pop_front().unwrap_or_else(|| self.default.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Markers,
    PostMarker,
    Tournaments,
    Rosters,
    Leaderboard,
}

pub struct MockRemote {
    markers: Mutex<Script<InvalidationMarkers>>,
    tournaments: Mutex<Script<Vec<Tournament>>>,
    rosters: Mutex<Script<Vec<Roster>>>,
    leaderboards: Mutex<HashMap<String, Script<Vec<LeaderboardEntry>>>>,
    calls: Mutex<Vec<(Call, Option<String>)>>,
    latency: Mutex<Duration>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        MockRemote {
            markers: Mutex::new(Script::new(Ok(InvalidationMarkers::default()))),
            tournaments: Mutex::new(Script::new(Ok(Vec::new()))),
            rosters: Mutex::new(Script::new(Ok(Vec::new()))),
            leaderboards: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Every call sleeps this long (on tokio's clock) before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn set_markers(&self, markers: InvalidationMarkers) {
        self.markers.lock().unwrap().default = Ok(markers);
    }

    pub fn set_tournaments(&self, tournaments: Vec<Tournament>) {
        self.tournaments.lock().unwrap().default = Ok(tournaments);
    }

    pub fn fail_tournaments_once(&self, err: SyncError) {
        self.tournaments.lock().unwrap().queued.push_back(Err(err));
    }

    pub fn set_rosters(&self, rosters: Vec<Roster>) {
        self.rosters.lock().unwrap().default = Ok(rosters);
    }

    pub fn fail_rosters_once(&self, err: SyncError) {
        self.rosters.lock().unwrap().queued.push_back(Err(err));
    }

    pub fn set_leaderboard(
        &self,
        tournament_id: &str,
        result: Result<Vec<LeaderboardEntry>, SyncError>,
    ) {
        self.leaderboards
            .lock()
            .unwrap()
            .insert(tournament_id.to_string(), Script::new(result));
    }

    pub fn queue_leaderboard(
        &self,
        tournament_id: &str,
        result: Result<Vec<LeaderboardEntry>, SyncError>,
    ) {
        self.leaderboards
            .lock()
            .unwrap()
            .entry(tournament_id.to_string())
            .or_insert_with(|| Script::new(Ok(Vec::new())))
            .queued
            .push_back(result);
    }

    pub fn calls(&self, call: Call) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == call)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn leaderboard_calls(&self, tournament_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, id)| *c == Call::Leaderboard && id.as_deref() == Some(tournament_id))
            .count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    async fn record(&self, call: Call, arg: Option<&str>) {
        self.calls
            .lock()
            .unwrap()
            .push((call, arg.map(str::to_string)));
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteSource for MockRemote {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_invalidation_markers(&self) -> Result<InvalidationMarkers, SyncError> {
        self.record(Call::Markers, None).await;
        self.markers.lock().unwrap().next()
    }

    async fn post_invalidation_marker(
        &self,
        scope: Scope,
        source: &str,
    ) -> Result<InvalidationMarker, SyncError> {
        self.record(Call::PostMarker, Some(source)).await;
        let marker = InvalidationMarker {
            timestamp: Utc::now(),
            source: source.to_string(),
            scope,
        };
        let mut markers = self.markers.lock().unwrap();
        if let Ok(current) = &mut markers.default {
            match scope {
                Scope::Global => current.global = Some(marker.clone()),
                Scope::Tournaments => current.tournaments = Some(marker.clone()),
                Scope::Rosters => current.rosters = Some(marker.clone()),
            }
        }
        Ok(marker)
    }

    async fn get_tournaments(&self) -> Result<Vec<Tournament>, SyncError> {
        self.record(Call::Tournaments, None).await;
        self.tournaments.lock().unwrap().next()
    }

    async fn get_rosters(&self) -> Result<Vec<Roster>, SyncError> {
        self.record(Call::Rosters, None).await;
        self.rosters.lock().unwrap().next()
    }

    async fn get_leaderboard(
        &self,
        tournament_id: &str,
    ) -> Result<Vec<LeaderboardEntry>, SyncError> {
        self.record(Call::Leaderboard, Some(tournament_id)).await;
        self.leaderboards
            .lock()
            .unwrap()
            .get_mut(tournament_id)
            .map(Script::next)
            .unwrap_or_else(|| {
                Err(SyncError::Network(format!("no leaderboard for {}", tournament_id)))
            })
    }
}
