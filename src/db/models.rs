use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Round number the remote reports once a tournament has finished.
pub const COMPLETED_ROUND: u8 = 5;

/// A scheduled golf tournament
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: String,
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// 0 before the first tee time, 1–4 while in play, 5 once completed
    pub current_round: u8,
    #[serde(default)]
    pub course_id: Option<String>,
}

impl Tournament {
    pub fn is_completed(&self) -> bool {
        self.current_round >= COMPLETED_ROUND
    }

    /// `start ≤ now ≤ end` and not yet completed.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now <= self.end && !self.is_completed()
    }
}

/// One line of a tournament leaderboard (a golfer or a fantasy team)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub tournament_id: String,
    pub entrant_id: String,
    pub name: String,
    /// Display position, e.g. "1", "T4", "CUT"
    pub position: String,
    /// Aggregate score relative to par
    pub total_score: i32,
    /// Per-round strokes; `None` for rounds not yet played
    #[serde(default)]
    pub round_scores: Vec<Option<i32>>,
    /// Holes completed in the current round ("F" once finished)
    #[serde(default)]
    pub thru: Option<String>,
}

/// A fantasy roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub golfer_ids: Vec<String>,
}

/// A named partition of cached data that can be invalidated on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Tournaments,
    Rosters,
    Global,
}

impl Scope {
    /// Scopes backed by their own slice and fetch operation.
    pub const DATA: [Scope; 2] = [Scope::Tournaments, Scope::Rosters];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Tournaments => "tournaments",
            Scope::Rosters => "rosters",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tournaments" => Ok(Scope::Tournaments),
            "rosters" => Ok(Scope::Rosters),
            "global" => Ok(Scope::Global),
            other => Err(format!("unknown scope: {}", other)),
        }
    }
}

/// Remote signal that data in `scope` changed at `timestamp`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMarker {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub scope: Scope,
}

/// Latest marker per scope as reported by the remote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMarkers {
    #[serde(default)]
    pub global: Option<InvalidationMarker>,
    #[serde(default)]
    pub tournaments: Option<InvalidationMarker>,
    #[serde(default)]
    pub rosters: Option<InvalidationMarker>,
}

impl InvalidationMarkers {
    pub fn get(&self, scope: Scope) -> Option<&InvalidationMarker> {
        match scope {
            Scope::Global => self.global.as_ref(),
            Scope::Tournaments => self.tournaments.as_ref(),
            Scope::Rosters => self.rosters.as_ref(),
        }
    }
}

/// Leaderboard for one tournament as of `fetched_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardSlice {
    pub tournament_id: String,
    pub entries: Vec<LeaderboardEntry>,
    pub fetched_at: DateTime<Utc>,
}

/// Final leaderboard of a completed tournament
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HistoricalRecord {
    Captured {
        entries: Vec<LeaderboardEntry>,
        captured_at: DateTime<Utc>,
    },
    /// The transition was seen but no final leaderboard could be obtained
    Missing { marked_at: DateTime<Utc> },
}

impl HistoricalRecord {
    pub fn is_captured(&self) -> bool {
        matches!(self, HistoricalRecord::Captured { .. })
    }
}

/// Signed-in user as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Identity {
            user_id: user_id.into(),
            display_name: None,
        }
    }
}

/// Data that only makes sense for the signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSlice {
    pub user_id: String,
    pub rosters: Vec<Roster>,
    pub refreshed_at: DateTime<Utc>,
}

/// Everything the engine caches, as of one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tournaments: Vec<Tournament>,
    pub rosters: Vec<Roster>,
    pub active_tournament_id: Option<String>,
    pub next_tournament_id: Option<String>,
    /// Live leaderboard of the active tournament
    pub leaderboard: Option<LeaderboardSlice>,
    /// tournament id → final leaderboard
    pub historical: BTreeMap<String, HistoricalRecord>,
    pub user: Option<UserSlice>,
    /// Last successful refresh per data scope
    pub scope_updated: BTreeMap<Scope, DateTime<Utc>>,
    /// Instant of the last fully successful invalidation check
    pub last_updated: DateTime<Utc>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            tournaments: Vec::new(),
            rosters: Vec::new(),
            active_tournament_id: None,
            next_tournament_id: None,
            leaderboard: None,
            historical: BTreeMap::new(),
            user: None,
            scope_updated: BTreeMap::new(),
            last_updated: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl Snapshot {
    /// Effective freshness of a scope: the later of its own refresh and the
    /// last full check.
    pub fn scope_freshness(&self, scope: Scope) -> DateTime<Utc> {
        self.scope_updated
            .get(&scope)
            .copied()
            .map_or(self.last_updated, |t| t.max(self.last_updated))
    }

    /// Cached live leaderboard for `tournament_id`, if it has any entries.
    pub fn live_leaderboard_for(&self, tournament_id: &str) -> Option<&LeaderboardSlice> {
        self.leaderboard
            .as_ref()
            .filter(|s| s.tournament_id == tournament_id && !s.entries.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tournament(round: u8) -> Tournament {
        let now = Utc::now();
        Tournament {
            id: "t1".into(),
            name: "Spring Open".into(),
            start: now - Duration::hours(1),
            end: now + Duration::hours(1),
            current_round: round,
            course_id: None,
        }
    }

    #[test]
    fn test_active_window() {
        let t = tournament(2);
        assert!(t.is_active_at(Utc::now()));
        assert!(!t.is_active_at(t.end + Duration::seconds(1)));
        assert!(!t.is_active_at(t.start - Duration::seconds(1)));
    }

    #[test]
    fn test_completed_is_never_active() {
        let t = tournament(COMPLETED_ROUND);
        assert!(t.is_completed());
        assert!(!t.is_active_at(Utc::now()));
    }

    #[test]
    fn test_scope_parse_and_display() {
        assert_eq!("Rosters".parse::<Scope>(), Ok(Scope::Rosters));
        assert_eq!(Scope::Global.to_string(), "global");
        assert!("players".parse::<Scope>().is_err());
    }

    #[test]
    fn test_scope_freshness_prefers_later_timestamp() {
        let mut snap = Snapshot::default();
        assert_eq!(snap.scope_freshness(Scope::Rosters), DateTime::<Utc>::UNIX_EPOCH);

        let t = Utc::now();
        snap.scope_updated.insert(Scope::Rosters, t);
        assert_eq!(snap.scope_freshness(Scope::Rosters), t);

        snap.last_updated = t + Duration::minutes(1);
        assert_eq!(snap.scope_freshness(Scope::Rosters), snap.last_updated);
    }

    #[test]
    fn test_markers_deserialize_with_nulls() {
        let raw = r#"{"global":null,"tournaments":{"timestamp":"2026-04-01T12:00:00Z","source":"admin","scope":"tournaments"}}"#;
        let markers: InvalidationMarkers = serde_json::from_str(raw).unwrap();
        assert!(markers.global.is_none());
        assert!(markers.rosters.is_none());
        assert_eq!(markers.get(Scope::Tournaments).unwrap().source, "admin");
    }
}
