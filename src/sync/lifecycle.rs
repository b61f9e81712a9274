//! Which tournament is live, which comes next.
//!
//! Pure functions over the cached tournament list; no I/O.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::db::models::Tournament;

/// Outcome of one lifecycle evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub active: Option<Tournament>,
    pub next: Option<Tournament>,
}

impl Resolution {
    pub fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|t| t.id.as_str())
    }

    pub fn next_id(&self) -> Option<&str> {
        self.next.as_ref().map(|t| t.id.as_str())
    }
}

/// Resolve the active and next tournaments at `now`.
///
/// More than one tournament matching the active predicate is a data error:
/// the earliest-starting one wins (ties by id) and the overlap is logged.
pub fn resolve(tournaments: &[Tournament], now: DateTime<Utc>) -> Resolution {
    let mut candidates: Vec<&Tournament> =
        tournaments.iter().filter(|t| t.is_active_at(now)).collect();
    candidates.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));

    if candidates.len() > 1 {
        warn!(
            count = candidates.len(),
            ids = ?candidates.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            "Multiple tournaments in progress; using the earliest start"
        );
    }

    let next = tournaments
        .iter()
        .filter(|t| t.start > now)
        .min_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)))
        .cloned();

    Resolution {
        active: candidates.first().map(|t| (*t).clone()),
        next,
    }
}

/// Whether `tournament_id` is the active tournament at `now`.
pub fn is_active(tournaments: &[Tournament], tournament_id: &str, now: DateTime<Utc>) -> bool {
    resolve(tournaments, now).active_id() == Some(tournament_id)
}
