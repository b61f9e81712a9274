//! The sync engine: snapshot store, lifecycle resolution, invalidation,
//! leaderboard polling, transition capture and the controller tying them
//! together.

pub mod clock;
pub mod controller;
pub mod invalidation;
pub mod lifecycle;
pub mod poller;
pub mod schedule;
pub mod single_flight;
pub mod store;
pub mod transition;

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::SyncError;

pub use clock::SystemClock;
pub use controller::{SyncController, SyncSettings};
pub use poller::PollerConfig;
pub use store::SnapshotStore;

/// Why a polling session ended on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEnd {
    NoLongerActive,
    Failed(SyncError),
}

/// Notifications from background work to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    LeaderboardUpdated { tournament_id: String, entries: usize },
    PollingEnded { tournament_id: String, reason: PollEnd },
    HistoryCaptured { tournament_id: String },
    HistoryMissing { tournament_id: String },
}

/// Capacity of the event channel between background work and the controller
pub const EVENT_BUFFER: usize = 256;

/// Send without waiting. A full or closed channel drops the event.
pub(crate) fn emit(events: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = events.try_send(event) {
        warn!("Dropped sync event: {}", e);
    }
}
