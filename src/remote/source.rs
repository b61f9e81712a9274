use async_trait::async_trait;

use crate::db::models::{
    InvalidationMarker, InvalidationMarkers, LeaderboardEntry, Roster, Scope, Tournament,
};
use crate::error::SyncError;

/// Trait every source of league data must implement.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Latest invalidation marker per scope.
    async fn get_invalidation_markers(&self) -> Result<InvalidationMarkers, SyncError>;

    /// Announce that data in `scope` changed. Used by writers, not by the sync loop.
    async fn post_invalidation_marker(
        &self,
        scope: Scope,
        source: &str,
    ) -> Result<InvalidationMarker, SyncError>;

    async fn get_tournaments(&self) -> Result<Vec<Tournament>, SyncError>;

    async fn get_rosters(&self) -> Result<Vec<Roster>, SyncError>;

    async fn get_leaderboard(
        &self,
        tournament_id: &str,
    ) -> Result<Vec<LeaderboardEntry>, SyncError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
