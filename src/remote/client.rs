use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::source::RemoteSource;
use crate::db::models::{
    InvalidationMarker, InvalidationMarkers, LeaderboardEntry, Roster, Scope, Tournament,
    COMPLETED_ROUND,
};
use crate::error::SyncError;

/// League data service reached over HTTP/JSON.
///
/// Endpoints, relative to the base URL:
/// - `GET  invalidation`                 → `InvalidationMarkers`
/// - `POST invalidation`                 → `InvalidationMarker`
/// - `GET  tournaments`                  → `[Tournament]`
/// - `GET  rosters`                      → `[Roster]`
/// - `GET  tournaments/{id}/leaderboard` → `[LeaderboardEntry]`
#[derive(Clone)]
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid remote API URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Remote API URL cannot be used as a base: {}", base_url);
        }
        Ok(HttpRemote {
            http,
            base_url,
            api_token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Schema(format!("cannot extend URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, SyncError> {
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status, &body));
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, SyncError> {
        let url = self.endpoint(segments)?;
        debug!(url = %url, "GET");
        self.send(self.http.get(url)).await
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn get_invalidation_markers(&self) -> Result<InvalidationMarkers, SyncError> {
        let markers: InvalidationMarkers = self.get_json(&["invalidation"]).await?;
        validate_markers(&markers)?;
        Ok(markers)
    }

    async fn post_invalidation_marker(
        &self,
        scope: Scope,
        source: &str,
    ) -> Result<InvalidationMarker, SyncError> {
        let url = self.endpoint(&["invalidation"])?;
        let body = serde_json::json!({ "scope": scope, "source": source });
        let marker: InvalidationMarker = self.send(self.http.post(url).json(&body)).await?;
        if marker.scope != scope {
            return Err(SyncError::Schema(format!(
                "posted a {} marker but the remote recorded {}",
                scope, marker.scope
            )));
        }
        Ok(marker)
    }

    async fn get_tournaments(&self) -> Result<Vec<Tournament>, SyncError> {
        let tournaments: Vec<Tournament> = self.get_json(&["tournaments"]).await?;
        for t in &tournaments {
            validate_tournament(t)?;
        }
        Ok(tournaments)
    }

    async fn get_rosters(&self) -> Result<Vec<Roster>, SyncError> {
        self.get_json(&["rosters"]).await
    }

    async fn get_leaderboard(
        &self,
        tournament_id: &str,
    ) -> Result<Vec<LeaderboardEntry>, SyncError> {
        let entries: Vec<LeaderboardEntry> = self
            .get_json(&["tournaments", tournament_id, "leaderboard"])
            .await?;
        if let Some(stray) = entries.iter().find(|e| e.tournament_id != tournament_id) {
            return Err(SyncError::Schema(format!(
                "leaderboard for {} contains an entry for {}",
                tournament_id, stray.tournament_id
            )));
        }
        Ok(entries)
    }
}

// ── Validation helpers ────────────────────────────────────────────────────────

fn validate_tournament(t: &Tournament) -> Result<(), SyncError> {
    if t.current_round > COMPLETED_ROUND {
        return Err(SyncError::Schema(format!(
            "tournament {} reports round {}",
            t.id, t.current_round
        )));
    }
    if t.end < t.start {
        return Err(SyncError::Schema(format!(
            "tournament {} ends before it starts",
            t.id
        )));
    }
    Ok(())
}

fn validate_markers(markers: &InvalidationMarkers) -> Result<(), SyncError> {
    for scope in [Scope::Global, Scope::Tournaments, Scope::Rosters] {
        if let Some(m) = markers.get(scope) {
            if m.scope != scope {
                return Err(SyncError::Schema(format!(
                    "{} marker slot holds a {} marker",
                    scope, m.scope
                )));
            }
        }
    }
    Ok(())
}
