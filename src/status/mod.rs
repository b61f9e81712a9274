use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::db::models::{Identity, Snapshot};
use crate::error::SyncError;
use crate::identity::{IdentityProvider, LocalIdentityProvider};
use crate::sync::SyncController;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SyncController>,
    pub identity: Arc<LocalIdentityProvider>,
}

/// Build the Axum router for the status API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/leaderboard", get(leaderboard_handler))
        .route("/api/history/:id", get(history_handler))
        .route("/api/retry", post(retry_handler))
        .route("/api/force-refresh", post(force_refresh_handler))
        .route(
            "/api/identity",
            post(sign_in_handler).delete(sign_out_handler),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn error_response(err: SyncError) -> (StatusCode, String) {
    let status = match err {
        SyncError::AuthRequired => StatusCode::UNAUTHORIZED,
        SyncError::Network(_) => StatusCode::BAD_GATEWAY,
        SyncError::Schema(_) => StatusCode::BAD_GATEWAY,
        SyncError::StaleWriteRejected(_) => StatusCode::CONFLICT,
    };
    (status, err.to_string())
}

/// GET /api/status
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.status())
}

/// GET /api/snapshot
async fn snapshot_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.controller.store().snapshot();
    Json(Snapshot::clone(&snapshot))
}

/// GET /api/leaderboard
async fn leaderboard_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let snapshot = state.controller.store().snapshot();
    snapshot
        .leaderboard
        .clone()
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "No live leaderboard".to_string()))
}

/// GET /api/history/:id
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let snapshot = state.controller.store().snapshot();
    snapshot
        .historical
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("No history for {}", id)))
}

/// POST /api/retry
async fn retry_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .controller
        .retry()
        .await
        .map(|()| Json(state.controller.status()))
        .map_err(error_response)
}

/// POST /api/force-refresh
async fn force_refresh_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .controller
        .force_refresh()
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Deserialize)]
struct SignInRequest {
    user_id: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// POST /api/identity
async fn sign_in_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignInRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if req.user_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "user_id must not be empty".into()));
    }
    state.identity.sign_in(Identity {
        user_id: req.user_id,
        display_name: req.display_name,
    });
    Ok(StatusCode::ACCEPTED)
}

/// DELETE /api/identity
async fn sign_out_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.identity.sign_out();
    StatusCode::NO_CONTENT
}
