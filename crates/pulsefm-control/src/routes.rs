use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use pulsefm_core::data::{NoopReason, PollCloseOutcome, ReplaceNextOutcome, RotationOutcome};
use pulsefm_core::{PulseError, PulseResult};
use pulsefm_poll::PollEngine;
use pulsefm_rotation::RotationEngine;
use pulsefm_store::Datastore;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub rotation: Arc<RotationEngine>,
    pub poll: Arc<PollEngine>,
    pub ds: Arc<dyn Datastore>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tick", post(tick))
        .route("/vote/close", post(vote_close))
        .route("/next/refresh", post(next_refresh))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TickRequest {
    version: Option<i64>,
}

/// `POST /tick` — returns `{ok|noop, version, reason?}`; 400 on a missing
/// or non-positive version, 500 on DS/KV failure (via `PulseError`).
async fn tick(State(state): State<AppState>, Json(body): Json<TickRequest>) -> Response {
    match handle_tick(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn handle_tick(state: AppState, body: TickRequest) -> PulseResult<Response> {
    let version = body
        .version
        .filter(|v| *v >= 1)
        .ok_or_else(|| PulseError::Validation("version must be an integer >= 1".into()))?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let outcome = state.rotation.tick(version, now_ms).await?;

    let response = match outcome {
        RotationOutcome::Committed { version } => {
            (StatusCode::OK, Json(json!({ "ok": true, "version": version }))).into_response()
        }
        RotationOutcome::Noop { reason } => (
            StatusCode::OK,
            Json(json!({ "ok": false, "noop": true, "reason": reason_str(reason) })),
        )
            .into_response(),
    };
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct VoteCloseRequest {
    #[serde(rename = "voteId")]
    vote_id: Option<String>,
    version: Option<i64>,
}

/// `POST /vote/close` — returns `{ok, action ∈ {closed, noop}, reason?}`.
async fn vote_close(State(state): State<AppState>, Json(body): Json<VoteCloseRequest>) -> Response {
    match handle_vote_close(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn handle_vote_close(state: AppState, body: VoteCloseRequest) -> PulseResult<Response> {
    let vote_id = body
        .vote_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PulseError::Validation("missing voteId".into()))?;
    let version = body
        .version
        .ok_or_else(|| PulseError::Validation("missing version".into()))?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let outcome = state.poll.close_poll(&vote_id, version, now_ms).await?;

    let response = match outcome {
        PollCloseOutcome::Closed { .. } => {
            (StatusCode::OK, Json(json!({ "ok": true, "action": "closed" }))).into_response()
        }
        PollCloseOutcome::Noop { reason } => (
            StatusCode::OK,
            Json(json!({ "ok": true, "action": "noop", "reason": reason_str(reason) })),
        )
            .into_response(),
    };
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct NextRefreshRequest {
    #[serde(rename = "voteId")]
    vote_id: Option<String>,
}

/// `POST /next/refresh` — returns `{ok, action ∈ {updated, already_set, noop}, reason?}`.
///
/// The request body carries only `voteId`; `durationMs` isn't repeated on
/// the wire because it's already on the Song the external encoder just
/// marked `ready` — the song's own record is the source of truth for its
/// duration, not the caller.
async fn next_refresh(State(state): State<AppState>, Json(body): Json<NextRefreshRequest>) -> Response {
    match handle_next_refresh(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn handle_next_refresh(state: AppState, body: NextRefreshRequest) -> PulseResult<Response> {
    let vote_id = body
        .vote_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PulseError::Validation("missing voteId".into()))?;

    let song = state
        .ds
        .read_song(&vote_id)
        .await?
        .ok_or_else(|| PulseError::NotFound(format!("no song {vote_id}")))?;

    let outcome = state.rotation.replace_next_if_stubbed(&vote_id, song.duration_ms).await?;
    let action = match outcome {
        ReplaceNextOutcome::Updated => "updated",
        ReplaceNextOutcome::AlreadySet => "already_set",
    };
    Ok((StatusCode::OK, Json(json!({ "ok": true, "action": action }))).into_response())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

fn reason_str(reason: NoopReason) -> &'static str {
    match reason {
        NoopReason::StaleVersion => "stale_version",
        NoopReason::VoteMismatch => "vote_mismatch",
        NoopReason::VersionMismatch => "version_mismatch",
        NoopReason::AlreadyClosed => "already_closed",
        NoopReason::AlreadySet => "already_set",
        NoopReason::MissingState => "missing_state",
    }
}
