use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use pulsefm_core::data::VoteOutcome;
use pulsefm_core::{PulseError, PulseResult};
use pulsefm_poll::PollEngine;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub poll: Arc<PollEngine>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/vote", post(vote))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    #[serde(rename = "voteId")]
    vote_id: Option<String>,
    option: Option<String>,
}

/// `POST /vote` — maps [`VoteOutcome`] onto status codes: 200 `ok`, 400 for
/// malformed input, 409 for `duplicate`/`vote_not_open`/`invalid_option`
/// once a poll is known to exist, 500 when KV is unreachable (via
/// `PulseError`'s own `IntoResponse`).
async fn vote(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<VoteRequest>) -> Response {
    match handle_vote(state, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_vote(state: AppState, headers: HeaderMap, body: VoteRequest) -> PulseResult<Response> {
    let session_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PulseError::Validation("missing X-Session-Id header".into()))?
        .to_string();
    let vote_id = body
        .vote_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PulseError::Validation("missing voteId".into()))?;
    let option = body
        .option
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PulseError::Validation("missing option".into()))?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let outcome = state.poll.vote(&vote_id, &session_id, &option, now_ms).await?;

    let response = match outcome {
        VoteOutcome::Ok => {
            tracing::info!(vote_id = %vote_id, session_id = %session_id, option = %option, "vote admitted");
            (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
        }
        VoteOutcome::Duplicate => {
            (StatusCode::CONFLICT, Json(json!({ "status": "duplicate" }))).into_response()
        }
        VoteOutcome::VoteNotOpen => {
            (StatusCode::CONFLICT, Json(json!({ "status": "vote_not_open" }))).into_response()
        }
        VoteOutcome::VoteNotCurrent => {
            (StatusCode::CONFLICT, Json(json!({ "status": "vote_not_current" }))).into_response()
        }
        VoteOutcome::InvalidOption => {
            (StatusCode::BAD_REQUEST, Json(json!({ "status": "invalid_option" }))).into_response()
        }
    };
    Ok(response)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pulsefm_cache::StateCache;
    use pulsefm_core::data::{NextSong, StationRecord};
    use pulsefm_store::mem::{MemDatastore, MemEventBus, MemKvStore};
    use tower::ServiceExt;

    async fn harness_with_open_poll() -> (Router, String) {
        let ds = Arc::new(MemDatastore::new());
        ds.insert_station_for_test(StationRecord {
            vote_id: "song-a".into(),
            start_at: 0,
            end_at: 90_000,
            duration_ms: 90_000,
            version: 1,
            next: NextSong {
                vote_id: "song-b".into(),
                duration_ms: 60_000,
            },
        });
        let kv = Arc::new(MemKvStore::new());
        let bus = Arc::new(MemEventBus::new());
        let cache = Arc::new(StateCache::new(ds.clone(), kv.clone()));
        let poll = Arc::new(PollEngine::new(ds.clone(), kv.clone(), bus, cache.clone()));

        let snapshot = cache.get_snapshot(0).await.unwrap();
        let opened = poll
            .open_poll(1, 90_000, vec!["a".into(), "b".into()], 0, 90, 90, &snapshot)
            .await
            .unwrap();

        let router = build_router(AppState { poll });
        (router, opened.vote_id)
    }

    #[tokio::test]
    async fn vote_without_session_header_is_400() {
        let (router, vote_id) = harness_with_open_poll().await;
        let body = format!(r#"{{"voteId":"{vote_id}","option":"a"}}"#);
        let req = Request::post("/vote")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn first_vote_ok_second_duplicate_conflict() {
        let (router, vote_id) = harness_with_open_poll().await;
        let body = format!(r#"{{"voteId":"{vote_id}","option":"a"}}"#);

        let req = Request::post("/vote")
            .header("content-type", "application/json")
            .header("x-session-id", "s1")
            .body(Body::from(body.clone()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::post("/vote")
            .header("content-type", "application/json")
            .header("x-session-id", "s1")
            .body(Body::from(body))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn vote_for_unknown_option_is_400() {
        let (router, vote_id) = harness_with_open_poll().await;
        let body = format!(r#"{{"voteId":"{vote_id}","option":"nope"}}"#);
        let req = Request::post("/vote")
            .header("content-type", "application/json")
            .header("x-session-id", "s1")
            .body(Body::from(body))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_check_ok() {
        let (router, _vote_id) = harness_with_open_poll().await;
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
