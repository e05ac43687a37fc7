use crate::hub::{Emission, StreamHubState, StreamTimings, Subscriber};
use async_stream::stream;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use pulsefm_core::event::{PlaybackEvent, VoteEvent};
use pulsefm_core::{PulseError, PulseResult};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<StreamHubState>,
    pub timings: StreamTimings,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(stream_votes))
        .route("/state", get(state_handler))
        .route("/events/tally", post(tally_event))
        .route("/events/playback", post(playback_event))
        .route("/events/vote", post(vote_event))
        .route("/health", get(health))
        .with_state(state)
}

fn format_event(event: &str, data: serde_json::Value) -> Event {
    Event::default().event(event).data(data.to_string())
}

/// `GET /stream` — the per-connection loop, as an `async_stream::stream!`
/// generator over a broadcast-backed SSE source. `axum::response::sse::Sse`
/// already sets `Content-Type: text/event-stream` and `Cache-Control:
/// no-cache`; `Connection: keep-alive` and `X-Accel-Buffering: no` (so a
/// reverse proxy in front of this service doesn't buffer the response) are
/// added on top.
async fn stream_votes(State(state): State<AppState>) -> Response {
    let headers = [
        (axum::http::header::CONNECTION, "keep-alive"),
        (axum::http::HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    (headers, build_sse(state)).into_response()
}

fn build_sse(state: AppState) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let hub = state.hub;
    let timings = state.timings;

    let generator = stream! {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let snapshot = match hub.cache().get_snapshot(now_ms).await {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(%err, "failed to load snapshot for new stream connection");
                yield Ok(format_event("ERROR", json!({"message": err.to_string()})));
                return;
            }
        };

        let (mut subscriber, initial_tallies) = match Subscriber::connect(&snapshot, &hub, now_ms).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!(%err, "failed to initialize stream subscriber");
                yield Ok(format_event("ERROR", json!({"message": err.to_string()})));
                return;
            }
        };

        yield Ok(format_event(
            "HELLO",
            json!({
                "voteId": subscriber.vote_id,
                "ts": now_ms,
                "version": subscriber.version,
                "heartbeatSec": timings.heartbeat_ms / 1000,
            }),
        ));
        yield Ok(format_event(
            "TALLY_SNAPSHOT",
            json!({
                "voteId": subscriber.vote_id,
                "ts": now_ms,
                "tallies": initial_tallies,
                "status": snapshot.poll.status,
                "winnerOption": serde_json::Value::Null,
            }),
        ));

        loop {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let emissions = match subscriber.poll_iteration(&hub, &timings, now_ms).await {
                Ok(e) => e,
                Err(err) => {
                    tracing::error!(%err, "stream iteration failed");
                    yield Ok(format_event("ERROR", json!({"message": err.to_string()})));
                    break;
                }
            };

            for emission in emissions {
                yield Ok(emission_to_event(emission, now_ms));
            }

            tokio::time::sleep(Duration::from_millis(timings.loop_sleep_ms)).await;
        }
    };

    Sse::new(generator).keep_alive(KeepAlive::default())
}

fn emission_to_event(emission: Emission, now_ms: i64) -> Event {
    match emission {
        Emission::SongChanged { vote_id, version, ts_ms } => format_event(
            "SONG_CHANGED",
            json!({ "voteId": vote_id, "version": version, "ts": ts_ms }),
        ),
        Emission::VoteClosed { vote_id, winner_option, ts_ms } => format_event(
            "VOTE_CLOSED",
            json!({ "voteId": vote_id, "winnerOption": winner_option, "ts": ts_ms }),
        ),
        Emission::NextSongChanged { vote_id, duration_ms, version, ts_ms } => format_event(
            "NEXT-SONG-CHANGED",
            json!({ "voteId": vote_id, "durationMs": duration_ms, "version": version, "ts": ts_ms }),
        ),
        Emission::TallySnapshot { vote_id, tallies, status, winner_option } => format_event(
            "TALLY_SNAPSHOT",
            json!({ "voteId": vote_id, "ts": now_ms, "tallies": tallies, "status": status, "winnerOption": winner_option }),
        ),
        Emission::TallyDelta { vote_id, delta, listeners } => format_event(
            "TALLY_DELTA",
            json!({ "voteId": vote_id, "ts": now_ms, "delta": delta, "listeners": listeners }),
        ),
        Emission::Heartbeat { vote_id } => {
            format_event("HEARTBEAT", json!({ "voteId": vote_id, "ts": now_ms }))
        }
    }
}

/// `GET /state` — a plain-HTTP snapshot + tallies read for clients that
/// don't want an SSE connection.
async fn state_handler(State(state): State<AppState>) -> Response {
    match handle_state(state).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn handle_state(state: AppState) -> PulseResult<Response> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let snapshot = state.hub.cache().get_snapshot(now_ms).await?;
    let tallies = state.hub.tallies(&snapshot.poll.vote_id, now_ms).await?;
    Ok(Json(json!({
        "currentSong": snapshot.current_song,
        "nextSong": snapshot.next_song,
        "poll": {
            "voteId": snapshot.poll.vote_id,
            "options": snapshot.poll.options,
            "version": snapshot.poll.version,
            "status": snapshot.poll.status,
            "tallies": tallies,
        },
        "ts": now_ms,
    }))
    .into_response())
}

/// `POST /events/tally` — stands in for broker-based Pub/Sub: rather than
/// subscribing to a topic (this service is a separate OS process from the
/// one publishing), the publisher POSTs the same payload it would have put
/// on the topic.
async fn tally_event(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    match handle_tally_event(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn handle_tally_event(state: AppState, body: axum::body::Bytes) -> PulseResult<Response> {
    let event: pulsefm_core::event::TallyEvent =
        serde_json::from_slice(&body).map_err(|e| PulseError::Validation(e.to_string()))?;
    let vote_id = match &event {
        pulsefm_core::event::TallyEvent::Snapshot { vote_id, .. } => vote_id.clone(),
        pulsefm_core::event::TallyEvent::Delta { vote_id, .. } => vote_id.clone(),
    };
    let now_ms = chrono::Utc::now().timestamp_millis();
    state.hub.on_tally_event(&vote_id, now_ms).await?;
    Ok(Json(json!({ "status": "ok" })).into_response())
}

/// `POST /events/playback` — handles both `SONG_CHANGED` and
/// `NEXT_SONG_CHANGED`, the two variants RotationEngine publishes.
async fn playback_event(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    match handle_playback_event(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn handle_playback_event(state: AppState, body: axum::body::Bytes) -> PulseResult<Response> {
    let event: PlaybackEvent = serde_json::from_slice(&body).map_err(|e| PulseError::Validation(e.to_string()))?;
    let now_ms = chrono::Utc::now().timestamp_millis();
    match event {
        PlaybackEvent::SongChanged { .. } => {
            state.hub.on_song_changed(now_ms).await?;
        }
        PlaybackEvent::NextSongChanged { next } => {
            let snapshot = state.hub.cache().get_snapshot(now_ms).await?;
            state
                .hub
                .on_next_song_changed(&next.vote_id, next.duration_ms, snapshot.poll.version, now_ms)
                .await;
        }
    }
    Ok(Json(json!({ "status": "ok" })).into_response())
}

/// `POST /events/vote` — only `POLL_CLOSED` carries a marker worth
/// recording; `POLL_OPENED` is a no-op here since subscribers learn about a
/// newly opened poll from the snapshot itself.
async fn vote_event(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    match handle_vote_event(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn handle_vote_event(state: AppState, body: axum::body::Bytes) -> PulseResult<Response> {
    let event: VoteEvent = serde_json::from_slice(&body).map_err(|e| PulseError::Validation(e.to_string()))?;
    match event {
        VoteEvent::PollClosed { vote_id, winner_option } => {
            let now_ms = chrono::Utc::now().timestamp_millis();
            state.hub.on_vote_closed(&vote_id, &winner_option, now_ms).await;
            Ok(Json(json!({ "status": "ok" })).into_response())
        }
        VoteEvent::PollOpened { .. } => Ok(Json(json!({ "status": "ignored" })).into_response()),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pulsefm_cache::StateCache;
    use pulsefm_core::data::{CurrentSong, NextSong, PollStatus, Snapshot, SnapshotPoll};
    use pulsefm_store::mem::{MemDatastore, MemKvStore};
    use tower::ServiceExt;

    fn timings() -> StreamTimings {
        StreamTimings {
            loop_sleep_ms: 50,
            tally_snapshot_interval_ms: 10_000,
            stream_interval_ms: 500,
            heartbeat_ms: 15_000,
        }
    }

    async fn harness() -> Router {
        let ds = Arc::new(MemDatastore::new());
        let kv = Arc::new(MemKvStore::new());
        let snapshot = Snapshot {
            current_song: CurrentSong {
                vote_id: "song-a".into(),
                start_at: 0,
                end_at: 90_000,
                duration_ms: 90_000,
            },
            next_song: NextSong {
                vote_id: "song-b".into(),
                duration_ms: 60_000,
            },
            poll: SnapshotPoll {
                vote_id: "poll-1".into(),
                options: vec!["a".into(), "b".into()],
                version: 1,
                status: PollStatus::Open,
            },
        };
        kv.write_snapshot(&serde_json::to_string(&snapshot).unwrap(), 90)
            .await
            .unwrap();
        let cache = Arc::new(StateCache::new(ds, kv.clone()));
        let hub = Arc::new(StreamHubState::new(cache, kv));
        build_router(AppState { hub, timings: timings() })
    }

    #[tokio::test]
    async fn health_check_ok() {
        let router = harness().await;
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn state_endpoint_returns_tallies() {
        let router = harness().await;
        let req = Request::get("/state").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["poll"]["voteId"], "poll-1");
    }

    #[tokio::test]
    async fn tally_event_for_unknown_vote_id_is_ignored_without_error() {
        let router = harness().await;
        let payload = json!({
            "type": "TALLY_DELTA",
            "voteId": "some-other-poll",
            "option": "a",
            "count": 1
        });
        let req = Request::post("/events/tally")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn playback_song_changed_event_is_accepted() {
        let router = harness().await;
        let payload = json!({
            "type": "SONG_CHANGED",
            "voteId": "poll-1",
            "startAt": 0,
            "endAt": 90_000,
            "durationMs": 90_000,
            "next": {"voteId": "song-b", "durationMs": 60_000}
        });
        let req = Request::post("/events/playback")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn vote_poll_opened_event_is_ignored() {
        let router = harness().await;
        let payload = json!({
            "type": "POLL_OPENED",
            "voteId": "poll-1",
            "options": ["a", "b"],
            "endAt": 90_000,
            "version": 1
        });
        let req = Request::post("/events/vote")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ignored");
    }
}
