//! The DS/KV/TQ/EventBus boundary traits. RotationEngine/PollEngine/
//! StateCache/StreamHub depend only on these, never on `sqlx`/`redis`/
//! `reqwest` directly, so the `mem` fakes can stand in for a live
//! Postgres/Redis during tests.

use async_trait::async_trait;
use pulsefm_core::data::{NoopReason, PollCloseOutcome, PollState, ReplaceNextOutcome, Song, StationRecord};
use pulsefm_core::event::Topic;
use pulsefm_core::PulseResult;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Result of the transactional "steps 1-4" of RotationEngine's algorithm.
/// The candidate-selection read and the station/song writes
/// happen inside one DS transaction, so the trait exposes the whole step as
/// a single call rather than individual reads and writes RotationEngine
/// would have to sequence itself without a shared lock.
#[derive(Debug, Clone, PartialEq)]
pub enum RotationCommitResult {
    Committed(StationRecord),
    Noop { reason: NoopReason, current_version: i64 },
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn read_station(&self) -> PulseResult<Option<StationRecord>>;
    async fn read_poll(&self) -> PulseResult<Option<PollState>>;
    async fn read_song(&self, vote_id: &str) -> PulseResult<Option<Song>>;

    /// Runs as one DS transaction with a row lock on the station document to
    /// serialize concurrent tick attempts.
    async fn commit_rotation(&self, request_version: i64, now_ms: i64) -> PulseResult<RotationCommitResult>;

    /// Replaces the stubbed next-up song once the real encode is ready.
    async fn replace_next_if_stubbed(&self, vote_id: &str, duration_ms: i64) -> PulseResult<ReplaceNextOutcome>;

    /// Unconditional write of the singleton poll document — used to open a
    /// fresh poll, which never races because only RotationEngine opens one.
    async fn write_poll(&self, poll: &PollState) -> PulseResult<()>;

    /// Compare-and-write close: only takes effect if the stored poll's
    /// `voteId`/`version`/status still match what the caller expects.
    async fn close_poll_if_current(
        &self,
        expected_vote_id: &str,
        expected_version: i64,
        winner_option: &str,
        tallies: &BTreeMap<String, i64>,
        closed_at: i64,
    ) -> PulseResult<PollCloseOutcome>;

    /// Bootstrap seed: writes the initial `stubbed` Song and StationRecord,
    /// no-op if a StationRecord already exists. Returns whether it actually
    /// seeded.
    async fn seed_bootstrap(&self, duration_ms: i64) -> PulseResult<bool>;
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// KV-OPEN: initializes the snapshot, tally hash, and voted set for a
    /// freshly opened poll in one script invocation.
    async fn kv_open(
        &self,
        snapshot_json: &str,
        snapshot_ttl_sec: i64,
        state_ttl_sec: i64,
        options: &[String],
    ) -> PulseResult<()>;

    /// KV-VOTE: returns `true` if this is the session's first vote in the
    /// poll (and the tally was incremented), `false` if already voted.
    async fn kv_vote(&self, vote_id: &str, session_id: &str, option: &str) -> PulseResult<bool>;

    /// KV-HEARTBEAT: records a listener session for approximate counting.
    async fn kv_heartbeat(&self, session_id: &str, ttl_sec: i64) -> PulseResult<()>;

    async fn read_snapshot(&self) -> PulseResult<Option<String>>;

    /// Returns the JSON body and remaining TTL in milliseconds, so callers
    /// that need to mutate-and-preserve-TTL (StateCache::setPollStatus)
    /// don't have to guess a new one.
    async fn read_snapshot_with_ttl(&self) -> PulseResult<Option<(String, i64)>>;

    async fn write_snapshot(&self, json: &str, ttl_sec: i64) -> PulseResult<()>;

    async fn read_tallies(&self, vote_id: &str) -> PulseResult<BTreeMap<String, i64>>;

    /// Approximate count of recently-heartbeated sessions; no precision
    /// claim.
    async fn approx_listener_count(&self) -> PulseResult<i64>;
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a self-POST to `path` with `body`, firing after `delay_ms`,
    /// suppressed if `task_id` was already enqueued within its own delay
    /// window.
    async fn enqueue(&self, task_id: &str, delay_ms: i64, path: &str, body: serde_json::Value) -> PulseResult<()>;
}

/// In-process pub/sub, one broadcast channel per topic. Not `async` because
/// `broadcast::Sender::send` doesn't suspend — publishing never blocks on a
/// slow subscriber.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, topic: Topic) -> broadcast::Receiver<String>;
    fn publish(&self, topic: Topic, payload_json: String);
}
