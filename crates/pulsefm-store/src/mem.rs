//! In-memory fakes for `Datastore`/`KvStore`/`TaskQueue`/`EventBus`, used by
//! the engine crates' test suites so RotationEngine/PollEngine/StreamHub
//! logic is exercised without a live Postgres or Redis.

use crate::traits::{Datastore, EventBus, KvStore, RotationCommitResult, TaskQueue};
use async_trait::async_trait;
use pulsefm_core::data::{
    NextSong, NoopReason, PollCloseOutcome, PollState, PollStatus, ReplaceNextOutcome, Song, SongStatus,
    StationRecord,
};
use pulsefm_core::event::Topic;
use pulsefm_core::platform::STUBBED_VOTE_ID;
use pulsefm_core::{PulseError, PulseResult};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Default)]
struct Inner {
    station: Option<StationRecord>,
    poll: Option<PollState>,
    songs: BTreeMap<String, Song>,
}

/// An in-process stand-in for the Postgres-backed document store. A single
/// `Mutex` over all three tables gives it the same serialization guarantee
/// `SELECT ... FOR UPDATE` gives the real adapter, without needing a pool.
pub struct MemDatastore {
    inner: Mutex<Inner>,
}

impl MemDatastore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Test helper: seed an arbitrary ready song directly.
    pub fn insert_song(&self, song: Song) {
        self.inner.lock().unwrap().songs.insert(song.vote_id.clone(), song);
    }

    /// Test helper: seed the station record directly, bypassing rotation.
    pub fn insert_station_for_test(&self, station: StationRecord) {
        self.inner.lock().unwrap().station = Some(station);
    }

    /// Test helper: seed the poll record directly, bypassing PollEngine.
    pub fn insert_poll_for_test(&self, poll: PollState) {
        self.inner.lock().unwrap().poll = Some(poll);
    }
}

impl Default for MemDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemDatastore {
    async fn read_station(&self) -> PulseResult<Option<StationRecord>> {
        Ok(self.inner.lock().unwrap().station.clone())
    }

    async fn read_poll(&self) -> PulseResult<Option<PollState>> {
        Ok(self.inner.lock().unwrap().poll.clone())
    }

    async fn read_song(&self, vote_id: &str) -> PulseResult<Option<Song>> {
        Ok(self.inner.lock().unwrap().songs.get(vote_id).cloned())
    }

    async fn commit_rotation(&self, request_version: i64, now_ms: i64) -> PulseResult<RotationCommitResult> {
        let mut guard = self.inner.lock().unwrap();
        let station = match &guard.station {
            Some(s) => s.clone(),
            None => return Err(PulseError::NotFound("no StationRecord".into())),
        };
        if request_version <= station.version {
            return Ok(RotationCommitResult::Noop {
                reason: NoopReason::StaleVersion,
                current_version: station.version,
            });
        }

        let current_vote_id = station.next.vote_id.clone();
        let current_duration_ms = station.next.duration_ms;
        let end_at = now_ms + current_duration_ms;

        // Step 3: newest `ready` song (excluding the one about to play and
        // `stubbed` itself, which is never eligible here), falling back to
        // `stubbed`.
        let mut ready: Vec<&Song> = guard
            .songs
            .values()
            .filter(|s| {
                s.status == SongStatus::Ready
                    && s.vote_id != current_vote_id
                    && s.vote_id != STUBBED_VOTE_ID
            })
            .collect();
        ready.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let candidate = ready.first().map(|s| (*s).clone());

        let (candidate_id, candidate_duration_ms, candidate_is_stubbed) = match candidate {
            Some(song) => (song.vote_id, song.duration_ms, false),
            None => {
                let stubbed = guard.songs.get(STUBBED_VOTE_ID).cloned().ok_or_else(|| {
                    PulseError::NotFound("no ready song and no stubbed fallback".into())
                })?;
                (stubbed.vote_id, stubbed.duration_ms, true)
            }
        };

        let new_station = StationRecord {
            vote_id: current_vote_id.clone(),
            start_at: now_ms,
            end_at,
            duration_ms: current_duration_ms,
            version: request_version,
            next: NextSong {
                vote_id: candidate_id.clone(),
                duration_ms: candidate_duration_ms,
            },
        };

        if current_vote_id != STUBBED_VOTE_ID {
            if let Some(s) = guard.songs.get_mut(&current_vote_id) {
                s.status = SongStatus::Played;
            }
        }
        if !candidate_is_stubbed {
            if let Some(s) = guard.songs.get_mut(&candidate_id) {
                s.status = SongStatus::Queued;
            }
        }

        guard.station = Some(new_station.clone());
        Ok(RotationCommitResult::Committed(new_station))
    }

    async fn replace_next_if_stubbed(&self, vote_id: &str, duration_ms: i64) -> PulseResult<ReplaceNextOutcome> {
        let mut guard = self.inner.lock().unwrap();
        let station = guard
            .station
            .as_mut()
            .ok_or_else(|| PulseError::NotFound("no StationRecord".into()))?;
        if station.next.vote_id == vote_id && station.next.duration_ms == duration_ms {
            return Ok(ReplaceNextOutcome::AlreadySet);
        }
        if station.next.vote_id != STUBBED_VOTE_ID {
            return Ok(ReplaceNextOutcome::AlreadySet);
        }
        station.next = NextSong {
            vote_id: vote_id.to_string(),
            duration_ms,
        };
        if let Some(song) = guard.songs.get_mut(vote_id) {
            song.status = SongStatus::Queued;
        }
        Ok(ReplaceNextOutcome::Updated)
    }

    async fn write_poll(&self, poll: &PollState) -> PulseResult<()> {
        self.inner.lock().unwrap().poll = Some(poll.clone());
        Ok(())
    }

    async fn close_poll_if_current(
        &self,
        expected_vote_id: &str,
        expected_version: i64,
        winner_option: &str,
        tallies: &BTreeMap<String, i64>,
        closed_at: i64,
    ) -> PulseResult<PollCloseOutcome> {
        let mut guard = self.inner.lock().unwrap();
        let poll = match guard.poll.as_mut() {
            Some(p) => p,
            None => {
                return Ok(PollCloseOutcome::Noop {
                    reason: NoopReason::MissingState,
                })
            }
        };
        if poll.vote_id != expected_vote_id {
            return Ok(PollCloseOutcome::Noop {
                reason: NoopReason::VoteMismatch,
            });
        }
        if poll.version != expected_version {
            return Ok(PollCloseOutcome::Noop {
                reason: NoopReason::VersionMismatch,
            });
        }
        if poll.status == PollStatus::Closed {
            return Ok(PollCloseOutcome::Noop {
                reason: NoopReason::AlreadyClosed,
            });
        }
        poll.status = PollStatus::Closed;
        poll.winner_option = Some(winner_option.to_string());
        poll.tallies = tallies.clone();
        poll.closed_at = Some(closed_at);
        Ok(PollCloseOutcome::Closed {
            vote_id: expected_vote_id.to_string(),
            winner_option: winner_option.to_string(),
        })
    }

    async fn seed_bootstrap(&self, duration_ms: i64) -> PulseResult<bool> {
        let mut guard = self.inner.lock().unwrap();
        if guard.station.is_some() {
            return Ok(false);
        }
        let now = 0;
        // Seeded as `queued`, not `ready` — see the matching comment in
        // `PgDatastore::seed_bootstrap`.
        guard.songs.insert(
            STUBBED_VOTE_ID.to_string(),
            Song {
                vote_id: STUBBED_VOTE_ID.to_string(),
                duration_ms,
                status: SongStatus::Queued,
                created_at: now,
            },
        );
        guard.station = Some(StationRecord {
            vote_id: STUBBED_VOTE_ID.to_string(),
            start_at: now,
            end_at: now + duration_ms,
            duration_ms,
            version: 0,
            next: NextSong {
                vote_id: STUBBED_VOTE_ID.to_string(),
                duration_ms,
            },
        });
        Ok(true)
    }
}

#[derive(Default)]
struct KvInner {
    snapshot: Option<(String, i64)>, // (json, expires_at_ms) — we store absolute-ish for simplicity as remaining ms at write time
    tallies: BTreeMap<String, BTreeMap<String, i64>>,
    voted: BTreeMap<String, std::collections::BTreeSet<String>>,
    sessions: std::collections::BTreeSet<String>,
}

/// In-memory stand-in for the Redis-backed KV store. Script atomicity is
/// trivially preserved because every operation holds the same `Mutex`.
pub struct MemKvStore {
    inner: Mutex<KvInner>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(KvInner::default()),
        }
    }
}

impl Default for MemKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemKvStore {
    async fn kv_open(
        &self,
        snapshot_json: &str,
        snapshot_ttl_sec: i64,
        _state_ttl_sec: i64,
        options: &[String],
    ) -> PulseResult<()> {
        let vote_id = extract_poll_vote_id(snapshot_json)?;
        let mut guard = self.inner.lock().unwrap();
        guard.snapshot = Some((snapshot_json.to_string(), snapshot_ttl_sec * 1000));
        let mut zeroed = BTreeMap::new();
        for opt in options {
            zeroed.insert(opt.clone(), 0);
        }
        guard.tallies.insert(vote_id.clone(), zeroed);
        guard.voted.insert(vote_id, Default::default());
        Ok(())
    }

    async fn kv_vote(&self, vote_id: &str, session_id: &str, option: &str) -> PulseResult<bool> {
        let mut guard = self.inner.lock().unwrap();
        let voted = guard.voted.entry(vote_id.to_string()).or_default();
        let newly = voted.insert(session_id.to_string());
        if newly {
            let tally = guard.tallies.entry(vote_id.to_string()).or_default();
            *tally.entry(option.to_string()).or_insert(0) += 1;
        }
        Ok(newly)
    }

    async fn kv_heartbeat(&self, session_id: &str, _ttl_sec: i64) -> PulseResult<()> {
        self.inner.lock().unwrap().sessions.insert(session_id.to_string());
        Ok(())
    }

    async fn read_snapshot(&self) -> PulseResult<Option<String>> {
        Ok(self.inner.lock().unwrap().snapshot.clone().map(|(j, _)| j))
    }

    async fn read_snapshot_with_ttl(&self) -> PulseResult<Option<(String, i64)>> {
        Ok(self.inner.lock().unwrap().snapshot.clone())
    }

    async fn write_snapshot(&self, json: &str, ttl_sec: i64) -> PulseResult<()> {
        self.inner.lock().unwrap().snapshot = Some((json.to_string(), ttl_sec * 1000));
        Ok(())
    }

    async fn read_tallies(&self, vote_id: &str) -> PulseResult<BTreeMap<String, i64>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tallies
            .get(vote_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn approx_listener_count(&self) -> PulseResult<i64> {
        Ok(self.inner.lock().unwrap().sessions.len() as i64)
    }
}

fn extract_poll_vote_id(snapshot_json: &str) -> PulseResult<String> {
    let v: serde_json::Value = serde_json::from_str(snapshot_json)?;
    v.get("poll")
        .and_then(|p| p.get("voteId"))
        .and_then(|id| id.as_str())
        .map(str::to_string)
        .ok_or_else(|| PulseError::Corrupt("snapshot missing poll.voteId".into()))
}

/// Fires tasks immediately (no real delay) onto a Tokio handle, deduplicated
/// by task id for the lifetime of the fake — good enough to exercise
/// RotationEngine/PollEngine's enqueue call sites in tests.
pub struct MemTaskQueue {
    seen: Mutex<std::collections::BTreeSet<String>>,
    delivered: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl MemTaskQueue {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(Default::default()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<(String, String, serde_json::Value)> {
        self.delivered.lock().unwrap().clone()
    }
}

impl Default for MemTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemTaskQueue {
    async fn enqueue(&self, task_id: &str, _delay_ms: i64, path: &str, body: serde_json::Value) -> PulseResult<()> {
        let mut seen = self.seen.lock().unwrap();
        if !seen.insert(task_id.to_string()) {
            return Ok(());
        }
        drop(seen);
        self.delivered
            .lock()
            .unwrap()
            .push((task_id.to_string(), path.to_string(), body));
        Ok(())
    }
}

/// In-process broadcast EventBus, identical in shape to the real
/// `tokio::sync::broadcast` adapter — kept separate only so tests don't need
/// a running multi-threaded runtime to construct channels.
pub struct MemEventBus {
    playback: broadcast::Sender<String>,
    vote: broadcast::Sender<String>,
    tally: broadcast::Sender<String>,
}

impl MemEventBus {
    pub fn new() -> Self {
        Self {
            playback: broadcast::channel(64).0,
            vote: broadcast::channel(64).0,
            tally: broadcast::channel(64).0,
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<String> {
        match topic {
            Topic::Playback => &self.playback,
            Topic::Vote => &self.vote,
            Topic::Tally => &self.tally,
        }
    }
}

impl Default for MemEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for MemEventBus {
    fn subscribe(&self, topic: Topic) -> broadcast::Receiver<String> {
        self.sender(topic).subscribe()
    }

    fn publish(&self, topic: Topic, payload_json: String) {
        // No subscribers is not an error: publishing is fire-and-forget.
        let _ = self.sender(topic).send(payload_json);
    }
}
