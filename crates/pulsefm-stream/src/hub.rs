//! `StreamHub`: per-connection SSE sessions sharing a small set of
//! process-wide caches and event markers.
//!
//! Each marker (`dirty_vote_id`, `last_invalidated`, `last_vote_closed`) is a
//! field on [`StreamHubState`] rather than a module-level global: the struct
//! owns every cache and marker, is constructed once per process, and is
//! shared (via `Arc`) with each connection task.

use pulsefm_cache::StateCache;
use pulsefm_core::data::{PollStatus, Snapshot};
use pulsefm_core::{PulseError, PulseResult};
use pulsefm_store::KvStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Recorded when a `SONG_CHANGED`-worthy playback event lands on
/// `/events/playback`.
#[derive(Debug, Clone, PartialEq)]
pub struct Invalidation {
    pub vote_id: Option<String>,
    pub version: Option<i64>,
    pub ts_ms: i64,
}

/// Recorded when a poll closes, so a just-connected subscriber can catch up
/// on the winner without having watched the live tally.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteClosedMarker {
    pub vote_id: Option<String>,
    pub winner_option: Option<String>,
    pub ts_ms: i64,
}

/// `NEXT-SONG-CHANGED` marker — a connection-visible event distinct from
/// `SONG_CHANGED`, tracked with the same last-event-timestamp shape as its
/// siblings above.
#[derive(Debug, Clone, PartialEq)]
pub struct NextSongMarker {
    pub vote_id: Option<String>,
    pub duration_ms: Option<i64>,
    pub version: Option<i64>,
    pub ts_ms: i64,
}

#[derive(Default)]
struct Markers {
    dirty_vote_id: Option<String>,
    last_invalidated: Option<Invalidation>,
    last_vote_closed: Option<VoteClosedMarker>,
    last_next_song: Option<NextSongMarker>,
}

struct CachedTallies {
    vote_id: String,
    tallies: BTreeMap<String, i64>,
    fetched_at_ms: i64,
}

struct CachedListenerCount {
    count: i64,
    fetched_at_ms: i64,
}

/// Process-wide state shared by every connection in one `pulsefm-stream`
/// instance: the event markers `/events/*` populates, plus two shared
/// caches — a tally read cache with a 500 ms staleness + dirty bit, and a
/// 1 s listener-count cache. Both use a single-flight pattern, holding the
/// async `Mutex` across the refresh `.await`: a second caller blocked on the
/// same lock observes the now-fresh entry instead of issuing its own KV
/// read.
pub struct StreamHubState {
    cache: Arc<StateCache>,
    kv: Arc<dyn KvStore>,
    markers: Mutex<Markers>,
    tally_cache: Mutex<Option<CachedTallies>>,
    listener_cache: Mutex<Option<CachedListenerCount>>,
    tally_staleness_ms: i64,
    listener_staleness_ms: i64,
}

impl StreamHubState {
    pub fn new(cache: Arc<StateCache>, kv: Arc<dyn KvStore>) -> Self {
        Self::with_staleness(cache, kv, 500, 1_000)
    }

    pub fn with_staleness(
        cache: Arc<StateCache>,
        kv: Arc<dyn KvStore>,
        tally_staleness_ms: i64,
        listener_staleness_ms: i64,
    ) -> Self {
        Self {
            cache,
            kv,
            markers: Mutex::new(Markers::default()),
            tally_cache: Mutex::new(None),
            listener_cache: Mutex::new(None),
            tally_staleness_ms,
            listener_staleness_ms,
        }
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    /// `/events/tally` handler logic — marks the poll dirty only if it's
    /// still the one the cached snapshot says is current, guarding against
    /// a stale or redelivered event for a poll that already closed.
    pub async fn on_tally_event(&self, vote_id: &str, now_ms: i64) -> PulseResult<()> {
        let snapshot = self.cache.get_snapshot(now_ms).await?;
        if snapshot.poll.vote_id == vote_id {
            self.markers.lock().await.dirty_vote_id = Some(vote_id.to_string());
        }
        Ok(())
    }

    /// `/events/playback` handler logic for a `SONG_CHANGED`-class event:
    /// reads the cached snapshot first so the invalidation marker carries
    /// the fresh `voteId`/`version` the new snapshot settled on.
    pub async fn on_song_changed(&self, now_ms: i64) -> PulseResult<()> {
        let snapshot = self.cache.get_snapshot(now_ms).await?;
        let mut markers = self.markers.lock().await;
        markers.last_invalidated = Some(Invalidation {
            vote_id: Some(snapshot.poll.vote_id.clone()),
            version: Some(snapshot.poll.version),
            ts_ms: now_ms,
        });
        Ok(())
    }

    /// `/events/playback` handler logic for a `NEXT_SONG_CHANGED` event.
    pub async fn on_next_song_changed(&self, vote_id: &str, duration_ms: i64, version: i64, now_ms: i64) {
        self.markers.lock().await.last_next_song = Some(NextSongMarker {
            vote_id: Some(vote_id.to_string()),
            duration_ms: Some(duration_ms),
            version: Some(version),
            ts_ms: now_ms,
        });
    }

    /// `/events/vote` handler logic for a `CLOSE` event.
    pub async fn on_vote_closed(&self, vote_id: &str, winner_option: &str, now_ms: i64) {
        self.markers.lock().await.last_vote_closed = Some(VoteClosedMarker {
            vote_id: Some(vote_id.to_string()),
            winner_option: Some(winner_option.to_string()),
            ts_ms: now_ms,
        });
    }

    async fn last_invalidated(&self) -> Option<Invalidation> {
        self.markers.lock().await.last_invalidated.clone()
    }

    async fn last_vote_closed(&self) -> Option<VoteClosedMarker> {
        self.markers.lock().await.last_vote_closed.clone()
    }

    async fn last_next_song(&self) -> Option<NextSongMarker> {
        self.markers.lock().await.last_next_song.clone()
    }

    /// Consumes the dirty bit for `vote_id` if set, returning whether a
    /// fresh tally read is warranted — mirrors `_consume_dirty`.
    async fn consume_dirty(&self, vote_id: &str) -> bool {
        let mut markers = self.markers.lock().await;
        if markers.dirty_vote_id.as_deref() == Some(vote_id) {
            markers.dirty_vote_id = None;
            true
        } else {
            false
        }
    }

    /// Forces a fresh tally read, bypassing staleness (used right after
    /// connect and right after a `SONG_CHANGED`/dirty-bit refresh).
    async fn refresh_tallies(&self, vote_id: &str, now_ms: i64) -> PulseResult<BTreeMap<String, i64>> {
        let tallies = self.kv.read_tallies(vote_id).await?;
        *self.tally_cache.lock().await = Some(CachedTallies {
            vote_id: vote_id.to_string(),
            tallies: tallies.clone(),
            fetched_at_ms: now_ms,
        });
        Ok(tallies)
    }

    /// Shared tally read: returns the process-wide cached value if it's for
    /// the same poll and within its staleness window, otherwise reads
    /// through KV and refreshes the cache. Holding the `Mutex` across the
    /// `.await` collapses concurrent readers into one KV round trip.
    pub async fn tallies(&self, vote_id: &str, now_ms: i64) -> PulseResult<BTreeMap<String, i64>> {
        let mut guard = self.tally_cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.vote_id == vote_id && now_ms - cached.fetched_at_ms < self.tally_staleness_ms {
                return Ok(cached.tallies.clone());
            }
        }
        let tallies = self.kv.read_tallies(vote_id).await?;
        *guard = Some(CachedTallies {
            vote_id: vote_id.to_string(),
            tallies: tallies.clone(),
            fetched_at_ms: now_ms,
        });
        Ok(tallies)
    }

    /// KV-HEARTBEAT: refreshes this connection's entry in the active-sessions
    /// set so `listener_count`'s `SCARD` sees it. `ttl_sec` should outlast the
    /// heartbeat interval by a comfortable margin so loop-sleep jitter never
    /// lets a still-connected listener's entry lapse between beats.
    pub async fn heartbeat_session(&self, session_id: &str, ttl_sec: i64) -> PulseResult<()> {
        self.kv.kv_heartbeat(session_id, ttl_sec).await
    }

    /// Shared listener-count read, backed by an approximate
    /// heartbeat-derived count, 1s staleness, same single-flight-by-mutex
    /// shape.
    pub async fn listener_count(&self, now_ms: i64) -> PulseResult<i64> {
        let mut guard = self.listener_cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            if now_ms - cached.fetched_at_ms < self.listener_staleness_ms {
                return Ok(cached.count);
            }
        }
        let count = self.kv.approx_listener_count().await?;
        *guard = Some(CachedListenerCount {
            count,
            fetched_at_ms: now_ms,
        });
        Ok(count)
    }
}

/// Per-option deltas against a previous tally read. Options present before
/// but absent now are emitted with `Δ=0` rather than dropped, so a client
/// watching a fixed set of options never has one silently vanish.
pub fn compute_deltas(previous: &BTreeMap<String, i64>, current: &BTreeMap<String, i64>) -> BTreeMap<String, i64> {
    let mut deltas = BTreeMap::new();
    for (option, &count) in current {
        deltas.insert(option.clone(), count - previous.get(option).copied().unwrap_or(0));
    }
    for option in previous.keys() {
        deltas.entry(option.clone()).or_insert(0);
    }
    deltas
}

/// Tunables for a connection's cooperative loop.
#[derive(Debug, Clone, Copy)]
pub struct StreamTimings {
    pub loop_sleep_ms: u64,
    pub tally_snapshot_interval_ms: i64,
    pub stream_interval_ms: i64,
    pub heartbeat_ms: i64,
}

impl StreamTimings {
    /// `KV-HEARTBEAT`'s TTL: three beats' worth of slack, so one missed tick
    /// under load doesn't drop a still-connected listener from the count.
    fn heartbeat_ttl_sec(&self) -> i64 {
        ((self.heartbeat_ms * 3) / 1000).max(1)
    }
}

/// One per-connection cursor over the shared markers, tracking what this
/// particular subscriber has already emitted so the same marker event is
/// never repeated on this connection.
pub struct Subscriber {
    pub vote_id: String,
    pub version: i64,
    session_id: String,
    last_invalidated_at: i64,
    last_vote_closed_at: i64,
    last_next_song_at: i64,
    last_snapshot_at: i64,
    last_delta_at: i64,
    last_heartbeat_at: i64,
    last_tallies: BTreeMap<String, i64>,
}

/// What a single loop iteration decided to emit, in the fixed order spec
/// §4.4 requires: marker events first (at most one of each kind), then the
/// periodic tally/heartbeat emissions — so a `SONG_CHANGED` is never
/// followed by a `TALLY_DELTA` for the poll it just invalidated (invariant 5).
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    SongChanged { vote_id: Option<String>, version: Option<i64>, ts_ms: i64 },
    VoteClosed { vote_id: Option<String>, winner_option: Option<String>, ts_ms: i64 },
    NextSongChanged { vote_id: Option<String>, duration_ms: Option<i64>, version: Option<i64>, ts_ms: i64 },
    TallySnapshot { vote_id: String, tallies: BTreeMap<String, i64>, status: PollStatus, winner_option: Option<String> },
    TallyDelta { vote_id: String, delta: BTreeMap<String, i64>, listeners: i64 },
    Heartbeat { vote_id: String },
}

impl Subscriber {
    /// Records the connection's reference point: marker timestamps start at
    /// `max(connectedAt, lastKnownEventTs)` so a newly connected client only
    /// sees events that occur after it connects.
    pub async fn connect(snapshot: &Snapshot, state: &StreamHubState, connected_at_ms: i64) -> PulseResult<(Self, BTreeMap<String, i64>)> {
        let initial_tallies = state.refresh_tallies(&snapshot.poll.vote_id, connected_at_ms).await?;

        let last_invalidated_ts = state.last_invalidated().await.map(|m| m.ts_ms).unwrap_or(0);
        let last_vote_closed_ts = state.last_vote_closed().await.map(|m| m.ts_ms).unwrap_or(0);
        let last_next_song_ts = state.last_next_song().await.map(|m| m.ts_ms).unwrap_or(0);

        let subscriber = Subscriber {
            vote_id: snapshot.poll.vote_id.clone(),
            version: snapshot.poll.version,
            session_id: uuid::Uuid::new_v4().to_string(),
            last_invalidated_at: connected_at_ms.max(last_invalidated_ts),
            last_vote_closed_at: connected_at_ms.max(last_vote_closed_ts),
            last_next_song_at: connected_at_ms.max(last_next_song_ts),
            last_snapshot_at: connected_at_ms,
            last_delta_at: 0,
            last_heartbeat_at: 0,
            last_tallies: initial_tallies.clone(),
        };
        Ok((subscriber, initial_tallies))
    }

    /// One cooperative loop iteration. Checks marker events before any
    /// tally emission so a `SONG_CHANGED` can never trail a stale-poll
    /// `TALLY_DELTA` on the same iteration.
    pub async fn poll_iteration(
        &mut self,
        state: &StreamHubState,
        timings: &StreamTimings,
        now_ms: i64,
    ) -> PulseResult<Vec<Emission>> {
        let mut out = Vec::new();

        if let Some(inv) = state.last_invalidated().await {
            if inv.ts_ms > self.last_invalidated_at && inv.version.unwrap_or(i64::MIN) >= self.version {
                out.push(Emission::SongChanged {
                    vote_id: inv.vote_id.clone(),
                    version: inv.version,
                    ts_ms: inv.ts_ms,
                });
                self.last_invalidated_at = inv.ts_ms;

                // Reset baseline and re-read the Snapshot.
                let snapshot = state.cache().get_snapshot(now_ms).await?;
                self.vote_id = snapshot.poll.vote_id.clone();
                self.version = inv.version.unwrap_or(snapshot.poll.version);
                self.last_tallies = BTreeMap::new();
                self.last_snapshot_at = 0;
                self.last_delta_at = 0;
            }
        }

        if let Some(vc) = state.last_vote_closed().await {
            if vc.ts_ms > self.last_vote_closed_at {
                out.push(Emission::VoteClosed {
                    vote_id: vc.vote_id.clone(),
                    winner_option: vc.winner_option.clone(),
                    ts_ms: vc.ts_ms,
                });
                self.last_vote_closed_at = vc.ts_ms;
            }
        }

        if let Some(ns) = state.last_next_song().await {
            if ns.ts_ms > self.last_next_song_at {
                out.push(Emission::NextSongChanged {
                    vote_id: ns.vote_id.clone(),
                    duration_ms: ns.duration_ms,
                    version: ns.version,
                    ts_ms: ns.ts_ms,
                });
                self.last_next_song_at = ns.ts_ms;
            }
        }

        if now_ms - self.last_snapshot_at >= timings.tally_snapshot_interval_ms {
            let tallies = state.tallies(&self.vote_id, now_ms).await?;
            self.last_tallies = tallies.clone();
            let poll = state.cache().get_snapshot(now_ms).await?.poll;
            out.push(Emission::TallySnapshot {
                vote_id: self.vote_id.clone(),
                tallies,
                status: poll.status,
                winner_option: None,
            });
            self.last_snapshot_at = now_ms;
        }

        if now_ms - self.last_delta_at >= timings.stream_interval_ms {
            let dirty = state.consume_dirty(&self.vote_id).await;
            let delta = if dirty {
                let tallies = state.tallies(&self.vote_id, now_ms).await?;
                let delta = compute_deltas(&self.last_tallies, &tallies);
                self.last_tallies = tallies;
                delta
            } else {
                self.last_tallies.keys().map(|k| (k.clone(), 0)).collect()
            };
            let listeners = state.listener_count(now_ms).await?;
            out.push(Emission::TallyDelta {
                vote_id: self.vote_id.clone(),
                delta,
                listeners,
            });
            self.last_delta_at = now_ms;
        }

        if now_ms - self.last_heartbeat_at >= timings.heartbeat_ms {
            state
                .heartbeat_session(&self.session_id, timings.heartbeat_ttl_sec())
                .await?;
            out.push(Emission::Heartbeat { vote_id: self.vote_id.clone() });
            self.last_heartbeat_at = now_ms;
        }

        let _ = timings.loop_sleep_ms; // consumed by the caller's sleep between iterations
        Ok(out)
    }
}

pub fn validate_initial_snapshot(snapshot: &Snapshot) -> PulseResult<()> {
    if snapshot.poll.vote_id.is_empty() {
        return Err(PulseError::Corrupt("snapshot poll.voteId is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsefm_core::data::{CurrentSong, NextSong, SnapshotPoll};
    use pulsefm_store::mem::{MemDatastore, MemKvStore};

    fn snapshot(vote_id: &str, options: &[&str]) -> Snapshot {
        Snapshot {
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
                vote_id: vote_id.into(),
                options: options.iter().map(|s| s.to_string()).collect(),
                version: 1,
                status: PollStatus::Open,
            },
        }
    }

    fn timings() -> StreamTimings {
        StreamTimings {
            loop_sleep_ms: 50,
            tally_snapshot_interval_ms: 10_000,
            stream_interval_ms: 500,
            heartbeat_ms: 15_000,
        }
    }

    #[test]
    fn compute_deltas_zero_fills_disappeared_options() {
        let mut previous = BTreeMap::new();
        previous.insert("a".to_string(), 3);
        previous.insert("b".to_string(), 1);
        let mut current = BTreeMap::new();
        current.insert("a".to_string(), 5);

        let deltas = compute_deltas(&previous, &current);
        assert_eq!(deltas.get("a"), Some(&2));
        assert_eq!(deltas.get("b"), Some(&0));
    }

    #[test]
    fn compute_deltas_on_empty_previous_is_absolute_counts() {
        let previous = BTreeMap::new();
        let mut current = BTreeMap::new();
        current.insert("a".to_string(), 2);
        let deltas = compute_deltas(&previous, &current);
        assert_eq!(deltas.get("a"), Some(&2));
    }

    async fn harness() -> (Arc<StreamHubState>, Snapshot) {
        let ds = Arc::new(MemDatastore::new());
        let kv = Arc::new(MemKvStore::new());
        let snap = snapshot("poll-1", &["a", "b"]);
        kv.write_snapshot(&serde_json::to_string(&snap).unwrap(), 90).await.unwrap();
        let cache = Arc::new(StateCache::new(ds, kv.clone()));
        (Arc::new(StreamHubState::new(cache, kv)), snap)
    }

    #[tokio::test]
    async fn connect_emits_baseline_tallies_from_kv() {
        let (state, snap) = harness().await;
        state.kv.kv_vote("poll-1", "s1", "a").await.unwrap();
        let (_, tallies) = Subscriber::connect(&snap, &state, 0).await.unwrap();
        assert_eq!(tallies.get("a"), Some(&1));
    }

    #[tokio::test]
    async fn song_changed_never_followed_by_delta_for_old_vote_id_same_iteration() {
        let (state, snap) = harness().await;
        let (mut sub, _) = Subscriber::connect(&snap, &state, 0).await.unwrap();

        state.on_song_changed(1_000).await.unwrap();
        let emissions = sub.poll_iteration(&state, &timings(), 1_050).await.unwrap();

        let song_changed_idx = emissions.iter().position(|e| matches!(e, Emission::SongChanged { .. }));
        let delta_idx = emissions.iter().position(|e| matches!(e, Emission::TallyDelta { vote_id, .. } if vote_id == "poll-1"));
        assert!(song_changed_idx.is_some());
        // No TALLY_DELTA for the pre-changeover voteId should appear after SONG_CHANGED.
        if let (Some(sc), Some(d)) = (song_changed_idx, delta_idx) {
            assert!(sc < d || sub.vote_id != "poll-1");
        }
    }

    #[tokio::test]
    async fn marker_event_emitted_at_most_once_per_connection() {
        let (state, snap) = harness().await;
        let (mut sub, _) = Subscriber::connect(&snap, &state, 0).await.unwrap();

        state.on_vote_closed("poll-1", "a", 1_000).await;
        let first = sub.poll_iteration(&state, &timings(), 1_050).await.unwrap();
        let second = sub.poll_iteration(&state, &timings(), 1_100).await.unwrap();

        assert!(first.iter().any(|e| matches!(e, Emission::VoteClosed { .. })));
        assert!(!second.iter().any(|e| matches!(e, Emission::VoteClosed { .. })));
    }

    #[tokio::test]
    async fn stale_version_invalidation_is_dropped() {
        let (state, snap) = harness().await;
        let (mut sub, _) = Subscriber::connect(&snap, &state, 0).await.unwrap();
        sub.version = 5;

        // An invalidation carrying a version older than what this
        // connection has already seen must be dropped.
        {
            let mut markers = state.markers.lock().await;
            markers.last_invalidated = Some(Invalidation {
                vote_id: Some("poll-1".into()),
                version: Some(3),
                ts_ms: 1_000,
            });
        }
        let emissions = sub.poll_iteration(&state, &timings(), 1_050).await.unwrap();
        assert!(!emissions.iter().any(|e| matches!(e, Emission::SongChanged { .. })));
    }

    #[tokio::test]
    async fn heartbeat_and_snapshot_fire_on_first_iteration_when_due() {
        let (state, snap) = harness().await;
        let (mut sub, _) = Subscriber::connect(&snap, &state, 0).await.unwrap();
        let emissions = sub.poll_iteration(&state, &timings(), 20_000).await.unwrap();
        assert!(emissions.iter().any(|e| matches!(e, Emission::TallySnapshot { .. })));
        assert!(emissions.iter().any(|e| matches!(e, Emission::Heartbeat { .. })));
    }

    #[tokio::test]
    async fn heartbeat_emission_registers_listener_in_approx_count() {
        let (state, snap) = harness().await;
        let (mut sub, _) = Subscriber::connect(&snap, &state, 0).await.unwrap();

        assert_eq!(state.listener_count(0).await.unwrap(), 0);
        sub.poll_iteration(&state, &timings(), 20_000).await.unwrap();
        assert_eq!(state.listener_count(20_000).await.unwrap(), 1);
    }
}
