//! `PollEngine` opens a poll at each rotation, admits votes exactly once per
//! session, and closes a poll on its scheduled deadline or when a later
//! rotation force-closes a stale `OPEN` one.

use pulsefm_cache::StateCache;
use pulsefm_core::data::{
    NoopReason, PollCloseOutcome, PollState, PollStatus, Snapshot, VoteOutcome,
};
use pulsefm_core::event::{Topic, VoteEvent};
use pulsefm_core::{PulseError, PulseResult};
use pulsefm_store::{Datastore, EventBus, KvStore};
use std::sync::Arc;

pub struct PollEngine {
    ds: Arc<dyn Datastore>,
    kv: Arc<dyn KvStore>,
    bus: Arc<dyn EventBus>,
    cache: Arc<StateCache>,
}

impl PollEngine {
    pub fn new(ds: Arc<dyn Datastore>, kv: Arc<dyn KvStore>, bus: Arc<dyn EventBus>, cache: Arc<StateCache>) -> Self {
        Self { ds, kv, bus, cache }
    }

    /// `openPoll(version, durationMs)`. `version` is the poll's own
    /// `version` (one more than the previous poll's); it is independent of
    /// StationRecord.version.
    pub async fn open_poll(
        &self,
        version: i64,
        duration_ms: i64,
        options: Vec<String>,
        now_ms: i64,
        snapshot_ttl_sec: i64,
        state_ttl_sec: i64,
        snapshot: &Snapshot,
    ) -> PulseResult<PollState> {
        let vote_id = uuid::Uuid::new_v4().to_string();
        let end_at = now_ms + duration_ms;
        let tallies = options.iter().map(|o| (o.clone(), 0)).collect();

        let poll = PollState {
            vote_id: vote_id.clone(),
            status: PollStatus::Open,
            start_at: now_ms,
            end_at,
            duration_ms,
            options: options.clone(),
            tallies,
            version,
            winner_option: None,
            created_at: now_ms,
            closed_at: None,
        };

        self.ds.write_poll(&poll).await?;

        let mut snapshot_for_kv = snapshot.clone();
        snapshot_for_kv.poll = pulsefm_core::data::SnapshotPoll {
            vote_id: vote_id.clone(),
            options: options.clone(),
            version,
            status: PollStatus::Open,
        };
        let snapshot_json = serde_json::to_string(&snapshot_for_kv)?;
        self.kv
            .kv_open(&snapshot_json, snapshot_ttl_sec, state_ttl_sec, &options)
            .await?;

        self.bus.publish(
            Topic::Vote,
            serde_json::to_string(&VoteEvent::PollOpened {
                vote_id: vote_id.clone(),
                options,
                end_at,
                version,
            })?,
        );

        tracing::info!(vote_id = %vote_id, version, duration_ms, "poll opened");
        Ok(poll)
    }

    /// `closePoll(expectedVoteId, expectedVersion)`. Compare-and-act against
    /// the DS poll record; winner selection happens here, at close time,
    /// never derived later.
    pub async fn close_poll(&self, expected_vote_id: &str, expected_version: i64, now_ms: i64) -> PulseResult<PollCloseOutcome> {
        let tallies = self.kv.read_tallies(expected_vote_id).await?;
        let options: Vec<String> = match self.ds.read_poll().await? {
            Some(poll) if poll.vote_id == expected_vote_id => poll.options,
            _ => tallies.keys().cloned().collect(),
        };

        let winner = pick_winner(&options, &tallies);
        let Some(winner) = winner else {
            return Ok(PollCloseOutcome::Noop {
                reason: NoopReason::MissingState,
            });
        };

        let outcome = self
            .ds
            .close_poll_if_current(expected_vote_id, expected_version, &winner, &tallies, now_ms)
            .await?;

        if let PollCloseOutcome::Closed { vote_id, winner_option } = &outcome {
            if let Err(err) = self.cache.set_poll_status(vote_id, PollStatus::Closed).await {
                tracing::warn!(%err, vote_id = %vote_id, "failed to patch cached snapshot poll status on close");
            }
            self.bus.publish(
                Topic::Vote,
                serde_json::to_string(&VoteEvent::PollClosed {
                    vote_id: vote_id.clone(),
                    winner_option: winner_option.clone(),
                })?,
            );
            tracing::info!(vote_id = %vote_id, winner_option = %winner_option, "poll closed");
        } else if let PollCloseOutcome::Noop { reason } = &outcome {
            tracing::debug!(?reason, vote_id = %expected_vote_id, expected_version, "closePoll no-op");
        }

        Ok(outcome)
    }

    /// `vote(voteId, sessionId, option)`. Validates against the cached
    /// `Snapshot`, then executes the atomic KV-VOTE script; no client-side
    /// read-modify-write path exists.
    pub async fn vote(&self, vote_id: &str, session_id: &str, option: &str, now_ms: i64) -> PulseResult<VoteOutcome> {
        let snapshot = self.cache.get_snapshot(now_ms).await?;

        if snapshot.poll.vote_id != vote_id {
            return Ok(VoteOutcome::VoteNotCurrent);
        }
        if snapshot.poll.status != PollStatus::Open {
            return Ok(VoteOutcome::VoteNotOpen);
        }
        if !snapshot.poll.options.iter().any(|o| o == option) {
            return Ok(VoteOutcome::InvalidOption);
        }

        let newly_counted = self.kv.kv_vote(vote_id, session_id, option).await?;
        if !newly_counted {
            return Ok(VoteOutcome::Duplicate);
        }

        self.bus.publish(
            Topic::Tally,
            serde_json::to_string(&pulsefm_core::event::TallyEvent::Delta {
                vote_id: vote_id.to_string(),
                option: option.to_string(),
                count: 1,
            })?,
        );

        Ok(VoteOutcome::Ok)
    }
}

/// Deterministic-input, uniform-random-choice winner selection: if every
/// tally is zero, choose uniformly among all declared options; if several
/// options tie at the maximum, choose uniformly among the tied set.
fn pick_winner(options: &[String], tallies: &std::collections::BTreeMap<String, i64>) -> Option<String> {
    if options.is_empty() {
        return None;
    }
    let max = options.iter().map(|o| tallies.get(o).copied().unwrap_or(0)).max()?;
    let tied: Vec<&String> = options
        .iter()
        .filter(|o| tallies.get(*o).copied().unwrap_or(0) == max)
        .collect();
    use rand::seq::SliceRandom;
    let mut rng = rand::thread_rng();
    tied.choose(&mut rng).map(|s| (*s).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsefm_core::data::{CurrentSong, NextSong, SnapshotPoll};
    use pulsefm_store::mem::{MemDatastore, MemEventBus, MemKvStore};

    fn empty_snapshot(poll_vote_id: &str, options: &[&str]) -> Snapshot {
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
                vote_id: poll_vote_id.into(),
                options: options.iter().map(|s| s.to_string()).collect(),
                version: 1,
                status: PollStatus::Open,
            },
        }
    }

    fn engine() -> (PollEngine, Arc<MemDatastore>, Arc<MemKvStore>) {
        let ds = Arc::new(MemDatastore::new());
        ds.insert_station_for_test(pulsefm_core::data::StationRecord {
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
        let engine = PollEngine::new(ds.clone(), kv.clone(), bus, cache);
        (engine, ds, kv)
    }

    #[tokio::test]
    async fn open_poll_zeroes_tallies_for_every_option() {
        let (engine, _ds, kv) = engine();
        let snapshot = empty_snapshot("placeholder", &[]);
        let poll = engine
            .open_poll(
                1,
                90_000,
                vec!["dreamy".into(), "driving".into(), "glitchy".into(), "warm".into()],
                0,
                90,
                90,
                &snapshot,
            )
            .await
            .unwrap();

        assert_eq!(poll.options.len(), 4);
        let tallies = kv.read_tallies(&poll.vote_id).await.unwrap();
        assert_eq!(tallies.len(), 4);
        assert!(tallies.values().all(|&v| v == 0));
    }

    #[tokio::test]
    async fn duplicate_vote_from_same_session_is_rejected() {
        let (engine, _ds, kv) = engine();
        let snapshot = empty_snapshot("placeholder", &[]);
        let poll = engine
            .open_poll(1, 90_000, vec!["a".into(), "b".into()], 0, 90, 90, &snapshot)
            .await
            .unwrap();

        let first = engine.vote(&poll.vote_id, "s1", "a", 1_000).await.unwrap();
        let second = engine.vote(&poll.vote_id, "s1", "b", 1_000).await.unwrap();

        assert_eq!(first, VoteOutcome::Ok);
        assert_eq!(second, VoteOutcome::Duplicate);
        let tallies = kv.read_tallies(&poll.vote_id).await.unwrap();
        assert_eq!(tallies["a"], 1);
        assert_eq!(tallies["b"], 0);
    }

    #[tokio::test]
    async fn vote_for_unknown_option_is_rejected_before_kv() {
        let (engine, _ds, kv) = engine();
        let snapshot = empty_snapshot("placeholder", &[]);
        let poll = engine
            .open_poll(1, 90_000, vec!["a".into(), "b".into()], 0, 90, 90, &snapshot)
            .await
            .unwrap();

        let outcome = engine.vote(&poll.vote_id, "s1", "nope", 1_000).await.unwrap();
        assert_eq!(outcome, VoteOutcome::InvalidOption);
        let tallies = kv.read_tallies(&poll.vote_id).await.unwrap();
        assert_eq!(tallies.values().sum::<i64>(), 0);
    }

    #[tokio::test]
    async fn majority_winner_is_selected_deterministically() {
        let (engine, _ds, _kv) = engine();
        let snapshot = empty_snapshot("placeholder", &[]);
        let poll = engine
            .open_poll(
                1,
                90_000,
                vec!["a".into(), "b".into(), "c".into(), "d".into()],
                0,
                90,
                90,
                &snapshot,
            )
            .await
            .unwrap();

        engine.vote(&poll.vote_id, "s1", "a", 1_000).await.unwrap();
        engine.vote(&poll.vote_id, "s2", "a", 1_000).await.unwrap();
        engine.vote(&poll.vote_id, "s3", "b", 1_000).await.unwrap();

        let outcome = engine.close_poll(&poll.vote_id, poll.version, 2_000).await.unwrap();
        match outcome {
            PollCloseOutcome::Closed { winner_option, .. } => assert_eq!(winner_option, "a"),
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_close_of_same_poll_is_noop() {
        let (engine, _ds, _kv) = engine();
        let snapshot = empty_snapshot("placeholder", &[]);
        let poll = engine
            .open_poll(1, 90_000, vec!["a".into(), "b".into()], 0, 90, 90, &snapshot)
            .await
            .unwrap();

        let first = engine.close_poll(&poll.vote_id, poll.version, 1_000).await.unwrap();
        let second = engine.close_poll(&poll.vote_id, poll.version, 2_000).await.unwrap();

        assert!(matches!(first, PollCloseOutcome::Closed { .. }));
        assert!(matches!(
            second,
            PollCloseOutcome::Noop {
                reason: NoopReason::AlreadyClosed
            }
        ));
    }
}
