//! `RotationEngine` advances playback on a self-scheduling timer,
//! force-closing any `OPEN` poll and opening the next one in lock-step,
//! then writing a fresh [`Snapshot`] and scheduling its own follow-up tasks
//! via [`TaskQueue`].

use pulsefm_cache::StateCache;
use pulsefm_core::catalog;
use pulsefm_core::data::{
    CurrentSong, PollCloseOutcome, PollStatus, ReplaceNextOutcome, RotationOutcome, Snapshot,
    SnapshotPoll,
};
use pulsefm_core::event::{PlaybackEvent, Topic};
use pulsefm_core::PulseResult;
use pulsefm_poll::PollEngine;
use pulsefm_store::traits::RotationCommitResult;
use pulsefm_store::{Datastore, EventBus, TaskQueue};
use serde_json::json;
use std::sync::Arc;

pub struct RotationEngine {
    ds: Arc<dyn Datastore>,
    bus: Arc<dyn EventBus>,
    tq: Arc<dyn TaskQueue>,
    cache: Arc<StateCache>,
    poll: Arc<PollEngine>,
    options_per_window: usize,
    vote_close_lead_ms: i64,
}

impl RotationEngine {
    pub fn new(
        ds: Arc<dyn Datastore>,
        bus: Arc<dyn EventBus>,
        tq: Arc<dyn TaskQueue>,
        cache: Arc<StateCache>,
        poll: Arc<PollEngine>,
        options_per_window: usize,
        vote_close_lead_sec: i64,
    ) -> Self {
        Self {
            ds,
            bus,
            tq,
            cache,
            poll,
            options_per_window,
            vote_close_lead_ms: vote_close_lead_sec * 1000,
        }
    }

    /// `tick(requestVersion)`: commit the rotation, force-close any stale
    /// open poll, open the next one, and schedule follow-up tasks.
    pub async fn tick(&self, request_version: i64, now_ms: i64) -> PulseResult<RotationOutcome> {
        let commit = self.ds.commit_rotation(request_version, now_ms).await?;

        let station = match commit {
            RotationCommitResult::Noop { reason, current_version } => {
                tracing::debug!(request_version, current_version, ?reason, "tick no-op");
                return Ok(RotationOutcome::Noop { reason });
            }
            RotationCommitResult::Committed(station) => station,
        };

        tracing::info!(
            vote_id = %station.vote_id,
            version = station.version,
            duration_ms = station.duration_ms,
            next_vote_id = %station.next.vote_id,
            "rotation committed"
        );

        // Step 5: force-close any OPEN poll, then open the next one.
        if let Some(open_poll) = self.ds.read_poll().await? {
            if open_poll.status == PollStatus::Open {
                match self.poll.close_poll(&open_poll.vote_id, open_poll.version, now_ms).await? {
                    PollCloseOutcome::Closed { vote_id, winner_option } => {
                        tracing::info!(vote_id = %vote_id, winner_option = %winner_option, "force-closed stale open poll on rotation");
                    }
                    PollCloseOutcome::Noop { reason } => {
                        tracing::debug!(?reason, "no open poll needed force-closing");
                    }
                }
            }
        }

        let new_poll_version = request_version;
        let new_poll_duration_ms = (station.duration_ms - self.vote_close_lead_ms).max(0);
        let options = catalog::sample_options(self.options_per_window);

        // A snapshot carrying the just-committed station and the about-to-open
        // poll's shape; PollEngine::open_poll fills in the real `voteId` once
        // it mints one, then writes this through KV-OPEN atomically.
        let snapshot_for_open = Snapshot {
            current_song: CurrentSong {
                vote_id: station.vote_id.clone(),
                start_at: station.start_at,
                end_at: station.end_at,
                duration_ms: station.duration_ms,
            },
            next_song: station.next.clone(),
            poll: SnapshotPoll {
                vote_id: String::new(),
                options: options.clone(),
                version: new_poll_version,
                status: PollStatus::Open,
            },
        };

        let snapshot_ttl_sec = (station.duration_ms / 1000).max(1);
        let new_poll = self
            .poll
            .open_poll(
                new_poll_version,
                new_poll_duration_ms,
                options,
                now_ms,
                snapshot_ttl_sec,
                snapshot_ttl_sec,
                &snapshot_for_open,
            )
            .await?;

        // Step 6: write a fresh Snapshot reflecting the just-opened poll.
        let snapshot = Snapshot::compose(&station, &new_poll);
        let snapshot_json = serde_json::to_string(&snapshot)?;
        self.cache.write_through(&snapshot_json, snapshot_ttl_sec).await?;

        // Step 7: publish playback events.
        self.bus.publish(
            Topic::Playback,
            serde_json::to_string(&PlaybackEvent::NextSongChanged {
                next: station.next.clone(),
            })?,
        );
        self.bus.publish(
            Topic::Playback,
            serde_json::to_string(&PlaybackEvent::SongChanged {
                vote_id: station.vote_id.clone(),
                start_at: station.start_at,
                end_at: station.end_at,
                duration_ms: station.duration_ms,
                next: station.next.clone(),
            })?,
        );

        // Step 8: schedule the next tick and the poll-close task, both
        // deterministically keyed so redelivery is a safe no-op.
        let next_tick_id = format!(
            "playback-{}-{}-{}",
            station.vote_id, station.end_at, station.version
        );
        self.tq
            .enqueue(
                &next_tick_id,
                station.duration_ms,
                "/tick",
                json!({ "version": station.version + 1 }),
            )
            .await?;

        let close_delay_ms = (new_poll.end_at - now_ms).max(0);
        let close_task_id = format!("vote-close-{}-{}", new_poll.vote_id, new_poll.version);
        self.tq
            .enqueue(
                &close_task_id,
                close_delay_ms,
                "/vote/close",
                json!({ "voteId": new_poll.vote_id, "version": new_poll.version }),
            )
            .await?;

        Ok(RotationOutcome::Committed { version: station.version })
    }

    /// `replaceNextIfStubbed(voteId, durationMs)`.
    pub async fn replace_next_if_stubbed(&self, vote_id: &str, duration_ms: i64) -> PulseResult<ReplaceNextOutcome> {
        let outcome = self.ds.replace_next_if_stubbed(vote_id, duration_ms).await?;
        if outcome == ReplaceNextOutcome::Updated {
            self.bus.publish(
                Topic::Playback,
                serde_json::to_string(&PlaybackEvent::NextSongChanged {
                    next: pulsefm_core::data::NextSong {
                        vote_id: vote_id.to_string(),
                        duration_ms,
                    },
                })?,
            );
            tracing::info!(vote_id, duration_ms, "replaced stubbed next song");
        }
        Ok(outcome)
    }

    /// Bootstrap: writes the initial `stubbed` Song + StationRecord if
    /// absent, then schedules the first tick. Returns the delay (ms) until
    /// the first scheduled tick.
    pub async fn bootstrap(
        &self,
        stubbed_duration_ms: i64,
        default_startup_delay_ms: i64,
        now_ms: i64,
    ) -> PulseResult<i64> {
        let seeded = self.ds.seed_bootstrap(stubbed_duration_ms).await?;
        if seeded {
            tracing::info!(stubbed_duration_ms, "seeded initial StationRecord and stubbed Song");
        }

        let station = self.ds.read_station().await?;
        let delay_ms = match station.as_ref() {
            Some(s) if s.end_at > now_ms => s.end_at - now_ms,
            _ => default_startup_delay_ms,
        };
        let version = station.map(|s| s.version + 1).unwrap_or(1);

        self.tq
            .enqueue(
                &format!("playback-bootstrap-{now_ms}-{version}"),
                delay_ms,
                "/tick",
                json!({ "version": version }),
            )
            .await?;
        Ok(delay_ms)
    }
}
