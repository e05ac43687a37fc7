//! Postgres-backed `Datastore`. Every document-shaped entity lives in a
//! `(id TEXT PRIMARY KEY, data JSONB)` table — no bespoke schema per entity,
//! so new fields on `StationRecord`/`PollState`/`Song` never need a
//! migration of their own.
//!
//! `commit_rotation` takes a `SELECT ... FOR UPDATE` row lock on the station
//! document for the duration of one `sqlx::Transaction`: concurrent `tick`
//! callers serialize on that lock rather than racing a read-modify-write.

use crate::traits::{Datastore, RotationCommitResult};
use async_trait::async_trait;
use pulsefm_core::data::{
    NextSong, NoopReason, PollCloseOutcome, PollState, ReplaceNextOutcome, Song, SongStatus,
    StationRecord,
};
use pulsefm_core::platform::{POLL_DOC_ID, STATION_DOC_ID, STUBBED_VOTE_ID};
use pulsefm_core::{PulseError, PulseResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeMap;

pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub async fn connect(url: &str, max_connections: u32) -> PulseResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(PulseError::from)?;
        Ok(Self { pool })
    }

    /// Creates the three document tables if absent. Idempotent; called once
    /// at process start by each binary before it begins serving traffic.
    pub async fn migrate(&self) -> PulseResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stations (id TEXT PRIMARY KEY, data JSONB NOT NULL);
            CREATE TABLE IF NOT EXISTS poll_state (id TEXT PRIMARY KEY, data JSONB NOT NULL);
            CREATE TABLE IF NOT EXISTS songs (id TEXT PRIMARY KEY, data JSONB NOT NULL);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(PulseError::from)?;
        Ok(())
    }

    async fn read_station_tx(tx: &mut Transaction<'_, Postgres>) -> PulseResult<Option<StationRecord>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT data FROM stations WHERE id = $1 FOR UPDATE")
                .bind(STATION_DOC_ID)
                .fetch_optional(&mut **tx)
                .await
                .map_err(PulseError::from)?;
        row.map(|(v,)| serde_json::from_value(v).map_err(PulseError::from))
            .transpose()
    }

    async fn write_station_tx(
        tx: &mut Transaction<'_, Postgres>,
        station: &StationRecord,
    ) -> PulseResult<()> {
        let data = serde_json::to_value(station)?;
        sqlx::query(
            "INSERT INTO stations (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(STATION_DOC_ID)
        .bind(data)
        .execute(&mut **tx)
        .await
        .map_err(PulseError::from)?;
        Ok(())
    }

    async fn read_song_tx(tx: &mut Transaction<'_, Postgres>, vote_id: &str) -> PulseResult<Option<Song>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT data FROM songs WHERE id = $1 FOR UPDATE")
            .bind(vote_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(PulseError::from)?;
        row.map(|(v,)| serde_json::from_value(v).map_err(PulseError::from))
            .transpose()
    }

    async fn write_song_tx(tx: &mut Transaction<'_, Postgres>, song: &Song) -> PulseResult<()> {
        let data = serde_json::to_value(song)?;
        sqlx::query(
            "INSERT INTO songs (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(&song.vote_id)
        .bind(data)
        .execute(&mut **tx)
        .await
        .map_err(PulseError::from)?;
        Ok(())
    }

    /// Newest `ready` song, excluding `exclude_vote_id` and the `stubbed`
    /// fallback itself (which is never eligible via this scan — it's only
    /// ever picked up by the caller reading it back directly by id),
    /// ordered by `created_at DESC` so ties break toward the most recently
    /// generated.
    async fn pick_ready_candidate_tx(
        tx: &mut Transaction<'_, Postgres>,
        exclude_vote_id: &str,
    ) -> PulseResult<Option<Song>> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT data FROM songs
             WHERE data->>'status' = 'ready' AND id <> $1 AND id <> $2
             ORDER BY (data->>'createdAt')::bigint DESC
             LIMIT 10",
        )
        .bind(exclude_vote_id)
        .bind(STUBBED_VOTE_ID)
        .fetch_all(&mut **tx)
        .await
        .map_err(PulseError::from)?;
        for (v,) in rows {
            return Ok(Some(serde_json::from_value(v)?));
        }
        Ok(None)
    }
}

#[async_trait]
impl Datastore for PgDatastore {
    async fn read_station(&self) -> PulseResult<Option<StationRecord>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT data FROM stations WHERE id = $1")
            .bind(STATION_DOC_ID)
            .fetch_optional(&self.pool)
            .await
            .map_err(PulseError::from)?;
        row.map(|(v,)| serde_json::from_value(v).map_err(PulseError::from))
            .transpose()
    }

    async fn read_poll(&self) -> PulseResult<Option<PollState>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT data FROM poll_state WHERE id = $1")
            .bind(POLL_DOC_ID)
            .fetch_optional(&self.pool)
            .await
            .map_err(PulseError::from)?;
        row.map(|(v,)| serde_json::from_value(v).map_err(PulseError::from))
            .transpose()
    }

    async fn read_song(&self, vote_id: &str) -> PulseResult<Option<Song>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT data FROM songs WHERE id = $1")
            .bind(vote_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PulseError::from)?;
        row.map(|(v,)| serde_json::from_value(v).map_err(PulseError::from))
            .transpose()
    }

    async fn commit_rotation(&self, request_version: i64, now_ms: i64) -> PulseResult<RotationCommitResult> {
        let mut tx = self.pool.begin().await.map_err(PulseError::from)?;

        let station = Self::read_station_tx(&mut tx)
            .await?
            .ok_or_else(|| PulseError::NotFound("no StationRecord".into()))?;

        if request_version <= station.version {
            tx.rollback().await.map_err(PulseError::from)?;
            return Ok(RotationCommitResult::Noop {
                reason: NoopReason::StaleVersion,
                current_version: station.version,
            });
        }

        let current_vote_id = station.next.vote_id.clone();
        let current_duration_ms = station.next.duration_ms;
        let end_at = now_ms + current_duration_ms;

        let candidate = Self::pick_ready_candidate_tx(&mut tx, &current_vote_id).await?;
        let (candidate_id, candidate_duration_ms, candidate_is_stubbed) = match candidate {
            Some(song) => (song.vote_id, song.duration_ms, false),
            None => {
                let stubbed = Self::read_song_tx(&mut tx, STUBBED_VOTE_ID)
                    .await?
                    .ok_or_else(|| PulseError::NotFound("no ready song and no stubbed fallback".into()))?;
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
            if let Some(mut s) = Self::read_song_tx(&mut tx, &current_vote_id).await? {
                s.status = SongStatus::Played;
                Self::write_song_tx(&mut tx, &s).await?;
            }
        }
        if !candidate_is_stubbed {
            if let Some(mut s) = Self::read_song_tx(&mut tx, &candidate_id).await? {
                s.status = SongStatus::Queued;
                Self::write_song_tx(&mut tx, &s).await?;
            }
        }

        Self::write_station_tx(&mut tx, &new_station).await?;
        tx.commit().await.map_err(PulseError::from)?;

        Ok(RotationCommitResult::Committed(new_station))
    }

    async fn replace_next_if_stubbed(&self, vote_id: &str, duration_ms: i64) -> PulseResult<ReplaceNextOutcome> {
        let mut tx = self.pool.begin().await.map_err(PulseError::from)?;
        let mut station = Self::read_station_tx(&mut tx)
            .await?
            .ok_or_else(|| PulseError::NotFound("no StationRecord".into()))?;

        if station.next.vote_id == vote_id && station.next.duration_ms == duration_ms {
            tx.rollback().await.map_err(PulseError::from)?;
            return Ok(ReplaceNextOutcome::AlreadySet);
        }
        if station.next.vote_id != STUBBED_VOTE_ID {
            tx.rollback().await.map_err(PulseError::from)?;
            return Ok(ReplaceNextOutcome::AlreadySet);
        }

        station.next = NextSong {
            vote_id: vote_id.to_string(),
            duration_ms,
        };
        Self::write_station_tx(&mut tx, &station).await?;
        if let Some(mut song) = Self::read_song_tx(&mut tx, vote_id).await? {
            song.status = SongStatus::Queued;
            Self::write_song_tx(&mut tx, &song).await?;
        }
        tx.commit().await.map_err(PulseError::from)?;
        Ok(ReplaceNextOutcome::Updated)
    }

    async fn write_poll(&self, poll: &PollState) -> PulseResult<()> {
        let data = serde_json::to_value(poll)?;
        sqlx::query(
            "INSERT INTO poll_state (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(POLL_DOC_ID)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(PulseError::from)?;
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
        let mut tx = self.pool.begin().await.map_err(PulseError::from)?;
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT data FROM poll_state WHERE id = $1 FOR UPDATE")
                .bind(POLL_DOC_ID)
                .fetch_optional(&mut *tx)
                .await
                .map_err(PulseError::from)?;
        let Some((v,)) = row else {
            tx.rollback().await.map_err(PulseError::from)?;
            return Ok(PollCloseOutcome::Noop {
                reason: NoopReason::MissingState,
            });
        };
        let mut poll: PollState = serde_json::from_value(v)?;

        if poll.vote_id != expected_vote_id {
            tx.rollback().await.map_err(PulseError::from)?;
            return Ok(PollCloseOutcome::Noop {
                reason: NoopReason::VoteMismatch,
            });
        }
        if poll.version != expected_version {
            tx.rollback().await.map_err(PulseError::from)?;
            return Ok(PollCloseOutcome::Noop {
                reason: NoopReason::VersionMismatch,
            });
        }
        if poll.status == pulsefm_core::data::PollStatus::Closed {
            tx.rollback().await.map_err(PulseError::from)?;
            return Ok(PollCloseOutcome::Noop {
                reason: NoopReason::AlreadyClosed,
            });
        }

        poll.status = pulsefm_core::data::PollStatus::Closed;
        poll.winner_option = Some(winner_option.to_string());
        poll.tallies = tallies.clone();
        poll.closed_at = Some(closed_at);

        let data = serde_json::to_value(&poll)?;
        sqlx::query("UPDATE poll_state SET data = $1 WHERE id = $2")
            .bind(data)
            .bind(POLL_DOC_ID)
            .execute(&mut *tx)
            .await
            .map_err(PulseError::from)?;
        tx.commit().await.map_err(PulseError::from)?;

        Ok(PollCloseOutcome::Closed {
            vote_id: expected_vote_id.to_string(),
            winner_option: winner_option.to_string(),
        })
    }

    async fn seed_bootstrap(&self, duration_ms: i64) -> PulseResult<bool> {
        let mut tx = self.pool.begin().await.map_err(PulseError::from)?;
        let existing = Self::read_station_tx(&mut tx).await?;
        if existing.is_some() {
            tx.rollback().await.map_err(PulseError::from)?;
            return Ok(false);
        }

        let now = chrono::Utc::now().timestamp_millis();
        // Seeded as `queued`, not `ready`: it's already sitting in `next`
        // from the moment the station record below is written, and `ready`
        // would make it eligible for ordinary candidate selection, which it
        // must never be (it's read back by id on the no-candidates fallback
        // path, not via the ready scan).
        let stubbed = Song {
            vote_id: STUBBED_VOTE_ID.to_string(),
            duration_ms,
            status: SongStatus::Queued,
            created_at: now,
        };
        Self::write_song_tx(&mut tx, &stubbed).await?;

        let station = StationRecord {
            vote_id: STUBBED_VOTE_ID.to_string(),
            start_at: now,
            end_at: now + duration_ms,
            duration_ms,
            version: 0,
            next: NextSong {
                vote_id: STUBBED_VOTE_ID.to_string(),
                duration_ms,
            },
        };
        Self::write_station_tx(&mut tx, &station).await?;
        tx.commit().await.map_err(PulseError::from)?;
        Ok(true)
    }
}
