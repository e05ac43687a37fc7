//! `StateCache` serves the single "current + next + poll" [`Snapshot`] from
//! KV with a TTL tied to the playing song's end, falling back to a DS
//! reconstruction on a cache miss or decode failure.
//!
//! KV is authoritative for "current + next" during a song's playback
//! window; DS is authoritative for history and the vote ledger. Callers —
//! RotationEngine after a rotation, StreamHub on every connection and on
//! `SONG_CHANGED` — always go through here rather than reading KV or DS
//! directly.

use pulsefm_core::data::Snapshot;
use pulsefm_core::data::PollStatus;
use pulsefm_core::{PulseError, PulseResult};
use pulsefm_store::{Datastore, KvStore};
use std::sync::Arc;

/// Used when a song's `endAt` can't be determined (shouldn't happen once a
/// StationRecord exists, but guards a rebuild from ever writing a TTL-less
/// snapshot).
const DEFAULT_SNAPSHOT_TTL_SEC: i64 = 3600;

pub struct StateCache {
    ds: Arc<dyn Datastore>,
    kv: Arc<dyn KvStore>,
}

impl StateCache {
    pub fn new(ds: Arc<dyn Datastore>, kv: Arc<dyn KvStore>) -> Self {
        Self { ds, kv }
    }

    /// Returns the current playback + poll snapshot, rebuilding it from the
    /// datastore if the cached copy is missing or unreadable.
    pub async fn get_snapshot(&self, now_ms: i64) -> PulseResult<Snapshot> {
        if let Some(json) = self.kv.read_snapshot().await? {
            if !json.is_empty() {
                match serde_json::from_str::<Snapshot>(&json) {
                    Ok(snapshot) => return Ok(snapshot),
                    Err(err) => {
                        tracing::warn!(%err, "cached snapshot failed to decode, rebuilding from datastore");
                    }
                }
            }
        }
        self.rebuild(now_ms).await
    }

    async fn rebuild(&self, now_ms: i64) -> PulseResult<Snapshot> {
        let station = self
            .ds
            .read_station()
            .await?
            .ok_or_else(|| PulseError::NotFound("no StationRecord to rebuild snapshot from".into()))?;
        let poll = self
            .ds
            .read_poll()
            .await?
            .ok_or_else(|| PulseError::NotFound("no PollState to rebuild snapshot from".into()))?;

        let snapshot = Snapshot::compose(&station, &poll);
        let ttl_sec = (station.end_at - now_ms) / 1000;
        let ttl_sec = if ttl_sec > 0 { ttl_sec } else { DEFAULT_SNAPSHOT_TTL_SEC };

        let json = serde_json::to_string(&snapshot)?;
        self.kv.write_snapshot(&json, ttl_sec).await?;
        Ok(snapshot)
    }

    /// Unconditional snapshot write used by RotationEngine after a rotation
    /// commit: the caller just composed the authoritative station+poll, so
    /// there's no read-or-rebuild decision to make here, unlike
    /// [`StateCache::get_snapshot`].
    pub async fn write_through(&self, snapshot_json: &str, ttl_sec: i64) -> PulseResult<()> {
        self.kv.write_snapshot(snapshot_json, ttl_sec).await
    }

    /// Mutates the cached snapshot's `poll.status` in place, preserving its
    /// remaining TTL. Fails with `Precondition` if the cached snapshot
    /// belongs to a different poll; the caller decides whether to retry or
    /// accept staleness.
    pub async fn set_poll_status(&self, vote_id: &str, new_status: PollStatus) -> PulseResult<()> {
        let Some((json, ttl_ms)) = self.kv.read_snapshot_with_ttl().await? else {
            return Err(PulseError::Precondition(
                "no cached snapshot to update poll status on".into(),
            ));
        };
        let mut snapshot: Snapshot = serde_json::from_str(&json)?;
        if snapshot.poll.vote_id != vote_id {
            return Err(PulseError::Precondition(format!(
                "cached snapshot poll.voteId {} does not match {}",
                snapshot.poll.vote_id, vote_id
            )));
        }
        snapshot.poll.status = new_status;
        let ttl_sec = (ttl_ms / 1000).max(1);
        let json = serde_json::to_string(&snapshot)?;
        self.kv.write_snapshot(&json, ttl_sec).await?;
        Ok(())
    }
}
