//! Wire/storage representations of the entities in the data model.
//!
//! These types are what the DS adapter serializes into a document's `JSONB`
//! column and what the KV adapter stores as the `playback:current` snapshot.
//! They carry no behavior of their own — RotationEngine/PollEngine/StateCache
//! own the transitions.

use serde::{Deserialize, Serialize};

pub type EpochMs = i64;

/// `stations/main` — the singleton durable record of "what's playing, what's next".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationRecord {
    pub vote_id: String,
    pub start_at: EpochMs,
    pub end_at: EpochMs,
    pub duration_ms: i64,
    pub version: i64,
    pub next: NextSong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextSong {
    pub vote_id: String,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SongStatus {
    Ready,
    Queued,
    Played,
}

/// `songs/{voteId}` — one generated track (or the `stubbed` fallback loop).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub vote_id: String,
    pub duration_ms: i64,
    pub status: SongStatus,
    pub created_at: EpochMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PollStatus {
    Open,
    Closed,
}

/// `voteState/current` — the singleton durable poll record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollState {
    pub vote_id: String,
    pub status: PollStatus,
    pub start_at: EpochMs,
    pub end_at: EpochMs,
    pub duration_ms: i64,
    pub options: Vec<String>,
    pub tallies: std::collections::BTreeMap<String, i64>,
    pub version: i64,
    pub winner_option: Option<String>,
    pub created_at: EpochMs,
    pub closed_at: Option<EpochMs>,
}

/// `playback:current` — the KV snapshot cache of "current + next + poll".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub current_song: CurrentSong,
    pub next_song: NextSong,
    pub poll: SnapshotPoll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSong {
    pub vote_id: String,
    pub start_at: EpochMs,
    pub end_at: EpochMs,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPoll {
    pub vote_id: String,
    pub options: Vec<String>,
    pub version: i64,
    pub status: PollStatus,
}

impl Snapshot {
    /// Build a fresh snapshot from a just-committed station + just-opened poll.
    pub fn compose(station: &StationRecord, poll: &PollState) -> Self {
        Self {
            current_song: CurrentSong {
                vote_id: station.vote_id.clone(),
                start_at: station.start_at,
                end_at: station.end_at,
                duration_ms: station.duration_ms,
            },
            next_song: station.next.clone(),
            poll: SnapshotPoll {
                vote_id: poll.vote_id.clone(),
                options: poll.options.clone(),
                version: poll.version,
                status: poll.status,
            },
        }
    }
}

/// Outcome sum type: each variant names exactly what happened instead of a
/// loosely-shaped "noop / closed / updated" result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RotationOutcome {
    Committed { version: i64 },
    Noop { reason: NoopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoopReason {
    StaleVersion,
    VoteMismatch,
    VersionMismatch,
    AlreadyClosed,
    AlreadySet,
    MissingState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PollCloseOutcome {
    Closed {
        vote_id: String,
        winner_option: String,
    },
    Noop {
        reason: NoopReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReplaceNextOutcome {
    Updated,
    AlreadySet,
}

/// Outcome of `vote()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    Ok,
    Duplicate,
    InvalidOption,
    VoteNotOpen,
    VoteNotCurrent,
}
