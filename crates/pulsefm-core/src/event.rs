//! EventBus payloads — what RotationEngine/PollEngine publish and what
//! StreamHub fans out over SSE.
//!
//! A single tagged enum per topic checks each event kind's fields at
//! compile time instead of parsing them out of a loosely-shaped JSON dict.

use crate::data::{NextSong, PollStatus};
use serde::{Deserialize, Serialize};

/// Topics an `EventBus` implementation keeps as separate channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Playback,
    Vote,
    Tally,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Playback, Topic::Vote, Topic::Tally];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Playback => "playback",
            Topic::Vote => "vote",
            Topic::Tally => "tally",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum PlaybackEvent {
    #[serde(rename = "SONG_CHANGED")]
    SongChanged {
        vote_id: String,
        start_at: i64,
        end_at: i64,
        duration_ms: i64,
        next: NextSong,
    },
    #[serde(rename = "NEXT_SONG_CHANGED")]
    NextSongChanged { next: NextSong },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum VoteEvent {
    #[serde(rename = "POLL_OPENED")]
    PollOpened {
        vote_id: String,
        options: Vec<String>,
        end_at: i64,
        version: i64,
    },
    #[serde(rename = "POLL_CLOSED")]
    PollClosed {
        vote_id: String,
        winner_option: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum TallyEvent {
    #[serde(rename = "TALLY_SNAPSHOT")]
    Snapshot {
        vote_id: String,
        tallies: std::collections::BTreeMap<String, i64>,
        status: PollStatus,
    },
    #[serde(rename = "TALLY_DELTA")]
    Delta {
        vote_id: String,
        option: String,
        count: i64,
    },
}
