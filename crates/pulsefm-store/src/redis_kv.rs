//! Redis-backed `KvStore`, loading the atomic scripts once at startup and
//! invoking them by SHA (`EVALSHA`, falling back to `EVAL` on `NOSCRIPT`).
//!
//! The increment-and-dedupe needs to run as one atomic script server-side,
//! not as a client-side read-modify-write, so `VOTE_LUA` stays a literal
//! script rather than a sequence of separate Redis calls.

use crate::traits::KvStore;
use async_trait::async_trait;
use pulsefm_core::{PulseError, PulseResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::BTreeMap;

fn poll_tally_key(vote_id: &str) -> String {
    format!("pulsefm:poll:{vote_id}:tally")
}

fn poll_voted_key(vote_id: &str) -> String {
    format!("pulsefm:poll:{vote_id}:voted")
}

const SNAPSHOT_KEY: &str = "pulsefm:playback:current";
const ACTIVE_SESSIONS_KEY: &str = "pulsefm:sessions:active";

const VOTE_LUA: &str = r#"
local voted_key = KEYS[1]
local tally_key = KEYS[2]
local session_id = ARGV[1]
local option = ARGV[2]

local added = redis.call("SADD", voted_key, session_id)
if added == 1 then
  redis.call("HINCRBY", tally_key, option, 1)
  return 1
end
return 0
"#;

/// Deletes and reinitializes the tally hash and voted set for a freshly
/// opened poll, then writes the snapshot — all three in one script so a
/// reader never observes only part of the new poll's state.
const OPEN_LUA: &str = r#"
local snapshot_key = KEYS[1]
local tally_key = KEYS[2]
local voted_key = KEYS[3]
local snapshot_json = ARGV[1]
local snapshot_ttl = tonumber(ARGV[2])
local state_ttl = tonumber(ARGV[3])

redis.call("SET", snapshot_key, snapshot_json, "EX", snapshot_ttl)
redis.call("DEL", tally_key)
for i = 4, #ARGV do
  redis.call("HSET", tally_key, ARGV[i], 0)
end
redis.call("EXPIRE", tally_key, state_ttl)
redis.call("DEL", voted_key)
redis.call("SADD", voted_key, "__init__")
redis.call("SREM", voted_key, "__init__")
redis.call("EXPIRE", voted_key, state_ttl)
return "OK"
"#;

pub struct RedisKvStore {
    conn: ConnectionManager,
    vote_script: Script,
    open_script: Script,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> PulseResult<Self> {
        let client = redis::Client::open(url).map_err(PulseError::from)?;
        let conn = ConnectionManager::new(client).await.map_err(PulseError::from)?;
        Ok(Self {
            conn,
            vote_script: Script::new(VOTE_LUA),
            open_script: Script::new(OPEN_LUA),
        })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn kv_open(
        &self,
        snapshot_json: &str,
        snapshot_ttl_sec: i64,
        state_ttl_sec: i64,
        options: &[String],
    ) -> PulseResult<()> {
        let vote_id = extract_snapshot_vote_id(snapshot_json)?;
        let mut conn = self.conn.clone();
        let mut invocation = self.open_script.prepare_invoke();
        invocation
            .key(SNAPSHOT_KEY)
            .key(poll_tally_key(&vote_id))
            .key(poll_voted_key(&vote_id))
            .arg(snapshot_json)
            .arg(snapshot_ttl_sec)
            .arg(state_ttl_sec);
        for opt in options {
            invocation.arg(opt);
        }
        let _: String = invocation.invoke_async(&mut conn).await.map_err(PulseError::from)?;
        Ok(())
    }

    async fn kv_vote(&self, vote_id: &str, session_id: &str, option: &str) -> PulseResult<bool> {
        let mut conn = self.conn.clone();
        let result: i64 = self
            .vote_script
            .key(poll_voted_key(vote_id))
            .key(poll_tally_key(vote_id))
            .arg(session_id)
            .arg(option)
            .invoke_async(&mut conn)
            .await
            .map_err(PulseError::from)?;
        Ok(result == 1)
    }

    async fn kv_heartbeat(&self, session_id: &str, ttl_sec: i64) -> PulseResult<()> {
        let mut conn = self.conn.clone();
        let session_key = format!("pulsefm:session:{session_id}");
        let _: () = conn
            .set_ex(&session_key, 1, ttl_sec as u64)
            .await
            .map_err(PulseError::from)?;
        let _: () = conn
            .sadd(ACTIVE_SESSIONS_KEY, session_id)
            .await
            .map_err(PulseError::from)?;
        let _: () = conn
            .expire(ACTIVE_SESSIONS_KEY, ttl_sec)
            .await
            .map_err(PulseError::from)?;
        Ok(())
    }

    async fn read_snapshot(&self) -> PulseResult<Option<String>> {
        let mut conn = self.conn.clone();
        let v: Option<String> = conn.get(SNAPSHOT_KEY).await.map_err(PulseError::from)?;
        Ok(v)
    }

    async fn read_snapshot_with_ttl(&self) -> PulseResult<Option<(String, i64)>> {
        let mut conn = self.conn.clone();
        let v: Option<String> = conn.get(SNAPSHOT_KEY).await.map_err(PulseError::from)?;
        let Some(json) = v else { return Ok(None) };
        let ttl_sec: i64 = conn.ttl(SNAPSHOT_KEY).await.map_err(PulseError::from)?;
        Ok(Some((json, ttl_sec.max(0) * 1000)))
    }

    async fn write_snapshot(&self, json: &str, ttl_sec: i64) -> PulseResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(SNAPSHOT_KEY, json, ttl_sec.max(1) as u64)
            .await
            .map_err(PulseError::from)?;
        Ok(())
    }

    async fn read_tallies(&self, vote_id: &str) -> PulseResult<BTreeMap<String, i64>> {
        let mut conn = self.conn.clone();
        let map: BTreeMap<String, i64> = conn
            .hgetall(poll_tally_key(vote_id))
            .await
            .map_err(PulseError::from)?;
        Ok(map)
    }

    async fn approx_listener_count(&self) -> PulseResult<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.scard(ACTIVE_SESSIONS_KEY).await.map_err(PulseError::from)?;
        Ok(count)
    }
}

fn extract_snapshot_vote_id(snapshot_json: &str) -> PulseResult<String> {
    let v: serde_json::Value = serde_json::from_str(snapshot_json)?;
    v.get("poll")
        .and_then(|p| p.get("voteId"))
        .and_then(|id| id.as_str())
        .map(str::to_string)
        .ok_or_else(|| PulseError::Corrupt("snapshot missing poll.voteId".into()))
}
