//! Self-POST `TaskQueue`: a delayed task is just `tokio::time::sleep` inside
//! a spawned task followed by a `reqwest` POST
//! back to this process's own externally-reachable URL; duplicate
//! suppression is a Redis `SET key val NX EX ttl` keyed by the task's
//! deterministic id; an expired key makes the task eligible again, which is
//! fine because by then it would already have fired once.

use crate::traits::TaskQueue;
use async_trait::async_trait;
use pulsefm_core::{PulseError, PulseResult};
use std::time::Duration;

pub struct HttpTaskQueue {
    redis: redis::Client,
    http: reqwest::Client,
    base_url: String,
    dedupe_ttl_slack_sec: i64,
}

impl HttpTaskQueue {
    pub fn new(redis_url: &str, base_url: String, dedupe_ttl_slack_sec: i64) -> PulseResult<Self> {
        let redis = redis::Client::open(redis_url).map_err(PulseError::from)?;
        Ok(Self {
            redis,
            http: reqwest::Client::new(),
            base_url,
            dedupe_ttl_slack_sec,
        })
    }

    fn dedupe_key(task_id: &str) -> String {
        format!("pulsefm:task:{task_id}")
    }
}

#[async_trait]
impl TaskQueue for HttpTaskQueue {
    async fn enqueue(&self, task_id: &str, delay_ms: i64, path: &str, body: serde_json::Value) -> PulseResult<()> {
        let mut conn = self
            .redis
            .get_multiplexed_async_connection()
            .await
            .map_err(PulseError::from)?;

        let ttl_sec = (delay_ms / 1000).max(1) + self.dedupe_ttl_slack_sec;
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::dedupe_key(task_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_sec)
            .query_async(&mut conn)
            .await
            .map_err(PulseError::from)?;

        if reply.is_none() {
            tracing::debug!(task_id, "task already enqueued, skipping duplicate");
            return Ok(());
        }

        let url = format!("{}{}", self.base_url, path);
        let http = self.http.clone();
        let delay = Duration::from_millis(delay_ms.max(0) as u64);
        let owned_task_id = task_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(task_id = %owned_task_id, %url, "task delivered");
                }
                Ok(resp) => {
                    tracing::warn!(task_id = %owned_task_id, %url, status = %resp.status(), "task delivery rejected");
                }
                Err(err) => {
                    tracing::error!(task_id = %owned_task_id, %url, %err, "task delivery failed");
                }
            }
        });

        Ok(())
    }
}
