//! `HttpForwardingEventBus`: the cross-process leg of the `EventBus` trait.
//!
//! RotationEngine and PollEngine run inside `pulsefm-control`/`pulsefm-vote`,
//! but the subscribers that care about their events (`StreamHub`) live in
//! the separate `pulsefm-stream` process. `BroadcastEventBus` alone can't
//! bridge that gap — a `tokio::sync::broadcast` channel only fans out within
//! one process. This adapter keeps the same in-process broadcast (so any
//! future same-process subscriber still works unchanged) and additionally
//! POSTs every published payload to the stream service's `/events/{topic}`
//! endpoint (spec §6's "accepts decoded event payloads from the EventBus"),
//! standing in for the original system's Pub/Sub transport the same way
//! `HttpTaskQueue` stands in for Cloud Tasks.
//!
//! Delivery is fire-and-forget and at-least-once, matching spec §1's
//! "downstream notifications are at-least-once" non-goal: a failed POST is
//! logged and dropped rather than retried, because the next rotation/poll
//! event supersedes it anyway (receivers are idempotent on `(voteId,
//! version)` per spec §6).

use crate::traits::EventBus;
use pulsefm_core::event::Topic;
use tokio::sync::broadcast;

pub struct HttpForwardingEventBus {
    http: reqwest::Client,
    stream_base_url: String,
    playback: broadcast::Sender<String>,
    vote: broadcast::Sender<String>,
    tally: broadcast::Sender<String>,
}

impl HttpForwardingEventBus {
    pub fn new(stream_base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            stream_base_url,
            playback: broadcast::channel(256).0,
            vote: broadcast::channel(256).0,
            tally: broadcast::channel(256).0,
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

impl EventBus for HttpForwardingEventBus {
    fn subscribe(&self, topic: Topic) -> broadcast::Receiver<String> {
        self.sender(topic).subscribe()
    }

    fn publish(&self, topic: Topic, payload_json: String) {
        let _ = self.sender(topic).send(payload_json.clone());

        let url = format!("{}/events/{}", self.stream_base_url, topic.as_str());
        let http = self.http.clone();
        tokio::spawn(async move {
            match http
                .post(&url)
                .header("content-type", "application/json")
                .body(payload_json)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(%url, "event forwarded to stream service");
                }
                Ok(resp) => {
                    tracing::warn!(%url, status = %resp.status(), "stream service rejected forwarded event");
                }
                Err(err) => {
                    tracing::warn!(%url, %err, "failed to forward event to stream service");
                }
            }
        });
    }
}
