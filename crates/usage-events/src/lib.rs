//! Sequenced usage event stream.
//!
//! Shared pub/sub ledger for terminal request outcomes and quota/error
//! events. Every publish gets a strictly increasing sequence number within
//! the manager's lifetime; subscribers hold bounded channels and slow ones
//! shed events rather than stall the publisher.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use common::queuehealth;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Default ledger retention.
pub const DEFAULT_MAX_LEDGER: usize = 10_000;
/// Per-subscriber channel capacity.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;
/// Default replay page size.
pub const DEFAULT_REPLAY_LIMIT: usize = 500;

/// A single request outcome or quota/error event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestEvent {
    /// "request" | "quota_exceeded" | "error"
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub auth_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    pub success: bool,
    #[serde(default)]
    pub tokens: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub latency_ms: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// Counters exposed to the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct EventStreamMetrics {
    pub published_total: u64,
    pub dropped_total: u64,
    pub subscriber_count: usize,
    pub ledger_size: usize,
    pub subscriber_dropped_total: HashMap<String, u64>,
    pub current_seq: u64,
}

struct Subscriber {
    events: mpsc::Sender<RequestEvent>,
    dropped: u64,
}

struct Inner {
    subscribers: HashMap<String, Subscriber>,
    next_id: u64,
    next_seq: u64,
    ledger: VecDeque<RequestEvent>,
    published: u64,
    dropped: u64,
}

/// Fan-out manager for usage events.
pub struct EventStreamManager {
    inner: Mutex<Inner>,
    max_ledger: usize,
}

impl Default for EventStreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamManager {
    pub fn new() -> Self {
        Self::with_max_ledger(DEFAULT_MAX_LEDGER)
    }

    pub fn with_max_ledger(max_ledger: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: HashMap::new(),
                next_id: 0,
                next_seq: 0,
                ledger: VecDeque::with_capacity(1024),
                published: 0,
                dropped: 0,
            }),
            max_ledger: max_ledger.max(1),
        }
    }

    /// Shared process-wide instance.
    pub fn default_shared() -> Arc<EventStreamManager> {
        static SHARED: OnceLock<Arc<EventStreamManager>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(EventStreamManager::new()))
            .clone()
    }

    /// Add a subscriber; the id unsubscribes it later.
    pub fn subscribe(&self) -> (String, mpsc::Receiver<RequestEvent>) {
        let mut inner = self.inner.lock().expect("event stream lock poisoned");
        inner.next_id += 1;
        let id = format!("sub-{}", inner.next_id);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        inner.subscribers.insert(
            id.clone(),
            Subscriber {
                events: tx,
                dropped: 0,
            },
        );
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &str) {
        let mut inner = self.inner.lock().expect("event stream lock poisoned");
        inner.subscribers.remove(id);
    }

    /// Broadcast an event. Assigns the sequence number and defaults the
    /// event id and timestamp. Slow subscribers drop the event and the drop
    /// is counted on the subscriber, the manager, and the process-wide
    /// queue-health registry.
    pub fn publish(&self, mut event: RequestEvent) -> u64 {
        let mut inner = self.inner.lock().expect("event stream lock poisoned");
        inner.next_seq += 1;
        event.seq = inner.next_seq;
        if event.event_id.trim().is_empty() {
            event.event_id = event.seq.to_string();
        }
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        inner.published += 1;
        inner.ledger.push_back(event.clone());
        while inner.ledger.len() > self.max_ledger {
            inner.ledger.pop_front();
        }

        let mut dropped_now = 0u64;
        for subscriber in inner.subscribers.values_mut() {
            if subscriber.events.try_send(event.clone()).is_err() {
                subscriber.dropped += 1;
                dropped_now += 1;
                queuehealth::inc("usage_subscriber_channel_full");
            }
        }
        inner.dropped += dropped_now;
        event.seq
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("event stream lock poisoned")
            .subscribers
            .len()
    }

    pub fn current_seq(&self) -> u64 {
        self.inner
            .lock()
            .expect("event stream lock poisoned")
            .next_seq
    }

    /// Events with `seq > since_seq`, in seq order, capped by `limit`
    /// (default 500 when zero).
    pub fn replay_since(&self, since_seq: u64, limit: usize) -> Vec<RequestEvent> {
        let limit = if limit == 0 { DEFAULT_REPLAY_LIMIT } else { limit };
        let inner = self.inner.lock().expect("event stream lock poisoned");
        inner
            .ledger
            .iter()
            .filter(|event| event.seq > since_seq)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn metrics_snapshot(&self) -> EventStreamMetrics {
        let inner = self.inner.lock().expect("event stream lock poisoned");
        EventStreamMetrics {
            published_total: inner.published,
            dropped_total: inner.dropped,
            subscriber_count: inner.subscribers.len(),
            ledger_size: inner.ledger.len(),
            subscriber_dropped_total: inner
                .subscribers
                .iter()
                .map(|(id, sub)| (id.clone(), sub.dropped))
                .collect(),
            current_seq: inner.next_seq,
        }
    }

    /// Publish a quota exceeded event.
    pub fn publish_quota_exceeded(&self, provider: &str, model: &str, auth_file: &str) {
        self.publish(RequestEvent {
            event_type: "quota_exceeded".into(),
            provider: provider.into(),
            model: model.into(),
            auth_file: auth_file.into(),
            success: false,
            error: "quota exceeded".into(),
            ..RequestEvent::default()
        });
    }

    /// Publish an error event.
    pub fn publish_error(&self, provider: &str, model: &str, auth_file: &str, error: &str) {
        self.publish(RequestEvent {
            event_type: "error".into(),
            provider: provider.into(),
            model: model.into(),
            auth_file: auth_file.into(),
            success: false,
            error: error.into(),
            ..RequestEvent::default()
        });
    }
}

/// Format an event as SSE data, carrying the seq as the SSE id.
pub fn event_to_sse(event: &RequestEvent) -> Vec<u8> {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    if event.seq > 0 {
        format!("id: {}\ndata: {}\n\n", event.seq, data).into_bytes()
    } else {
        format!("data: {data}\n\n").into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(provider: &str) -> RequestEvent {
        RequestEvent {
            event_type: "request".into(),
            provider: provider.into(),
            model: "m".into(),
            auth_file: "auth.json".into(),
            success: true,
            tokens: 10,
            ..RequestEvent::default()
        }
    }

    #[tokio::test]
    async fn seqs_are_gapless_for_keeping_subscribers() {
        // P10.
        let stream = EventStreamManager::new();
        let (_id, mut rx) = stream.subscribe();
        let base = stream.current_seq();
        for _ in 0..10 {
            stream.publish(event("codex"));
        }
        for offset in 1..=10 {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.seq, base + offset);
        }
        assert_eq!(stream.metrics_snapshot().dropped_total, 0);
    }

    #[test]
    fn slow_subscriber_drops_are_counted() {
        let stream = EventStreamManager::new();
        let (id, _rx) = stream.subscribe();
        // Fill the channel past capacity without draining.
        for _ in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 5) {
            stream.publish(event("codex"));
        }
        let metrics = stream.metrics_snapshot();
        assert!(metrics.dropped_total >= 5);
        assert!(metrics.subscriber_dropped_total[&id] >= 5);
        assert!(common::queuehealth::get("usage_subscriber_channel_full") >= 5);
    }

    #[test]
    fn publish_defaults_event_id_and_timestamp() {
        let stream = EventStreamManager::new();
        stream.publish(event("codex"));
        let replayed = stream.replay_since(0, 10);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].event_id, replayed[0].seq.to_string());
        assert!(replayed[0].timestamp.is_some());
    }

    #[test]
    fn replay_is_strictly_greater_than_since() {
        let stream = EventStreamManager::new();
        for _ in 0..5 {
            stream.publish(event("codex"));
        }
        let all = stream.replay_since(0, 0);
        assert_eq!(all.len(), 5);
        let after = stream.replay_since(all[2].seq, 0);
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|e| e.seq > all[2].seq));
    }

    #[test]
    fn ledger_is_a_ring() {
        let stream = EventStreamManager::with_max_ledger(3);
        for _ in 0..5 {
            stream.publish(event("codex"));
        }
        let metrics = stream.metrics_snapshot();
        assert_eq!(metrics.ledger_size, 3);
        assert_eq!(metrics.published_total, 5);
        let replayed = stream.replay_since(0, 0);
        assert_eq!(replayed[0].seq, 3);
    }

    #[test]
    fn unsubscribe_removes_subscriber() {
        let stream = EventStreamManager::new();
        let (id, _rx) = stream.subscribe();
        assert_eq!(stream.subscriber_count(), 1);
        stream.unsubscribe(&id);
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[test]
    fn sse_format_carries_seq_id() {
        let stream = EventStreamManager::new();
        stream.publish(event("codex"));
        let got = stream.replay_since(0, 1).remove(0);
        let sse = String::from_utf8(event_to_sse(&got)).unwrap();
        assert!(sse.starts_with(&format!("id: {}\ndata: ", got.seq)));
        assert!(sse.ends_with("\n\n"));
    }

    #[test]
    fn helper_publishers_set_types() {
        let stream = EventStreamManager::new();
        stream.publish_quota_exceeded("codex", "m", "a.json");
        stream.publish_error("codex", "m", "a.json", "boom");
        let events = stream.replay_since(0, 0);
        assert_eq!(events[0].event_type, "quota_exceeded");
        assert_eq!(events[1].event_type, "error");
        assert_eq!(events[1].error, "boom");
    }
}
