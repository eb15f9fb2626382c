//! Server-sent event substrate.
//!
//! Single reusable primitive behind every streaming endpoint: the alert run,
//! scenario activation, the five upload endpoints, and the application log
//! stream all publish through an [`EventBus`] and serve subscribers from it.
//!
//! # Architecture
//!
//! ```text
//! Producers (bridge, ingest, provisioner, log layer)
//!         │ publish(source, event)        never blocks
//!         ▼
//!     EventBus ── per-source ring buffer (tail replay for late joiners)
//!         │
//!         ├─ Subscriber queue (bounded, drop-oldest + overflow marker)
//!         ├─ Subscriber queue
//!         └─ ...
//! ```
//!
//! Each subscriber owns a bounded queue. A slow subscriber loses its oldest
//! events and receives an `overflow` marker so the client can resynchronize;
//! the publisher never waits on anyone.
//!
//! # Example
//!
//! ```rust
//! use incidentllm::sse::{EventBus, EventRecord, TagFilter};
//!
//! # #[tokio::main] async fn main() {
//! let bus = EventBus::new(100, 256);
//! let mut sub = bus.subscribe(TagFilter::only("upload:graph"));
//!
//! bus.publish("upload:graph", EventRecord::progress(serde_json::json!({
//!     "step": "creating_graph", "detail": "42/100", "pct": 42
//! })));
//!
//! let event = sub.next().await.unwrap();
//! assert_eq!(event.kind, "progress");
//! # }
//! ```

use axum::response::sse::{Event, Sse};
use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const KIND_PROGRESS: &str = "progress";
pub const KIND_COMPLETE: &str = "complete";
pub const KIND_ERROR: &str = "error";
pub const KIND_LOG: &str = "log";
pub const KIND_HEARTBEAT: &str = "heartbeat";
pub const KIND_OVERFLOW: &str = "overflow";

/// A single event flowing through the substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic id assigned by the bus at publish time.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    /// Source tag, e.g. `run:42`, `upload:graph`, `app`.
    pub source: String,
    /// Wire event name (`progress`, `complete`, `run_start`, ...).
    pub kind: String,
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Build a record with an arbitrary kind. The id is assigned on publish.
    pub fn of(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            source: String::new(),
            kind: kind.into(),
            payload,
        }
    }

    pub fn progress(payload: serde_json::Value) -> Self {
        Self::of(KIND_PROGRESS, payload)
    }

    pub fn complete(payload: serde_json::Value) -> Self {
        Self::of(KIND_COMPLETE, payload)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::of(KIND_ERROR, serde_json::json!({ "error": message.into() }))
    }

    pub fn log(payload: serde_json::Value) -> Self {
        Self::of(KIND_LOG, payload)
    }

    fn heartbeat() -> Self {
        Self::of(KIND_HEARTBEAT, serde_json::json!({}))
    }

    fn overflow() -> Self {
        Self::of(KIND_OVERFLOW, serde_json::json!({}))
    }

    /// Terminal events end bounded streams (upload, activation, alert run).
    pub fn is_terminal(&self) -> bool {
        self.kind == KIND_COMPLETE || self.kind == KIND_ERROR || self.kind == "run_complete"
    }
}

/// Predicate over source tags used at subscribe time.
#[derive(Debug, Clone)]
pub enum TagFilter {
    /// Receive every source.
    Any,
    /// Receive only the listed sources.
    Sources(Vec<String>),
}

impl TagFilter {
    pub fn only(source: impl Into<String>) -> Self {
        TagFilter::Sources(vec![source.into()])
    }

    fn matches(&self, source: &str) -> bool {
        match self {
            TagFilter::Any => true,
            TagFilter::Sources(list) => list.iter().any(|s| s == source),
        }
    }
}

struct SubscriberQueue {
    queue: Mutex<VecDeque<EventRecord>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl SubscriberQueue {
    fn push(&self, event: EventRecord) {
        let mut queue = self.queue.lock().expect("subscriber queue poisoned");
        if queue.len() >= self.capacity {
            // Drop oldest until there is room for the marker and the event,
            // then make sure an overflow marker leads the queue so the
            // client can detect the gap.
            while queue.len() + 1 >= self.capacity {
                queue.pop_front();
            }
            let marker_present = queue.front().map_or(false, |e| e.kind == KIND_OVERFLOW);
            if !marker_present && self.capacity >= 2 {
                queue.push_front(EventRecord::overflow());
            }
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Receive side of a subscription. Dropping it (or calling
/// [`Subscription::cancel`]) detaches the subscriber; the bus prunes the
/// entry on the next publish.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    filter: TagFilter,
}

impl Subscription {
    /// Await the next event. Returns `None` once the subscription is closed
    /// and drained.
    pub async fn next(&mut self) -> Option<EventRecord> {
        loop {
            {
                let mut queue = self.queue.queue.lock().expect("subscriber queue poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.queue.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking poll used by the heartbeat-aware stream adapter.
    pub fn try_next(&mut self) -> Option<EventRecord> {
        self.queue
            .queue
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }

    pub fn cancel(&self) {
        self.queue.close();
    }

    pub fn filter(&self) -> &TagFilter {
        &self.filter
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}

struct BusInner {
    next_id: u64,
    rings: HashMap<String, VecDeque<EventRecord>>,
    subscribers: Vec<(TagFilter, Arc<SubscriberQueue>)>,
}

/// Shared publish/subscribe hub with per-source tail replay.
///
/// Publishing takes one short internal mutex; delivery to each subscriber is
/// a bounded-queue push that can never block the publisher.
pub struct EventBus {
    inner: Mutex<BusInner>,
    ring_capacity: usize,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new(ring_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 1,
                rings: HashMap::new(),
                subscribers: Vec::new(),
            }),
            ring_capacity,
            queue_capacity,
        }
    }

    /// Register a subscriber. Returns immediately.
    pub fn subscribe(&self, filter: TagFilter) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.queue_capacity,
        });
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.subscribers.push((filter.clone(), queue.clone()));
        Subscription { queue, filter }
    }

    /// Fan-out publish. Assigns the monotonic id, appends to the source's
    /// ring buffer, and pushes to every matching live subscriber.
    pub fn publish(&self, source: &str, mut event: EventRecord) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        event.id = inner.next_id;
        inner.next_id += 1;
        event.source = source.to_string();

        let ring_capacity = self.ring_capacity;
        let ring = inner.rings.entry(source.to_string()).or_default();
        if ring.len() >= ring_capacity {
            ring.pop_front();
        }
        ring.push_back(event.clone());

        // Prune disconnected subscribers while we hold the lock anyway.
        inner
            .subscribers
            .retain(|(_, queue)| !queue.closed.load(Ordering::SeqCst));

        for (filter, queue) in &inner.subscribers {
            if filter.matches(source) {
                queue.push(event.clone());
            }
        }
    }

    /// Up to `ring_capacity` most recent events for `source`, oldest first.
    /// Copy-on-return; the internal buffer is never exposed.
    pub fn tail(&self, source: &str) -> Vec<EventRecord> {
        let inner = self.inner.lock().expect("event bus poisoned");
        inner
            .rings
            .get(source)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().expect("event bus poisoned");
        inner
            .subscribers
            .iter()
            .filter(|(_, q)| !q.closed.load(Ordering::SeqCst))
            .count()
    }
}

/// Options for turning a subscription into an HTTP SSE response.
pub struct SseStreamOptions {
    /// Events replayed before live delivery (usually a ring-buffer tail).
    pub replay: Vec<EventRecord>,
    /// Idle interval after which a heartbeat event is emitted.
    pub heartbeat: Duration,
    /// End the HTTP stream after a terminal event (upload/activation/run
    /// streams). Log streams leave this false and run forever.
    pub until_terminal: bool,
}

fn to_wire(event: &EventRecord) -> Event {
    Event::default()
        .event(event.kind.clone())
        .data(event.payload.to_string())
}

struct StreamState {
    replay: VecDeque<EventRecord>,
    subscription: Subscription,
    heartbeat: Duration,
    until_terminal: bool,
    /// Highest replayed id; live events at or below it are duplicates from
    /// the subscribe-then-tail window and are skipped.
    replayed_through: u64,
    done: bool,
}

/// Adapt a subscription into an axum SSE response.
///
/// Replay events are emitted first, then live events in publication order.
/// When the subscription stays idle past the heartbeat interval an
/// `event: heartbeat` with an empty object body is sent to keep
/// intermediaries from timing the connection out.
pub fn sse_response(
    subscription: Subscription,
    options: SseStreamOptions,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let replayed_through = options.replay.last().map(|e| e.id).unwrap_or(0);
    let state = StreamState {
        replay: options.replay.into(),
        subscription,
        heartbeat: options.heartbeat,
        until_terminal: options.until_terminal,
        replayed_through,
        done: false,
    };

    let stream = futures_util::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        // Drain replay before touching the live queue.
        if let Some(event) = state.replay.pop_front() {
            state.done = state.until_terminal && event.is_terminal();
            return Some((Ok(to_wire(&event)), state));
        }
        loop {
            match tokio::time::timeout(state.heartbeat, state.subscription.next()).await {
                Ok(Some(event)) => {
                    if event.id != 0 && event.id <= state.replayed_through {
                        continue;
                    }
                    state.done = state.until_terminal && event.is_terminal();
                    return Some((Ok(to_wire(&event)), state));
                }
                Ok(None) => return None,
                Err(_) => {
                    let beat = EventRecord::heartbeat();
                    return Some((Ok(to_wire(&beat)), state));
                }
            }
        }
    });

    Sse::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_then_publish_delivers_in_order() {
        let bus = EventBus::new(100, 256);
        let mut sub = bus.subscribe(TagFilter::only("upload:graph"));

        bus.publish("upload:graph", EventRecord::progress(serde_json::json!({"pct": 1})));
        bus.publish("upload:graph", EventRecord::progress(serde_json::json!({"pct": 2})));
        bus.publish("other", EventRecord::progress(serde_json::json!({"pct": 99})));

        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(first.payload["pct"], 1);
        assert_eq!(second.payload["pct"], 2);
        assert!(first.id < second.id);
        assert!(sub.try_next().is_none(), "filtered source must not be delivered");
    }

    #[tokio::test]
    async fn tail_replays_recent_events() {
        let bus = EventBus::new(3, 256);
        for i in 0..5 {
            bus.publish("app", EventRecord::log(serde_json::json!({"n": i})));
        }
        let tail = bus.tail("app");
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].payload["n"], 2);
        assert_eq!(tail[2].payload["n"], 4);
    }

    #[tokio::test]
    async fn slow_subscriber_gets_overflow_marker_not_blocked_publisher() {
        let bus = EventBus::new(100, 4);
        let mut sub = bus.subscribe(TagFilter::only("s"));

        for i in 0..20 {
            bus.publish("s", EventRecord::progress(serde_json::json!({"n": i})));
        }

        let first = sub.next().await.unwrap();
        assert_eq!(first.kind, KIND_OVERFLOW, "gap must be marked for resync");

        // Everything after the marker is the newest tail, still in order.
        let mut last_seen = None;
        while let Some(event) = sub.try_next() {
            if let Some(prev) = last_seen {
                assert!(event.id > prev);
            }
            last_seen = Some(event.id);
        }
        assert!(last_seen.is_some());
    }

    #[tokio::test]
    async fn cancelled_subscriber_is_pruned_on_publish() {
        let bus = EventBus::new(100, 256);
        let sub = bus.subscribe(TagFilter::Any);
        assert_eq!(bus.subscriber_count(), 1);

        sub.cancel();
        bus.publish("s", EventRecord::progress(serde_json::json!({})));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn terminal_event_detection() {
        assert!(EventRecord::complete(serde_json::json!({})).is_terminal());
        assert!(EventRecord::error("boom").is_terminal());
        assert!(!EventRecord::progress(serde_json::json!({})).is_terminal());
        assert!(EventRecord::of("run_complete", serde_json::json!({})).is_terminal());
    }
}
