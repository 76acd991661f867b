//! Fan-out of activity events to external subscribers (the SSE stream, in
//! deployments that run the web surface).
//!
//! Producers publish into one bounded channel; a dispatcher task copies each
//! event to every subscriber's own bounded channel. A subscriber that cannot
//! keep up loses its own copies only: publishing never blocks the DHCP
//! path, and one slow consumer cannot starve the others.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_PUBLISH_DEPTH: usize = 100;
pub const DEFAULT_SUBSCRIBER_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DhcpDiscover,
    DhcpOffer,
    DhcpRequest,
    DhcpAck,
    DhcpNak,
    DhcpRelease,
    DhcpDecline,
    LeaseExpired,
    GitSync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    pub details: serde_json::Value,
}

pub struct EventBus {
    tx: mpsc::Sender<Event>,
    subscribers: Arc<RwLock<HashMap<u64, mpsc::Sender<Event>>>>,
    next_event_id: AtomicU64,
    next_subscriber_id: AtomicU64,
    subscriber_depth: usize,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Self::with_depths(DEFAULT_PUBLISH_DEPTH, DEFAULT_SUBSCRIBER_DEPTH)
    }

    pub fn with_depths(publish_depth: usize, subscriber_depth: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Event>(publish_depth);
        let subscribers: Arc<RwLock<HashMap<u64, mpsc::Sender<Event>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let fanout = Arc::clone(&subscribers);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let subs = fanout.read().unwrap().clone();
                for (id, tx) in subs {
                    if tx.try_send(event.clone()).is_err() {
                        debug!("subscriber {} lagging, dropped event {}", id, event.id);
                    }
                }
            }
        });

        Arc::new(Self {
            tx,
            subscribers,
            next_event_id: AtomicU64::new(1),
            next_subscriber_id: AtomicU64::new(1),
            subscriber_depth,
        })
    }

    /// Publish an event. Non-blocking; when the global channel is full the
    /// event is dropped for everyone rather than stalling the producer.
    pub fn publish(&self, event_type: EventType, message: impl Into<String>, details: serde_json::Value) {
        let event = Event {
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            event_type,
            message: message.into(),
            details,
        };
        if self.tx.try_send(event).is_err() {
            debug!("event bus full, event dropped");
        }
    }

    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(self.subscriber_depth);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().unwrap().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().unwrap().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn events_reach_subscriber_with_monotone_ids() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe();

        bus.publish(EventType::DhcpDiscover, "discover", serde_json::json!({}));
        bus.publish(EventType::DhcpOffer, "offer", serde_json::json!({}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::DhcpDiscover);
        assert_eq!(second.event_type, EventType::DhcpOffer);
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn full_subscriber_drops_events_without_blocking_publish() {
        let bus = EventBus::with_depths(100, 2);
        let (_id, mut rx) = bus.subscribe();

        for i in 0..10 {
            bus.publish(EventType::DhcpAck, format!("ack {i}"), serde_json::json!({}));
        }
        // let the dispatcher drain the publish channel
        sleep(Duration::from_millis(50)).await;

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 2);

        // the bus keeps delivering once the backlog is gone
        bus.publish(EventType::DhcpNak, "nak", serde_json::json!({}));
        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscriber() {
        let bus = EventBus::new();
        let (id, _rx) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event {
            id: 7,
            timestamp: Utc::now(),
            event_type: EventType::GitSync,
            message: "sync complete".into(),
            details: serde_json::json!({"reservations_added": 1}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "git_sync");
        assert_eq!(json["id"], 7);
        assert_eq!(json["details"]["reservations_added"], 1);
    }
}
