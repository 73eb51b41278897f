use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::warn;

pub const TOPIC_KNOWLEDGE_INGESTED: &str = "knowledge.ingested";
pub const TOPIC_RECORD_CREATED: &str = "record.created";
pub const TOPIC_RECORD_UPDATED: &str = "record.updated";
pub const TOPIC_RECORD_DELETED: &str = "record.deleted";
pub const TOPIC_AGENT_HANDOFF: &str = "agent.handoff";

/// Default per-subscriber channel capacity.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn topic(self) -> &'static str {
        match self {
            Self::Created => TOPIC_RECORD_CREATED,
            Self::Updated => TOPIC_RECORD_UPDATED,
            Self::Deleted => TOPIC_RECORD_DELETED,
        }
    }
}

/// Payload of a `record.*` change-data-capture event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordChange {
    pub entity_type: String,
    pub entity_id: String,
    pub workspace_id: String,
    pub change_type: ChangeType,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    KnowledgeIngested {
        knowledge_item_id: String,
        workspace_id: String,
        chunk_count: usize,
    },
    RecordChanged(RecordChange),
    AgentHandoff {
        workspace_id: String,
        run_id: String,
        case_id: String,
        reason: String,
        package: Value,
    },
}

/// In-process topic-keyed publish/subscribe.
///
/// Every subscriber gets its own buffered channel; publishing never blocks.
/// When a subscriber's buffer is full the event is dropped for that
/// subscriber only and a warning is recorded.
pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<HashMap<String, Vec<Sender<BusEvent>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a fresh receive channel for `topic`. The subscriber must keep
    /// draining it; a full buffer drops events for this subscriber only.
    pub fn subscribe(&self, topic: &str) -> Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.entry(topic.to_owned()).or_default().push(tx);
        rx
    }

    /// Non-blocking fan-out. Returns the number of subscribers the event was
    /// delivered to; dropped and disconnected subscribers are not counted.
    pub fn publish(&self, topic: &str, event: &BusEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(channels) = subscribers.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        channels.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic, "subscriber buffer full; dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        delivered
    }

    /// Closes every subscriber channel. Pending buffered events can still be
    /// drained by their receivers.
    pub fn close(&self) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingested(item: &str) -> BusEvent {
        BusEvent::KnowledgeIngested {
            knowledge_item_id: item.to_string(),
            workspace_id: "ws_1".to_string(),
            chunk_count: 2,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe(TOPIC_KNOWLEDGE_INGESTED);

        assert_eq!(bus.publish(TOPIC_KNOWLEDGE_INGESTED, &ingested("a")), 1);
        assert_eq!(bus.publish(TOPIC_KNOWLEDGE_INGESTED, &ingested("b")), 1);

        assert_eq!(rx.recv().await, Some(ingested("a")));
        assert_eq!(rx.recv().await, Some(ingested("b")));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(TOPIC_AGENT_HANDOFF, &ingested("a")), 0);
    }

    #[tokio::test]
    async fn full_buffer_drops_for_that_subscriber_only() {
        let bus = EventBus::new(1);
        let mut slow = bus.subscribe(TOPIC_KNOWLEDGE_INGESTED);
        let mut fast = bus.subscribe(TOPIC_KNOWLEDGE_INGESTED);

        assert_eq!(bus.publish(TOPIC_KNOWLEDGE_INGESTED, &ingested("a")), 2);
        // `slow` has not drained; its single-slot buffer is full now.
        assert_eq!(bus.publish(TOPIC_KNOWLEDGE_INGESTED, &ingested("b")), 1);

        assert_eq!(fast.recv().await, Some(ingested("a")));
        assert_eq!(fast.recv().await, Some(ingested("b")));
        assert_eq!(slow.recv().await, Some(ingested("a")));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::default();
        let mut created = bus.subscribe(TOPIC_RECORD_CREATED);
        let mut updated = bus.subscribe(TOPIC_RECORD_UPDATED);

        let change = BusEvent::RecordChanged(RecordChange {
            entity_type: "case".into(),
            entity_id: "case_1".into(),
            workspace_id: "ws_1".into(),
            change_type: ChangeType::Created,
            occurred_at: Utc::now(),
        });
        bus.publish(TOPIC_RECORD_CREATED, &change);

        assert_eq!(created.recv().await, Some(change));
        assert!(updated.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_ends_all_streams() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe(TOPIC_KNOWLEDGE_INGESTED);

        bus.close();
        assert_eq!(rx.recv().await, None);
        // Publishing after close reaches nobody.
        assert_eq!(bus.publish(TOPIC_KNOWLEDGE_INGESTED, &ingested("a")), 0);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let bus = EventBus::default();
        let rx = bus.subscribe(TOPIC_KNOWLEDGE_INGESTED);
        drop(rx);

        assert_eq!(bus.publish(TOPIC_KNOWLEDGE_INGESTED, &ingested("a")), 0);
    }
}
