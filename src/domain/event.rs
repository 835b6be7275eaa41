use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical channels events are published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "order-events")]
    OrderEvents,
    #[serde(rename = "payment-events")]
    PaymentEvents,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::OrderEvents => "order-events",
            Topic::PaymentEvents => "payment-events",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event type carried as the message key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKey {
    #[serde(rename = "order.created")]
    OrderCreated,
    #[serde(rename = "order.status.updated")]
    OrderStatusUpdated,
    #[serde(rename = "payment.completed")]
    PaymentCompleted,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
}

impl EventKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKey::OrderCreated => "order.created",
            EventKey::OrderStatusUpdated => "order.status.updated",
            EventKey::PaymentCompleted => "payment.completed",
            EventKey::PaymentFailed => "payment.failed",
            EventKey::PaymentRefunded => "payment.refunded",
        }
    }

    /// The topic every event of this type is published on.
    pub fn topic(&self) -> Topic {
        match self {
            EventKey::OrderCreated | EventKey::OrderStatusUpdated => Topic::OrderEvents,
            EventKey::PaymentCompleted | EventKey::PaymentFailed | EventKey::PaymentRefunded => {
                Topic::PaymentEvents
            }
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published event as seen by subscribers.
///
/// `event_id` identifies one publication. Redelivery of the same publication
/// carries the same `event_id`; a republish by the reconciler gets a new one,
/// which is why consumers deduplicate on business keys rather than on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub topic: Topic,
    pub key: EventKey,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(topic: Topic, key: EventKey, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            topic,
            key,
            occurred_at: Utc::now(),
            payload,
        }
    }
}
