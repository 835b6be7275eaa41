use super::dead_letter::DeadLetter;
use super::event::{EventEnvelope, EventKey, Topic};
use super::ids::{CustomerId, OrderId, PaymentId};
use super::order::{Order, OrderStatus};
use super::payment::{Payment, PaymentStatus};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Secondary lookups supported by an [`OrderStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum OrderField {
    CustomerId(CustomerId),
    Status(OrderStatus),
    /// Orders whose last event was persisted but never confirmed as published.
    PendingEvent,
}

impl OrderField {
    pub fn matches(&self, order: &Order) -> bool {
        match self {
            OrderField::CustomerId(customer) => &order.customer_id == customer,
            OrderField::Status(status) => order.status == *status,
            OrderField::PendingEvent => order.pending_event.is_some(),
        }
    }
}

/// Secondary lookups supported by a [`PaymentStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentField {
    OrderId(OrderId),
    CustomerId(CustomerId),
    Status(PaymentStatus),
    PendingEvent,
}

impl PaymentField {
    pub fn matches(&self, payment: &Payment) -> bool {
        match self {
            PaymentField::OrderId(order_id) => payment.order_id == *order_id,
            PaymentField::CustomerId(customer) => &payment.customer_id == customer,
            PaymentField::Status(status) => payment.status == *status,
            PaymentField::PendingEvent => payment.pending_event.is_some(),
        }
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn save(&self, order: Order) -> Result<()>;
    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>>;
    async fn find_by_field(&self, field: OrderField) -> Result<Vec<Order>>;
    async fn find_all(&self) -> Result<Vec<Order>>;
    /// Clears the `pending_event` marker in place, but only while the stored
    /// record still carries `event` and `status`. Returns whether it did.
    ///
    /// Must be atomic with respect to `save`, so a newer write is never undone.
    async fn clear_pending_event(
        &self,
        id: OrderId,
        event: EventKey,
        status: OrderStatus,
    ) -> Result<bool>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn save(&self, payment: Payment) -> Result<()>;
    async fn find_by_id(&self, id: PaymentId) -> Result<Option<Payment>>;
    async fn find_by_field(&self, field: PaymentField) -> Result<Vec<Payment>>;
    async fn find_all(&self) -> Result<Vec<Payment>>;
    /// See [`OrderStore::clear_pending_event`].
    async fn clear_pending_event(
        &self,
        id: PaymentId,
        event: EventKey,
        status: PaymentStatus,
    ) -> Result<bool>;
}

/// Deduplicates redelivered or concurrently delivered events.
///
/// `try_claim` must be linearizable: across any number of concurrent callers,
/// exactly one call per scope key observes `true`.
#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    async fn try_claim(&self, scope_key: &str) -> Result<bool>;
    /// Gives a claim back so a later delivery can take it.
    async fn release(&self, scope_key: &str) -> Result<()>;
}

/// Stream of envelopes delivered to one consumer group of one topic.
pub struct Subscription {
    pub topic: Topic,
    pub group_id: String,
    receiver: mpsc::UnboundedReceiver<EventEnvelope>,
}

impl Subscription {
    pub fn new(
        topic: Topic,
        group_id: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<EventEnvelope>,
    ) -> Self {
        Self {
            topic,
            group_id: group_id.into(),
            receiver,
        }
    }

    /// Waits for the next delivery. `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.receiver.recv().await
    }

    /// Returns a delivery that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.receiver.try_recv().ok()
    }
}

/// Logical publish/subscribe channel with at-least-once delivery.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Delivers the envelope to every consumer group subscribed to its topic.
    async fn publish_envelope(&self, envelope: EventEnvelope) -> Result<()>;

    async fn subscribe(&self, topic: Topic, group_id: &str) -> Result<Subscription>;

    async fn publish(&self, key: EventKey, payload: serde_json::Value) -> Result<EventEnvelope> {
        let envelope = EventEnvelope::new(key.topic(), key, payload);
        self.publish_envelope(envelope.clone()).await?;
        Ok(envelope)
    }
}

/// Where messages go once they can no longer be retried.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn push(&self, letter: DeadLetter) -> Result<()>;
}

/// Business logic behind a consumer group.
///
/// Returning an error asks the consumer to decide between retrying and
/// dead-lettering, based on [`crate::error::SagaError::is_retryable`] and
/// [`crate::error::SagaError::is_poison`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: EventEnvelope) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Completed,
    Failed,
}

/// Result of consulting a [`ProcessingPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingDecision {
    pub outcome: ProcessingOutcome,
    /// How long the simulated gateway takes before answering.
    pub latency: Duration,
}

/// Decides how a payment attempt ends. Stands in for a payment gateway.
pub trait ProcessingPolicy: Send + Sync {
    fn decide(&self, payment: &Payment) -> ProcessingDecision;
}

pub type OrderStoreRef = Arc<dyn OrderStore>;
pub type PaymentStoreRef = Arc<dyn PaymentStore>;
pub type IdempotencyGuardRef = Arc<dyn IdempotencyGuard>;
pub type EventBusRef = Arc<dyn EventBus>;
pub type DeadLetterSinkRef = Arc<dyn DeadLetterSink>;
pub type ProcessingPolicyRef = Arc<dyn ProcessingPolicy>;
