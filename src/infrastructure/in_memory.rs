use crate::domain::dead_letter::DeadLetter;
use crate::domain::event::{EventEnvelope, EventKey, Topic};
use crate::domain::ids::{OrderId, PaymentId};
use crate::domain::order::{Order, OrderStatus};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::ports::{
    DeadLetterSink, EventBus, IdempotencyGuard, OrderField, OrderStore, PaymentField,
    PaymentStore, Subscription,
};
use crate::error::{Result, SagaError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

/// A thread-safe in-memory store for orders.
///
/// Uses `Arc<RwLock<HashMap<OrderId, Order>>>` to allow shared concurrent access.
/// Ideal for testing or single-process runs where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
}

impl InMemoryOrderStore {
    /// Creates a new, empty in-memory order store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn save(&self, order: Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        orders.insert(order.id, order);
        Ok(())
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        let orders = self.orders.read().await;
        Ok(orders.get(&id).cloned())
    }

    async fn find_by_field(&self, field: OrderField) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .filter(|order| field.matches(order))
            .cloned()
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        Ok(orders.values().cloned().collect())
    }

    async fn clear_pending_event(
        &self,
        id: OrderId,
        event: EventKey,
        status: OrderStatus,
    ) -> Result<bool> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(&id) {
            Some(order) if order.pending_event == Some(event) && order.status == status => {
                order.pending_event = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A thread-safe in-memory store for payments.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    payments: Arc<RwLock<HashMap<PaymentId, Payment>>>,
}

impl InMemoryPaymentStore {
    /// Creates a new, empty in-memory payment store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn save(&self, payment: Payment) -> Result<()> {
        let mut payments = self.payments.write().await;
        payments.insert(payment.id, payment);
        Ok(())
    }

    async fn find_by_id(&self, id: PaymentId) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.get(&id).cloned())
    }

    async fn find_by_field(&self, field: PaymentField) -> Result<Vec<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .filter(|payment| field.matches(payment))
            .cloned()
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.values().cloned().collect())
    }

    async fn clear_pending_event(
        &self,
        id: PaymentId,
        event: EventKey,
        status: PaymentStatus,
    ) -> Result<bool> {
        let mut payments = self.payments.write().await;
        match payments.get_mut(&id) {
            Some(payment) if payment.pending_event == Some(event) && payment.status == status => {
                payment.pending_event = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Claim ledger backed by a set. The insert happens under the write lock, so
/// concurrent claims for one key are linearized.
#[derive(Default, Clone)]
pub struct InMemoryIdempotencyGuard {
    claims: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryIdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyGuard for InMemoryIdempotencyGuard {
    async fn try_claim(&self, scope_key: &str) -> Result<bool> {
        let mut claims = self.claims.write().await;
        Ok(claims.insert(scope_key.to_string()))
    }

    async fn release(&self, scope_key: &str) -> Result<()> {
        let mut claims = self.claims.write().await;
        claims.remove(scope_key);
        Ok(())
    }
}

struct GroupChannel {
    group_id: String,
    sender: mpsc::UnboundedSender<EventEnvelope>,
}

#[derive(Default)]
struct BusState {
    groups: HashMap<Topic, Vec<GroupChannel>>,
    history: Vec<EventEnvelope>,
}

/// In-process event bus.
///
/// Every consumer group subscribed to a topic gets its own copy of each
/// envelope. Publishing the same envelope twice delivers it twice, which is
/// how redelivery is simulated. All publications are kept in a history so
/// callers can inspect what went out.
#[derive(Default, Clone)]
pub struct InMemoryEventBus {
    state: Arc<RwLock<BusState>>,
    failures_left: Arc<AtomicUsize>,
    delays: Arc<Mutex<HashMap<EventKey, Duration>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publications fail with a transient error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Holds every later publication of `key` for `delay` before it goes out.
    pub fn delay_publishes(&self, key: EventKey, delay: Duration) {
        self.delays.lock().insert(key, delay);
    }

    /// Every envelope successfully published so far, in publication order.
    pub async fn published(&self) -> Vec<EventEnvelope> {
        self.state.read().await.history.clone()
    }

    pub async fn published_with_key(&self, key: EventKey) -> Vec<EventEnvelope> {
        self.state
            .read()
            .await
            .history
            .iter()
            .filter(|envelope| envelope.key == key)
            .cloned()
            .collect()
    }

    /// Drops all subscriptions, ending every consumer's stream.
    pub async fn close(&self) {
        self.state.write().await.groups.clear();
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish_envelope(&self, envelope: EventEnvelope) -> Result<()> {
        if self.take_injected_failure() {
            return Err(SagaError::TransientDelivery(format!(
                "broker unavailable while publishing {}",
                envelope.key
            )));
        }
        let delay = self.delays.lock().get(&envelope.key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        if let Some(channels) = state.groups.get(&envelope.topic) {
            for channel in channels {
                if channel.sender.send(envelope.clone()).is_err() {
                    warn!(
                        topic = %envelope.topic,
                        group = %channel.group_id,
                        "Consumer group is gone, delivery skipped"
                    );
                }
            }
        }
        debug!(topic = %envelope.topic, key = %envelope.key, event_id = %envelope.event_id, "Published event");
        state.history.push(envelope);
        Ok(())
    }

    async fn subscribe(&self, topic: Topic, group_id: &str) -> Result<Subscription> {
        let mut state = self.state.write().await;
        let channels = state.groups.entry(topic).or_default();
        if channels.iter().any(|channel| channel.group_id == group_id) {
            return Err(SagaError::InvalidState(format!(
                "group '{}' is already subscribed to {}",
                group_id, topic
            )));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        channels.push(GroupChannel {
            group_id: group_id.to_string(),
            sender,
        });
        Ok(Subscription::new(topic, group_id, receiver))
    }
}

/// Dead letters kept in memory until someone drains them for replay.
#[derive(Default, Clone)]
pub struct InMemoryDeadLetterQueue {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<DeadLetter> {
        self.letters.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.letters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.letters.read().await.is_empty()
    }

    /// Removes and returns every dead letter.
    pub async fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.letters.write().await)
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterQueue {
    async fn push(&self, letter: DeadLetter) -> Result<()> {
        self.letters.write().await.push(letter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::CustomerId;
    use crate::domain::money::Amount;
    use crate::domain::order::{NewOrder, OrderStatus};
    use crate::domain::payment::{PaymentMethod, PaymentStatus};
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_order_store() {
        let store = InMemoryOrderStore::new();
        let order = Order::create(NewOrder::new("C1", dec!(100.0))).unwrap();

        store.save(order.clone()).await.unwrap();
        let retrieved = store.find_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(retrieved, order);

        assert!(store.find_by_id(OrderId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_order_store_find_by_field() {
        let store = InMemoryOrderStore::new();
        let first = Order::create(NewOrder::new("C1", dec!(1.0))).unwrap();
        let mut second = Order::create(NewOrder::new("C2", dec!(2.0))).unwrap();
        second.transition_to(OrderStatus::Confirmed).unwrap();
        store.save(first.clone()).await.unwrap();
        store.save(second.clone()).await.unwrap();

        let by_customer = store
            .find_by_field(OrderField::CustomerId(CustomerId::new("C1").unwrap()))
            .await
            .unwrap();
        assert_eq!(by_customer, vec![first]);

        let confirmed = store
            .find_by_field(OrderField::Status(OrderStatus::Confirmed))
            .await
            .unwrap();
        assert_eq!(confirmed, vec![second]);

        let none = store
            .find_by_field(OrderField::Status(OrderStatus::Shipped))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_payment_store() {
        let store = InMemoryPaymentStore::new();
        let order_id = OrderId::new();
        let payment = Payment::new(
            order_id,
            CustomerId::new("C1").unwrap(),
            Amount::new(dec!(10.0)).unwrap(),
            PaymentMethod::PayPal,
        );
        store.save(payment.clone()).await.unwrap();

        assert_eq!(
            store.find_by_id(payment.id).await.unwrap(),
            Some(payment.clone())
        );
        assert_eq!(
            store
                .find_by_field(PaymentField::OrderId(order_id))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(
            store
                .find_by_field(PaymentField::Status(PaymentStatus::Completed))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_clear_pending_event_leaves_newer_writes_alone() {
        let store = InMemoryOrderStore::new();
        let mut order = Order::create(NewOrder::new("C1", dec!(3.0))).unwrap();
        order.pending_event = Some(EventKey::OrderCreated);
        store.save(order.clone()).await.unwrap();

        // A status change landed after the marker was read.
        let mut newer = order.clone();
        newer.transition_to(OrderStatus::Cancelled).unwrap();
        newer.pending_event = Some(EventKey::OrderStatusUpdated);
        store.save(newer.clone()).await.unwrap();

        let cleared = store
            .clear_pending_event(order.id, EventKey::OrderCreated, OrderStatus::Pending)
            .await
            .unwrap();
        assert!(!cleared);
        assert_eq!(store.find_by_id(order.id).await.unwrap(), Some(newer));

        assert!(
            store
                .clear_pending_event(order.id, EventKey::OrderStatusUpdated, OrderStatus::Cancelled)
                .await
                .unwrap()
        );
        let stored = store.find_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert!(stored.pending_event.is_none());
    }

    #[tokio::test]
    async fn test_guard_claims_once() {
        let guard = InMemoryIdempotencyGuard::new();
        assert!(guard.try_claim("o1:order.created").await.unwrap());
        assert!(!guard.try_claim("o1:order.created").await.unwrap());
        assert!(guard.try_claim("o2:order.created").await.unwrap());

        guard.release("o1:order.created").await.unwrap();
        assert!(guard.try_claim("o1:order.created").await.unwrap());
    }

    #[tokio::test]
    async fn test_guard_concurrent_claims_have_one_winner() {
        let guard = InMemoryIdempotencyGuard::new();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard.try_claim("same-key").await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_bus_delivers_to_each_group() {
        let bus = InMemoryEventBus::new();
        let mut payments = bus.subscribe(Topic::OrderEvents, "payments").await.unwrap();
        let mut audit = bus.subscribe(Topic::OrderEvents, "audit").await.unwrap();
        let mut other = bus.subscribe(Topic::PaymentEvents, "orders").await.unwrap();

        let envelope = bus
            .publish(EventKey::OrderCreated, json!({ "id": 1 }))
            .await
            .unwrap();

        assert_eq!(payments.recv().await.unwrap(), envelope);
        assert_eq!(audit.recv().await.unwrap(), envelope);
        assert!(other.try_recv().is_none());
        assert_eq!(bus.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_bus_rejects_duplicate_group() {
        let bus = InMemoryEventBus::new();
        let _first = bus.subscribe(Topic::OrderEvents, "g").await.unwrap();
        assert!(bus.subscribe(Topic::OrderEvents, "g").await.is_err());
    }

    #[tokio::test]
    async fn test_bus_injected_failures() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);

        let first = bus.publish(EventKey::OrderCreated, json!({})).await;
        assert!(matches!(first, Err(SagaError::TransientDelivery(_))));

        bus.publish(EventKey::OrderCreated, json!({})).await.unwrap();
        assert_eq!(bus.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_bus_delays_publications_of_one_key() {
        let bus = InMemoryEventBus::new();
        bus.delay_publishes(EventKey::PaymentCompleted, Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        bus.publish(EventKey::PaymentFailed, json!({})).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        bus.publish(EventKey::PaymentCompleted, json!({})).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(bus.published().await.len(), 2);
    }
}
