use crate::config::{SagaConfig, TimeoutPolicy};
use crate::domain::event::{EventEnvelope, EventKey};
use crate::domain::ids::{CustomerId, OrderId, PaymentId};
use crate::domain::order::{OrderSnapshot, OrderStatus};
use crate::domain::payment::{FailureReason, Payment, PaymentMethod, PaymentStatus};
use crate::domain::ports::{
    EventBusRef, EventHandler, IdempotencyGuardRef, OrderStoreRef, PaymentField,
    PaymentStoreRef, ProcessingOutcome, ProcessingPolicyRef,
};
use crate::error::{Result, SagaError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

/// How one processing attempt ended before it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Decided(ProcessingOutcome),
    TimedOut,
    Cancelled,
}

type InFlight = Arc<Mutex<HashMap<OrderId, Arc<Notify>>>>;

/// Marks an order as having an attempt in progress for as long as it lives.
struct InFlightEntry {
    registry: InFlight,
    order_id: OrderId,
    cancel: Arc<Notify>,
}

impl InFlightEntry {
    /// Registers an attempt for `order_id`, unless one is already running.
    fn try_register(registry: &InFlight, order_id: OrderId) -> Option<Self> {
        let cancel = match registry.lock().entry(order_id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => slot.insert(Arc::new(Notify::new())).clone(),
        };
        Some(Self {
            registry: registry.clone(),
            order_id,
            cancel,
        })
    }
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        let ours = registry
            .get(&self.order_id)
            .is_some_and(|cancel| Arc::ptr_eq(cancel, &self.cancel));
        if ours {
            registry.remove(&self.order_id);
        }
    }
}

/// Derives payments from `order.created` events and drives them to an outcome.
///
/// Owns the payment records. Orders are only read, to honour cancellations.
pub struct PaymentProcessor {
    payments: PaymentStoreRef,
    orders: OrderStoreRef,
    guard: IdempotencyGuardRef,
    bus: EventBusRef,
    policy: ProcessingPolicyRef,
    default_method: PaymentMethod,
    processing_timeout: Duration,
    timeout_policy: TimeoutPolicy,
    in_flight: InFlight,
}

impl PaymentProcessor {
    pub fn new(
        payments: PaymentStoreRef,
        orders: OrderStoreRef,
        guard: IdempotencyGuardRef,
        bus: EventBusRef,
        policy: ProcessingPolicyRef,
        config: &SagaConfig,
    ) -> Self {
        Self {
            payments,
            orders,
            guard,
            bus,
            policy,
            default_method: config.default_method,
            processing_timeout: config.processing_timeout,
            timeout_policy: config.timeout_policy,
            in_flight: Arc::default(),
        }
    }

    /// Scope key under which an `order.created` delivery is claimed.
    pub fn claim_key(order_id: OrderId) -> String {
        format!("{}:{}", order_id, EventKey::OrderCreated)
    }

    /// Handles one delivery of `order.created`.
    ///
    /// Returns the payment this delivery drove to an outcome, or `None` when
    /// the delivery was a duplicate and nothing was touched.
    #[instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    pub async fn on_order_created(&self, envelope: &EventEnvelope) -> Result<Option<Payment>> {
        if envelope.key != EventKey::OrderCreated {
            return Err(SagaError::PoisonMessage(format!(
                "expected {} but got {}",
                EventKey::OrderCreated,
                envelope.key
            )));
        }
        let order: OrderSnapshot = parse_payload(envelope)?;
        // One attempt per order at a time in this process. The entry is taken
        // before the claim so a redelivery can never drive the same payment twice.
        let Some(entry) = InFlightEntry::try_register(&self.in_flight, order.id) else {
            info!(order_id = %order.id, "Duplicate order.created while payment is in flight, acknowledged");
            return Ok(None);
        };
        let claim_key = Self::claim_key(order.id);

        if self.guard.try_claim(&claim_key).await? {
            return self.start_payment(order, &claim_key, &entry).await.map(Some);
        }

        // Someone took the claim before. Resume only when that attempt died
        // part-way and left an unsettled payment behind.
        let stalled = self
            .payments
            .find_by_field(PaymentField::OrderId(order.id))
            .await?
            .into_iter()
            .find(|payment| !payment.status.is_settled());
        match stalled {
            Some(payment) => {
                info!(order_id = %order.id, payment_id = %payment.id, status = %payment.status, "Resuming stalled payment");
                self.drive(payment, &entry).await.map(Some)
            }
            None => {
                info!(order_id = %order.id, "Duplicate order.created, acknowledged");
                Ok(None)
            }
        }
    }

    async fn start_payment(
        &self,
        order: OrderSnapshot,
        claim_key: &str,
        entry: &InFlightEntry,
    ) -> Result<Payment> {
        let payment = Payment::new(
            order.id,
            order.customer_id,
            order.total_amount,
            self.default_method,
        );
        if let Err(e) = self.payments.save(payment.clone()).await {
            // Nothing was written, so a redelivery may start over.
            self.guard.release(claim_key).await?;
            return Err(e);
        }
        info!(order_id = %payment.order_id, payment_id = %payment.id, method = %payment.method, "Payment created");
        self.drive(payment, entry).await
    }

    /// Takes a `Pending` or `Processing` payment through one attempt to an outcome.
    async fn drive(&self, mut payment: Payment, entry: &InFlightEntry) -> Result<Payment> {
        if payment.status == PaymentStatus::Pending {
            payment.start_processing()?;
            self.payments.save(payment.clone()).await?;
        }

        let mut attempt = self.attempt(&payment, &entry.cancel).await;
        // A cancellation may have landed without reaching us.
        if attempt != Attempt::Cancelled && self.order_cancelled(payment.order_id).await? {
            attempt = Attempt::Cancelled;
        }

        let key = match attempt {
            Attempt::Decided(ProcessingOutcome::Completed) => {
                payment.complete()?;
                EventKey::PaymentCompleted
            }
            Attempt::Decided(ProcessingOutcome::Failed) => {
                payment.fail(FailureReason::Declined)?;
                EventKey::PaymentFailed
            }
            Attempt::Cancelled => {
                payment.fail(FailureReason::OrderCancelled)?;
                EventKey::PaymentFailed
            }
            Attempt::TimedOut => match self.timeout_policy {
                TimeoutPolicy::Fail => {
                    payment.fail(FailureReason::TimedOut)?;
                    EventKey::PaymentFailed
                }
                TimeoutPolicy::Retry => {
                    return Err(SagaError::TransientDelivery(format!(
                        "payment {} timed out after {:?}",
                        payment.id, self.processing_timeout
                    )));
                }
            },
        };

        // At most one outcome per payment, whoever recorded it first.
        let current = self.payments.find_by_id(payment.id).await?;
        if let Some(current) = current.filter(|stored| stored.status.is_settled()) {
            info!(payment_id = %current.id, status = %current.status, "Payment already settled, outcome dropped");
            return Ok(current);
        }

        let payment = self.record(payment, key).await?;
        info!(
            order_id = %payment.order_id,
            payment_id = %payment.id,
            status = %payment.status,
            reason = ?payment.failure_reason,
            "Payment processed"
        );
        Ok(payment)
    }

    /// Waits out the simulated gateway, bounded by the timeout and abortable
    /// through the cancel signal.
    async fn attempt(&self, payment: &Payment, cancel: &Notify) -> Attempt {
        let decision = self.policy.decide(payment);
        debug!(payment_id = %payment.id, latency = ?decision.latency, outcome = ?decision.outcome, "Processing payment");
        let gateway = tokio::time::timeout(
            self.processing_timeout,
            tokio::time::sleep(decision.latency),
        );
        tokio::select! {
            _ = cancel.notified() => Attempt::Cancelled,
            answered = gateway => match answered {
                Ok(()) => Attempt::Decided(decision.outcome),
                Err(_) => Attempt::TimedOut,
            },
        }
    }

    async fn order_cancelled(&self, order_id: OrderId) -> Result<bool> {
        Ok(self
            .orders
            .find_by_id(order_id)
            .await?
            .is_some_and(|order| order.status == OrderStatus::Cancelled))
    }

    /// Reacts to `order.status.updated`: a cancellation aborts the attempt in
    /// flight for that order, if any.
    #[instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    pub async fn on_order_status_updated(&self, envelope: &EventEnvelope) -> Result<()> {
        let order: OrderSnapshot = parse_payload(envelope)?;
        if order.status != OrderStatus::Cancelled {
            return Ok(());
        }
        if let Some(cancel) = self.in_flight.lock().get(&order.id) {
            info!(order_id = %order.id, "Order cancelled, aborting payment in flight");
            cancel.notify_one();
        }
        Ok(())
    }

    /// Refunds a completed payment and publishes `payment.refunded`.
    #[instrument(skip(self))]
    pub async fn refund(&self, payment_id: PaymentId) -> Result<Payment> {
        let mut payment = self
            .payments
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Payment", payment_id))?;
        payment.refund()?;
        let payment = self.record(payment, EventKey::PaymentRefunded).await?;
        info!(order_id = %payment.order_id, "Payment refunded");
        Ok(payment)
    }

    pub async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.payments.find_by_id(id).await
    }

    pub async fn list_all(&self) -> Result<Vec<Payment>> {
        self.payments.find_all().await
    }

    pub async fn list_by_order(&self, order_id: OrderId) -> Result<Vec<Payment>> {
        self.payments
            .find_by_field(PaymentField::OrderId(order_id))
            .await
    }

    pub async fn list_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Payment>> {
        self.payments
            .find_by_field(PaymentField::CustomerId(customer_id.clone()))
            .await
    }

    pub async fn list_by_status(&self, status: PaymentStatus) -> Result<Vec<Payment>> {
        self.payments
            .find_by_field(PaymentField::Status(status))
            .await
    }

    /// Publishes every payment whose last event never made it to the bus.
    pub async fn republish_pending(&self) -> Result<usize> {
        let pending = self
            .payments
            .find_by_field(PaymentField::PendingEvent)
            .await?;
        let mut republished = 0;
        for payment in pending {
            let Some(key) = payment.pending_event else {
                continue;
            };
            match self
                .bus
                .publish(key, serde_json::to_value(payment.snapshot())?)
                .await
            {
                Ok(_) => {
                    let cleared = self
                        .payments
                        .clear_pending_event(payment.id, key, payment.status)
                        .await?;
                    if !cleared {
                        debug!(payment_id = %payment.id, %key, "Payment changed while republishing, newer record kept");
                    }
                    republished += 1;
                }
                Err(e) => {
                    warn!(payment_id = %payment.id, %key, error = %e, "Republish failed, will retry on next sweep");
                }
            }
        }
        Ok(republished)
    }

    async fn record(&self, mut payment: Payment, key: EventKey) -> Result<Payment> {
        payment.pending_event = Some(key);
        self.payments.save(payment.clone()).await?;

        let payload = serde_json::to_value(payment.snapshot())?;
        match self.bus.publish(key, payload).await {
            Ok(_) => {
                payment.pending_event = None;
                self.payments
                    .clear_pending_event(payment.id, key, payment.status)
                    .await?;
            }
            Err(e) => {
                warn!(payment_id = %payment.id, %key, error = %e, "Publish failed, left for reconciliation");
            }
        }
        Ok(payment)
    }
}

#[async_trait]
impl EventHandler for PaymentProcessor {
    async fn handle(&self, envelope: EventEnvelope) -> Result<()> {
        match envelope.key {
            EventKey::OrderCreated => self.on_order_created(&envelope).await.map(|_| ()),
            EventKey::OrderStatusUpdated => self.on_order_status_updated(&envelope).await,
            other => {
                debug!(key = %other, "Ignoring event");
                Ok(())
            }
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(envelope: &EventEnvelope) -> Result<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| {
        SagaError::PoisonMessage(format!(
            "malformed {} payload (event {}): {}",
            envelope.key, envelope.event_id, e
        ))
    })
}
