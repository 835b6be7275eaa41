use crate::application::order_lifecycle::OrderLifecycleManager;
use crate::domain::event::{EventEnvelope, EventKey};
use crate::domain::order::OrderStatus;
use crate::domain::payment::PaymentSnapshot;
use crate::domain::ports::EventHandler;
use crate::error::{Result, SagaError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Feeds payment outcomes back onto the order they belong to.
///
/// `payment.completed` confirms a pending order and `payment.failed` cancels
/// it. Redeliveries and outcomes that no longer fit the order's state are
/// acknowledged without changes.
pub struct PaymentOutcomeListener {
    orders: Arc<OrderLifecycleManager>,
}

impl PaymentOutcomeListener {
    pub fn new(orders: Arc<OrderLifecycleManager>) -> Self {
        Self { orders }
    }

    #[instrument(skip(self, envelope), fields(event_id = %envelope.event_id, key = %envelope.key))]
    async fn apply(&self, envelope: &EventEnvelope) -> Result<()> {
        let target = match envelope.key {
            EventKey::PaymentCompleted => OrderStatus::Confirmed,
            EventKey::PaymentFailed => OrderStatus::Cancelled,
            other => {
                debug!(key = %other, "No order change for this event");
                return Ok(());
            }
        };
        let payment: PaymentSnapshot = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| {
                SagaError::PoisonMessage(format!("malformed {} payload: {}", envelope.key, e))
            })?;

        let Some(order) = self.orders.get(payment.order_id).await? else {
            warn!(order_id = %payment.order_id, payment_id = %payment.id, "Payment outcome for unknown order, acknowledged");
            return Ok(());
        };
        if order.status == target {
            debug!(order_id = %order.id, status = %order.status, "Outcome already applied");
            return Ok(());
        }
        if !order.status.can_transition_to(target) {
            info!(order_id = %order.id, status = %order.status, wanted = %target, "Order moved on, outcome ignored");
            return Ok(());
        }

        self.orders.update_status(order.id, target).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for PaymentOutcomeListener {
    async fn handle(&self, envelope: EventEnvelope) -> Result<()> {
        self.apply(&envelope).await
    }
}
