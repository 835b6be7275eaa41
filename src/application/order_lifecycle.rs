use crate::domain::event::EventKey;
use crate::domain::ids::{CustomerId, OrderId};
use crate::domain::order::{NewOrder, Order, OrderStatus};
use crate::domain::ports::{EventBusRef, OrderField, OrderStoreRef};
use crate::error::{Result, SagaError};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

/// Owns the order records and their state machine.
///
/// Every accepted change is persisted first and published second. The record
/// carries a `pending_event` marker between the two steps, so a crash or a
/// failed publish leaves a trace that [`OrderLifecycleManager::republish_pending`]
/// can repair.
pub struct OrderLifecycleManager {
    orders: OrderStoreRef,
    bus: EventBusRef,
}

impl OrderLifecycleManager {
    pub fn new(orders: OrderStoreRef, bus: EventBusRef) -> Self {
        Self { orders, bus }
    }

    /// Validates and persists a new `Pending` order, then publishes `order.created`.
    #[instrument(skip(self, input), fields(customer_id = %input.customer_id))]
    pub async fn create(&self, input: NewOrder) -> Result<Order> {
        let order = Order::create(input)?;
        let order = self.record(order, EventKey::OrderCreated).await?;
        info!(order_id = %order.id, amount = %order.total_amount, "Order created");
        Ok(order)
    }

    pub async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self
            .orders
            .find_by_id(id)
            .await?
            .filter(|order| !order.is_deleted()))
    }

    pub async fn list_all(&self) -> Result<Vec<Order>> {
        Ok(visible(self.orders.find_all().await?))
    }

    pub async fn list_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<Order>> {
        let orders = self
            .orders
            .find_by_field(OrderField::CustomerId(customer_id.clone()))
            .await?;
        Ok(visible(orders))
    }

    pub async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<Order>> {
        let orders = self.orders.find_by_field(OrderField::Status(status)).await?;
        Ok(visible(orders))
    }

    /// Applies one state machine edge and publishes `order.status.updated`.
    #[instrument(skip(self))]
    pub async fn update_status(&self, id: OrderId, status: OrderStatus) -> Result<Order> {
        let mut order = self
            .get(id)
            .await?
            .ok_or_else(|| SagaError::not_found("Order", id))?;
        let previous = order.status;
        order.transition_to(status)?;
        let order = self.record(order, EventKey::OrderStatusUpdated).await?;
        info!(%previous, current = %order.status, "Order status updated");
        Ok(order)
    }

    /// Soft delete. The tombstoned record stays in the store because payments
    /// may still refer to it.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: OrderId) -> Result<()> {
        let mut order = self
            .get(id)
            .await?
            .ok_or_else(|| SagaError::not_found("Order", id))?;
        let now = Utc::now();
        order.deleted_at = Some(now);
        order.updated_at = now;
        self.orders.save(order).await?;
        info!("Order deleted");
        Ok(())
    }

    /// Publishes every order whose last event never made it to the bus.
    /// Returns how many were republished.
    pub async fn republish_pending(&self) -> Result<usize> {
        let pending = self.orders.find_by_field(OrderField::PendingEvent).await?;
        let mut republished = 0;
        for order in pending {
            let Some(key) = order.pending_event else {
                continue;
            };
            match self
                .bus
                .publish(key, serde_json::to_value(order.snapshot())?)
                .await
            {
                Ok(_) => {
                    // A change made meanwhile carries its own marker and wins.
                    let cleared = self
                        .orders
                        .clear_pending_event(order.id, key, order.status)
                        .await?;
                    if !cleared {
                        debug!(order_id = %order.id, %key, "Order changed while republishing, newer record kept");
                    }
                    republished += 1;
                }
                Err(e) => {
                    warn!(order_id = %order.id, %key, error = %e, "Republish failed, will retry on next sweep");
                }
            }
        }
        Ok(republished)
    }

    async fn record(&self, mut order: Order, key: EventKey) -> Result<Order> {
        order.pending_event = Some(key);
        self.orders.save(order.clone()).await?;

        let payload = serde_json::to_value(order.snapshot())?;
        match self.bus.publish(key, payload).await {
            Ok(_) => {
                order.pending_event = None;
                self.orders
                    .clear_pending_event(order.id, key, order.status)
                    .await?;
            }
            Err(e) => {
                warn!(order_id = %order.id, %key, error = %e, "Publish failed, left for reconciliation");
            }
        }
        Ok(order)
    }
}

fn visible(orders: Vec<Order>) -> Vec<Order> {
    orders
        .into_iter()
        .filter(|order| !order.is_deleted())
        .collect()
}
