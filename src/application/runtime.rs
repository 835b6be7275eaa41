use crate::application::consumer::{self, ConsumerHandle, ConsumerOptions};
use crate::application::order_lifecycle::OrderLifecycleManager;
use crate::application::outcome_listener::PaymentOutcomeListener;
use crate::application::payment_processor::PaymentProcessor;
use crate::application::reconciler::{Reconciler, ReconcilerHandle};
use crate::config::{ORDER_SERVICE_GROUP, PAYMENT_SERVICE_GROUP, SagaConfig};
use crate::domain::event::Topic;
use crate::domain::ids::OrderId;
use crate::domain::order::OrderStatus;
use crate::domain::ports::{
    DeadLetterSinkRef, EventBusRef, IdempotencyGuardRef, OrderStoreRef, PaymentStoreRef,
    ProcessingPolicyRef,
};
use crate::error::Result;
use crate::infrastructure::in_memory::{
    InMemoryDeadLetterQueue, InMemoryEventBus, InMemoryIdempotencyGuard, InMemoryOrderStore,
    InMemoryPaymentStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const SETTLEMENT_POLL: Duration = Duration::from_millis(10);

/// Adapters the saga runs on.
#[derive(Clone)]
pub struct SagaPorts {
    pub orders: OrderStoreRef,
    pub payments: PaymentStoreRef,
    pub guard: IdempotencyGuardRef,
    pub bus: EventBusRef,
    pub dead_letters: DeadLetterSinkRef,
    pub policy: ProcessingPolicyRef,
}

impl SagaPorts {
    /// Everything in process memory. Nothing survives a restart.
    pub fn in_memory(policy: ProcessingPolicyRef) -> Self {
        Self {
            orders: Arc::new(InMemoryOrderStore::new()),
            payments: Arc::new(InMemoryPaymentStore::new()),
            guard: Arc::new(InMemoryIdempotencyGuard::new()),
            bus: Arc::new(InMemoryEventBus::new()),
            dead_letters: Arc::new(InMemoryDeadLetterQueue::new()),
            policy,
        }
    }
}

/// Both sides of the saga wired onto one bus.
///
/// The payment processor consumes `order-events` as
/// [`PAYMENT_SERVICE_GROUP`]. When `close_loop` is set, the order side
/// consumes `payment-events` as [`ORDER_SERVICE_GROUP`]. A reconciler
/// republishes anything saved but not yet announced.
pub struct SagaRuntime {
    orders: Arc<OrderLifecycleManager>,
    payments: Arc<PaymentProcessor>,
    reconciler: Arc<Reconciler>,
    consumers: Vec<ConsumerHandle>,
    reconciler_task: ReconcilerHandle,
    close_loop: bool,
}

impl SagaRuntime {
    pub async fn start(ports: SagaPorts, config: &SagaConfig) -> Result<Self> {
        let orders = Arc::new(OrderLifecycleManager::new(
            ports.orders.clone(),
            ports.bus.clone(),
        ));
        let payments = Arc::new(PaymentProcessor::new(
            ports.payments.clone(),
            ports.orders.clone(),
            ports.guard.clone(),
            ports.bus.clone(),
            ports.policy.clone(),
            config,
        ));
        let options = ConsumerOptions::from(config);

        let mut consumers = vec![
            consumer::subscribe(
                &ports.bus,
                Topic::OrderEvents,
                PAYMENT_SERVICE_GROUP,
                payments.clone(),
                ports.dead_letters.clone(),
                options,
            )
            .await?,
        ];
        if config.close_loop {
            consumers.push(
                consumer::subscribe(
                    &ports.bus,
                    Topic::PaymentEvents,
                    ORDER_SERVICE_GROUP,
                    Arc::new(PaymentOutcomeListener::new(orders.clone())),
                    ports.dead_letters.clone(),
                    options,
                )
                .await?,
            );
        }

        let reconciler = Arc::new(Reconciler::new(orders.clone(), payments.clone()));
        // Records left unannounced by an earlier run go out before new work.
        if let Err(e) = reconciler.sweep().await {
            warn!(error = %e, "Startup reconciliation failed");
        }
        let reconciler_task = reconciler.clone().spawn(config.reconcile_interval);

        info!(
            workers = config.worker_pool_size,
            close_loop = config.close_loop,
            "Saga runtime started"
        );
        Ok(Self {
            orders,
            payments,
            reconciler,
            consumers,
            reconciler_task,
            close_loop: config.close_loop,
        })
    }

    pub fn orders(&self) -> &Arc<OrderLifecycleManager> {
        &self.orders
    }

    pub fn payments(&self) -> &Arc<PaymentProcessor> {
        &self.payments
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Whether the order has a payment with an outcome and, when outcomes are
    /// fed back, the order has left `Pending`.
    pub async fn is_settled(&self, order_id: OrderId) -> Result<bool> {
        let payments = self.payments.list_by_order(order_id).await?;
        if !payments.iter().any(|payment| payment.status.is_settled()) {
            return Ok(false);
        }
        if !self.close_loop {
            return Ok(true);
        }
        Ok(self
            .orders
            .get(order_id)
            .await?
            .is_none_or(|order| order.status != OrderStatus::Pending))
    }

    /// Polls until every order is settled or `timeout` runs out. Returns the
    /// orders still unsettled, which is empty on success.
    pub async fn wait_for_settlement(
        &self,
        order_ids: &[OrderId],
        timeout: Duration,
    ) -> Result<Vec<OrderId>> {
        let deadline = Instant::now() + timeout;
        let mut pending = order_ids.to_vec();
        loop {
            let mut still = Vec::with_capacity(pending.len());
            for order_id in pending {
                if !self.is_settled(order_id).await? {
                    still.push(order_id);
                }
            }
            pending = still;
            if pending.is_empty() {
                return Ok(pending);
            }
            if Instant::now() >= deadline {
                warn!(unsettled = pending.len(), ?timeout, "Gave up waiting for settlement");
                return Ok(pending);
            }
            tokio::time::sleep(SETTLEMENT_POLL).await;
        }
    }

    /// Stops the consumers, letting in-flight deliveries finish, then the reconciler.
    pub async fn shutdown(self) -> Result<()> {
        for consumer in self.consumers {
            consumer.shutdown().await?;
        }
        self.reconciler_task.shutdown().await?;
        info!("Saga runtime stopped");
        Ok(())
    }
}
