#![allow(dead_code)]

use async_trait::async_trait;
use order_saga::application::runtime::{SagaPorts, SagaRuntime};
use order_saga::config::{RetryPolicy, SagaConfig};
use order_saga::domain::ids::{OrderId, PaymentId};
use order_saga::domain::event::EventKey;
use order_saga::domain::payment::{Payment, PaymentStatus};
use order_saga::domain::ports::{PaymentField, PaymentStore, PaymentStoreRef, ProcessingPolicy};
use order_saga::error::{Result, SagaError};
use order_saga::infrastructure::in_memory::{
    InMemoryDeadLetterQueue, InMemoryEventBus, InMemoryIdempotencyGuard, InMemoryOrderStore,
    InMemoryPaymentStore,
};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;

/// A running saga plus the concrete adapters behind it, for inspection.
pub struct TestSaga {
    pub runtime: SagaRuntime,
    pub bus: InMemoryEventBus,
    pub dead_letters: InMemoryDeadLetterQueue,
    pub orders: InMemoryOrderStore,
    pub payments: InMemoryPaymentStore,
}

/// Defaults with retries and reconciliation short enough for tests.
pub fn fast_config() -> SagaConfig {
    SagaConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        },
        reconcile_interval: Duration::from_millis(50),
        ..SagaConfig::default()
    }
}

pub async fn start_saga(policy: impl ProcessingPolicy + 'static, config: SagaConfig) -> TestSaga {
    let payments = InMemoryPaymentStore::new();
    start_saga_with(policy, config, payments.clone(), Arc::new(payments)).await
}

/// Like [`start_saga`], but the processor writes payments through `store`.
pub async fn start_saga_with(
    policy: impl ProcessingPolicy + 'static,
    config: SagaConfig,
    payments: InMemoryPaymentStore,
    store: PaymentStoreRef,
) -> TestSaga {
    let bus = InMemoryEventBus::new();
    let dead_letters = InMemoryDeadLetterQueue::new();
    let orders = InMemoryOrderStore::new();
    let ports = SagaPorts {
        orders: Arc::new(orders.clone()),
        payments: store,
        guard: Arc::new(InMemoryIdempotencyGuard::new()),
        bus: Arc::new(bus.clone()),
        dead_letters: Arc::new(dead_letters.clone()),
        policy: Arc::new(policy),
    };
    let runtime = SagaRuntime::start(ports, &config)
        .await
        .expect("runtime should start");
    TestSaga {
        runtime,
        bus,
        dead_letters,
        orders,
        payments,
    }
}

impl TestSaga {
    pub async fn settle(&self, order_ids: &[OrderId]) {
        let unsettled = self
            .runtime
            .wait_for_settlement(order_ids, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(unsettled.is_empty(), "unsettled orders: {:?}", unsettled);
    }

    pub async fn payments_for(&self, order_id: OrderId) -> Vec<Payment> {
        self.payments
            .find_by_field(PaymentField::OrderId(order_id))
            .await
            .unwrap()
    }
}

/// Polls `check` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check().await
}

/// Payment store whose first `failures` saves fail with a storage error.
pub struct FlakyPaymentStore {
    inner: InMemoryPaymentStore,
    failures_left: AtomicUsize,
    save_calls: AtomicUsize,
}

impl FlakyPaymentStore {
    pub fn new(inner: InMemoryPaymentStore, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
            save_calls: AtomicUsize::new(0),
        }
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentStore for FlakyPaymentStore {
    async fn save(&self, payment: Payment) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SagaError::StorageError("payment store unavailable".into()));
        }
        self.inner.save(payment).await
    }

    async fn find_by_id(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_field(&self, field: PaymentField) -> Result<Vec<Payment>> {
        self.inner.find_by_field(field).await
    }

    async fn find_all(&self) -> Result<Vec<Payment>> {
        self.inner.find_all().await
    }

    async fn clear_pending_event(
        &self,
        id: PaymentId,
        event: EventKey,
        status: PaymentStatus,
    ) -> Result<bool> {
        self.inner.clear_pending_event(id, event, status).await
    }
}

/// Writes a `customer, amount` CSV with the given rows.
pub fn orders_csv(rows: &[&str]) -> NamedTempFile {
    let mut csv = NamedTempFile::new().unwrap();
    writeln!(csv, "customer, amount").unwrap();
    for row in rows {
        writeln!(csv, "{}", row).unwrap();
    }
    csv.flush().unwrap();
    csv
}
