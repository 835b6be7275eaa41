use crate::application::order_lifecycle::OrderLifecycleManager;
use crate::application::payment_processor::PaymentProcessor;
use crate::error::{Result, SagaError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// What one sweep put back on the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orders: usize,
    pub payments: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.orders + self.payments
    }
}

/// Republishes events whose records were saved but never announced.
pub struct Reconciler {
    orders: Arc<OrderLifecycleManager>,
    payments: Arc<PaymentProcessor>,
}

impl Reconciler {
    pub fn new(orders: Arc<OrderLifecycleManager>, payments: Arc<PaymentProcessor>) -> Self {
        Self { orders, payments }
    }

    pub async fn sweep(&self) -> Result<ReconcileReport> {
        let report = ReconcileReport {
            orders: self.orders.republish_pending().await?,
            payments: self.payments.republish_pending().await?,
        };
        if report.total() > 0 {
            info!(orders = report.orders, payments = report.payments, "Reconciled unpublished events");
        }
        Ok(report)
    }

    /// Sweeps every `interval` until the handle is shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ReconcilerHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "Reconciliation sweep failed");
                        }
                    }
                }
            }
        });
        ReconcilerHandle { stop, task }
    }
}

pub struct ReconcilerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.task
            .await
            .map_err(|e| SagaError::InvalidState(format!("reconciler panicked: {}", e)))
    }
}
