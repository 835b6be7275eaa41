use crate::domain::payment::PaymentMethod;
use std::time::Duration;

/// Consumer group the payment processor reads `order-events` with.
pub const PAYMENT_SERVICE_GROUP: &str = "payment-service-group";
/// Consumer group the order side reads `payment-events` with.
pub const ORDER_SERVICE_GROUP: &str = "order-service-group";

/// What an attempt that outlives `processing_timeout` turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Record the payment as `Failed` with reason `TimedOut`.
    #[default]
    Fail,
    /// Surface a transient error so the delivery is retried.
    Retry,
}

/// Retry budget for transient handler failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from `base_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Runtime knobs for the saga.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaConfig {
    /// Method assigned to payments derived from `order.created`.
    pub default_method: PaymentMethod,
    /// Probability that the random processing policy approves a payment.
    pub success_rate: f64,
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// Upper bound on a single processing attempt.
    pub processing_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    /// Handlers running concurrently per consumer.
    pub worker_pool_size: usize,
    pub retry: RetryPolicy,
    pub reconcile_interval: Duration,
    /// Whether payment outcomes are fed back onto the order.
    pub close_loop: bool,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            default_method: PaymentMethod::CreditCard,
            success_rate: 0.8,
            min_latency: Duration::from_millis(1000),
            max_latency: Duration::from_millis(3000),
            processing_timeout: Duration::from_secs(10),
            timeout_policy: TimeoutPolicy::Fail,
            worker_pool_size: 8,
            retry: RetryPolicy::default(),
            reconcile_interval: Duration::from_secs(30),
            close_loop: true,
        }
    }
}
