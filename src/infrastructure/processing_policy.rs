use crate::config::SagaConfig;
use crate::domain::payment::Payment;
use crate::domain::ports::{ProcessingDecision, ProcessingOutcome, ProcessingPolicy};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Simulated gateway: approves with a fixed probability after a latency drawn
/// uniformly from `[min_latency, max_latency]`.
///
/// The random source is owned by the policy. Use [`RandomProcessingPolicy::seeded`]
/// for reproducible runs.
pub struct RandomProcessingPolicy {
    rng: Mutex<StdRng>,
    success_rate: f64,
    min_latency: Duration,
    max_latency: Duration,
}

impl RandomProcessingPolicy {
    pub fn new(success_rate: f64, min_latency: Duration, max_latency: Duration) -> Self {
        Self::with_rng(StdRng::from_entropy(), success_rate, min_latency, max_latency)
    }

    pub fn seeded(
        seed: u64,
        success_rate: f64,
        min_latency: Duration,
        max_latency: Duration,
    ) -> Self {
        Self::with_rng(
            StdRng::seed_from_u64(seed),
            success_rate,
            min_latency,
            max_latency,
        )
    }

    pub fn from_config(config: &SagaConfig, seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(
                seed,
                config.success_rate,
                config.min_latency,
                config.max_latency,
            ),
            None => Self::new(config.success_rate, config.min_latency, config.max_latency),
        }
    }

    fn with_rng(
        rng: StdRng,
        success_rate: f64,
        min_latency: Duration,
        max_latency: Duration,
    ) -> Self {
        Self {
            rng: Mutex::new(rng),
            success_rate: success_rate.clamp(0.0, 1.0),
            min_latency,
            max_latency: max_latency.max(min_latency),
        }
    }
}

impl ProcessingPolicy for RandomProcessingPolicy {
    fn decide(&self, _payment: &Payment) -> ProcessingDecision {
        let mut rng = self.rng.lock();
        let latency = if self.max_latency > self.min_latency {
            let min = self.min_latency.as_micros() as u64;
            let max = self.max_latency.as_micros() as u64;
            Duration::from_micros(rng.gen_range(min..=max))
        } else {
            self.min_latency
        };
        let outcome = if rng.gen_bool(self.success_rate) {
            ProcessingOutcome::Completed
        } else {
            ProcessingOutcome::Failed
        };
        ProcessingDecision { outcome, latency }
    }
}

/// Always answers with the same decision.
#[derive(Debug, Clone, Copy)]
pub struct FixedProcessingPolicy {
    decision: ProcessingDecision,
}

impl FixedProcessingPolicy {
    pub fn new(outcome: ProcessingOutcome, latency: Duration) -> Self {
        Self {
            decision: ProcessingDecision { outcome, latency },
        }
    }

    pub fn completing(latency: Duration) -> Self {
        Self::new(ProcessingOutcome::Completed, latency)
    }

    pub fn failing(latency: Duration) -> Self {
        Self::new(ProcessingOutcome::Failed, latency)
    }
}

impl ProcessingPolicy for FixedProcessingPolicy {
    fn decide(&self, _payment: &Payment) -> ProcessingDecision {
        self.decision
    }
}
