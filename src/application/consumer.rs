use crate::config::{RetryPolicy, SagaConfig};
use crate::domain::dead_letter::{DeadLetter, DeadLetterReason};
use crate::domain::event::{EventEnvelope, Topic};
use crate::domain::ports::{DeadLetterSinkRef, EventBusRef, EventHandler, Subscription};
use crate::error::{Result, SagaError};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumerOptions {
    /// Deliveries handled at the same time.
    pub worker_pool_size: usize,
    pub retry: RetryPolicy,
}

impl From<&SagaConfig> for ConsumerOptions {
    fn from(config: &SagaConfig) -> Self {
        Self {
            worker_pool_size: config.worker_pool_size,
            retry: config.retry,
        }
    }
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::from(&SagaConfig::default())
    }
}

/// Drives one handler for one consumer group.
struct Worker {
    group_id: String,
    handler: Arc<dyn EventHandler>,
    dead_letters: DeadLetterSinkRef,
    retry: RetryPolicy,
    permits: Semaphore,
}

impl Worker {
    /// Hands the envelope to the handler until it is acknowledged,
    /// dead-lettered, or rejected as stale.
    async fn deliver(&self, envelope: EventEnvelope) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let Ok(permit) = self.permits.acquire().await else {
                return;
            };
            let result = self.handler.handle(envelope.clone()).await;
            drop(permit);

            let e = match result {
                Ok(()) => {
                    debug!(group = %self.group_id, key = %envelope.key, event_id = %envelope.event_id, attempts, "Event acknowledged");
                    return;
                }
                Err(e) => e,
            };

            if e.is_poison() {
                self.dead_letter(envelope, DeadLetterReason::Poison, e, attempts)
                    .await;
                return;
            }
            if !e.is_retryable() {
                // The event no longer applies to the current state.
                warn!(group = %self.group_id, key = %envelope.key, event_id = %envelope.event_id, error = %e, "Event rejected, acknowledged");
                return;
            }
            if attempts >= self.retry.max_attempts {
                self.dead_letter(envelope, DeadLetterReason::Exhausted, e, attempts)
                    .await;
                return;
            }

            let delay = self.retry.backoff(attempts);
            warn!(group = %self.group_id, key = %envelope.key, event_id = %envelope.event_id, attempts, ?delay, error = %e, "Handler failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    async fn dead_letter(
        &self,
        envelope: EventEnvelope,
        reason: DeadLetterReason,
        e: SagaError,
        attempts: u32,
    ) {
        error!(group = %self.group_id, key = %envelope.key, event_id = %envelope.event_id, ?reason, attempts, error = %e, "Moving event to dead letter queue");
        let letter = DeadLetter {
            envelope,
            group_id: self.group_id.clone(),
            reason,
            error: e.to_string(),
            attempts,
            failed_at: Utc::now(),
        };
        if let Err(e) = self.dead_letters.push(letter).await {
            error!(group = %self.group_id, error = %e, "Dead letter could not be stored, event dropped");
        }
    }
}

/// A running consumer. Dropping the handle stops reading new deliveries.
pub struct ConsumerHandle {
    topic: Topic,
    group_id: String,
    stop: watch::Sender<bool>,
    pump: JoinHandle<()>,
    in_flight: Arc<AtomicUsize>,
}

impl ConsumerHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Deliveries received but not yet acknowledged or dead-lettered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stops reading and waits for the deliveries already taken to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.pump.await.map_err(|e| {
            SagaError::InvalidState(format!("consumer '{}' panicked: {}", self.group_id, e))
        })
    }
}

/// Subscribes `group_id` to `topic` and feeds every delivery to `handler`.
///
/// Deliveries are handled concurrently, at most `worker_pool_size` at a
/// time. Failed deliveries are retried with exponential backoff while the
/// error is transient; poison messages and exhausted retries end up in
/// `dead_letters`.
pub async fn subscribe(
    bus: &EventBusRef,
    topic: Topic,
    group_id: &str,
    handler: Arc<dyn EventHandler>,
    dead_letters: DeadLetterSinkRef,
    options: ConsumerOptions,
) -> Result<ConsumerHandle> {
    let subscription = bus.subscribe(topic, group_id).await?;
    let worker = Arc::new(Worker {
        group_id: group_id.to_string(),
        handler,
        dead_letters,
        retry: options.retry,
        permits: Semaphore::new(options.worker_pool_size.max(1)),
    });
    let (stop, stopped) = watch::channel(false);
    let in_flight = Arc::new(AtomicUsize::new(0));

    info!(%topic, group = group_id, workers = options.worker_pool_size, "Consumer started");
    let pump = tokio::spawn(pump(subscription, worker, stopped, in_flight.clone()));

    Ok(ConsumerHandle {
        topic,
        group_id: group_id.to_string(),
        stop,
        pump,
        in_flight,
    })
}

async fn pump(
    mut subscription: Subscription,
    worker: Arc<Worker>,
    mut stopped: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
) {
    let mut workers = JoinSet::new();
    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            delivery = subscription.recv() => match delivery {
                Some(envelope) => {
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    let worker = worker.clone();
                    let in_flight = in_flight.clone();
                    workers.spawn(async move {
                        worker.deliver(envelope).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                None => {
                    info!(topic = %subscription.topic, group = %subscription.group_id, "Subscription closed");
                    break;
                }
            },
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    error!(group = %subscription.group_id, error = %e, "Delivery task panicked");
                }
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(group = %subscription.group_id, error = %e, "Delivery task panicked");
        }
    }
    info!(topic = %subscription.topic, group = %subscription.group_id, "Consumer stopped");
}
