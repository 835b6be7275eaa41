use super::event::EventEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterReason {
    /// The payload can never be handled.
    Poison,
    /// A transient failure outlasted the retry budget.
    Exhausted,
}

/// An undeliverable message, kept with enough context to replay it by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub envelope: EventEnvelope,
    pub group_id: String,
    pub reason: DeadLetterReason,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}
