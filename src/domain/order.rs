use super::event::EventKey;
use super::ids::{CustomerId, OrderId};
use super::money::Amount;
use crate::error::SagaError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];

    /// Returns true if `next` is an allowed edge out of this status.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, Processing)
                | (Processing, Shipped)
                | (Shipped, Delivered)
                | (Pending | Confirmed | Processing, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SagaError::ValidationError(format!("unknown order status '{}'", s)))
    }
}

/// Raw order input as received at the API boundary, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub customer_id: String,
    pub total_amount: Decimal,
}

impl NewOrder {
    pub fn new(customer_id: impl Into<String>, total_amount: Decimal) -> Self {
        Self {
            customer_id: customer_id.into(),
            total_amount,
        }
    }
}

/// An order owned by the order lifecycle manager.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Order {
    pub id: OrderId,
    pub customer_id: CustomerId,
    pub total_amount: Amount,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone. Deleted orders stay in the store so payments can still resolve them.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Event persisted but not yet confirmed as published.
    #[serde(default)]
    pub pending_event: Option<EventKey>,
}

impl Order {
    /// Validates raw input and builds a `Pending` order with a fresh id.
    pub fn create(input: NewOrder) -> Result<Self, SagaError> {
        let customer_id = CustomerId::new(input.customer_id)?;
        let total_amount = Amount::new(input.total_amount)?;
        let now = Utc::now();
        Ok(Self {
            id: OrderId::new(),
            customer_id,
            total_amount,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            pending_event: None,
        })
    }

    /// Moves the order along one edge of the state machine.
    pub fn transition_to(&mut self, next: OrderStatus) -> Result<(), SagaError> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                entity: "Order",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            id: self.id,
            customer_id: self.customer_id.clone(),
            total_amount: self.total_amount,
            status: self.status,
        }
    }
}

/// Payload of `order.created` and `order.status.updated`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshot {
    pub id: OrderId,
    pub customer_id: CustomerId,
    pub total_amount: Amount,
    pub status: OrderStatus,
}
