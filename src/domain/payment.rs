use super::event::EventKey;
use super::ids::{CustomerId, OrderId, PaymentId};
use super::money::Amount;
use crate::error::SagaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    #[default]
    CreditCard,
    DebitCard,
    #[serde(rename = "PAYPAL")]
    PayPal,
    BankTransfer,
    ApplePay,
    GooglePay,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 6] = [
        PaymentMethod::CreditCard,
        PaymentMethod::DebitCard,
        PaymentMethod::PayPal,
        PaymentMethod::BankTransfer,
        PaymentMethod::ApplePay,
        PaymentMethod::GooglePay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::CreditCard => "CREDIT_CARD",
            PaymentMethod::DebitCard => "DEBIT_CARD",
            PaymentMethod::PayPal => "PAYPAL",
            PaymentMethod::BankTransfer => "BANK_TRANSFER",
            PaymentMethod::ApplePay => "APPLE_PAY",
            PaymentMethod::GooglePay => "GOOGLE_PAY",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_");
        PaymentMethod::ALL
            .into_iter()
            .find(|method| method.as_str().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| SagaError::ValidationError(format!("unknown payment method '{}'", s)))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Refunded)
        )
    }

    /// Completed is an outcome but not terminal: it can still be refunded.
    pub fn is_terminal(self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Refunded)
    }

    /// Whether processing has produced an outcome.
    pub fn is_settled(self) -> bool {
        !matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a payment ended up `Failed`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    Declined,
    TimedOut,
    OrderCancelled,
}

/// A payment derived from an order. `order_id` is a lookup key only.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub amount: Amount,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_event: Option<EventKey>,
}

impl Payment {
    pub fn new(
        order_id: OrderId,
        customer_id: CustomerId,
        amount: Amount,
        method: PaymentMethod,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            order_id,
            customer_id,
            amount,
            method,
            status: PaymentStatus::Pending,
            failure_reason: None,
            created_at: Utc::now(),
            processed_at: None,
            pending_event: None,
        }
    }

    fn transition_to(&mut self, next: PaymentStatus) -> Result<(), SagaError> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                entity: "Payment",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if matches!(next, PaymentStatus::Completed | PaymentStatus::Failed)
            && self.processed_at.is_none()
        {
            self.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn start_processing(&mut self) -> Result<(), SagaError> {
        self.transition_to(PaymentStatus::Processing)
    }

    pub fn complete(&mut self) -> Result<(), SagaError> {
        self.transition_to(PaymentStatus::Completed)
    }

    pub fn fail(&mut self, reason: FailureReason) -> Result<(), SagaError> {
        self.transition_to(PaymentStatus::Failed)?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    /// Reverses a completed payment. Only `Completed` payments qualify.
    pub fn refund(&mut self) -> Result<(), SagaError> {
        if self.status != PaymentStatus::Completed {
            return Err(SagaError::InvalidState(format!(
                "payment {} cannot be refunded, current status: {}",
                self.id, self.status
            )));
        }
        self.transition_to(PaymentStatus::Refunded)
    }

    pub fn snapshot(&self) -> PaymentSnapshot {
        PaymentSnapshot {
            id: self.id,
            order_id: self.order_id,
            customer_id: self.customer_id.clone(),
            amount: self.amount,
            method: self.method,
            status: self.status,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            processed_at: self.processed_at,
        }
    }
}

/// Payload of the `payment.*` events.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSnapshot {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub amount: Amount,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_payment() -> Payment {
        Payment::new(
            OrderId::new(),
            CustomerId::new("C1").unwrap(),
            Amount::new(dec!(49.99)).unwrap(),
            PaymentMethod::CreditCard,
        )
    }

    #[test]
    fn test_payment_happy_path() {
        let mut payment = new_payment();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.processed_at.is_none());

        payment.start_processing().unwrap();
        assert_eq!(payment.status, PaymentStatus::Processing);
        assert!(payment.processed_at.is_none());

        payment.complete().unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment.processed_at.is_some());
    }

    #[test]
    fn test_refund_keeps_processed_at() {
        let mut payment = new_payment();
        payment.start_processing().unwrap();
        payment.complete().unwrap();
        let processed_at = payment.processed_at;

        payment.refund().unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(payment.processed_at, processed_at);
    }

    #[test]
    fn test_refund_requires_completed() {
        let mut payment = new_payment();
        assert!(matches!(payment.refund(), Err(SagaError::InvalidState(_))));

        payment.start_processing().unwrap();
        payment.fail(FailureReason::Declined).unwrap();
        assert!(matches!(payment.refund(), Err(SagaError::InvalidState(_))));
        assert_eq!(payment.status, PaymentStatus::Failed);
    }

    #[test]
    fn test_failed_and_refunded_are_terminal() {
        use PaymentStatus::*;
        for next in [Pending, Processing, Completed, Failed, Refunded] {
            assert!(!Failed.can_transition_to(next));
            assert!(!Refunded.can_transition_to(next));
        }
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_fail_records_reason() {
        let mut payment = new_payment();
        payment.start_processing().unwrap();
        payment.fail(FailureReason::OrderCancelled).unwrap();
        assert_eq!(payment.failure_reason, Some(FailureReason::OrderCancelled));
        assert!(payment.processed_at.is_some());

        let snapshot = serde_json::to_value(payment.snapshot()).unwrap();
        assert_eq!(snapshot["status"], "FAILED");
        assert_eq!(snapshot["failureReason"], "ORDER_CANCELLED");
        assert_eq!(snapshot["method"], "CREDIT_CARD");
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!(
            "paypal".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::PayPal
        );
        assert_eq!(
            "apple-pay".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::ApplePay
        );
        assert!("cash".parse::<PaymentMethod>().is_err());
    }
}
