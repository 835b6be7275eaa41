//! Application layer orchestrating the order/payment saga.
//!
//! The order side ([`order_lifecycle`]) and the payment side
//! ([`payment_processor`]) never call each other. They meet only on the event
//! bus, through the [`consumer`] worker pool. [`runtime`] wires them together.

pub mod consumer;
pub mod order_lifecycle;
pub mod outcome_listener;
pub mod payment_processor;
pub mod reconciler;
pub mod runtime;
