//! Domain model: entities, state machines, events and the ports the
//! application layer talks to.

pub mod dead_letter;
pub mod event;
pub mod ids;
pub mod money;
pub mod order;
pub mod payment;
pub mod ports;
