//! CSV edge of the binary: orders in, payments out.

pub mod order_reader;
pub mod payment_writer;
