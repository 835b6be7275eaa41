use crate::domain::payment::Payment;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct PaymentRow<'a> {
    payment: String,
    order: String,
    customer: &'a str,
    amount: String,
    method: &'static str,
    status: &'static str,
}

impl<'a> From<&'a Payment> for PaymentRow<'a> {
    fn from(payment: &'a Payment) -> Self {
        Self {
            payment: payment.id.to_string(),
            order: payment.order_id.to_string(),
            customer: payment.customer_id.as_str(),
            amount: payment.amount.to_string(),
            method: payment.method.as_str(),
            status: payment.status.as_str(),
        }
    }
}

/// Writes payments as CSV with a
/// `payment,order,customer,amount,method,status` header.
pub struct PaymentWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> PaymentWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// Writes the rows ordered by customer, then order id, so output is stable.
    pub fn write_payments(&mut self, mut payments: Vec<Payment>) -> Result<()> {
        payments.sort_by(|a, b| {
            a.customer_id
                .as_str()
                .cmp(b.customer_id.as_str())
                .then(a.order_id.cmp(&b.order_id))
        });
        for payment in &payments {
            self.writer.serialize(PaymentRow::from(payment))?;
        }
        if payments.is_empty() {
            self.writer.write_record([
                "payment", "order", "customer", "amount", "method", "status",
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
