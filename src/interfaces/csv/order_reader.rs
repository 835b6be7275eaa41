use crate::domain::order::NewOrder;
use crate::error::{Result, SagaError};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize)]
struct OrderRow {
    customer: String,
    amount: Decimal,
}

/// Reads order requests from a CSV source with a `customer, amount` header.
///
/// Whitespace around fields is trimmed and rows may carry extra columns.
/// Amounts are only parsed here; their sign is checked when the order is created.
pub struct OrderReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> OrderReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily yields one `NewOrder` per row, or the error that row produced.
    pub fn orders(self) -> impl Iterator<Item = Result<NewOrder>> {
        self.reader.into_deserialize::<OrderRow>().map(|row| {
            row.map(|row| NewOrder::new(row.customer, row.amount))
                .map_err(SagaError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reader_valid_stream() {
        let data = "customer, amount\nC1, 49.99\n  C2 ,10";
        let orders: Vec<Result<NewOrder>> = OrderReader::new(data.as_bytes()).orders().collect();

        assert_eq!(orders.len(), 2);
        let first = orders[0].as_ref().unwrap();
        assert_eq!(first.customer_id, "C1");
        assert_eq!(first.total_amount, dec!(49.99));
        assert_eq!(orders[1].as_ref().unwrap().customer_id, "C2");
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = "customer, amount\nC1, lots\nC2, 5";
        let orders: Vec<Result<NewOrder>> = OrderReader::new(data.as_bytes()).orders().collect();

        assert!(matches!(orders[0], Err(SagaError::CsvError(_))));
        assert!(orders[1].is_ok());
    }

    #[test]
    fn test_reader_keeps_non_positive_amounts_for_validation() {
        let data = "customer, amount\nC1, -3";
        let orders: Vec<Result<NewOrder>> = OrderReader::new(data.as_bytes()).orders().collect();
        assert_eq!(orders[0].as_ref().unwrap().total_amount, dec!(-3));
    }
}
