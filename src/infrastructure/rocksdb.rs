use crate::domain::event::EventKey;
use crate::domain::ids::{OrderId, PaymentId};
use crate::domain::order::{Order, OrderStatus};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::ports::{
    IdempotencyGuard, OrderField, OrderStore, PaymentField, PaymentStore,
};
use crate::error::{Result, SagaError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

/// Column Family for order records, keyed by order id bytes.
pub const CF_ORDERS: &str = "orders";
/// Column Family for payment records, keyed by payment id bytes.
pub const CF_PAYMENTS: &str = "payments";
/// Column Family for idempotency claims, keyed by scope key.
pub const CF_CLAIMS: &str = "claims";

/// A persistent store implementation using RocksDB.
///
/// Orders, payments and idempotency claims live in separate Column Families.
/// Records are stored as JSON. Secondary lookups scan the whole family.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
/// Writes, claims and marker clears are serialized by a lock held by this
/// handle and its clones, so read-then-write steps are linearizable within
/// one process only.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating
    /// any missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_ORDERS, CF_PAYMENTS, CF_CLAIMS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::default(),
        })
    }

    fn put<T: Serialize>(&self, family: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.family(family)?;
        let bytes = serde_json::to_vec(value)?;
        let _held = self.write_lock.lock();
        self.db.put_cf(cf, key, bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, family: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.family(family)?;
        match self.db.get_pinned_cf(cf, key)? {
            Some(bytes) => decode(family, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, family: &str) -> Result<Vec<T>> {
        let cf = self.family(family)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            records.push(decode(family, &value)?);
        }
        Ok(records)
    }

    /// Clears the marker on the record under `key` while `still_pending`
    /// holds for it. The read and the write happen under the write lock.
    fn clear_marker<T, F>(&self, family: &str, key: &[u8], still_pending: F) -> Result<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let cf = self.family(family)?;
        let _held = self.write_lock.lock();
        let Some(bytes) = self.db.get_pinned_cf(cf, key)? else {
            return Ok(false);
        };
        let mut record: T = decode(family, &bytes)?;
        if !still_pending(&mut record) {
            return Ok(false);
        }
        self.db.put_cf(cf, key, serde_json::to_vec(&record)?)?;
        Ok(true)
    }

    fn family(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SagaError::StorageError(format!("{} column family not found", name)))
    }
}

/// A stored record that no longer parses is a storage fault, not a bad message.
fn decode<T: DeserializeOwned>(family: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| SagaError::StorageError(format!("corrupt record in {}: {}", family, e)))
}

#[async_trait]
impl OrderStore for RocksDBStore {
    async fn save(&self, order: Order) -> Result<()> {
        self.put(CF_ORDERS, order.id.as_bytes(), &order)
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        self.get(CF_ORDERS, id.as_bytes())
    }

    async fn find_by_field(&self, field: OrderField) -> Result<Vec<Order>> {
        Ok(self
            .scan::<Order>(CF_ORDERS)?
            .into_iter()
            .filter(|order| field.matches(order))
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<Order>> {
        self.scan(CF_ORDERS)
    }

    async fn clear_pending_event(
        &self,
        id: OrderId,
        event: EventKey,
        status: OrderStatus,
    ) -> Result<bool> {
        self.clear_marker(CF_ORDERS, id.as_bytes(), |order: &mut Order| {
            if order.pending_event != Some(event) || order.status != status {
                return false;
            }
            order.pending_event = None;
            true
        })
    }
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn save(&self, payment: Payment) -> Result<()> {
        self.put(CF_PAYMENTS, payment.id.as_bytes(), &payment)
    }

    async fn find_by_id(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.get(CF_PAYMENTS, id.as_bytes())
    }

    async fn find_by_field(&self, field: PaymentField) -> Result<Vec<Payment>> {
        Ok(self
            .scan::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .filter(|payment| field.matches(payment))
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<Payment>> {
        self.scan(CF_PAYMENTS)
    }

    async fn clear_pending_event(
        &self,
        id: PaymentId,
        event: EventKey,
        status: PaymentStatus,
    ) -> Result<bool> {
        self.clear_marker(CF_PAYMENTS, id.as_bytes(), |payment: &mut Payment| {
            if payment.pending_event != Some(event) || payment.status != status {
                return false;
            }
            payment.pending_event = None;
            true
        })
    }
}

#[async_trait]
impl IdempotencyGuard for RocksDBStore {
    async fn try_claim(&self, scope_key: &str) -> Result<bool> {
        let cf = self.family(CF_CLAIMS)?;
        let _held = self.write_lock.lock();
        if self.db.get_pinned_cf(cf, scope_key.as_bytes())?.is_some() {
            return Ok(false);
        }
        let claimed_at = chrono::Utc::now().to_rfc3339();
        self.db.put_cf(cf, scope_key.as_bytes(), claimed_at.as_bytes())?;
        Ok(true)
    }

    async fn release(&self, scope_key: &str) -> Result<()> {
        let cf = self.family(CF_CLAIMS)?;
        let _held = self.write_lock.lock();
        self.db.delete_cf(cf, scope_key.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::CustomerId;
    use crate::domain::money::Amount;
    use crate::domain::order::NewOrder;
    use crate::domain::payment::PaymentMethod;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");

        assert!(store.db.cf_handle(CF_ORDERS).is_some());
        assert!(store.db.cf_handle(CF_PAYMENTS).is_some());
        assert!(store.db.cf_handle(CF_CLAIMS).is_some());
    }

    #[tokio::test]
    async fn test_rocksdb_order_store() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let mut order = Order::create(NewOrder::new("C1", dec!(100.0))).unwrap();
        order.transition_to(OrderStatus::Confirmed).unwrap();
        OrderStore::save(&store, order.clone()).await.unwrap();

        let retrieved = OrderStore::find_by_id(&store, order.id).await.unwrap();
        assert_eq!(retrieved, Some(order.clone()));
        let confirmed = OrderStore::find_by_field(&store, OrderField::Status(OrderStatus::Confirmed))
            .await
            .unwrap();
        assert_eq!(confirmed, vec![order]);
        assert!(
            OrderStore::find_by_id(&store, OrderId::new())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_rocksdb_payment_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let payment = Payment::new(
            OrderId::new(),
            CustomerId::new("C1").unwrap(),
            Amount::new(dec!(7.25)).unwrap(),
            PaymentMethod::BankTransfer,
        );
        {
            let store = RocksDBStore::open(dir.path()).unwrap();
            PaymentStore::save(&store, payment.clone()).await.unwrap();
        }

        let store = RocksDBStore::open(dir.path()).unwrap();
        let by_order = PaymentStore::find_by_field(&store, PaymentField::OrderId(payment.order_id))
            .await
            .unwrap();
        assert_eq!(by_order, vec![payment.clone()]);
        assert_eq!(PaymentStore::find_all(&store).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rocksdb_claims() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        assert!(store.try_claim("o-1:order.created").await.unwrap());
        assert!(!store.try_claim("o-1:order.created").await.unwrap());
        assert!(store.try_claim("o-2:order.created").await.unwrap());

        store.release("o-1:order.created").await.unwrap();
        assert!(store.try_claim("o-1:order.created").await.unwrap());
    }

    #[tokio::test]
    async fn test_rocksdb_clear_pending_event() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let mut payment = Payment::new(
            OrderId::new(),
            CustomerId::new("C1").unwrap(),
            Amount::new(dec!(4)).unwrap(),
            PaymentMethod::CreditCard,
        );
        payment.start_processing().unwrap();
        payment.complete().unwrap();
        payment.refund().unwrap();
        payment.pending_event = Some(EventKey::PaymentRefunded);
        PaymentStore::save(&store, payment.clone()).await.unwrap();

        let stale = PaymentStore::clear_pending_event(
            &store,
            payment.id,
            EventKey::PaymentCompleted,
            PaymentStatus::Completed,
        )
        .await
        .unwrap();
        assert!(!stale);

        let current = PaymentStore::clear_pending_event(
            &store,
            payment.id,
            EventKey::PaymentRefunded,
            PaymentStatus::Refunded,
        )
        .await
        .unwrap();
        assert!(current);
        let stored = PaymentStore::find_by_id(&store, payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Refunded);
        assert!(stored.pending_event.is_none());
    }

    #[tokio::test]
    async fn test_rocksdb_corrupt_record_is_a_storage_error() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let id = PaymentId::new();
        let cf = store.family(CF_PAYMENTS).unwrap();
        store.db.put_cf(cf, id.as_bytes(), b"{not json").unwrap();

        let by_id = PaymentStore::find_by_id(&store, id).await.unwrap_err();
        assert!(matches!(by_id, SagaError::StorageError(_)));
        assert!(by_id.is_retryable());
        assert!(!by_id.is_poison());

        let scanned = PaymentStore::find_all(&store).await.unwrap_err();
        assert!(matches!(scanned, SagaError::StorageError(_)));
    }
}
