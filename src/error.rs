use thiserror::Error;

#[derive(Error, Debug)]
pub enum SagaError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Transient delivery error: {0}")]
    TransientDelivery(String),
    #[error("Poison message: {0}")]
    PoisonMessage(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDBError(#[from] rocksdb::Error),
}

impl SagaError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether a failed event delivery may succeed if handled again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientDelivery(_) | Self::StorageError(_) | Self::IoError(_)
        ) || self.is_rocksdb()
    }

    /// Whether the event that produced this error can never be handled.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            Self::PoisonMessage(_) | Self::ValidationError(_) | Self::SerializationError(_)
        )
    }

    #[cfg(feature = "storage-rocksdb")]
    fn is_rocksdb(&self) -> bool {
        matches!(self, Self::RocksDBError(_))
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    fn is_rocksdb(&self) -> bool {
        false
    }
}

pub type Result<T> = std::result::Result<T, SagaError>;
