pub mod in_memory;
pub mod processing_policy;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
