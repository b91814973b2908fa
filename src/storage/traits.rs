//! Abstract storage traits for the entity manager.
//!
//! `PartitionedStore` is the contract the resolution service, tracker, and
//! scanner program against. Any partition-aware key-value system can back it:
//! a consistent-hash ring, a gossip cache, or a sharded relational table.
//! Routing is supplied by the caller on write; implementations remember where
//! a key was placed and never move it.

use thiserror::Error;

use crate::key::{PartitionId, RoutingKey};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A lock guarding partition state was poisoned by a panicking writer.
    #[error("poisoned lock: {0}")]
    Poisoned(&'static str),

    /// The partition is temporarily unavailable (migration, node loss).
    #[error("partition unavailable: {0}")]
    Unavailable(String),

    /// The requested partition does not exist.
    #[error("partition {partition} out of range (partition count {count})")]
    PartitionOutOfRange {
        /// Requested partition.
        partition: PartitionId,
        /// Configured partition count.
        count: usize,
    },

    /// Backend error.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Returns true if retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Partition-aware key-value storage with per-partition iteration.
///
/// # Consistency
/// - Single-key operations are atomic with respect to each other.
/// - Multi-key reads (`projection`, `local_keys`) are not snapshots; they may
///   observe concurrent writes partially.
pub trait PartitionedStore<K, V>: Send + Sync {
    /// Number of partitions the store routes into.
    fn partition_count(&self) -> usize;

    /// Partition a routing hint maps to.
    fn partition_of(&self, hint: RoutingKey) -> PartitionId {
        hint.partition(self.partition_count())
    }

    /// Insert or replace a value. Returns the previous value.
    ///
    /// `hint` decides placement only when the key is new.
    fn upsert(&self, hint: RoutingKey, key: K, value: V) -> Result<Option<V>, StorageError>;

    /// Atomically compute the new value from the current one and store it.
    ///
    /// `update` runs while the key's partition is write-locked, so it must not
    /// call back into the store. Returns the stored value.
    fn upsert_with(
        &self,
        hint: RoutingKey,
        key: K,
        update: &mut dyn FnMut(Option<&V>) -> V,
    ) -> Result<V, StorageError>;

    /// Atomically replace the value of an existing key.
    ///
    /// Never creates the key. Returns the stored value, or `None` if the key
    /// is missing. The same no-reentrancy rule as `upsert_with` applies.
    fn compute_if_present(
        &self,
        key: &K,
        update: &mut dyn FnMut(&V) -> V,
    ) -> Result<Option<V>, StorageError>;

    /// Get a value by key, wherever it was placed.
    fn get(&self, key: &K) -> Result<Option<V>, StorageError>;

    /// Remove a key. Returns the removed value.
    fn remove(&self, key: &K) -> Result<Option<V>, StorageError>;

    /// Remove a key only if `predicate` holds for its current value.
    ///
    /// Returns the removed value, or `None` if the key is missing or the
    /// predicate rejected it.
    fn remove_if(&self, key: &K, predicate: &dyn Fn(&V) -> bool) -> Result<Option<V>, StorageError>;

    /// Keys currently stored in one partition.
    fn local_keys(&self, partition: PartitionId) -> Result<Vec<K>, StorageError>;

    /// Key/value pairs currently stored in one partition.
    fn entries(&self, partition: PartitionId) -> Result<Vec<(K, V)>, StorageError>;

    /// Values for exactly `keys` that satisfy `predicate`. Missing keys are skipped.
    fn projection(&self, keys: &[K], predicate: &dyn Fn(&V) -> bool) -> Result<Vec<V>, StorageError>;

    /// Total number of stored keys.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true if the store holds no keys.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure the trait is object-safe
    fn _assert_partitioned_store_object_safe(_: &dyn PartitionedStore<u64, String>) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Poisoned("staging.get");
        assert!(err.to_string().contains("staging.get"));

        let err = StorageError::PartitionOutOfRange {
            partition: PartitionId(9),
            count: 4,
        };
        assert!(err.to_string().contains("p9"));
        assert!(!err.is_transient());

        assert!(StorageError::Unavailable("migrating".to_string()).is_transient());
    }
}
