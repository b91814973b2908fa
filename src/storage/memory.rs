//! In-memory storage backend.
//!
//! Thread-safe in-memory implementation of [`PartitionedStore`]: one `RwLock`
//! per partition plus a striped placement index recording which partition
//! each key was routed to on first write. Intended for embedded usage, tests,
//! and as a reference implementation.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::{RwLock, RwLockReadGuard};

use crate::key::{PartitionId, RoutingKey};
use crate::storage::traits::{PartitionedStore, StorageError};

/// Default partition count, matching the usual distributed-map default.
pub const DEFAULT_PARTITION_COUNT: usize = 271;

/// Thread-safe in-memory partitioned store.
///
/// The placement index is split into as many stripes as there are
/// partitions, picked by key hash. An operation holds at most one stripe and
/// one partition, always in that order, so work on one key never waits on an
/// unrelated key's stripe.
#[derive(Debug)]
pub struct InMemoryPartitionedStore<K, V> {
    name: &'static str,
    partitions: Vec<RwLock<HashMap<K, V>>>,
    placement: Vec<RwLock<HashMap<K, PartitionId>>>,
    stripe_hasher: RandomState,
}

impl<K, V> InMemoryPartitionedStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a store with `partition_count` partitions (clamped to at least one).
    ///
    /// `name` only labels lock errors.
    #[must_use]
    pub fn new(name: &'static str, partition_count: usize) -> Self {
        let partition_count = partition_count.max(1);
        let partitions = (0..partition_count).map(|_| RwLock::new(HashMap::new())).collect();
        let placement = (0..partition_count).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            name,
            partitions,
            placement,
            stripe_hasher: RandomState::new(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn stripe(&self, key: &K) -> &RwLock<HashMap<K, PartitionId>> {
        let index = self.stripe_hasher.hash_one(key) % self.placement.len() as u64;
        &self.placement[index as usize]
    }

    fn lock_err(&self) -> StorageError {
        StorageError::Poisoned(self.name)
    }

    /// Returns the key's partition, placing it by `hint` if it is new.
    ///
    /// The returned stripe guard keeps removals of this key out until the
    /// caller's shard write is done.
    fn placed(
        &self,
        hint: RoutingKey,
        key: &K,
    ) -> Result<(RwLockReadGuard<'_, HashMap<K, PartitionId>>, PartitionId), StorageError> {
        let stripe = self.stripe(key);
        loop {
            let placement = stripe.read().map_err(|_| self.lock_err())?;
            if let Some(partition) = placement.get(key).copied() {
                return Ok((placement, partition));
            }
            drop(placement);

            // Another writer may win the race; `or_insert_with` keeps whichever
            // partition was recorded first.
            let mut placement = stripe.write().map_err(|_| self.lock_err())?;
            placement
                .entry(key.clone())
                .or_insert_with(|| hint.partition(self.partitions.len()));
        }
    }

    fn shard(&self, partition: PartitionId) -> Result<&RwLock<HashMap<K, V>>, StorageError> {
        self.partitions
            .get(partition.0)
            .ok_or(StorageError::PartitionOutOfRange {
                partition,
                count: self.partitions.len(),
            })
    }
}

impl<K, V> PartitionedStore<K, V> for InMemoryPartitionedStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn upsert(&self, hint: RoutingKey, key: K, value: V) -> Result<Option<V>, StorageError> {
        let (_placement, partition) = self.placed(hint, &key)?;
        let mut shard = self.shard(partition)?.write().map_err(|_| self.lock_err())?;
        Ok(shard.insert(key, value))
    }

    fn upsert_with(
        &self,
        hint: RoutingKey,
        key: K,
        update: &mut dyn FnMut(Option<&V>) -> V,
    ) -> Result<V, StorageError> {
        let (_placement, partition) = self.placed(hint, &key)?;
        let mut shard = self.shard(partition)?.write().map_err(|_| self.lock_err())?;
        let next = update(shard.get(&key));
        shard.insert(key, next.clone());
        Ok(next)
    }

    fn compute_if_present(
        &self,
        key: &K,
        update: &mut dyn FnMut(&V) -> V,
    ) -> Result<Option<V>, StorageError> {
        let placement = self.stripe(key).read().map_err(|_| self.lock_err())?;
        let Some(partition) = placement.get(key).copied() else {
            return Ok(None);
        };
        let mut shard = self.shard(partition)?.write().map_err(|_| self.lock_err())?;
        let Some(slot) = shard.get_mut(key) else {
            return Ok(None);
        };
        let next = update(slot);
        *slot = next.clone();
        Ok(Some(next))
    }

    fn get(&self, key: &K) -> Result<Option<V>, StorageError> {
        let placement = self.stripe(key).read().map_err(|_| self.lock_err())?;
        let Some(partition) = placement.get(key).copied() else {
            return Ok(None);
        };
        let shard = self.shard(partition)?.read().map_err(|_| self.lock_err())?;
        Ok(shard.get(key).cloned())
    }

    fn remove(&self, key: &K) -> Result<Option<V>, StorageError> {
        self.remove_if(key, &|_| true)
    }

    fn remove_if(&self, key: &K, predicate: &dyn Fn(&V) -> bool) -> Result<Option<V>, StorageError> {
        let mut placement = self.stripe(key).write().map_err(|_| self.lock_err())?;
        let Some(partition) = placement.get(key).copied() else {
            return Ok(None);
        };
        let mut shard = self.shard(partition)?.write().map_err(|_| self.lock_err())?;

        match shard.get(key) {
            Some(current) if predicate(current) => {
                placement.remove(key);
                Ok(shard.remove(key))
            }
            Some(_) => Ok(None),
            None => {
                // Placed but never written (writer failed between steps).
                placement.remove(key);
                Ok(None)
            }
        }
    }

    fn local_keys(&self, partition: PartitionId) -> Result<Vec<K>, StorageError> {
        let shard = self.shard(partition)?.read().map_err(|_| self.lock_err())?;
        Ok(shard.keys().cloned().collect())
    }

    fn entries(&self, partition: PartitionId) -> Result<Vec<(K, V)>, StorageError> {
        let shard = self.shard(partition)?.read().map_err(|_| self.lock_err())?;
        Ok(shard.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn projection(&self, keys: &[K], predicate: &dyn Fn(&V) -> bool) -> Result<Vec<V>, StorageError> {
        // Group by partition so each shard lock is taken once. Stripes are
        // read one key at a time; a key removed in between is just skipped.
        let mut by_partition: HashMap<PartitionId, Vec<&K>> = HashMap::new();
        for key in keys {
            let placed = self.stripe(key).read().map_err(|_| self.lock_err())?.get(key).copied();
            if let Some(partition) = placed {
                by_partition.entry(partition).or_default().push(key);
            }
        }

        let mut out = Vec::with_capacity(keys.len());
        for (partition, group) in by_partition {
            let shard = self.shard(partition)?.read().map_err(|_| self.lock_err())?;
            out.extend(
                group
                    .into_iter()
                    .filter_map(|k| shard.get(k))
                    .filter(|v| predicate(*v))
                    .cloned(),
            );
        }
        Ok(out)
    }

    fn len(&self) -> Result<usize, StorageError> {
        let mut total = 0;
        for shard in &self.partitions {
            total += shard.read().map_err(|_| self.lock_err())?.len();
        }
        Ok(total)
    }
}
