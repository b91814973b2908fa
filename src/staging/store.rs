//! Staging entity store.
//!
//! Wraps a [`PartitionedStore`] keyed by [`EntityKey`]. Creation is
//! create-if-absent and id assignment is append-only, so racing writers for
//! the same cache id converge instead of clobbering each other.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::entity::{GraphId, PersistentId};
use crate::key::{entity_hint, EntityKey};
use crate::storage::{InMemoryPartitionedStore, PartitionedStore, StorageError};

use super::entity::StagingEntity;

/// Outcome of assigning an id to a staging record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// The id was empty and is now set.
    Assigned(StagingEntity),
    /// The same id was already set; nothing changed.
    Unchanged(StagingEntity),
    /// A different id was already set and was kept.
    ///
    /// This is the stale-race outcome: two creations of one cache id obtained
    /// different ids from the outside world. The first assignment wins.
    Kept(StagingEntity),
    /// No record exists under the key.
    Missing,
}

impl Assignment {
    /// The record after the assignment, if one exists.
    #[must_use]
    pub fn entity(&self) -> Option<&StagingEntity> {
        match self {
            Self::Assigned(e) | Self::Unchanged(e) | Self::Kept(e) => Some(e),
            Self::Missing => None,
        }
    }
}

/// Provisional entity records keyed by content-addressed cache id.
#[derive(Clone)]
pub struct StagingStore {
    entities: Arc<dyn PartitionedStore<EntityKey, StagingEntity>>,
}

impl std::fmt::Debug for StagingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingStore")
            .field("partitions", &self.entities.partition_count())
            .finish_non_exhaustive()
    }
}

impl StagingStore {
    /// Wrap an existing partitioned store.
    #[must_use]
    pub fn new(entities: Arc<dyn PartitionedStore<EntityKey, StagingEntity>>) -> Self {
        Self { entities }
    }

    /// In-memory staging store.
    #[must_use]
    pub fn in_memory(partition_count: usize) -> Self {
        Self::new(Arc::new(InMemoryPartitionedStore::new("staging", partition_count)))
    }

    /// Get a record by key.
    pub fn get(&self, key: &EntityKey) -> Result<Option<StagingEntity>, StorageError> {
        self.entities.get(key)
    }

    /// Insert `candidate` unless a record already exists under its key.
    ///
    /// Returns the stored record and whether `candidate` was the one stored.
    pub fn insert_if_absent(
        &self,
        candidate: StagingEntity,
    ) -> Result<(StagingEntity, bool), StorageError> {
        let hint = entity_hint(&candidate.ingestion_id);
        let key = candidate.key();
        let tmp_id = candidate.tmp_id;

        let stored = self.entities.upsert_with(hint, key, &mut |current| {
            current.unwrap_or(&candidate).clone()
        })?;

        let created = stored.tmp_id == tmp_id;
        if !created {
            debug!(cache_id = ?key.entity_id, "staging record already present; adopting existing");
        }
        Ok((stored, created))
    }

    /// Set the persistent id unless one is already present.
    pub fn assign_persistent_id(
        &self,
        key: &EntityKey,
        persistent_id: PersistentId,
    ) -> Result<Assignment, StorageError> {
        self.assign(key, "persistent_id", |entity| {
            assign_slot(&mut entity.persistent_id, persistent_id)
        })
    }

    /// Set the graph id unless one is already present.
    pub fn assign_graph_id(&self, key: &EntityKey, graph_id: GraphId) -> Result<Assignment, StorageError> {
        self.assign(key, "graph_id", |entity| assign_slot(&mut entity.graph_id, graph_id))
    }

    fn assign(
        &self,
        key: &EntityKey,
        field: &'static str,
        mut apply: impl FnMut(&mut StagingEntity) -> SlotOutcome,
    ) -> Result<Assignment, StorageError> {
        let mut outcome = SlotOutcome::Unchanged;
        let stored = self.entities.compute_if_present(key, &mut |current| {
            let mut next = current.clone();
            outcome = apply(&mut next);
            if outcome == SlotOutcome::Assigned {
                next.updated_at = Utc::now();
            }
            next
        })?;

        let Some(stored) = stored else {
            return Ok(Assignment::Missing);
        };

        Ok(match outcome {
            SlotOutcome::Assigned => Assignment::Assigned(stored),
            SlotOutcome::Unchanged => Assignment::Unchanged(stored),
            SlotOutcome::Kept => {
                debug!(cache_id = ?key.entity_id, field, "stale race: keeping first assigned id");
                Assignment::Kept(stored)
            }
        })
    }

    /// Records among `keys` that are indexable.
    pub fn indexable(&self, keys: &[EntityKey]) -> Result<Vec<StagingEntity>, StorageError> {
        self.entities.projection(keys, &StagingEntity::is_indexable)
    }

    /// Remove a record if `predicate` holds for it.
    ///
    /// The predicate runs under the record's partition lock, so a concurrent
    /// reader of the same key sees either the record or its absence, never a
    /// record the predicate has already decided to drop.
    pub fn remove_if(
        &self,
        key: &EntityKey,
        predicate: &dyn Fn(&StagingEntity) -> bool,
    ) -> Result<Option<StagingEntity>, StorageError> {
        self.entities.remove_if(key, predicate)
    }

    /// Number of staged records.
    pub fn len(&self) -> Result<usize, StorageError> {
        self.entities.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.entities.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOutcome {
    Assigned,
    Unchanged,
    Kept,
}

fn assign_slot<T: PartialEq + Copy>(slot: &mut Option<T>, value: T) -> SlotOutcome {
    match slot {
        None => {
            *slot = Some(value);
            SlotOutcome::Assigned
        }
        Some(existing) if *existing == value => SlotOutcome::Unchanged,
        Some(_) => SlotOutcome::Kept,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::entity::{EntityType, IngestionId, TenantId};

    fn alice(ingestion: &str) -> StagingEntity {
        StagingEntity::new(TenantId(1), IngestionId::new(ingestion), "Alice", EntityType::Person)
    }

    #[test]
    fn insert_if_absent_keeps_first_record() {
        let store = StagingStore::in_memory(16);
        let first = alice("i1");
        let second = alice("i2");

        let (stored, created) = store.insert_if_absent(first.clone()).unwrap();
        assert!(created);
        assert_eq!(stored.tmp_id, first.tmp_id);

        let (stored, created) = store.insert_if_absent(second).unwrap();
        assert!(!created);
        assert_eq!(stored.tmp_id, first.tmp_id);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn assignment_is_append_only() {
        let store = StagingStore::in_memory(16);
        let e = alice("i1");
        let key = e.key();
        store.insert_if_absent(e).unwrap();

        assert!(matches!(
            store.assign_persistent_id(&key, PersistentId(7)).unwrap(),
            Assignment::Assigned(_)
        ));
        assert!(matches!(
            store.assign_persistent_id(&key, PersistentId(7)).unwrap(),
            Assignment::Unchanged(_)
        ));
        let kept = store.assign_persistent_id(&key, PersistentId(8)).unwrap();
        assert!(matches!(kept, Assignment::Kept(_)));
        assert_eq!(kept.entity().unwrap().persistent_id, Some(PersistentId(7)));
    }

    #[test]
    fn assignment_on_missing_key_does_not_create() {
        let store = StagingStore::in_memory(4);
        let key = alice("i1").key();
        assert_eq!(store.assign_graph_id(&key, GraphId(1)).unwrap(), Assignment::Missing);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn indexable_projection_requires_both_ids() {
        let store = StagingStore::in_memory(8);
        let a = alice("i1");
        let b = StagingEntity::new(TenantId(1), IngestionId::new("i1"), "Bob", EntityType::Person);
        let (ka, kb) = (a.key(), b.key());
        store.insert_if_absent(a).unwrap();
        store.insert_if_absent(b).unwrap();

        store.assign_persistent_id(&ka, PersistentId(1)).unwrap();
        assert!(store.indexable(&[ka, kb]).unwrap().is_empty());

        store.assign_graph_id(&ka, GraphId(100)).unwrap();
        let ready = store.indexable(&[ka, kb]).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].cache_id, ka.entity_id);
    }
}
