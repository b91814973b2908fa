//! Per-ingestion side tables: staged relations and the ingestion ledger.
//!
//! Both are routed by ingestion id, so everything one ingestion discovered sits
//! in a single partition and a partition-local scan sees all of it at once.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::{CacheId, IngestionId, TenantId};
use crate::key::{ingestion_hint, ingestion_routing, relation_hint, DocumentKey, IngestionKey, PartitionId, RelationKey};
use crate::storage::{InMemoryPartitionedStore, PartitionedStore, StorageError};

/// A labeled relation between two staged entities, waiting for both ends to
/// become indexable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedRelation {
    pub tenant_id: TenantId,
    pub from: CacheId,
    pub to: CacheId,
    pub label: String,
}

/// Staged relations keyed by [`RelationKey`].
#[derive(Clone)]
pub struct RelationStore {
    relations: Arc<dyn PartitionedStore<RelationKey, StagedRelation>>,
}

impl std::fmt::Debug for RelationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationStore").finish_non_exhaustive()
    }
}

impl RelationStore {
    #[must_use]
    pub fn new(relations: Arc<dyn PartitionedStore<RelationKey, StagedRelation>>) -> Self {
        Self { relations }
    }

    #[must_use]
    pub fn in_memory(partition_count: usize) -> Self {
        Self::new(Arc::new(InMemoryPartitionedStore::new("relations", partition_count)))
    }

    /// Stage a relation. Restaging the same key overwrites it.
    pub fn stage(&self, key: RelationKey, relation: StagedRelation) -> Result<(), StorageError> {
        let hint = relation_hint(&key);
        self.relations.upsert(hint, key, relation)?;
        Ok(())
    }

    /// Relations stored in one partition.
    pub fn local(&self, partition: PartitionId) -> Result<Vec<(RelationKey, StagedRelation)>, StorageError> {
        self.relations.entries(partition)
    }

    /// Remove a relation after it has been committed.
    pub fn remove(&self, key: &RelationKey) -> Result<Option<StagedRelation>, StorageError> {
        self.relations.remove(key)
    }

    /// Cache ids among `candidates` that are an endpoint of a staged relation.
    pub fn referenced(&self, candidates: &HashSet<CacheId>) -> Result<HashSet<CacheId>, StorageError> {
        let mut out = HashSet::new();
        if candidates.is_empty() {
            return Ok(out);
        }
        for p in 0..self.relations.partition_count() {
            for (_, relation) in self.relations.entries(PartitionId(p))? {
                for end in [relation.from, relation.to] {
                    if candidates.contains(&end) {
                        out.insert(end);
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        self.relations.len()
    }
}

/// What one ingestion discovered about one entity: the documents, within
/// that ingestion, that still wait on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionEntry {
    pub cache_id: CacheId,
    pub documents: BTreeSet<DocumentKey>,
}

/// Ledger of (entity, ingestion) pairs, each carrying the documents of that
/// ingestion that mention the entity.
///
/// A document is released from an entry when it commits, and the entry goes
/// once its last document is released. While any entry references a cache
/// id, its staging record is still needed.
#[derive(Clone)]
pub struct IngestionLedger {
    entries: Arc<dyn PartitionedStore<IngestionKey, IngestionEntry>>,
}

impl std::fmt::Debug for IngestionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionLedger").finish_non_exhaustive()
    }
}

impl IngestionLedger {
    #[must_use]
    pub fn new(entries: Arc<dyn PartitionedStore<IngestionKey, IngestionEntry>>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn in_memory(partition_count: usize) -> Self {
        Self::new(Arc::new(InMemoryPartitionedStore::new("ingestions", partition_count)))
    }

    /// Record that `key.ingestion_id` discovered `key.entity_id` while
    /// processing `document`. Idempotent.
    pub fn record(&self, key: IngestionKey, document: &DocumentKey) -> Result<(), StorageError> {
        let hint = ingestion_hint(&key);
        let cache_id = key.entity_id;
        self.entries.upsert_with(hint, key, &mut |current| {
            let mut documents = current.map(|e| e.documents.clone()).unwrap_or_default();
            documents.insert(document.clone());
            IngestionEntry { cache_id, documents }
        })?;
        Ok(())
    }

    /// Release `document` from every entry of one ingestion. Returns the keys
    /// whose last document this was; other documents of the same ingestion
    /// keep their entries.
    ///
    /// Only the ingestion's own partition is visited.
    pub fn release(&self, ingestion_id: &IngestionId, document: &DocumentKey) -> Result<Vec<IngestionKey>, StorageError> {
        let partition = self.entries.partition_of(ingestion_routing(ingestion_id));
        let mut released = Vec::new();
        for key in self.entries.local_keys(partition)? {
            if &key.ingestion_id != ingestion_id {
                continue;
            }
            let remaining = self.entries.compute_if_present(&key, &mut |entry| {
                let mut next = entry.clone();
                next.documents.remove(document);
                next
            })?;
            if remaining.is_some_and(|entry| entry.documents.is_empty())
                && self.entries.remove_if(&key, &|entry| entry.documents.is_empty())?.is_some()
            {
                released.push(key);
            }
        }
        Ok(released)
    }

    /// Cache ids still referenced by at least one entry, restricted to `candidates`.
    pub fn referenced(&self, candidates: &HashSet<CacheId>) -> Result<HashSet<CacheId>, StorageError> {
        let mut out = HashSet::new();
        if candidates.is_empty() {
            return Ok(out);
        }
        for p in 0..self.entries.partition_count() {
            for (key, entry) in self.entries.entries(PartitionId(p))? {
                if !entry.documents.is_empty() && candidates.contains(&key.entity_id) {
                    out.insert(key.entity_id);
                }
            }
        }
        Ok(out)
    }

    /// Returns true if any entry still references `cache_id`.
    pub fn references(&self, cache_id: CacheId) -> Result<bool, StorageError> {
        Ok(!self.referenced(&HashSet::from([cache_id]))?.is_empty())
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        self.entries.len()
    }
}
