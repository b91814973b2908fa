//! Document completion tracker.
//!
//! Per-document set of the cache ids a document is waiting on. Adds are
//! idempotent; every effective change bumps a version so the scanner can tell
//! whether the set moved between its snapshot and its commit.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::{CacheId, IngestionId};
use crate::key::{document_hint, DocumentKey, PartitionId};
use crate::storage::{InMemoryPartitionedStore, PartitionedStore, StorageError};

/// The entities (and ingestions) one document is waiting on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEntitySet {
    pub cache_ids: BTreeSet<CacheId>,
    pub ingestion_ids: BTreeSet<IngestionId>,
    /// Bumped whenever either set grows. Values are never reused by one
    /// tracker, even after the entry is cleared and recreated.
    pub version: u64,
}

impl DocumentEntitySet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache_ids.is_empty()
    }
}

/// Multimap of [`DocumentKey`] to outstanding cache ids.
#[derive(Clone)]
pub struct DocumentTracker {
    documents: Arc<dyn PartitionedStore<DocumentKey, DocumentEntitySet>>,
    clock: Arc<AtomicU64>,
}

impl std::fmt::Debug for DocumentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentTracker")
            .field("partitions", &self.documents.partition_count())
            .finish_non_exhaustive()
    }
}

impl DocumentTracker {
    #[must_use]
    pub fn new(documents: Arc<dyn PartitionedStore<DocumentKey, DocumentEntitySet>>) -> Self {
        Self {
            documents,
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn in_memory(partition_count: usize) -> Self {
        Self::new(Arc::new(InMemoryPartitionedStore::new("documents", partition_count)))
    }

    /// Add `cache_id` to the document's set, creating the set if absent.
    ///
    /// Idempotent: re-adding an id already present changes nothing, not even
    /// the version.
    pub fn track(
        &self,
        document: &DocumentKey,
        cache_id: CacheId,
        ingestion_id: &IngestionId,
    ) -> Result<DocumentEntitySet, StorageError> {
        self.documents
            .upsert_with(document_hint(document), document.clone(), &mut |current| {
                let mut next = current.cloned().unwrap_or_default();
                let grew_ids = next.cache_ids.insert(cache_id);
                let grew_ingestions = next.ingestion_ids.insert(ingestion_id.clone());
                if grew_ids || grew_ingestions {
                    next.version = self.tick();
                }
                next
            })
    }

    /// Add several cache ids in one write, so a scan never sees only some of them.
    pub fn track_all(
        &self,
        document: &DocumentKey,
        cache_ids: &[CacheId],
        ingestion_id: &IngestionId,
    ) -> Result<DocumentEntitySet, StorageError> {
        self.documents
            .upsert_with(document_hint(document), document.clone(), &mut |current| {
                let mut next = current.cloned().unwrap_or_default();
                let mut grew = next.ingestion_ids.insert(ingestion_id.clone());
                for cache_id in cache_ids {
                    grew |= next.cache_ids.insert(*cache_id);
                }
                if grew {
                    next.version = self.tick();
                }
                next
            })
    }

    /// Read-only view of one document's set.
    pub fn snapshot(&self, document: &DocumentKey) -> Result<Option<DocumentEntitySet>, StorageError> {
        self.documents.get(document)
    }

    /// Remove the document's entry unconditionally.
    pub fn clear(&self, document: &DocumentKey) -> Result<bool, StorageError> {
        Ok(self.documents.remove(document)?.is_some())
    }

    /// Remove the entry only if nothing was added since `version` was read.
    pub fn clear_if_unchanged(&self, document: &DocumentKey, version: u64) -> Result<bool, StorageError> {
        Ok(self
            .documents
            .remove_if(document, &|set| set.version == version)?
            .is_some())
    }

    /// Documents whose entry lives in `partition`.
    pub fn local_documents(&self, partition: PartitionId) -> Result<Vec<DocumentKey>, StorageError> {
        self.documents.local_keys(partition)
    }

    /// Cache ids among `candidates` that some tracked document still waits on.
    pub fn referenced(&self, candidates: &HashSet<CacheId>) -> Result<HashSet<CacheId>, StorageError> {
        let mut out = HashSet::new();
        if candidates.is_empty() {
            return Ok(out);
        }
        for p in 0..self.documents.partition_count() {
            for (_, set) in self.documents.entries(PartitionId(p))? {
                out.extend(set.cache_ids.iter().filter(|id| candidates.contains(id)));
            }
        }
        Ok(out)
    }

    /// Number of documents still waiting.
    pub fn len(&self) -> Result<usize, StorageError> {
        self.documents.len()
    }

    /// Returns true if no document is waiting.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.documents.is_empty()
    }
}
