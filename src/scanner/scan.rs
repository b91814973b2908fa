//! One completion pass over a set of locally owned partitions.

use std::cell::Cell;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::entity::{CacheId, GraphId, IngestionId};
use crate::error::{ManagerError, ManagerResult};
use crate::external::{BatchSink, GraphStore};
use crate::key::{DocumentKey, EntityKey, PartitionId};
use crate::message::{ResolvedBatch, ResolvedDocument, ResolvedEntity};
use crate::storage::{NodeId, PartitionTable};
use crate::stores::Stores;

/// Edge label between an entity and a document it appears in.
pub const RELATED_TO: &str = "related_to";

/// Counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    /// Documents committed and cleared.
    pub committed: usize,
    /// Documents left tracked because some entity is not indexable yet, or
    /// because the set grew during the commit.
    pub pending: usize,
    /// Documents left tracked because a graph call failed.
    pub failed: usize,
    pub relations_committed: usize,
    pub relations_pending: usize,
    /// Staging records evicted after their last referencing document committed.
    pub evicted: usize,
}

impl ScanReport {
    /// Adds another report's counters to this one.
    pub fn merge(&mut self, other: &Self) {
        self.committed += other.committed;
        self.pending += other.pending;
        self.failed += other.failed;
        self.relations_committed += other.relations_committed;
        self.relations_pending += other.relations_pending;
        self.evicted += other.evicted;
    }

    /// Returns true if the pass touched nothing.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.committed == 0
            && self.pending == 0
            && self.failed == 0
            && self.relations_committed == 0
            && self.relations_pending == 0
            && self.evicted == 0
    }
}

enum DocumentOutcome {
    Committed {
        document: ResolvedDocument,
        keys: Vec<EntityKey>,
        ingestion_ids: BTreeSet<IngestionId>,
    },
    Pending,
    Failed,
    Gone,
}

/// Commits fully resolved documents to the graph.
pub struct CompletionScanner {
    stores: Stores,
    table: PartitionTable,
    graph: Arc<dyn GraphStore>,
    sink: Arc<dyn BatchSink>,
    retain_staging: bool,
}

impl std::fmt::Debug for CompletionScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionScanner")
            .field("table", &self.table)
            .field("retain_staging", &self.retain_staging)
            .finish_non_exhaustive()
    }
}

impl CompletionScanner {
    /// Scanner over `stores`, retaining staging records after commit.
    #[must_use]
    pub fn new(stores: Stores, table: PartitionTable, graph: Arc<dyn GraphStore>, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            stores,
            table,
            graph,
            sink,
            retain_staging: true,
        }
    }

    /// Keep staging records after commit (`true`, the default) or evict them
    /// once no ingestion references them.
    #[must_use]
    pub fn with_retain_staging(mut self, retain: bool) -> Self {
        self.retain_staging = retain;
        self
    }

    #[must_use]
    pub const fn table(&self) -> &PartitionTable {
        &self.table
    }

    /// Scan one partition.
    #[instrument(skip(self), fields(partition = %partition))]
    pub fn scan_partition(&self, partition: PartitionId) -> ManagerResult<ScanReport> {
        self.pass(&[partition], None)
    }

    /// Scan every partition `node` owns.
    #[instrument(skip(self), fields(node = %node))]
    pub fn scan_node(&self, node: NodeId) -> ManagerResult<ScanReport> {
        self.pass(&self.table.owned_by(node), None)
    }

    /// Like [`scan_node`](Self::scan_node), but stops between documents once
    /// `cancel` is set. Documents already committed are still emitted.
    pub fn scan_node_until(&self, node: NodeId, cancel: &AtomicBool) -> ManagerResult<ScanReport> {
        self.pass(&self.table.owned_by(node), Some(cancel))
    }

    /// Scan every partition, as if this process owned all of them.
    pub fn scan_all(&self) -> ManagerResult<ScanReport> {
        let partitions: Vec<_> = (0..self.table.partition_count()).map(PartitionId).collect();
        self.pass(&partitions, None)
    }

    fn pass(&self, partitions: &[PartitionId], cancel: Option<&AtomicBool>) -> ManagerResult<ScanReport> {
        let cancelled = || cancel.is_some_and(|flag| flag.load(Ordering::SeqCst));
        let mut report = ScanReport::default();
        let mut resolved = Vec::new();
        let mut committed_keys = HashSet::new();
        let mut released = Vec::new();

        'documents: for &partition in partitions {
            for document in self.stores.tracker.local_documents(partition)? {
                if cancelled() {
                    debug!("scan pass abandoned");
                    break 'documents;
                }
                match self.commit_document(&document)? {
                    DocumentOutcome::Committed {
                        document,
                        keys,
                        ingestion_ids,
                    } => {
                        report.committed += 1;
                        committed_keys.extend(keys);
                        released.push((document.document.clone(), ingestion_ids));
                        resolved.push(document);
                    }
                    DocumentOutcome::Pending => report.pending += 1,
                    DocumentOutcome::Failed => report.failed += 1,
                    DocumentOutcome::Gone => {}
                }
            }
        }

        if !cancelled() {
            for &partition in partitions {
                self.commit_relations(partition, &mut report)?;
            }
        }

        if !self.retain_staging && !committed_keys.is_empty() {
            report.evicted = self.evict(&released, &committed_keys)?;
        }

        if !resolved.is_empty() {
            let count = resolved.len();
            if let Err(err) = self.sink.emit(ResolvedBatch::new(resolved)) {
                warn!(documents = count, error = %err, "resolved batch not emitted");
            }
        }

        if !report.is_idle() {
            info!(
                committed = report.committed,
                pending = report.pending,
                failed = report.failed,
                relations = report.relations_committed,
                evicted = report.evicted,
                "scan pass"
            );
        }
        Ok(report)
    }

    fn commit_document(&self, document: &DocumentKey) -> ManagerResult<DocumentOutcome> {
        let Some(set) = self.stores.tracker.snapshot(document)? else {
            return Ok(DocumentOutcome::Gone);
        };

        let keys: Vec<EntityKey> = set
            .cache_ids
            .iter()
            .map(|cache_id| EntityKey::new(document.tenant_id, *cache_id))
            .collect();
        let ready = self.stores.staging.indexable(&keys)?;
        if ready.len() != keys.len() {
            debug!(document = %document, ready = ready.len(), tracked = keys.len(), "document pending");
            return Ok(DocumentOutcome::Pending);
        }

        let entities: Vec<ResolvedEntity> = ready.iter().filter_map(ResolvedEntity::from_staging).collect();
        let graph_id = match self.write_document(document, &entities) {
            Ok(graph_id) => graph_id,
            Err(err) => {
                warn!(document = %document, error = %err, "graph commit failed; document stays tracked");
                return Ok(DocumentOutcome::Failed);
            }
        };

        if !self.stores.tracker.clear_if_unchanged(document, set.version)? {
            debug!(document = %document, "entity set changed during commit; recommitting next pass");
            return Ok(DocumentOutcome::Pending);
        }

        debug!(document = %document, entities = entities.len(), "document committed");
        Ok(DocumentOutcome::Committed {
            document: ResolvedDocument {
                document: document.clone(),
                graph_id,
                ingestion_ids: set.ingestion_ids.iter().cloned().collect(),
                entities,
            },
            keys,
            ingestion_ids: set.ingestion_ids,
        })
    }

    /// Document node first, then one edge per entity.
    fn write_document(&self, document: &DocumentKey, entities: &[ResolvedEntity]) -> ManagerResult<GraphId> {
        let graph_id = self
            .graph
            .insert_document_node(document.tenant_id, document.datasource_id, &document.content_id)
            .map_err(ManagerError::graph)?;
        for entity in entities {
            self.graph
                .create_relationship(entity.graph_id, graph_id, RELATED_TO)
                .map_err(ManagerError::graph)?;
        }
        Ok(graph_id)
    }

    fn commit_relations(&self, partition: PartitionId, report: &mut ScanReport) -> ManagerResult<()> {
        for (key, relation) in self.stores.relations.local(partition)? {
            let endpoints = [
                EntityKey::new(relation.tenant_id, relation.from),
                EntityKey::new(relation.tenant_id, relation.to),
            ];
            let ready = self.stores.staging.indexable(&endpoints)?;
            let graph_of = |cache_id: CacheId| {
                ready
                    .iter()
                    .find(|e| e.cache_id == cache_id)
                    .and_then(|e| e.graph_id)
            };
            let (Some(from), Some(to)) = (graph_of(relation.from), graph_of(relation.to)) else {
                report.relations_pending += 1;
                continue;
            };

            match self.graph.create_relationship(from, to, &relation.label) {
                Ok(()) => {
                    self.stores.relations.remove(&key)?;
                    report.relations_committed += 1;
                }
                Err(err) => {
                    warn!(label = %relation.label, error = %err, "relation commit failed; staying staged");
                    report.relations_pending += 1;
                }
            }
        }
        Ok(())
    }

    /// Release the committed documents from the ledger and evict the staging
    /// records nothing references any more.
    ///
    /// A record survives while a ledger entry, a staged relation, or a tracked
    /// document still names its cache id. The ledger is checked once more
    /// under the record's partition lock, because a resolver records its
    /// ledger entry before it confirms the record still exists.
    fn evict(
        &self,
        released: &[(DocumentKey, BTreeSet<IngestionId>)],
        candidates: &HashSet<EntityKey>,
    ) -> ManagerResult<usize> {
        for (document, ingestion_ids) in released {
            for ingestion_id in ingestion_ids {
                self.stores.ledger.release(ingestion_id, document)?;
            }
        }
        let cache_ids: HashSet<CacheId> = candidates.iter().map(|key| key.entity_id).collect();
        let mut still_needed = self.stores.ledger.referenced(&cache_ids)?;
        still_needed.extend(self.stores.relations.referenced(&cache_ids)?);
        still_needed.extend(self.stores.tracker.referenced(&cache_ids)?);

        let mut evicted = 0;
        for key in candidates {
            if still_needed.contains(&key.entity_id) {
                continue;
            }
            let recheck = Cell::new(None);
            let removed = self.stores.staging.remove_if(key, &|_| {
                match self.stores.ledger.references(key.entity_id) {
                    Ok(referenced) => !referenced,
                    Err(err) => {
                        recheck.set(Some(err));
                        false
                    }
                }
            })?;
            if let Some(err) = recheck.take() {
                return Err(err.into());
            }
            if removed.is_some() {
                evicted += 1;
            } else {
                debug!(cache_id = ?key.entity_id, "staging record not evicted");
            }
        }
        if evicted > 0 {
            debug!(evicted, "staging records evicted");
        }
        Ok(evicted)
    }
}
