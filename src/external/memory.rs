//! In-memory collaborators with fault injection.
//!
//! Used by the CLI and by tests. Every operation is idempotent the same way a
//! production backend is expected to be.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::entity::{normalize_name, ContentId, DatasourceId, EntityType, GraphId, PersistentId, TenantId};
use crate::error::CollaboratorError;
use crate::message::ResolvedBatch;

use super::{BatchSink, CanonicalIndex, EntityFields, EntityNodeWriter, GraphStore};

fn poisoned(what: &str) -> CollaboratorError {
    CollaboratorError::Unavailable(format!("{what} lock poisoned"))
}

type CanonicalKey = (TenantId, String, EntityType);

/// Canonical index keyed by `(tenant, normalized name, type)`.
#[derive(Debug)]
pub struct InMemoryIndex {
    canonical: Mutex<HashMap<CanonicalKey, PersistentId>>,
    documents: Mutex<HashMap<PersistentId, EntityFields>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    lookups: AtomicUsize,
    creates: AtomicUsize,
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self {
            canonical: Mutex::new(HashMap::new()),
            documents: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
            lookups: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        }
    }
}

impl InMemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Register a canonical entity that already exists before any ingestion.
    pub fn seed(&self, tenant_id: TenantId, name: &str, entity_type: &EntityType) -> Result<PersistentId, CollaboratorError> {
        self.get_or_create(tenant_id, name, entity_type)
    }

    /// Number of `find_canonical` calls served.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of `create_canonical` calls served.
    #[must_use]
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of distinct canonical entities.
    pub fn canonical_count(&self) -> Result<usize, CollaboratorError> {
        Ok(self.canonical.lock().map_err(|_| poisoned("index.canonical"))?.len())
    }

    /// The indexed document for a persistent id.
    pub fn indexed(&self, persistent_id: PersistentId) -> Result<Option<EntityFields>, CollaboratorError> {
        let documents = self.documents.lock().map_err(|_| poisoned("index.documents"))?;
        Ok(documents.get(&persistent_id).cloned())
    }

    fn check(&self) -> Result<(), CollaboratorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("index offline".to_string()));
        }
        Ok(())
    }

    fn get_or_create(
        &self,
        tenant_id: TenantId,
        name: &str,
        entity_type: &EntityType,
    ) -> Result<PersistentId, CollaboratorError> {
        let mut canonical = self.canonical.lock().map_err(|_| poisoned("index.canonical"))?;
        let key = (tenant_id, normalize_name(name), entity_type.clone());
        let id = *canonical
            .entry(key)
            .or_insert_with(|| PersistentId(self.next_id.fetch_add(1, Ordering::SeqCst)));
        Ok(id)
    }
}

impl CanonicalIndex for InMemoryIndex {
    fn find_canonical(
        &self,
        tenant_id: TenantId,
        name: &str,
        entity_type: &EntityType,
    ) -> Result<Option<PersistentId>, CollaboratorError> {
        self.check()?;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let canonical = self.canonical.lock().map_err(|_| poisoned("index.canonical"))?;
        Ok(canonical
            .get(&(tenant_id, normalize_name(name), entity_type.clone()))
            .copied())
    }

    fn create_canonical(
        &self,
        tenant_id: TenantId,
        name: &str,
        entity_type: &EntityType,
    ) -> Result<PersistentId, CollaboratorError> {
        self.check()?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.get_or_create(tenant_id, name, entity_type)
    }

    fn index_entity(&self, persistent_id: PersistentId, fields: &EntityFields) -> Result<(), CollaboratorError> {
        self.check()?;
        let mut documents = self.documents.lock().map_err(|_| poisoned("index.documents"))?;
        documents.insert(persistent_id, fields.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GraphState {
    documents: HashMap<(TenantId, DatasourceId, ContentId), GraphId>,
    entities: HashMap<(TenantId, PersistentId), GraphId>,
    edges: BTreeSet<(GraphId, GraphId, String)>,
}

/// Graph store with idempotent nodes and edges.
///
/// `fail_edges_after(n)` lets the next `n` edge calls through and fails every
/// one after that until [`InMemoryGraph::heal`] is called.
#[derive(Debug)]
pub struct InMemoryGraph {
    state: Mutex<GraphState>,
    next_id: AtomicU64,
    fail_documents: AtomicBool,
    edge_budget: Mutex<Option<usize>>,
    document_calls: AtomicUsize,
    edge_calls: AtomicUsize,
}

impl Default for InMemoryGraph {
    fn default() -> Self {
        Self {
            state: Mutex::new(GraphState::default()),
            next_id: AtomicU64::new(1_000),
            fail_documents: AtomicBool::new(false),
            edge_budget: Mutex::new(None),
            document_calls: AtomicUsize::new(0),
            edge_calls: AtomicUsize::new(0),
        }
    }
}

impl InMemoryGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make document inserts fail until healed.
    pub fn fail_documents(&self, fail: bool) {
        self.fail_documents.store(fail, Ordering::SeqCst);
    }

    /// Allow `remaining` more edge calls, then fail.
    pub fn fail_edges_after(&self, remaining: usize) -> Result<(), CollaboratorError> {
        *self.edge_budget.lock().map_err(|_| poisoned("graph.edge_budget"))? = Some(remaining);
        Ok(())
    }

    /// Clear all injected faults.
    pub fn heal(&self) -> Result<(), CollaboratorError> {
        self.fail_documents.store(false, Ordering::SeqCst);
        *self.edge_budget.lock().map_err(|_| poisoned("graph.edge_budget"))? = None;
        Ok(())
    }

    /// Number of `insert_document_node` calls, including repeats.
    #[must_use]
    pub fn document_calls(&self) -> usize {
        self.document_calls.load(Ordering::SeqCst)
    }

    /// Number of `create_relationship` calls, including repeats and failures.
    #[must_use]
    pub fn edge_calls(&self) -> usize {
        self.edge_calls.load(Ordering::SeqCst)
    }

    /// Distinct document nodes.
    pub fn document_nodes(&self) -> Result<usize, CollaboratorError> {
        Ok(self.state.lock().map_err(|_| poisoned("graph.state"))?.documents.len())
    }

    /// Graph id of a document node, if inserted.
    pub fn document_node(
        &self,
        tenant_id: TenantId,
        datasource_id: DatasourceId,
        content_id: &ContentId,
    ) -> Result<Option<GraphId>, CollaboratorError> {
        let state = self.state.lock().map_err(|_| poisoned("graph.state"))?;
        Ok(state
            .documents
            .get(&(tenant_id, datasource_id, content_id.clone()))
            .copied())
    }

    /// All distinct edges, ordered.
    pub fn edges(&self) -> Result<Vec<(GraphId, GraphId, String)>, CollaboratorError> {
        let state = self.state.lock().map_err(|_| poisoned("graph.state"))?;
        Ok(state.edges.iter().cloned().collect())
    }

    pub fn has_edge(&self, from: GraphId, to: GraphId, label: &str) -> Result<bool, CollaboratorError> {
        let state = self.state.lock().map_err(|_| poisoned("graph.state"))?;
        Ok(state.edges.contains(&(from, to, label.to_string())))
    }

    fn allocate(&self) -> GraphId {
        GraphId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl GraphStore for InMemoryGraph {
    fn insert_document_node(
        &self,
        tenant_id: TenantId,
        datasource_id: DatasourceId,
        content_id: &ContentId,
    ) -> Result<GraphId, CollaboratorError> {
        self.document_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_documents.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("graph offline".to_string()));
        }
        let mut state = self.state.lock().map_err(|_| poisoned("graph.state"))?;
        let id = *state
            .documents
            .entry((tenant_id, datasource_id, content_id.clone()))
            .or_insert_with(|| self.allocate());
        Ok(id)
    }

    fn create_relationship(&self, from: GraphId, to: GraphId, label: &str) -> Result<(), CollaboratorError> {
        self.edge_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut budget = self.edge_budget.lock().map_err(|_| poisoned("graph.edge_budget"))?;
            match budget.as_mut() {
                Some(0) => {
                    return Err(CollaboratorError::Unavailable("graph offline".to_string()));
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }
        let mut state = self.state.lock().map_err(|_| poisoned("graph.state"))?;
        state.edges.insert((from, to, label.to_string()));
        Ok(())
    }
}

impl EntityNodeWriter for InMemoryGraph {
    fn insert_entity_node(
        &self,
        tenant_id: TenantId,
        persistent_id: PersistentId,
        _name: &str,
        _entity_type: &EntityType,
    ) -> Result<GraphId, CollaboratorError> {
        let mut state = self.state.lock().map_err(|_| poisoned("graph.state"))?;
        let id = *state
            .entities
            .entry((tenant_id, persistent_id))
            .or_insert_with(|| self.allocate());
        Ok(id)
    }
}

/// Sink that keeps every emitted batch.
#[derive(Debug, Default)]
pub struct CollectingSink {
    batches: Mutex<Vec<ResolvedBatch>>,
    unavailable: AtomicBool,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `emit` fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Everything emitted so far.
    pub fn batches(&self) -> Result<Vec<ResolvedBatch>, CollaboratorError> {
        Ok(self.batches.lock().map_err(|_| poisoned("sink.batches"))?.clone())
    }
}

impl BatchSink for CollectingSink {
    fn emit(&self, batch: ResolvedBatch) -> Result<(), CollaboratorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("sink offline".to_string()));
        }
        self.batches.lock().map_err(|_| poisoned("sink.batches"))?.push(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_canonical_is_create_or_get() {
        let index = InMemoryIndex::new();
        let a = index.create_canonical(TenantId(1), "Alice", &EntityType::Person).unwrap();
        let b = index.create_canonical(TenantId(1), "  alice ", &EntityType::Person).unwrap();
        let other_tenant = index.create_canonical(TenantId(2), "Alice", &EntityType::Person).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, other_tenant);
        assert_eq!(index.canonical_count().unwrap(), 2);
        assert_eq!(
            index.find_canonical(TenantId(1), "ALICE", &EntityType::Person).unwrap(),
            Some(a)
        );
    }

    #[test]
    fn unavailable_index_fails_every_call() {
        let index = InMemoryIndex::new();
        index.set_unavailable(true);
        assert!(index.find_canonical(TenantId(1), "x", &EntityType::Concept).is_err());
        index.set_unavailable(false);
        assert_eq!(index.find_canonical(TenantId(1), "x", &EntityType::Concept).unwrap(), None);
        assert_eq!(index.lookups(), 1);
    }

    #[test]
    fn graph_nodes_and_edges_are_idempotent() {
        let graph = InMemoryGraph::new();
        let content = ContentId::new("c1");
        let d1 = graph.insert_document_node(TenantId(1), DatasourceId(1), &content).unwrap();
        let d2 = graph.insert_document_node(TenantId(1), DatasourceId(1), &content).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(graph.document_nodes().unwrap(), 1);
        assert_eq!(graph.document_calls(), 2);

        let e = graph
            .insert_entity_node(TenantId(1), PersistentId(5), "Alice", &EntityType::Person)
            .unwrap();
        graph.create_relationship(e, d1, "related_to").unwrap();
        graph.create_relationship(e, d1, "related_to").unwrap();
        assert_eq!(graph.edges().unwrap().len(), 1);
        assert!(graph.has_edge(e, d1, "related_to").unwrap());
    }

    #[test]
    fn edge_budget_fails_after_limit_until_healed() {
        let graph = InMemoryGraph::new();
        graph.fail_edges_after(1).unwrap();
        graph.create_relationship(GraphId(1), GraphId(2), "a").unwrap();
        assert!(graph.create_relationship(GraphId(1), GraphId(3), "a").is_err());
        graph.heal().unwrap();
        graph.create_relationship(GraphId(1), GraphId(3), "a").unwrap();
        assert_eq!(graph.edges().unwrap().len(), 2);
        assert_eq!(graph.edge_calls(), 3);
    }

    #[test]
    fn collecting_sink_keeps_batches() {
        let sink = CollectingSink::new();
        sink.emit(ResolvedBatch::new(Vec::new())).unwrap();
        sink.set_unavailable(true);
        assert!(sink.emit(ResolvedBatch::new(Vec::new())).is_err());
        assert_eq!(sink.batches().unwrap().len(), 1);
    }
}
