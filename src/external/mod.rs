//! External collaborators.
//!
//! The canonical index, the graph store, and the downstream sink are owned by
//! other systems. Only the operations below are consumed. Implementations must
//! be idempotent where noted: this crate delivers into them at least once.

mod memory;

use serde::{Deserialize, Serialize};

use crate::entity::{CacheId, ContentId, DatasourceId, EntityType, GraphId, PersistentId, TenantId};
use crate::error::CollaboratorError;
use crate::message::ResolvedBatch;

pub use memory::{CollectingSink, InMemoryGraph, InMemoryIndex};

/// Fields written to the canonical index for a persisted entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityFields {
    pub tenant_id: TenantId,
    pub cache_id: CacheId,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
}

/// Search-index lookup and creation of canonical entities.
pub trait CanonicalIndex: Send + Sync {
    /// Persistent id of the canonical entity matching `(name, type)` in the tenant.
    fn find_canonical(
        &self,
        tenant_id: TenantId,
        name: &str,
        entity_type: &EntityType,
    ) -> Result<Option<PersistentId>, CollaboratorError>;

    /// Create the canonical entity, or return the existing one (create-or-get).
    fn create_canonical(
        &self,
        tenant_id: TenantId,
        name: &str,
        entity_type: &EntityType,
    ) -> Result<PersistentId, CollaboratorError>;

    /// Write (or overwrite) the searchable document for a persisted entity.
    fn index_entity(&self, persistent_id: PersistentId, fields: &EntityFields) -> Result<(), CollaboratorError>;
}

/// The two graph-database operations this crate needs.
pub trait GraphStore: Send + Sync {
    /// Insert the document node, or return the existing node for the same
    /// `(tenant, datasource, content)`.
    fn insert_document_node(
        &self,
        tenant_id: TenantId,
        datasource_id: DatasourceId,
        content_id: &ContentId,
    ) -> Result<GraphId, CollaboratorError>;

    /// Create an edge. Idempotent on `(from, to, label)`.
    fn create_relationship(&self, from: GraphId, to: GraphId, label: &str) -> Result<(), CollaboratorError>;
}

/// Background indexer that gives persisted entities a graph node.
///
/// Optional: without one, graph ids arrive through
/// [`EntityResolver::assign_graph_id`](crate::resolver::EntityResolver::assign_graph_id).
pub trait EntityNodeWriter: Send + Sync {
    /// Insert the entity node, or return the existing one for the same
    /// `(tenant, persistent_id)`.
    fn insert_entity_node(
        &self,
        tenant_id: TenantId,
        persistent_id: PersistentId,
        name: &str,
        entity_type: &EntityType,
    ) -> Result<GraphId, CollaboratorError>;
}

/// Downstream egress for resolved batches.
pub trait BatchSink: Send + Sync {
    fn emit(&self, batch: ResolvedBatch) -> Result<(), CollaboratorError>;
}

impl BatchSink for crossbeam_channel::Sender<ResolvedBatch> {
    fn emit(&self, batch: ResolvedBatch) -> Result<(), CollaboratorError> {
        self.try_send(batch).map_err(|err| match err {
            crossbeam_channel::TrySendError::Full(_) => {
                CollaboratorError::Unavailable("egress channel full".to_string())
            }
            crossbeam_channel::TrySendError::Disconnected(_) => {
                CollaboratorError::Unavailable("egress channel disconnected".to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_index_object_safe(_: &dyn CanonicalIndex) {}
    fn _assert_graph_object_safe(_: &dyn GraphStore) {}
    fn _assert_node_writer_object_safe(_: &dyn EntityNodeWriter) {}
    fn _assert_sink_object_safe(_: &dyn BatchSink) {}

    #[test]
    fn channel_sink_reports_full_and_disconnected() {
        let (tx, rx) = crossbeam_channel::bounded::<ResolvedBatch>(1);
        tx.emit(ResolvedBatch::new(Vec::new())).unwrap();
        assert!(matches!(
            tx.emit(ResolvedBatch::new(Vec::new())),
            Err(CollaboratorError::Unavailable(msg)) if msg.contains("full")
        ));

        drop(rx);
        assert!(matches!(
            tx.emit(ResolvedBatch::new(Vec::new())),
            Err(CollaboratorError::Unavailable(msg)) if msg.contains("disconnected")
        ));
    }
}
