//! Staging entity records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{CacheId, EntityType, GraphId, IngestionId, PersistentId, TenantId, TmpId};
use crate::key::EntityKey;

/// A provisional entity record pending full resolution.
///
/// Ids are assigned append-style: once `persistent_id` or `graph_id` is set it
/// is never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingEntity {
    pub tmp_id: TmpId,
    pub cache_id: CacheId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_id: Option<PersistentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<GraphId>,
    /// Name as first seen (trimmed, original casing).
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub tenant_id: TenantId,
    /// Ingestion that created this record.
    pub ingestion_id: IngestionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagingEntity {
    /// Creates a record with no ids assigned yet.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        ingestion_id: IngestionId,
        name: &str,
        entity_type: EntityType,
    ) -> Self {
        let now = Utc::now();
        Self {
            tmp_id: TmpId::new(),
            cache_id: CacheId::compute(tenant_id, name, &entity_type),
            persistent_id: None,
            graph_id: None,
            name: name.trim().to_string(),
            entity_type,
            tenant_id,
            ingestion_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pre-populates the canonical persistent id.
    #[must_use]
    pub fn with_persistent_id(mut self, persistent_id: PersistentId) -> Self {
        self.persistent_id = Some(persistent_id);
        self
    }

    /// Store key for this record.
    #[must_use]
    pub const fn key(&self) -> EntityKey {
        EntityKey::new(self.tenant_id, self.cache_id)
    }

    /// Eligible for graph commit: both the persistent id and the graph id are set.
    #[must_use]
    pub const fn is_indexable(&self) -> bool {
        self.persistent_id.is_some() && self.graph_id.is_some()
    }
}
