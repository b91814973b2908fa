//! Ingress and egress message types.
//!
//! These are the shapes exchanged with the message transport. Field names are
//! camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{
    CacheId, ContentId, DatasourceId, EntityType, GraphId, IngestionId, PersistentId, TenantId,
};
use crate::key::DocumentKey;
use crate::staging::StagingEntity;

/// A `(name, type)` pair extracted from a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub name: String,
    /// Extractor label, e.g. `PERSON`.
    #[serde(rename = "type")]
    pub entity_type: String,
}

impl Mention {
    #[must_use]
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
        }
    }
}

/// A labeled relation between two mentions of the same record, by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMention {
    pub from: usize,
    pub to: usize,
    pub label: String,
}

/// One ingestion event, delivered at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRecord {
    pub tenant_id: TenantId,
    pub ingestion_id: IngestionId,
    pub datasource_id: DatasourceId,
    pub content_id: ContentId,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    #[serde(default)]
    pub relations: Vec<RelationMention>,
}

impl IngestionRecord {
    /// Key of the document this record describes.
    #[must_use]
    pub fn document_key(&self) -> DocumentKey {
        DocumentKey::new(self.tenant_id, self.datasource_id, self.content_id.clone())
    }
}

/// A resolved entity as emitted downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEntity {
    pub cache_id: CacheId,
    pub persistent_id: PersistentId,
    pub graph_id: GraphId,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
}

impl ResolvedEntity {
    /// Projects an indexable staging record. Returns `None` if either id is missing.
    #[must_use]
    pub fn from_staging(entity: &StagingEntity) -> Option<Self> {
        Some(Self {
            cache_id: entity.cache_id,
            persistent_id: entity.persistent_id?,
            graph_id: entity.graph_id?,
            name: entity.name.clone(),
            entity_type: entity.entity_type.clone(),
        })
    }
}

/// One committed document and the entities linked to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDocument {
    pub document: DocumentKey,
    pub graph_id: GraphId,
    pub ingestion_ids: Vec<IngestionId>,
    pub entities: Vec<ResolvedEntity>,
}

/// Everything one scanner pass committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedBatch {
    pub emitted_at: DateTime<Utc>,
    pub documents: Vec<ResolvedDocument>,
}

impl ResolvedBatch {
    #[must_use]
    pub fn new(documents: Vec<ResolvedDocument>) -> Self {
        Self {
            emitted_at: Utc::now(),
            documents,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}
