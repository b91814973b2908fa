//! Partitioned key model.
//!
//! Keys are plain data. Routing is a separate, pure function per key type that
//! derives a [`RoutingKey`] from one designated field; the caller hands that
//! hint to the store on write. Two keys with the same hint always land on the
//! same partition, which is how one ingestion's relations and ingestion-ledger
//! entries end up co-located with each other.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{CacheId, ContentId, DatasourceId, IngestionId, TenantId};

/// Partition-routing hint. Stable across processes and platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(u64);

impl RoutingKey {
    /// Derives a routing key from an ordered list of byte fields.
    #[must_use]
    pub fn from_fields(fields: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_le_bytes(head))
    }

    /// Raw routing value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Maps the hint onto one of `partition_count` partitions.
    ///
    /// # Panics
    /// Panics if `partition_count` is zero.
    #[must_use]
    pub fn partition(self, partition_count: usize) -> PartitionId {
        assert!(partition_count > 0, "partition_count must be non-zero");
        #[allow(clippy::cast_possible_truncation)]
        PartitionId((self.0 % partition_count as u64) as usize)
    }
}

/// Index of a partition in `0..partition_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub usize);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Key of a staging entity.
///
/// `entity_id` is the content-addressed cache id, so the key is fully
/// determined by the mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub tenant_id: TenantId,
    pub entity_id: CacheId,
}

impl EntityKey {
    #[must_use]
    pub const fn new(tenant_id: TenantId, entity_id: CacheId) -> Self {
        Self { tenant_id, entity_id }
    }
}

/// Identifies one ingested document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentKey {
    pub tenant_id: TenantId,
    pub datasource_id: DatasourceId,
    pub content_id: ContentId,
}

impl DocumentKey {
    #[must_use]
    pub fn new(tenant_id: TenantId, datasource_id: DatasourceId, content_id: impl Into<ContentId>) -> Self {
        Self {
            tenant_id,
            datasource_id,
            content_id: content_id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.datasource_id, self.content_id)
    }
}

/// A relation discovered between two staging entities in one ingestion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationKey {
    pub entity_relation_id: u64,
    pub entity_id: CacheId,
    pub ingestion_id: IngestionId,
}

/// Associates an entity with the ingestion batch that discovered it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionKey {
    pub entity_id: CacheId,
    pub ingestion_id: IngestionId,
    pub tenant_id: TenantId,
}

/// Routing for a staging entity: the ingestion that first discovered it, so
/// all fragments found while processing one document share a partition.
#[must_use]
pub fn entity_hint(discovered_by: &IngestionId) -> RoutingKey {
    ingestion_routing(discovered_by)
}

/// Routing for a document's tracked entity set.
#[must_use]
pub fn document_hint(key: &DocumentKey) -> RoutingKey {
    RoutingKey::from_fields(&[
        &key.tenant_id.get().to_le_bytes(),
        &key.datasource_id.get().to_le_bytes(),
        key.content_id.as_str().as_bytes(),
    ])
}

/// Routing for a relation key: its ingestion id.
#[must_use]
pub fn relation_hint(key: &RelationKey) -> RoutingKey {
    ingestion_routing(&key.ingestion_id)
}

/// Routing for an ingestion key: its ingestion id.
#[must_use]
pub fn ingestion_hint(key: &IngestionKey) -> RoutingKey {
    ingestion_routing(&key.ingestion_id)
}

/// Routing shared by everything partitioned on an ingestion id.
#[must_use]
pub fn ingestion_routing(ingestion_id: &IngestionId) -> RoutingKey {
    RoutingKey::from_fields(&[b"ingestion", ingestion_id.as_str().as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;

    fn cache(name: &str) -> CacheId {
        CacheId::compute(TenantId(1), name, &EntityType::Person)
    }

    #[test]
    fn relation_and_ingestion_keys_colocate() {
        let ingestion = IngestionId::new("ing-42");
        let relation = RelationKey {
            entity_relation_id: 3,
            entity_id: cache("alice"),
            ingestion_id: ingestion.clone(),
        };
        let ledger = IngestionKey {
            entity_id: cache("bob"),
            ingestion_id: ingestion.clone(),
            tenant_id: TenantId(1),
        };

        assert_eq!(relation_hint(&relation), ingestion_hint(&ledger));
        assert_eq!(relation_hint(&relation), entity_hint(&ingestion));
        assert_eq!(
            relation_hint(&relation).partition(271),
            ingestion_hint(&ledger).partition(271)
        );
    }

    #[test]
    fn routing_is_deterministic() {
        let doc = DocumentKey::new(TenantId(1), DatasourceId(2), "c-1");
        assert_eq!(document_hint(&doc), document_hint(&doc.clone()));
        assert_ne!(
            document_hint(&doc),
            document_hint(&DocumentKey::new(TenantId(1), DatasourceId(2), "c-2"))
        );
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = RoutingKey::from_fields(&[b"ab", b"c"]);
        let b = RoutingKey::from_fields(&[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn partition_is_in_range() {
        for i in 0..64u64 {
            let hint = RoutingKey::from_fields(&[&i.to_le_bytes()]);
            assert!(hint.partition(7).0 < 7);
        }
    }
}
