//! Entity resolution service.
//!
//! Turns mentions into staging entities: find-or-create against staging and
//! the canonical index, register the entity with its document, and schedule
//! persistence for whatever ids are still missing. Each write is an
//! idempotent upsert, so a failed call can be retried wholesale.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::entity::{normalize_name, CacheId, EntityType, GraphId, IngestionId};
use crate::error::{ManagerError, ManagerResult, ValidationError};
use crate::external::CanonicalIndex;
use crate::key::{DocumentKey, EntityKey, IngestionKey, RelationKey};
use crate::message::IngestionRecord;
use crate::persist::{PersistJob, PersistenceScheduler};
use crate::scanner::ScanTrigger;
use crate::staging::{Assignment, StagedRelation, StagingEntity};
use crate::stores::Stores;

/// Result of ingesting one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub document: DocumentKey,
    /// One entry per mention, in record order.
    pub entities: Vec<StagingEntity>,
    pub relations_staged: usize,
}

/// Find-or-create entry point for mentions.
pub struct EntityResolver {
    stores: Stores,
    index: Arc<dyn CanonicalIndex>,
    scheduler: Arc<dyn PersistenceScheduler>,
    trigger: Option<ScanTrigger>,
}

impl std::fmt::Debug for EntityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityResolver")
            .field("stores", &self.stores)
            .finish_non_exhaustive()
    }
}

impl EntityResolver {
    #[must_use]
    pub fn new(stores: Stores, index: Arc<dyn CanonicalIndex>, scheduler: Arc<dyn PersistenceScheduler>) -> Self {
        Self {
            stores,
            index,
            scheduler,
            trigger: None,
        }
    }

    /// Nudge `trigger` after every ingest and graph id assignment.
    #[must_use]
    pub fn with_trigger(mut self, trigger: ScanTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Resolve one mention for `document`.
    ///
    /// On a staging miss the canonical index is consulted first; if that
    /// fails nothing is written. An existing staging record is returned
    /// unchanged, and persistence is scheduled again for as long as it is not
    /// indexable.
    #[instrument(skip(self, document, ingestion_id), fields(document = %document, ingestion = %ingestion_id))]
    pub fn resolve(
        &self,
        document: &DocumentKey,
        ingestion_id: &IngestionId,
        name: &str,
        entity_type: &EntityType,
    ) -> ManagerResult<StagingEntity> {
        let entity = self.stage(document, ingestion_id, name, entity_type)?;
        self.stores.tracker.track(document, entity.cache_id, ingestion_id)?;
        Ok(entity)
    }

    /// Everything `resolve` does except registering with the document.
    fn stage(
        &self,
        document: &DocumentKey,
        ingestion_id: &IngestionId,
        name: &str,
        entity_type: &EntityType,
    ) -> ManagerResult<StagingEntity> {
        if normalize_name(name).is_empty() {
            return Err(ValidationError::EmptyEntityName.into());
        }
        if entity_type.label().is_empty() {
            return Err(ValidationError::EmptyEntityType.into());
        }

        let tenant_id = document.tenant_id;
        let key = EntityKey::new(tenant_id, CacheId::compute(tenant_id, name, entity_type));
        let ledger_key = IngestionKey {
            entity_id: key.entity_id,
            ingestion_id: ingestion_id.clone(),
            tenant_id,
        };

        // The ledger entry is what keeps eviction away from the record, so it
        // is written before the record is confirmed. A record evicted in
        // between is simply created again.
        let entity = loop {
            let entity = self.find_or_create(&key, ingestion_id, name, entity_type)?;
            self.stores.ledger.record(ledger_key.clone(), document)?;
            if self.stores.staging.get(&key)?.is_some() {
                break entity;
            }
            debug!(cache_id = ?key.entity_id, "staging record evicted during resolution; recreating");
        };

        if self.needs_persistence(&entity) {
            self.scheduler.schedule(PersistJob::for_entity(&entity))?;
        }

        Ok(entity)
    }

    fn find_or_create(
        &self,
        key: &EntityKey,
        ingestion_id: &IngestionId,
        name: &str,
        entity_type: &EntityType,
    ) -> ManagerResult<StagingEntity> {
        if let Some(existing) = self.stores.staging.get(key)? {
            debug!(cache_id = ?key.entity_id, "staging hit");
            return Ok(existing);
        }

        let canonical = self
            .index
            .find_canonical(key.tenant_id, name, entity_type)
            .map_err(|err| {
                warn!(cache_id = ?key.entity_id, error = %err, "canonical lookup failed");
                ManagerError::lookup(err)
            })?;
        debug!(cache_id = ?key.entity_id, canonical = ?canonical, "staging miss");

        let mut candidate = StagingEntity::new(key.tenant_id, ingestion_id.clone(), name, entity_type.clone());
        if let Some(persistent_id) = canonical {
            candidate = candidate.with_persistent_id(persistent_id);
        }
        let (stored, _) = self.stores.staging.insert_if_absent(candidate)?;
        Ok(stored)
    }

    /// A record needs a job while it lacks an id that persistence can fill.
    fn needs_persistence(&self, entity: &StagingEntity) -> bool {
        entity.persistent_id.is_none() || (entity.graph_id.is_none() && self.scheduler.assigns_graph_ids())
    }

    /// Ingest a whole record: every mention, then every relation.
    ///
    /// The record is validated before anything is written. The document's
    /// mentions are registered in a single tracker write once all of them are
    /// staged.
    #[instrument(skip(self, record), fields(ingestion = %record.ingestion_id, mentions = record.mentions.len()))]
    pub fn ingest(&self, record: &IngestionRecord) -> ManagerResult<IngestOutcome> {
        let types = validate(record)?;
        let document = record.document_key();

        let mut entities = Vec::with_capacity(record.mentions.len());
        for (mention, entity_type) in record.mentions.iter().zip(&types) {
            entities.push(self.stage(&document, &record.ingestion_id, &mention.name, entity_type)?);
        }
        if !entities.is_empty() {
            let cache_ids: Vec<CacheId> = entities.iter().map(|e| e.cache_id).collect();
            self.stores.tracker.track_all(&document, &cache_ids, &record.ingestion_id)?;
        }

        for (position, relation) in record.relations.iter().enumerate() {
            let from = &entities[relation.from];
            let to = &entities[relation.to];
            self.stores.relations.stage(
                RelationKey {
                    entity_relation_id: position as u64,
                    entity_id: from.cache_id,
                    ingestion_id: record.ingestion_id.clone(),
                },
                StagedRelation {
                    tenant_id: record.tenant_id,
                    from: from.cache_id,
                    to: to.cache_id,
                    label: relation.label.trim().to_string(),
                },
            )?;
        }

        if entities.is_empty() {
            debug!(document = %document, "record carried no mentions");
        }
        self.nudge();

        Ok(IngestOutcome {
            document,
            entities,
            relations_staged: record.relations.len(),
        })
    }

    /// Record the graph id a background indexer assigned to an entity.
    ///
    /// Append-only: a different id already present is kept.
    pub fn assign_graph_id(&self, key: &EntityKey, graph_id: GraphId) -> ManagerResult<Assignment> {
        let outcome = self.stores.staging.assign_graph_id(key, graph_id)?;
        if matches!(outcome, Assignment::Assigned(_)) {
            self.nudge();
        }
        Ok(outcome)
    }

    fn nudge(&self) {
        if let Some(trigger) = &self.trigger {
            trigger.nudge();
        }
    }
}

fn validate(record: &IngestionRecord) -> Result<Vec<EntityType>, ValidationError> {
    if record.ingestion_id.as_str().trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "ingestionId".to_string(),
        });
    }
    if record.content_id.as_str().trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "contentId".to_string(),
        });
    }

    let mut types = Vec::with_capacity(record.mentions.len());
    for mention in &record.mentions {
        if normalize_name(&mention.name).is_empty() {
            return Err(ValidationError::EmptyEntityName);
        }
        types.push(mention.entity_type.parse::<EntityType>()?);
    }

    let len = record.mentions.len();
    for (position, relation) in record.relations.iter().enumerate() {
        for index in [relation.from, relation.to] {
            if index >= len {
                return Err(ValidationError::RelationOutOfRange { position, index, len });
            }
        }
        if relation.label.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: format!("relations[{position}].label"),
            });
        }
    }

    Ok(types)
}
