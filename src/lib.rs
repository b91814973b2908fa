//! # entity-manager - Entity Resolution and Document Completion
//!
//! Deduplicates entity mentions from ingested documents against a canonical
//! store, and commits each document's node and `related_to` edges to the
//! graph once every entity the document mentions is fully resolved.
//!
//! ## Core Concepts
//!
//! - **Cache id**: content hash of `(tenant, normalized name, type)`; the dedup key
//! - **Staging entity**: provisional record that collects a persistent id and a graph id
//! - **Indexable**: a staging entity with both ids set
//! - **Document entity set**: the cache ids a document is waiting on
//! - **Completion scan**: partition-local pass that commits complete documents
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use entity_manager::{
//!     Collaborators, CollectingSink, EntityManager, EntityManagerConfig, InMemoryGraph, InMemoryIndex,
//!     IngestionRecord,
//! };
//!
//! let graph = Arc::new(InMemoryGraph::new());
//! let manager = EntityManager::start(
//!     EntityManagerConfig::default(),
//!     Collaborators {
//!         index: Arc::new(InMemoryIndex::new()),
//!         graph: graph.clone(),
//!         nodes: Some(graph),
//!         sink: Arc::new(CollectingSink::new()),
//!     },
//! )?;
//!
//! let record: IngestionRecord = serde_json::from_str(line)?;
//! manager.handle(&record)?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Identity and routing
pub mod entity;
pub mod error;
pub mod key;
pub mod message;

// Partitioned state
pub mod staging;
pub mod storage;
pub mod stores;
pub mod tracker;

// Collaborators and pipeline
pub mod config;
pub mod external;
pub mod manager;
pub mod persist;
pub mod resolver;
pub mod scanner;

pub use config::EntityManagerConfig;
pub use entity::{
    normalize_name, CacheId, ContentId, DatasourceId, EntityType, GraphId, IngestionId, PersistentId, TenantId,
    TmpId,
};
pub use error::{CollaboratorError, ManagerError, ManagerResult, ValidationError};
pub use external::{
    BatchSink, CanonicalIndex, CollectingSink, EntityFields, EntityNodeWriter, GraphStore, InMemoryGraph,
    InMemoryIndex,
};
pub use key::{DocumentKey, EntityKey, IngestionKey, PartitionId, RelationKey, RoutingKey};
pub use manager::{Collaborators, EntityManager};
pub use message::{IngestionRecord, Mention, RelationMention, ResolvedBatch, ResolvedDocument, ResolvedEntity};
pub use persist::{ManualScheduler, PersistJob, PersistenceConfig, PersistenceScheduler, PersistenceWorker, Persister};
pub use resolver::{EntityResolver, IngestOutcome};
pub use scanner::{CompletionScanner, ScanReport, ScanService, ScanServiceConfig, ScanTrigger, RELATED_TO};
pub use staging::{Assignment, StagingEntity, StagingStore};
pub use storage::{InMemoryPartitionedStore, NodeId, PartitionTable, PartitionedStore, StorageError};
pub use stores::Stores;
pub use tracker::{DocumentEntitySet, DocumentTracker};
