//! Entity manager facade.
//!
//! Wires stores, resolver, persistence, and scanner from one
//! [`EntityManagerConfig`]. Ingress calls [`EntityManager::handle`] once per
//! delivered record.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::EntityManagerConfig;
use crate::entity::GraphId;
use crate::error::ManagerResult;
use crate::external::{BatchSink, CanonicalIndex, EntityNodeWriter, GraphStore};
use crate::key::EntityKey;
use crate::message::IngestionRecord;
use crate::persist::{ManualScheduler, PersistenceScheduler, PersistenceWorker, Persister};
use crate::resolver::{EntityResolver, IngestOutcome};
use crate::scanner::{CompletionScanner, ScanReport, ScanService};
use crate::staging::Assignment;
use crate::stores::Stores;

/// The external systems the manager talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub index: Arc<dyn CanonicalIndex>,
    pub graph: Arc<dyn GraphStore>,
    /// Assigns graph ids to persisted entities. Without one, graph ids must
    /// arrive through [`EntityManager::assign_graph_id`].
    pub nodes: Option<Arc<dyn EntityNodeWriter>>,
    pub sink: Arc<dyn BatchSink>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("assigns_graph_ids", &self.nodes.is_some())
            .finish_non_exhaustive()
    }
}

enum Persistence {
    Pool(Arc<PersistenceWorker>),
    Manual(Arc<ManualScheduler>),
}

/// Entry point for ingestion and scanning.
pub struct EntityManager {
    config: EntityManagerConfig,
    stores: Stores,
    resolver: EntityResolver,
    scanner: Arc<CompletionScanner>,
    service: Option<ScanService>,
    persistence: Persistence,
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("config", &self.config)
            .field("background", &self.service.is_some())
            .finish_non_exhaustive()
    }
}

impl EntityManager {
    /// Start with a persistence pool and a background scan service.
    pub fn start(config: EntityManagerConfig, collaborators: Collaborators) -> ManagerResult<Self> {
        config.validate()?;
        let stores = Stores::in_memory(config.partition_count);
        let scanner = Arc::new(Self::build_scanner(&config, &stores, &collaborators));
        let service = ScanService::start(Arc::clone(&scanner), &config.local_nodes(), &config.scan_service());
        let trigger = service.trigger();

        let persister = Arc::new(Persister::new(
            stores.staging.clone(),
            Arc::clone(&collaborators.index),
            collaborators.nodes.clone(),
        ));
        let worker = Arc::new(PersistenceWorker::start(persister, &config.persistence(), Some(trigger.clone())));
        let scheduler: Arc<dyn PersistenceScheduler> = worker.clone();
        let resolver = EntityResolver::new(stores.clone(), Arc::clone(&collaborators.index), scheduler)
            .with_trigger(trigger);

        info!(
            partitions = config.partition_count,
            nodes = ?config.local_nodes(),
            workers = config.persistence_workers,
            "entity manager started"
        );

        Ok(Self {
            config,
            stores,
            resolver,
            scanner,
            service: Some(service),
            persistence: Persistence::Pool(worker),
        })
    }

    /// Start without background threads. Persistence runs when
    /// [`ManualScheduler::run_pending`] is called and scans run on
    /// [`EntityManager::scan`].
    pub fn without_background(
        config: EntityManagerConfig,
        collaborators: Collaborators,
    ) -> ManagerResult<(Self, Arc<ManualScheduler>)> {
        config.validate()?;
        let stores = Stores::in_memory(config.partition_count);
        let scanner = Arc::new(Self::build_scanner(&config, &stores, &collaborators));
        let persister = Arc::new(Persister::new(
            stores.staging.clone(),
            Arc::clone(&collaborators.index),
            collaborators.nodes.clone(),
        ));
        let manual = Arc::new(ManualScheduler::new(persister));
        let scheduler: Arc<dyn PersistenceScheduler> = manual.clone();
        let resolver = EntityResolver::new(stores.clone(), Arc::clone(&collaborators.index), scheduler);

        Ok((
            Self {
                config,
                stores,
                resolver,
                scanner,
                service: None,
                persistence: Persistence::Manual(Arc::clone(&manual)),
            },
            manual,
        ))
    }

    fn build_scanner(config: &EntityManagerConfig, stores: &Stores, collaborators: &Collaborators) -> CompletionScanner {
        CompletionScanner::new(
            stores.clone(),
            config.partition_table(),
            Arc::clone(&collaborators.graph),
            Arc::clone(&collaborators.sink),
        )
        .with_retain_staging(config.retain_staging)
    }

    /// Process one delivered ingestion record. Safe to call again on redelivery.
    pub fn handle(&self, record: &IngestionRecord) -> ManagerResult<IngestOutcome> {
        self.resolver.ingest(record)
    }

    /// Record a graph id assigned outside the pipeline.
    pub fn assign_graph_id(&self, key: &EntityKey, graph_id: GraphId) -> ManagerResult<Assignment> {
        self.resolver.assign_graph_id(key, graph_id)
    }

    /// Run one pass over every local node now.
    pub fn scan(&self) -> ManagerResult<ScanReport> {
        let mut report = ScanReport::default();
        for node in self.config.local_nodes() {
            report.merge(&self.scanner.scan_node(node)?);
        }
        Ok(report)
    }

    /// Wait for queued persistence work. Returns false on timeout.
    ///
    /// With a manual scheduler this runs the pending jobs instead.
    pub fn wait_idle(&self, timeout: Duration) -> ManagerResult<bool> {
        match &self.persistence {
            Persistence::Pool(worker) => Ok(worker.wait_idle(timeout)),
            Persistence::Manual(manual) => {
                manual.run_pending()?;
                Ok(true)
            }
        }
    }

    /// Counters summed over every background pass so far.
    pub fn background_totals(&self) -> ManagerResult<Option<ScanReport>> {
        self.service.as_ref().map(ScanService::totals).transpose()
    }

    #[must_use]
    pub const fn config(&self) -> &EntityManagerConfig {
        &self.config
    }

    #[must_use]
    pub const fn stores(&self) -> &Stores {
        &self.stores
    }

    #[must_use]
    pub const fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    #[must_use]
    pub fn scanner(&self) -> &CompletionScanner {
        &self.scanner
    }
}
