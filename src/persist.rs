//! Asynchronous persistence of staging entities.
//!
//! A staging record created without a persistent id (or without a graph id)
//! gets a [`PersistJob`]. The job obtains the canonical id from the index
//! (create-or-get), writes the searchable document, optionally asks the
//! [`EntityNodeWriter`] for a graph node, and writes the ids back into staging.
//! Every step is idempotent, so a job may run more than once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::entity::EntityType;
use crate::error::{ManagerError, ManagerResult};
use crate::external::{CanonicalIndex, EntityFields, EntityNodeWriter};
use crate::key::EntityKey;
use crate::scanner::ScanTrigger;
use crate::staging::{Assignment, StagingEntity, StagingStore};

/// One unit of persistence work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistJob {
    pub key: EntityKey,
    pub name: String,
    pub entity_type: EntityType,
}

impl PersistJob {
    #[must_use]
    pub fn for_entity(entity: &StagingEntity) -> Self {
        Self {
            key: entity.key(),
            name: entity.name.clone(),
            entity_type: entity.entity_type.clone(),
        }
    }
}

/// Accepts persistence jobs from the resolver.
pub trait PersistenceScheduler: Send + Sync {
    /// Enqueue a job. Must not block on the job itself.
    fn schedule(&self, job: PersistJob) -> ManagerResult<()>;

    /// Whether jobs also create the entity's graph node. When false, graph
    /// ids arrive from outside and a job only ever fills the persistent id.
    fn assigns_graph_ids(&self) -> bool;
}

/// Runs one job to completion against staging and the collaborators.
pub struct Persister {
    staging: StagingStore,
    index: Arc<dyn CanonicalIndex>,
    nodes: Option<Arc<dyn EntityNodeWriter>>,
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister")
            .field("staging", &self.staging)
            .field("assigns_graph_ids", &self.assigns_graph_ids())
            .finish_non_exhaustive()
    }
}

impl Persister {
    #[must_use]
    pub fn new(
        staging: StagingStore,
        index: Arc<dyn CanonicalIndex>,
        nodes: Option<Arc<dyn EntityNodeWriter>>,
    ) -> Self {
        Self { staging, index, nodes }
    }

    #[must_use]
    pub fn assigns_graph_ids(&self) -> bool {
        self.nodes.is_some()
    }

    /// Persist one entity. Returns the staging record afterwards, or `None`
    /// if the record no longer exists.
    pub fn persist(&self, job: &PersistJob) -> ManagerResult<Option<StagingEntity>> {
        let Some(current) = self.staging.get(&job.key)? else {
            debug!(cache_id = ?job.key.entity_id, "staging record gone; dropping persist job");
            return Ok(None);
        };

        let mut current = match current.persistent_id {
            Some(_) => current,
            None => {
                let persistent_id = self
                    .index
                    .create_canonical(job.key.tenant_id, &job.name, &job.entity_type)
                    .map_err(ManagerError::lookup)?;
                let fields = EntityFields {
                    tenant_id: job.key.tenant_id,
                    cache_id: job.key.entity_id,
                    name: job.name.clone(),
                    entity_type: job.entity_type.clone(),
                };
                self.index
                    .index_entity(persistent_id, &fields)
                    .map_err(ManagerError::lookup)?;
                match self.staging.assign_persistent_id(&job.key, persistent_id)? {
                    Assignment::Missing => return Ok(None),
                    other => other
                        .entity()
                        .cloned()
                        .ok_or_else(|| ManagerError::internal("assignment without record"))?,
                }
            }
        };

        if current.graph_id.is_none() {
            if let (Some(nodes), Some(persistent_id)) = (&self.nodes, current.persistent_id) {
                let graph_id = nodes
                    .insert_entity_node(job.key.tenant_id, persistent_id, &current.name, &current.entity_type)
                    .map_err(ManagerError::graph)?;
                current = match self.staging.assign_graph_id(&job.key, graph_id)? {
                    Assignment::Missing => return Ok(None),
                    other => other
                        .entity()
                        .cloned()
                        .ok_or_else(|| ManagerError::internal("assignment without record"))?,
                };
            }
        }

        Ok(Some(current))
    }

    /// Persist with retries for retryable failures.
    fn persist_with_retry(&self, job: &PersistJob, attempts: usize) -> ManagerResult<Option<StagingEntity>> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.persist(job) {
                Ok(out) => return Ok(out),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    debug!(cache_id = ?job.key.entity_id, attempt, error = %err, "persist failed; retrying");
                    thread::sleep(Duration::from_millis(10 * attempt as u64));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Persistence pool configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum queued jobs.
    pub queue_capacity: usize,
    /// Attempts per job for retryable failures.
    pub attempts: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1024,
            attempts: 3,
        }
    }
}

/// Bounded pool of persistence threads.
///
/// Jobs that still fail after their retries are logged and dropped; the next
/// resolution of the same entity schedules them again.
pub struct PersistenceWorker {
    tx: Option<Sender<PersistJob>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
    in_flight: Arc<AtomicUsize>,
    assigns_graph_ids: bool,
}

impl std::fmt::Debug for PersistenceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWorker")
            .field("workers", &self.workers.len())
            .field("queue_capacity", &self.queue_capacity)
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl PersistenceWorker {
    /// Start the pool. `trigger` is nudged after every job that made progress.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be spawned.
    #[must_use]
    pub fn start(persister: Arc<Persister>, config: &PersistenceConfig, trigger: Option<ScanTrigger>) -> Self {
        let workers = config.workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let attempts = config.attempts;
        let (tx, rx) = bounded::<PersistJob>(queue_capacity);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let assigns_graph_ids = persister.assigns_graph_ids();

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<PersistJob> = rx.clone();
            let persister = Arc::clone(&persister);
            let in_flight = Arc::clone(&in_flight);
            let trigger = trigger.clone();
            let handle = thread::Builder::new()
                .name(format!("entity-persist-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        match persister.persist_with_retry(&job, attempts) {
                            Ok(Some(entity)) => {
                                debug!(cache_id = ?entity.cache_id, indexable = entity.is_indexable(), "persisted");
                                if let Some(trigger) = &trigger {
                                    trigger.nudge();
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                warn!(cache_id = ?job.key.entity_id, error = %err, "persist job dropped");
                            }
                        }
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    }
                })
                .expect("failed to spawn persistence worker");
            handles.push(handle);
        }

        Self {
            tx: Some(tx),
            workers: handles,
            queue_capacity,
            in_flight,
            assigns_graph_ids,
        }
    }

    /// Jobs queued or running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no job is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl PersistenceScheduler for PersistenceWorker {
    fn schedule(&self, job: PersistJob) -> ManagerResult<()> {
        let Some(tx) = &self.tx else {
            return Err(ManagerError::Disconnected {
                path: "persist".to_string(),
            });
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(match err {
                    TrySendError::Full(_) => ManagerError::QueueFull {
                        path: "persist".to_string(),
                        capacity: self.queue_capacity,
                    },
                    TrySendError::Disconnected(_) => ManagerError::Disconnected {
                        path: "persist".to_string(),
                    },
                })
            }
        }
    }

    fn assigns_graph_ids(&self) -> bool {
        self.assigns_graph_ids
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        // Close the channel: workers drain queued jobs then exit.
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Scheduler that holds jobs until [`ManualScheduler::run_pending`] is called.
///
/// Makes resolution and persistence interleavings reproducible.
#[derive(Debug)]
pub struct ManualScheduler {
    persister: Arc<Persister>,
    jobs: Mutex<VecDeque<PersistJob>>,
}

impl ManualScheduler {
    #[must_use]
    pub fn new(persister: Arc<Persister>) -> Self {
        Self {
            persister,
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of jobs waiting.
    pub fn pending(&self) -> ManagerResult<usize> {
        Ok(self.lock()?.len())
    }

    /// Run every queued job once, in order. Stops at the first failure; the
    /// failed job and everything after it stay queued.
    pub fn run_pending(&self) -> ManagerResult<usize> {
        let mut ran = 0;
        loop {
            let Some(job) = self.lock()?.pop_front() else {
                return Ok(ran);
            };
            if let Err(err) = self.persister.persist(&job) {
                self.lock()?.push_front(job);
                return Err(err);
            }
            ran += 1;
        }
    }

    fn lock(&self) -> ManagerResult<std::sync::MutexGuard<'_, VecDeque<PersistJob>>> {
        self.jobs
            .lock()
            .map_err(|_| ManagerError::internal("manual scheduler lock poisoned"))
    }
}

impl PersistenceScheduler for ManualScheduler {
    fn schedule(&self, job: PersistJob) -> ManagerResult<()> {
        self.lock()?.push_back(job);
        Ok(())
    }

    fn assigns_graph_ids(&self) -> bool {
        self.persister.assigns_graph_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::entity::{IngestionId, PersistentId, TenantId};
    use crate::error::CollaboratorError;
    use crate::external::{InMemoryGraph, InMemoryIndex};

    fn staged(staging: &StagingStore, name: &str) -> StagingEntity {
        let e = StagingEntity::new(TenantId(1), IngestionId::new("i1"), name, EntityType::Person);
        staging.insert_if_absent(e).unwrap().0
    }

    #[test]
    fn persist_assigns_both_ids_with_node_writer() {
        let staging = StagingStore::in_memory(8);
        let index = Arc::new(InMemoryIndex::new());
        let graph = Arc::new(InMemoryGraph::new());
        let persister = Persister::new(staging.clone(), index.clone(), Some(graph));

        let e = staged(&staging, "Alice");
        let out = persister.persist(&PersistJob::for_entity(&e)).unwrap().unwrap();
        assert!(out.is_indexable());
        let persistent_id = out.persistent_id.unwrap();
        assert_eq!(index.indexed(persistent_id).unwrap().unwrap().name, "Alice");

        // Second run is a no-op.
        let again = persister.persist(&PersistJob::for_entity(&e)).unwrap().unwrap();
        assert_eq!(again, out);
        assert_eq!(index.creates(), 1);
    }

    #[test]
    fn persist_without_node_writer_leaves_graph_id_empty() {
        let staging = StagingStore::in_memory(8);
        let persister = Persister::new(staging.clone(), Arc::new(InMemoryIndex::new()), None);
        let e = staged(&staging, "Bob");

        let out = persister.persist(&PersistJob::for_entity(&e)).unwrap().unwrap();
        assert!(out.persistent_id.is_some());
        assert!(out.graph_id.is_none());
    }

    #[test]
    fn persist_keeps_known_persistent_id() {
        let staging = StagingStore::in_memory(8);
        let index = Arc::new(InMemoryIndex::new());
        let persister = Persister::new(staging.clone(), index.clone(), Some(Arc::new(InMemoryGraph::new())));
        let e = StagingEntity::new(TenantId(1), IngestionId::new("i1"), "Carol", EntityType::Person)
            .with_persistent_id(PersistentId(42));
        staging.insert_if_absent(e.clone()).unwrap();

        let out = persister.persist(&PersistJob::for_entity(&e)).unwrap().unwrap();
        assert_eq!(out.persistent_id, Some(PersistentId(42)));
        assert!(out.graph_id.is_some());
        assert_eq!(index.creates(), 0);
    }

    #[test]
    fn persist_on_missing_record_is_dropped() {
        let staging = StagingStore::in_memory(8);
        let persister = Persister::new(staging.clone(), Arc::new(InMemoryIndex::new()), None);
        let e = StagingEntity::new(TenantId(1), IngestionId::new("i1"), "Ghost", EntityType::Person);
        assert!(persister.persist(&PersistJob::for_entity(&e)).unwrap().is_none());
        assert!(staging.is_empty().unwrap());
    }

    #[test]
    fn index_failure_is_a_lookup_failure() {
        let staging = StagingStore::in_memory(8);
        let index = Arc::new(InMemoryIndex::new());
        index.set_unavailable(true);
        let persister = Persister::new(staging.clone(), index, None);
        let e = staged(&staging, "Dave");

        let err = persister.persist(&PersistJob::for_entity(&e)).unwrap_err();
        assert!(matches!(
            err,
            ManagerError::LookupFailure {
                source: CollaboratorError::Unavailable(_)
            }
        ));
        assert!(staging.get(&e.key()).unwrap().unwrap().persistent_id.is_none());
    }

    #[test]
    fn manual_scheduler_keeps_failed_job_queued() {
        let staging = StagingStore::in_memory(8);
        let index = Arc::new(InMemoryIndex::new());
        let scheduler = ManualScheduler::new(Arc::new(Persister::new(staging.clone(), index.clone(), None)));
        let e = staged(&staging, "Erin");
        scheduler.schedule(PersistJob::for_entity(&e)).unwrap();

        index.set_unavailable(true);
        assert!(scheduler.run_pending().is_err());
        assert_eq!(scheduler.pending().unwrap(), 1);

        index.set_unavailable(false);
        assert_eq!(scheduler.run_pending().unwrap(), 1);
        assert_eq!(scheduler.pending().unwrap(), 0);
    }

    #[test]
    fn worker_pool_persists_and_nudges() {
        let staging = StagingStore::in_memory(8);
        let persister = Arc::new(Persister::new(
            staging.clone(),
            Arc::new(InMemoryIndex::new()),
            Some(Arc::new(InMemoryGraph::new())),
        ));
        let (trigger, nudges) = ScanTrigger::channel(16);
        let worker = PersistenceWorker::start(persister, &PersistenceConfig::default(), Some(trigger));

        let keys: Vec<_> = ["A", "B", "C"]
            .iter()
            .map(|n| {
                let e = staged(&staging, n);
                worker.schedule(PersistJob::for_entity(&e)).unwrap();
                e.key()
            })
            .collect();

        assert!(worker.wait_idle(Duration::from_secs(5)));
        assert_eq!(staging.indexable(&keys).unwrap().len(), 3);
        assert!(nudges.try_recv().is_ok());
    }

    #[test]
    fn full_queue_is_queue_full() {
        let staging = StagingStore::in_memory(8);
        let index = Arc::new(InMemoryIndex::new());
        // Failing jobs back off between attempts, which keeps the single worker busy.
        index.set_unavailable(true);
        let persister = Arc::new(Persister::new(staging.clone(), index, None));
        let config = PersistenceConfig {
            workers: 1,
            queue_capacity: 1,
            attempts: 3,
        };
        let worker = PersistenceWorker::start(persister, &config, None);

        let e = staged(&staging, "F");
        let mut saw_full = false;
        for _ in 0..10 {
            if let Err(err) = worker.schedule(PersistJob::for_entity(&e)) {
                assert!(matches!(err, ManagerError::QueueFull { capacity: 1, .. }));
                assert!(err.is_retryable());
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);
    }
}
