use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use entity_manager::{
    Collaborators, CollectingSink, CompletionScanner, DatasourceId, DocumentKey, EntityManager, EntityManagerConfig,
    EntityResolver, EntityType, InMemoryGraph, InMemoryIndex, IngestionId, IngestionRecord, ManualScheduler, Mention,
    PartitionTable, Persister, Stores, TenantId,
};

#[test]
fn concurrent_mentions_converge_to_one_staging_record() {
    const THREADS: usize = 8;

    let stores = Stores::in_memory(32);
    let index = Arc::new(InMemoryIndex::new());
    let graph = Arc::new(InMemoryGraph::new());
    let sink = Arc::new(CollectingSink::new());
    let persistence = Arc::new(ManualScheduler::new(Arc::new(Persister::new(
        stores.staging.clone(),
        index.clone(),
        Some(graph.clone()),
    ))));
    let resolver = Arc::new(EntityResolver::new(stores.clone(), index.clone(), persistence.clone()));

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let resolver = Arc::clone(&resolver);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let document = DocumentKey::new(TenantId(1), DatasourceId(1), format!("doc-{i}"));
                barrier.wait();
                resolver
                    .resolve(&document, &IngestionId::new(format!("ing-{i}")), "Alice", &EntityType::Person)
                    .unwrap()
            })
        })
        .collect();

    let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let tmp_ids: HashSet<_> = resolved.iter().map(|e| e.tmp_id).collect();
    assert_eq!(tmp_ids.len(), 1, "every caller must see the same staging record");
    assert_eq!(stores.staging.len().unwrap(), 1);

    persistence.run_pending().unwrap();
    assert_eq!(index.canonical_count().unwrap(), 1);

    let scanner = CompletionScanner::new(stores.clone(), PartitionTable::new(32, 1), graph.clone(), sink.clone());
    let report = scanner.scan_all().unwrap();
    assert_eq!(report.committed, THREADS);

    // Every document links to the same Alice node.
    let batches = sink.batches().unwrap();
    let alice_nodes: HashSet<_> = batches
        .iter()
        .flat_map(|b| &b.documents)
        .flat_map(|d| &d.entities)
        .map(|e| e.graph_id)
        .collect();
    assert_eq!(alice_nodes.len(), 1);
    assert_eq!(graph.document_nodes().unwrap(), THREADS);
    assert_eq!(graph.edges().unwrap().len(), THREADS);
}

#[test]
fn concurrent_adds_never_lose_a_tracked_entity() {
    let stores = Stores::in_memory(8);
    let document = DocumentKey::new(TenantId(1), DatasourceId(1), "shared");
    let names: Vec<String> = (0..200).map(|i| format!("entity-{i}")).collect();

    thread::scope(|s| {
        for chunk in names.chunks(25) {
            let stores = &stores;
            let document = &document;
            s.spawn(move || {
                for name in chunk {
                    let cache_id = entity_manager::CacheId::compute(TenantId(1), name, &EntityType::Concept);
                    stores.tracker.track(document, cache_id, &IngestionId::new("ing")).unwrap();
                }
            });
        }
    });

    let set = stores.tracker.snapshot(&document).unwrap().unwrap();
    assert_eq!(set.len(), 200);
}

#[test]
fn background_pipeline_commits_every_document() {
    let graph = Arc::new(InMemoryGraph::new());
    let sink = Arc::new(CollectingSink::new());
    let config = EntityManagerConfig {
        partition_count: 16,
        node_count: 2,
        scan_interval_ms: 20,
        persistence_workers: 4,
        ..EntityManagerConfig::default()
    };
    let manager = EntityManager::start(
        config,
        Collaborators {
            index: Arc::new(InMemoryIndex::new()),
            graph: graph.clone(),
            nodes: Some(graph.clone()),
            sink: sink.clone(),
        },
    )
    .unwrap();

    let people = ["Alice", "Bob", "Carol", "Dave"];
    for i in 0..20 {
        let record = IngestionRecord {
            tenant_id: TenantId(1),
            ingestion_id: IngestionId::new(format!("ing-{i}")),
            datasource_id: DatasourceId(9),
            content_id: format!("doc-{i}").into(),
            mentions: vec![
                Mention::new(people[i % people.len()], "PERSON"),
                Mention::new(people[(i + 1) % people.len()], "PERSON"),
            ],
            relations: Vec::new(),
        };
        manager.handle(&record).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while !manager.stores().tracker.is_empty().unwrap() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(manager.stores().tracker.is_empty().unwrap());
    drop(manager);

    let committed: usize = sink.batches().unwrap().iter().map(|b| b.documents.len()).sum();
    assert_eq!(committed, 20);
    assert_eq!(graph.document_nodes().unwrap(), 20);
    assert_eq!(graph.edges().unwrap().len(), 40);
}
