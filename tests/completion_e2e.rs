use std::sync::Arc;

use entity_manager::{
    CacheId, Collaborators, CollectingSink, DatasourceId, DocumentKey, EntityManager, EntityManagerConfig,
    EntityType, GraphId, InMemoryGraph, InMemoryIndex, IngestionId, IngestionRecord, ManualScheduler, Mention,
    RelationMention, TenantId, RELATED_TO,
};

struct Harness {
    manager: EntityManager,
    persistence: Arc<ManualScheduler>,
    index: Arc<InMemoryIndex>,
    graph: Arc<InMemoryGraph>,
    sink: Arc<CollectingSink>,
}

/// Manager with no background threads. `assign_graph_nodes` decides whether
/// persistence also creates entity graph nodes.
fn harness(assign_graph_nodes: bool) -> Harness {
    harness_with(assign_graph_nodes, true)
}

fn harness_with(assign_graph_nodes: bool, retain_staging: bool) -> Harness {
    let index = Arc::new(InMemoryIndex::new());
    let graph = Arc::new(InMemoryGraph::new());
    let sink = Arc::new(CollectingSink::new());
    let config = EntityManagerConfig {
        partition_count: 16,
        retain_staging,
        ..EntityManagerConfig::default()
    };
    let (manager, persistence) = EntityManager::without_background(
        config,
        Collaborators {
            index: index.clone(),
            graph: graph.clone(),
            nodes: if assign_graph_nodes { Some(graph.clone()) } else { None },
            sink: sink.clone(),
        },
    )
    .unwrap();
    Harness {
        manager,
        persistence,
        index,
        graph,
        sink,
    }
}

fn record(ingestion: &str, content: &str, mentions: &[(&str, &str)], relations: &[(usize, usize, &str)]) -> IngestionRecord {
    IngestionRecord {
        tenant_id: TenantId(7),
        ingestion_id: IngestionId::new(ingestion),
        datasource_id: DatasourceId(1),
        content_id: content.into(),
        mentions: mentions.iter().map(|(n, t)| Mention::new(*n, *t)).collect(),
        relations: relations
            .iter()
            .map(|(from, to, label)| RelationMention {
                from: *from,
                to: *to,
                label: (*label).to_string(),
            })
            .collect(),
    }
}

fn doc(content: &str) -> DocumentKey {
    DocumentKey::new(TenantId(7), DatasourceId(1), content)
}

#[test]
fn two_pass_completion() {
    let h = harness(false);
    // A is already canonical; B is new.
    h.index.seed(TenantId(7), "Ada Lovelace", &EntityType::Person).unwrap();

    let outcome = h
        .manager
        .handle(&record("ing-1", "doc-d", &[("Ada Lovelace", "PERSON"), ("Analytical Engine", "PRODUCT")], &[]))
        .unwrap();
    let (a, b) = (outcome.entities[0].key(), outcome.entities[1].key());
    assert!(outcome.entities[0].persistent_id.is_some());
    assert!(outcome.entities[1].persistent_id.is_none());

    // Pass 1: nothing has a graph id yet.
    let report = h.manager.scan().unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(report.committed, 0);
    assert!(h.manager.stores().tracker.snapshot(&doc("doc-d")).unwrap().is_some());

    // B gets its persistent id; a background indexer hands out graph ids.
    h.persistence.run_pending().unwrap();
    h.manager.assign_graph_id(&a, GraphId(1)).unwrap();
    h.manager.assign_graph_id(&b, GraphId(2)).unwrap();

    // Pass 2: 2/2 indexable.
    let report = h.manager.scan().unwrap();
    assert_eq!(report.committed, 1);
    assert!(h.manager.stores().tracker.is_empty().unwrap());

    let doc_node = h
        .graph
        .document_node(TenantId(7), DatasourceId(1), &"doc-d".into())
        .unwrap()
        .unwrap();
    assert_eq!(h.graph.document_nodes().unwrap(), 1);
    assert_eq!(
        h.graph.edges().unwrap(),
        vec![
            (GraphId(1), doc_node, RELATED_TO.to_string()),
            (GraphId(2), doc_node, RELATED_TO.to_string()),
        ]
    );

    let batches = h.sink.batches().unwrap();
    assert_eq!(batches.len(), 1);
    let committed = &batches[0].documents[0];
    assert_eq!(committed.document, doc("doc-d"));
    assert_eq!(committed.graph_id, doc_node);
    assert_eq!(committed.entities.len(), 2);
}

#[test]
fn graph_failure_after_node_insert_retries_without_duplicate_node() {
    let h = harness(true);
    h.manager
        .handle(&record("ing-1", "doc-f", &[("Alice", "PERSON"), ("Bob", "PERSON"), ("Carol", "PERSON")], &[]))
        .unwrap();
    h.persistence.run_pending().unwrap();

    h.graph.fail_edges_after(1).unwrap();
    let report = h.manager.scan().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.graph.document_nodes().unwrap(), 1);
    assert!(h.manager.stores().tracker.snapshot(&doc("doc-f")).unwrap().is_some());
    assert!(h.sink.batches().unwrap().is_empty());

    h.graph.heal().unwrap();
    let report = h.manager.scan().unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(h.graph.document_calls(), 2);
    assert_eq!(h.graph.document_nodes().unwrap(), 1);
    assert_eq!(h.graph.edges().unwrap().len(), 3);
    assert!(h.manager.stores().tracker.is_empty().unwrap());
}

#[test]
fn redelivery_produces_no_duplicate_edges() {
    let h = harness(true);
    let message = record(
        "ing-1",
        "doc-r",
        &[("Alice", "PERSON"), ("Acme", "ORG")],
        &[(0, 1, "works_for")],
    );

    h.manager.handle(&message).unwrap();
    h.persistence.run_pending().unwrap();
    let report = h.manager.scan().unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(report.relations_committed, 1);
    let edges = h.graph.edges().unwrap();
    assert_eq!(edges.len(), 3);

    // Crash-and-redeliver: the same message arrives again, twice.
    h.manager.handle(&message).unwrap();
    h.manager.handle(&message).unwrap();
    h.persistence.run_pending().unwrap();
    let report = h.manager.scan().unwrap();
    assert_eq!(report.committed, 1);

    assert_eq!(h.graph.edges().unwrap(), edges);
    assert_eq!(h.graph.document_nodes().unwrap(), 1);
    assert_eq!(h.index.canonical_count().unwrap(), 2);
    assert_eq!(h.manager.stores().staging.len().unwrap(), 2);
}

#[test]
fn repeated_resolution_tracks_each_entity_once() {
    let h = harness(false);
    let message = record("ing-1", "doc-i", &[("Alice", "PERSON"), ("alice", "person"), (" ALICE ", "per")], &[]);

    for _ in 0..4 {
        h.manager.handle(&message).unwrap();
    }

    let set = h.manager.stores().tracker.snapshot(&doc("doc-i")).unwrap().unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.ingestion_ids.len(), 1);
    assert_eq!(h.manager.stores().staging.len().unwrap(), 1);
}

#[test]
fn cache_id_is_independent_of_arrival_order() {
    let forward = harness(false);
    let backward = harness(false);

    let ab = forward
        .manager
        .handle(&record("ing-1", "doc-o", &[("Alice", "PERSON"), ("Bob", "PERSON")], &[]))
        .unwrap();
    let ba = backward
        .manager
        .handle(&record("ing-1", "doc-o", &[("Bob", "PERSON"), ("Alice", "PERSON")], &[]))
        .unwrap();

    assert_eq!(ab.entities[0].cache_id, ba.entities[1].cache_id);
    assert_eq!(ab.entities[1].cache_id, ba.entities[0].cache_id);
    assert_eq!(
        ab.entities[0].cache_id,
        CacheId::compute(TenantId(7), "alice", &EntityType::Person)
    );
    assert_ne!(
        ab.entities[0].cache_id,
        CacheId::compute(TenantId(8), "alice", &EntityType::Person)
    );
}

#[test]
fn invalid_record_changes_nothing() {
    let h = harness(true);
    let err = h
        .manager
        .handle(&record("ing-1", "doc-x", &[("Alice", "PERSON")], &[(0, 1, "knows")]))
        .unwrap_err();

    assert!(err.is_validation());
    assert!(!err.is_retryable());
    assert!(h.manager.stores().staging.is_empty().unwrap());
    assert!(h.manager.stores().tracker.is_empty().unwrap());
    assert_eq!(h.persistence.pending().unwrap(), 0);
}

#[test]
fn lookup_failure_is_retried_by_redelivery() {
    let h = harness(true);
    let message = record("ing-1", "doc-l", &[("Alice", "PERSON")], &[]);

    h.index.set_unavailable(true);
    let err = h.manager.handle(&message).unwrap_err();
    assert!(err.is_retryable());
    assert!(h.manager.stores().staging.is_empty().unwrap());

    h.index.set_unavailable(false);
    h.manager.handle(&message).unwrap();
    h.persistence.run_pending().unwrap();
    assert_eq!(h.manager.scan().unwrap().committed, 1);
}

#[test]
fn one_batch_two_documents_both_commit_with_eviction() {
    let h = harness_with(false, false);
    let d1 = h
        .manager
        .handle(&record("batch-1", "doc-1", &[("Acme", "ORG")], &[]))
        .unwrap();
    let d2 = h
        .manager
        .handle(&record("batch-1", "doc-2", &[("Acme", "ORG"), ("Slow", "ORG")], &[]))
        .unwrap();
    let (acme, slow) = (d2.entities[0].key(), d2.entities[1].key());
    assert_eq!(d1.entities[0].key(), acme);

    h.persistence.run_pending().unwrap();
    h.manager.assign_graph_id(&acme, GraphId(1)).unwrap();

    let report = h.manager.scan().unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(report.pending, 1);
    assert_eq!(report.evicted, 0);

    h.manager.assign_graph_id(&slow, GraphId(2)).unwrap();
    let report = h.manager.scan().unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(report.evicted, 2);
    assert!(h.manager.stores().tracker.is_empty().unwrap());
    assert!(h.manager.stores().staging.is_empty().unwrap());
    assert_eq!(h.sink.batches().unwrap().len(), 2);
}
