//! Ingestion end to end: entity merging, idempotence, small-group trees,
//! reindex, purge and the external vector backend.

mod common;

use hiergraph::config::VectorBackend;
use hiergraph::engine::model::TreeChildren;
use hiergraph::engine::{Answer, EngineError, GroupId, QueryOptions, RecordKind, Strategy};

use common::{DIM, batch, corpus_batch, engine};

#[tokio::test]
async fn differently_cased_mentions_merge_into_one_entity() {
    let (_temp, engine, _p, _c) = engine();
    let g = GroupId::new("alpha");
    engine
        .ingest(batch("alpha", "press.md", &["Acme Corp builds rockets.", "ACME CORP. hired new engineers."]))
        .await
        .expect("ingest");

    let entities = engine.store().entities_for_group(&g).expect("entities");
    let acme: Vec<_> = entities.iter().filter(|e| e.normalized_name.contains("acme")).collect();
    assert_eq!(acme.len(), 1, "{entities:?}");
    assert_eq!(acme[0].mention_count, 2);
}

#[tokio::test]
async fn reingesting_the_same_batch_changes_nothing() {
    let (_temp, engine, _p, counters) = engine();
    let g = GroupId::new("alpha");
    let first = engine.ingest(corpus_batch("alpha")).await.expect("first ingest");
    assert_eq!(first.chunks_stored, common::corpus().len());
    let entities = engine.store().entities_for_group(&g).expect("entities");
    let relationships = engine.store().relationships_for_group(&g).expect("relationships");
    let extractions = counters.extractions();

    let second = engine.ingest(corpus_batch("alpha")).await.expect("second ingest");
    assert_eq!(second.chunks_stored, 0);
    assert_eq!(second.extraction.chunks_merged, 0);
    assert_eq!(second.extraction.chunks_already_merged, common::corpus().len());

    let mut after = engine.store().entities_for_group(&g).expect("entities");
    let mut before = entities;
    after.sort_by(|a, b| a.id.cmp(&b.id));
    before.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(after, before);
    assert_eq!(engine.store().relationships_for_group(&g).expect("relationships").len(), relationships.len());
    assert_eq!(counters.extractions(), extractions, "extraction ran again");
}

#[tokio::test]
async fn single_chunk_group_gets_one_level_one_node() {
    let (_temp, engine, _p, _c) = engine();
    let g = GroupId::new("solo");
    let report = engine.ingest(batch("solo", "note.md", &["Globex ships printers to Paris."])).await.expect("ingest");
    assert_eq!(report.tree.promoted, 1);

    let chunk = engine.store().chunks_for_group(&g).expect("chunks").remove(0);
    let nodes = engine.store().tree_nodes_for_group(&g).expect("nodes");
    assert_eq!(nodes.len(), 1);
    let node = &nodes[0];
    assert_eq!(node.level, 1);
    assert_eq!(node.children, TreeChildren::Chunks(vec![chunk.id.clone()]));
    assert!(node.parent_node_id.is_none());

    let vectors = engine.index().vectors(RecordKind::TreeNode, &g).await.expect("vectors");
    assert_eq!(vectors.get(&node.id).map(Vec::len), Some(DIM));
}

#[tokio::test]
async fn empty_batches_are_rejected() {
    let (_temp, engine, _p, _c) = engine();
    let err = engine.ingest(batch("alpha", "doc", &["   ", ""])).await.expect_err("empty");
    assert!(matches!(err, EngineError::InvalidInput(_)));
    let err = engine.ingest(batch("alpha", "", &["text"])).await.expect_err("no document");
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn reindex_rebuilds_derived_records() {
    let (_temp, engine, _p, _c) = engine();
    let g = GroupId::new("alpha");
    engine.ingest(corpus_batch("alpha")).await.expect("ingest");
    let stats = engine.stats(&g).await.expect("stats");
    let old_nodes: Vec<String> =
        engine.store().tree_nodes_for_group(&g).expect("nodes").into_iter().map(|n| n.id).collect();

    let report = engine.reindex(&g).await.expect("reindex");
    assert_eq!(report.extraction.chunks_merged, 0);
    assert_eq!(report.entities_reembedded, stats.entities);
    assert!(report.tree.nodes > 0);
    assert!(report.communities.communities > 0);

    let after = engine.stats(&g).await.expect("stats");
    assert_eq!(after.entities, stats.entities);
    assert_eq!(after.chunks, stats.chunks);
    let new_nodes = engine.store().tree_nodes_for_group(&g).expect("nodes");
    assert!(new_nodes.iter().all(|n| !old_nodes.contains(&n.id)), "old build still visible");
}

#[tokio::test]
async fn purge_removes_only_that_group() {
    let (_temp, engine, _p, _c) = engine();
    let alpha = GroupId::new("alpha");
    let beta = GroupId::new("beta");
    engine.ingest(corpus_batch("alpha")).await.expect("ingest alpha");
    engine.ingest(corpus_batch("beta")).await.expect("ingest beta");
    let beta_before = engine.stats(&beta).await.expect("stats");

    engine.purge(&alpha).await.expect("purge");
    let gone = engine.stats(&alpha).await.expect("stats");
    assert_eq!(
        gone.chunks + gone.entities + gone.relationships + gone.communities + gone.tree_nodes + gone.vectors,
        0
    );
    assert_eq!(engine.stats(&beta).await.expect("stats"), beta_before);

    let options = QueryOptions { strategy: Strategy::Iterative, ..QueryOptions::default() };
    let response = engine.query(&alpha, "Who leads the Berlin team at Acme Corp?", &options).await.expect("query");
    assert_eq!(response.answer, Answer::NoAnswerAvailable);
}

#[tokio::test]
async fn external_backend_indexes_and_answers() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let mut cfg = common::config(temp.path());
    cfg.index.backend = VectorBackend::External;
    cfg.index.external_path = temp.path().join("ext-vectors.db");
    let engine = common::open_with(&cfg, common::scripted(Default::default(), Default::default()));
    let g = GroupId::new("alpha");

    engine.ingest(corpus_batch("alpha")).await.expect("ingest");
    assert!(cfg.index.external_path.exists());
    let entities = engine.store().entities_for_group(&g).expect("entities");
    assert_eq!(engine.index().vector_count(RecordKind::Entity, &g).await.expect("count"), entities.len());
    // the embedded table stays empty with an external backend
    assert_eq!(engine.store().vector_count(RecordKind::Entity, &g).expect("count"), 0);

    let options = QueryOptions { strategy: Strategy::Flat, ..QueryOptions::default() };
    let response = engine.query(&g, "Acme Corp Berlin", &options).await.expect("query");
    assert_eq!(response.answer, Answer::Text("Flat answer.".into()));
    assert!(!response.provenance.is_empty());

    engine.purge(&g).await.expect("purge");
    assert_eq!(engine.index().vector_count(RecordKind::Entity, &g).await.expect("count"), 0);
}
