//! Index-wide guarantees: the embedding write gate, group isolation,
//! community forest shape and summary-tree completeness.

mod common;

use std::collections::{HashMap, HashSet};

use hiergraph::engine::model::{Entity, IndexRecord, TreeChildren, TreeNode};
use hiergraph::engine::{EngineError, GroupId, QueryOptions, RecordKind, Strategy};

use common::{DIM, batch, corpus_batch, engine};

// ── Embedding gate ────────────────────────────────────────────────────────────

#[tokio::test]
async fn tree_node_without_embedding_is_rejected_and_nothing_changes() {
    let (_temp, engine, _p, _c) = engine();
    let g = GroupId::new("alpha");
    engine.ingest(batch("alpha", "doc", &["Acme Corp builds rockets."])).await.expect("ingest");

    let store = engine.store();
    let nodes_before = store.record_count(RecordKind::TreeNode, &g).expect("count");
    let vectors_before = engine.index().vector_count(RecordKind::TreeNode, &g).await.expect("vectors");

    let node = TreeNode {
        id: "orphan-node".into(),
        group_id: g.clone(),
        level: 1,
        text: "no vector".into(),
        embedding: None,
        children: TreeChildren::Chunks(vec![]),
        parent_node_id: None,
    };
    let err = engine
        .index()
        .write(IndexRecord::TreeNode { node, build_id: "manual".into() })
        .await
        .expect_err("gate must reject");
    assert!(matches!(err, EngineError::EmbeddingMissing { kind: RecordKind::TreeNode, .. }), "{err}");

    assert_eq!(store.record_count(RecordKind::TreeNode, &g).expect("count"), nodes_before);
    assert_eq!(engine.index().vector_count(RecordKind::TreeNode, &g).await.expect("vectors"), vectors_before);
    assert!(store.get_by_id(RecordKind::TreeNode, "orphan-node", None).expect("get").is_none());
}

#[tokio::test]
async fn batch_with_one_bad_vector_writes_nothing() {
    let (_temp, engine, _p, _c) = engine();
    let g = GroupId::new("alpha");
    let entity = |name: &str| Entity {
        id: Entity::id_for(&g, name, "thing"),
        group_id: g.clone(),
        name: name.into(),
        normalized_name: name.into(),
        entity_type: "thing".into(),
        description: String::new(),
        mention_count: 1,
    };
    let good = IndexRecord::Entity { entity: entity("good"), embedding: Some(vec![0.1; DIM]) };
    let short = IndexRecord::Entity { entity: entity("short"), embedding: Some(vec![0.1; DIM - 1]) };

    let err = engine.index().write_many(vec![good, short]).await.expect_err("gate must reject");
    assert!(matches!(err, EngineError::EmbeddingMissing { kind: RecordKind::Entity, .. }), "{err}");
    assert_eq!(engine.store().record_count(RecordKind::Entity, &g).expect("count"), 0);
    assert_eq!(engine.index().vector_count(RecordKind::Entity, &g).await.expect("vectors"), 0);
}

#[tokio::test]
async fn every_entity_and_tree_node_carries_a_full_vector() {
    let (_temp, engine, _p, _c) = engine();
    let g = GroupId::new("alpha");
    engine.ingest(corpus_batch("alpha")).await.expect("ingest");

    let store = engine.store();
    for (kind, ids) in [
        (
            RecordKind::Entity,
            store.entities_for_group(&g).expect("entities").into_iter().map(|e| e.id).collect::<Vec<_>>(),
        ),
        (
            RecordKind::TreeNode,
            store.tree_nodes_for_group(&g).expect("nodes").into_iter().map(|n| n.id).collect(),
        ),
    ] {
        assert!(!ids.is_empty(), "no {kind} records");
        let vectors = engine.index().vectors(kind, &g).await.expect("vectors");
        for id in ids {
            let v = vectors.get(&id).unwrap_or_else(|| panic!("{kind} {id} has no vector"));
            assert_eq!(v.len(), DIM);
        }
    }
}

// ── Isolation ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn queries_never_return_another_groups_records() {
    let (_temp, engine, _p, _c) = engine();
    let alpha = GroupId::new("alpha");
    engine
        .ingest(batch("alpha", "a.md", &["Globex runs a factory in Paris.", "Initech sells printers in Paris."]))
        .await
        .expect("ingest alpha");
    engine.ingest(corpus_batch("beta")).await.expect("ingest beta");

    for strategy in [Strategy::Flat, Strategy::Community, Strategy::Iterative] {
        let options = QueryOptions { strategy, ..QueryOptions::default() };
        let response = engine
            .query(&alpha, "Where did Acme Corp open an office with Jane Doe?", &options)
            .await
            .expect("query");
        for p in &response.provenance {
            let record = engine
                .store()
                .get_by_id(p.kind, &p.id, Some(&alpha))
                .expect("provenance record must belong to alpha");
            assert!(record.is_some(), "{} {} missing", p.kind, p.id);
        }
    }
}

#[tokio::test]
async fn cross_group_lookup_raises_isolation_violation() {
    let (_temp, engine, _p, _c) = engine();
    engine.ingest(batch("beta", "b.md", &["Acme Corp builds rockets."])).await.expect("ingest");
    let chunk = engine.store().chunks_for_group(&GroupId::new("beta")).expect("chunks").remove(0);

    let err = engine
        .store()
        .get_by_id(RecordKind::Chunk, &chunk.id, Some(&GroupId::new("alpha")))
        .expect_err("foreign record");
    assert!(matches!(err, EngineError::GroupIsolationViolation { .. }), "{err}");
}

#[tokio::test]
async fn separators_in_ids_keep_groups_apart() {
    let (_temp, engine, _p, _c) = engine();
    let first = engine.ingest(batch("a|b", "c", &["Globex ships printers to Paris."])).await.expect("ingest a|b");
    let second = engine.ingest(batch("a", "b|c", &["Initech sells staplers in Tokyo."])).await.expect("ingest a");
    assert_eq!(first.chunks_stored, 1);
    assert_eq!(second.chunks_stored, 1);

    let left = engine.store().chunks_for_group(&GroupId::new("a|b")).expect("chunks");
    let right = engine.store().chunks_for_group(&GroupId::new("a")).expect("chunks");
    assert_eq!(left.len(), 1);
    assert_eq!(right.len(), 1);
    assert_ne!(left[0].id, right[0].id);
    assert!(right[0].text.contains("Initech"));
    assert!(engine.store().get_by_id(RecordKind::Chunk, &right[0].id, Some(&GroupId::new("a"))).expect("get").is_some());
}

// ── Purge ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn purge_racing_ingest_never_leaves_orphans() {
    for delay in 0..4 {
        let (_temp, engine, _p, _c) = engine();
        let g = GroupId::new("alpha");
        let (ingested, purged) = tokio::join!(engine.ingest(corpus_batch("alpha")), async {
            for _ in 0..delay {
                tokio::task::yield_now().await;
            }
            engine.purge(&g).await
        });
        ingested.expect("ingest");
        purged.expect("purge");

        let stats = engine.stats(&g).await.expect("stats");
        if stats.chunks == 0 {
            assert_eq!(
                (stats.entities, stats.relationships, stats.communities, stats.tree_nodes, stats.vectors),
                (0, 0, 0, 0, 0),
                "purged group still has derived records (delay {delay})"
            );
        } else {
            // the purge ran first; the ingest must then be complete
            assert_eq!(stats.chunks, common::corpus().len());
            assert!(stats.tree_nodes > 0 && stats.communities > 0);
            let vectors = engine.index().vectors(RecordKind::Entity, &g).await.expect("vectors");
            assert_eq!(vectors.len(), stats.entities);
        }
    }
}

// ── Community forest ──────────────────────────────────────────────────────────

#[tokio::test]
async fn communities_form_a_forest() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let mut cfg = common::config(temp.path());
    cfg.communities.max_cluster_size = 2;
    let engine = common::open_with(&cfg, common::scripted(Default::default(), Default::default()));
    let g = GroupId::new("alpha");
    engine.ingest(corpus_batch("alpha")).await.expect("ingest");

    let communities = engine.store().communities_for_group(&g).expect("communities");
    assert!(!communities.is_empty());
    let by_id: HashMap<&str, _> = communities.iter().map(|c| (c.id.as_str(), c)).collect();

    for c in &communities {
        match &c.parent_community_id {
            None => assert_eq!(c.level, 0, "root {} not at level 0", c.id),
            Some(parent) => {
                let p = by_id.get(parent.as_str()).expect("parent present");
                assert_eq!(p.level + 1, c.level);
                let members: HashSet<&String> = p.entity_ids.iter().collect();
                assert!(c.entity_ids.iter().all(|e| members.contains(e)));
            }
        }
        // walking up must reach a root within `level` steps
        let mut cur = c;
        for _ in 0..c.level {
            let parent = cur.parent_community_id.as_deref().expect("non-root has parent");
            cur = by_id[parent];
        }
        assert!(cur.parent_community_id.is_none());
    }

    // every entity sits in exactly one root
    let entities = engine.store().entities_for_group(&g).expect("entities");
    let mut rooted: Vec<&String> =
        communities.iter().filter(|c| c.level == 0).flat_map(|c| &c.entity_ids).collect();
    rooted.sort();
    let before = rooted.len();
    rooted.dedup();
    assert_eq!(before, rooted.len());
    assert_eq!(rooted.len(), entities.len());
}

// ── Summary tree ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn every_chunk_is_reachable_from_the_root() {
    let (_temp, engine, _p, _c) = engine();
    let g = GroupId::new("alpha");
    let chunks: Vec<String> = (0..20)
        .map(|i| format!("Passage {i}: Globex shipped order {i} to Paris on day {}.", i * 3))
        .collect();
    let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
    engine.ingest(batch("alpha", "orders.md", &refs)).await.expect("ingest");

    let nodes = engine.store().tree_nodes_for_group(&g).expect("nodes");
    let roots: Vec<_> = nodes.iter().filter(|n| n.parent_node_id.is_none()).collect();
    assert_eq!(roots.len(), 1, "expected a single root");
    let by_id: HashMap<&str, &TreeNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    let mut reached = HashSet::new();
    let mut stack = vec![roots[0]];
    while let Some(node) = stack.pop() {
        match &node.children {
            TreeChildren::Chunks(ids) => reached.extend(ids.iter().cloned()),
            TreeChildren::Nodes(ids) => {
                for id in ids {
                    let child = by_id.get(id.as_str()).expect("child node present");
                    assert_eq!(child.level + 1, node.level);
                    stack.push(child);
                }
            }
        }
    }
    let all: HashSet<String> =
        engine.store().chunks_for_group(&g).expect("chunks").into_iter().map(|c| c.id).collect();
    assert_eq!(reached, all);
}
