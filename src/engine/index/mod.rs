//! `VectorIndexProvider`: the only way records become queryable.
//!
//! Every write passes the embedding gate first: a record whose embedding is
//! null, of the wrong dimension, or non-finite is rejected with
//! `EmbeddingMissing` before anything is stored. The backend is fixed at
//! construction:
//!
//! - **Embedded**: vectors live in the graph store and are written in the
//!   same transaction as the record content.
//! - **External**: vectors live in a separate store. Content is still
//!   mirrored into the graph store; vectors are written first, and if the
//!   content write fails they are deleted again, so a write lands in both
//!   stores or in neither.

pub mod external;

use std::collections::{HashMap, HashSet};

use tracing::{debug, error, warn};

use crate::config::{IndexConfig, VectorBackend};

use super::error::EngineError;
use super::model::{Community, GroupId, IndexRecord, RecordKind, VectorHit};
use super::store::{GraphStore, embedding_defect, rank_hits};

pub use external::ExternalVectorStore;

#[derive(Debug, Clone)]
enum Backend {
    Embedded,
    External(ExternalVectorStore),
}

#[derive(Debug, Clone)]
pub struct VectorIndexProvider {
    store: GraphStore,
    dimension: usize,
    backend: Backend,
}

impl VectorIndexProvider {
    pub fn new(
        store: GraphStore,
        dimension: usize,
        config: &IndexConfig,
    ) -> Result<Self, EngineError> {
        let backend = match config.backend {
            VectorBackend::Embedded => Backend::Embedded,
            VectorBackend::External => {
                Backend::External(ExternalVectorStore::open(&config.external_path)?)
            }
        };
        Ok(Self { store: store.with_dimension(dimension), dimension, backend })
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn backend(&self) -> VectorBackend {
        match self.backend {
            Backend::Embedded => VectorBackend::Embedded,
            Backend::External(_) => VectorBackend::External,
        }
    }

    fn gate(&self, kind: RecordKind, id: &str, embedding: Option<&[f32]>) -> Result<(), EngineError> {
        if let Some(reason) = embedding_defect(embedding, self.dimension) {
            error!(%kind, record_id = id, %reason, "index write rejected");
            return Err(EngineError::EmbeddingMissing { kind, record_id: id.to_string(), reason });
        }
        Ok(())
    }

    pub async fn write(&self, record: IndexRecord) -> Result<(), EngineError> {
        self.write_many(vec![record]).await
    }

    /// Gate every record, then write them all. Nothing is written if any
    /// record fails the gate.
    pub async fn write_many(&self, records: Vec<IndexRecord>) -> Result<(), EngineError> {
        if records.is_empty() {
            return Ok(());
        }
        for r in &records {
            self.gate(r.kind(), r.id(), r.embedding())?;
        }
        debug!(records = records.len(), "index write");

        match &self.backend {
            Backend::Embedded => {
                self.store.run("index write", move |s| s.write_records(&records, true)).await
            }
            Backend::External(ext) => {
                let ext = ext.clone();
                self.store
                    .run("index write", move |s| {
                        let mut by_kind: HashMap<(RecordKind, GroupId), Vec<(&str, &[f32])>> =
                            HashMap::new();
                        for r in &records {
                            if let Some(e) = r.embedding() {
                                by_kind
                                    .entry((r.kind(), r.group_id().clone()))
                                    .or_default()
                                    .push((r.id(), e));
                            }
                        }
                        let mut undo = Vec::new();
                        for ((kind, group), rows) in &by_kind {
                            match ext.put_many(*kind, group, rows) {
                                Ok(replaced) => undo.extend(replaced),
                                Err(e) => {
                                    ext.restore(&undo)?;
                                    return Err(e);
                                }
                            }
                        }
                        if let Err(e) = s.write_records(&records, false) {
                            warn!(error = %e, "content mirror failed; restoring previous vectors");
                            ext.restore(&undo)?;
                            return Err(e);
                        }
                        Ok(())
                    })
                    .await
            }
        }
    }

    /// Cosine top-`k` of `kind` within `group`, skipping ids in `exclude`.
    pub async fn query(
        &self,
        group: &GroupId,
        embedding: &[f32],
        k: usize,
        kind: RecordKind,
        level: Option<u32>,
        exclude: &HashSet<String>,
    ) -> Result<Vec<VectorHit>, EngineError> {
        if embedding.len() != self.dimension {
            return Err(EngineError::InvalidInput(format!(
                "query embedding has dimension {}, index expects {}",
                embedding.len(),
                self.dimension
            )));
        }
        let group = group.clone();
        let embedding = embedding.to_vec();
        let exclude = exclude.clone();
        match &self.backend {
            Backend::Embedded => {
                self.store
                    .run("vector query", move |s| {
                        s.vector_query(kind, &group, &embedding, k, level, &exclude)
                    })
                    .await
            }
            Backend::External(ext) => {
                let ext = ext.clone();
                self.store
                    .run("vector query", move |s| {
                        let visible = s.visible_records(kind, &group, level)?;
                        let vectors = ext.vectors_for(kind, &group)?;
                        rank_hits(kind, &group, &embedding, k, visible, vectors, &exclude)
                    })
                    .await
            }
        }
    }

    /// Stored vectors of `kind` for the group, keyed by record id.
    pub async fn vectors(
        &self,
        kind: RecordKind,
        group: &GroupId,
    ) -> Result<HashMap<String, Vec<f32>>, EngineError> {
        let group = group.clone();
        let ext = match &self.backend {
            Backend::Embedded => None,
            Backend::External(ext) => Some(ext.clone()),
        };
        self.store
            .run("load vectors", move |s| {
                let rows = match ext {
                    None => s.vectors_for(kind, &group)?,
                    Some(ext) => ext.vectors_for(kind, &group)?,
                };
                Ok(rows.into_iter().map(|v| (v.record_id, v.embedding)).collect())
            })
            .await
    }

    pub async fn vector_count(&self, kind: RecordKind, group: &GroupId) -> Result<usize, EngineError> {
        let group = group.clone();
        let ext = match &self.backend {
            Backend::Embedded => None,
            Backend::External(ext) => Some(ext.clone()),
        };
        self.store
            .run("count vectors", move |s| match ext {
                None => s.vector_count(kind, &group),
                Some(ext) => ext.count(kind, &group),
            })
            .await
    }

    /// Gate and atomically publish a new community forest for the group.
    pub async fn publish_communities(
        &self,
        group: &GroupId,
        generation: &str,
        communities: Vec<Community>,
    ) -> Result<(), EngineError> {
        for c in &communities {
            self.gate(RecordKind::Community, &c.id, c.embedding.as_deref())?;
        }
        let group = group.clone();
        let generation = generation.to_string();
        match &self.backend {
            Backend::Embedded => {
                self.store
                    .run("publish communities", move |s| {
                        s.publish_communities(&group, &generation, &communities, true).map(|_| ())
                    })
                    .await
            }
            Backend::External(ext) => {
                let ext = ext.clone();
                self.store
                    .run("publish communities", move |s| {
                        let rows: Vec<(&str, &[f32])> = communities
                            .iter()
                            .filter_map(|c| c.embedding.as_deref().map(|e| (c.id.as_str(), e)))
                            .collect();
                        let undo = ext.put_many(RecordKind::Community, &group, &rows)?;
                        match s.publish_communities(&group, &generation, &communities, false) {
                            Ok(replaced) => ext.delete(RecordKind::Community, &replaced),
                            Err(e) => {
                                ext.restore(&undo)?;
                                Err(e)
                            }
                        }
                    })
                    .await
            }
        }
    }

    /// Make a finished tree build visible and drop older builds' vectors.
    pub async fn activate_tree_build(
        &self,
        group: &GroupId,
        build_id: &str,
    ) -> Result<(), EngineError> {
        let group = group.clone();
        let build_id = build_id.to_string();
        let ext = match &self.backend {
            Backend::Embedded => None,
            Backend::External(ext) => Some(ext.clone()),
        };
        self.store
            .run("activate tree build", move |s| {
                let dropped = s.activate_tree_build(&group, &build_id)?;
                if let Some(ext) = ext {
                    ext.delete(RecordKind::TreeNode, &dropped)?;
                }
                Ok(())
            })
            .await
    }

    /// Remove the group from the graph store and the vector backend.
    pub async fn purge(&self, group: &GroupId) -> Result<(), EngineError> {
        let group = group.clone();
        let ext = match &self.backend {
            Backend::Embedded => None,
            Backend::External(ext) => Some(ext.clone()),
        };
        self.store
            .run("purge group", move |s| {
                s.delete_group(&group)?;
                if let Some(ext) = ext {
                    ext.delete_group(&group)?;
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{Entity, TextChunk, TreeChildren, TreeNode};
    use std::path::Path;
    use tempfile::TempDir;

    fn provider(dir: &Path, backend: VectorBackend) -> VectorIndexProvider {
        let store = GraphStore::open(&dir.join("graph.db")).unwrap();
        let cfg = IndexConfig { backend, external_path: dir.join("vectors.db") };
        VectorIndexProvider::new(store, 3, &cfg).unwrap()
    }

    fn node(id: &str, embedding: Option<Vec<f32>>) -> IndexRecord {
        IndexRecord::TreeNode {
            node: TreeNode {
                id: id.into(),
                group_id: GroupId::from("g"),
                level: 1,
                text: "summary".into(),
                embedding,
                children: TreeChildren::Chunks(vec!["c".into()]),
                parent_node_id: None,
            },
            build_id: "b".into(),
        }
    }

    #[tokio::test]
    async fn gate_rejects_null_and_wrong_dimension() {
        for backend in [VectorBackend::Embedded, VectorBackend::External] {
            let tmp = TempDir::new().unwrap();
            let idx = provider(tmp.path(), backend);
            let g = GroupId::from("g");
            let err = idx.write(node("n1", None)).await.unwrap_err();
            assert!(matches!(err, EngineError::EmbeddingMissing { .. }));
            let err = idx.write(node("n2", Some(vec![1.0, 2.0]))).await.unwrap_err();
            assert!(matches!(err, EngineError::EmbeddingMissing { .. }));
            idx.activate_tree_build(&g, "b").await.unwrap();
            assert_eq!(idx.store().record_count(RecordKind::TreeNode, &g).unwrap(), 0);
            assert_eq!(idx.vector_count(RecordKind::TreeNode, &g).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn one_bad_record_blocks_the_batch() {
        let tmp = TempDir::new().unwrap();
        let idx = provider(tmp.path(), VectorBackend::Embedded);
        let g = GroupId::from("g");
        let batch = vec![node("ok", Some(vec![1.0, 0.0, 0.0])), node("bad", None)];
        assert!(idx.write_many(batch).await.is_err());
        idx.activate_tree_build(&g, "b").await.unwrap();
        assert_eq!(idx.store().record_count(RecordKind::TreeNode, &g).unwrap(), 0);
    }

    #[tokio::test]
    async fn external_backend_mirrors_content() {
        let tmp = TempDir::new().unwrap();
        let idx = provider(tmp.path(), VectorBackend::External);
        let g = GroupId::from("g");
        let mut chunk = TextChunk::new(&g, "doc", 0, "acme builds rockets".into());
        chunk.embedding = Some(vec![0.0, 1.0, 0.0]);
        idx.write(IndexRecord::Chunk(chunk.clone())).await.unwrap();

        assert_eq!(idx.store().vector_count(RecordKind::Chunk, &g).unwrap(), 0);
        assert_eq!(idx.vector_count(RecordKind::Chunk, &g).await.unwrap(), 1);
        let hits = idx
            .query(&g, &[0.0, 1.0, 0.0], 5, RecordKind::Chunk, None, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, chunk.id);
        assert_eq!(hits[0].text, "acme builds rockets");
    }

    #[tokio::test]
    async fn failed_mirror_keeps_previous_external_vectors() {
        let tmp = TempDir::new().unwrap();
        let idx = provider(tmp.path(), VectorBackend::External);
        let g = GroupId::from("g");
        let entity = Entity {
            id: Entity::id_for(&g, "acme", "org"),
            group_id: g.clone(),
            name: "Acme".into(),
            normalized_name: "acme".into(),
            entity_type: "org".into(),
            description: String::new(),
            mention_count: 1,
        };
        let record = |embedding: Vec<f32>| IndexRecord::Entity {
            entity: entity.clone(),
            embedding: Some(embedding),
        };
        idx.write(record(vec![1.0, 0.0, 0.0])).await.unwrap();

        // the tree node mirror fails, so the whole batch must roll back
        rusqlite::Connection::open(tmp.path().join("graph.db"))
            .unwrap()
            .execute_batch("DROP TABLE tree_nodes")
            .unwrap();
        let batch = vec![record(vec![0.0, 1.0, 0.0]), node("n1", Some(vec![0.0, 0.0, 1.0]))];
        assert!(idx.write_many(batch).await.is_err());

        let entities = idx.vectors(RecordKind::Entity, &g).await.unwrap();
        assert_eq!(entities.get(&entity.id), Some(&vec![1.0, 0.0, 0.0]));
        assert_eq!(idx.vector_count(RecordKind::TreeNode, &g).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn entity_vectors_make_entities_queryable() {
        let tmp = TempDir::new().unwrap();
        let idx = provider(tmp.path(), VectorBackend::Embedded);
        let g = GroupId::from("g");
        let entity = Entity {
            id: Entity::id_for(&g, "acme", "org"),
            group_id: g.clone(),
            name: "Acme".into(),
            normalized_name: "acme".into(),
            entity_type: "org".into(),
            description: "a firm".into(),
            mention_count: 1,
        };
        idx.store().upsert_entity(&entity).unwrap();
        let q = [1.0, 0.0, 0.0];
        let none = HashSet::new();
        assert!(matches!(
            idx.query(&g, &q, 3, RecordKind::Entity, None, &none).await,
            Err(EngineError::EmbeddingMissing { .. })
        ));
        idx.write(IndexRecord::Entity { entity, embedding: Some(q.to_vec()) }).await.unwrap();
        let hits = idx.query(&g, &q, 3, RecordKind::Entity, None, &none).await.unwrap();
        assert_eq!(hits[0].text, "Acme (org): a firm");
    }

    #[tokio::test]
    async fn query_rejects_wrong_dimension() {
        let tmp = TempDir::new().unwrap();
        let idx = provider(tmp.path(), VectorBackend::Embedded);
        let err = idx
            .query(&GroupId::from("g"), &[1.0], 3, RecordKind::Chunk, None, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
