//! `GraphStore`: the durable graph and the embedded vector index.
//!
//! One SQLite file holds every group's chunks, entities, relationships,
//! communities and tree nodes. All methods are synchronous and open their own
//! connection, so a store handle is just a path and is cheap to clone; async
//! callers go through [`GraphStore::run`], which moves the work onto the
//! blocking pool.
//!
//! Group scoping is part of every statement: reads take the group as a bound
//! parameter, and anything that looks a record up by id alone re-checks the
//! group before returning it.

mod codec;
mod schema;

pub(crate) use codec::{cosine_similarity, decode_embedding, embedding_defect, encode_embedding};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use tracing::{debug, warn};

use super::error::EngineError;
use super::model::{
    Community, Entity, EntityMention, ExtractionOutcome, GroupId, GroupStats, IndexRecord,
    RecordKind, Relationship, RelationshipMention, TextChunk, TreeNode, VectorHit, normalize_name,
    normalize_type,
};

// ── Records ───────────────────────────────────────────────────────────────────

/// Any record `get_by_id` can return.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRecord {
    Chunk(TextChunk),
    Entity(Entity),
    Community(Community),
    TreeNode(TreeNode),
}

impl StoredRecord {
    pub fn group_id(&self) -> &GroupId {
        match self {
            StoredRecord::Chunk(r) => &r.group_id,
            StoredRecord::Entity(r) => &r.group_id,
            StoredRecord::Community(r) => &r.group_id,
            StoredRecord::TreeNode(r) => &r.group_id,
        }
    }
}

/// A record currently visible to queries, with the text a hit resolves to.
#[derive(Debug, Clone)]
pub(crate) struct VisibleRecord {
    pub id: String,
    pub group_id: String,
    pub text: String,
    pub level: Option<u32>,
}

#[derive(Debug, Clone)]
pub(crate) struct StoredVector {
    pub record_id: String,
    pub group_id: String,
    pub embedding: Vec<f32>,
}

fn db(ctx: &'static str) -> impl Fn(rusqlite::Error) -> EngineError {
    move |e| EngineError::Storage(format!("graph_store: {ctx}: {e}"))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, EngineError> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::Storage(format!("graph_store: encode json: {e}")))
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── Row mapping ───────────────────────────────────────────────────────────────

const CHUNK_COLS: &str = "id, group_id, text, document_id, sequence_index";
const ENTITY_COLS: &str =
    "id, group_id, name, normalized_name, entity_type, description, mention_count";
const REL_COLS: &str =
    "id, group_id, source_entity_id, target_entity_id, descriptions, weight";
const COMMUNITY_COLS: &str =
    "c.id, c.group_id, c.level, c.entity_ids, c.parent_id, c.summary, c.rank";
const NODE_COLS: &str = "t.id, t.group_id, t.level, t.text, t.children, t.parent_node_id";

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<TextChunk> {
    Ok(TextChunk {
        id: row.get(0)?,
        group_id: GroupId::new(row.get::<_, String>(1)?),
        text: row.get(2)?,
        source_document_id: row.get(3)?,
        sequence_index: row.get(4)?,
        embedding: None,
    })
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        group_id: GroupId::new(row.get::<_, String>(1)?),
        name: row.get(2)?,
        normalized_name: row.get(3)?,
        entity_type: row.get(4)?,
        description: row.get(5)?,
        mention_count: row.get(6)?,
    })
}

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    Ok(Relationship {
        id: row.get(0)?,
        group_id: GroupId::new(row.get::<_, String>(1)?),
        source_entity_id: row.get(2)?,
        target_entity_id: row.get(3)?,
        descriptions: json_col(row, 4)?,
        weight: row.get(5)?,
    })
}

fn community_from_row(row: &Row<'_>) -> rusqlite::Result<Community> {
    Ok(Community {
        id: row.get(0)?,
        group_id: GroupId::new(row.get::<_, String>(1)?),
        level: row.get(2)?,
        entity_ids: json_col(row, 3)?,
        parent_community_id: row.get(4)?,
        summary: row.get(5)?,
        rank: row.get(6)?,
        embedding: None,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<TreeNode> {
    Ok(TreeNode {
        id: row.get(0)?,
        group_id: GroupId::new(row.get::<_, String>(1)?),
        level: row.get(2)?,
        text: row.get(3)?,
        embedding: None,
        children: json_col(row, 4)?,
        parent_node_id: row.get(5)?,
    })
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GraphStore {
    db_path: PathBuf,
    /// Vector dimension every embedded write must have, once known.
    dimension: Option<usize>,
}

impl GraphStore {
    /// Open (creating if needed) the store at `db_path` and migrate the schema.
    pub fn open(db_path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Storage(format!("graph_store: create {}: {e}", parent.display()))
            })?;
        }
        let conn = schema::open_conn(db_path)?;
        schema::init_db(&conn)?;
        Ok(Self { db_path: db_path.to_path_buf(), dimension: None })
    }

    /// Pin the vector dimension; embedded writes of any other length fail.
    pub(crate) fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<Connection, EngineError> {
        schema::open_conn(&self.db_path)
    }

    /// Run `f` against this store on the blocking pool.
    pub async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&GraphStore) -> Result<T, EngineError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| EngineError::Storage(format!("graph_store: {op} join: {e}")))?
    }

    // ── Chunks ────────────────────────────────────────────────────────────────

    /// Insert chunks that are not stored yet. Returns how many were new.
    pub fn upsert_text_chunks(&self, chunks: &[TextChunk]) -> Result<usize, EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin chunk upsert"))?;
        let now = now_iso8601();
        let mut inserted = 0;
        for c in chunks {
            inserted += insert_chunk(&tx, c, &now)?;
        }
        tx.commit().map_err(db("commit chunk upsert"))?;
        Ok(inserted)
    }

    pub fn upsert_text_chunk(&self, chunk: &TextChunk) -> Result<bool, EngineError> {
        Ok(self.upsert_text_chunks(std::slice::from_ref(chunk))? == 1)
    }

    pub fn chunks_for_group(&self, group: &GroupId) -> Result<Vec<TextChunk>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHUNK_COLS} FROM chunks WHERE group_id = ?1
                 ORDER BY document_id, sequence_index"
            ))
            .map_err(db("prepare chunks_for_group"))?;
        let rows = stmt
            .query_map(params![group.as_str()], chunk_from_row)
            .map_err(db("query chunks_for_group"))?;
        rows.collect::<Result<_, _>>().map_err(db("read chunk row"))
    }

    pub(crate) fn has_chunk(&self, group: &GroupId, chunk_id: &str) -> Result<bool, EngineError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM chunks WHERE group_id = ?1 AND id = ?2)",
            params![group.as_str(), chunk_id],
            |r| r.get(0),
        )
        .map_err(db("check chunk"))
    }

    // ── Entities and relationships ────────────────────────────────────────────

    /// Merge `entity` into the group's entity with the same normalized name
    /// and type: mention counts add up and new descriptions are appended.
    pub(crate) fn upsert_entity(&self, entity: &Entity) -> Result<Entity, EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin entity upsert"))?;
        let merged = merge_entity_tx(&tx, entity.clone())?;
        tx.commit().map_err(db("commit entity upsert"))?;
        Ok(merged)
    }

    /// Merge `rel` into the existing edge for the same (source, target) pair:
    /// weights add up and descriptions are appended up to `max_descriptions`.
    pub(crate) fn upsert_relationship(
        &self,
        rel: &Relationship,
        max_descriptions: usize,
    ) -> Result<Relationship, EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin relationship upsert"))?;
        let merged = merge_relationship_tx(&tx, rel.clone(), max_descriptions)?;
        tx.commit().map_err(db("commit relationship upsert"))?;
        Ok(merged)
    }

    /// Merge one chunk's extraction into the graph in a single transaction.
    ///
    /// Returns `None` when the chunk was already merged, which makes
    /// re-ingesting the same batch a no-op. Relationship endpoints resolve
    /// against this chunk's entities first, then any group entity with the
    /// same normalized name; the rest are skipped.
    pub fn upsert_extraction(
        &self,
        group: &GroupId,
        chunk_id: &str,
        entities: &[EntityMention],
        relationships: &[RelationshipMention],
        max_descriptions: usize,
    ) -> Result<Option<ExtractionOutcome>, EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin extraction merge"))?;

        let seen: Option<String> = tx
            .query_row(
                "SELECT chunk_id FROM extractions WHERE group_id = ?1 AND chunk_id = ?2",
                params![group.as_str(), chunk_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db("read extraction ledger"))?;
        if seen.is_some() {
            debug!(group_id = %group, chunk_id, "chunk already merged; skipping");
            return Ok(None);
        }

        let mut outcome = ExtractionOutcome::default();
        // normalized name -> entity id, for endpoints mentioned in this chunk
        let mut local: HashMap<String, String> = HashMap::new();
        let mut counted: HashSet<String> = HashSet::new();

        for m in entities {
            let normalized = normalize_name(&m.name);
            if normalized.is_empty() {
                continue;
            }
            let entity_type = normalize_type(&m.entity_type);
            let id = Entity::id_for(group, &normalized, &entity_type);
            let candidate = Entity {
                id: id.clone(),
                group_id: group.clone(),
                name: m.name.trim().to_string(),
                normalized_name: normalized.clone(),
                entity_type,
                description: m.description.trim().to_string(),
                // one mention per chunk, however often the completion repeats it
                mention_count: u32::from(counted.insert(id.clone())),
            };
            let merged = merge_entity_tx(&tx, candidate)?;
            local.entry(normalized).or_insert_with(|| id.clone());
            if let Some(pos) = outcome.entities.iter().position(|e| e.id == merged.id) {
                outcome.entities[pos] = merged;
            } else {
                outcome.entities.push(merged);
            }
        }

        for r in relationships {
            let source = resolve_endpoint(&tx, group, &local, &r.source)?;
            let target = resolve_endpoint(&tx, group, &local, &r.target)?;
            let (Some(source), Some(target)) = (source, target) else {
                warn!(
                    group_id = %group,
                    chunk_id,
                    source = %r.source,
                    target = %r.target,
                    "relationship endpoint not found; skipping"
                );
                outcome.unresolved += 1;
                continue;
            };
            if source == target {
                continue;
            }
            let description = r.description.trim();
            let rel = Relationship {
                id: Relationship::id_for(group, &source, &target),
                group_id: group.clone(),
                source_entity_id: source,
                target_entity_id: target,
                descriptions: if description.is_empty() {
                    Vec::new()
                } else {
                    vec![description.to_string()]
                },
                weight: 1.0,
            };
            merge_relationship_tx(&tx, rel, max_descriptions)?;
            outcome.relationships += 1;
        }

        tx.execute(
            "INSERT INTO extractions (group_id, chunk_id, processed_at) VALUES (?1, ?2, ?3)",
            params![group.as_str(), chunk_id, now_iso8601()],
        )
        .map_err(db("write extraction ledger"))?;
        tx.commit().map_err(db("commit extraction merge"))?;
        Ok(Some(outcome))
    }

    /// Chunk ids of the group already present in the extraction ledger.
    pub fn extracted_chunk_ids(&self, group: &GroupId) -> Result<HashSet<String>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT chunk_id FROM extractions WHERE group_id = ?1")
            .map_err(db("prepare extraction ledger scan"))?;
        let rows = stmt
            .query_map(params![group.as_str()], |r| r.get::<_, String>(0))
            .map_err(db("scan extraction ledger"))?;
        rows.collect::<Result<_, _>>().map_err(db("read extraction ledger row"))
    }

    pub fn entities_for_group(&self, group: &GroupId) -> Result<Vec<Entity>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTITY_COLS} FROM entities WHERE group_id = ?1 ORDER BY id"
            ))
            .map_err(db("prepare entities_for_group"))?;
        let rows = stmt
            .query_map(params![group.as_str()], entity_from_row)
            .map_err(db("query entities_for_group"))?;
        rows.collect::<Result<_, _>>().map_err(db("read entity row"))
    }

    pub fn relationships_for_group(
        &self,
        group: &GroupId,
    ) -> Result<Vec<Relationship>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {REL_COLS} FROM relationships WHERE group_id = ?1 ORDER BY id"
            ))
            .map_err(db("prepare relationships_for_group"))?;
        let rows = stmt
            .query_map(params![group.as_str()], relationship_from_row)
            .map_err(db("query relationships_for_group"))?;
        rows.collect::<Result<_, _>>().map_err(db("read relationship row"))
    }

    // ── Communities ───────────────────────────────────────────────────────────

    /// Write one community into `generation`. It stays invisible until that
    /// generation is published.
    pub(crate) fn upsert_community(
        &self,
        community: &Community,
        generation: &str,
    ) -> Result<(), EngineError> {
        let conn = self.conn()?;
        insert_community(&conn, community, generation)
    }

    /// Replace the group's community forest atomically.
    ///
    /// Writes every community (and, when `with_vectors`, its embedding into
    /// the embedded index) under a fresh generation, flips the generation
    /// pointer and deletes the previous generation, all in one transaction.
    /// Returns the ids of the communities that were replaced.
    pub(crate) fn publish_communities(
        &self,
        group: &GroupId,
        generation: &str,
        communities: &[Community],
        with_vectors: bool,
    ) -> Result<Vec<String>, EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin community publish"))?;

        for c in communities {
            if c.group_id != *group {
                return Err(EngineError::GroupIsolationViolation {
                    expected: group.to_string(),
                    found: c.group_id.to_string(),
                    record_id: c.id.clone(),
                });
            }
            insert_community(&tx, c, generation)?;
            if with_vectors {
                let embedding = self.checked(RecordKind::Community, &c.id, c.embedding.as_deref())?;
                put_vector_tx(&tx, RecordKind::Community, &c.id, group, embedding)?;
            }
        }

        let replaced = ids_where(
            &tx,
            "SELECT id FROM communities WHERE group_id = ?1 AND generation != ?2",
            group,
            generation,
        )?;
        tx.execute(
            "INSERT INTO community_generations (group_id, generation) VALUES (?1, ?2)
             ON CONFLICT(group_id) DO UPDATE SET generation = excluded.generation",
            params![group.as_str(), generation],
        )
        .map_err(db("flip community generation"))?;
        tx.execute(
            "DELETE FROM communities WHERE group_id = ?1 AND generation != ?2",
            params![group.as_str(), generation],
        )
        .map_err(db("delete old communities"))?;
        delete_vectors_tx(&tx, RecordKind::Community, &replaced)?;

        tx.commit().map_err(db("commit community publish"))?;
        Ok(replaced)
    }

    /// Communities of the published generation, ordered by level.
    pub fn communities_for_group(&self, group: &GroupId) -> Result<Vec<Community>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COMMUNITY_COLS} FROM communities c
                 JOIN community_generations g
                   ON g.group_id = c.group_id AND g.generation = c.generation
                 WHERE c.group_id = ?1
                 ORDER BY c.level, c.id"
            ))
            .map_err(db("prepare communities_for_group"))?;
        let rows = stmt
            .query_map(params![group.as_str()], community_from_row)
            .map_err(db("query communities_for_group"))?;
        rows.collect::<Result<_, _>>().map_err(db("read community row"))
    }

    // ── Tree nodes ────────────────────────────────────────────────────────────

    /// Write one node of tree build `build_id` together with its embedding
    /// in the embedded index.
    pub(crate) fn upsert_tree_node(&self, node: &TreeNode, build_id: &str) -> Result<(), EngineError> {
        let embedding = self.checked(RecordKind::TreeNode, &node.id, node.embedding.as_deref())?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin tree node upsert"))?;
        insert_tree_node(&tx, node, build_id)?;
        put_vector_tx(&tx, RecordKind::TreeNode, &node.id, &node.group_id, embedding)?;
        tx.commit().map_err(db("commit tree node upsert"))
    }

    /// Set `parent_node_id` for each `(child, parent)` pair of one group.
    pub(crate) fn set_tree_parents(
        &self,
        group: &GroupId,
        links: &[(String, String)],
    ) -> Result<(), EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin parent links"))?;
        for (child, parent) in links {
            tx.execute(
                "UPDATE tree_nodes SET parent_node_id = ?1 WHERE id = ?2 AND group_id = ?3",
                params![parent, child, group.as_str()],
            )
            .map_err(db("set parent link"))?;
        }
        tx.commit().map_err(db("commit parent links"))
    }

    /// Make `build_id` the group's visible tree and drop every other build.
    /// Returns the ids of the dropped nodes.
    pub(crate) fn activate_tree_build(
        &self,
        group: &GroupId,
        build_id: &str,
    ) -> Result<Vec<String>, EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin tree activation"))?;
        let dropped = ids_where(
            &tx,
            "SELECT id FROM tree_nodes WHERE group_id = ?1 AND build_id != ?2",
            group,
            build_id,
        )?;
        tx.execute(
            "INSERT INTO tree_builds (group_id, build_id) VALUES (?1, ?2)
             ON CONFLICT(group_id) DO UPDATE SET build_id = excluded.build_id",
            params![group.as_str(), build_id],
        )
        .map_err(db("flip tree build"))?;
        tx.execute(
            "DELETE FROM tree_nodes WHERE group_id = ?1 AND build_id != ?2",
            params![group.as_str(), build_id],
        )
        .map_err(db("delete old tree nodes"))?;
        delete_vectors_tx(&tx, RecordKind::TreeNode, &dropped)?;
        tx.commit().map_err(db("commit tree activation"))?;
        Ok(dropped)
    }

    /// Nodes of the active tree build, ordered by level.
    pub fn tree_nodes_for_group(&self, group: &GroupId) -> Result<Vec<TreeNode>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {NODE_COLS} FROM tree_nodes t
                 JOIN tree_builds b ON b.group_id = t.group_id AND b.build_id = t.build_id
                 WHERE t.group_id = ?1
                 ORDER BY t.level, t.id"
            ))
            .map_err(db("prepare tree_nodes_for_group"))?;
        let rows = stmt
            .query_map(params![group.as_str()], node_from_row)
            .map_err(db("query tree_nodes_for_group"))?;
        rows.collect::<Result<_, _>>().map_err(db("read tree node row"))
    }

    pub fn max_tree_level(&self, group: &GroupId) -> Result<Option<u32>, EngineError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT MAX(t.level) FROM tree_nodes t
             JOIN tree_builds b ON b.group_id = t.group_id AND b.build_id = t.build_id
             WHERE t.group_id = ?1",
            params![group.as_str()],
            |r| r.get(0),
        )
        .map_err(db("read max tree level"))
    }

    // ── Embedded vectors ──────────────────────────────────────────────────────

    /// Mirror index records' content into the graph, and with `with_vectors`
    /// their embeddings into the embedded index, in one transaction.
    /// Chunks and entities that already exist keep their stored content.
    pub(crate) fn write_records(
        &self,
        records: &[IndexRecord],
        with_vectors: bool,
    ) -> Result<(), EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin index write"))?;
        let now = now_iso8601();
        for r in records {
            match r {
                IndexRecord::Chunk(c) => {
                    insert_chunk(&tx, c, &now)?;
                }
                IndexRecord::Entity { entity: e, .. } => {
                    tx.execute(
                        &format!(
                            "INSERT OR IGNORE INTO entities ({ENTITY_COLS})
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                        ),
                        params![
                            e.id,
                            e.group_id.as_str(),
                            e.name,
                            e.normalized_name,
                            e.entity_type,
                            e.description,
                            e.mention_count
                        ],
                    )
                    .map_err(db("mirror entity"))?;
                }
                IndexRecord::TreeNode { node, build_id } => insert_tree_node(&tx, node, build_id)?,
            }
            if with_vectors {
                let embedding = self.checked(r.kind(), r.id(), r.embedding())?;
                put_vector_tx(&tx, r.kind(), r.id(), r.group_id(), embedding)?;
            }
        }
        tx.commit().map_err(db("commit index write"))
    }

    pub(crate) fn put_vector(
        &self,
        kind: RecordKind,
        record_id: &str,
        group: &GroupId,
        embedding: &[f32],
    ) -> Result<(), EngineError> {
        let embedding = self.checked(kind, record_id, Some(embedding))?;
        let conn = self.conn()?;
        put_vector_tx(&conn, kind, record_id, group, embedding)
    }

    /// The embedding, if it is fit for the embedded index. Without a pinned
    /// dimension only emptiness and non-finite values are rejected.
    fn checked<'a>(
        &self,
        kind: RecordKind,
        record_id: &str,
        embedding: Option<&'a [f32]>,
    ) -> Result<&'a [f32], EngineError> {
        let dimension = match (self.dimension, embedding) {
            (Some(d), _) => d,
            (None, Some(v)) if !v.is_empty() => v.len(),
            _ => 1,
        };
        match (embedding_defect(embedding, dimension), embedding) {
            (None, Some(v)) => Ok(v),
            (reason, _) => Err(EngineError::EmbeddingMissing {
                kind,
                record_id: record_id.to_string(),
                reason: reason.unwrap_or_else(|| "embedding is null".into()),
            }),
        }
    }

    pub(crate) fn vectors_for(
        &self,
        kind: RecordKind,
        group: &GroupId,
    ) -> Result<Vec<StoredVector>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT record_id, group_id, dimension, embedding FROM vectors
                 WHERE kind = ?1 AND group_id = ?2",
            )
            .map_err(db("prepare vectors_for"))?;
        let rows = stmt
            .query_map(params![kind.as_str(), group.as_str()], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(db("query vectors_for"))?;
        let mut out = Vec::new();
        for row in rows {
            let (record_id, group_id, dimension, blob) = row.map_err(db("read vector row"))?;
            let embedding = decode_embedding(&blob, dimension.max(0) as usize)?;
            out.push(StoredVector { record_id, group_id, embedding });
        }
        Ok(out)
    }

    /// Records of `kind` that a query may currently see, with hit text.
    /// `level` narrows communities and tree nodes.
    pub(crate) fn visible_records(
        &self,
        kind: RecordKind,
        group: &GroupId,
        level: Option<u32>,
    ) -> Result<Vec<VisibleRecord>, EngineError> {
        let conn = self.conn()?;
        let sql = match kind {
            RecordKind::Chunk => {
                "SELECT id, group_id, text, NULL FROM chunks
                 WHERE group_id = ?1 AND (?2 IS NULL OR ?2 = 0)"
            }
            RecordKind::Entity => {
                "SELECT id, group_id,
                        name || ' (' || entity_type || '): ' || description, NULL
                 FROM entities WHERE group_id = ?1 AND (?2 IS NULL OR ?2 = 0)"
            }
            RecordKind::Community => {
                "SELECT c.id, c.group_id, c.summary, c.level FROM communities c
                 JOIN community_generations g
                   ON g.group_id = c.group_id AND g.generation = c.generation
                 WHERE c.group_id = ?1 AND (?2 IS NULL OR c.level = ?2)"
            }
            RecordKind::TreeNode => {
                "SELECT t.id, t.group_id, t.text, t.level FROM tree_nodes t
                 JOIN tree_builds b ON b.group_id = t.group_id AND b.build_id = t.build_id
                 WHERE t.group_id = ?1 AND (?2 IS NULL OR t.level = ?2)"
            }
        };
        let mut stmt = conn.prepare(sql).map_err(db("prepare visible_records"))?;
        let rows = stmt
            .query_map(params![group.as_str(), level], |r| {
                Ok(VisibleRecord {
                    id: r.get(0)?,
                    group_id: r.get(1)?,
                    text: r.get(2)?,
                    level: r.get(3)?,
                })
            })
            .map_err(db("query visible_records"))?;
        rows.collect::<Result<_, _>>().map_err(db("read visible record"))
    }

    /// Cosine-ranked search over the embedded index.
    ///
    /// Fails with `IndexNotReady` when the group has no visible records of
    /// `kind`, and with `EmbeddingMissing` when it has records but none of
    /// them is embedded. Records in `exclude` are skipped.
    pub fn vector_query(
        &self,
        kind: RecordKind,
        group: &GroupId,
        query: &[f32],
        k: usize,
        level: Option<u32>,
        exclude: &HashSet<String>,
    ) -> Result<Vec<VectorHit>, EngineError> {
        let visible = self.visible_records(kind, group, level)?;
        let vectors = self.vectors_for(kind, group)?;
        rank_hits(kind, group, query, k, visible, vectors, exclude)
    }

    // ── Lookup and counts ─────────────────────────────────────────────────────

    /// Fetch one visible record by id. When `group` is given and the record
    /// belongs elsewhere this is a `GroupIsolationViolation`, not a miss.
    pub fn get_by_id(
        &self,
        kind: RecordKind,
        id: &str,
        group: Option<&GroupId>,
    ) -> Result<Option<StoredRecord>, EngineError> {
        let conn = self.conn()?;
        let found = match kind {
            RecordKind::Chunk => conn
                .query_row(
                    &format!("SELECT {CHUNK_COLS} FROM chunks WHERE id = ?1"),
                    params![id],
                    chunk_from_row,
                )
                .optional()
                .map(|r| r.map(StoredRecord::Chunk)),
            RecordKind::Entity => conn
                .query_row(
                    &format!("SELECT {ENTITY_COLS} FROM entities WHERE id = ?1"),
                    params![id],
                    entity_from_row,
                )
                .optional()
                .map(|r| r.map(StoredRecord::Entity)),
            RecordKind::Community => conn
                .query_row(
                    &format!(
                        "SELECT {COMMUNITY_COLS} FROM communities c
                         JOIN community_generations g
                           ON g.group_id = c.group_id AND g.generation = c.generation
                         WHERE c.id = ?1"
                    ),
                    params![id],
                    community_from_row,
                )
                .optional()
                .map(|r| r.map(StoredRecord::Community)),
            RecordKind::TreeNode => conn
                .query_row(
                    &format!(
                        "SELECT {NODE_COLS} FROM tree_nodes t
                         JOIN tree_builds b
                           ON b.group_id = t.group_id AND b.build_id = t.build_id
                         WHERE t.id = ?1"
                    ),
                    params![id],
                    node_from_row,
                )
                .optional()
                .map(|r| r.map(StoredRecord::TreeNode)),
        }
        .map_err(db("get_by_id"))?;

        if let (Some(record), Some(expected)) = (&found, group) {
            if record.group_id() != expected {
                return Err(EngineError::GroupIsolationViolation {
                    expected: expected.to_string(),
                    found: record.group_id().to_string(),
                    record_id: id.to_string(),
                });
            }
        }
        Ok(found)
    }

    /// Visible records of `kind` in the group, embedded or not.
    pub fn record_count(&self, kind: RecordKind, group: &GroupId) -> Result<usize, EngineError> {
        Ok(self.visible_records(kind, group, None)?.len())
    }

    /// Rows of `kind` in the embedded index for the group.
    pub fn vector_count(&self, kind: RecordKind, group: &GroupId) -> Result<usize, EngineError> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM vectors WHERE kind = ?1 AND group_id = ?2",
                params![kind.as_str(), group.as_str()],
                |r| r.get(0),
            )
            .map_err(db("count vectors"))?;
        Ok(n.max(0) as usize)
    }

    pub fn group_stats(&self, group: &GroupId) -> Result<GroupStats, EngineError> {
        let conn = self.conn()?;
        let vectors: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM vectors WHERE group_id = ?1",
                params![group.as_str()],
                |r| r.get(0),
            )
            .map_err(db("count group vectors"))?;
        Ok(GroupStats {
            chunks: self.record_count(RecordKind::Chunk, group)?,
            entities: self.record_count(RecordKind::Entity, group)?,
            relationships: self.relationships_for_group(group)?.len(),
            communities: self.record_count(RecordKind::Community, group)?,
            tree_nodes: self.record_count(RecordKind::TreeNode, group)?,
            vectors: vectors.max(0) as usize,
            max_tree_level: self.max_tree_level(group)?,
        })
    }

    /// Remove every record of the group from every table.
    pub fn delete_group(&self, group: &GroupId) -> Result<(), EngineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin group purge"))?;
        for table in [
            "relationships",
            "entities",
            "extractions",
            "chunks",
            "communities",
            "community_generations",
            "tree_nodes",
            "tree_builds",
            "vectors",
        ] {
            tx.execute(&format!("DELETE FROM {table} WHERE group_id = ?1"), params![group.as_str()])
                .map_err(db("purge group table"))?;
        }
        tx.commit().map_err(db("commit group purge"))
    }
}

// ── Transaction helpers ───────────────────────────────────────────────────────

fn merge_entity_tx(tx: &Transaction<'_>, candidate: Entity) -> Result<Entity, EngineError> {
    let existing = tx
        .query_row(
            &format!(
                "SELECT {ENTITY_COLS} FROM entities
                 WHERE group_id = ?1 AND normalized_name = ?2 AND entity_type = ?3"
            ),
            params![
                candidate.group_id.as_str(),
                candidate.normalized_name,
                candidate.entity_type
            ],
            entity_from_row,
        )
        .optional()
        .map_err(db("read entity for merge"))?;

    match existing {
        Some(mut e) => {
            e.mention_count += candidate.mention_count;
            let desc = candidate.description.trim();
            if !desc.is_empty() && !e.description.lines().any(|l| l == desc) {
                if !e.description.is_empty() {
                    e.description.push('\n');
                }
                e.description.push_str(desc);
            }
            tx.execute(
                "UPDATE entities SET description = ?1, mention_count = ?2 WHERE id = ?3",
                params![e.description, e.mention_count, e.id],
            )
            .map_err(db("update merged entity"))?;
            Ok(e)
        }
        None => {
            tx.execute(
                &format!("INSERT INTO entities ({ENTITY_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    candidate.id,
                    candidate.group_id.as_str(),
                    candidate.name,
                    candidate.normalized_name,
                    candidate.entity_type,
                    candidate.description,
                    candidate.mention_count
                ],
            )
            .map_err(db("insert entity"))?;
            Ok(candidate)
        }
    }
}

fn merge_relationship_tx(
    tx: &Transaction<'_>,
    rel: Relationship,
    max_descriptions: usize,
) -> Result<Relationship, EngineError> {
    for endpoint in [&rel.source_entity_id, &rel.target_entity_id] {
        let group: Option<String> = tx
            .query_row(
                "SELECT group_id FROM entities WHERE id = ?1",
                params![endpoint],
                |r| r.get(0),
            )
            .optional()
            .map_err(db("read relationship endpoint"))?;
        match group {
            None => {
                return Err(EngineError::InvalidInput(format!(
                    "relationship {} references unknown entity {endpoint}",
                    rel.id
                )));
            }
            Some(g) if g != rel.group_id.as_str() => {
                return Err(EngineError::GroupIsolationViolation {
                    expected: rel.group_id.to_string(),
                    found: g,
                    record_id: endpoint.clone(),
                });
            }
            Some(_) => {}
        }
    }

    let existing = tx
        .query_row(
            &format!(
                "SELECT {REL_COLS} FROM relationships
                 WHERE group_id = ?1 AND source_entity_id = ?2 AND target_entity_id = ?3"
            ),
            params![rel.group_id.as_str(), rel.source_entity_id, rel.target_entity_id],
            relationship_from_row,
        )
        .optional()
        .map_err(db("read relationship for merge"))?;

    let merged = match existing {
        Some(mut e) => {
            e.weight += rel.weight;
            for d in rel.descriptions {
                if e.descriptions.len() >= max_descriptions {
                    break;
                }
                if !e.descriptions.contains(&d) {
                    e.descriptions.push(d);
                }
            }
            e
        }
        None => {
            let mut r = rel;
            r.descriptions.dedup();
            r.descriptions.truncate(max_descriptions);
            r
        }
    };

    tx.execute(
        &format!(
            "INSERT INTO relationships ({REL_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET descriptions = excluded.descriptions,
                                           weight = excluded.weight"
        ),
        params![
            merged.id,
            merged.group_id.as_str(),
            merged.source_entity_id,
            merged.target_entity_id,
            to_json(&merged.descriptions)?,
            merged.weight
        ],
    )
    .map_err(db("write relationship"))?;
    Ok(merged)
}

fn resolve_endpoint(
    tx: &Transaction<'_>,
    group: &GroupId,
    local: &HashMap<String, String>,
    name: &str,
) -> Result<Option<String>, EngineError> {
    let normalized = normalize_name(name);
    if normalized.is_empty() {
        return Ok(None);
    }
    if let Some(id) = local.get(&normalized) {
        return Ok(Some(id.clone()));
    }
    tx.query_row(
        "SELECT id FROM entities WHERE group_id = ?1 AND normalized_name = ?2
         ORDER BY mention_count DESC, id LIMIT 1",
        params![group.as_str(), normalized],
        |r| r.get(0),
    )
    .optional()
    .map_err(db("resolve relationship endpoint"))
}

/// Insert a chunk unless its id is already stored for the same group. An id
/// held by another group is an isolation violation, never a silent skip.
fn insert_chunk(conn: &Connection, c: &TextChunk, now: &str) -> Result<usize, EngineError> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO chunks
                (id, group_id, document_id, sequence_index, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![c.id, c.group_id.as_str(), c.source_document_id, c.sequence_index, c.text, now],
        )
        .map_err(db("insert chunk"))?;
    if inserted == 0 {
        let owner: String = conn
            .query_row("SELECT group_id FROM chunks WHERE id = ?1", params![c.id], |r| r.get(0))
            .map_err(db("read chunk owner"))?;
        if owner != c.group_id.as_str() {
            return Err(EngineError::GroupIsolationViolation {
                expected: c.group_id.to_string(),
                found: owner,
                record_id: c.id.clone(),
            });
        }
    }
    Ok(inserted)
}

fn insert_tree_node(conn: &Connection, node: &TreeNode, build_id: &str) -> Result<(), EngineError> {
    conn.execute(
        "INSERT OR REPLACE INTO tree_nodes
            (id, group_id, build_id, level, text, children, parent_node_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            node.id,
            node.group_id.as_str(),
            build_id,
            node.level,
            node.text,
            to_json(&node.children)?,
            node.parent_node_id
        ],
    )
    .map_err(db("insert tree node"))?;
    Ok(())
}

fn insert_community(
    conn: &Connection,
    c: &Community,
    generation: &str,
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT OR REPLACE INTO communities
            (id, group_id, generation, level, entity_ids, parent_id, summary, rank)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            c.id,
            c.group_id.as_str(),
            generation,
            c.level,
            to_json(&c.entity_ids)?,
            c.parent_community_id,
            c.summary,
            c.rank
        ],
    )
    .map_err(db("insert community"))?;
    Ok(())
}

fn put_vector_tx(
    conn: &Connection,
    kind: RecordKind,
    record_id: &str,
    group: &GroupId,
    embedding: &[f32],
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT OR REPLACE INTO vectors (kind, record_id, group_id, dimension, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            kind.as_str(),
            record_id,
            group.as_str(),
            embedding.len() as i64,
            encode_embedding(embedding)
        ],
    )
    .map_err(db("write vector"))?;
    Ok(())
}

fn delete_vectors_tx(
    conn: &Connection,
    kind: RecordKind,
    ids: &[String],
) -> Result<(), EngineError> {
    for id in ids {
        conn.execute(
            "DELETE FROM vectors WHERE kind = ?1 AND record_id = ?2",
            params![kind.as_str(), id],
        )
        .map_err(db("delete vector"))?;
    }
    Ok(())
}

fn ids_where(
    conn: &Connection,
    sql: &str,
    group: &GroupId,
    keep: &str,
) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare(sql).map_err(db("prepare id scan"))?;
    let rows = stmt
        .query_map(params![group.as_str(), keep], |r| r.get(0))
        .map_err(db("query id scan"))?;
    rows.collect::<Result<_, _>>().map_err(db("read id"))
}

// ── Ranking ───────────────────────────────────────────────────────────────────

/// Join visible records with their vectors and rank by cosine similarity.
///
/// Shared by the embedded and external backends so both report
/// `IndexNotReady`, `EmbeddingMissing` and isolation breaches identically.
pub(crate) fn rank_hits(
    kind: RecordKind,
    group: &GroupId,
    query: &[f32],
    k: usize,
    visible: Vec<VisibleRecord>,
    vectors: Vec<StoredVector>,
    exclude: &HashSet<String>,
) -> Result<Vec<VectorHit>, EngineError> {
    if visible.is_empty() {
        return Err(EngineError::IndexNotReady { kind, group_id: group.to_string() });
    }

    let by_id: HashMap<&str, &StoredVector> =
        vectors.iter().map(|v| (v.record_id.as_str(), v)).collect();

    let mut any_embedded = false;
    let mut first_missing: Option<String> = None;
    let mut hits = Vec::new();
    for rec in visible {
        if rec.group_id != group.as_str() {
            return Err(EngineError::GroupIsolationViolation {
                expected: group.to_string(),
                found: rec.group_id,
                record_id: rec.id,
            });
        }
        let Some(v) = by_id.get(rec.id.as_str()) else {
            first_missing.get_or_insert_with(|| rec.id.clone());
            continue;
        };
        if v.group_id != group.as_str() {
            return Err(EngineError::GroupIsolationViolation {
                expected: group.to_string(),
                found: v.group_id.clone(),
                record_id: rec.id,
            });
        }
        any_embedded = true;
        if exclude.contains(&rec.id) {
            continue;
        }
        hits.push(VectorHit {
            kind,
            score: cosine_similarity(query, &v.embedding),
            id: rec.id,
            group_id: group.clone(),
            text: rec.text,
            level: rec.level,
        });
    }

    if !any_embedded {
        return Err(EngineError::EmbeddingMissing {
            kind,
            record_id: first_missing.unwrap_or_default(),
            reason: format!("group {group} has {kind} records but none is embedded"),
        });
    }

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(k);
    Ok(hits)
}
