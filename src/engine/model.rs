//! Records shared by every engine component.
//!
//! Every durable record carries the `GroupId` of the tenant partition it
//! belongs to. Ids of chunks, entities and relationships are derived from
//! their natural keys (see [`stable_id`]) so re-ingestion lands on the same
//! rows; communities and tree nodes get UUID v7 ids per build.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ── Group ─────────────────────────────────────────────────────────────────────

/// Tenant partition key. Every read and write is scoped to one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for GroupId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Record kinds ──────────────────────────────────────────────────────────────

/// The four record types that carry embeddings and can be vector-queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Chunk,
    Entity,
    Community,
    TreeNode,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Chunk => "chunk",
            RecordKind::Entity => "entity",
            RecordKind::Community => "community",
            RecordKind::TreeNode => "tree_node",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chunk" => Some(RecordKind::Chunk),
            "entity" => Some(RecordKind::Entity),
            "community" => Some(RecordKind::Community),
            "tree_node" => Some(RecordKind::TreeNode),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Durable records ───────────────────────────────────────────────────────────

/// One ingested unit of text. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub id: String,
    pub group_id: GroupId,
    pub text: String,
    pub source_document_id: String,
    pub sequence_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl TextChunk {
    pub fn new(group_id: &GroupId, document_id: &str, sequence_index: u32, text: String) -> Self {
        Self {
            id: stable_id(&[group_id.as_str(), document_id, &sequence_index.to_string()]),
            group_id: group_id.clone(),
            text,
            source_document_id: document_id.to_string(),
            sequence_index,
            embedding: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub group_id: GroupId,
    /// Display name as first extracted.
    pub name: String,
    pub normalized_name: String,
    pub entity_type: String,
    /// Distinct descriptions joined with newlines.
    pub description: String,
    /// Number of distinct chunks that mentioned this entity.
    pub mention_count: u32,
}

impl Entity {
    pub fn id_for(group_id: &GroupId, normalized_name: &str, entity_type: &str) -> String {
        stable_id(&[group_id.as_str(), normalized_name, entity_type])
    }

    /// Text embedded for entity vector search.
    pub fn embedding_text(&self) -> String {
        format!("{} ({}): {}", self.name, self.entity_type, self.description)
    }
}

/// Directed edge between two entities of the same group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub group_id: GroupId,
    pub source_entity_id: String,
    pub target_entity_id: String,
    /// Distinct descriptions, oldest first, capped by configuration.
    pub descriptions: Vec<String>,
    /// Number of times the pair was extracted.
    pub weight: f64,
}

impl Relationship {
    pub fn id_for(group_id: &GroupId, source: &str, target: &str) -> String {
        stable_id(&[group_id.as_str(), source, target])
    }

    pub fn description(&self) -> String {
        self.descriptions.join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: String,
    pub group_id: GroupId,
    /// 0 for roots; children sit one level below their parent.
    pub level: u32,
    pub entity_ids: Vec<String>,
    pub parent_community_id: Option<String>,
    pub summary: String,
    /// Sum of member mention counts.
    pub rank: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A tree node points either at text chunks (level 1) or at lower nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum TreeChildren {
    Chunks(Vec<String>),
    Nodes(Vec<String>),
}

impl TreeChildren {
    pub fn ids(&self) -> &[String] {
        match self {
            TreeChildren::Chunks(ids) | TreeChildren::Nodes(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub group_id: GroupId,
    /// Chunks are level 0, so nodes start at 1.
    pub level: u32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub children: TreeChildren,
    pub parent_node_id: Option<String>,
}

// ── Index writes ──────────────────────────────────────────────────────────────

/// A record headed for the vector index together with its embedding.
#[derive(Debug, Clone)]
pub enum IndexRecord {
    /// Carries its embedding in `TextChunk::embedding`.
    Chunk(TextChunk),
    Entity { entity: Entity, embedding: Option<Vec<f32>> },
    /// Carries its embedding in `TreeNode::embedding`.
    TreeNode { node: TreeNode, build_id: String },
}

impl IndexRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            IndexRecord::Chunk(_) => RecordKind::Chunk,
            IndexRecord::Entity { .. } => RecordKind::Entity,
            IndexRecord::TreeNode { .. } => RecordKind::TreeNode,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            IndexRecord::Chunk(c) => &c.id,
            IndexRecord::Entity { entity, .. } => &entity.id,
            IndexRecord::TreeNode { node, .. } => &node.id,
        }
    }

    pub fn group_id(&self) -> &GroupId {
        match self {
            IndexRecord::Chunk(c) => &c.group_id,
            IndexRecord::Entity { entity, .. } => &entity.group_id,
            IndexRecord::TreeNode { node, .. } => &node.group_id,
        }
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        match self {
            IndexRecord::Chunk(c) => c.embedding.as_deref(),
            IndexRecord::Entity { embedding, .. } => embedding.as_deref(),
            IndexRecord::TreeNode { node, .. } => node.embedding.as_deref(),
        }
    }
}

// ── Query-side values ─────────────────────────────────────────────────────────

/// One ranked vector search result with its content resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub kind: RecordKind,
    pub id: String,
    pub group_id: GroupId,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
    pub text: String,
    pub level: Option<u32>,
}

/// The ingestion boundary: ordered chunks of one document.
#[derive(Debug, Clone)]
pub struct IngestBatch {
    pub group_id: GroupId,
    pub document_id: String,
    pub chunks: Vec<String>,
}

/// An entity as read from one extraction completion, before merging.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityMention {
    pub name: String,
    #[serde(default, rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

/// A relationship as read from one extraction completion, by entity name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelationshipMention {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub description: String,
}

/// Result of merging one chunk's extraction into the graph.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    /// Post-merge state of every entity the chunk mentioned.
    pub entities: Vec<Entity>,
    pub relationships: usize,
    /// Relationships whose endpoints could not be resolved.
    pub unresolved: usize,
}

/// Record counts for one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStats {
    pub chunks: usize,
    pub entities: usize,
    pub relationships: usize,
    pub communities: usize,
    pub tree_nodes: usize,
    pub vectors: usize,
    pub max_tree_level: Option<u32>,
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// 16 hex chars of sha256 over the length-prefixed parts, so no two
/// different part lists hash the same input.
pub fn stable_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Seed for a group's randomized clustering: `seed` mixed with the group id,
/// so runs are reproducible per group without sharing one random stream.
pub fn group_seed(group: &GroupId, seed: u64) -> u64 {
    u64::from_str_radix(&stable_id(&[group.as_str()]), 16).unwrap_or(0) ^ seed
}

/// Merge key for entity names: trimmed, surrounding punctuation stripped,
/// inner whitespace collapsed, lowercased. `"ACME CORP."` → `"acme corp"`.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Entity types compare case-insensitively; blank means `"unknown"`.
pub fn normalize_type(entity_type: &str) -> String {
    let t = entity_type.trim().to_lowercase();
    if t.is_empty() { "unknown".to_string() } else { t }
}
