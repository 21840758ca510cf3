//! `HierarchicalSummaryTree`: recursive summaries over a group's chunks.
//!
//! Chunks are the leaves (level 0). Each build:
//!
//! 1. embeds every chunk that has no stored vector of the right dimension
//!    and writes those vectors; any embedding failure fails the build before
//!    a node is written;
//! 2. clusters the current level (projection + k-means), summarizes each
//!    cluster, embeds each summary and writes the level's nodes through the
//!    index gate, one level at a time;
//! 3. repeats until one root remains;
//! 4. links parents and activates the build, which swaps it in for the
//!    previous tree in one transaction.
//!
//! Nodes of an unactivated build are never visible to queries. A group with
//! fewer chunks than `min_cluster_size` skips clustering: each chunk is
//! promoted to its own level-1 node, and those are joined under a root.

pub mod kmeans;

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EmbeddingConfig, TreeConfig};
use crate::embedding::EmbeddingProvider;
use crate::llm::LlmProvider;

use super::error::EngineError;
use super::index::VectorIndexProvider;
use super::locks::WriteLocks;
use super::model::{GroupId, IndexRecord, RecordKind, TreeChildren, TreeNode, group_seed};
use super::prompts::{PromptKind, Prompts, SUMMARY_MAX_TOKENS, truncate_to_tokens};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TreeReport {
    /// Empty when the group has no chunks and nothing was built.
    pub build_id: String,
    pub chunks: usize,
    /// Chunks embedded by this build (the rest already had vectors).
    pub chunks_embedded: usize,
    pub nodes: usize,
    pub root_level: u32,
    /// Chunks promoted straight to level-1 nodes.
    pub promoted: usize,
    pub summary_fallbacks: usize,
}

/// A member of the level being clustered: a chunk or a node.
#[derive(Clone)]
struct Member {
    id: String,
    text: String,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct HierarchicalSummaryTree {
    llm: LlmProvider,
    embedder: EmbeddingProvider,
    index: VectorIndexProvider,
    prompts: Prompts,
    locks: Arc<WriteLocks>,
    config: TreeConfig,
    embedding: EmbeddingConfig,
}

impl HierarchicalSummaryTree {
    pub fn new(
        llm: LlmProvider,
        embedder: EmbeddingProvider,
        index: VectorIndexProvider,
        prompts: Prompts,
        locks: Arc<WriteLocks>,
        config: TreeConfig,
        embedding: EmbeddingConfig,
    ) -> Self {
        Self { llm, embedder, index, prompts, locks, config, embedding }
    }

    /// Rebuild the group's tree over all of its chunks.
    pub async fn build(&self, group: &GroupId) -> Result<TreeReport, EngineError> {
        let _guard = self.locks.trees.acquire(group).await?;

        let g = group.clone();
        let mut chunks = self.index.store().run("load chunks", move |s| s.chunks_for_group(&g)).await?;
        if chunks.is_empty() {
            debug!(group_id = %group, "no chunks; tree build skipped");
            return Ok(TreeReport::default());
        }

        // 1. leaf embeddings
        let stored = self.index.vectors(RecordKind::Chunk, group).await?;
        let dim = self.index.dimension();
        let mut missing = Vec::new();
        for (i, chunk) in chunks.iter_mut().enumerate() {
            match stored.get(&chunk.id) {
                Some(v) if v.len() == dim => chunk.embedding = Some(v.clone()),
                _ => missing.push(i),
            }
        }
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| chunks[i].text.clone()).collect();
            let vectors = self
                .embedder
                .embed_batched(&texts, self.embedding.batch_size, self.embedding.concurrency)
                .await?;
            for (&i, v) in missing.iter().zip(vectors) {
                chunks[i].embedding = Some(v);
            }
            let records = missing.iter().map(|&i| IndexRecord::Chunk(chunks[i].clone())).collect();
            self.index.write_many(records).await?;
            debug!(group_id = %group, embedded = missing.len(), "chunk embeddings written");
        }

        let build_id = Uuid::now_v7().to_string();
        let mut report = TreeReport {
            build_id: build_id.clone(),
            chunks: chunks.len(),
            chunks_embedded: missing.len(),
            ..TreeReport::default()
        };
        let seed = group_seed(group, self.config.seed);

        let mut current: Vec<Member> = chunks
            .into_iter()
            .filter_map(|c| Some(Member { id: c.id, text: c.text, embedding: c.embedding? }))
            .collect();
        let mut level: u32 = 1;
        let mut links: Vec<(String, String)> = Vec::new();

        // 2. small groups: one level-1 node per chunk, no completion
        if current.len() < self.config.min_cluster_size {
            let nodes: Vec<TreeNode> = current
                .iter()
                .map(|m| TreeNode {
                    id: Uuid::now_v7().to_string(),
                    group_id: group.clone(),
                    level: 1,
                    text: m.text.clone(),
                    embedding: Some(m.embedding.clone()),
                    children: TreeChildren::Chunks(vec![m.id.clone()]),
                    parent_node_id: None,
                })
                .collect();
            report.promoted = nodes.len();
            current = self.write_level(&build_id, nodes).await?;
            report.nodes += current.len();
            level = 2;
        }

        // 3. cluster, summarize and embed until one root remains
        while current.len() > 1 || level == 1 {
            let groups = self.partition(&current, level, seed);
            let mut fallbacks = 0;
            let summaries: Vec<(String, bool)> = stream::iter(groups.iter())
                .map(|members| {
                    let texts: Vec<&str> = members.iter().map(|&i| current[i].text.as_str()).collect();
                    self.summarize(group, level, texts)
                })
                .buffered(self.config.concurrency.max(1))
                .collect()
                .await;
            let texts: Vec<String> = summaries.iter().map(|(t, _)| t.clone()).collect();
            let vectors = self
                .embedder
                .embed_batched(&texts, self.embedding.batch_size, self.embedding.concurrency)
                .await?;

            let mut nodes = Vec::with_capacity(groups.len());
            for ((members, (text, fell_back)), embedding) in groups.iter().zip(summaries).zip(vectors) {
                if fell_back {
                    fallbacks += 1;
                }
                let id = Uuid::now_v7().to_string();
                let child_ids: Vec<String> = members.iter().map(|&i| current[i].id.clone()).collect();
                let children = if level == 1 {
                    TreeChildren::Chunks(child_ids)
                } else {
                    links.extend(child_ids.iter().map(|c| (c.clone(), id.clone())));
                    TreeChildren::Nodes(child_ids)
                };
                nodes.push(TreeNode {
                    id,
                    group_id: group.clone(),
                    level,
                    text,
                    embedding: Some(embedding),
                    children,
                    parent_node_id: None,
                });
            }
            report.summary_fallbacks += fallbacks;
            current = self.write_level(&build_id, nodes).await?;
            report.nodes += current.len();
            debug!(group_id = %group, level, nodes = current.len(), "tree level written");
            level += 1;
        }
        report.root_level = level - 1;

        // 4. link and publish
        let g = group.clone();
        self.index.store().run("link tree parents", move |s| s.set_tree_parents(&g, &links)).await?;
        self.index.activate_tree_build(group, &build_id).await?;
        info!(
            group_id = %group,
            %build_id,
            chunks = report.chunks,
            nodes = report.nodes,
            root_level = report.root_level,
            "summary tree published"
        );
        Ok(report)
    }

    /// Clusters for one level. The last allowed level, a level below the
    /// minimum size, or a clustering that does not shrink the level all
    /// collapse into a single root.
    fn partition(&self, current: &[Member], level: u32, seed: u64) -> Vec<Vec<usize>> {
        let all = || vec![(0..current.len()).collect::<Vec<_>>()];
        if level >= self.config.max_levels || current.len() < self.config.min_cluster_size {
            return all();
        }
        let data: Vec<Vec<f32>> = current.iter().map(|m| m.embedding.clone()).collect();
        let level_seed = seed ^ u64::from(level);
        let projected = kmeans::random_projection(&data, self.config.reduced_dimension, level_seed);
        let groups = kmeans::cluster(&projected, self.config.cluster_size, level_seed);
        if groups.len() >= current.len() && current.len() > 1 {
            return all();
        }
        groups
    }

    async fn summarize(&self, group: &GroupId, level: u32, texts: Vec<&str>) -> (String, bool) {
        let share = self.config.summary_token_budget / texts.len().max(1);
        let passages: Vec<&str> = texts.iter().map(|t| truncate_to_tokens(t, share)).collect();
        let joined = passages.join("\n\n---\n\n");
        let prompt = self.prompts.render(PromptKind::TreeSummary, &[("texts", &joined)]);
        match self.llm.complete(&prompt, SUMMARY_MAX_TOKENS).await {
            Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), false),
            Ok(_) => {
                warn!(group_id = %group, level, "empty tree summary; using member text");
                (fallback_summary(&passages), true)
            }
            Err(e) => {
                warn!(group_id = %group, level, error = %e, "tree summary failed; using member text");
                (fallback_summary(&passages), true)
            }
        }
    }

    /// Gate and write one level of a build; returns it as the next level's
    /// members.
    async fn write_level(&self, build_id: &str, nodes: Vec<TreeNode>) -> Result<Vec<Member>, EngineError> {
        let members = nodes
            .iter()
            .map(|n| Member {
                id: n.id.clone(),
                text: n.text.clone(),
                embedding: n.embedding.clone().unwrap_or_default(),
            })
            .collect();
        let records = nodes
            .into_iter()
            .map(|node| IndexRecord::TreeNode { node, build_id: build_id.to_string() })
            .collect();
        self.index.write_many(records).await?;
        Ok(members)
    }
}

/// Deterministic stand-in summary: the opening of each member, in order.
fn fallback_summary(passages: &[&str]) -> String {
    passages
        .iter()
        .map(|p| truncate_to_tokens(p, 50).trim())
        .collect::<Vec<_>>()
        .join(" ... ")
}
