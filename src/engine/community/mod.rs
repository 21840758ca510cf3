//! `CommunityEngine`: hierarchical communities over a group's entity graph.
//!
//! Level 0 holds the coarsest partition (Louvain over the whole graph).
//! Any community larger than `max_cluster_size` is partitioned again over
//! its induced subgraph, and those parts become its children one level
//! down. The result is a forest: roots at level 0, every other community
//! with exactly one parent at `level - 1`.
//!
//! A run always rebuilds the whole forest, summarizes and embeds every
//! community, and only then publishes it as a new generation, replacing
//! the previous one in a single transaction. Runs for the same group are
//! serialized.

pub mod louvain;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use petgraph::graph::{NodeIndex, UnGraph};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CommunityConfig, EmbeddingConfig};
use crate::embedding::EmbeddingProvider;
use crate::llm::LlmProvider;

use super::error::EngineError;
use super::index::VectorIndexProvider;
use super::locks::WriteLocks;
use super::model::{Community, Entity, GroupId, Relationship, group_seed};
use super::prompts::{PromptKind, Prompts, SUMMARY_MAX_TOKENS};

pub use louvain::Louvain;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommunityReport {
    /// Generation id of the published forest.
    pub generation: String,
    pub communities: usize,
    /// Number of levels in the forest.
    pub levels: u32,
    /// Communities whose summary fell back to the member list.
    pub summary_fallbacks: usize,
}

/// A community before summarization: members as entity indices.
struct Draft {
    id: String,
    level: u32,
    parent: Option<String>,
    members: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct CommunityEngine {
    llm: LlmProvider,
    embedder: EmbeddingProvider,
    index: VectorIndexProvider,
    prompts: Prompts,
    locks: Arc<WriteLocks>,
    config: CommunityConfig,
    embedding: EmbeddingConfig,
}

impl CommunityEngine {
    pub fn new(
        llm: LlmProvider,
        embedder: EmbeddingProvider,
        index: VectorIndexProvider,
        prompts: Prompts,
        locks: Arc<WriteLocks>,
        config: CommunityConfig,
        embedding: EmbeddingConfig,
    ) -> Self {
        Self { llm, embedder, index, prompts, locks, config, embedding }
    }

    /// Rebuild and publish the group's community forest.
    pub async fn run(&self, group: &GroupId) -> Result<CommunityReport, EngineError> {
        let runs = &self.locks.communities;
        let _guard = match runs.try_acquire(group)? {
            Some(guard) => guard,
            None => {
                debug!(group_id = %group, "community run in flight; waiting");
                runs.acquire(group).await?
            }
        };

        let g = group.clone();
        let (entities, relationships) = self
            .index
            .store()
            .run("load entity graph", move |s| {
                Ok((s.entities_for_group(&g)?, s.relationships_for_group(&g)?))
            })
            .await?;
        if entities.is_empty() {
            // nothing to replace either: entities only disappear with a purge
            debug!(group_id = %group, "no entities; community run skipped");
            return Ok(CommunityReport::default());
        }

        let drafts = self.detect(group, &entities, &relationships);
        let levels = drafts.iter().map(|d| d.level + 1).max().unwrap_or(0);
        debug!(group_id = %group, communities = drafts.len(), levels, "communities detected");

        let mut fallbacks = 0;
        let summaries: Vec<(String, bool)> = stream::iter(drafts.iter())
            .map(|d| self.summarize(group, d, &entities, &relationships))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let texts: Vec<String> = summaries.iter().map(|(s, _)| s.clone()).collect();
        let vectors = self
            .embedder
            .embed_batched(&texts, self.embedding.batch_size, self.embedding.concurrency)
            .await?;

        let communities: Vec<Community> = drafts
            .into_iter()
            .zip(summaries)
            .zip(vectors)
            .map(|((d, (summary, fell_back)), embedding)| {
                if fell_back {
                    fallbacks += 1;
                }
                let rank = d.members.iter().map(|&i| f64::from(entities[i].mention_count)).sum();
                Community {
                    id: d.id,
                    group_id: group.clone(),
                    level: d.level,
                    entity_ids: d.members.iter().map(|&i| entities[i].id.clone()).collect(),
                    parent_community_id: d.parent,
                    summary,
                    rank,
                    embedding: Some(embedding),
                }
            })
            .collect();

        let generation = Uuid::now_v7().to_string();
        let count = communities.len();
        self.index.publish_communities(group, &generation, communities).await?;
        info!(group_id = %group, %generation, communities = count, levels, fallbacks, "communities published");
        Ok(CommunityReport { generation, communities: count, levels, summary_fallbacks: fallbacks })
    }

    /// Partition the graph top-down into a forest of drafts, parents first.
    fn detect(&self, group: &GroupId, entities: &[Entity], relationships: &[Relationship]) -> Vec<Draft> {
        if entities.is_empty() {
            return Vec::new();
        }
        let position: HashMap<&str, usize> =
            entities.iter().enumerate().map(|(i, e)| (e.id.as_str(), i)).collect();
        let edges: Vec<(usize, usize, f64)> = relationships
            .iter()
            .filter_map(|r| {
                let s = *position.get(r.source_entity_id.as_str())?;
                let t = *position.get(r.target_entity_id.as_str())?;
                Some((s, t, r.weight))
            })
            .collect();
        let seed = group_seed(group, self.config.seed);

        let mut drafts = Vec::new();
        let all: Vec<usize> = (0..entities.len()).collect();
        let mut pending: Vec<(Vec<usize>, u32, Option<String>)> = Vec::new();
        for members in split(&all, &edges, seed, 0) {
            pending.push((members, 0, None));
        }
        // breadth-first so parents precede their children
        let mut cursor = 0;
        while cursor < pending.len() {
            let (members, level, parent) = pending[cursor].clone();
            cursor += 1;
            let id = Uuid::now_v7().to_string();
            if members.len() > self.config.max_cluster_size && level + 1 < self.config.max_levels {
                let parts = split(&members, &edges, seed, level + 1);
                if parts.len() > 1 {
                    for part in parts {
                        pending.push((part, level + 1, Some(id.clone())));
                    }
                }
            }
            drafts.push(Draft { id, level, parent, members });
        }
        drafts
    }

    /// One summary completion. Returns the text and whether it fell back.
    async fn summarize(
        &self,
        group: &GroupId,
        draft: &Draft,
        entities: &[Entity],
        relationships: &[Relationship],
    ) -> (String, bool) {
        let members: HashSet<&str> = draft.members.iter().map(|&i| entities[i].id.as_str()).collect();
        let by_id: HashMap<&str, &Entity> = entities.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut ranked: Vec<&Entity> = draft.members.iter().map(|&i| &entities[i]).collect();
        ranked.sort_by(|a, b| b.mention_count.cmp(&a.mention_count).then(a.name.cmp(&b.name)));

        let mut inner: Vec<&Relationship> = relationships
            .iter()
            .filter(|r| {
                members.contains(r.source_entity_id.as_str())
                    && members.contains(r.target_entity_id.as_str())
            })
            .collect();
        inner.sort_by(|a, b| b.weight.total_cmp(&a.weight).then(a.id.cmp(&b.id)));

        // entities take at most half the budget; relationships fill the rest
        let budget = self.config.summary_token_budget.saturating_mul(4);
        let entity_lines = take_within(
            ranked.iter().map(|e| format!("- {}", e.embedding_text())),
            budget / 2,
        );
        let rel_budget = budget.saturating_sub(entity_lines.len());
        let rel_lines = take_within(
            inner.iter().map(|r| {
                let name = |id: &str| by_id.get(id).map_or_else(|| id.to_string(), |e| e.name.clone());
                format!(
                    "- {} -> {} (weight {}): {}",
                    name(&r.source_entity_id),
                    name(&r.target_entity_id),
                    r.weight,
                    r.description()
                )
            }),
            rel_budget,
        );

        let prompt = self.prompts.render(
            PromptKind::CommunitySummary,
            &[("entities", &entity_lines), ("relationships", &rel_lines)],
        );
        match self.llm.complete(&prompt, SUMMARY_MAX_TOKENS).await {
            Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), false),
            Ok(_) => {
                warn!(group_id = %group, level = draft.level, "empty community summary; using member list");
                (fallback_summary(&ranked), true)
            }
            Err(e) => {
                warn!(group_id = %group, level = draft.level, error = %e, "community summary failed; using member list");
                (fallback_summary(&ranked), true)
            }
        }
    }
}

/// Louvain over the subgraph induced by `members`, as groups of the original
/// indices. Groups come out in order of their first member.
fn split(members: &[usize], edges: &[(usize, usize, f64)], seed: u64, level: u32) -> Vec<Vec<usize>> {
    let local: HashMap<usize, usize> = members.iter().enumerate().map(|(i, &m)| (m, i)).collect();
    let mut graph: UnGraph<usize, f64> = UnGraph::with_capacity(members.len(), edges.len());
    for &m in members {
        graph.add_node(m);
    }
    for &(s, t, w) in edges {
        if let (Some(&a), Some(&b)) = (local.get(&s), local.get(&t)) {
            graph.add_edge(NodeIndex::new(a), NodeIndex::new(b), w);
        }
    }
    // finer resolution further down so sub-partitioning can still split
    let labels = Louvain::new(seed ^ u64::from(level))
        .with_resolution(1.0 + f64::from(level))
        .detect(&graph);
    let count = labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut groups = vec![Vec::new(); count];
    for (i, &label) in labels.iter().enumerate() {
        groups[label].push(members[i]);
    }
    groups
}

/// Join lines until adding the next would pass `max_chars`.
fn take_within(lines: impl Iterator<Item = String>, max_chars: usize) -> String {
    let mut out = String::new();
    for line in lines {
        if !out.is_empty() && out.len() + line.len() + 1 > max_chars {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&line);
    }
    out
}

fn fallback_summary(ranked: &[&Entity]) -> String {
    let names: Vec<&str> = ranked.iter().map(|e| e.name.as_str()).collect();
    format!("Community of {} entities: {}.", names.len(), names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, VectorBackend};
    use crate::embedding::providers::hashing::HashingEmbedder;
    use crate::engine::model::{EntityMention, RecordKind, RelationshipMention};
    use crate::engine::store::GraphStore;
    use crate::llm::ProviderError;
    use crate::llm::providers::scripted::ScriptedProvider;
    use std::path::Path;
    use tempfile::TempDir;

    fn engine(dir: &Path, llm: ScriptedProvider, config: CommunityConfig) -> CommunityEngine {
        let store = GraphStore::open(&dir.join("graph.db")).unwrap();
        let cfg = IndexConfig { backend: VectorBackend::Embedded, external_path: dir.join("v.db") };
        let index = VectorIndexProvider::new(store, 32, &cfg).unwrap();
        CommunityEngine::new(
            LlmProvider::Scripted(llm),
            EmbeddingProvider::Hashing(HashingEmbedder::new(32)),
            index,
            Prompts::default(),
            Arc::new(WriteLocks::new()),
            config,
            EmbeddingConfig { dimension: 32, ..EmbeddingConfig::default() },
        )
    }

    fn mention(name: &str) -> EntityMention {
        EntityMention { name: name.into(), entity_type: "thing".into(), description: format!("about {name}") }
    }

    fn rel(a: &str, b: &str) -> RelationshipMention {
        RelationshipMention { source: a.into(), target: b.into(), description: format!("{a} and {b}") }
    }

    /// Three dense clusters of four, chained by single bridges.
    fn seed_graph(store: &GraphStore, g: &GroupId) {
        let clusters = [["a1", "a2", "a3", "a4"], ["b1", "b2", "b3", "b4"], ["c1", "c2", "c3", "c4"]];
        for (ci, cluster) in clusters.iter().enumerate() {
            let ents: Vec<_> = cluster.iter().map(|n| mention(n)).collect();
            let mut rels = Vec::new();
            for i in 0..cluster.len() {
                for j in i + 1..cluster.len() {
                    rels.push(rel(cluster[i], cluster[j]));
                }
            }
            store.upsert_extraction(g, &format!("chunk{ci}"), &ents, &rels, 4).unwrap();
        }
        let bridges = [mention("a4"), mention("b1"), mention("b4"), mention("c1")];
        store
            .upsert_extraction(g, "bridges", &bridges, &[rel("a4", "b1"), rel("b4", "c1")], 4)
            .unwrap();
    }

    fn summarizer() -> ScriptedProvider {
        ScriptedProvider::new(|prompt| Ok(format!("report over {} chars", prompt.len())))
    }

    #[tokio::test]
    async fn forest_has_one_parent_per_child() {
        let tmp = TempDir::new().unwrap();
        let config = CommunityConfig { max_cluster_size: 3, max_levels: 3, ..CommunityConfig::default() };
        let eng = engine(tmp.path(), summarizer(), config);
        let g = GroupId::from("g");
        seed_graph(eng.index.store(), &g);

        let report = eng.run(&g).await.unwrap();
        let communities = eng.index.store().communities_for_group(&g).unwrap();
        assert_eq!(communities.len(), report.communities);
        let by_id: HashMap<&str, &Community> = communities.iter().map(|c| (c.id.as_str(), c)).collect();

        let mut covered = HashSet::new();
        for c in &communities {
            match &c.parent_community_id {
                None => {
                    assert_eq!(c.level, 0);
                    for e in &c.entity_ids {
                        assert!(covered.insert(e.clone()), "entity in two roots");
                    }
                }
                Some(p) => {
                    let parent = by_id[p.as_str()];
                    assert_eq!(parent.level + 1, c.level);
                    assert!(c.entity_ids.iter().all(|e| parent.entity_ids.contains(e)));
                }
            }
        }
        let vectors = eng.index.vectors(RecordKind::Community, &g).await.unwrap();
        assert!(communities.iter().all(|c| vectors[&c.id].len() == 32));
        assert_eq!(covered.len(), 12);
        assert!(communities.iter().any(|c| c.level == 1), "oversized roots were not split");
        assert_eq!(report.levels, 2);
        assert_eq!(
            eng.index.vector_count(RecordKind::Community, &g).await.unwrap(),
            communities.len()
        );
    }

    #[tokio::test]
    async fn rerun_replaces_previous_generation() {
        let tmp = TempDir::new().unwrap();
        let eng = engine(tmp.path(), summarizer(), CommunityConfig::default());
        let g = GroupId::from("g");
        seed_graph(eng.index.store(), &g);

        let first = eng.run(&g).await.unwrap();
        let before: HashSet<String> =
            eng.index.store().communities_for_group(&g).unwrap().into_iter().map(|c| c.id).collect();
        let second = eng.run(&g).await.unwrap();
        let after = eng.index.store().communities_for_group(&g).unwrap();

        assert_ne!(first.generation, second.generation);
        assert_eq!(first.communities, second.communities);
        assert_eq!(after.len(), second.communities);
        assert!(after.iter().all(|c| !before.contains(&c.id)));
        assert_eq!(eng.index.vector_count(RecordKind::Community, &g).await.unwrap(), after.len());
    }

    #[tokio::test]
    async fn failed_summaries_fall_back_to_member_names() {
        let tmp = TempDir::new().unwrap();
        let llm = ScriptedProvider::new(|_| Err(ProviderError::Request("down".into())));
        let eng = engine(tmp.path(), llm, CommunityConfig::default());
        let g = GroupId::from("g");
        seed_graph(eng.index.store(), &g);

        let report = eng.run(&g).await.unwrap();
        assert_eq!(report.summary_fallbacks, report.communities);
        let communities = eng.index.store().communities_for_group(&g).unwrap();
        assert!(communities.iter().all(|c| c.summary.starts_with("Community of")));
    }

    #[tokio::test]
    async fn empty_graph_publishes_nothing() {
        let tmp = TempDir::new().unwrap();
        let eng = engine(tmp.path(), summarizer(), CommunityConfig::default());
        let g = GroupId::from("empty");
        let report = eng.run(&g).await.unwrap();
        assert_eq!(report.communities, 0);
        assert_eq!(report.levels, 0);
        assert_eq!(eng.index.store().group_stats(&g).unwrap(), Default::default());
    }

    #[test]
    fn take_within_stops_at_budget() {
        let lines = ["aaaa", "bbbb", "cccc"].into_iter().map(String::from);
        assert_eq!(take_within(lines, 9), "aaaa\nbbbb");
        let one = ["a very long line"].into_iter().map(String::from);
        assert_eq!(take_within(one, 3), "a very long line");
    }
}
