//! The retrieval engine: ingestion, index maintenance and querying.
//!
//! `Engine` wires the components together over one `GraphStore`:
//!
//! - **ingest**: store chunks, then run entity extraction and the summary
//!   tree concurrently (they write disjoint record kinds), then rebuild
//!   communities from the merged graph.
//! - **reindex**: finish any pending extraction, re-embed entities, rebuild
//!   the tree and the communities.
//! - **purge**: remove every record of a group.
//! - **query**: route to flat, community or iterative search.
//!
//! Every component is cheap to clone and holds no connection; the store
//! opens one per operation.

pub mod community;
pub mod drift;
pub mod error;
pub mod extract;
pub mod index;
pub mod locks;
pub mod model;
pub mod prompts;
pub mod router;
pub mod store;
pub mod tree;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::llm::{self, LlmProvider};

pub use community::{CommunityEngine, CommunityReport};
pub use drift::{Answer, IterativeRetriever, ProvenanceRef, Termination};
pub use error::EngineError;
pub use extract::{EntityGraphBuilder, ExtractionReport};
pub use index::VectorIndexProvider;
pub use locks::{GroupLocks, WriteLocks};
pub use model::{GroupId, GroupStats, IngestBatch, RecordKind, TextChunk, VectorHit};
pub use prompts::Prompts;
pub use router::{QueryOptions, QueryResponse, QueryRouter, Strategy};
pub use store::GraphStore;
pub use tree::{HierarchicalSummaryTree, TreeReport};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub chunks_stored: usize,
    pub extraction: ExtractionReport,
    pub tree: TreeReport,
    pub communities: CommunityReport,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexReport {
    pub extraction: ExtractionReport,
    pub entities_reembedded: usize,
    pub tree: TreeReport,
    pub communities: CommunityReport,
}

#[derive(Debug, Clone)]
pub struct Engine {
    index: VectorIndexProvider,
    locks: Arc<WriteLocks>,
    extractor: EntityGraphBuilder,
    tree: HierarchicalSummaryTree,
    communities: CommunityEngine,
    router: QueryRouter,
}

impl Engine {
    /// Build the providers named in `config` and open the engine.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let llm = llm::providers::build(&config.llm, config.llm_api_key.clone())?;
        let embedder = embedding::providers::build(&config.embedding, config.embedding_api_key.clone())?;
        Self::open(config, llm, embedder)
    }

    /// Open the engine with caller-supplied providers.
    pub fn open(config: &Config, llm: LlmProvider, embedder: EmbeddingProvider) -> Result<Self, EngineError> {
        if embedder.dimension() != config.embedding.dimension {
            warn!(
                provider = embedder.name(),
                provider_dimension = embedder.dimension(),
                configured = config.embedding.dimension,
                "embedding dimension mismatch; writes will be rejected"
            );
        }
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            EngineError::Storage(format!(
                "engine: create data dir '{}': {e}",
                config.data_dir.display()
            ))
        })?;

        let store = GraphStore::open(&config.db_path())?;
        let index = VectorIndexProvider::new(store, config.embedding.dimension, &config.index)?;
        let prompts = Prompts::new(config.prompts_dir.clone());
        let locks = Arc::new(WriteLocks::new());

        let extractor = EntityGraphBuilder::new(
            llm.clone(),
            embedder.clone(),
            index.clone(),
            prompts.clone(),
            Arc::clone(&locks),
            config.extraction.clone(),
            config.embedding.clone(),
        );
        let tree = HierarchicalSummaryTree::new(
            llm.clone(),
            embedder.clone(),
            index.clone(),
            prompts.clone(),
            Arc::clone(&locks),
            config.tree.clone(),
            config.embedding.clone(),
        );
        let communities = CommunityEngine::new(
            llm.clone(),
            embedder.clone(),
            index.clone(),
            prompts.clone(),
            Arc::clone(&locks),
            config.communities.clone(),
            config.embedding.clone(),
        );
        let retriever = IterativeRetriever::new(
            llm.clone(),
            embedder.clone(),
            index.clone(),
            prompts.clone(),
            config.drift.clone(),
        );
        let router = QueryRouter::new(
            retriever,
            llm.clone(),
            embedder.clone(),
            index.clone(),
            prompts,
            config.router.clone(),
            config.drift.top_k,
        );

        info!(
            db = %config.db_path().display(),
            llm = llm.name(),
            embedder = embedder.name(),
            backend = ?index.backend(),
            dimension = index.dimension(),
            "engine ready"
        );
        Ok(Self { index, locks, extractor, tree, communities, router })
    }

    pub fn index(&self) -> &VectorIndexProvider {
        &self.index
    }

    pub fn store(&self) -> &GraphStore {
        self.index.store()
    }

    /// Store a document's chunks and update every derived structure.
    ///
    /// Re-ingesting the same document is a no-op for chunks and entities;
    /// the tree and communities are rebuilt either way.
    pub async fn ingest(&self, batch: IngestBatch) -> Result<IngestReport, EngineError> {
        let group = batch.group_id;
        if group.as_str().trim().is_empty() {
            return Err(EngineError::InvalidInput("group id is empty".into()));
        }
        if batch.document_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("document id is empty".into()));
        }
        let chunks: Vec<TextChunk> = batch
            .chunks
            .into_iter()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(i, text)| TextChunk::new(&group, &batch.document_id, i as u32, text))
            .collect();
        if chunks.is_empty() {
            return Err(EngineError::InvalidInput("batch has no non-empty chunks".into()));
        }

        let to_store = chunks.clone();
        let chunks_stored = self.store().run("store chunks", move |s| s.upsert_text_chunks(&to_store)).await?;
        info!(group_id = %group, document_id = %batch.document_id, chunks = chunks.len(), stored = chunks_stored, "ingesting");

        let (extraction, tree) = tokio::join!(self.extractor.build(&group, &chunks), self.tree.build(&group));
        let extraction = extraction?;
        let tree = tree?;
        let communities = self.communities.run(&group).await?;

        info!(
            group_id = %group,
            entities = extraction.entities_touched,
            tree_nodes = tree.nodes,
            communities = communities.communities,
            "ingest done"
        );
        Ok(IngestReport { chunks_stored, extraction, tree, communities })
    }

    /// Rebuild everything derived from the group's chunks.
    pub async fn reindex(&self, group: &GroupId) -> Result<ReindexReport, EngineError> {
        let g = group.clone();
        let chunks = self.store().run("load chunks", move |s| s.chunks_for_group(&g)).await?;
        let extraction = self.extractor.build(group, &chunks).await?;
        let entities_reembedded = self.extractor.reembed_entities(group).await?;
        let tree = self.tree.build(group).await?;
        let communities = self.communities.run(group).await?;
        info!(group_id = %group, entities_reembedded, tree_nodes = tree.nodes, communities = communities.communities, "reindex done");
        Ok(ReindexReport { extraction, entities_reembedded, tree, communities })
    }

    /// Delete every record of the group, vectors included. Waits for any
    /// merge, tree build or community run of the group to finish first.
    pub async fn purge(&self, group: &GroupId) -> Result<(), EngineError> {
        {
            let _guards = self.locks.acquire_all(group).await?;
            self.index.purge(group).await?;
        }
        self.locks.forget(group)?;
        info!(group_id = %group, "group purged");
        Ok(())
    }

    pub async fn query(
        &self,
        group: &GroupId,
        text: &str,
        options: &QueryOptions,
    ) -> Result<QueryResponse, EngineError> {
        self.router.query(group, text, options).await
    }

    pub async fn stats(&self, group: &GroupId) -> Result<GroupStats, EngineError> {
        let g = group.clone();
        self.store().run("group stats", move |s| s.group_stats(&g)).await
    }
}
