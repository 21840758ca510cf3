//! `EntityGraphBuilder`: text chunks in, merged entities and relationships out.
//!
//! Each chunk gets one extraction completion (plus one strict retry when the
//! reply does not parse). Chunks are extracted concurrently; merging into the
//! graph holds the group's write lock so two chunks introducing the same
//! entity cannot race. Every entity a merge touches is re-embedded and
//! written through the index gate.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{EmbeddingConfig, ExtractionConfig};
use crate::embedding::EmbeddingProvider;
use crate::llm::LlmProvider;

use super::error::EngineError;
use super::index::VectorIndexProvider;
use super::locks::WriteLocks;
use super::model::{
    Entity, EntityMention, ExtractionOutcome, GroupId, IndexRecord, RelationshipMention, TextChunk,
};
use super::prompts::{PromptKind, Prompts, json_object_span};

/// Shape of an extraction completion.
#[derive(Debug, Default, Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    entities: Vec<EntityMention>,
    #[serde(default)]
    relationships: Vec<RelationshipMention>,
}

fn parse_extraction(raw: &str) -> Result<ExtractionReply, String> {
    let span = json_object_span(raw).ok_or_else(|| "no JSON object in completion".to_string())?;
    serde_json::from_str(span).map_err(|e| e.to_string())
}

/// Totals for one `build` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionReport {
    pub chunks_merged: usize,
    /// Chunks found in the extraction ledger; no completion was made.
    pub chunks_already_merged: usize,
    pub parse_failures: usize,
    pub provider_failures: usize,
    pub entities_touched: usize,
    pub relationships: usize,
    pub unresolved_relationships: usize,
}

enum ChunkResult {
    Merged(ExtractionOutcome),
    AlreadyMerged,
    ParseFailed,
    ProviderFailed,
    Gone,
}

#[derive(Debug, Clone)]
pub struct EntityGraphBuilder {
    llm: LlmProvider,
    embedder: EmbeddingProvider,
    index: VectorIndexProvider,
    prompts: Prompts,
    locks: Arc<WriteLocks>,
    config: ExtractionConfig,
    embedding: EmbeddingConfig,
}

impl EntityGraphBuilder {
    pub fn new(
        llm: LlmProvider,
        embedder: EmbeddingProvider,
        index: VectorIndexProvider,
        prompts: Prompts,
        locks: Arc<WriteLocks>,
        config: ExtractionConfig,
        embedding: EmbeddingConfig,
    ) -> Self {
        Self { llm, embedder, index, prompts, locks, config, embedding }
    }

    /// Extract and merge every chunk of `group` not yet in the ledger.
    ///
    /// Unparseable replies and failed completions skip their chunk; storage,
    /// embedding and gate errors abort the call.
    pub async fn build(
        &self,
        group: &GroupId,
        chunks: &[TextChunk],
    ) -> Result<ExtractionReport, EngineError> {
        if let Some(foreign) = chunks.iter().find(|c| &c.group_id != group) {
            return Err(EngineError::GroupIsolationViolation {
                expected: group.to_string(),
                found: foreign.group_id.to_string(),
                record_id: foreign.id.clone(),
            });
        }

        let done = {
            let g = group.clone();
            self.index.store().run("read extraction ledger", move |s| s.extracted_chunk_ids(&g)).await?
        };
        let mut report = ExtractionReport::default();
        let pending: Vec<&TextChunk> = chunks
            .iter()
            .filter(|c| {
                let seen = done.contains(&c.id);
                if seen {
                    report.chunks_already_merged += 1;
                }
                !seen
            })
            .collect();
        debug!(group_id = %group, pending = pending.len(), "extraction start");

        let results: Vec<Result<ChunkResult, EngineError>> = stream::iter(pending)
            .map(|chunk| self.process_chunk(group, chunk))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result? {
                ChunkResult::Merged(outcome) => {
                    report.chunks_merged += 1;
                    report.entities_touched += outcome.entities.len();
                    report.relationships += outcome.relationships;
                    report.unresolved_relationships += outcome.unresolved;
                }
                ChunkResult::AlreadyMerged => report.chunks_already_merged += 1,
                ChunkResult::ParseFailed => report.parse_failures += 1,
                ChunkResult::ProviderFailed => report.provider_failures += 1,
                ChunkResult::Gone => {}
            }
        }
        info!(
            group_id = %group,
            merged = report.chunks_merged,
            skipped = report.chunks_already_merged,
            parse_failures = report.parse_failures,
            provider_failures = report.provider_failures,
            "extraction done"
        );
        Ok(report)
    }

    async fn process_chunk(
        &self,
        group: &GroupId,
        chunk: &TextChunk,
    ) -> Result<ChunkResult, EngineError> {
        let reply = match self.extract(group, chunk).await {
            Ok(reply) => reply,
            Err(result) => return Ok(result),
        };

        let _guard = self.locks.merges.acquire(group).await?;
        let g = group.clone();
        let chunk_id = chunk.id.clone();
        let cap = self.config.max_relationship_descriptions;
        let outcome = self
            .index
            .store()
            .run("extraction merge", move |s| {
                // a purge may have removed the chunk while its completion ran
                if !s.has_chunk(&g, &chunk_id)? {
                    return Ok(Err(()));
                }
                s.upsert_extraction(&g, &chunk_id, &reply.entities, &reply.relationships, cap)
                    .map(Ok)
            })
            .await?;
        let outcome = match outcome {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return Ok(ChunkResult::AlreadyMerged),
            Err(()) => {
                debug!(group_id = %group, chunk_id = %chunk.id, "chunk no longer stored; not merged");
                return Ok(ChunkResult::Gone);
            }
        };
        self.index_entities(outcome.entities.clone()).await?;
        debug!(
            group_id = %group,
            chunk_id = %chunk.id,
            entities = outcome.entities.len(),
            relationships = outcome.relationships,
            "chunk merged"
        );
        Ok(ChunkResult::Merged(outcome))
    }

    /// Completion plus one strict retry. `Err` carries the skip reason.
    async fn extract(
        &self,
        group: &GroupId,
        chunk: &TextChunk,
    ) -> Result<ExtractionReply, ChunkResult> {
        let mut last_error = String::new();
        for kind in [PromptKind::Extract, PromptKind::ExtractStrict] {
            let prompt = self.prompts.render(kind, &[("text", &chunk.text)]);
            let raw = match self.llm.complete(&prompt, self.config.max_tokens).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(
                        group_id = %group,
                        chunk_id = %chunk.id,
                        provider = self.llm.name(),
                        error = %e,
                        "extraction completion failed; skipping chunk"
                    );
                    return Err(ChunkResult::ProviderFailed);
                }
            };
            match parse_extraction(&raw) {
                Ok(reply) => return Ok(reply),
                Err(message) => {
                    debug!(chunk_id = %chunk.id, tag = kind.tag(), %message, "extraction reply unparseable");
                    last_error = message;
                }
            }
        }
        let err = EngineError::ExtractionParse { chunk_id: chunk.id.clone(), message: last_error };
        warn!(group_id = %group, chunk_id = %chunk.id, error = %err, "skipping chunk");
        Err(ChunkResult::ParseFailed)
    }

    async fn index_entities(&self, entities: Vec<Entity>) -> Result<(), EngineError> {
        if entities.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = entities.iter().map(Entity::embedding_text).collect();
        let vectors = self
            .embedder
            .embed_batched(&texts, self.embedding.batch_size, self.embedding.concurrency)
            .await?;
        let records = entities
            .into_iter()
            .zip(vectors)
            .map(|(entity, v)| IndexRecord::Entity { entity, embedding: Some(v) })
            .collect();
        self.index.write_many(records).await
    }

    /// Re-embed every entity of the group. Used by reindex after the
    /// embedding provider or dimension changed.
    pub async fn reembed_entities(&self, group: &GroupId) -> Result<usize, EngineError> {
        let _guard = self.locks.merges.acquire(group).await?;
        let g = group.clone();
        let entities = self.index.store().run("load entities", move |s| s.entities_for_group(&g)).await?;
        let n = entities.len();
        self.index_entities(entities).await?;
        info!(group_id = %group, entities = n, "entities re-embedded");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, VectorBackend};
    use crate::embedding::providers::hashing::HashingEmbedder;
    use crate::engine::model::RecordKind;
    use crate::engine::store::GraphStore;
    use crate::llm::ProviderError;
    use crate::llm::providers::scripted::ScriptedProvider;
    use tempfile::TempDir;

    const ACME_REPLY: &str = r#"```json
{"entities": [{"name": "Acme Corp", "type": "organization", "description": "Maker of rockets"},
              {"name": "Jane Doe", "type": "person", "description": "Engineer"}],
 "relationships": [{"source": "Jane Doe", "target": "Acme Corp", "description": "works at"}]}
```"#;

    const SHOUTY_REPLY: &str = r#"{"entities": [{"name": "ACME CORP.", "type": "Organization", "description": "Rocket firm"}], "relationships": []}"#;

    fn builder(dir: &std::path::Path, scripted: ScriptedProvider) -> EntityGraphBuilder {
        let store = GraphStore::open(&dir.join("graph.db")).unwrap();
        let index_cfg = IndexConfig { backend: VectorBackend::Embedded, external_path: dir.join("v.db") };
        let index = VectorIndexProvider::new(store, 64, &index_cfg).unwrap();
        let embedding = EmbeddingConfig { dimension: 64, ..EmbeddingConfig::default() };
        EntityGraphBuilder::new(
            LlmProvider::Scripted(scripted),
            EmbeddingProvider::Hashing(HashingEmbedder::new(64)),
            index,
            Prompts::default(),
            Arc::new(WriteLocks::new()),
            ExtractionConfig::default(),
            embedding,
        )
    }

    fn responder(prompt: &str) -> Result<String, ProviderError> {
        if prompt.contains("ACME CORP.") {
            Ok(SHOUTY_REPLY.into())
        } else if prompt.contains("Acme Corp") {
            Ok(ACME_REPLY.into())
        } else {
            Ok(r#"{"entities": [], "relationships": []}"#.into())
        }
    }

    #[test]
    fn parse_tolerates_fences_and_missing_fields() {
        let reply = parse_extraction(ACME_REPLY).unwrap();
        assert_eq!(reply.entities.len(), 2);
        assert_eq!(reply.relationships[0].target, "Acme Corp");
        let bare = parse_extraction(r#"{"entities": [{"name": "X"}]}"#).unwrap();
        assert_eq!(bare.entities[0].entity_type, "");
        assert!(bare.relationships.is_empty());
        assert!(parse_extraction("I could not find anything").is_err());
    }

    #[tokio::test]
    async fn same_entity_across_chunks_merges_and_is_embedded() {
        let tmp = TempDir::new().unwrap();
        let scripted = ScriptedProvider::new(responder);
        let b = builder(tmp.path(), scripted.clone());
        let g = GroupId::from("g");
        let chunks = vec![
            TextChunk::new(&g, "doc", 0, "Jane Doe works at Acme Corp.".into()),
            TextChunk::new(&g, "doc", 1, "ACME CORP. builds rockets.".into()),
        ];
        b.index.store().upsert_text_chunks(&chunks).unwrap();
        let report = b.build(&g, &chunks).await.unwrap();
        assert_eq!(report.chunks_merged, 2);
        assert_eq!(report.relationships, 1);

        let entities = b.index.store().entities_for_group(&g).unwrap();
        let acme: Vec<_> = entities.iter().filter(|e| e.normalized_name == "acme corp").collect();
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].mention_count, 2);
        assert_eq!(b.index.vector_count(RecordKind::Entity, &g).await.unwrap(), entities.len());

        // second run is a ledger hit: no completions, no count changes
        let calls = scripted.calls();
        let again = b.build(&g, &chunks).await.unwrap();
        assert_eq!(again.chunks_already_merged, 2);
        assert_eq!(scripted.calls(), calls);
        assert_eq!(b.index.store().entities_for_group(&g).unwrap(), entities);
    }

    #[tokio::test]
    async fn unparseable_reply_is_retried_once_then_skipped() {
        let tmp = TempDir::new().unwrap();
        let scripted = ScriptedProvider::new(|_| Ok("no entities here, sorry".into()));
        let b = builder(tmp.path(), scripted.clone());
        let g = GroupId::from("g");
        let chunks = vec![TextChunk::new(&g, "doc", 0, "text".into())];
        let report = b.build(&g, &chunks).await.unwrap();
        assert_eq!(report.parse_failures, 1);
        assert_eq!(scripted.calls(), 2);
        assert!(b.index.store().extracted_chunk_ids(&g).unwrap().is_empty());
    }

    #[tokio::test]
    async fn strict_retry_can_recover() {
        let tmp = TempDir::new().unwrap();
        let scripted = ScriptedProvider::new(|prompt| {
            if prompt.starts_with(crate::engine::prompts::TAG_EXTRACT_STRICT) {
                Ok(SHOUTY_REPLY.into())
            } else {
                Ok("garbage".into())
            }
        });
        let b = builder(tmp.path(), scripted);
        let g = GroupId::from("g");
        let chunk = TextChunk::new(&g, "d", 0, "x".into());
        b.index.store().upsert_text_chunk(&chunk).unwrap();
        let report = b.build(&g, &[chunk]).await.unwrap();
        assert_eq!(report.chunks_merged, 1);
        assert_eq!(report.parse_failures, 0);
    }

    #[tokio::test]
    async fn chunk_removed_before_merge_adds_nothing() {
        let tmp = TempDir::new().unwrap();
        let b = builder(tmp.path(), ScriptedProvider::new(responder));
        let g = GroupId::from("g");
        let chunk = TextChunk::new(&g, "doc", 0, "Jane Doe works at Acme Corp.".into());
        // never stored, as if purged while the completion was running
        let report = b.build(&g, &[chunk]).await.unwrap();
        assert_eq!(report.chunks_merged, 0);
        assert!(b.index.store().entities_for_group(&g).unwrap().is_empty());
        assert!(b.index.store().extracted_chunk_ids(&g).unwrap().is_empty());
        assert_eq!(b.index.vector_count(RecordKind::Entity, &g).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn provider_failure_skips_chunk_without_ledger_entry() {
        let tmp = TempDir::new().unwrap();
        let scripted = ScriptedProvider::new(|_| Err(ProviderError::Request("down".into())));
        let b = builder(tmp.path(), scripted);
        let g = GroupId::from("g");
        let report = b.build(&g, &[TextChunk::new(&g, "d", 0, "x".into())]).await.unwrap();
        assert_eq!(report.provider_failures, 1);
        assert!(b.index.store().extracted_chunk_ids(&g).unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_chunk_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let b = builder(tmp.path(), ScriptedProvider::new(responder));
        let chunk = TextChunk::new(&GroupId::from("b"), "d", 0, "x".into());
        let err = b.build(&GroupId::from("a"), &[chunk]).await.unwrap_err();
        assert!(matches!(err, EngineError::GroupIsolationViolation { .. }));
    }
}
