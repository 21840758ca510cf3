//! `QueryRouter`: picks flat, community or iterative search for a query.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::RouterConfig;
use crate::embedding::EmbeddingProvider;
use crate::llm::LlmProvider;

use super::drift::{Answer, DriftOutcome, IterativeRetriever, ProvenanceRef, SearchLimits, Termination};
use super::error::EngineError;
use super::index::VectorIndexProvider;
use super::model::{GroupId, RecordKind};
use super::prompts::{ANSWER_MAX_TOKENS, PromptKind, Prompts, truncate_to_tokens};

/// Phrases that ask about the corpus as a whole.
const GLOBAL_CUES: [&str; 6] = ["overall", "main themes", "summarize", "summary", "across", "in general"];
const FLAT_CONTEXT_TOKENS: usize = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One vector query over chunks, one completion.
    Flat,
    /// Primer only, over community summaries.
    Community,
    /// Full primer and follow-up search.
    Iterative,
    #[default]
    Auto,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Flat => "flat",
            Strategy::Community => "community",
            Strategy::Iterative => "iterative",
            Strategy::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Some(Strategy::Flat),
            "community" | "global" => Some(Strategy::Community),
            "iterative" | "drift" => Some(Strategy::Iterative),
            "auto" => Some(Strategy::Auto),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub strategy: Strategy,
    pub max_iterations: Option<u32>,
    pub convergence_threshold: Option<f32>,
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: Answer,
    pub provenance: Vec<ProvenanceRef>,
    pub iterations_used: u32,
    /// The strategy actually run (never `Auto`).
    pub strategy: Strategy,
    /// Why the follow-up loop stopped; `None` for strategies without one.
    pub termination: Option<Termination>,
    pub failed_steps: usize,
}

impl QueryResponse {
    fn no_answer(strategy: Strategy) -> Self {
        Self {
            answer: Answer::NoAnswerAvailable,
            provenance: Vec::new(),
            iterations_used: 0,
            strategy,
            termination: None,
            failed_steps: 0,
        }
    }

    fn from_outcome(strategy: Strategy, outcome: DriftOutcome) -> Self {
        Self {
            answer: outcome.answer,
            provenance: outcome.provenance,
            iterations_used: outcome.iterations_used,
            strategy,
            termination: outcome.termination,
            failed_steps: outcome.failed_steps,
        }
    }
}

/// Resolve `Auto` to a concrete strategy.
pub fn classify(query: &str, requested: Strategy, flat_max_words: usize) -> Strategy {
    if requested != Strategy::Auto {
        return requested;
    }
    let lower = query.to_lowercase();
    if GLOBAL_CUES.iter().any(|cue| lower.contains(cue)) {
        Strategy::Community
    } else if query.split_whitespace().count() <= flat_max_words {
        Strategy::Flat
    } else {
        Strategy::Iterative
    }
}

#[derive(Debug, Clone)]
pub struct QueryRouter {
    retriever: IterativeRetriever,
    llm: LlmProvider,
    embedder: EmbeddingProvider,
    index: VectorIndexProvider,
    prompts: Prompts,
    config: RouterConfig,
    top_k: usize,
}

impl QueryRouter {
    pub fn new(
        retriever: IterativeRetriever,
        llm: LlmProvider,
        embedder: EmbeddingProvider,
        index: VectorIndexProvider,
        prompts: Prompts,
        config: RouterConfig,
        top_k: usize,
    ) -> Self {
        Self { retriever, llm, embedder, index, prompts, config, top_k }
    }

    pub fn classify(&self, query: &str, requested: Strategy) -> Strategy {
        classify(query, requested, self.config.flat_max_words)
    }

    /// Run a query. A group with nothing searchable yields
    /// `Answer::NoAnswerAvailable`; isolation violations are returned as errors.
    pub async fn query(
        &self,
        group: &GroupId,
        text: &str,
        options: &QueryOptions,
    ) -> Result<QueryResponse, EngineError> {
        if text.trim().is_empty() {
            return Err(EngineError::InvalidInput("query text is empty".into()));
        }
        let strategy = self.classify(text, options.strategy);
        info!(group_id = %group, %strategy, "query");

        let result = match strategy {
            Strategy::Flat => self.flat(group, text).await,
            Strategy::Community => self
                .retriever
                .primer_only(group, text)
                .await
                .map(|o| QueryResponse::from_outcome(strategy, o)),
            Strategy::Iterative | Strategy::Auto => {
                let limits = SearchLimits {
                    max_iterations: options.max_iterations,
                    convergence_threshold: options.convergence_threshold,
                    deadline: options.deadline,
                };
                self.retriever
                    .search(group, text, &limits)
                    .await
                    .map(|o| QueryResponse::from_outcome(Strategy::Iterative, o))
            }
        };

        match result {
            Err(e @ (EngineError::IndexNotReady { .. } | EngineError::EmbeddingMissing { .. })) => {
                info!(group_id = %group, %strategy, reason = %e, "nothing searchable");
                Ok(QueryResponse::no_answer(strategy))
            }
            other => other,
        }
    }

    async fn flat(&self, group: &GroupId, text: &str) -> Result<QueryResponse, EngineError> {
        let embedding = self.embedder.embed(text).await?;
        let hits = self
            .index
            .query(group, &embedding, self.top_k, RecordKind::Chunk, None, &HashSet::new())
            .await?;
        if hits.is_empty() {
            return Ok(QueryResponse::no_answer(Strategy::Flat));
        }
        let share = FLAT_CONTEXT_TOKENS / hits.len();
        let context = hits
            .iter()
            .map(|h| format!("[{} {}] {}", h.kind, h.id, truncate_to_tokens(&h.text, share)))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = self.prompts.render(PromptKind::Answer, &[("query", text), ("context", &context)]);
        let answer = self.llm.complete(&prompt, ANSWER_MAX_TOKENS).await?;
        debug!(group_id = %group, hits = hits.len(), "flat answer");
        Ok(QueryResponse {
            answer: if answer.trim().is_empty() {
                Answer::NoAnswerAvailable
            } else {
                Answer::Text(answer.trim().to_string())
            },
            provenance: hits.iter().map(ProvenanceRef::from).collect(),
            iterations_used: 0,
            strategy: Strategy::Flat,
            termination: None,
            failed_steps: 0,
        })
    }
}
