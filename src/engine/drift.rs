//! `IterativeRetriever`: primer, follow-up rounds, synthesis.
//!
//! The primer reads community summaries (or, when a group has none, the top
//! tree level) and asks for a first answer plus follow-up questions. Each
//! iteration then answers a batch of pending questions concurrently against
//! entities, chunks and tree nodes, never retrieving a record twice for the
//! same query. After every iteration the loop stops on the first of:
//! deadline, iteration cap, an iteration with no successful step, or a
//! convergence score below the threshold. Synthesis then combines whatever
//! was gathered.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DriftConfig;
use crate::embedding::EmbeddingProvider;
use crate::llm::LlmProvider;

use super::error::EngineError;
use super::index::VectorIndexProvider;
use super::model::{GroupId, RecordKind, VectorHit};
use super::prompts::{ANSWER_MAX_TOKENS, PromptKind, Prompts, json_object_span, truncate_to_tokens};

/// Token budget for the retrieved context placed in one prompt.
const CONTEXT_TOKEN_BUDGET: usize = 3000;
/// Score assumed for a primer reply that is not JSON.
const FALLBACK_PRIMER_SCORE: f32 = 0.5;
const FOLLOW_UP_KINDS: [RecordKind; 3] = [RecordKind::Entity, RecordKind::Chunk, RecordKind::TreeNode];

// ── Results ───────────────────────────────────────────────────────────────────

/// Final answer of a query. Never an empty string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum Answer {
    Text(String),
    NoAnswerAvailable,
}

impl Answer {
    pub fn text(&self) -> Option<&str> {
        match self {
            Answer::Text(t) => Some(t),
            Answer::NoAnswerAvailable => None,
        }
    }

    fn from_text(text: String) -> Self {
        if text.trim().is_empty() { Answer::NoAnswerAvailable } else { Answer::Text(text) }
    }
}

/// A record that contributed context to the answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProvenanceRef {
    pub kind: RecordKind,
    pub id: String,
}

impl From<&VectorHit> for ProvenanceRef {
    fn from(hit: &VectorHit) -> Self {
        Self { kind: hit.kind, id: hit.id.clone() }
    }
}

/// Why the follow-up loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    NoPendingQuestions,
    MaxIterationsExceeded,
    DeadlineExceeded,
    /// An iteration in which every step failed.
    Stalled,
}

#[derive(Debug, Clone)]
pub struct DriftOutcome {
    pub answer: Answer,
    pub provenance: Vec<ProvenanceRef>,
    pub iterations_used: u32,
    pub termination: Option<Termination>,
    pub failed_steps: usize,
}

/// Per-query limits. `None` falls back to the configured default.
#[derive(Debug, Clone, Default)]
pub struct SearchLimits {
    pub max_iterations: Option<u32>,
    pub convergence_threshold: Option<f32>,
    pub deadline: Option<Duration>,
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IntermediateAnswer {
    pub question: String,
    pub answer: String,
    pub score: f32,
}

/// Query-scoped search state. Created per query, owned by one task.
#[derive(Debug)]
pub struct DriftState {
    pub query: String,
    pub iteration: u32,
    pub primer_answer: Option<String>,
    /// Pending questions, in the order they will be asked.
    pub follow_up_questions: Vec<String>,
    pub intermediate_answers: Vec<IntermediateAnswer>,
    /// Every record id retrieved so far. Only grows.
    pub visited: HashSet<String>,
    pub provenance: Vec<ProvenanceRef>,
    pub convergence_score: f32,
    pub max_iterations: u32,
    pub deadline: Instant,
    pub successful_steps: usize,
    pub failed_steps: usize,
    asked: HashSet<String>,
}

impl DriftState {
    fn new(query: &str, max_iterations: u32, deadline: Instant) -> Self {
        Self {
            query: query.to_string(),
            iteration: 0,
            primer_answer: None,
            follow_up_questions: Vec::new(),
            intermediate_answers: Vec::new(),
            visited: HashSet::new(),
            provenance: Vec::new(),
            convergence_score: 0.0,
            max_iterations,
            deadline,
            successful_steps: 0,
            failed_steps: 0,
            asked: HashSet::new(),
        }
    }

    /// Mark hits visited; returns how many were new.
    fn visit(&mut self, hits: &[VectorHit]) -> usize {
        let mut fresh = 0;
        for hit in hits {
            if self.visited.insert(hit.id.clone()) {
                self.provenance.push(ProvenanceRef::from(hit));
                fresh += 1;
            }
        }
        fresh
    }

    /// Queue questions not asked before (case-insensitive).
    fn enqueue(&mut self, questions: impl IntoIterator<Item = String>) {
        for q in questions {
            let q = q.trim().to_string();
            if !q.is_empty() && self.asked.insert(q.to_lowercase()) {
                self.follow_up_questions.push(q);
            }
        }
    }
}

// ── Completion replies ────────────────────────────────────────────────────────

fn default_score() -> f32 {
    FALLBACK_PRIMER_SCORE
}

#[derive(Debug, Deserialize)]
struct StepReply {
    #[serde(default)]
    answer: String,
    #[serde(default = "default_score")]
    score: f32,
    #[serde(default)]
    follow_up_questions: Vec<String>,
}

fn parse_step_reply(raw: &str) -> Option<StepReply> {
    let reply: StepReply = serde_json::from_str(json_object_span(raw)?).ok()?;
    let score = if reply.score.is_finite() { reply.score.clamp(0.0, 1.0) } else { 0.0 };
    Some(StepReply { score, ..reply })
}

/// One hit per line, each truncated to an even share of the budget.
fn format_context(hits: &[VectorHit]) -> String {
    let share = CONTEXT_TOKEN_BUDGET / hits.len().max(1);
    hits.iter()
        .map(|h| format!("[{} {}] {}", h.kind, h.id, truncate_to_tokens(&h.text, share)))
        .collect::<Vec<_>>()
        .join("\n")
}

struct Step {
    question: String,
    reply: StepReply,
    hits: Vec<VectorHit>,
}

// ── Retriever ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IterativeRetriever {
    llm: LlmProvider,
    embedder: EmbeddingProvider,
    index: VectorIndexProvider,
    prompts: Prompts,
    config: DriftConfig,
}

impl IterativeRetriever {
    pub fn new(
        llm: LlmProvider,
        embedder: EmbeddingProvider,
        index: VectorIndexProvider,
        prompts: Prompts,
        config: DriftConfig,
    ) -> Self {
        Self { llm, embedder, index, prompts, config }
    }

    /// Full search: primer, follow-up loop, synthesis.
    pub async fn search(
        &self,
        group: &GroupId,
        query: &str,
        limits: &SearchLimits,
    ) -> Result<DriftOutcome, EngineError> {
        let max_iterations = limits.max_iterations.unwrap_or(self.config.max_iterations);
        let threshold = limits.convergence_threshold.unwrap_or(self.config.convergence_threshold);
        let deadline = Instant::now()
            + limits.deadline.unwrap_or(Duration::from_secs(self.config.deadline_seconds));
        let mut state = DriftState::new(query, max_iterations, deadline);
        state.asked.insert(query.trim().to_lowercase());

        let query_embedding = self.embedder.embed(query).await?;
        self.primer(group, &query_embedding, &mut state).await?;
        if state.follow_up_questions.is_empty() {
            state.follow_up_questions.push(query.to_string());
        }

        let termination = loop {
            if state.follow_up_questions.is_empty() {
                break Termination::NoPendingQuestions;
            }
            if state.iteration >= state.max_iterations {
                break Termination::MaxIterationsExceeded;
            }
            if Instant::now() >= state.deadline {
                break Termination::DeadlineExceeded;
            }

            state.iteration += 1;
            let take = self.config.follow_up_batch.min(state.follow_up_questions.len());
            let batch: Vec<String> = state.follow_up_questions.drain(..take).collect();
            let visited = state.visited.clone();
            let results: Vec<Result<Result<Step, String>, EngineError>> = stream::iter(batch.iter())
                .map(|q| self.follow_up(group, query, q, &visited))
                .buffered(self.config.concurrency.max(1))
                .collect()
                .await;

            let mut succeeded = 0usize;
            let mut fresh = 0usize;
            let mut score_sum = 0.0f32;
            for (question, result) in batch.iter().zip(results) {
                match result? {
                    Ok(step) => {
                        succeeded += 1;
                        fresh += state.visit(&step.hits);
                        score_sum += step.reply.score;
                        state.intermediate_answers.push(IntermediateAnswer {
                            question: step.question,
                            answer: step.reply.answer,
                            score: step.reply.score,
                        });
                        state.enqueue(step.reply.follow_up_questions);
                    }
                    Err(message) => {
                        state.failed_steps += 1;
                        let err = EngineError::RetrievalStepFailure { question: question.clone(), message };
                        warn!(group_id = %group, iteration = state.iteration, error = %err, "follow-up step failed");
                    }
                }
            }
            state.successful_steps += succeeded;

            state.convergence_score = if succeeded == 0 {
                0.0
            } else {
                let capacity = (succeeded * self.config.top_k * FOLLOW_UP_KINDS.len()) as f32;
                let novelty = (fresh as f32 / capacity).min(1.0);
                novelty * (score_sum / succeeded as f32)
            };
            debug!(
                group_id = %group,
                iteration = state.iteration,
                succeeded,
                fresh,
                convergence = state.convergence_score,
                "iteration done"
            );

            if Instant::now() >= state.deadline {
                break Termination::DeadlineExceeded;
            }
            if state.iteration >= state.max_iterations {
                break Termination::MaxIterationsExceeded;
            }
            if succeeded == 0 {
                break Termination::Stalled;
            }
            if state.convergence_score < threshold {
                break Termination::Converged;
            }
        };

        let answer = self.synthesize(group, &state).await;
        info!(
            group_id = %group,
            iterations = state.iteration,
            ?termination,
            visited = state.visited.len(),
            succeeded = state.successful_steps,
            failed = state.failed_steps,
            "search done"
        );
        Ok(DriftOutcome {
            answer,
            provenance: state.provenance,
            iterations_used: state.iteration,
            termination: Some(termination),
            failed_steps: state.failed_steps,
        })
    }

    /// Primer alone: community-level answer without follow-ups.
    pub async fn primer_only(&self, group: &GroupId, query: &str) -> Result<DriftOutcome, EngineError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.deadline_seconds);
        let mut state = DriftState::new(query, 0, deadline);
        let query_embedding = self.embedder.embed(query).await?;
        self.primer(group, &query_embedding, &mut state).await?;
        let answer = match state.primer_answer.take() {
            Some(text) => Answer::from_text(text),
            None => Answer::NoAnswerAvailable,
        };
        Ok(DriftOutcome {
            answer,
            provenance: state.provenance,
            iterations_used: 0,
            termination: None,
            failed_steps: state.failed_steps,
        })
    }

    /// Coarse context for the primer: communities at the primer level, or
    /// the top level of the summary tree when the group has no communities.
    async fn primer_context(&self, group: &GroupId, embedding: &[f32]) -> Result<Vec<VectorHit>, EngineError> {
        let none = HashSet::new();
        let k = self.config.primer_k;
        match self
            .index
            .query(group, embedding, k, RecordKind::Community, Some(self.config.primer_level), &none)
            .await
        {
            Ok(hits) if !hits.is_empty() => return Ok(hits),
            Ok(_) | Err(EngineError::IndexNotReady { .. }) => {}
            Err(e) => return Err(e),
        }
        let g = group.clone();
        let Some(top) = self.index.store().run("max tree level", move |s| s.max_tree_level(&g)).await?
        else {
            return Ok(Vec::new());
        };
        match self.index.query(group, embedding, k, RecordKind::TreeNode, Some(top), &none).await {
            Ok(hits) => Ok(hits),
            Err(EngineError::IndexNotReady { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn primer(&self, group: &GroupId, embedding: &[f32], state: &mut DriftState) -> Result<(), EngineError> {
        let hits = self.primer_context(group, embedding).await?;
        if hits.is_empty() {
            debug!(group_id = %group, "no primer context");
            return Ok(());
        }
        state.visit(&hits);
        let context = format_context(&hits);
        let prompt = self
            .prompts
            .render(PromptKind::Primer, &[("query", &state.query), ("context", &context)]);
        let raw = match self.llm.complete(&prompt, ANSWER_MAX_TOKENS).await {
            Ok(raw) => raw,
            Err(e) => {
                state.failed_steps += 1;
                let err = EngineError::RetrievalStepFailure { question: state.query.clone(), message: e.to_string() };
                warn!(group_id = %group, error = %err, "primer completion failed");
                return Ok(());
            }
        };
        let reply = parse_step_reply(&raw).unwrap_or_else(|| StepReply {
            answer: raw.trim().to_string(),
            score: FALLBACK_PRIMER_SCORE,
            follow_up_questions: Vec::new(),
        });
        state.successful_steps += 1;
        state.primer_answer = Some(reply.answer);
        state.enqueue(reply.follow_up_questions);
        debug!(group_id = %group, hits = hits.len(), follow_ups = state.follow_up_questions.len(), "primer done");
        Ok(())
    }

    /// One follow-up question. The outer error is fatal to the query and is
    /// only ever an isolation violation; the inner one is a failed step.
    async fn follow_up(
        &self,
        group: &GroupId,
        query: &str,
        question: &str,
        visited: &HashSet<String>,
    ) -> Result<Result<Step, String>, EngineError> {
        let embedding = match self.embedder.embed(question).await {
            Ok(e) => e,
            Err(e) => return Ok(Err(format!("embedding failed: {e}"))),
        };
        let mut hits = Vec::new();
        for kind in FOLLOW_UP_KINDS {
            match self.index.query(group, &embedding, self.config.top_k, kind, None, visited).await {
                Ok(found) => hits.extend(found),
                Err(EngineError::IndexNotReady { .. } | EngineError::EmbeddingMissing { .. }) => {
                    debug!(group_id = %group, %kind, "kind not queryable; skipped");
                }
                Err(e @ EngineError::GroupIsolationViolation { .. }) => return Err(e),
                Err(e) => return Ok(Err(e.to_string())),
            }
        }
        if hits.is_empty() {
            return Ok(Err("no unvisited records matched".into()));
        }

        let context = format_context(&hits);
        let prompt = self.prompts.render(
            PromptKind::FollowUp,
            &[("query", query), ("question", question), ("context", &context)],
        );
        let raw = match self.llm.complete(&prompt, ANSWER_MAX_TOKENS).await {
            Ok(raw) => raw,
            Err(e) => return Ok(Err(e.to_string())),
        };
        match parse_step_reply(&raw) {
            Some(reply) => Ok(Ok(Step { question: question.to_string(), reply, hits })),
            None => Ok(Err("follow-up reply is not JSON".into())),
        }
    }

    async fn synthesize(&self, group: &GroupId, state: &DriftState) -> Answer {
        if state.successful_steps == 0 {
            return Answer::NoAnswerAvailable;
        }
        let answers = state
            .intermediate_answers
            .iter()
            .map(|a| format!("Q: {}\nA: {} (score {:.2})", a.question, a.answer, a.score))
            .collect::<Vec<_>>()
            .join("\n\n");
        let primer = state.primer_answer.as_deref().unwrap_or("(none)");
        let prompt = self.prompts.render(
            PromptKind::Synthesize,
            &[("query", &state.query), ("primer", primer), ("answers", &answers)],
        );
        match self.llm.complete(&prompt, ANSWER_MAX_TOKENS).await {
            Ok(text) if !text.trim().is_empty() => Answer::Text(text.trim().to_string()),
            Ok(_) | Err(_) => {
                warn!(group_id = %group, "synthesis failed; returning gathered answers");
                let mut parts: Vec<&str> = state.primer_answer.iter().map(String::as_str).collect();
                parts.extend(state.intermediate_answers.iter().map(|a| a.answer.as_str()));
                Answer::from_text(parts.join("\n"))
            }
        }
    }
}
