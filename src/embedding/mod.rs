//! Embedding provider abstraction.
//!
//! Mirrors `llm`: `EmbeddingProvider` is an enum over concrete backends,
//! built once by `providers::build` and cloned freely.

pub mod providers;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("unknown embedding provider: {0}")]
    UnknownProvider(String),
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding response had {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },
}

// ── Provider enum ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum EmbeddingProvider {
    Hashing(providers::hashing::HashingEmbedder),
    OpenAiCompatible(providers::openai_compatible::OpenAiEmbedder),
}

impl EmbeddingProvider {
    /// Dimension of every vector this provider returns.
    pub fn dimension(&self) -> usize {
        match self {
            EmbeddingProvider::Hashing(p) => p.dimension(),
            EmbeddingProvider::OpenAiCompatible(p) => p.dimension(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EmbeddingProvider::Hashing(_) => "hashing",
            EmbeddingProvider::OpenAiCompatible(_) => "openai",
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut out = self.embed_many(&[text.to_string()]).await?;
        out.pop().ok_or(EmbeddingError::CountMismatch { expected: 1, got: 0 })
    }

    /// Embed `texts` in one provider call; output order matches input order.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let out = match self {
            EmbeddingProvider::Hashing(p) => p.embed_many(texts),
            EmbeddingProvider::OpenAiCompatible(p) => p.embed_many(texts).await?,
        };
        if out.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch { expected: texts.len(), got: out.len() });
        }
        Ok(out)
    }

    /// Split `texts` into `batch_size` requests with at most `concurrency` in
    /// flight. Fails as a whole if any batch fails.
    pub async fn embed_batched(
        &self,
        texts: &[String],
        batch_size: usize,
        concurrency: usize,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let batches: Vec<&[String]> = texts.chunks(batch_size.max(1)).collect();
        let results: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|batch| self.embed_many(batch))
            .buffered(concurrency.max(1))
            .try_collect()
            .await?;
        Ok(results.into_iter().flatten().collect())
    }
}
