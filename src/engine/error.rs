//! Engine error taxonomy.
//!
//! Per-chunk and per-step variants (`ExtractionParse`, `RetrievalStepFailure`)
//! are logged and recovered where they occur. Write-gate and isolation
//! variants always reach the caller.

use thiserror::Error;

use crate::embedding::EmbeddingError;
use crate::llm::ProviderError;

use super::model::RecordKind;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("extraction parse error for chunk {chunk_id}: {message}")]
    ExtractionParse { chunk_id: String, message: String },

    /// A record reached the index without a usable embedding.
    #[error("embedding missing for {kind} {record_id}: {reason}")]
    EmbeddingMissing { kind: RecordKind, record_id: String, reason: String },

    /// The group holds no records of this kind at all.
    #[error("index not ready: no {kind} records for group {group_id}")]
    IndexNotReady { kind: RecordKind, group_id: String },

    #[error("group isolation violation: record {record_id} belongs to {found}, expected {expected}")]
    GroupIsolationViolation { expected: String, found: String, record_id: String },

    #[error("retrieval step failed for \"{question}\": {message}")]
    RetrievalStepFailure { question: String, message: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
