//! Public configuration types.
//!
//! These are the resolved, ready-to-use structs that the engine consumes.
//! Raw TOML deserialization types live in `raw.rs`.

use std::path::{Path, PathBuf};

use crate::error::AppError;

// ── LLM ──────────────────────────────────────────────────────────────────────

/// OpenAI-compatible chat completion settings.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.2,
            timeout_seconds: 60,
        }
    }
}

/// Completion provider selection.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Active provider name (`"dummy"` or `"openai"`).
    pub provider: String,
    pub openai: OpenAiConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self { provider: "dummy".into(), openai: OpenAiConfig::default() }
    }
}

// ── Embedding ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingConfig {
    pub api_base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
}

impl Default for OpenAiEmbeddingConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.openai.com/v1/embeddings".into(),
            model: "text-embedding-3-small".into(),
            timeout_seconds: 60,
        }
    }
}

/// Embedding provider selection and batching limits.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Active provider name (`"hashing"` or `"openai"`).
    pub provider: String,
    /// Vector dimension every indexed record must carry.
    pub dimension: usize,
    pub batch_size: usize,
    /// Upper bound on in-flight embedding batches.
    pub concurrency: usize,
    pub openai: OpenAiEmbeddingConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".into(),
            dimension: 256,
            batch_size: 16,
            concurrency: 4,
            openai: OpenAiEmbeddingConfig::default(),
        }
    }
}

// ── Index ────────────────────────────────────────────────────────────────────

/// Where vectors live. Fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    /// Vectors share the graph database.
    Embedded,
    /// Vectors live in a separate store; content is mirrored into the graph.
    External,
}

impl VectorBackend {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "embedded" => Some(Self::Embedded),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub backend: VectorBackend,
    /// Location of the external vector store (used only by `External`).
    pub external_path: PathBuf,
}

impl IndexConfig {
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self { backend: VectorBackend::Embedded, external_path: data_dir.join("vectors.db") }
    }
}

// ── Pipeline tuning ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Chunks extracted concurrently.
    pub concurrency: usize,
    /// Cap on descriptions kept per relationship.
    pub max_relationship_descriptions: usize,
    pub max_tokens: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self { concurrency: 4, max_relationship_descriptions: 8, max_tokens: 800 }
    }
}

/// Summary tree shape.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Soft target for members per cluster.
    pub cluster_size: usize,
    /// Below this many members a level is not clustered.
    pub min_cluster_size: usize,
    /// Highest node level above the chunks.
    pub max_levels: u32,
    /// Dimension embeddings are projected to before clustering.
    pub reduced_dimension: usize,
    pub summary_token_budget: usize,
    /// Summary completions in flight per level.
    pub concurrency: usize,
    pub seed: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            cluster_size: 6,
            min_cluster_size: 3,
            max_levels: 4,
            reduced_dimension: 32,
            summary_token_budget: 2000,
            concurrency: 4,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommunityConfig {
    pub max_levels: u32,
    /// Communities larger than this are partitioned again one level down.
    pub max_cluster_size: usize,
    pub summary_token_budget: usize,
    /// Summary completions in flight.
    pub concurrency: usize,
    pub seed: u64,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            max_levels: 3,
            max_cluster_size: 12,
            summary_token_budget: 2000,
            concurrency: 4,
            seed: 7,
        }
    }
}

/// Iterative search limits. `max_iterations`, `convergence_threshold` and the
/// deadline are per-query defaults; callers may override the first two.
#[derive(Debug, Clone)]
pub struct DriftConfig {
    pub max_iterations: u32,
    pub convergence_threshold: f32,
    pub deadline_seconds: u64,
    pub primer_k: usize,
    pub top_k: usize,
    /// Follow-up questions taken per iteration.
    pub follow_up_batch: usize,
    pub concurrency: usize,
    /// Community level the primer reads (0 = roots).
    pub primer_level: u32,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            convergence_threshold: 0.15,
            deadline_seconds: 60,
            primer_k: 5,
            top_k: 5,
            follow_up_batch: 3,
            concurrency: 3,
            primer_level: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// `Auto` sends queries of at most this many words to flat search.
    pub flat_max_words: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { flat_max_words: 4 }
    }
}

// ── Config (root) ────────────────────────────────────────────────────────────

/// Fully-resolved engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for all persistent data (already expanded, no `~`).
    pub data_dir: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// Optional directory of prompt template overrides.
    pub prompts_dir: Option<PathBuf>,
    pub llm: LlmConfig,
    /// API key from `LLM_API_KEY` env var, never sourced from TOML.
    pub llm_api_key: Option<String>,
    pub embedding: EmbeddingConfig,
    /// API key from `EMBEDDING_API_KEY` env var.
    pub embedding_api_key: Option<String>,
    pub index: IndexConfig,
    pub extraction: ExtractionConfig,
    pub tree: TreeConfig,
    pub communities: CommunityConfig,
    pub drift: DriftConfig,
    pub router: RouterConfig,
}

impl Config {
    /// Offline defaults rooted at `data_dir`: dummy completions, hashing
    /// embeddings, embedded vector index.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            index: IndexConfig::for_data_dir(&data_dir),
            data_dir,
            log_level: "info".into(),
            log_file: None,
            prompts_dir: None,
            llm: LlmConfig::default(),
            llm_api_key: None,
            embedding: EmbeddingConfig::default(),
            embedding_api_key: None,
            extraction: ExtractionConfig::default(),
            tree: TreeConfig::default(),
            communities: CommunityConfig::default(),
            drift: DriftConfig::default(),
            router: RouterConfig::default(),
        }
    }

    /// Path of the graph database inside `data_dir`.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("hiergraph.db")
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.embedding.dimension == 0 {
            return Err(AppError::Config("embedding.dimension must be > 0".into()));
        }
        if self.embedding.batch_size == 0 || self.embedding.concurrency == 0 {
            return Err(AppError::Config(
                "embedding.batch_size and embedding.concurrency must be > 0".into(),
            ));
        }
        if self.tree.min_cluster_size < 2 {
            return Err(AppError::Config("tree.min_cluster_size must be >= 2".into()));
        }
        if self.tree.cluster_size < self.tree.min_cluster_size {
            return Err(AppError::Config(format!(
                "tree.cluster_size ({}) must be >= tree.min_cluster_size ({})",
                self.tree.cluster_size, self.tree.min_cluster_size
            )));
        }
        if self.tree.max_levels == 0 || self.tree.reduced_dimension == 0 {
            return Err(AppError::Config(
                "tree.max_levels and tree.reduced_dimension must be > 0".into(),
            ));
        }
        if self.communities.max_levels == 0 || self.communities.max_cluster_size < 2 {
            return Err(AppError::Config(
                "communities.max_levels must be > 0 and max_cluster_size >= 2".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.drift.convergence_threshold) {
            return Err(AppError::Config(format!(
                "drift.convergence_threshold must be within [0, 1], got {}",
                self.drift.convergence_threshold
            )));
        }
        if self.drift.max_iterations == 0
            || self.drift.top_k == 0
            || self.drift.primer_k == 0
            || self.drift.follow_up_batch == 0
            || self.drift.concurrency == 0
        {
            return Err(AppError::Config(
                "drift limits (max_iterations, top_k, primer_k, follow_up_batch, concurrency) must be > 0"
                    .into(),
            ));
        }
        if self.extraction.concurrency == 0
            || self.tree.concurrency == 0
            || self.communities.concurrency == 0
        {
            return Err(AppError::Config(
                "extraction, tree and communities concurrency must be > 0".into(),
            ));
        }
        match self.llm.provider.as_str() {
            "dummy" | "openai" | "openai-compatible" => {}
            other => return Err(AppError::Config(format!("unknown llm provider: {other}"))),
        }
        match self.embedding.provider.as_str() {
            "hashing" | "openai" | "openai-compatible" => {}
            other => {
                return Err(AppError::Config(format!("unknown embedding provider: {other}")));
            }
        }
        Ok(())
    }
}
