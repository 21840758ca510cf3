//! Raw TOML deserialization types.
//!
//! These structs mirror the TOML file shape. Tuning sections use `Option`
//! fields so `load` can fall back to the defaults in `types`.

use serde::Deserialize;

// ── Top-level ────────────────────────────────────────────────────────────────

/// Raw TOML shape, the serde target before resolution.
#[derive(Deserialize, Default)]
pub(super) struct RawConfig {
    #[serde(default)]
    pub engine: RawEngine,
    #[serde(default)]
    pub llm: RawLlm,
    #[serde(default)]
    pub embedding: RawEmbedding,
    #[serde(default)]
    pub index: RawIndex,
    #[serde(default)]
    pub extraction: RawExtraction,
    #[serde(default)]
    pub tree: RawTree,
    #[serde(default)]
    pub communities: RawCommunities,
    #[serde(default)]
    pub drift: RawDrift,
    #[serde(default)]
    pub router: RawRouter,
}

#[derive(Deserialize)]
pub(super) struct RawEngine {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub prompts_dir: Option<String>,
}

impl Default for RawEngine {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_file: None,
            prompts_dir: None,
        }
    }
}

// ── LLM ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawLlm {
    #[serde(rename = "default", default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub openai: RawOpenAiConfig,
}

impl Default for RawLlm {
    fn default() -> Self {
        Self { provider: default_llm_provider(), openai: RawOpenAiConfig::default() }
    }
}

#[derive(Deserialize, Default)]
pub(super) struct RawOpenAiConfig {
    pub api_base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

// ── Embedding ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawEmbedding {
    #[serde(rename = "default", default = "default_embedding_provider")]
    pub provider: String,
    pub dimension: Option<usize>,
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub openai: RawOpenAiEmbedding,
}

impl Default for RawEmbedding {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            dimension: None,
            batch_size: None,
            concurrency: None,
            openai: RawOpenAiEmbedding::default(),
        }
    }
}

#[derive(Deserialize, Default)]
pub(super) struct RawOpenAiEmbedding {
    pub api_base_url: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
}

// ── Index ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawIndex {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub external_path: Option<String>,
}

impl Default for RawIndex {
    fn default() -> Self {
        Self { backend: default_backend(), external_path: None }
    }
}

// ── Pipeline tuning ──────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub(super) struct RawExtraction {
    pub concurrency: Option<usize>,
    pub max_relationship_descriptions: Option<usize>,
    pub max_tokens: Option<u32>,
}

#[derive(Deserialize, Default)]
pub(super) struct RawTree {
    pub cluster_size: Option<usize>,
    pub min_cluster_size: Option<usize>,
    pub max_levels: Option<u32>,
    pub reduced_dimension: Option<usize>,
    pub summary_token_budget: Option<usize>,
    pub concurrency: Option<usize>,
    pub seed: Option<u64>,
}

#[derive(Deserialize, Default)]
pub(super) struct RawCommunities {
    pub max_levels: Option<u32>,
    pub max_cluster_size: Option<usize>,
    pub summary_token_budget: Option<usize>,
    pub concurrency: Option<usize>,
    pub seed: Option<u64>,
}

#[derive(Deserialize, Default)]
pub(super) struct RawDrift {
    pub max_iterations: Option<u32>,
    pub convergence_threshold: Option<f32>,
    pub deadline_seconds: Option<u64>,
    pub primer_k: Option<usize>,
    pub top_k: Option<usize>,
    pub follow_up_batch: Option<usize>,
    pub concurrency: Option<usize>,
    pub primer_level: Option<u32>,
}

#[derive(Deserialize, Default)]
pub(super) struct RawRouter {
    pub flat_max_words: Option<usize>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

pub(super) fn default_data_dir() -> String {
    "~/.hiergraph".to_string()
}
pub(super) fn default_log_level() -> String {
    "info".to_string()
}
fn default_llm_provider() -> String {
    "dummy".to_string()
}
fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_backend() -> String {
    "embedded".to_string()
}
