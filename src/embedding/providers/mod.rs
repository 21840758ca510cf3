//! Embedding provider implementations.
//!
//! `build(config, api_key)` is the factory, called at startup.

pub mod hashing;
pub mod openai_compatible;

use crate::config::EmbeddingConfig;
use crate::embedding::{EmbeddingError, EmbeddingProvider};

/// Construct an `EmbeddingProvider` from config. `api_key` comes from the
/// `EMBEDDING_API_KEY` env var.
pub fn build(
    config: &EmbeddingConfig,
    api_key: Option<String>,
) -> Result<EmbeddingProvider, EmbeddingError> {
    match config.provider.as_str() {
        "hashing" => Ok(EmbeddingProvider::Hashing(hashing::HashingEmbedder::new(config.dimension))),
        "openai" | "openai-compatible" => {
            let oai = &config.openai;
            let p = openai_compatible::OpenAiEmbedder::new(
                oai.api_base_url.clone(),
                oai.model.clone(),
                config.dimension,
                oai.timeout_seconds,
                api_key,
            )?;
            Ok(EmbeddingProvider::OpenAiCompatible(p))
        }
        _ => Err(EmbeddingError::UnknownProvider(config.provider.clone())),
    }
}
