//! Completion provider implementations.
//!
//! `build(config, api_key)` is the factory, called at startup.
//! Adding a new backend = new module + new match arm.

pub mod dummy;
pub mod openai_compatible;
pub mod scripted;

use crate::config::LlmConfig;
use crate::llm::{LlmProvider, ProviderError};

/// Construct a `LlmProvider` from config and an optional API key.
///
/// `api_key` is sourced from `LLM_API_KEY` env (never TOML) and is `None`
/// for keyless local models. The `scripted` provider has no config form; it
/// is constructed in code by hosts that supply their own responder.
pub fn build(config: &LlmConfig, api_key: Option<String>) -> Result<LlmProvider, ProviderError> {
    match config.provider.as_str() {
        "dummy" => Ok(LlmProvider::Dummy(dummy::DummyProvider)),
        "openai" | "openai-compatible" => {
            let oai = &config.openai;
            let p = openai_compatible::OpenAiCompatibleProvider::new(
                oai.api_base_url.clone(),
                oai.model.clone(),
                oai.temperature,
                oai.timeout_seconds,
                api_key,
            )?;
            Ok(LlmProvider::OpenAiCompatible(p))
        }
        _ => Err(ProviderError::UnknownProvider(config.provider.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenAiConfig;

    fn llm_config(provider: &str) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            openai: OpenAiConfig::default(),
        }
    }

    #[test]
    fn build_dummy() {
        let p = build(&llm_config("dummy"), None).expect("dummy");
        assert_eq!(p.name(), "dummy");
    }

    #[test]
    fn build_openai_without_key() {
        let p = build(&llm_config("openai"), None).expect("openai");
        assert_eq!(p.name(), "openai");
    }

    #[test]
    fn build_unknown_errors() {
        match build(&llm_config("nope"), None) {
            Err(ProviderError::UnknownProvider(name)) => assert_eq!(name, "nope"),
            other => panic!("expected UnknownProvider, got {other:?}"),
        }
    }
}
