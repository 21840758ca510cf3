//! Dummy completion provider. Echoes the prompt back prefixed with `[echo]`.
//! Used to run the full indexing pipeline offline without an API key.

use crate::llm::ProviderError;

#[derive(Debug, Clone)]
pub struct DummyProvider;

impl DummyProvider {
    /// Echo `prompt`, truncated to roughly `max_tokens` tokens (4 chars each).
    pub async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ProviderError> {
        let limit = (max_tokens as usize).saturating_mul(4);
        let body: String = prompt.chars().take(limit).collect();
        Ok(format!("[echo] {body}"))
    }
}
