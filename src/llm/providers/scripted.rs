//! Scripted completion provider: delegates to a caller-supplied responder.
//!
//! Hosts that embed the engine behind their own completion stack (or tests
//! that need deterministic replies) wrap a closure here. The closure sees the
//! full prompt and returns the reply or a `ProviderError`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::llm::ProviderError;

type Responder = dyn Fn(&str) -> Result<String, ProviderError> + Send + Sync;

#[derive(Clone)]
pub struct ScriptedProvider {
    responder: Arc<Responder>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Self { responder: Arc::new(responder), calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(prompt)
    }

    /// Number of `complete` calls made so far (shared across clones).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedProvider").field("calls", &self.calls()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responder_sees_prompt_and_counts_calls() {
        let p = ScriptedProvider::new(|prompt| Ok(prompt.to_uppercase()));
        let clone = p.clone();
        assert_eq!(p.complete("abc", 10).await.unwrap(), "ABC");
        assert_eq!(clone.complete("d", 10).await.unwrap(), "D");
        assert_eq!(p.calls(), 2);
    }

    #[tokio::test]
    async fn responder_errors_propagate() {
        let p = ScriptedProvider::new(|_| Err(ProviderError::Request("down".into())));
        assert!(p.complete("x", 1).await.is_err());
    }
}
