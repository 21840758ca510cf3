//! OpenAI-compatible embeddings provider (`/v1/embeddings`).

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::embedding::EmbeddingError;
use crate::llm::ProviderError;
use crate::llm::providers::openai_compatible::check_status;

#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    api_base_url: String,
    model: String,
    dimension: usize,
    api_key: Option<String>,
}

impl OpenAiEmbedder {
    pub fn new(
        api_base_url: String,
        model: String,
        dimension: usize,
        timeout_seconds: u64,
        api_key: Option<String>,
    ) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| EmbeddingError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, api_base_url, model, dimension, api_key })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// One request for the whole slice. The `dimensions` parameter asks the
    /// server to shorten vectors to the configured size.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let payload = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimension,
        };
        debug!(model = %self.model, inputs = texts.len(), "sending embedding request");

        let mut req = self.client.post(&self.api_base_url).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.map_err(|e| {
            error!(url = %self.api_base_url, error = %e, "embedding HTTP request failed (transport)");
            EmbeddingError::Request(e.to_string())
        })?;
        let response = check_status(response).await.map_err(|e| match e {
            ProviderError::Request(m) | ProviderError::UnknownProvider(m) => {
                EmbeddingError::Request(m)
            }
        })?;

        let mut parsed = response
            .json::<EmbeddingResponse>()
            .await
            .map_err(|e| EmbeddingError::Request(format!("failed to parse response body: {e}")))?;

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}
