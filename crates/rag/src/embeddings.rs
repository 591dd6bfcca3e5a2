//! Embedding service client.
//!
//! The embedding model runs as its own HTTP service; this client batches
//! texts and retries transient failures. A trait seam keeps the retriever
//! testable without the service.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::RagError;

/// Produces dense vectors for texts.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;

    fn dimension(&self) -> usize;
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct EmbeddingClientConfig {
    pub endpoint: String,
    pub model: String,
    pub dimension: usize,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for EmbeddingClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8001".to_string(),
            model: "multilingual-e5-small".to_string(),
            dimension: 384,
            timeout: Duration::from_secs(10),
            max_retries: 2,
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP embedding client.
pub struct EmbeddingClient {
    client: Client,
    config: EmbeddingClientConfig,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingClientConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embed", self.config.endpoint);
        let body = EmbedRequest {
            model: &self.config.model,
            texts,
        };

        let mut backoff = Duration::from_millis(200);
        let mut attempt = 0u32;
        loop {
            let result = self.client.post(&url).json(&body).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let parsed: EmbedResponse = response
                        .json()
                        .await
                        .map_err(|e| RagError::Embedding(e.to_string()))?;
                    if parsed.embeddings.len() != texts.len() {
                        return Err(RagError::Embedding(format!(
                            "expected {} embeddings, got {}",
                            texts.len(),
                            parsed.embeddings.len()
                        )));
                    }
                    return Ok(parsed.embeddings);
                }
                Ok(response) => {
                    let status = response.status();
                    attempt += 1;
                    if !(status.is_server_error() || status.as_u16() == 429)
                        || attempt > self.config.max_retries
                    {
                        let body = response.text().await.unwrap_or_default();
                        return Err(RagError::Embedding(format!("{status}: {body}")));
                    }
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(RagError::Embedding(e.to_string()));
                    }
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic embedder for tests: hashes tokens into a small space.

    use super::*;

    pub struct HashEmbedder {
        pub dimension: usize,
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut v = vec![0.0f32; self.dimension];
                    for token in text.to_lowercase().split_whitespace() {
                        let mut h: usize = 5381;
                        for b in token.bytes() {
                            h = h.wrapping_mul(33).wrapping_add(b as usize);
                        }
                        v[h % self.dimension] += 1.0;
                    }
                    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
                    v.iter_mut().for_each(|x| *x /= norm);
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }
}
