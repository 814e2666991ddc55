//! HTTP embedding provider for OpenAI-style `/embeddings` endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::EmbeddingProvider;
use crate::error::{EngineError, Result};

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
    index: usize,
}

/// Remote embedding backend. Honors HTTP 429 with Retry-After plus
/// exponential backoff, up to three retries per request.
pub struct HttpEmbeddings {
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
    client: Client,
    ready: AtomicBool,
}

impl HttpEmbeddings {
    pub fn new(
        endpoint: String,
        api_key: String,
        model: String,
        dimensions: usize,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            endpoint,
            api_key,
            model,
            dimensions,
            client,
            ready: AtomicBool::new(false),
        }
    }

    async fn send_request(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let request_body = EmbeddingRequest {
            model: self.model.clone(),
            input: texts.clone(),
        };

        let max_retries = 3;
        let mut retry_count = 0;
        let mut backoff_secs = 1u64;

        loop {
            debug!(
                "embedding request: {} texts to {}",
                texts.len(),
                self.endpoint
            );

            let response = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&request_body)
                .send()
                .await
                .map_err(|e| EngineError::BackendUnavailable(format!("network error: {e}")))?;

            let status = response.status();

            if status.is_success() {
                let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
                    EngineError::BackendUnavailable(format!("invalid response: {e}"))
                })?;

                let mut rows: Vec<(usize, Vec<f32>)> = parsed
                    .data
                    .into_iter()
                    .map(|r| (r.index, r.embedding))
                    .collect();
                rows.sort_by_key(|(idx, _)| *idx);

                let vectors: Vec<Vec<f32>> = rows.into_iter().map(|(_, v)| v).collect();
                if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
                    return Err(EngineError::BackendUnavailable(format!(
                        "backend returned {}-dim vectors, expected {}",
                        bad.len(),
                        self.dimensions
                    )));
                }
                return Ok(vectors);
            }

            if status.as_u16() == 429 {
                retry_count += 1;
                if retry_count > max_retries {
                    return Err(EngineError::BackendUnavailable(format!(
                        "rate limited after {max_retries} retries"
                    )));
                }
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);
                warn!(
                    "rate limited, retrying in {}s (attempt {}/{})",
                    retry_after, retry_count, max_retries
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                backoff_secs *= 2;
                continue;
            }

            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(EngineError::BackendUnavailable(format!(
                "api error ({}): {}",
                status.as_u16(),
                body
            )));
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::BackendUnavailable("no embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut all = Vec::with_capacity(texts.len());
        for group in texts.chunks(self.max_batch_size()) {
            all.extend(self.send_request(group.to_vec()).await?);
        }
        Ok(all)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_batch_size(&self) -> usize {
        32
    }

    async fn initialize(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(EngineError::Input("embedding endpoint is empty".into()));
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
