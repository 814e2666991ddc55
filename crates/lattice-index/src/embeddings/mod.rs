//! Embedding service: providers behind a trait, plus a caching wrapper
//! that L2-normalizes every vector it hands out so downstream cosine
//! similarity reduces to a dot product.

pub mod hash;
pub mod http;

pub use hash::HashEmbeddings;
pub use http::HttpEmbeddings;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::chunker::compute_text_hash;
use crate::error::{EngineError, Result};

/// Embedding backend selection, part of the engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum EmbeddingConfig {
    /// Deterministic offline feature-hashing embedder. No network.
    Hash { dimensions: usize },
    /// OpenAI-style HTTP embeddings endpoint.
    Http {
        endpoint: String,
        api_key: String,
        model: String,
        dimensions: usize,
        timeout_secs: u64,
    },
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self::Hash {
            dimensions: crate::DEFAULT_DIMENSIONS,
        }
    }
}

impl EmbeddingConfig {
    pub fn dimensions(&self) -> usize {
        match self {
            Self::Hash { dimensions } => *dimensions,
            Self::Http { dimensions, .. } => *dimensions,
        }
    }
}

/// Trait for embedding providers.
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed multiple texts; output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Number of dimensions per vector.
    fn dimensions(&self) -> usize;

    /// Model identifier, for stats and logs.
    fn model_name(&self) -> &str;

    /// Maximum texts per backend call.
    fn max_batch_size(&self) -> usize {
        32
    }

    /// Load the backend. Idempotent; default is a no-op.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the backend can serve embeddings right now.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Build a provider from configuration.
pub fn provider_from_config(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    match config {
        EmbeddingConfig::Hash { dimensions } => Arc::new(HashEmbeddings::new(*dimensions)),
        EmbeddingConfig::Http {
            endpoint,
            api_key,
            model,
            dimensions,
            timeout_secs,
        } => Arc::new(HttpEmbeddings::new(
            endpoint.clone(),
            api_key.clone(),
            model.clone(),
            *dimensions,
            Duration::from_secs(*timeout_secs),
        )),
    }
}

/// Scale a vector to unit L2 norm in place. Zero vectors stay zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Caching, normalizing front for any provider. Identical text (by hash)
/// short-circuits to the previously computed vector for the lifetime of
/// the process.
pub struct CachingEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl CachingEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.provider.initialize().await
    }

    pub fn is_ready(&self) -> bool {
        self.provider.is_ready()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = compute_text_hash(text);
        if let Some(v) = self.cache.read().await.get(&key) {
            debug!("embedding cache hit");
            return Ok(v.clone());
        }
        let mut v = self.provider.embed(text).await?;
        l2_normalize(&mut v);
        self.cache.write().await.insert(key, v.clone());
        Ok(v)
    }

    /// Batch embed with cache reuse: only uncached texts reach the
    /// backend, in groups of the provider's batch size. Output order
    /// matches input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = texts.iter().map(|t| compute_text_hash(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        {
            let cache = self.cache.read().await;
            for (i, key) in keys.iter().enumerate() {
                if let Some(v) = cache.get(key) {
                    out[i] = Some(v.clone());
                }
            }
        }

        let missing: Vec<usize> = (0..texts.len()).filter(|i| out[*i].is_none()).collect();
        if !missing.is_empty() {
            debug!(
                "embedding {} of {} texts (rest cached)",
                missing.len(),
                texts.len()
            );
            let group_size = self.provider.max_batch_size().max(1);
            for group in missing.chunks(group_size) {
                let batch: Vec<String> = group.iter().map(|&i| texts[i].clone()).collect();
                let vectors = self.provider.embed_batch(&batch).await?;
                if vectors.len() != batch.len() {
                    return Err(EngineError::BackendUnavailable(format!(
                        "backend returned {} vectors for {} inputs",
                        vectors.len(),
                        batch.len()
                    )));
                }
                let mut cache = self.cache.write().await;
                for (&i, mut v) in group.iter().zip(vectors) {
                    l2_normalize(&mut v);
                    cache.insert(keys[i].clone(), v.clone());
                    out[i] = Some(v);
                }
            }
        }

        out.into_iter()
            .map(|v| {
                v.ok_or_else(|| {
                    EngineError::BackendUnavailable("embedding batch left a gap".to_string())
                })
            })
            .collect()
    }
}
