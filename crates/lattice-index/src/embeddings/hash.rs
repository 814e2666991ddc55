//! Deterministic offline embedder built on feature hashing.
//!
//! Tokens, ordered bigrams, and character trigrams are hashed into a
//! fixed-width vector with signed buckets. Identical text always maps to
//! the identical vector, which keeps tests reproducible and lets the
//! engine run without a network backend.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{l2_normalize, EmbeddingProvider};
use crate::chunker::tokenize;
use crate::error::Result;

const TOKEN_WEIGHT: f32 = 1.0;
const BIGRAM_WEIGHT: f32 = 0.8;
const TRIGRAM_WEIGHT: f32 = 0.15;

/// Feature-hashing embedding provider.
pub struct HashEmbeddings {
    dimensions: usize,
}

impl HashEmbeddings {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        let tokens = tokenize(text);

        for token in &tokens {
            self.add_feature(&mut v, &format!("t:{token}"), TOKEN_WEIGHT);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut v, &format!("b:{}_{}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }
        for token in &tokens {
            let chars: Vec<char> = token.chars().collect();
            for tri in chars.windows(3) {
                let tri: String = tri.iter().collect();
                self.add_feature(&mut v, &format!("c:{tri}"), TRIGRAM_WEIGHT);
            }
        }

        l2_normalize(&mut v);
        v
    }

    /// Hash a feature string to a bucket and a sign.
    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut eight = [0u8; 8];
        eight.copy_from_slice(&digest[..8]);
        let idx = (u64::from_le_bytes(eight) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_one(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "feature-hash"
    }

    fn max_batch_size(&self) -> usize {
        256
    }
}
