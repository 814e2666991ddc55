//! TTL-bounded query response cache.
//!
//! Keys are content hashes of the normalized query (text, filters,
//! options), so two textually identical queries with different options
//! never collide. Entries expire after the configured TTL and the map
//! is capped; the oldest entry is evicted when full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use super::{SearchQuery, SearchResponse};

/// Upper bound on cached responses per pipeline.
const CACHE_CAPACITY: usize = 128;

/// Stable cache key for a query: SHA-256 over the canonical JSON form
/// of (trimmed text, filters, options).
pub fn query_key(query: &SearchQuery) -> String {
    let canonical = serde_json::json!({
        "text": query.text.trim(),
        "filters": query.filters,
        "options": query.options,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

struct CacheEntry {
    response: SearchResponse,
    inserted_at: Instant,
    /// Insertion order; `Instant` alone can tie within one tick.
    sequence: u64,
}

pub struct QueryCache {
    ttl: Duration,
    next_sequence: AtomicU64,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl QueryCache {
    /// A zero TTL disables caching entirely.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            next_sequence: AtomicU64::new(0),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub async fn get(&self, key: &str) -> Option<SearchResponse> {
        if !self.enabled() {
            return None;
        }
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        debug!("query cache hit");
        Some(entry.response.clone())
    }

    pub async fn put(&self, key: String, response: SearchResponse) {
        if !self.enabled() {
            return;
        }
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted_at.elapsed() <= ttl);
        if entries.len() >= CACHE_CAPACITY && !entries.contains_key(&key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.sequence)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                response,
                inserted_at: Instant::now(),
                sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop everything, e.g. after an indexing run commits.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{SearchMetadata, SearchOptions};

    fn empty_response() -> SearchResponse {
        SearchResponse {
            results: Vec::new(),
            subgraph: None,
            metadata: SearchMetadata::default(),
        }
    }

    #[test]
    fn test_query_key_stability() {
        let a = SearchQuery::new("find the parser");
        let b = SearchQuery::new("  find the parser  ");
        // Trimming normalizes whitespace at the ends.
        assert_eq!(query_key(&a), query_key(&b));

        let c = SearchQuery::new("find the parser").with_options(SearchOptions {
            max_results: 3,
            ..SearchOptions::default()
        });
        assert_ne!(query_key(&a), query_key(&c));

        let d = SearchQuery::new("find the lexer");
        assert_ne!(query_key(&a), query_key(&d));
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let cache = QueryCache::new(Duration::from_secs(60));
        let key = "k1".to_string();
        assert!(cache.get(&key).await.is_none());

        cache.put(key.clone(), empty_response()).await;
        assert!(cache.get(&key).await.is_some());
        assert_eq!(cache.len().await, 1);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        let cache = QueryCache::new(Duration::ZERO);
        assert!(!cache.enabled());
        cache.put("k".to_string(), empty_response()).await;
        assert_eq!(cache.len().await, 0);
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = QueryCache::new(Duration::from_millis(10));
        cache.put("k".to_string(), empty_response()).await;
        assert!(cache.get("k").await.is_some());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache = QueryCache::new(Duration::from_secs(60));
        for i in 0..CACHE_CAPACITY {
            cache.put(format!("k{}", i), empty_response()).await;
        }
        assert_eq!(cache.len().await, CACHE_CAPACITY);

        cache.put("overflow".to_string(), empty_response()).await;
        assert_eq!(cache.len().await, CACHE_CAPACITY);
        // k0 went in first and is gone now.
        assert!(cache.get("k0").await.is_none());
        assert!(cache.get("overflow").await.is_some());
    }
}
