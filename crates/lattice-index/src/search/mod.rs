//! Hybrid search pipeline.
//!
//! A query is embedded, matched against the vector index, optionally
//! expanded through the persisted graph, and the candidates are ranked
//! by a weighted sum of vector, graph, and freshness signals. Every
//! result carries a score breakdown and a short explanation. Responses
//! are cached with a TTL and invalidated when indexing commits.

pub mod cache;
pub mod expand;

pub use cache::QueryCache;
pub use expand::Subgraph;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::{tokenize, Chunk};
use crate::embeddings::CachingEmbedder;
use crate::error::{EngineError, Result};
use crate::store::{SearchFilters, VectorStore};

/// Freshness half-life: a chunk this many days old scores 0.5.
const HALF_LIFE_DAYS: f32 = 30.0;

/// Per-source weights for score fusion. The weights are not forced to
/// sum to 1; hosts may overweight a signal deliberately.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionWeights {
    pub vector: f32,
    pub graph: f32,
    pub freshness: f32,
    /// Keyword overlap joins the sum only when this is above zero; it
    /// is always reported in the explanation.
    pub keyword: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.6,
            graph: 0.3,
            freshness: 0.1,
            keyword: 0.0,
        }
    }
}

/// Per-query knobs; defaults come from `SearchConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub max_results: usize,
    /// Candidates fetched from the vector index before fusion.
    pub vector_search_top_k: usize,
    /// Graph expansion depth; 0 disables expansion.
    pub expand_hops: usize,
    /// Cap on nodes visited during expansion.
    pub max_graph_nodes: usize,
    pub include_graph: bool,
    /// Append co-occurring keywords to the query text before embedding.
    pub expand_query: bool,
    pub min_score: f32,
    pub weights: FusionWeights,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 10,
            vector_search_top_k: 20,
            expand_hops: 1,
            max_graph_nodes: 64,
            include_graph: true,
            expand_query: false,
            min_score: 0.0,
            weights: FusionWeights::default(),
        }
    }
}

/// A search request: text plus optional filters and options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<SearchFilters>,
    #[serde(default)]
    pub options: SearchOptions,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            filters: None,
            options: SearchOptions::default(),
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }
}

/// Why a result ranked where it did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub vector_score: f32,
    pub graph_score: f32,
    pub freshness_score: f32,
    pub keyword_overlap: f32,
    pub matched_keywords: Vec<String>,
    /// Node ids from the seed hit to this chunk, when reached through
    /// graph expansion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_path: Option<Vec<String>>,
    pub why: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk: Chunk,
    /// Fused score; ordering key.
    pub score: f32,
    pub explanation: Explanation,
    pub snippet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub vector_candidates: usize,
    /// Candidates added by graph expansion.
    pub graph_candidates: usize,
    pub duration_ms: u64,
    pub weights: FusionWeights,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<ChunkResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgraph: Option<Subgraph>,
    pub metadata: SearchMetadata,
}

/// Pipeline-level configuration: default options plus cache TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub options: SearchOptions,
    pub cache_results_minutes: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            options: SearchOptions::default(),
            cache_results_minutes: 5,
        }
    }
}

/// Weighted-sum fusion. Keyword overlap contributes only under an
/// explicit non-zero weight.
pub fn fuse_scores(
    weights: &FusionWeights,
    vector: f32,
    graph: f32,
    freshness: f32,
    keyword_overlap: f32,
) -> f32 {
    let mut score =
        weights.vector * vector + weights.graph * graph + weights.freshness * freshness;
    if weights.keyword > 0.0 {
        score += weights.keyword * keyword_overlap;
    }
    score
}

/// Exponential half-life decay of chunk age, in [0,1].
pub fn freshness_score(updated_at: SystemTime, now: SystemTime) -> f32 {
    let age = now
        .duration_since(updated_at)
        .unwrap_or(Duration::ZERO)
        .as_secs_f32();
    let days = age / 86_400.0;
    0.5_f32.powf(days / HALF_LIFE_DAYS)
}

/// Fraction of query terms present in the chunk's keyword set, plus the
/// matched terms themselves.
fn keyword_overlap(query_terms: &[String], keywords: &[String]) -> (f32, Vec<String>) {
    if query_terms.is_empty() {
        return (0.0, Vec::new());
    }
    let keyword_set: HashSet<&str> = keywords.iter().map(String::as_str).collect();
    let matched: Vec<String> = query_terms
        .iter()
        .filter(|t| keyword_set.contains(t.as_str()))
        .cloned()
        .collect();
    let overlap = matched.len() as f32 / query_terms.len() as f32;
    (overlap, matched)
}

const SNIPPET_MAX_CHARS: usize = 200;

/// Compact excerpt of chunk text for display: leading non-empty lines
/// up to a character budget.
fn make_snippet(text: &str) -> String {
    let mut snippet = String::new();
    for line in text.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()) {
        if !snippet.is_empty() {
            snippet.push('\n');
        }
        snippet.push_str(line);
        if snippet.chars().count() >= SNIPPET_MAX_CHARS {
            break;
        }
    }
    if snippet.chars().count() > SNIPPET_MAX_CHARS {
        snippet = snippet.chars().take(SNIPPET_MAX_CHARS).collect();
        snippet.push_str("...");
    }
    snippet
}

fn why_string(
    vector: f32,
    graph: f32,
    graph_path: Option<&[String]>,
    matched: &[String],
    freshness: f32,
) -> String {
    let mut parts = vec![format!("vector similarity {:.2}", vector)];
    if let Some(path) = graph_path {
        if path.len() > 1 {
            parts.push(format!(
                "reached over {} graph edge(s) with path score {:.2}",
                path.len() - 1,
                graph
            ));
        }
    }
    if !matched.is_empty() {
        parts.push(format!("shares keywords: {}", matched.join(", ")));
    }
    if freshness > 0.75 {
        parts.push("recently updated".to_string());
    }
    parts.join("; ")
}

struct Candidate {
    chunk: Chunk,
    vector_score: f32,
    graph_score: f32,
    graph_path: Option<Vec<String>>,
}

/// Executes queries against the store and embedder it was built with.
pub struct SearchPipeline {
    config: SearchConfig,
    store: Arc<VectorStore>,
    embedder: Arc<CachingEmbedder>,
    cache: QueryCache,
}

impl SearchPipeline {
    pub fn new(
        config: SearchConfig,
        store: Arc<VectorStore>,
        embedder: Arc<CachingEmbedder>,
    ) -> Self {
        let cache = QueryCache::new(Duration::from_secs(config.cache_results_minutes * 60));
        Self {
            config,
            store,
            embedder,
            cache,
        }
    }

    /// Pipeline defaults for hosts that build queries piecemeal.
    pub fn default_options(&self) -> SearchOptions {
        self.config.options.clone()
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.len().await
    }

    /// Drop all cached responses; called after an indexing run commits.
    pub async fn invalidate_cache(&self) {
        self.cache.clear().await;
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(EngineError::Input("empty search query".to_string()));
        }

        let key = cache::query_key(query);
        if let Some(mut cached) = self.cache.get(&key).await {
            cached.metadata.cache_hit = true;
            return Ok(cached);
        }

        let started = Instant::now();
        let options = &query.options;
        let weights = options.weights;

        let embed_text = if options.expand_query {
            expand::expand_query_text(&self.store, text).await?
        } else {
            text.to_string()
        };
        let query_vector = self.embedder.embed(&embed_text).await?;

        let hits = self
            .store
            .vector_search(
                &query_vector,
                options.vector_search_top_k.max(1),
                query.filters.as_ref(),
            )
            .await?;
        let vector_candidates = hits.len();

        let mut candidates: Vec<Candidate> = hits
            .into_iter()
            .map(|hit| Candidate {
                chunk: hit.chunk,
                vector_score: hit.score,
                graph_score: 0.0,
                graph_path: None,
            })
            .collect();

        let mut subgraph = None;
        let mut graph_candidates = 0usize;
        if options.include_graph && options.expand_hops > 0 && !candidates.is_empty() {
            let seeds: Vec<String> = candidates.iter().map(|c| c.chunk.id.clone()).collect();
            let expansion = expand::expand(
                &self.store,
                &seeds,
                options.expand_hops,
                options.max_graph_nodes,
            )
            .await?;

            for candidate in &mut candidates {
                if let Some(reach) = expansion.score_of(&candidate.chunk.id) {
                    candidate.graph_score = reach.score;
                    candidate.graph_path = Some(reach.path.clone());
                }
            }

            let known: HashSet<String> =
                candidates.iter().map(|c| c.chunk.id.clone()).collect();
            let mut expanded_ids: Vec<String> = expansion
                .reached
                .iter()
                .filter(|(id, reach)| reach.hops > 0 && !known.contains(id.as_str()))
                .map(|(id, _)| id.clone())
                .collect();
            expanded_ids.sort();

            for chunk in self.store.get_live_chunks_by_ids(&expanded_ids).await? {
                if let Some(filters) = &query.filters {
                    if !filters.matches(&chunk) {
                        continue;
                    }
                }
                // Expanded chunks were not in the vector result set, so
                // score them directly against their stored vectors.
                let vector_score = chunk
                    .vector
                    .as_deref()
                    .map(|v| {
                        let metric = self.store.metric();
                        metric.score(metric.distance(&query_vector, v))
                    })
                    .unwrap_or(0.0);
                let reach = match expansion.reached.get(&chunk.id) {
                    Some(reach) => reach,
                    None => continue,
                };
                graph_candidates += 1;
                candidates.push(Candidate {
                    chunk,
                    vector_score,
                    graph_score: reach.score,
                    graph_path: Some(reach.path.clone()),
                });
            }
            subgraph = Some(expansion.subgraph);
        }

        let mut query_terms: Vec<String> = Vec::new();
        for term in tokenize(text) {
            if !query_terms.contains(&term) {
                query_terms.push(term);
            }
        }

        let now = SystemTime::now();
        let mut results: Vec<ChunkResult> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let freshness = freshness_score(candidate.chunk.updated_at, now);
            let (overlap, matched) = keyword_overlap(&query_terms, &candidate.chunk.keywords);
            let score = fuse_scores(
                &weights,
                candidate.vector_score,
                candidate.graph_score,
                freshness,
                overlap,
            );
            if score < options.min_score {
                continue;
            }
            let why = why_string(
                candidate.vector_score,
                candidate.graph_score,
                candidate.graph_path.as_deref(),
                &matched,
                freshness,
            );
            results.push(ChunkResult {
                snippet: make_snippet(&candidate.chunk.text),
                explanation: Explanation {
                    vector_score: candidate.vector_score,
                    graph_score: candidate.graph_score,
                    freshness_score: freshness,
                    keyword_overlap: overlap,
                    matched_keywords: matched,
                    graph_path: candidate.graph_path,
                    why,
                },
                score,
                chunk: candidate.chunk,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| {
                    b.explanation
                        .vector_score
                        .total_cmp(&a.explanation.vector_score)
                })
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        results.truncate(options.max_results);

        let response = SearchResponse {
            metadata: SearchMetadata {
                vector_candidates,
                graph_candidates,
                duration_ms: started.elapsed().as_millis() as u64,
                weights,
                cache_hit: false,
            },
            subgraph,
            results,
        };
        debug!(
            "search {:?}: {} results ({} vector, {} graph) in {}ms",
            text,
            response.results.len(),
            vector_candidates,
            graph_candidates,
            response.metadata.duration_ms
        );
        self.cache.put(key, response.clone()).await;
        Ok(response)
    }
}
