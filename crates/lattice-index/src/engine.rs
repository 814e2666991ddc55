//! Engine facade.
//!
//! Composition root tying the store, embedder, graph builder, indexer,
//! search pipeline, and watcher together behind one handle. Hosts
//! construct an [`Engine`] from an [`EngineConfig`], call
//! [`Engine::initialize`] once, then index and search. Every component
//! is injected at construction so tests can wire the same pieces
//! against temporary directories.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunker::ChunkerConfig;
use crate::embeddings::{provider_from_config, CachingEmbedder, EmbeddingConfig};
use crate::error::{EngineError, Result};
use crate::graph_builder::{GraphBuilder, GraphConfig};
use crate::indexer::{IndexStats, Indexer, IndexerConfig, IndexingStatus};
use crate::manifest::MANIFEST_FILE;
use crate::search::{SearchConfig, SearchOptions, SearchPipeline, SearchQuery, SearchResponse};
use crate::store::{StoreConfig, StoreStats, VectorStore};
use crate::watcher::{FileWatcher, WatchHandle, WatcherConfig};

/// Complete engine configuration. Every section has workable defaults;
/// hosts usually override the store path and the embedding backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub chunker: ChunkerConfig,
    pub embedding: EmbeddingConfig,
    pub indexer: IndexerConfig,
    pub graph: GraphConfig,
    pub search: SearchConfig,
    pub watcher: WatcherConfig,
}

/// A search result reduced to what a quoting host needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    /// Snippet-sized excerpt of the chunk body.
    pub relevant_text: String,
    pub score: f32,
    /// Human-readable account of why this chunk matched.
    pub context: String,
}

/// Point-in-time diagnostics across every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub store: StoreStats,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_cache_size: usize,
    pub query_cache_size: usize,
    pub indexing: IndexingStatus,
    pub ready: bool,
}

/// The engine handle. Cheap to share behind an `Arc`; all methods take
/// `&self`.
pub struct Engine {
    config: EngineConfig,
    store: Arc<VectorStore>,
    embedder: Arc<CachingEmbedder>,
    indexer: Arc<Indexer>,
    pipeline: Arc<SearchPipeline>,
    initialized: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let mut config = config;
        // The manifest always lives beside the store so the two stay in
        // step when a host relocates its data directory.
        config.indexer.manifest_path = config.store.path.join(MANIFEST_FILE);

        let store = Arc::new(VectorStore::new(config.store.clone()));
        let provider = provider_from_config(&config.embedding);
        let embedder = Arc::new(CachingEmbedder::new(provider));
        let graph = Arc::new(GraphBuilder::new(Arc::clone(&store), config.graph.clone()));
        let indexer = Arc::new(Indexer::new(
            config.indexer.clone(),
            config.chunker.clone(),
            Arc::clone(&store),
            Arc::clone(&embedder),
            graph,
        ));
        let pipeline = Arc::new(SearchPipeline::new(
            config.search.clone(),
            Arc::clone(&store),
            Arc::clone(&embedder),
        ));

        Self {
            config,
            store,
            embedder,
            indexer,
            pipeline,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Prepare the backend and the store. Must succeed before any other
    /// operation; safe to call again after a retryable failure.
    pub async fn initialize(&self) -> Result<()> {
        self.embedder.initialize().await?;
        if self.embedder.dimensions() != self.config.store.dimensions {
            return Err(EngineError::Input(format!(
                "embedding dimensions {} do not match store dimensions {}",
                self.embedder.dimensions(),
                self.config.store.dimensions
            )));
        }
        self.store.initialize().await?;
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            "engine initialized: model {} at {} dimensions, store {}",
            self.embedder.model_name(),
            self.embedder.dimensions(),
            self.config.store.path.display()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Flush the store and mark the engine uninitialized. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.initialized.swap(false, Ordering::SeqCst) {
            self.store.close().await?;
            info!("engine closed");
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(EngineError::Input(
                "engine is not initialized; call initialize() first".to_string(),
            ));
        }
        Ok(())
    }

    /// Index a workspace, incrementally unless `force` is set. Cached
    /// query results are dropped afterwards, run success or not, so
    /// searches see whatever state was committed.
    pub async fn index_workspace(&self, root: &Path, force: bool) -> Result<IndexStats> {
        self.ensure_initialized()?;
        let run = self.indexer.index_workspace(root, force).await;
        // Even a failed run may have swapped files into the store before
        // the error, so cached responses are stale either way.
        self.pipeline.invalidate_cache().await;
        run
    }

    pub async fn indexing_status(&self) -> IndexingStatus {
        self.indexer.status().await
    }

    /// Request cancellation of a running index; honored between files.
    pub fn cancel_indexing(&self) {
        self.indexer.cancel();
    }

    /// Search with the configured default options unless overridden.
    pub async fn search(
        &self,
        text: &str,
        options: Option<SearchOptions>,
    ) -> Result<SearchResponse> {
        self.ensure_initialized()?;
        let query = SearchQuery::new(text)
            .with_options(options.unwrap_or_else(|| self.pipeline.default_options()));
        self.pipeline.search(&query).await
    }

    /// Search with a fully specified query, filters included.
    pub async fn search_query(&self, query: &SearchQuery) -> Result<SearchResponse> {
        self.ensure_initialized()?;
        self.pipeline.search(query).await
    }

    /// Reduce a response to citable references in result order.
    pub fn generate_citations(&self, response: &SearchResponse) -> Vec<Citation> {
        response
            .results
            .iter()
            .map(|r| Citation {
                chunk_id: r.chunk.id.clone(),
                path: r.chunk.path.clone(),
                start_line: r.chunk.start_line,
                end_line: r.chunk.end_line,
                relevant_text: r.snippet.clone(),
                score: r.score,
                context: r.explanation.why.clone(),
            })
            .collect()
    }

    pub async fn system_stats(&self) -> Result<SystemStats> {
        let store = self.store.stats().await?;
        Ok(SystemStats {
            store,
            embedding_model: self.embedder.model_name().to_string(),
            embedding_dimensions: self.embedder.dimensions(),
            embedding_cache_size: self.embedder.cache_size().await,
            query_cache_size: self.pipeline.cache_len().await,
            indexing: self.indexer.status().await,
            ready: self.is_initialized() && self.embedder.is_ready(),
        })
    }

    /// Watch `root` and reindex it after each debounced batch of
    /// changes. Requires `watcher.enabled` in the configuration; the
    /// returned handle stops the watch when dropped.
    pub async fn watch(self: &Arc<Self>, root: &Path) -> Result<WatchHandle> {
        self.ensure_initialized()?;
        if !self.config.watcher.enabled {
            return Err(EngineError::Input(
                "watcher is disabled in configuration".to_string(),
            ));
        }

        let mut watcher = FileWatcher::new(root.to_path_buf(), self.config.watcher.clone());
        let mut rx = watcher.start()?;

        let engine = Arc::clone(self);
        let root = root.to_path_buf();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut changes = 1usize;
                while rx.try_recv().is_ok() {
                    changes += 1;
                }
                debug!("watcher: first change {:?}, {} total", event, changes);
                match engine.index_workspace(&root, false).await {
                    Ok(stats) => {
                        if stats.files_modified > 0 || stats.files_tombstoned > 0 {
                            info!(
                                "watch reindex: {} modified, {} tombstoned",
                                stats.files_modified, stats.files_tombstoned
                            );
                        }
                    }
                    Err(e) => warn!("watch-triggered indexing failed: {}", e),
                }
            }
        });

        Ok(WatchHandle::new(watcher, task))
    }
}
