//! Embedded retrieval engine for local workspaces.
//!
//! This crate provides:
//! - Structure-aware chunking using tree-sitter, with line-window fallback
//! - Embedding generation via a local hashing backend or an HTTP endpoint
//! - An embedded vector store with soft deletes and JSON persistence
//! - A semantic graph derived from embedding similarity and shared keywords
//! - Incremental indexing with a content-hash manifest and tombstones
//! - Hybrid search fusing vector, graph, and freshness signals into
//!   ranked, explainable results
//! - Background file watching for auto-indexing

pub mod chunker;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod graph;
pub mod graph_builder;
pub mod indexer;
pub mod manifest;
pub mod search;
pub mod store;
pub mod watcher;

// Re-exports
pub use chunker::{Chunk, ChunkKind, ChunkMetadata, Chunker, ChunkerConfig, SymbolKind};
pub use embeddings::{provider_from_config, CachingEmbedder, EmbeddingConfig, EmbeddingProvider};
pub use engine::{Citation, Engine, EngineConfig, SystemStats};
pub use error::{EngineError, Result};
pub use graph::{EdgeKind, GraphEdge, GraphNode, NodeKind};
pub use graph_builder::{GraphBuilder, GraphConfig, SimilarityMethod};
pub use indexer::{IndexState, IndexStats, Indexer, IndexerConfig, IndexingStatus};
pub use manifest::Manifest;
pub use search::{
    ChunkResult, Explanation, FusionWeights, SearchConfig, SearchOptions, SearchPipeline,
    SearchQuery, SearchResponse, Subgraph,
};
pub use store::{Metric, SearchFilters, StoreConfig, StoreStats, VectorStore};
pub use watcher::{FileEvent, FileWatcher, WatchHandle, WatcherConfig};

/// Default embedding dimensions for the hashing backend.
pub const DEFAULT_DIMENSIONS: usize = 384;
