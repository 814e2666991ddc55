//! Integration tests for the lattice-index crate.
//!
//! These tests drive the full engine surface: index a real workspace on
//! disk, search it, and verify incremental behavior across runs.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;

use lattice_index::engine::{Engine, EngineConfig};
use lattice_index::graph_builder::SimilarityMethod;
use lattice_index::EmbeddingConfig;
use lattice_index::SearchOptions;
use lattice_index::{EdgeKind, NodeKind, StoreConfig, VectorStore};

const DIMS: usize = 256;

fn engine_config(data_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.store.path = data_dir.join("store");
    config.store.dimensions = DIMS;
    config.embedding = EmbeddingConfig::Hash { dimensions: DIMS };
    config.indexer.respect_gitignore = false;
    // Keyword overlap is deterministic for tiny corpora, unlike raw
    // embedding similarity.
    config.graph.method = SimilarityMethod::Jaccard;
    config.graph.similarity_threshold = 0.05;
    config
}

fn write_math_workspace(ws: &Path) {
    fs::create_dir_all(ws).unwrap();
    fs::write(
        ws.join("math.rs"),
        r#"/// Add two numbers together.
pub fn add(a: i32, b: i32) -> i32 {
    a + b
}
"#,
    )
    .unwrap();
    fs::write(
        ws.join("calc.rs"),
        r#"/// Multiply two numbers.
pub fn multiply(a: i32, b: i32) -> i32 {
    a * b
}
"#,
    )
    .unwrap();
    fs::write(
        ws.join("README.md"),
        "# Math Library\n\nSmall arithmetic helpers: one adds numbers, one multiplies them.\n",
    )
    .unwrap();
}

async fn indexed_engine(data_dir: &Path, ws: &Path) -> Arc<Engine> {
    let engine = Arc::new(Engine::new(engine_config(data_dir)));
    engine.initialize().await.unwrap();
    let stats = engine.index_workspace(ws, false).await.unwrap();
    assert!(stats.errors.is_empty(), "indexing errors: {:?}", stats.errors);
    engine
}

/// Index a small workspace and find a function by what it does.
#[tokio::test]
async fn test_index_and_find_function_by_purpose() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    write_math_workspace(&ws);
    let engine = indexed_engine(dir.path(), &ws).await;

    let response = engine
        .search("add two numbers together", None)
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    assert_eq!(
        response.results[0].chunk.path, "math.rs",
        "the add function should rank first, got {:?}",
        response.results[0].chunk.path
    );

    for result in &response.results {
        assert!(result.score >= 0.0 && result.score <= 1.0);
        assert!(!result.explanation.why.is_empty());
    }
    assert!(response.subgraph.is_some());
    assert!(response.metadata.vector_candidates > 0);

    let stats = engine.system_stats().await.unwrap();
    assert!(stats.store.chunks >= 3, "one chunk per file at minimum");
    assert!(stats.store.nodes >= 3);
    assert!(
        stats.store.edges >= 1,
        "shared keywords should connect the readme to the functions"
    );

    // The persisted graph must link the readme section to a function
    // chunk across kinds, not just carry some edge somewhere.
    let reader = VectorStore::new(StoreConfig {
        path: dir.path().join("store"),
        dimensions: DIMS,
        ..StoreConfig::default()
    });
    reader.initialize().await.unwrap();
    let nodes = reader.get_all_nodes().await.unwrap();
    let kinds: HashMap<&str, NodeKind> =
        nodes.iter().map(|n| (n.id.as_str(), n.kind)).collect();
    let edges = reader.get_all_edges().await.unwrap();
    let section_to_symbol = edges.iter().any(|e| {
        matches!(e.kind, EdgeKind::MentionsSymbol | EdgeKind::SimilarTo)
            && matches!(
                (
                    kinds.get(e.source_id.as_str()).copied(),
                    kinds.get(e.target_id.as_str()).copied(),
                ),
                (Some(NodeKind::Section), Some(NodeKind::Symbol))
                    | (Some(NodeKind::Symbol), Some(NodeKind::Section))
            )
    });
    assert!(
        section_to_symbol,
        "expected a MENTIONS_SYMBOL or SIMILAR_TO edge between the readme \
         section and a function, got {:?}",
        edges
    );

    let citations = engine.generate_citations(&response);
    assert_eq!(citations.len(), response.results.len());
    assert_eq!(citations[0].path, "math.rs");
    assert!(citations[0].start_line >= 1);
    assert!(!citations[0].relevant_text.is_empty());
}

/// A query describing a computation ranks the matching function above
/// unrelated prose.
#[tokio::test]
async fn test_semantic_query_ranks_function_first() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    fs::create_dir_all(&ws).unwrap();
    fs::write(
        ws.join("billing.js"),
        r#"function calculateTotal(items) {
    return items.reduce((sum, item) => sum + item.price * item.quantity, 0);
}
"#,
    )
    .unwrap();
    fs::write(
        ws.join("weather.md"),
        "# Forecast\n\nRain expected tomorrow evening across the coastal region.\n",
    )
    .unwrap();
    let engine = indexed_engine(dir.path(), &ws).await;

    let response = engine
        .search("calculate sum of numbers", None)
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].chunk.path, "billing.js");
    assert!(response.results[0].score > 0.0);

    // Naming the symbol outright works too.
    let by_name = engine
        .search("calculateTotal items price", None)
        .await
        .unwrap();
    assert_eq!(by_name.results[0].chunk.path, "billing.js");
}

/// An aggressive score floor yields an empty result set, not an error.
#[tokio::test]
async fn test_min_score_filters_weak_matches() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    write_math_workspace(&ws);
    let engine = indexed_engine(dir.path(), &ws).await;

    let options = SearchOptions {
        min_score: 0.9,
        include_graph: false,
        ..engine.config().search.options.clone()
    };
    let response = engine
        .search("orchestral woodwind tuning procedures", Some(options))
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.metadata.graph_candidates, 0);
}

/// Repeating a query hits the cache; indexing drops it.
#[tokio::test]
async fn test_repeated_query_hits_cache_until_reindex() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    write_math_workspace(&ws);
    let engine = indexed_engine(dir.path(), &ws).await;

    let first = engine.search("multiply numbers", None).await.unwrap();
    assert!(!first.metadata.cache_hit);

    let second = engine.search("multiply numbers", None).await.unwrap();
    assert!(second.metadata.cache_hit);
    assert_eq!(second.results, first.results);

    // Any indexing run invalidates cached responses, even a no-op one.
    engine.index_workspace(&ws, false).await.unwrap();
    let third = engine.search("multiply numbers", None).await.unwrap();
    assert!(!third.metadata.cache_hit);
    assert_eq!(third.results, first.results);
}

/// Unchanged files are skipped on reindex; edits bump chunk versions.
#[tokio::test]
async fn test_incremental_reindex_and_version_bump() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    write_math_workspace(&ws);
    let engine = indexed_engine(dir.path(), &ws).await;

    let unchanged = engine.index_workspace(&ws, false).await.unwrap();
    assert_eq!(unchanged.files_scanned, 3);
    assert_eq!(unchanged.files_modified, 0);
    assert_eq!(unchanged.chunks_added, 0);

    let before = engine
        .search("add two numbers together", None)
        .await
        .unwrap();
    let old = &before.results[0].chunk;
    assert_eq!(old.version, 1);
    let old_id = old.id.clone();

    fs::write(
        ws.join("math.rs"),
        r#"/// Add two numbers together, saturating on overflow.
pub fn add(a: i32, b: i32) -> i32 {
    a.saturating_add(b)
}
"#,
    )
    .unwrap();
    let edited = engine.index_workspace(&ws, false).await.unwrap();
    assert_eq!(edited.files_modified, 1);
    assert!(edited.chunks_added >= 1);
    assert!(edited.chunks_deleted >= 1);

    let after = engine
        .search("add two numbers together", None)
        .await
        .unwrap();
    let new = &after.results[0].chunk;
    assert_eq!(new.path, "math.rs");
    assert_eq!(new.version, 2, "edited content continues the lineage");
    assert_ne!(new.id, old_id, "content change produces a new chunk id");
}

/// Deleting a file removes its chunks from search results.
#[tokio::test]
async fn test_deleted_file_disappears_from_results() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    write_math_workspace(&ws);
    let engine = indexed_engine(dir.path(), &ws).await;

    let before = engine.search("multiply numbers", None).await.unwrap();
    assert!(before.results.iter().any(|r| r.chunk.path == "calc.rs"));

    fs::remove_file(ws.join("calc.rs")).unwrap();
    let stats = engine.index_workspace(&ws, false).await.unwrap();
    assert_eq!(stats.files_tombstoned, 1);

    let after = engine.search("multiply numbers", None).await.unwrap();
    assert!(
        after.results.iter().all(|r| r.chunk.path != "calc.rs"),
        "tombstoned chunks must not surface in results"
    );
}

/// Force reindexing rewrites every file but keeps version lineage.
#[tokio::test]
async fn test_force_reindex_preserves_versions() {
    let dir = tempdir().unwrap();
    let ws = dir.path().join("ws");
    write_math_workspace(&ws);
    let engine = indexed_engine(dir.path(), &ws).await;

    let forced = engine.index_workspace(&ws, true).await.unwrap();
    assert_eq!(forced.files_modified, 3);

    let response = engine
        .search("add two numbers together", None)
        .await
        .unwrap();
    assert_eq!(
        response.results[0].chunk.version, 1,
        "identical content keeps its version under force"
    );
}
