//! Incremental workspace indexer.
//!
//! Walks a workspace, decides per file whether it is new, modified, or
//! unchanged against the manifest, and drives chunking, embedding, and
//! store updates in bounded-concurrency batches. Files that disappear
//! are tombstoned and purged after a retention window. The graph is
//! rebuilt periodically during the run and once at the end.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::chunker::{compute_text_hash, Chunk, Chunker, ChunkerConfig};
use crate::embeddings::CachingEmbedder;
use crate::error::{EngineError, Result};
use crate::graph_builder::GraphBuilder;
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::store::VectorStore;

/// Configuration for the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// File extensions considered indexable; empty means all files.
    pub extensions: Vec<String>,
    /// Whitelist globs; empty means everything the walk yields.
    pub include_globs: Vec<String>,
    /// Skip globs; a file matching both include and skip is skipped.
    pub skip_globs: Vec<String>,
    pub respect_gitignore: bool,
    /// Files per batch between graph-rebuild checkpoints.
    pub batch_size: usize,
    /// Files chunked and embedded concurrently.
    pub max_concurrency: usize,
    /// Mark chunks of removed files instead of deleting them.
    pub enable_tombstones: bool,
    /// Days a tombstone survives before the purge pass removes it.
    pub retention_days: u32,
    /// Rebuild the graph every this many batches; 0 disables the
    /// periodic rebuild (the final rebuild always runs).
    pub graph_rebuild_batches: usize,
    pub manifest_path: PathBuf,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            extensions: vec![
                "rs".to_string(),
                "py".to_string(),
                "js".to_string(),
                "jsx".to_string(),
                "ts".to_string(),
                "tsx".to_string(),
                "go".to_string(),
                "md".to_string(),
                "txt".to_string(),
            ],
            include_globs: Vec::new(),
            skip_globs: vec![
                "target/".to_string(),
                "node_modules/".to_string(),
                "__pycache__/".to_string(),
                "vendor/".to_string(),
            ],
            respect_gitignore: true,
            batch_size: 32,
            max_concurrency: 4,
            enable_tombstones: true,
            retention_days: 7,
            graph_rebuild_batches: 8,
            manifest_path: PathBuf::from(".lattice/store").join(MANIFEST_FILE),
        }
    }
}

/// One non-fatal per-file failure from an indexing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexError {
    pub path: String,
    pub message: String,
}

/// Statistics about an indexing run.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    /// Files discovered by the walk.
    pub files_scanned: usize,
    /// Files actually re-chunked and re-embedded.
    pub files_modified: usize,
    pub chunks_added: usize,
    pub chunks_deleted: usize,
    pub files_tombstoned: usize,
    pub duration_ms: u64,
    /// Per-file failures; the run itself still succeeds.
    pub errors: Vec<IndexError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Idle,
    Scanning,
    Indexing,
    Completed,
    Cancelled,
    Failed,
}

/// Live view of a run, readable while it executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub state: IndexState,
    pub files_total: usize,
    pub files_done: usize,
    pub current_path: Option<String>,
    pub started_at: Option<SystemTime>,
}

impl Default for IndexingStatus {
    fn default() -> Self {
        Self {
            state: IndexState::Idle,
            files_total: 0,
            files_done: 0,
            current_path: None,
            started_at: None,
        }
    }
}

/// A file queued for a worker: absolute path, workspace-relative path,
/// and the manifest hash to compare against.
type FileWork = (PathBuf, String, Option<String>);

/// Result of processing one candidate file off the walk.
enum FileOutcome {
    Unchanged,
    Indexed {
        rel_path: String,
        content_hash: String,
        chunks: Vec<Chunk>,
    },
    Failed {
        rel_path: String,
        message: String,
    },
}

/// Orchestrates chunking, embedding, store updates, and graph rebuilds
/// for a workspace.
pub struct Indexer {
    config: IndexerConfig,
    chunker_config: ChunkerConfig,
    store: Arc<VectorStore>,
    embedder: Arc<CachingEmbedder>,
    graph: Arc<GraphBuilder>,
    status: Arc<RwLock<IndexingStatus>>,
    cancel: Arc<AtomicBool>,
    run_guard: Mutex<()>,
}

impl Indexer {
    pub fn new(
        config: IndexerConfig,
        chunker_config: ChunkerConfig,
        store: Arc<VectorStore>,
        embedder: Arc<CachingEmbedder>,
        graph: Arc<GraphBuilder>,
    ) -> Self {
        Self {
            config,
            chunker_config,
            store,
            embedder,
            graph,
            status: Arc::new(RwLock::new(IndexingStatus::default())),
            cancel: Arc::new(AtomicBool::new(false)),
            run_guard: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub async fn status(&self) -> IndexingStatus {
        self.status.read().await.clone()
    }

    /// Request cooperative cancellation; honored between files.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Index every new or changed file under `root`. With `force`, change
    /// detection is bypassed and every file is re-processed; version
    /// lineage is still honored, so unchanged text keeps its versions.
    pub async fn index_workspace(&self, root: &Path, force: bool) -> Result<IndexStats> {
        let _guard = self
            .run_guard
            .try_lock()
            .map_err(|_| EngineError::Input("an indexing run is already in progress".to_string()))?;
        self.cancel.store(false, Ordering::SeqCst);

        let started = Instant::now();
        {
            let mut status = self.status.write().await;
            *status = IndexingStatus {
                state: IndexState::Scanning,
                started_at: Some(SystemTime::now()),
                ..IndexingStatus::default()
            };
        }

        let mut stats = IndexStats::default();
        let run = self.run(root, force, &mut stats).await;
        stats.duration_ms = started.elapsed().as_millis() as u64;

        {
            let mut status = self.status.write().await;
            status.state = match &run {
                Ok(true) => IndexState::Cancelled,
                Ok(false) => IndexState::Completed,
                Err(_) => IndexState::Failed,
            };
            status.current_path = None;
        }
        run?;

        info!(
            "indexing finished: {} scanned, {} modified, {} chunks added, {} errors in {}ms",
            stats.files_scanned,
            stats.files_modified,
            stats.chunks_added,
            stats.errors.len(),
            stats.duration_ms
        );
        Ok(stats)
    }

    /// Full re-process of the workspace, bypassing change detection.
    pub async fn force_reindex(&self, root: &Path) -> Result<IndexStats> {
        self.index_workspace(root, true).await
    }

    /// The run body. Returns whether the run was cancelled. Per-file
    /// failures land in `stats.errors`; only store failures abort.
    async fn run(&self, root: &Path, force: bool, stats: &mut IndexStats) -> Result<bool> {
        self.store.initialize().await?;
        let mut manifest = Manifest::load(&self.config.manifest_path)?;

        let files = self.collect_files(root)?;
        stats.files_scanned = files.len();
        {
            let mut status = self.status.write().await;
            status.state = IndexState::Indexing;
            status.files_total = files.len();
        }
        info!("indexing {} files under {}", files.len(), root.display());

        let scanned: HashSet<String> = files.iter().map(|p| relative_path(root, p)).collect();
        let mut cancelled = false;
        let mut batches_done = 0usize;

        for batch in files.chunks(self.config.batch_size.max(1)) {
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }

            // Per-file work for the batch, with the manifest consulted up
            // front; workers never touch the manifest.
            let mut work: Vec<FileWork> = Vec::with_capacity(batch.len());
            for path in batch {
                let rel = relative_path(root, path);
                let expect_hash = if force {
                    None
                } else {
                    manifest
                        .get(&rel)
                        .filter(|state| state.tombstoned_at.is_none())
                        .map(|state| state.content_hash.clone())
                };
                work.push((path.clone(), rel, expect_hash));
            }

            // One worker per concurrency slot, each owning one chunker for
            // its whole share of the batch.
            let workers = self.config.max_concurrency.max(1).min(work.len());
            let mut queues: Vec<Vec<FileWork>> = (0..workers).map(|_| Vec::new()).collect();
            for (i, item) in work.into_iter().enumerate() {
                queues[i % workers].push(item);
            }

            let mut tasks = JoinSet::new();
            for queue in queues {
                let chunker_config = self.chunker_config.clone();
                let embedder = Arc::clone(&self.embedder);
                let status = Arc::clone(&self.status);
                let cancel = Arc::clone(&self.cancel);
                tasks.spawn(async move {
                    let mut chunker = match Chunker::new(chunker_config) {
                        Ok(chunker) => chunker,
                        Err(e) => {
                            return queue
                                .into_iter()
                                .map(|(_, rel_path, _)| FileOutcome::Failed {
                                    rel_path,
                                    message: format!("chunker: {}", e),
                                })
                                .collect::<Vec<FileOutcome>>();
                        }
                    };
                    let mut outcomes = Vec::with_capacity(queue.len());
                    for (abs, rel_path, expect_hash) in queue {
                        if cancel.load(Ordering::SeqCst) {
                            break;
                        }
                        status.write().await.current_path = Some(rel_path.clone());
                        outcomes.push(
                            process_file(&mut chunker, abs, rel_path, expect_hash, &embedder)
                                .await,
                        );
                    }
                    outcomes
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let outcomes = match joined {
                    Ok(outcomes) => outcomes,
                    Err(e) => {
                        stats.errors.push(IndexError {
                            path: String::new(),
                            message: format!("worker failed: {}", e),
                        });
                        continue;
                    }
                };
                for outcome in outcomes {
                    match outcome {
                        FileOutcome::Unchanged => {}
                        FileOutcome::Failed { rel_path, message } => {
                            warn!("skipping {}: {}", rel_path, message);
                            stats.errors.push(IndexError {
                                path: rel_path,
                                message,
                            });
                        }
                        FileOutcome::Indexed {
                            rel_path,
                            content_hash,
                            mut chunks,
                        } => {
                            let stale = manifest.apply_file(&rel_path, &content_hash, &mut chunks);
                            stats.files_modified += 1;
                            stats.chunks_added += chunks.len();
                            stats.chunks_deleted += stale.len();
                            debug!(
                                "indexed {}: {} chunks, {} stale",
                                rel_path,
                                chunks.len(),
                                stale.len()
                            );
                            // Old and new chunk sets swap in one store call;
                            // search never sees a half-written file.
                            self.store.replace_chunks(&stale, chunks).await?;
                        }
                    }
                    self.status.write().await.files_done += 1;
                }
            }

            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            batches_done += 1;
            if self.config.graph_rebuild_batches > 0
                && batches_done % self.config.graph_rebuild_batches == 0
            {
                let (nodes, edges) = self.graph.rebuild().await?;
                debug!("periodic graph rebuild: {} nodes, {} edges", nodes, edges);
            }
        }

        if !cancelled {
            self.sweep_missing(&mut manifest, &scanned, stats).await?;
            if self.config.enable_tombstones {
                let cutoff = SystemTime::now()
                    - Duration::from_secs(u64::from(self.config.retention_days) * 24 * 3600);
                let purged_paths = manifest.purge_expired(cutoff);
                let purged = self.store.purge_tombstoned(cutoff).await?;
                if purged > 0 {
                    info!(
                        "purged {} expired chunks from {} files",
                        purged,
                        purged_paths.len()
                    );
                }
            }
            let (nodes, edges) = self.graph.rebuild().await?;
            debug!("final graph rebuild: {} nodes, {} edges", nodes, edges);
        }

        manifest.save(&self.config.manifest_path)?;
        self.store.save().await?;
        Ok(cancelled)
    }

    /// Handle files the manifest knows but the walk no longer found.
    async fn sweep_missing(
        &self,
        manifest: &mut Manifest,
        scanned: &HashSet<String>,
        stats: &mut IndexStats,
    ) -> Result<()> {
        for path in manifest.missing_files(scanned) {
            if self.config.enable_tombstones {
                let ids = manifest.tombstone_file(&path);
                if ids.is_empty() {
                    continue;
                }
                let marked = self.store.tombstone_chunks(&ids).await?;
                stats.files_tombstoned += 1;
                debug!("tombstoned {} ({} chunks)", path, marked);
            } else {
                let ids = manifest.remove_file(&path);
                if ids.is_empty() {
                    continue;
                }
                self.store.delete_chunks(&ids).await?;
                stats.chunks_deleted += ids.len();
                debug!("deleted {} ({} chunks)", path, ids.len());
            }
        }
        Ok(())
    }

    /// Discover candidate files: gitignore-aware walk, then include and
    /// skip globs (skip wins), then the extension filter. Sorted for a
    /// deterministic processing order.
    fn collect_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut overrides = OverrideBuilder::new(root);
        for glob in &self.config.include_globs {
            overrides
                .add(glob)
                .map_err(|e| EngineError::Input(format!("bad include glob {:?}: {}", glob, e)))?;
        }
        for glob in &self.config.skip_globs {
            overrides
                .add(&format!("!{}", glob))
                .map_err(|e| EngineError::Input(format!("bad skip glob {:?}: {}", glob, e)))?;
        }
        let overrides = overrides
            .build()
            .map_err(|e| EngineError::Input(format!("glob set: {}", e)))?;

        let walker = WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .overrides(overrides)
            .build();

        let mut files = Vec::new();
        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() || !self.is_indexable(path) {
                continue;
            }
            files.push(path.to_path_buf());
        }
        files.sort();
        Ok(files)
    }

    fn is_indexable(&self, path: &Path) -> bool {
        if self.config.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.config.extensions.iter().any(|allowed| allowed == ext))
            .unwrap_or(false)
    }
}

/// Path relative to the workspace root, forward slashes. Chunk paths and
/// manifest keys use this form so the store moves with the workspace.
fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Read, hash, and on change chunk and embed one file with the worker's
/// chunker. Every failure is reported as a per-file outcome.
async fn process_file(
    chunker: &mut Chunker,
    abs: PathBuf,
    rel_path: String,
    expect_hash: Option<String>,
    embedder: &CachingEmbedder,
) -> FileOutcome {
    let content = match tokio::fs::read_to_string(&abs).await {
        Ok(content) => content,
        Err(e) => {
            return FileOutcome::Failed {
                rel_path,
                message: format!("read failed: {}", e),
            }
        }
    };

    let content_hash = compute_text_hash(&content);
    if expect_hash.as_deref() == Some(content_hash.as_str()) {
        return FileOutcome::Unchanged;
    }

    let mut chunks = chunker.chunk_file(&rel_path, &content);

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    match embedder.embed_batch(&texts).await {
        Ok(vectors) => {
            for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                chunk.vector = Some(vector);
            }
            FileOutcome::Indexed {
                rel_path,
                content_hash,
                chunks,
            }
        }
        Err(e) => FileOutcome::Failed {
            rel_path,
            message: e.to_string(),
        },
    }
}
