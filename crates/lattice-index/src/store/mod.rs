//! Embedded store for chunk records, their vectors, and graph entities.
//!
//! One directory holds everything: `chunks.json` for chunk records and
//! `graph.json` for nodes/edges, with rotating snapshots of the graph
//! file under `snapshots/`. Vector search runs against an in-memory ANN
//! index rebuilt from the chunk records on load.
//!
//! Consistency model: the store is shared mutable state behind a single
//! `RwLock`. The indexer is the expected writer during an indexing run;
//! searches run concurrently against whatever state is committed, so a
//! reader can observe a run mid-update (eventually consistent within a
//! run). A file's chunks are always swapped in one critical section via
//! [`VectorStore::replace_chunks`], never half-written.

pub mod ann;

pub use ann::{AnnIndex, IndexParams, Metric};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::chunker::{Chunk, ChunkKind};
use crate::error::{EngineError, Result};
use crate::graph::{EdgeKind, GraphEdge, GraphNode};

const CHUNKS_FILE: &str = "chunks.json";
const GRAPH_FILE: &str = "graph.json";
const SNAPSHOT_DIR: &str = "snapshots";

/// Snapshot the graph file every this many graph saves.
const SNAPSHOT_EVERY: u64 = 10;

/// Keep at most this many graph snapshots.
const MAX_SNAPSHOTS: usize = 10;

/// Store configuration. The ANN metric and index family are explicit
/// configuration, not hidden defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backing directory; created on initialization.
    pub path: PathBuf,
    /// Embedding dimension every stored vector must match.
    pub dimensions: usize,
    #[serde(default)]
    pub metric: Metric,
    #[serde(default)]
    pub index: IndexParams,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".lattice/store"),
            dimensions: crate::DEFAULT_DIMENSIONS,
            metric: Metric::Cosine,
            index: IndexParams::default(),
        }
    }
}

/// A stored chunk plus its soft-delete marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstoned_at: Option<SystemTime>,
}

/// A vector search hit: the chunk, the raw metric distance, and the
/// per-metric normalized score in [0,1].
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub distance: f32,
    pub score: f32,
}

/// Chunk-level search filters. Fields combine by AND; values inside an
/// array field combine by OR. Empty arrays are no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefixes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<ChunkKind>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_after: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_before: Option<SystemTime>,
}

impl SearchFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefixes
            .get_or_insert_with(Vec::new)
            .push(prefix.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.languages
            .get_or_insert_with(Vec::new)
            .push(language.into());
        self
    }

    pub fn with_kind(mut self, kind: ChunkKind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn with_updated_after(mut self, at: SystemTime) -> Self {
        self.updated_after = Some(at);
        self
    }

    pub fn with_updated_before(mut self, at: SystemTime) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.path_prefixes.as_ref().map_or(true, Vec::is_empty)
            && self.languages.as_ref().map_or(true, Vec::is_empty)
            && self.kinds.as_ref().map_or(true, Vec::is_empty)
            && self.updated_after.is_none()
            && self.updated_before.is_none()
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(prefixes) = &self.path_prefixes {
            if !prefixes.is_empty() && !prefixes.iter().any(|p| chunk.path.starts_with(p.as_str()))
            {
                return false;
            }
        }
        if let Some(languages) = &self.languages {
            if !languages.is_empty() && !languages.iter().any(|l| l == &chunk.language) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() && !kinds.contains(&chunk.kind) {
                return false;
            }
        }
        if let Some(after) = self.updated_after {
            if chunk.updated_at < after {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if chunk.updated_at > before {
                return false;
            }
        }
        true
    }
}

/// Raw edge query; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EdgeQuery {
    pub source_id: Option<String>,
    pub target_id: Option<String>,
    pub kind: Option<EdgeKind>,
    pub min_weight: Option<f32>,
}

impl EdgeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, id: impl Into<String>) -> Self {
        self.source_id = Some(id.into());
        self
    }

    pub fn with_target(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    pub fn with_kind(mut self, kind: EdgeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_min_weight(mut self, weight: f32) -> Self {
        self.min_weight = Some(weight);
        self
    }

    fn matches(&self, edge: &GraphEdge) -> bool {
        if let Some(source) = &self.source_id {
            if &edge.source_id != source {
                return false;
            }
        }
        if let Some(target) = &self.target_id {
            if &edge.target_id != target {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if edge.kind != kind {
                return false;
            }
        }
        if let Some(min) = self.min_weight {
            if edge.weight < min {
                return false;
            }
        }
        true
    }
}

/// Record counts for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub chunks: usize,
    pub tombstones: usize,
    pub nodes: usize,
    pub edges: usize,
}

#[derive(Serialize, Deserialize, Default)]
struct ChunkDocument {
    version: u64,
    records: Vec<ChunkRecord>,
}

#[derive(Serialize, Deserialize, Default)]
struct GraphDocument {
    version: u64,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

enum InitPhase {
    Pending,
    Ready,
    Failed(String),
}

struct StoreState {
    records: HashMap<String, ChunkRecord>,
    nodes: HashMap<String, GraphNode>,
    edges: HashMap<String, GraphEdge>,
    index: AnnIndex,
    chunk_version: u64,
    graph_version: u64,
    dirty_chunks: bool,
    dirty_graph: bool,
    phase: InitPhase,
}

/// The embedded vector + graph store.
///
/// Construction is cheap and infallible; the backing directory is opened
/// on [`initialize`](Self::initialize) or lazily by the first operation.
/// A failed lazy initialization is sticky: later operations fail loudly
/// instead of retrying, until an explicit `initialize` succeeds.
pub struct VectorStore {
    config: StoreConfig,
    state: RwLock<StoreState>,
}

impl VectorStore {
    pub fn new(config: StoreConfig) -> Self {
        let state = StoreState {
            records: HashMap::new(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            index: AnnIndex::new(config.metric, &config.index),
            chunk_version: 0,
            graph_version: 0,
            dirty_chunks: false,
            dirty_graph: false,
            phase: InitPhase::Pending,
        };
        Self {
            config,
            state: RwLock::new(state),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub fn metric(&self) -> Metric {
        self.config.metric
    }

    /// Open the backing directory and load persisted state. Idempotent
    /// once ready; an explicit call may retry after an earlier failure.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if matches!(state.phase, InitPhase::Ready) {
            return Ok(());
        }
        match Self::open(&self.config) {
            Ok(loaded) => {
                info!(
                    "opened store at {} ({} chunks, {} nodes, {} edges)",
                    self.config.path.display(),
                    loaded.records.len(),
                    loaded.nodes.len(),
                    loaded.edges.len()
                );
                *state = loaded;
                Ok(())
            }
            Err(e) => {
                state.phase = InitPhase::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Flush pending writes. The store holds no open handles, so this is
    /// the whole shutdown story.
    pub async fn close(&self) -> Result<()> {
        self.save().await
    }

    /// Persist dirty state. Each dirty file gets its version bumped and
    /// rewritten; a clean store is a no-op. Every [`SNAPSHOT_EVERY`]th
    /// graph save also writes a rotating snapshot.
    pub async fn save(&self) -> Result<()> {
        let mut state = self.write_ready().await?;
        let state = &mut *state;

        if state.dirty_chunks {
            state.chunk_version += 1;
            let mut records: Vec<ChunkRecord> = state.records.values().cloned().collect();
            records.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));
            let doc = ChunkDocument {
                version: state.chunk_version,
                records,
            };
            let data = serde_json::to_string_pretty(&doc)?;
            fs::write(self.config.path.join(CHUNKS_FILE), data)
                .map_err(|e| self.store_error("write chunk records", e))?;
            state.dirty_chunks = false;
            debug!("saved chunk records v{}", state.chunk_version);
        }

        if state.dirty_graph {
            state.graph_version += 1;
            let mut nodes: Vec<GraphNode> = state.nodes.values().cloned().collect();
            nodes.sort_by(|a, b| a.id.cmp(&b.id));
            let mut edges: Vec<GraphEdge> = state.edges.values().cloned().collect();
            edges.sort_by(|a, b| a.id.cmp(&b.id));
            let doc = GraphDocument {
                version: state.graph_version,
                nodes,
                edges,
            };
            let data = serde_json::to_string_pretty(&doc)?;
            fs::write(self.config.path.join(GRAPH_FILE), &data)
                .map_err(|e| self.store_error("write graph", e))?;
            state.dirty_graph = false;
            debug!("saved graph v{}", state.graph_version);

            if state.graph_version % SNAPSHOT_EVERY == 0 {
                self.write_snapshot(&data, state.graph_version)?;
            }
        }

        Ok(())
    }

    /// Upsert chunks by id: delete-then-insert, so each call fully
    /// replaces any prior record (and clears its tombstone).
    pub async fn upsert_chunks(&self, chunks: Vec<Chunk>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut state = self.write_ready().await?;
        self.apply_upsert(&mut state, chunks)
    }

    pub async fn delete_chunks(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.write_ready().await?;
        let mut removed = 0;
        for id in ids {
            if state.records.remove(id).is_some() {
                state.index.remove(id);
                removed += 1;
            }
        }
        if removed > 0 {
            state.dirty_chunks = true;
            debug!("deleted {} chunks", removed);
        }
        Ok(())
    }

    /// Delete `delete_ids` and upsert `chunks` in one critical section,
    /// so readers never observe a file's chunks half-swapped.
    pub async fn replace_chunks(&self, delete_ids: &[String], chunks: Vec<Chunk>) -> Result<()> {
        let mut state = self.write_ready().await?;
        for id in delete_ids {
            if state.records.remove(id).is_some() {
                state.index.remove(id);
                state.dirty_chunks = true;
            }
        }
        if chunks.is_empty() {
            return Ok(());
        }
        self.apply_upsert(&mut state, chunks)
    }

    /// Mark chunks tombstoned. They drop out of vector search immediately
    /// but stay readable by id until purged. Returns how many were newly
    /// marked.
    pub async fn tombstone_chunks(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut state = self.write_ready().await?;
        let now = SystemTime::now();
        let mut marked = 0;
        for id in ids {
            let newly_marked = match state.records.get_mut(id) {
                Some(record) if record.tombstoned_at.is_none() => {
                    record.tombstoned_at = Some(now);
                    true
                }
                _ => false,
            };
            if newly_marked {
                state.index.remove(id);
                marked += 1;
            }
        }
        if marked > 0 {
            state.dirty_chunks = true;
            debug!("tombstoned {} chunks", marked);
        }
        Ok(marked)
    }

    /// Physically remove tombstoned chunks whose marker predates
    /// `older_than`. Returns how many were removed.
    pub async fn purge_tombstoned(&self, older_than: SystemTime) -> Result<usize> {
        let mut state = self.write_ready().await?;
        let expired: Vec<String> = state
            .records
            .iter()
            .filter(|(_, r)| r.tombstoned_at.map_or(false, |at| at < older_than))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            state.records.remove(id);
            state.index.remove(id);
        }
        if !expired.is_empty() {
            state.dirty_chunks = true;
            info!("purged {} tombstoned chunks", expired.len());
        }
        Ok(expired.len())
    }

    /// Nearest live chunks to `query`, filtered, as ranked hits with raw
    /// distance and a per-metric normalized score.
    pub async fn vector_search(
        &self,
        query: &[f32],
        limit: usize,
        filters: Option<&SearchFilters>,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.config.dimensions {
            return Err(EngineError::Input(format!(
                "query vector has {} dimensions, store expects {}",
                query.len(),
                self.config.dimensions
            )));
        }
        let state = self.read_ready().await?;
        let raw = state.index.search(query, limit, |id| {
            state
                .records
                .get(id)
                .map(|r| {
                    r.tombstoned_at.is_none() && filters.map_or(true, |f| f.matches(&r.chunk))
                })
                .unwrap_or(false)
        });
        let hits = raw
            .into_iter()
            .filter_map(|(id, distance)| {
                state.records.get(&id).map(|r| SearchHit {
                    chunk: r.chunk.clone(),
                    distance,
                    score: self.config.metric.score(distance),
                })
            })
            .collect();
        Ok(hits)
    }

    /// Chunks by id in input order; missing ids are skipped. Tombstoned
    /// chunks are still returned here.
    pub async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let state = self.read_ready().await?;
        Ok(ids
            .iter()
            .filter_map(|id| state.records.get(id).map(|r| r.chunk.clone()))
            .collect())
    }

    /// Like `get_chunks_by_ids` but drops tombstoned chunks, matching
    /// what search is allowed to see.
    pub async fn get_live_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let state = self.read_ready().await?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .records
                    .get(id)
                    .filter(|r| r.tombstoned_at.is_none())
                    .map(|r| r.chunk.clone())
            })
            .collect())
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let state = self.read_ready().await?;
        Ok(state.records.get(id).map(|r| r.chunk.clone()))
    }

    /// All live (non-tombstoned) chunks, sorted by id.
    pub async fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let state = self.read_ready().await?;
        let mut chunks: Vec<Chunk> = state
            .records
            .values()
            .filter(|r| r.tombstoned_at.is_none())
            .map(|r| r.chunk.clone())
            .collect();
        chunks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(chunks)
    }

    pub async fn upsert_nodes(&self, nodes: Vec<GraphNode>) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let mut state = self.write_ready().await?;
        for node in nodes {
            state.nodes.insert(node.id.clone(), node);
        }
        state.dirty_graph = true;
        Ok(())
    }

    pub async fn upsert_edges(&self, edges: Vec<GraphEdge>) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let mut state = self.write_ready().await?;
        for edge in edges {
            state.edges.insert(edge.id.clone(), edge);
        }
        state.dirty_graph = true;
        Ok(())
    }

    pub async fn get_all_nodes(&self) -> Result<Vec<GraphNode>> {
        let state = self.read_ready().await?;
        let mut nodes: Vec<GraphNode> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    pub async fn get_all_edges(&self) -> Result<Vec<GraphEdge>> {
        let state = self.read_ready().await?;
        let mut edges: Vec<GraphEdge> = state.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(edges)
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        let state = self.read_ready().await?;
        Ok(state.nodes.get(id).cloned())
    }

    /// Drop all graph entities; the next full rebuild writes a fresh set.
    pub async fn clear_graph(&self) -> Result<()> {
        let mut state = self.write_ready().await?;
        if !state.nodes.is_empty() || !state.edges.is_empty() {
            state.nodes.clear();
            state.edges.clear();
            state.dirty_graph = true;
        }
        Ok(())
    }

    /// Edges matching the query, sorted by descending weight then id.
    pub async fn query_edges(&self, query: &EdgeQuery) -> Result<Vec<GraphEdge>> {
        let state = self.read_ready().await?;
        let mut edges: Vec<GraphEdge> = state
            .edges
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        edges.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.id.cmp(&b.id)));
        Ok(edges)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let state = self.read_ready().await?;
        let tombstones = state
            .records
            .values()
            .filter(|r| r.tombstoned_at.is_some())
            .count();
        Ok(StoreStats {
            chunks: state.records.len() - tombstones,
            tombstones,
            nodes: state.nodes.len(),
            edges: state.edges.len(),
        })
    }

    fn apply_upsert(
        &self,
        state: &mut RwLockWriteGuard<'_, StoreState>,
        chunks: Vec<Chunk>,
    ) -> Result<()> {
        for chunk in &chunks {
            if let Some(vector) = &chunk.vector {
                if vector.len() != self.config.dimensions {
                    return Err(EngineError::Input(format!(
                        "chunk {} has a {}-dimensional vector, store expects {}",
                        chunk.id,
                        vector.len(),
                        self.config.dimensions
                    )));
                }
            }
        }
        let count = chunks.len();
        for chunk in chunks {
            state.index.remove(&chunk.id);
            if let Some(vector) = &chunk.vector {
                state.index.insert(&chunk.id, vector.clone());
            }
            state.records.insert(
                chunk.id.clone(),
                ChunkRecord {
                    chunk,
                    tombstoned_at: None,
                },
            );
        }
        state.dirty_chunks = true;
        debug!("upserted {} chunks", count);
        Ok(())
    }

    async fn write_ready(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        let mut state = self.state.write().await;
        self.ensure_ready(&mut state)?;
        Ok(state)
    }

    async fn read_ready(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        {
            let state = self.state.read().await;
            match &state.phase {
                InitPhase::Ready => return Ok(state),
                InitPhase::Failed(msg) => {
                    return Err(EngineError::Store(format!(
                        "store at {} unavailable: {}",
                        self.config.path.display(),
                        msg
                    )));
                }
                InitPhase::Pending => {}
            }
        }
        {
            let mut state = self.state.write().await;
            self.ensure_ready(&mut state)?;
        }
        Ok(self.state.read().await)
    }

    fn ensure_ready(&self, state: &mut StoreState) -> Result<()> {
        match &state.phase {
            InitPhase::Ready => Ok(()),
            InitPhase::Failed(msg) => Err(EngineError::Store(format!(
                "store at {} unavailable: {}",
                self.config.path.display(),
                msg
            ))),
            InitPhase::Pending => match Self::open(&self.config) {
                Ok(loaded) => {
                    info!(
                        "opened store at {} ({} chunks, {} nodes, {} edges)",
                        self.config.path.display(),
                        loaded.records.len(),
                        loaded.nodes.len(),
                        loaded.edges.len()
                    );
                    *state = loaded;
                    Ok(())
                }
                Err(e) => {
                    state.phase = InitPhase::Failed(e.to_string());
                    Err(e)
                }
            },
        }
    }

    fn open(config: &StoreConfig) -> Result<StoreState> {
        fs::create_dir_all(&config.path).map_err(|e| {
            EngineError::Store(format!(
                "cannot create store directory {}: {}",
                config.path.display(),
                e
            ))
        })?;
        fs::create_dir_all(config.path.join(SNAPSHOT_DIR)).map_err(|e| {
            EngineError::Store(format!(
                "cannot create snapshot directory under {}: {}",
                config.path.display(),
                e
            ))
        })?;

        let chunk_doc = Self::load_json::<ChunkDocument>(&config.path.join(CHUNKS_FILE))?;
        let graph_doc = Self::load_json::<GraphDocument>(&config.path.join(GRAPH_FILE))?;

        let mut index = AnnIndex::new(config.metric, &config.index);
        let mut records = HashMap::new();
        for record in chunk_doc.records {
            if record.tombstoned_at.is_none() {
                if let Some(vector) = &record.chunk.vector {
                    if vector.len() == config.dimensions {
                        index.insert(&record.chunk.id, vector.clone());
                    }
                }
            }
            records.insert(record.chunk.id.clone(), record);
        }

        Ok(StoreState {
            records,
            nodes: graph_doc.nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            edges: graph_doc.edges.into_iter().map(|e| (e.id.clone(), e)).collect(),
            index,
            chunk_version: chunk_doc.version,
            graph_version: graph_doc.version,
            dirty_chunks: false,
            dirty_graph: false,
            phase: InitPhase::Ready,
        })
    }

    fn load_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
        if !path.exists() {
            return Ok(T::default());
        }
        let data = fs::read_to_string(path).map_err(|e| {
            EngineError::Store(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            EngineError::Store(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    fn write_snapshot(&self, data: &str, version: u64) -> Result<()> {
        let dir = self.config.path.join(SNAPSHOT_DIR);
        let path = dir.join(format!("graph-v{version}.json"));
        fs::write(&path, data)
            .map_err(|e| self.store_error("write graph snapshot", e))?;
        debug!("wrote graph snapshot v{}", version);

        let mut versions: Vec<(u64, PathBuf)> = fs::read_dir(&dir)
            .map_err(|e| self.store_error("read snapshot directory", e))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let name = path.file_name()?.to_str()?;
                let version = name
                    .strip_prefix("graph-v")?
                    .strip_suffix(".json")?
                    .parse()
                    .ok()?;
                Some((version, path))
            })
            .collect();
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, stale) in versions.drain(MAX_SNAPSHOTS.min(versions.len())..) {
            fs::remove_file(&stale)
                .map_err(|e| self.store_error("remove stale snapshot", e))?;
            debug!("removed stale snapshot {}", stale.display());
        }
        Ok(())
    }

    fn store_error(&self, action: &str, err: std::io::Error) -> EngineError {
        EngineError::Store(format!(
            "{} at {}: {}",
            action,
            self.config.path.display(),
            err
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkMetadata;

    fn store_config(dir: &Path, dimensions: usize) -> StoreConfig {
        StoreConfig {
            path: dir.join("store"),
            dimensions,
            metric: Metric::Cosine,
            index: IndexParams::default(),
        }
    }

    fn make_chunk(path: &str, text: &str, vector: Vec<f32>) -> Chunk {
        let mut chunk = Chunk::new(
            path,
            "rust",
            ChunkKind::CodeFunction,
            1,
            5,
            text,
            ChunkMetadata::generic(5),
        );
        chunk.vector = Some(vector);
        chunk
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        let chunks = vec![
            make_chunk("src/a.rs", "fn alpha() {}", vec![1.0, 0.0]),
            make_chunk("src/b.rs", "fn beta() {}", vec![0.0, 1.0]),
        ];
        store.upsert_chunks(chunks.clone()).await.unwrap();
        store.upsert_chunks(chunks).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.tombstones, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        let chunk = make_chunk("src/a.rs", "fn alpha() {}", vec![1.0, 0.0]);
        let id = chunk.id.clone();
        store.upsert_chunks(vec![chunk]).await.unwrap();
        store.delete_chunks(&[id.clone()]).await.unwrap();

        assert!(store.get_chunk(&id).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().chunks, 0);
    }

    #[tokio::test]
    async fn test_replace_chunks_swaps_file_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        let old = make_chunk("src/a.rs", "fn old() {}", vec![1.0, 0.0]);
        let old_id = old.id.clone();
        store.upsert_chunks(vec![old]).await.unwrap();

        let new = make_chunk("src/a.rs", "fn renamed() {}", vec![0.0, 1.0]);
        let new_id = new.id.clone();
        store
            .replace_chunks(&[old_id.clone()], vec![new])
            .await
            .unwrap();

        assert!(store.get_chunk(&old_id).await.unwrap().is_none());
        assert!(store.get_chunk(&new_id).await.unwrap().is_some());
        assert_eq!(store.stats().await.unwrap().chunks, 1);
    }

    #[tokio::test]
    async fn test_vector_search_orders_by_score() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        store
            .upsert_chunks(vec![
                make_chunk("src/far.rs", "fn far() {}", vec![0.0, 1.0]),
                make_chunk("src/near.rs", "fn near() {}", vec![0.8, 0.6]),
                make_chunk("src/exact.rs", "fn exact() {}", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store.vector_search(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].chunk.path, "src/exact.rs");
        assert_eq!(hits[1].chunk.path, "src/near.rs");
        assert_eq!(hits[2].chunk.path, "src/far.rs");
        for hit in &hits {
            assert!((0.0..=1.0).contains(&hit.score));
        }
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_filters_and_across_fields_or_within() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        let mut rust_fn = make_chunk("src/a.rs", "fn a() {}", vec![1.0, 0.0]);
        rust_fn.language = "rust".to_string();
        let mut py_fn = make_chunk("lib/b.py", "def b(): pass", vec![1.0, 0.0]);
        py_fn.language = "python".to_string();
        let mut md = make_chunk("docs/c.md", "# C", vec![1.0, 0.0]);
        md.language = "markdown".to_string();
        md.kind = ChunkKind::MarkdownSection;
        store
            .upsert_chunks(vec![rust_fn, py_fn, md])
            .await
            .unwrap();

        // OR within the language array.
        let filters = SearchFilters::new()
            .with_language("rust")
            .with_language("python");
        let hits = store
            .vector_search(&[1.0, 0.0], 10, Some(&filters))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        // AND across language and kind.
        let filters = SearchFilters::new()
            .with_language("rust")
            .with_language("python")
            .with_kind(ChunkKind::MarkdownSection);
        let hits = store
            .vector_search(&[1.0, 0.0], 10, Some(&filters))
            .await
            .unwrap();
        assert!(hits.is_empty());

        // Path prefix.
        let filters = SearchFilters::new().with_path_prefix("docs/");
        let hits = store
            .vector_search(&[1.0, 0.0], 10, Some(&filters))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.path, "docs/c.md");
    }

    #[tokio::test]
    async fn test_tombstone_hides_then_purge_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        let chunk = make_chunk("src/a.rs", "fn alpha() {}", vec![1.0, 0.0]);
        let id = chunk.id.clone();
        store.upsert_chunks(vec![chunk]).await.unwrap();

        let marked = store.tombstone_chunks(&[id.clone()]).await.unwrap();
        assert_eq!(marked, 1);

        // Hidden from search, still readable by id.
        let hits = store.vector_search(&[1.0, 0.0], 10, None).await.unwrap();
        assert!(hits.is_empty());
        assert!(store.get_chunk(&id).await.unwrap().is_some());
        assert_eq!(store.stats().await.unwrap().tombstones, 1);

        // A cutoff in the past removes nothing.
        let long_ago = SystemTime::UNIX_EPOCH;
        assert_eq!(store.purge_tombstoned(long_ago).await.unwrap(), 0);

        // A cutoff after the marker removes the record.
        let later = SystemTime::now() + std::time::Duration::from_secs(1);
        assert_eq!(store.purge_tombstoned(later).await.unwrap(), 1);
        assert!(store.get_chunk(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reupsert_clears_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        let chunk = make_chunk("src/a.rs", "fn alpha() {}", vec![1.0, 0.0]);
        let id = chunk.id.clone();
        store.upsert_chunks(vec![chunk.clone()]).await.unwrap();
        store.tombstone_chunks(&[id.clone()]).await.unwrap();
        store.upsert_chunks(vec![chunk]).await.unwrap();

        let hits = store.vector_search(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(store.stats().await.unwrap().tombstones, 0);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = store_config(dir.path(), 2);

        {
            let store = VectorStore::new(config.clone());
            store
                .upsert_chunks(vec![make_chunk("src/a.rs", "fn alpha() {}", vec![1.0, 0.0])])
                .await
                .unwrap();
            store
                .upsert_nodes(vec![GraphNode::new("n1", crate::graph::NodeKind::Symbol, "alpha")])
                .await
                .unwrap();
            store
                .upsert_edges(vec![GraphEdge::new("n1", "n2", EdgeKind::SimilarTo, 0.8)])
                .await
                .unwrap();
            store.save().await.unwrap();
        }

        let store = VectorStore::new(config);
        store.initialize().await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.edges, 1);

        // The ANN index is rebuilt from persisted records.
        let hits = store.vector_search(&[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.path, "src/a.rs");
    }

    #[tokio::test]
    async fn test_save_skips_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let config = store_config(dir.path(), 2);
        let store = VectorStore::new(config.clone());

        store
            .upsert_chunks(vec![make_chunk("src/a.rs", "fn alpha() {}", vec![1.0, 0.0])])
            .await
            .unwrap();
        store.save().await.unwrap();
        store.save().await.unwrap();

        let data = fs::read_to_string(config.path.join(CHUNKS_FILE)).unwrap();
        let doc: ChunkDocument = serde_json::from_str(&data).unwrap();
        assert_eq!(doc.version, 1);
    }

    #[tokio::test]
    async fn test_graph_snapshot_written_every_tenth_save() {
        let dir = tempfile::tempdir().unwrap();
        let config = store_config(dir.path(), 2);
        let store = VectorStore::new(config.clone());

        for i in 0..10 {
            store
                .upsert_edges(vec![GraphEdge::new(
                    format!("a{i}"),
                    format!("b{i}"),
                    EdgeKind::SimilarTo,
                    0.5,
                )])
                .await
                .unwrap();
            store.save().await.unwrap();
        }

        let snapshot = config.path.join(SNAPSHOT_DIR).join("graph-v10.json");
        assert!(snapshot.exists());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 4));

        let err = store
            .upsert_chunks(vec![make_chunk("src/a.rs", "fn a() {}", vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));

        let err = store.vector_search(&[1.0, 0.0], 5, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
    }

    #[tokio::test]
    async fn test_failed_init_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the store directory should go.
        let blocker = dir.path().join("store");
        fs::write(&blocker, "not a directory").unwrap();

        let config = StoreConfig {
            path: blocker.clone(),
            dimensions: 2,
            metric: Metric::Cosine,
            index: IndexParams::default(),
        };
        let store = VectorStore::new(config);

        let first = store.stats().await.unwrap_err();
        assert!(matches!(first, EngineError::Store(_)));

        let second = store.stats().await.unwrap_err();
        assert!(matches!(second, EngineError::Store(_)));
        assert!(second.to_string().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_query_edges_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        store
            .upsert_edges(vec![
                GraphEdge::new("a", "b", EdgeKind::SimilarTo, 0.9),
                GraphEdge::new("a", "c", EdgeKind::RefersTo, 0.5),
                GraphEdge::new("b", "c", EdgeKind::SimilarTo, 0.3),
            ])
            .await
            .unwrap();

        let from_a = store
            .query_edges(&EdgeQuery::new().with_source("a"))
            .await
            .unwrap();
        assert_eq!(from_a.len(), 2);
        assert!(from_a[0].weight >= from_a[1].weight);

        let similar = store
            .query_edges(&EdgeQuery::new().with_kind(EdgeKind::SimilarTo))
            .await
            .unwrap();
        assert_eq!(similar.len(), 2);

        let heavy = store
            .query_edges(&EdgeQuery::new().with_min_weight(0.6))
            .await
            .unwrap();
        assert_eq!(heavy.len(), 1);
        assert_eq!(heavy[0].target_id, "b");

        let to_c_similar = store
            .query_edges(
                &EdgeQuery::new()
                    .with_target("c")
                    .with_kind(EdgeKind::SimilarTo),
            )
            .await
            .unwrap();
        assert_eq!(to_c_similar.len(), 1);
        assert_eq!(to_c_similar[0].source_id, "b");
    }

    #[tokio::test]
    async fn test_clear_graph() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        store
            .upsert_nodes(vec![GraphNode::new(
                "n1",
                crate::graph::NodeKind::Document,
                "doc",
            )])
            .await
            .unwrap();
        store
            .upsert_edges(vec![GraphEdge::new("n1", "n2", EdgeKind::Contains, 1.0)])
            .await
            .unwrap();
        store.clear_graph().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.nodes, 0);
        assert_eq!(stats.edges, 0);
    }

    #[tokio::test]
    async fn test_get_chunks_by_ids_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        let a = make_chunk("src/a.rs", "fn a() {}", vec![1.0, 0.0]);
        let b = make_chunk("src/b.rs", "fn b() {}", vec![0.0, 1.0]);
        let (id_a, id_b) = (a.id.clone(), b.id.clone());
        store.upsert_chunks(vec![a, b]).await.unwrap();

        let got = store
            .get_chunks_by_ids(&[id_b.clone(), "missing".to_string(), id_a.clone()])
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, id_b);
        assert_eq!(got[1].id, id_a);
    }

    #[tokio::test]
    async fn test_chunk_without_vector_is_stored_but_not_searchable() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(store_config(dir.path(), 2));

        let mut chunk = make_chunk("src/a.rs", "fn a() {}", vec![1.0, 0.0]);
        chunk.vector = None;
        let id = chunk.id.clone();
        store.upsert_chunks(vec![chunk]).await.unwrap();

        let hits = store.vector_search(&[1.0, 0.0], 10, None).await.unwrap();
        assert!(hits.is_empty());
        assert!(store.get_chunk(&id).await.unwrap().is_some());
    }
}
