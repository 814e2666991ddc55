//! Semantic graph construction from indexed chunks.
//!
//! One node per chunk plus optional keyword nodes; edges come from three
//! passes over the chunk set: pairwise similarity (cosine, keyword
//! Jaccard, or a 0.7/0.3 combination), structural containment within a
//! file, and shared-keyword links. Pairwise similarity is O(n²) over the
//! chunk set and is recomputed fully on every rebuild, which is fine for
//! small-to-medium workspaces; past that, candidate pairs should come
//! from the store's ANN index instead of all-pairs comparison.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunker::{tokenize, Chunk};
use crate::error::Result;
use crate::graph::{keyword_node_id, EdgeKind, GraphEdge, GraphNode, NodeKind};
use crate::store::VectorStore;

const LABEL_MAX_CHARS: usize = 50;

/// Pairwise similarity method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMethod {
    Cosine,
    Jaccard,
    #[default]
    Combined,
}

/// Graph construction tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Minimum similarity for an edge to be emitted.
    pub similarity_threshold: f32,
    /// Outgoing-edge cap per node after pruning.
    pub max_edges_per_node: usize,
    /// Also emit the reverse edge for every similarity pair, with its
    /// kind re-inferred for the reversed direction.
    pub bidirectional: bool,
    pub method: SimilarityMethod,
    /// Emit keyword nodes for terms shared by at least two chunks.
    pub keyword_nodes: bool,
    /// Cap on emitted keyword nodes.
    pub max_keyword_nodes: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.35,
            max_edges_per_node: 10,
            bidirectional: true,
            method: SimilarityMethod::Combined,
            keyword_nodes: true,
            max_keyword_nodes: 64,
        }
    }
}

/// Diagnostics over the persisted graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphAnalysis {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub avg_degree: f32,
    pub connected_components: usize,
}

/// Derives and persists the semantic graph through a [`VectorStore`].
pub struct GraphBuilder {
    store: Arc<VectorStore>,
    config: GraphConfig,
}

impl GraphBuilder {
    pub fn new(store: Arc<VectorStore>, config: GraphConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Derive nodes and edges from a chunk set. Chunks without vectors
    /// still get a node and structural edges but are skipped from
    /// similarity generation.
    pub fn build_graph(&self, chunks: &[Chunk]) -> (Vec<GraphNode>, Vec<GraphEdge>) {
        let nodes: Vec<GraphNode> = chunks.iter().map(chunk_node).collect();
        let kinds: Vec<NodeKind> = nodes.iter().map(|n| n.kind).collect();

        // Highest weight wins when the same (source, kind, target) edge
        // is derived twice.
        let mut edges: HashMap<String, GraphEdge> = HashMap::new();
        let mut add = |edge: GraphEdge| match edges.entry(edge.id.clone()) {
            Entry::Occupied(mut slot) => {
                if edge.weight > slot.get().weight {
                    slot.insert(edge);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(edge);
            }
        };

        for i in 0..chunks.len() {
            for j in (i + 1)..chunks.len() {
                let (a, b) = (&chunks[i], &chunks[j]);

                if a.path == b.path {
                    if strictly_contains(a, b) {
                        add(GraphEdge::new(&a.id, &b.id, EdgeKind::Contains, 1.0));
                    } else if strictly_contains(b, a) {
                        add(GraphEdge::new(&b.id, &a.id, EdgeKind::Contains, 1.0));
                    }
                    if is_member_of(a, b) {
                        add(GraphEdge::new(&a.id, &b.id, EdgeKind::MemberOf, 1.0));
                    }
                    if is_member_of(b, a) {
                        add(GraphEdge::new(&b.id, &a.id, EdgeKind::MemberOf, 1.0));
                    }
                }

                let (Some(va), Some(vb)) = (&a.vector, &b.vector) else {
                    continue;
                };
                if va.is_empty() || vb.is_empty() {
                    continue;
                }
                let score = self.similarity(va, vb, &a.keywords, &b.keywords);
                if score < self.config.similarity_threshold {
                    continue;
                }
                add(GraphEdge::new(
                    &a.id,
                    &b.id,
                    infer_edge_kind(kinds[i], kinds[j]),
                    score,
                ));
                if self.config.bidirectional {
                    add(GraphEdge::new(
                        &b.id,
                        &a.id,
                        infer_edge_kind(kinds[j], kinds[i]),
                        score,
                    ));
                }
            }
        }

        let mut nodes = nodes;
        if self.config.keyword_nodes {
            self.add_keyword_entities(chunks, &mut nodes, &mut add);
        }

        let edges = self.optimize_edges(edges.into_values().collect());
        debug!(
            "built graph: {} nodes, {} edges from {} chunks",
            nodes.len(),
            edges.len(),
            chunks.len()
        );
        (nodes, edges)
    }

    /// Group edges by source and keep the top `max_edges_per_node` by
    /// descending weight.
    pub fn optimize_edges(&self, edges: Vec<GraphEdge>) -> Vec<GraphEdge> {
        let mut by_source: HashMap<String, Vec<GraphEdge>> = HashMap::new();
        for edge in edges {
            by_source.entry(edge.source_id.clone()).or_default().push(edge);
        }
        let mut kept: Vec<GraphEdge> = Vec::new();
        for (_, mut group) in by_source {
            group.sort_by(|a, b| {
                b.weight
                    .total_cmp(&a.weight)
                    .then_with(|| a.id.cmp(&b.id))
            });
            group.truncate(self.config.max_edges_per_node);
            kept.extend(group);
        }
        kept.sort_by(|a, b| a.id.cmp(&b.id));
        kept
    }

    /// Replace the persisted graph with this node/edge set.
    pub async fn save_graph(&self, nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Result<()> {
        self.store.clear_graph().await?;
        self.store.upsert_nodes(nodes).await?;
        self.store.upsert_edges(edges).await?;
        self.store.save().await
    }

    pub async fn load_graph(&self) -> Result<(Vec<GraphNode>, Vec<GraphEdge>)> {
        let nodes = self.store.get_all_nodes().await?;
        let edges = self.store.get_all_edges().await?;
        Ok((nodes, edges))
    }

    /// Rebuild the whole graph from the store's live chunks and persist
    /// it. Returns (node count, edge count).
    pub async fn rebuild(&self) -> Result<(usize, usize)> {
        let chunks = self.store.all_chunks().await?;
        let (nodes, edges) = self.build_graph(&chunks);
        let counts = (nodes.len(), edges.len());
        self.save_graph(nodes, edges).await?;
        info!(
            "rebuilt graph from {} chunks: {} nodes, {} edges",
            chunks.len(),
            counts.0,
            counts.1
        );
        Ok(counts)
    }

    /// Connected-component diagnostics over the persisted graph, via an
    /// undirected adjacency view and depth-first traversal.
    pub async fn analyze_graph(&self) -> Result<GraphAnalysis> {
        let (nodes, edges) = self.load_graph().await?;

        let mut adjacency: HashMap<&str, HashSet<&str>> = HashMap::new();
        for node in &nodes {
            adjacency.entry(node.id.as_str()).or_default();
        }
        for edge in &edges {
            adjacency
                .entry(edge.source_id.as_str())
                .or_default()
                .insert(edge.target_id.as_str());
            adjacency
                .entry(edge.target_id.as_str())
                .or_default()
                .insert(edge.source_id.as_str());
        }

        let total = adjacency.len();
        let degree_sum: usize = adjacency.values().map(HashSet::len).sum();
        let avg_degree = if total == 0 {
            0.0
        } else {
            degree_sum as f32 / total as f32
        };

        let mut visited: HashSet<&str> = HashSet::new();
        let mut components = 0;
        for &start in adjacency.keys() {
            if visited.contains(start) {
                continue;
            }
            components += 1;
            let mut stack = vec![start];
            while let Some(current) = stack.pop() {
                if !visited.insert(current) {
                    continue;
                }
                if let Some(neighbors) = adjacency.get(current) {
                    stack.extend(neighbors.iter().copied().filter(|n| !visited.contains(*n)));
                }
            }
        }

        Ok(GraphAnalysis {
            total_nodes: nodes.len(),
            total_edges: edges.len(),
            avg_degree,
            connected_components: components,
        })
    }

    fn similarity(&self, va: &[f32], vb: &[f32], ka: &[String], kb: &[String]) -> f32 {
        match self.config.method {
            SimilarityMethod::Cosine => cosine_similarity(va, vb),
            SimilarityMethod::Jaccard => jaccard_similarity(ka, kb),
            SimilarityMethod::Combined => {
                0.7 * cosine_similarity(va, vb) + 0.3 * jaccard_similarity(ka, kb)
            }
        }
    }

    /// Keyword nodes for terms shared by at least two chunks, with a
    /// HAS_KEYWORD edge from each mentioning chunk. Edge weight scales
    /// with the in-chunk occurrence count, capped at four occurrences.
    fn add_keyword_entities<F>(&self, chunks: &[Chunk], nodes: &mut Vec<GraphNode>, add: &mut F)
    where
        F: FnMut(GraphEdge),
    {
        let mut mentions: HashMap<&str, Vec<(usize, usize)>> = HashMap::new();
        let counts: Vec<HashMap<String, usize>> = chunks
            .iter()
            .map(|c| {
                let mut counts = HashMap::new();
                for token in tokenize(&c.text) {
                    *counts.entry(token).or_insert(0) += 1;
                }
                counts
            })
            .collect();
        for (i, chunk) in chunks.iter().enumerate() {
            for term in &chunk.keywords {
                let occurrences = counts[i].get(term.as_str()).copied().unwrap_or(1);
                mentions
                    .entry(term.as_str())
                    .or_default()
                    .push((i, occurrences));
            }
        }

        let mut shared: Vec<(&str, Vec<(usize, usize)>)> = mentions
            .into_iter()
            .filter(|(_, m)| m.len() >= 2)
            .collect();
        shared.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));
        shared.truncate(self.config.max_keyword_nodes);

        for (term, mentioning) in shared {
            let node_id = keyword_node_id(term);
            let mut node =
                GraphNode::new(&node_id, NodeKind::Keyword, term).with_property("term", term);
            node.chunk_ids = mentioning.iter().map(|&(i, _)| chunks[i].id.clone()).collect();
            nodes.push(node);
            for (i, occurrences) in mentioning {
                let weight = occurrences.min(4) as f32 / 4.0;
                add(GraphEdge::new(
                    &chunks[i].id,
                    &node_id,
                    EdgeKind::HasKeyword,
                    weight,
                ));
            }
        }
    }
}

/// Order-sensitive edge kind inference. Symbol pairs are checked first;
/// a same-kind pair otherwise reads as plain similarity.
fn infer_edge_kind(source: NodeKind, target: NodeKind) -> EdgeKind {
    if source == NodeKind::Symbol && target == NodeKind::Symbol {
        EdgeKind::RefersTo
    } else if source == target {
        EdgeKind::SimilarTo
    } else if source == NodeKind::Section && target == NodeKind::Symbol {
        EdgeKind::MentionsSymbol
    } else {
        EdgeKind::SimilarTo
    }
}

fn chunk_node(chunk: &Chunk) -> GraphNode {
    GraphNode::new(
        &chunk.id,
        NodeKind::from_chunk_kind(chunk.kind),
        node_label(chunk),
    )
    .with_path(&chunk.path)
    .with_property("chunk_kind", chunk.kind.as_str())
}

/// Label from the heading, the symbol name, or the first non-empty line,
/// truncated to 50 chars with an ellipsis.
fn node_label(chunk: &Chunk) -> String {
    let raw = chunk
        .metadata
        .heading()
        .or_else(|| chunk.metadata.symbol_name())
        .map(str::to_string)
        .unwrap_or_else(|| {
            chunk
                .text
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("")
                .to_string()
        });
    truncate_label(&raw, LABEL_MAX_CHARS)
}

fn truncate_label(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

/// `a` strictly contains `b` within the same file.
fn strictly_contains(a: &Chunk, b: &Chunk) -> bool {
    a.start_line <= b.start_line
        && a.end_line >= b.end_line
        && (a.start_line < b.start_line || a.end_line > b.end_line)
}

/// `a` names `b`'s symbol as its parent.
fn is_member_of(a: &Chunk, b: &Chunk) -> bool {
    match (a.metadata.parent_symbol(), b.metadata.symbol_name()) {
        (Some(parent), Some(symbol)) => parent == symbol,
        _ => false,
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = na * nb;
    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

fn jaccard_similarity(a: &[String], b: &[String]) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let sa: HashSet<&str> = a.iter().map(String::as_str).collect();
    let sb: HashSet<&str> = b.iter().map(String::as_str).collect();
    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}
