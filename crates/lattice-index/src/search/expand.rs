//! Graph expansion for search: breadth-first traversal from vector hits
//! over persisted edges, and query-term expansion via keyword
//! co-occurrence.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::tokenize;
use crate::graph::{EdgeKind, GraphEdge, GraphNode};
use crate::store::{EdgeQuery, VectorStore};
use crate::error::Result;

/// How a node was reached from the seed set.
#[derive(Debug, Clone)]
pub struct ReachedNode {
    /// Best path score: edge-weight product damped by hop count.
    pub score: f32,
    pub hops: usize,
    /// Node ids from the seed to this node, inclusive.
    pub path: Vec<String>,
}

/// Nodes and edges touched by an expansion, for the response payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Expansion result: per-node best reach plus the induced subgraph.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub reached: HashMap<String, ReachedNode>,
    pub subgraph: Subgraph,
}

impl Expansion {
    /// Path score for a node that was reached over at least one edge.
    /// A seed gets one only when some other node's path led to it.
    pub fn score_of(&self, node_id: &str) -> Option<&ReachedNode> {
        self.reached.get(node_id).filter(|r| r.hops > 0)
    }
}

/// Breadth-first expansion from `seeds` over the persisted graph, both
/// edge directions, up to `max_hops`, visiting at most `max_nodes` new
/// nodes. Each node keeps the best-scoring path that reached it.
pub async fn expand(
    store: &VectorStore,
    seeds: &[String],
    max_hops: usize,
    max_nodes: usize,
) -> Result<Expansion> {
    if seeds.is_empty() || max_hops == 0 {
        return Ok(Expansion::default());
    }

    let edges = store.get_all_edges().await?;
    let mut adjacency: HashMap<&str, Vec<(&str, f32)>> = HashMap::new();
    for edge in &edges {
        adjacency
            .entry(edge.source_id.as_str())
            .or_default()
            .push((edge.target_id.as_str(), edge.weight));
        adjacency
            .entry(edge.target_id.as_str())
            .or_default()
            .push((edge.source_id.as_str(), edge.weight));
    }
    for neighbors in adjacency.values_mut() {
        neighbors.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    }

    let seed_set: HashSet<&str> = seeds.iter().map(String::as_str).collect();
    let mut reached: HashMap<String, ReachedNode> = HashMap::new();
    let mut frontier: Vec<String> = Vec::new();
    for seed in seeds {
        if reached.contains_key(seed) {
            continue;
        }
        reached.insert(
            seed.clone(),
            ReachedNode {
                score: 0.0,
                hops: 0,
                path: vec![seed.clone()],
            },
        );
        frontier.push(seed.clone());
    }

    let mut visited = 0usize;
    for hop in 1..=max_hops {
        // Higher-product parents claim children first, so ties resolve
        // the same way on every run.
        frontier.sort_by(|a, b| {
            let pa = product_of(&reached, a);
            let pb = product_of(&reached, b);
            pb.total_cmp(&pa).then_with(|| a.cmp(b))
        });

        let mut next: Vec<String> = Vec::new();
        for node_id in &frontier {
            // A seed always traverses as its own root, even after some
            // other path assigned it a score.
            let (parent_product, parent_path) = if seed_set.contains(node_id.as_str()) {
                (1.0, vec![node_id.clone()])
            } else {
                match reached.get(node_id) {
                    Some(r) => (raw_product(r), r.path.clone()),
                    None => continue,
                }
            };
            let neighbors = match adjacency.get(node_id.as_str()) {
                Some(n) => n,
                None => continue,
            };
            for &(neighbor, weight) in neighbors {
                // Simple paths only; a walk looping back over itself
                // carries no new reachability.
                if parent_path.iter().any(|p| p == neighbor) {
                    continue;
                }
                let product = parent_product * weight;
                let damped = product / (1.0 + hop as f32);
                match reached.get_mut(neighbor) {
                    Some(existing) => {
                        if damped > existing.score {
                            existing.score = damped;
                            existing.hops = hop;
                            existing.path = extend_path(&parent_path, neighbor);
                        }
                    }
                    None => {
                        if visited >= max_nodes {
                            continue;
                        }
                        visited += 1;
                        reached.insert(
                            neighbor.to_string(),
                            ReachedNode {
                                score: damped,
                                hops: hop,
                                path: extend_path(&parent_path, neighbor),
                            },
                        );
                        next.push(neighbor.to_string());
                    }
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    debug!(
        "graph expansion reached {} nodes from {} seeds",
        visited,
        seeds.len()
    );

    let subgraph = induced_subgraph(store, &reached, &edges).await?;
    Ok(Expansion { reached, subgraph })
}

/// Undamped edge-weight product along a node's best path.
fn raw_product(node: &ReachedNode) -> f32 {
    if node.hops == 0 {
        1.0
    } else {
        node.score * (1.0 + node.hops as f32)
    }
}

fn product_of(reached: &HashMap<String, ReachedNode>, id: &str) -> f32 {
    reached.get(id).map(raw_product).unwrap_or(0.0)
}

fn extend_path(parent: &[String], next: &str) -> Vec<String> {
    let mut path = parent.to_vec();
    path.push(next.to_string());
    path
}

/// Subgraph induced by the reached node set, sorted for determinism.
async fn induced_subgraph(
    store: &VectorStore,
    reached: &HashMap<String, ReachedNode>,
    edges: &[GraphEdge],
) -> Result<Subgraph> {
    let all_nodes = store.get_all_nodes().await?;
    let mut nodes: Vec<GraphNode> = all_nodes
        .into_iter()
        .filter(|n| reached.contains_key(&n.id))
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let mut sub_edges: Vec<GraphEdge> = edges
        .iter()
        .filter(|e| reached.contains_key(&e.source_id) && reached.contains_key(&e.target_id))
        .cloned()
        .collect();
    sub_edges.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(Subgraph {
        nodes,
        edges: sub_edges,
    })
}

/// Append up to two co-occurring keywords per query term, discovered
/// through HAS_KEYWORD edges: chunks mentioning a query term vote for
/// the other keywords they mention.
pub async fn expand_query_text(store: &VectorStore, text: &str) -> Result<String> {
    let terms = tokenize(text);
    let mut seen: HashSet<String> = terms.iter().cloned().collect();
    let mut extra: Vec<String> = Vec::new();

    let mut ordered: Vec<&String> = Vec::new();
    for term in &terms {
        if !ordered.contains(&term) {
            ordered.push(term);
        }
    }

    for term in ordered {
        let keyword_id = crate::graph::keyword_node_id(term);
        let incoming = store
            .query_edges(
                &EdgeQuery::new()
                    .with_target(&keyword_id)
                    .with_kind(EdgeKind::HasKeyword),
            )
            .await?;
        if incoming.is_empty() {
            continue;
        }

        let mut votes: BTreeMap<String, usize> = BTreeMap::new();
        for edge in &incoming {
            let outgoing = store
                .query_edges(
                    &EdgeQuery::new()
                        .with_source(&edge.source_id)
                        .with_kind(EdgeKind::HasKeyword),
                )
                .await?;
            for other in outgoing {
                if other.target_id == keyword_id {
                    continue;
                }
                if let Some(node) = store.get_node(&other.target_id).await? {
                    let co_term = node
                        .properties
                        .get("term")
                        .cloned()
                        .unwrap_or_else(|| node.label.clone());
                    if !seen.contains(&co_term) {
                        *votes.entry(co_term).or_default() += 1;
                    }
                }
            }
        }

        let mut ranked: Vec<(String, usize)> = votes.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (co_term, _) in ranked.into_iter().take(2) {
            seen.insert(co_term.clone());
            extra.push(co_term);
        }
    }

    if extra.is_empty() {
        Ok(text.to_string())
    } else {
        debug!("query expanded with: {}", extra.join(" "));
        Ok(format!("{} {}", text, extra.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{keyword_node_id, NodeKind};
    use crate::store::StoreConfig;
    use std::sync::Arc;

    async fn seeded_store(dir: &std::path::Path) -> Arc<VectorStore> {
        let store = Arc::new(VectorStore::new(StoreConfig {
            path: dir.join("store"),
            dimensions: 4,
            ..StoreConfig::default()
        }));
        store.initialize().await.unwrap();
        store
    }

    fn node(id: &str) -> GraphNode {
        GraphNode::new(id, NodeKind::Document, id)
    }

    #[tokio::test]
    async fn test_expand_single_hop() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        store
            .upsert_nodes(vec![node("a"), node("b"), node("c")])
            .await
            .unwrap();
        store
            .upsert_edges(vec![
                GraphEdge::new("a", "b", EdgeKind::SimilarTo, 0.8),
                GraphEdge::new("b", "c", EdgeKind::SimilarTo, 0.5),
            ])
            .await
            .unwrap();

        let expansion = expand(&store, &["a".to_string()], 1, 16).await.unwrap();
        let b = expansion.score_of("b").unwrap();
        assert!((b.score - 0.4).abs() < 1e-6);
        assert_eq!(b.path, vec!["a", "b"]);
        // One hop does not reach c.
        assert!(expansion.score_of("c").is_none());
        assert_eq!(expansion.subgraph.nodes.len(), 2);
        assert_eq!(expansion.subgraph.edges.len(), 1);
    }

    #[tokio::test]
    async fn test_expand_two_hops_damps_product() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        store
            .upsert_nodes(vec![node("a"), node("b"), node("c")])
            .await
            .unwrap();
        store
            .upsert_edges(vec![
                GraphEdge::new("a", "b", EdgeKind::SimilarTo, 0.8),
                GraphEdge::new("b", "c", EdgeKind::SimilarTo, 0.5),
            ])
            .await
            .unwrap();

        let expansion = expand(&store, &["a".to_string()], 2, 16).await.unwrap();
        let c = expansion.score_of("c").unwrap();
        // 0.8 * 0.5 damped by two hops.
        assert!((c.score - 0.4 / 3.0).abs() < 1e-6);
        assert_eq!(c.path, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_connected_seeds_score_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        store
            .upsert_nodes(vec![node("a"), node("b")])
            .await
            .unwrap();
        store
            .upsert_edges(vec![GraphEdge::new("a", "b", EdgeKind::SimilarTo, 0.8)])
            .await
            .unwrap();

        let expansion = expand(&store, &["a".to_string(), "b".to_string()], 2, 16)
            .await
            .unwrap();
        let a = expansion.score_of("a").unwrap();
        let b = expansion.score_of("b").unwrap();
        assert!((a.score - 0.4).abs() < 1e-6);
        assert!((b.score - 0.4).abs() < 1e-6);
        assert_eq!(a.path, vec!["b", "a"]);
        assert_eq!(b.path, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_cycle_does_not_score_the_seed() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        store
            .upsert_nodes(vec![node("a"), node("b")])
            .await
            .unwrap();
        store
            .upsert_edges(vec![GraphEdge::new("a", "b", EdgeKind::SimilarTo, 0.8)])
            .await
            .unwrap();

        // Walking a -> b -> a revisits the root; only b is reached.
        let expansion = expand(&store, &["a".to_string()], 2, 16).await.unwrap();
        assert!(expansion.score_of("a").is_none());
        assert!(expansion.score_of("b").is_some());
    }

    #[tokio::test]
    async fn test_expand_follows_reverse_edges() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        store
            .upsert_nodes(vec![node("a"), node("b")])
            .await
            .unwrap();
        store
            .upsert_edges(vec![GraphEdge::new("b", "a", EdgeKind::RefersTo, 0.6)])
            .await
            .unwrap();

        let expansion = expand(&store, &["a".to_string()], 1, 16).await.unwrap();
        assert!(expansion.score_of("b").is_some());
    }

    #[tokio::test]
    async fn test_expand_respects_node_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        let mut nodes = vec![node("hub")];
        let mut edges = Vec::new();
        for i in 0..10 {
            let id = format!("n{}", i);
            nodes.push(node(&id));
            edges.push(GraphEdge::new("hub", &id, EdgeKind::SimilarTo, 0.9));
        }
        store.upsert_nodes(nodes).await.unwrap();
        store.upsert_edges(edges).await.unwrap();

        let expansion = expand(&store, &["hub".to_string()], 1, 3).await.unwrap();
        let reached_beyond_seed = expansion
            .reached
            .values()
            .filter(|r| r.hops > 0)
            .count();
        assert_eq!(reached_beyond_seed, 3);
    }

    #[tokio::test]
    async fn test_expand_empty_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;
        let expansion = expand(&store, &[], 2, 16).await.unwrap();
        assert!(expansion.reached.is_empty());
        let expansion = expand(&store, &["a".to_string()], 0, 16).await.unwrap();
        assert!(expansion.reached.is_empty());
    }

    #[tokio::test]
    async fn test_expand_query_text_co_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path()).await;

        let alpha = keyword_node_id("alpha");
        let beta = keyword_node_id("beta");
        store
            .upsert_nodes(vec![
                node("chunk1"),
                GraphNode::new(&alpha, NodeKind::Keyword, "alpha").with_property("term", "alpha"),
                GraphNode::new(&beta, NodeKind::Keyword, "beta").with_property("term", "beta"),
            ])
            .await
            .unwrap();
        store
            .upsert_edges(vec![
                GraphEdge::new("chunk1", &alpha, EdgeKind::HasKeyword, 1.0),
                GraphEdge::new("chunk1", &beta, EdgeKind::HasKeyword, 0.5),
            ])
            .await
            .unwrap();

        let expanded = expand_query_text(&store, "alpha").await.unwrap();
        assert_eq!(expanded, "alpha beta");

        // Unknown terms expand to themselves.
        let expanded = expand_query_text(&store, "gamma").await.unwrap();
        assert_eq!(expanded, "gamma");
    }
}
