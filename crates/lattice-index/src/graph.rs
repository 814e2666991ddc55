//! Graph entity schema: nodes and edges derived from indexed chunks.
//!
//! Nodes mirror chunks (plus synthetic keyword nodes); edges carry a kind
//! and a weight in [0,1]. Both are persisted by the vector store and
//! traversed by the search pipeline's expansion step.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunker::ChunkKind;

/// Kind of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Document,
    Section,
    Keyword,
    Symbol,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Section => "section",
            Self::Keyword => "keyword",
            Self::Symbol => "symbol",
        }
    }

    /// Node kind for a chunk-backed node. Markdown sections become
    /// `section`, symbol-boundary code chunks become `symbol`, everything
    /// else becomes `document`.
    pub fn from_chunk_kind(kind: ChunkKind) -> Self {
        if kind == ChunkKind::MarkdownSection {
            Self::Section
        } else if kind.is_code() {
            Self::Symbol
        } else {
            Self::Document
        }
    }
}

/// Kind of a graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Contains,
    HasKeyword,
    RefersTo,
    MentionsSymbol,
    MemberOf,
    SimilarTo,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "CONTAINS",
            Self::HasKeyword => "HAS_KEYWORD",
            Self::RefersTo => "REFERS_TO",
            Self::MentionsSymbol => "MENTIONS_SYMBOL",
            Self::MemberOf => "MEMBER_OF",
            Self::SimilarTo => "SIMILAR_TO",
        }
    }
}

/// A node in the semantic graph.
///
/// Chunk-backed nodes reuse the chunk id; keyword nodes get a synthetic id
/// derived from the term and list the chunks sharing it in `chunk_ids`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunk_ids: Vec<String>,
    pub updated_at: SystemTime,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            path: None,
            properties: BTreeMap::new(),
            chunk_ids: Vec::new(),
            updated_at: SystemTime::now(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A directed, weighted edge in the semantic graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub kind: EdgeKind,
    pub weight: f32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl GraphEdge {
    /// Create an edge with a stable id. Weight is clamped to [0,1].
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        kind: EdgeKind,
        weight: f32,
    ) -> Self {
        let source_id = source_id.into();
        let target_id = target_id.into();
        let id = edge_id(&source_id, kind, &target_id);
        Self {
            id,
            source_id,
            target_id,
            kind,
            weight: weight.clamp(0.0, 1.0),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Stable edge id: first 16 hex chars of SHA-256 over source, kind, target.
/// Re-deriving the same edge always maps to the same record.
pub fn edge_id(source_id: &str, kind: EdgeKind, target_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(target_id.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Synthetic node id for a keyword term.
pub fn keyword_node_id(term: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"keyword|");
    hasher.update(term.as_bytes());
    format!("kw-{}", hex::encode(&hasher.finalize()[..6]))
}
