//! File chunking into typed, addressable units.
//!
//! Three strategies: `ast` (tree-sitter structural boundaries for code),
//! `regex` (heading-delimited sections for prose), and a `line` window
//! fallback. Every chunk carries a content-derived stable id, a separate
//! text hash for change detection, extracted keywords, and metadata typed
//! by chunk kind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::SystemTime;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tree_sitter::{Language, Node, Parser};

use crate::error::Result;

/// Kind of an extracted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkKind {
    MarkdownSection,
    CodeFunction,
    CodeClass,
    CodeInterface,
    CodeEnum,
    CodeType,
    SymbolDoc,
    GenericCodeBlock,
    GenericTextBlock,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarkdownSection => "markdown-section",
            Self::CodeFunction => "code-function",
            Self::CodeClass => "code-class",
            Self::CodeInterface => "code-interface",
            Self::CodeEnum => "code-enum",
            Self::CodeType => "code-type",
            Self::SymbolDoc => "symbol-doc",
            Self::GenericCodeBlock => "generic-code-block",
            Self::GenericTextBlock => "generic-text-block",
        }
    }

    /// Whether this kind holds source code extracted at a symbol boundary.
    pub fn is_code(&self) -> bool {
        matches!(
            self,
            Self::CodeFunction
                | Self::CodeClass
                | Self::CodeInterface
                | Self::CodeEnum
                | Self::CodeType
        )
    }
}

/// Kind of the symbol a code chunk was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Struct,
    Enum,
    Trait,
    Interface,
    TypeAlias,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
            Self::Struct => "struct",
            Self::Enum => "enum",
            Self::Trait => "trait",
            Self::Interface => "interface",
            Self::TypeAlias => "type_alias",
        }
    }
}

/// Per-kind chunk metadata. Only the generic variants carry a free-form
/// extension map; everything else is statically shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum ChunkMetadata {
    Section {
        heading: String,
        heading_level: u8,
        #[serde(default)]
        parent_heading: Option<String>,
    },
    Code {
        symbol_name: String,
        symbol_kind: SymbolKind,
        #[serde(default)]
        signature: Option<String>,
        #[serde(default)]
        parent_symbol: Option<String>,
        line_count: usize,
    },
    Doc {
        #[serde(default)]
        symbol_name: Option<String>,
        line_count: usize,
    },
    Generic {
        line_count: usize,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        extra: BTreeMap<String, String>,
    },
}

impl ChunkMetadata {
    pub fn generic(line_count: usize) -> Self {
        Self::Generic {
            line_count,
            extra: BTreeMap::new(),
        }
    }

    /// Symbol name, when this chunk was extracted at a symbol boundary.
    pub fn symbol_name(&self) -> Option<&str> {
        match self {
            Self::Code { symbol_name, .. } => Some(symbol_name),
            Self::Doc { symbol_name, .. } => symbol_name.as_deref(),
            _ => None,
        }
    }

    /// Name of the enclosing symbol (class for a method, impl target for
    /// an associated function), when known.
    pub fn parent_symbol(&self) -> Option<&str> {
        match self {
            Self::Code { parent_symbol, .. } => parent_symbol.as_deref(),
            _ => None,
        }
    }

    pub fn heading(&self) -> Option<&str> {
        match self {
            Self::Section { heading, .. } => Some(heading),
            _ => None,
        }
    }
}

/// An addressable unit of text extracted from one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Content-derived stable id: same text at the same location yields
    /// the same id.
    pub id: String,

    /// Path of the owning file, workspace-relative where possible.
    pub path: String,

    /// Language the file was chunked as ("rust", "markdown", "text", ...).
    pub language: String,

    pub kind: ChunkKind,

    /// The chunk body.
    pub text: String,

    /// Hash of `text` alone, independent of location shifts.
    pub text_hash: String,

    /// 1-indexed, inclusive.
    pub start_line: usize,
    pub end_line: usize,

    #[serde(default)]
    pub start_byte: Option<usize>,
    #[serde(default)]
    pub end_byte: Option<usize>,

    /// Present once the embedding service has processed the chunk.
    #[serde(default)]
    pub vector: Option<Vec<f32>>,

    /// Frequency-ranked keyword terms; set semantics, order irrelevant.
    pub keywords: Vec<String>,

    pub metadata: ChunkMetadata,

    pub updated_at: SystemTime,

    /// Monotonic per logical slot, bumped by the indexer on content change.
    pub version: u64,
}

impl Chunk {
    /// Build a chunk with computed id, text hash, and keywords. The
    /// indexer overrides `version` from the manifest lineage.
    pub fn new(
        path: &str,
        language: &str,
        kind: ChunkKind,
        start_line: usize,
        end_line: usize,
        text: &str,
        metadata: ChunkMetadata,
    ) -> Self {
        Self {
            id: compute_chunk_id(path, start_line, end_line, text),
            path: path.to_string(),
            language: language.to_string(),
            kind,
            text: text.to_string(),
            text_hash: compute_text_hash(text),
            start_line,
            end_line,
            start_byte: None,
            end_byte: None,
            vector: None,
            keywords: extract_keywords(text, DEFAULT_MAX_KEYWORDS),
            metadata,
            updated_at: SystemTime::now(),
            version: 1,
        }
    }

    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }
}

/// Stable chunk id over (path, location, text). Sixteen hex chars of
/// SHA-256 is plenty for a per-workspace store.
pub fn compute_chunk_id(path: &str, start_line: usize, end_line: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(format!("{}-{}", start_line, end_line).as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Full SHA-256 of the text body alone.
pub fn compute_text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Chunking strategy, selected per language in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// Structural boundaries via tree-sitter.
    Ast,
    /// Heading-delimited sections for prose formats.
    Regex,
    /// Fixed-size sliding window.
    Line,
}

/// Chunker configuration. Bounds apply to every strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub max_lines_per_chunk: usize,
    pub max_tokens_per_chunk: usize,
    /// Trailing lines duplicated into the next window chunk.
    pub overlap_lines: usize,
    /// Leading comment lines folded into a code chunk.
    pub include_docstring_lines: usize,
    pub max_keywords: usize,
    /// Language name → strategy. Languages absent here use the line
    /// fallback.
    pub strategies: HashMap<String, ChunkStrategy>,
}

pub(crate) const DEFAULT_MAX_KEYWORDS: usize = 12;

impl Default for ChunkerConfig {
    fn default() -> Self {
        let mut strategies = HashMap::new();
        for lang in ["rust", "python", "javascript", "typescript", "go"] {
            strategies.insert(lang.to_string(), ChunkStrategy::Ast);
        }
        strategies.insert("markdown".to_string(), ChunkStrategy::Regex);
        Self {
            max_lines_per_chunk: 160,
            max_tokens_per_chunk: 1200,
            overlap_lines: 2,
            include_docstring_lines: 12,
            max_keywords: DEFAULT_MAX_KEYWORDS,
            strategies,
        }
    }
}

/// Minimum contiguous uncovered lines that become a generic code block.
const MIN_GAP_LINES: usize = 3;

/// A chunk before ids/hashes/keywords are attached.
struct RawChunk {
    kind: ChunkKind,
    start_line: usize,
    end_line: usize,
    start_byte: Option<usize>,
    end_byte: Option<usize>,
    text: String,
    metadata: ChunkMetadata,
}

/// Splits file text into typed chunks. Holds one tree-sitter parser per
/// supported language.
pub struct Chunker {
    parsers: HashMap<String, Parser>,
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        let mut parsers = HashMap::new();

        {
            let mut parser = Parser::new();
            let language: Language = tree_sitter_rust::LANGUAGE.into();
            parser
                .set_language(&language)
                .map_err(|e| anyhow!("rust grammar: {e}"))?;
            parsers.insert("rust".to_string(), parser);
        }
        {
            let mut parser = Parser::new();
            let language: Language = tree_sitter_python::LANGUAGE.into();
            parser
                .set_language(&language)
                .map_err(|e| anyhow!("python grammar: {e}"))?;
            parsers.insert("python".to_string(), parser);
        }
        {
            let mut parser = Parser::new();
            let language: Language = tree_sitter_javascript::LANGUAGE.into();
            parser
                .set_language(&language)
                .map_err(|e| anyhow!("javascript grammar: {e}"))?;
            parsers.insert("javascript".to_string(), parser);
        }
        {
            let mut parser = Parser::new();
            let language: Language = tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into();
            parser
                .set_language(&language)
                .map_err(|e| anyhow!("typescript grammar: {e}"))?;
            parsers.insert("typescript".to_string(), parser);
        }
        {
            let mut parser = Parser::new();
            let language: Language = tree_sitter_go::LANGUAGE.into();
            parser
                .set_language(&language)
                .map_err(|e| anyhow!("go grammar: {e}"))?;
            parsers.insert("go".to_string(), parser);
        }

        Ok(Self { parsers, config })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(ChunkerConfig::default())
    }

    /// Detect language from a path's extension.
    pub fn detect_language(path: &str) -> Option<&'static str> {
        let ext = std::path::Path::new(path).extension()?.to_str()?;
        match ext {
            "rs" => Some("rust"),
            "py" => Some("python"),
            "js" | "jsx" => Some("javascript"),
            "ts" | "tsx" => Some("typescript"),
            "go" => Some("go"),
            "md" | "markdown" => Some("markdown"),
            _ => None,
        }
    }

    /// Chunk one file's text. Deterministic for identical input; ordered
    /// by position. A file matching no configured language falls back to
    /// generic text blocks under the line strategy instead of failing.
    pub fn chunk_file(&mut self, path: &str, text: &str) -> Vec<Chunk> {
        let language = Self::detect_language(path);
        let strategy = language
            .and_then(|l| self.config.strategies.get(l))
            .copied();

        let (language, raws) = match (language, strategy) {
            (Some(lang), Some(ChunkStrategy::Ast)) if self.parsers.contains_key(lang) => {
                match self.chunk_ast(lang, text) {
                    Some(raws) => (lang, raws),
                    // Parse failure: degrade to the window fallback.
                    None => (lang, self.chunk_lines(text, ChunkKind::GenericCodeBlock)),
                }
            }
            (Some(lang), Some(ChunkStrategy::Regex)) => (lang, self.chunk_markdown(text)),
            (Some(lang), _) => (lang, self.chunk_lines(text, ChunkKind::GenericCodeBlock)),
            (None, _) => ("text", self.chunk_lines(text, ChunkKind::GenericTextBlock)),
        };

        let mut out = Vec::new();
        for raw in raws {
            for bounded in self.enforce_bounds(raw) {
                out.push(self.finalize(path, language, bounded));
            }
        }
        out.sort_by_key(|c| (c.start_line, c.end_line));
        out
    }

    // ---- AST strategy ----------------------------------------------------

    fn chunk_ast(&mut self, language: &str, source: &str) -> Option<Vec<RawChunk>> {
        let parser = self.parsers.get_mut(language)?;
        let tree = parser.parse(source, None)?;
        let root = tree.root_node();

        let mut raws = Vec::new();
        let doc_end_row = self.extract_module_doc(root, source, language, &mut raws);
        Self::extract_symbols(
            root,
            source,
            self.config.include_docstring_lines,
            doc_end_row,
            None,
            &mut raws,
        );
        self.extract_gaps(source, &mut raws);
        Some(raws)
    }

    /// Leading comment block (or Python module docstring) becomes a
    /// symbol-doc chunk when it spans at least two lines.
    fn extract_module_doc(
        &self,
        root: Node,
        source: &str,
        language: &str,
        raws: &mut Vec<RawChunk>,
    ) -> Option<usize> {
        let mut cursor = root.walk();
        let mut first: Option<Node> = None;
        let mut last: Option<Node> = None;
        for child in root.children(&mut cursor) {
            match child.kind() {
                "line_comment" | "block_comment" | "comment" => {
                    if first.is_none() {
                        first = Some(child);
                    }
                    last = Some(child);
                }
                "expression_statement" if language == "python" && first.is_none() => {
                    // Module docstring: a bare string as the first statement.
                    let mut inner = child.walk();
                    if child.children(&mut inner).any(|n| n.kind() == "string") {
                        first = Some(child);
                        last = Some(child);
                    }
                    break;
                }
                _ => break,
            }
        }
        let (first, last) = (first?, last?);
        let start_row = first.start_position().row;
        let end_row = last.end_position().row;
        if end_row - start_row + 1 < 2 {
            return None;
        }
        raws.push(RawChunk {
            kind: ChunkKind::SymbolDoc,
            start_line: start_row + 1,
            end_line: end_row + 1,
            start_byte: Some(first.start_byte()),
            end_byte: Some(last.end_byte()),
            text: source[first.start_byte()..last.end_byte()].to_string(),
            metadata: ChunkMetadata::Doc {
                symbol_name: None,
                line_count: end_row - start_row + 1,
            },
        });
        Some(end_row)
    }

    fn extract_symbols(
        node: Node,
        source: &str,
        docstring_lines: usize,
        doc_end_row: Option<usize>,
        parent: Option<&str>,
        raws: &mut Vec<RawChunk>,
    ) {
        if let Some((kind, symbol_kind, name)) = Self::classify_node(node, source, parent.is_some())
        {
            let mut start_byte = node.start_byte();
            let mut start_row = node.start_position().row;
            if docstring_lines > 0 {
                if let Some((byte, row)) =
                    Self::leading_comment_span(node, docstring_lines, doc_end_row)
                {
                    start_byte = byte;
                    start_row = row;
                }
            }
            let end_row = node.end_position().row;
            let text = source[start_byte..node.end_byte()].to_string();
            let signature = Self::extract_signature(node, source, symbol_kind);
            raws.push(RawChunk {
                kind,
                start_line: start_row + 1,
                end_line: end_row + 1,
                start_byte: Some(start_byte),
                end_byte: Some(node.end_byte()),
                text,
                metadata: ChunkMetadata::Code {
                    symbol_name: name.clone(),
                    symbol_kind,
                    signature,
                    parent_symbol: parent.map(String::from),
                    line_count: end_row - start_row + 1,
                },
            });

            // Class-like containers also yield their members as chunks.
            if matches!(symbol_kind, SymbolKind::Class) {
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    Self::extract_symbols(
                        child,
                        source,
                        docstring_lines,
                        doc_end_row,
                        Some(&name),
                        raws,
                    );
                }
            }
            return;
        }

        // Rust impl blocks are containers, not chunks: members are chunked
        // with the impl target as their parent symbol.
        if node.kind() == "impl_item" {
            if let Some(target) = Self::impl_target(node, source) {
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    Self::extract_symbols(
                        child,
                        source,
                        docstring_lines,
                        doc_end_row,
                        Some(&target),
                        raws,
                    );
                }
                return;
            }
        }

        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            Self::extract_symbols(child, source, docstring_lines, doc_end_row, parent, raws);
        }
    }

    /// Map a tree-sitter node to (chunk kind, symbol kind, name).
    fn classify_node(
        node: Node,
        source: &str,
        in_container: bool,
    ) -> Option<(ChunkKind, SymbolKind, String)> {
        let kind = node.kind();
        match kind {
            // Rust
            "function_item" => {
                let name = Self::child_text(node, &["identifier"], source)?;
                let sk = if in_container {
                    SymbolKind::Method
                } else {
                    SymbolKind::Function
                };
                Some((ChunkKind::CodeFunction, sk, name))
            }
            "struct_item" => Some((
                ChunkKind::CodeClass,
                SymbolKind::Struct,
                Self::child_text(node, &["type_identifier"], source)?,
            )),
            "enum_item" => Some((
                ChunkKind::CodeEnum,
                SymbolKind::Enum,
                Self::child_text(node, &["type_identifier"], source)?,
            )),
            "trait_item" => Some((
                ChunkKind::CodeInterface,
                SymbolKind::Trait,
                Self::child_text(node, &["type_identifier"], source)?,
            )),
            "type_item" => Some((
                ChunkKind::CodeType,
                SymbolKind::TypeAlias,
                Self::child_text(node, &["type_identifier"], source)?,
            )),

            // Python
            "function_definition" => {
                let name = Self::child_text(node, &["identifier"], source)?;
                let sk = if in_container {
                    SymbolKind::Method
                } else {
                    SymbolKind::Function
                };
                Some((ChunkKind::CodeFunction, sk, name))
            }
            "class_definition" => Some((
                ChunkKind::CodeClass,
                SymbolKind::Class,
                Self::child_text(node, &["identifier"], source)?,
            )),

            // JavaScript / TypeScript
            "function_declaration" => Some((
                ChunkKind::CodeFunction,
                SymbolKind::Function,
                Self::child_text(node, &["identifier"], source)?,
            )),
            "class_declaration" => Some((
                ChunkKind::CodeClass,
                SymbolKind::Class,
                Self::child_text(node, &["identifier", "type_identifier"], source)?,
            )),
            "interface_declaration" => Some((
                ChunkKind::CodeInterface,
                SymbolKind::Interface,
                Self::child_text(node, &["type_identifier"], source)?,
            )),
            "enum_declaration" => Some((
                ChunkKind::CodeEnum,
                SymbolKind::Enum,
                Self::child_text(node, &["identifier"], source)?,
            )),
            "type_alias_declaration" => Some((
                ChunkKind::CodeType,
                SymbolKind::TypeAlias,
                Self::child_text(node, &["type_identifier"], source)?,
            )),
            "method_definition" => Some((
                ChunkKind::CodeFunction,
                SymbolKind::Method,
                Self::child_text(node, &["property_identifier"], source)?,
            )),

            // Go
            "method_declaration" => {
                let name = Self::child_text(node, &["field_identifier"], source)?;
                Some((ChunkKind::CodeFunction, SymbolKind::Method, name))
            }
            "type_declaration" => {
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    if child.kind() == "type_spec" {
                        let name = Self::child_text(child, &["type_identifier"], source)?;
                        let mut inner = child.walk();
                        let shape = child
                            .children(&mut inner)
                            .find_map(|n| match n.kind() {
                                "struct_type" => Some((ChunkKind::CodeClass, SymbolKind::Struct)),
                                "interface_type" => {
                                    Some((ChunkKind::CodeInterface, SymbolKind::Interface))
                                }
                                _ => None,
                            })
                            .unwrap_or((ChunkKind::CodeType, SymbolKind::TypeAlias));
                        return Some((shape.0, shape.1, name));
                    }
                }
                None
            }

            _ => None,
        }
    }

    /// Start of the contiguous comment/attribute run directly above a
    /// node, capped at `max_lines` and never reaching into an already
    /// emitted module-doc block.
    fn leading_comment_span(
        node: Node,
        max_lines: usize,
        doc_end_row: Option<usize>,
    ) -> Option<(usize, usize)> {
        let mut taken = 0usize;
        let mut first: Option<Node> = None;
        let mut expected_row = node.start_position().row;
        let mut sibling = node.prev_sibling();
        while let Some(s) = sibling {
            let accepted = matches!(
                s.kind(),
                "line_comment" | "block_comment" | "comment" | "attribute_item" | "decorator"
            );
            if !accepted {
                break;
            }
            let end_row = s.end_position().row;
            if end_row + 1 != expected_row && end_row != expected_row {
                break;
            }
            if let Some(doc_row) = doc_end_row {
                if s.start_position().row <= doc_row {
                    break;
                }
            }
            let span = end_row - s.start_position().row + 1;
            if taken + span > max_lines {
                break;
            }
            taken += span;
            first = Some(s);
            expected_row = s.start_position().row;
            sibling = s.prev_sibling();
        }
        first.map(|f| (f.start_byte(), f.start_position().row))
    }

    fn impl_target(node: Node, source: &str) -> Option<String> {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "type_identifier" || child.kind() == "generic_type" {
                return Some(source[child.byte_range()].to_string());
            }
        }
        None
    }

    fn child_text(node: Node, kinds: &[&str], source: &str) -> Option<String> {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if kinds.contains(&child.kind()) {
                return Some(source[child.byte_range()].to_string());
            }
        }
        None
    }

    fn extract_signature(node: Node, source: &str, symbol_kind: SymbolKind) -> Option<String> {
        let content = &source[node.byte_range()];
        match symbol_kind {
            SymbolKind::Function | SymbolKind::Method => {
                content.lines().next().map(|s| s.trim().to_string())
            }
            SymbolKind::Struct
            | SymbolKind::Enum
            | SymbolKind::Trait
            | SymbolKind::Class
            | SymbolKind::Interface => match content.find('{') {
                Some(pos) => Some(content[..pos].trim().to_string()),
                None => content.lines().next().map(|s| s.trim().to_string()),
            },
            SymbolKind::TypeAlias => content.lines().next().map(|s| s.trim().to_string()),
        }
    }

    /// Contiguous non-blank regions not covered by any symbol chunk become
    /// generic code blocks, so imports and top-level statements stay
    /// addressable.
    fn extract_gaps(&self, source: &str, raws: &mut Vec<RawChunk>) {
        let lines: Vec<&str> = source.lines().collect();
        if lines.is_empty() {
            return;
        }
        let mut covered = vec![false; lines.len()];
        for raw in raws.iter() {
            for row in raw.start_line - 1..raw.end_line.min(lines.len()) {
                covered[row] = true;
            }
        }

        let mut run_start: Option<usize> = None;
        let mut gaps = Vec::new();
        for (row, line) in lines.iter().enumerate() {
            let usable = !covered[row] && !line.trim().is_empty();
            match (usable, run_start) {
                (true, None) => run_start = Some(row),
                (false, Some(start)) => {
                    gaps.push((start, row - 1));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            gaps.push((start, lines.len() - 1));
        }

        for (start, end) in gaps {
            if end - start + 1 < MIN_GAP_LINES {
                continue;
            }
            raws.push(RawChunk {
                kind: ChunkKind::GenericCodeBlock,
                start_line: start + 1,
                end_line: end + 1,
                start_byte: None,
                end_byte: None,
                text: lines[start..=end].join("\n"),
                metadata: ChunkMetadata::generic(end - start + 1),
            });
        }
    }

    // ---- Regex (heading) strategy ----------------------------------------

    fn chunk_markdown(&self, text: &str) -> Vec<RawChunk> {
        let lines: Vec<&str> = text.lines().collect();
        let mut headings: Vec<(usize, u8, String)> = Vec::new();
        let mut in_fence = false;
        for (row, line) in lines.iter().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }
            if let Some(level) = heading_level(trimmed) {
                let heading = trimmed[level as usize..].trim().to_string();
                headings.push((row, level, heading));
            }
        }

        let mut raws = Vec::new();

        // Preamble before the first heading.
        let preamble_end = headings.first().map(|(row, _, _)| *row).unwrap_or(lines.len());
        if lines[..preamble_end].iter().any(|l| !l.trim().is_empty()) {
            raws.push(RawChunk {
                kind: ChunkKind::GenericTextBlock,
                start_line: 1,
                end_line: preamble_end,
                start_byte: None,
                end_byte: None,
                text: lines[..preamble_end].join("\n"),
                metadata: ChunkMetadata::generic(preamble_end),
            });
        }

        // A stack of (level, heading) gives each section its parent.
        let mut stack: Vec<(u8, String)> = Vec::new();
        for (i, (row, level, heading)) in headings.iter().enumerate() {
            let end_row = headings
                .get(i + 1)
                .map(|(next, _, _)| next - 1)
                .unwrap_or(lines.len().saturating_sub(1));
            while let Some((l, _)) = stack.last() {
                if *l >= *level {
                    stack.pop();
                } else {
                    break;
                }
            }
            let parent_heading = stack.last().map(|(_, h)| h.clone());
            stack.push((*level, heading.clone()));

            raws.push(RawChunk {
                kind: ChunkKind::MarkdownSection,
                start_line: row + 1,
                end_line: end_row + 1,
                start_byte: None,
                end_byte: None,
                text: lines[*row..=end_row].join("\n"),
                metadata: ChunkMetadata::Section {
                    heading: heading.clone(),
                    heading_level: *level,
                    parent_heading,
                },
            });
        }

        if raws.is_empty() && !text.trim().is_empty() {
            return self.chunk_lines(text, ChunkKind::GenericTextBlock);
        }
        raws
    }

    // ---- Line window fallback --------------------------------------------

    fn chunk_lines(&self, text: &str, kind: ChunkKind) -> Vec<RawChunk> {
        let lines: Vec<&str> = text.lines().collect();
        if lines.iter().all(|l| l.trim().is_empty()) {
            return Vec::new();
        }
        let window = self.config.max_lines_per_chunk.max(1);
        let step = window.saturating_sub(self.config.overlap_lines).max(1);

        let mut raws = Vec::new();
        let mut start = 0usize;
        while start < lines.len() {
            let end = (start + window).min(lines.len());
            raws.push(RawChunk {
                kind,
                start_line: start + 1,
                end_line: end,
                start_byte: None,
                end_byte: None,
                text: lines[start..end].join("\n"),
                metadata: ChunkMetadata::generic(end - start),
            });
            if end == lines.len() {
                break;
            }
            start += step;
        }
        raws
    }

    // ---- Bounds ----------------------------------------------------------

    /// Re-split a chunk that exceeds the line or token bound: first at
    /// blank-line boundaries, then by window with overlap.
    fn enforce_bounds(&self, raw: RawChunk) -> Vec<RawChunk> {
        let line_count = raw.end_line - raw.start_line + 1;
        let token_count = count_tokens(&raw.text);
        if line_count <= self.config.max_lines_per_chunk
            && token_count <= self.config.max_tokens_per_chunk
        {
            return vec![raw];
        }

        let lines: Vec<&str> = raw.text.lines().collect();
        let mut pieces: Vec<(usize, usize)> = Vec::new();
        let mut piece_start = 0usize;
        let mut tokens_in_piece = 0usize;
        for (i, line) in lines.iter().enumerate() {
            let line_tokens = count_tokens(line);
            let lines_in_piece = i - piece_start + 1;
            let over = lines_in_piece > self.config.max_lines_per_chunk
                || tokens_in_piece + line_tokens > self.config.max_tokens_per_chunk;
            if over && i > piece_start {
                // Prefer the nearest blank-line boundary at or before i.
                let boundary = (piece_start + 1..i)
                    .rev()
                    .find(|&j| lines[j].trim().is_empty())
                    .unwrap_or(i);
                pieces.push((piece_start, boundary - 1));
                piece_start = boundary.saturating_sub(self.config.overlap_lines).max(
                    pieces
                        .last()
                        .map(|(s, _)| *s + 1)
                        .unwrap_or(0),
                );
                tokens_in_piece = lines[piece_start..=i].iter().map(|l| count_tokens(l)).sum();
            } else {
                tokens_in_piece += line_tokens;
            }
        }
        if piece_start < lines.len() {
            pieces.push((piece_start, lines.len() - 1));
        }

        pieces
            .into_iter()
            .map(|(s, e)| RawChunk {
                kind: raw.kind,
                start_line: raw.start_line + s,
                end_line: raw.start_line + e,
                start_byte: None,
                end_byte: None,
                text: lines[s..=e].join("\n"),
                metadata: raw.metadata.clone(),
            })
            .collect()
    }

    fn finalize(&self, path: &str, language: &str, raw: RawChunk) -> Chunk {
        let text_hash = compute_text_hash(&raw.text);
        Chunk {
            id: compute_chunk_id(path, raw.start_line, raw.end_line, &raw.text),
            path: path.to_string(),
            language: language.to_string(),
            kind: raw.kind,
            text_hash,
            keywords: extract_keywords(&raw.text, self.config.max_keywords),
            text: raw.text,
            start_line: raw.start_line,
            end_line: raw.end_line,
            start_byte: raw.start_byte,
            end_byte: raw.end_byte,
            vector: None,
            metadata: raw.metadata,
            updated_at: SystemTime::now(),
            version: 1,
        }
    }
}

fn heading_level(line: &str) -> Option<u8> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) && line[hashes..].starts_with(' ') {
        Some(hashes as u8)
    } else {
        None
    }
}

fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

// ---- Keyword extraction --------------------------------------------------

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "are", "was", "were", "will", "would",
    "can", "could", "should", "have", "has", "had", "not", "but", "you", "your", "all", "any",
    "may", "out", "use", "used", "using", "into", "over", "when", "where", "which", "while",
    "than", "then", "them", "they", "their", "there", "here", "what", "how", "why", "its", "our",
    "also", "each", "other", "more", "most", "some", "such", "only", "own", "same", "too", "very",
    "just", "get", "set", "new", "let", "var", "const", "mut", "pub", "def", "func", "return",
    "self", "true", "false", "null", "none", "import", "export", "class", "struct", "enum",
    "type", "impl", "trait", "interface", "function", "public", "private", "static", "void",
    "string", "bool", "usize",
];

/// Lowercase alphanumeric/underscore tokens, two characters or longer.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(String::from)
        .collect()
}

/// Frequency-ranked keyword terms for a chunk or query. Ties break
/// alphabetically so the result is deterministic.
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let stop: HashSet<&str> = STOPWORDS.iter().copied().collect();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in tokenize(text) {
        if token.len() < 3 || stop.contains(token.as_str()) || token.chars().all(char::is_numeric)
        {
            continue;
        }
        *counts.entry(token).or_insert(0) += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(max).map(|(t, _)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::with_defaults().unwrap()
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(Chunker::detect_language("foo.rs"), Some("rust"));
        assert_eq!(Chunker::detect_language("bar.py"), Some("python"));
        assert_eq!(Chunker::detect_language("baz.jsx"), Some("javascript"));
        assert_eq!(Chunker::detect_language("qux.tsx"), Some("typescript"));
        assert_eq!(Chunker::detect_language("main.go"), Some("go"));
        assert_eq!(Chunker::detect_language("README.md"), Some("markdown"));
        assert_eq!(Chunker::detect_language("unknown.xyz"), None);
    }

    #[test]
    fn test_chunk_rust_source() {
        let mut chunker = chunker();
        let source = r#"
pub struct Foo {
    x: i32,
}

impl Foo {
    pub fn new(x: i32) -> Self {
        Self { x }
    }

    pub fn get_x(&self) -> i32 {
        self.x
    }
}

pub fn standalone() -> i32 {
    42
}
"#;
        let chunks = chunker.chunk_file("test.rs", source);
        assert!(chunks.len() >= 4);

        let strukt = chunks
            .iter()
            .find(|c| c.kind == ChunkKind::CodeClass)
            .expect("struct chunk");
        assert_eq!(strukt.metadata.symbol_name(), Some("Foo"));

        let standalone = chunks
            .iter()
            .find(|c| c.metadata.symbol_name() == Some("standalone"))
            .expect("standalone fn");
        assert_eq!(standalone.kind, ChunkKind::CodeFunction);
        assert!(standalone.metadata.parent_symbol().is_none());

        // Impl members carry the impl target as their parent.
        let new_fn = chunks
            .iter()
            .find(|c| c.metadata.symbol_name() == Some("new"))
            .expect("new fn");
        assert_eq!(new_fn.metadata.parent_symbol(), Some("Foo"));
    }

    #[test]
    fn test_chunk_rust_enum_and_trait() {
        let mut chunker = chunker();
        let source = r#"
pub enum Color {
    Red,
    Green,
}

pub trait Drawable {
    fn draw(&self);
}

pub type Alias = Vec<Color>;
"#;
        let chunks = chunker.chunk_file("shapes.rs", source);
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::CodeEnum
            && c.metadata.symbol_name() == Some("Color")));
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::CodeInterface
            && c.metadata.symbol_name() == Some("Drawable")));
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::CodeType
            && c.metadata.symbol_name() == Some("Alias")));
    }

    #[test]
    fn test_chunk_python_class_methods() {
        let mut chunker = chunker();
        let source = r#"
class Calculator:
    def __init__(self, value=0):
        self.value = value

    def add(self, x):
        self.value += x
        return self
"#;
        let chunks = chunker.chunk_file("calc.py", source);

        let class_chunk = chunks
            .iter()
            .find(|c| c.kind == ChunkKind::CodeClass)
            .expect("class chunk");
        assert_eq!(class_chunk.metadata.symbol_name(), Some("Calculator"));

        let add = chunks
            .iter()
            .find(|c| c.metadata.symbol_name() == Some("add"))
            .expect("method chunk");
        assert_eq!(add.metadata.parent_symbol(), Some("Calculator"));
    }

    #[test]
    fn test_chunk_typescript_interface() {
        let mut chunker = chunker();
        let source = r#"
interface User {
    id: number;
    name: string;
}

function greet(user: User): string {
    return `Hello, ${user.name}!`;
}
"#;
        let chunks = chunker.chunk_file("user.ts", source);
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::CodeInterface
            && c.metadata.symbol_name() == Some("User")));
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::CodeFunction
            && c.metadata.symbol_name() == Some("greet")));
    }

    #[test]
    fn test_chunk_go_struct_and_method() {
        let mut chunker = chunker();
        let source = r#"
package main

type Point struct {
    X float64
    Y float64
}

func (p *Point) Norm() float64 {
    return p.X*p.X + p.Y*p.Y
}
"#;
        let chunks = chunker.chunk_file("main.go", source);
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::CodeClass
            && c.metadata.symbol_name() == Some("Point")));
        assert!(chunks
            .iter()
            .any(|c| c.metadata.symbol_name() == Some("Norm")));
    }

    #[test]
    fn test_markdown_sections() {
        let mut chunker = chunker();
        let source = "\
Intro line before any heading.

# Math Library

Utilities for arithmetic.

## Addition

The add function sums numbers.

## Multiplication

The multiply function scales numbers.
";
        let chunks = chunker.chunk_file("README.md", source);

        let sections: Vec<_> = chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::MarkdownSection)
            .collect();
        assert_eq!(sections.len(), 3);

        let addition = sections
            .iter()
            .find(|c| c.metadata.heading() == Some("Addition"))
            .expect("addition section");
        match &addition.metadata {
            ChunkMetadata::Section {
                heading_level,
                parent_heading,
                ..
            } => {
                assert_eq!(*heading_level, 2);
                assert_eq!(parent_heading.as_deref(), Some("Math Library"));
            }
            other => panic!("unexpected metadata: {:?}", other),
        }

        // Preamble lands in a generic text block.
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::GenericTextBlock
            && c.text.contains("Intro line")));
    }

    #[test]
    fn test_markdown_ignores_fenced_hashes() {
        let mut chunker = chunker();
        let source = "# Real\n\n```\n# not a heading\n```\n\nbody\n";
        let chunks = chunker.chunk_file("doc.md", source);
        let sections: Vec<_> = chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::MarkdownSection)
            .collect();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].metadata.heading(), Some("Real"));
    }

    #[test]
    fn test_unknown_extension_falls_back() {
        let mut chunker = chunker();
        let chunks = chunker.chunk_file("notes.xyz", "some plain text\nmore text\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::GenericTextBlock);
        assert_eq!(chunks[0].language, "text");
    }

    #[test]
    fn test_stable_ids() {
        let mut chunker = chunker();
        let source = "fn alpha() -> i32 { 1 }\n";
        let a = chunker.chunk_file("lib.rs", source);
        let b = chunker.chunk_file("lib.rs", source);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.text_hash, y.text_hash);
        }
    }

    #[test]
    fn test_text_hash_changes_with_content() {
        let h1 = compute_text_hash("fn foo() { 1 }");
        let h2 = compute_text_hash("fn foo() { 2 }");
        assert_ne!(h1, h2);

        let id1 = compute_chunk_id("a.rs", 1, 1, "fn foo() { 1 }");
        let id2 = compute_chunk_id("a.rs", 1, 1, "fn foo() { 2 }");
        assert_ne!(id1, id2);
        // Same text at a different location gets a different id but the
        // same text hash.
        let id3 = compute_chunk_id("a.rs", 5, 5, "fn foo() { 1 }");
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_doc_comment_fold_in() {
        let mut chunker = chunker();
        let source = "\
fn first() -> i32 { 0 }

/// Adds two numbers together.
/// Used by the calculator.
fn add(a: i32, b: i32) -> i32 {
    a + b
}
";
        let chunks = chunker.chunk_file("math.rs", source);
        let add = chunks
            .iter()
            .find(|c| c.metadata.symbol_name() == Some("add"))
            .expect("add chunk");
        assert!(add.text.contains("Adds two numbers"));
        assert_eq!(add.start_line, 3);
    }

    #[test]
    fn test_module_doc_chunk() {
        let mut chunker = chunker();
        let source = "\
//! Math helpers.
//! Shared across the workspace.

pub fn noop() {}
";
        let chunks = chunker.chunk_file("lib.rs", source);
        let doc = chunks
            .iter()
            .find(|c| c.kind == ChunkKind::SymbolDoc)
            .expect("module doc chunk");
        assert!(doc.text.contains("Math helpers"));
        assert_eq!(doc.start_line, 1);
    }

    #[test]
    fn test_gap_chunks_cover_imports() {
        let mut chunker = chunker();
        let source = "\
use std::collections::HashMap;
use std::fmt;
use std::io;

fn lone() {}
";
        let chunks = chunker.chunk_file("gaps.rs", source);
        let gap = chunks
            .iter()
            .find(|c| c.kind == ChunkKind::GenericCodeBlock)
            .expect("gap chunk");
        assert!(gap.text.contains("HashMap"));
        assert_eq!(gap.start_line, 1);
        assert_eq!(gap.end_line, 3);
    }

    #[test]
    fn test_line_bound_splits_long_file() {
        let config = ChunkerConfig {
            max_lines_per_chunk: 10,
            overlap_lines: 2,
            ..ChunkerConfig::default()
        };
        let mut chunker = Chunker::new(config).unwrap();
        let text: String = (0..35).map(|i| format!("line {}\n", i)).collect();
        let chunks = chunker.chunk_file("big.txt", &text);

        assert!(chunks.len() >= 4);
        for c in &chunks {
            assert!(c.line_count() <= 10);
        }
        // Overlap duplicates trailing lines into the next chunk.
        assert_eq!(chunks[1].start_line, chunks[0].end_line - 1);
    }

    #[test]
    fn test_oversize_section_resplit() {
        let config = ChunkerConfig {
            max_lines_per_chunk: 8,
            ..ChunkerConfig::default()
        };
        let mut chunker = Chunker::new(config).unwrap();
        let mut source = String::from("# Big Section\n\n");
        for i in 0..6 {
            source.push_str(&format!("paragraph {} first line\nsecond line\n\n", i));
        }
        let chunks = chunker.chunk_file("big.md", &source);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.line_count() <= 8, "chunk spans {} lines", c.line_count());
            assert_eq!(c.kind, ChunkKind::MarkdownSection);
        }
    }

    #[test]
    fn test_keyword_extraction() {
        let keywords = extract_keywords(
            "calculate the total sum, then calculate the total again",
            5,
        );
        assert_eq!(keywords[0], "calculate");
        assert!(keywords.contains(&"total".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
    }

    #[test]
    fn test_signature_extraction() {
        let mut chunker = chunker();
        let source = "pub fn calculate(x: i32, y: i32) -> i32 {\n    x + y\n}\n";
        let chunks = chunker.chunk_file("sig.rs", source);
        let f = &chunks[0];
        match &f.metadata {
            ChunkMetadata::Code { signature, .. } => {
                let sig = signature.as_ref().expect("signature");
                assert!(sig.contains("pub fn calculate"));
            }
            other => panic!("unexpected metadata: {:?}", other),
        }
    }

    #[test]
    fn test_empty_file_yields_no_chunks() {
        let mut chunker = chunker();
        assert!(chunker.chunk_file("empty.rs", "").is_empty());
        assert!(chunker.chunk_file("empty.txt", "\n\n\n").is_empty());
    }
}
