//! Workspace manifest: per-file change detection and chunk lineage.
//!
//! The manifest records, for every indexed file, the content hash it was
//! last indexed at and one lineage slot per chunk ordinal. Slots carry
//! the chunk's stable id, its text hash, and a version that bumps when
//! the text at that position changes. Chunk ids are content-derived, so
//! the slot table is what lets a re-index tell "same logical chunk, new
//! text" apart from "new chunk".

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::Chunk;
use crate::error::{EngineError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Lineage slot for one chunk position within a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSlot {
    pub chunk_id: String,
    pub text_hash: String,
    pub version: u64,
}

/// Last indexed state of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    pub content_hash: String,
    pub indexed_at: SystemTime,
    /// Chunk lineage in file order; the index is the chunk ordinal.
    pub slots: Vec<ChunkSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstoned_at: Option<SystemTime>,
}

impl FileState {
    pub fn chunk_ids(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.chunk_id.clone()).collect()
    }
}

/// Persisted manifest document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    version: u64,
    files: BTreeMap<String, FileState>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .map_err(|e| EngineError::Store(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| EngineError::Store(format!("cannot parse {}: {}", path.display(), e)))
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.version += 1;
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)
            .map_err(|e| EngineError::Store(format!("cannot write {}: {}", path.display(), e)))?;
        debug!("saved manifest v{} ({} files)", self.version, self.files.len());
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn get(&self, path: &str) -> Option<&FileState> {
        self.files.get(path)
    }

    /// Whether a file must be (re)indexed: unknown path, changed content
    /// hash, or a tombstoned entry coming back.
    pub fn needs_update(&self, path: &str, content_hash: &str) -> bool {
        match self.files.get(path) {
            None => true,
            Some(state) => state.tombstoned_at.is_some() || state.content_hash != content_hash,
        }
    }

    /// Assign chunk versions from lineage and commit the file's new slot
    /// table. A chunk whose slot kept its text hash carries the prior
    /// version; a changed slot bumps it; a new slot starts at 1. Returns
    /// the prior chunk ids no longer present, for deletion.
    pub fn apply_file(
        &mut self,
        path: &str,
        content_hash: &str,
        chunks: &mut [Chunk],
    ) -> Vec<String> {
        let prior = self.files.get(path);
        for (ordinal, chunk) in chunks.iter_mut().enumerate() {
            chunk.version = match prior.and_then(|f| f.slots.get(ordinal)) {
                Some(slot) if slot.text_hash == chunk.text_hash => slot.version,
                Some(slot) => slot.version + 1,
                None => 1,
            };
        }

        let new_ids: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let stale = prior
            .map(|f| {
                f.slots
                    .iter()
                    .filter(|s| !new_ids.contains(s.chunk_id.as_str()))
                    .map(|s| s.chunk_id.clone())
                    .collect()
            })
            .unwrap_or_default();

        self.files.insert(
            path.to_string(),
            FileState {
                content_hash: content_hash.to_string(),
                indexed_at: SystemTime::now(),
                slots: chunks
                    .iter()
                    .map(|c| ChunkSlot {
                        chunk_id: c.id.clone(),
                        text_hash: c.text_hash.clone(),
                        version: c.version,
                    })
                    .collect(),
                tombstoned_at: None,
            },
        );
        stale
    }

    /// Known, non-tombstoned files absent from the current scan.
    pub fn missing_files(&self, scanned: &HashSet<String>) -> Vec<String> {
        self.files
            .iter()
            .filter(|(path, state)| {
                state.tombstoned_at.is_none() && !scanned.contains(path.as_str())
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Mark a file tombstoned; returns its chunk ids.
    pub fn tombstone_file(&mut self, path: &str) -> Vec<String> {
        match self.files.get_mut(path) {
            Some(state) => {
                if state.tombstoned_at.is_none() {
                    state.tombstoned_at = Some(SystemTime::now());
                }
                state.chunk_ids()
            }
            None => Vec::new(),
        }
    }

    /// Drop a file entirely; returns its chunk ids.
    pub fn remove_file(&mut self, path: &str) -> Vec<String> {
        self.files
            .remove(path)
            .map(|state| state.chunk_ids())
            .unwrap_or_default()
    }

    /// Drop tombstoned entries whose marker predates `older_than`.
    /// Returns the purged paths.
    pub fn purge_expired(&mut self, older_than: SystemTime) -> Vec<String> {
        let expired: Vec<String> = self
            .files
            .iter()
            .filter(|(_, state)| {
                state
                    .tombstoned_at
                    .map_or(false, |at| at < older_than)
            })
            .map(|(path, _)| path.clone())
            .collect();
        for path in &expired {
            self.files.remove(path);
        }
        expired
    }
}
