//! Snapshot transition values.
//!
//! A [`Delta`] describes the difference between two snapshots as
//! add/update/remove sets keyed by chunk id. Applying a delta is
//! idempotent when replayed on the snapshot it was computed from.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::chunk::CodeChunk;

#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("chunk id {0} appears in more than one of added/updated/removed")]
    OverlappingSets(String),
    #[error("updated chunk {0} does not exist in the prior snapshot")]
    UpdatedMissing(String),
}

/// File-level classification, derived for reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChanges {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Paths that need rechunking (added + modified)
    pub fn changed_paths(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.modified.iter())
    }
}

/// A file observed on disk right now, as the indexer scans it
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Relative path, forward slashes
    pub path: String,
    pub mtime_ms: i64,
    /// blake3 hex of file content
    pub file_hash: String,
}

/// Transition between two snapshots
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    /// Freshly embedded chunks to insert
    pub added: Vec<CodeChunk>,
    /// Chunks that survived unchanged (cache hits); the store keeps the
    /// prior embedding for these, refreshing only file-source metadata
    pub updated: Vec<CodeChunk>,
    /// Ids to drop
    pub removed: Vec<String>,
    /// Derived file-level report
    pub file_changes: FileChanges,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Check the pairwise-disjointness invariant over the three id sets.
    pub fn validate(&self) -> Result<(), DeltaError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for id in self
            .added
            .iter()
            .map(|c| c.chunk_id.as_str())
            .chain(self.updated.iter().map(|c| c.chunk_id.as_str()))
            .chain(self.removed.iter().map(|s| s.as_str()))
        {
            if !seen.insert(id) {
                return Err(DeltaError::OverlappingSets(id.to_string()));
            }
        }
        Ok(())
    }
}

/// Outcome of matching one file's old chunks against its new chunks.
/// Matching is by exact `chunk_id` only — no fuzzy matching.
#[derive(Debug, Default)]
pub struct ChunkComparison {
    pub to_add: Vec<CodeChunk>,
    pub to_keep: Vec<CodeChunk>,
    pub to_remove: Vec<String>,
}

/// Partition new chunks for a file into add/keep sets and old ids into
/// the remove set.
pub fn compare_chunks(old_chunks: &[CodeChunk], new_chunks: &[CodeChunk]) -> ChunkComparison {
    let old_ids: HashSet<&str> = old_chunks.iter().map(|c| c.chunk_id.as_str()).collect();
    let new_ids: HashSet<&str> = new_chunks.iter().map(|c| c.chunk_id.as_str()).collect();

    let mut result = ChunkComparison::default();
    for chunk in new_chunks {
        if old_ids.contains(chunk.chunk_id.as_str()) {
            result.to_keep.push(chunk.clone());
        } else {
            result.to_add.push(chunk.clone());
        }
    }
    for chunk in old_chunks {
        if !new_ids.contains(chunk.chunk_id.as_str()) {
            result.to_remove.push(chunk.chunk_id.clone());
        }
    }
    result
}
