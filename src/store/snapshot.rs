//! On-disk snapshot format and atomic persistence.
//!
//! A snapshot is one JSON document: schema version tag, model
//! descriptor, creation stamp, and the primary chunk map. Unknown
//! top-level keys survive a load/save round-trip. A `.zst` sibling is
//! written instead of the plain file whenever the compressed bytes are
//! smaller; readers try both and take the newer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::chunk::CodeChunk;
use crate::EMBEDDING_DIM;

use super::StoreError;

/// Current snapshot schema tag
pub const SCHEMA_VERSION: &str = "2";

/// zstd level for the compressed variant; mid-range, fast enough to sit
/// on the save path
const ZSTD_LEVEL: i32 = 3;

/// Embedding model descriptor pinned into the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub dimension: usize,
}

impl Default for ModelInfo {
    fn default() -> Self {
        ModelInfo {
            name: "all-MiniLM-L6-v2".to_string(),
            dimension: EMBEDDING_DIM,
        }
    }
}

/// In-memory snapshot: primary chunk map plus the derived file index.
///
/// The file index is rebuilt deterministically from the primary map on
/// every load and mutation, so persisting the primary map atomically
/// keeps the pair consistent at every observable point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: String,
    pub model: ModelInfo,
    /// Unix ms
    pub created_at: i64,
    pub chunks: HashMap<String, CodeChunk>,
    /// Unknown top-level keys, preserved round-trip
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    file_index: HashMap<String, BTreeSet<String>>,
}

impl Snapshot {
    pub fn empty(model: ModelInfo) -> Self {
        Snapshot {
            schema_version: SCHEMA_VERSION.to_string(),
            model,
            created_at: chrono::Utc::now().timestamp_millis(),
            chunks: HashMap::new(),
            extra: serde_json::Map::new(),
            file_index: HashMap::new(),
        }
    }

    /// Rebuild the `file_path → chunk_ids` index from the primary map.
    pub fn rebuild_file_index(&mut self) {
        let mut index: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (id, chunk) in &self.chunks {
            index
                .entry(chunk.file_path.clone())
                .or_default()
                .insert(id.clone());
        }
        self.file_index = index;
    }

    pub fn file_index(&self) -> &HashMap<String, BTreeSet<String>> {
        &self.file_index
    }

    /// Ids of all chunks belonging to one file
    pub fn chunk_ids_for_file(&self, path: &str) -> Option<&BTreeSet<String>> {
        self.file_index.get(path)
    }

    /// Check the load-time invariants. A failure here is index
    /// corruption: the orchestrator responds with a full rebuild.
    pub fn check_invariants(&self, expected_model: &ModelInfo) -> Result<(), StoreError> {
        if self.model != *expected_model {
            return Err(StoreError::ModelMismatch {
                found: format!("{} ({}d)", self.model.name, self.model.dimension),
                expected: format!("{} ({}d)", expected_model.name, expected_model.dimension),
            });
        }
        for (id, chunk) in &self.chunks {
            if *id != chunk.chunk_id {
                return Err(StoreError::Corrupt(format!(
                    "map key {id} disagrees with chunk_id {}",
                    chunk.chunk_id
                )));
            }
            chunk
                .validate()
                .map_err(|e| StoreError::Corrupt(format!("chunk {id}: {e}")))?;
        }
        for (path, ids) in &self.file_index {
            for id in ids {
                match self.chunks.get(id) {
                    Some(c) if c.file_path == *path => {}
                    _ => {
                        return Err(StoreError::Corrupt(format!(
                            "file index references missing chunk {id} for {path}"
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

/// Candidate snapshot file on disk: plain or compressed sibling
fn variants(path: &Path) -> [PathBuf; 2] {
    [path.to_path_buf(), zst_path(path)]
}

fn zst_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".zst");
    PathBuf::from(os)
}

/// Find the newest existing variant of `path`, returning its mtime in ms.
pub fn newest_variant(path: &Path) -> Option<(PathBuf, i64)> {
    variants(path)
        .into_iter()
        .filter_map(|p| {
            let meta = std::fs::metadata(&p).ok()?;
            let mtime = meta
                .modified()
                .ok()?
                .duration_since(std::time::UNIX_EPOCH)
                .ok()?
                .as_millis() as i64;
            Some((p, mtime))
        })
        .max_by_key(|(_, mtime)| *mtime)
}

/// Read and parse a snapshot from a concrete file (plain or `.zst`).
pub fn read_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
    let raw = std::fs::read(path)?;
    let bytes = if path.extension().and_then(|e| e.to_str()) == Some("zst") {
        zstd::decode_all(raw.as_slice())
            .map_err(|e| StoreError::Corrupt(format!("zstd decode {}: {e}", path.display())))?
    } else {
        raw
    };
    let mut snapshot: Snapshot = serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::Corrupt(format!("parse {}: {e}", path.display())))?;
    snapshot.rebuild_file_index();
    Ok(snapshot)
}

/// Write a snapshot atomically: serialize, stage to a temp file in the
/// target directory (name carries a timestamp plus a random token),
/// fsync, then rename over whichever variant wins on size. The losing
/// variant is removed so readers never see a stale sibling.
pub fn write_snapshot(snapshot: &Snapshot, path: &Path) -> Result<(), StoreError> {
    let plain = serde_json::to_vec(snapshot)?;
    let compressed = zstd::encode_all(plain.as_slice(), ZSTD_LEVEL)
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;

    let (target, bytes, stale) = if compressed.len() < plain.len() {
        (zst_path(path), compressed, path.to_path_buf())
    } else {
        (path.to_path_buf(), plain, zst_path(path))
    };

    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let stamp = chrono::Utc::now().timestamp_millis();
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!("{file_name}.{stamp}."))
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&target)
        .map_err(|e| StoreError::Io(e.error))?;

    if stale != target {
        match std::fs::remove_file(&stale) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %stale.display(), error = %e, "Failed to remove stale snapshot variant"),
        }
    }

    tracing::debug!(
        path = %target.display(),
        bytes = bytes.len(),
        chunks = snapshot.chunks.len(),
        "Snapshot written"
    );
    Ok(())
}

/// Copy the freshly written snapshot variant to the global mirror.
/// Mirror failures are logged, never surfaced — the local write is the
/// durable one.
pub fn mirror_snapshot(local: &Path, mirror: &Path) {
    let Some((src, _)) = newest_variant(local) else {
        return;
    };
    let dst = if src.extension().and_then(|e| e.to_str()) == Some("zst") {
        zst_path(mirror)
    } else {
        mirror.to_path_buf()
    };
    let stale = if dst == *mirror {
        zst_path(mirror)
    } else {
        mirror.to_path_buf()
    };

    let result = dst
        .parent()
        .map(std::fs::create_dir_all)
        .transpose()
        .and_then(|_| std::fs::copy(&src, &dst));
    match result {
        Ok(_) => {
            let _ = std::fs::remove_file(&stale);
            tracing::debug!(path = %dst.display(), "Mirrored snapshot");
        }
        Err(e) => {
            tracing::warn!(path = %dst.display(), error = %e, "Failed to mirror snapshot");
        }
    }
}

/// Delete every on-disk variant of a snapshot path.
pub fn remove_variants(path: &Path) -> Result<(), StoreError> {
    for p in variants(path) {
        match std::fs::remove_file(&p) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
    }
    Ok(())
}
