//! Persistent vector store: in-memory snapshot views with atomic
//! on-disk persistence and top-K cosine search.
//!
//! Readers never block: every read clones an `Arc` to an immutable
//! snapshot view, and mutators publish a fresh view by pointer swap at
//! the end of `apply_delta`. Delta application is strictly serialised.

pub mod delta;
pub mod snapshot;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

use crate::chunk::CodeChunk;
use crate::config::StoreSettings;
use crate::math;

pub use delta::{compare_chunks, ChunkComparison, Delta, DeltaError, FileChanges, FileEntry};
pub use snapshot::{ModelInfo, Snapshot};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Invalid delta: {0}")]
    Delta(#[from] DeltaError),
    #[error("Invalid filter glob '{glob}': {message}")]
    BadFilter { glob: String, message: String },
    #[error("another delta is being applied to this store")]
    ConcurrentDelta,
    #[error(
        "Model mismatch: snapshot uses {found}, current is {expected}. A full rebuild is required."
    )]
    ModelMismatch { found: String, expected: String },
    #[error("Index corruption: {0}. A full rebuild is required.")]
    Corrupt(String),
}

impl StoreError {
    /// Fatal conditions force the orchestrator into a full rebuild.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupt(_) | StoreError::ModelMismatch { .. }
        )
    }
}

/// Where `initialize` found its data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Local,
    GlobalMirror,
    Empty,
}

/// Allow-list path filter for search. Globs support `*` and `**`.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub path_globs: Vec<String>,
}

impl SearchFilter {
    fn build(&self) -> Result<Option<GlobSet>, StoreError> {
        if self.path_globs.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.path_globs {
            let glob = Glob::new(pattern).map_err(|e| StoreError::BadFilter {
                glob: pattern.clone(),
                message: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| StoreError::BadFilter {
            glob: self.path_globs.join(","),
            message: e.to_string(),
        })?;
        Ok(Some(set))
    }
}

/// A search hit: chunk plus cosine similarity
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: CodeChunk,
    pub similarity: f32,
}

/// Store statistics for the CLI and telemetry
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total_chunks: usize,
    pub total_files: usize,
    pub degraded_chunks: usize,
    pub created_at: i64,
    pub model: ModelInfo,
}

/// Persistent vector store over one project snapshot.
pub struct VectorStore {
    snapshot_path: PathBuf,
    global_mirror: Option<PathBuf>,
    model: ModelInfo,
    /// Immutable published view; readers clone the Arc and go
    view: RwLock<Arc<Snapshot>>,
    /// Serialises apply_delta / upsert / clear
    write_lock: Mutex<()>,
}

impl VectorStore {
    /// Create a store handle. No IO happens until [`initialize`].
    pub fn open(settings: &StoreSettings, model: ModelInfo) -> Self {
        VectorStore {
            snapshot_path: settings.snapshot_path.clone(),
            global_mirror: settings.global_mirror.clone(),
            model: model.clone(),
            view: RwLock::new(Arc::new(Snapshot::empty(model))),
            write_lock: Mutex::new(()),
        }
    }

    /// Load the snapshot: local path first, then the global mirror,
    /// else start empty. When both exist the newer mtime wins.
    ///
    /// A parse failure starts empty (logged); a failed invariant check
    /// is fatal and forces a rebuild upstream.
    pub fn initialize(&self) -> Result<LoadOutcome, StoreError> {
        let local = snapshot::newest_variant(&self.snapshot_path);
        let mirror = self
            .global_mirror
            .as_deref()
            .and_then(snapshot::newest_variant);

        let (path, outcome) = match (local, mirror) {
            (Some((lp, lm)), Some((gp, gm))) => {
                if gm > lm {
                    (gp, LoadOutcome::GlobalMirror)
                } else {
                    (lp, LoadOutcome::Local)
                }
            }
            (Some((lp, _)), None) => (lp, LoadOutcome::Local),
            (None, Some((gp, _))) => (gp, LoadOutcome::GlobalMirror),
            (None, None) => {
                tracing::info!("No snapshot found, starting empty");
                return Ok(LoadOutcome::Empty);
            }
        };

        let snap = match snapshot::read_snapshot(&path) {
            Ok(s) => s,
            Err(StoreError::Io(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "Snapshot unreadable, starting empty");
                return Ok(LoadOutcome::Empty);
            }
            Err(e) => return Err(e),
        };
        snap.check_invariants(&self.model)?;

        tracing::info!(
            path = %path.display(),
            chunks = snap.chunks.len(),
            source = ?outcome,
            "Snapshot loaded"
        );
        *self.view.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(snap);
        Ok(outcome)
    }

    /// Immutable view of the current snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.view
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().chunks.is_empty()
    }

    /// True when an on-disk snapshot exists (either variant, either location)
    pub fn has_persisted_snapshot(&self) -> bool {
        snapshot::newest_variant(&self.snapshot_path).is_some()
            || self
                .global_mirror
                .as_deref()
                .and_then(snapshot::newest_variant)
                .is_some()
    }

    /// Classify the current file list against the snapshot's file index.
    pub fn calculate_file_delta(&self, current_files: &[FileEntry]) -> FileChanges {
        let snap = self.snapshot();
        let mut changes = FileChanges::default();
        let mut seen: HashSet<&str> = HashSet::new();

        for entry in current_files {
            seen.insert(entry.path.as_str());
            match snap.chunk_ids_for_file(&entry.path) {
                None => changes.added.push(entry.path.clone()),
                Some(ids) => {
                    // Every chunk of a file carries the same recorded pair;
                    // any representative works
                    let recorded = ids
                        .iter()
                        .next()
                        .and_then(|id| snap.chunks.get(id))
                        .map(|c| &c.source);
                    let modified = match recorded {
                        // Equal mtime is a fast accept; otherwise the
                        // content hash decides
                        Some(source) => {
                            source.file_mtime_ms != entry.mtime_ms
                                && source.file_hash != entry.file_hash
                        }
                        None => true,
                    };
                    if modified {
                        changes.modified.push(entry.path.clone());
                    }
                }
            }
        }
        for path in snap.file_index().keys() {
            if !seen.contains(path.as_str()) {
                changes.deleted.push(path.clone());
            }
        }

        changes.added.sort();
        changes.modified.sort();
        changes.deleted.sort();
        changes
    }

    /// Chunks currently stored for a file, in line order.
    pub fn chunks_for_file(&self, path: &str) -> Vec<CodeChunk> {
        let snap = self.snapshot();
        let mut chunks: Vec<CodeChunk> = snap
            .chunk_ids_for_file(path)
            .map(|ids| ids.iter().filter_map(|id| snap.chunks.get(id)).cloned().collect())
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.start_line);
        chunks
    }

    /// Apply a delta: validate, build the successor snapshot, publish it
    /// by pointer swap, then persist. A save failure is surfaced and the
    /// on-disk snapshot stays at the prior version.
    ///
    /// Strictly serialised: a delta arriving while another is being
    /// applied is rejected, not queued. Replaying a delta on the
    /// snapshot it produced is a no-op.
    pub fn apply_delta(&self, delta: &Delta) -> Result<(), StoreError> {
        delta.validate()?;
        let _guard = match self.write_lock.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::WouldBlock) => return Err(StoreError::ConcurrentDelta),
            Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
        };

        let current = self.snapshot();
        let mut next = (*current).clone();

        for id in &delta.removed {
            next.chunks.remove(id);
        }
        for chunk in &delta.updated {
            // Keep the prior embedding (cache preservation); refresh the
            // file-source metadata which may have moved under an
            // unchanged chunk
            match next.chunks.get_mut(&chunk.chunk_id) {
                Some(existing) => {
                    existing.source = chunk.source.clone();
                }
                None => {
                    return Err(StoreError::Delta(DeltaError::UpdatedMissing(
                        chunk.chunk_id.clone(),
                    )))
                }
            }
        }
        for chunk in &delta.added {
            chunk
                .validate()
                .map_err(|e| StoreError::Corrupt(format!("added chunk rejected: {e}")))?;
            next.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
        }
        next.created_at = chrono::Utc::now().timestamp_millis();
        next.rebuild_file_index();

        tracing::info!(
            added = delta.added.len(),
            updated = delta.updated.len(),
            removed = delta.removed.len(),
            total = next.chunks.len(),
            "Delta applied"
        );

        self.publish(next)
    }

    /// Bulk insert for full rebuilds.
    pub fn upsert_chunks(&self, chunks: &[CodeChunk]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.snapshot();
        let mut next = (*current).clone();
        for chunk in chunks {
            chunk
                .validate()
                .map_err(|e| StoreError::Corrupt(format!("upserted chunk rejected: {e}")))?;
            next.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
        }
        next.created_at = chrono::Utc::now().timestamp_millis();
        next.rebuild_file_index();
        self.publish(next)
    }

    /// Wipe the in-memory view and every on-disk variant.
    pub fn clear_index(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        *self.view.write().unwrap_or_else(|p| p.into_inner()) =
            Arc::new(Snapshot::empty(self.model.clone()));
        snapshot::remove_variants(&self.snapshot_path)?;
        if let Some(mirror) = &self.global_mirror {
            snapshot::remove_variants(mirror)?;
        }
        tracing::info!("Index cleared");
        Ok(())
    }

    /// Top-K cosine search over stored chunks.
    ///
    /// Degraded and embedding-less chunks never match. Ties break by
    /// lexicographic chunk id. Filters are an allow-list of path globs.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let glob_set = filter.build()?;
        let snap = self.snapshot();

        let mut scored: Vec<(&String, &CodeChunk, f32)> = snap
            .chunks
            .iter()
            .filter(|(_, c)| c.has_searchable_embedding())
            .filter(|(_, c)| {
                glob_set
                    .as_ref()
                    .map(|g| g.is_match(&c.file_path))
                    .unwrap_or(true)
            })
            .filter_map(|(id, c)| {
                let emb = c.embedding.as_ref()?;
                let score = math::cosine_similarity(query, emb)
                    .unwrap_or_else(|| math::full_cosine_similarity(query, emb));
                Some((id, c, score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(_, chunk, similarity)| {
                let mut chunk = chunk.clone();
                chunk.similarity_score = Some(similarity.clamp(0.0, 1.0));
                SearchResult { chunk, similarity }
            })
            .collect())
    }

    pub fn stats(&self) -> StoreStats {
        let snap = self.snapshot();
        StoreStats {
            total_chunks: snap.chunks.len(),
            total_files: snap.file_index().len(),
            degraded_chunks: snap.chunks.values().filter(|c| c.degraded).count(),
            created_at: snap.created_at,
            model: snap.model.clone(),
        }
    }

    /// Swap in the successor view, then persist it. Readers observe the
    /// new in-memory state during the save — identical to what lands on
    /// disk.
    fn publish(&self, next: Snapshot) -> Result<(), StoreError> {
        let next = Arc::new(next);
        *self.view.write().unwrap_or_else(|p| p.into_inner()) = next.clone();

        snapshot::write_snapshot(&next, &self.snapshot_path)?;
        if let Some(mirror) = &self.global_mirror {
            snapshot::mirror_snapshot(&self.snapshot_path, mirror);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkType, SourceMeta};
    use crate::EMBEDDING_DIM;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> VectorStore {
        let settings = StoreSettings {
            snapshot_path: dir.path().join("snapshot.json"),
            global_mirror: None,
        };
        VectorStore::open(&settings, ModelInfo::default())
    }

    fn embedded(file: &str, start: u32, content: &str, axis: usize) -> CodeChunk {
        let mut c = CodeChunk::new(file, start, start + 2, ChunkType::Block, content);
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[axis % EMBEDDING_DIM] = 1.0;
        c.embedding = Some(v);
        c
    }

    #[test]
    fn test_search_excludes_degraded_and_zero() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let good = embedded("a.rs", 1, "good", 0);
        let mut degraded = embedded("a.rs", 10, "degraded", 0);
        degraded.embedding = Some(vec![0.0; EMBEDDING_DIM]);
        degraded.degraded = true;
        let mut no_embedding = CodeChunk::new("a.rs", 20, 22, ChunkType::Block, "none");
        no_embedding.embedding = None;

        store
            .upsert_chunks(&[good.clone(), degraded, no_embedding])
            .unwrap();

        let query = good.embedding.clone().unwrap();
        let results = store.search(&query, 10, &SearchFilter::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.chunk_id, good.chunk_id);
    }

    #[test]
    fn test_search_tie_break_by_chunk_id() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let a = embedded("a.rs", 1, "aaa", 3);
        let b = embedded("b.rs", 1, "bbb", 3);
        store.upsert_chunks(&[a.clone(), b.clone()]).unwrap();

        let mut query = vec![0.0f32; EMBEDDING_DIM];
        query[3] = 1.0;
        let results = store.search(&query, 2, &SearchFilter::default()).unwrap();
        assert_eq!(results.len(), 2);
        let mut expected = [a.chunk_id.clone(), b.chunk_id.clone()];
        expected.sort();
        assert_eq!(results[0].chunk.chunk_id, expected[0]);
        assert_eq!(results[1].chunk.chunk_id, expected[1]);
    }

    #[test]
    fn test_search_glob_filter() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store
            .upsert_chunks(&[
                embedded("src/pool/worker.rs", 1, "w", 0),
                embedded("tests/pool_test.rs", 1, "t", 0),
            ])
            .unwrap();

        let mut query = vec![0.0f32; EMBEDDING_DIM];
        query[0] = 1.0;
        let filter = SearchFilter {
            path_globs: vec!["src/**/*.rs".to_string()],
        };
        let results = store.search(&query, 10, &filter).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.file_path, "src/pool/worker.rs");
    }

    #[test]
    fn test_bad_glob_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let filter = SearchFilter {
            path_globs: vec!["src/[".to_string()],
        };
        let err = store.search(&[0.0; EMBEDDING_DIM], 1, &filter).unwrap_err();
        assert!(matches!(err, StoreError::BadFilter { .. }));
    }

    #[test]
    fn test_apply_delta_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let keep = embedded("a.rs", 1, "keep", 0);
        let gone = embedded("a.rs", 10, "gone", 1);
        store.upsert_chunks(&[keep.clone(), gone.clone()]).unwrap();

        let added = embedded("a.rs", 20, "fresh", 2);
        let delta = Delta {
            added: vec![added.clone()],
            updated: vec![keep.clone()],
            removed: vec![gone.chunk_id.clone()],
            file_changes: FileChanges::default(),
        };

        store.apply_delta(&delta).unwrap();
        let after_first = store.snapshot();
        store.apply_delta(&delta).unwrap();
        let after_second = store.snapshot();

        assert_eq!(after_first.chunks, after_second.chunks);
        assert!(!after_second.chunks.contains_key(&gone.chunk_id));
        assert!(after_second.chunks.contains_key(&added.chunk_id));
        assert!(after_second.chunks.contains_key(&keep.chunk_id));
    }

    #[test]
    fn test_apply_delta_keeps_prior_embedding_for_updated() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let original = embedded("a.rs", 1, "stable", 5);
        store.upsert_chunks(&[original.clone()]).unwrap();

        // Same chunk arrives from a re-chunk with a different (bogus)
        // embedding and fresher file metadata
        let mut rechunked = original.clone();
        rechunked.embedding = Some(vec![0.25; EMBEDDING_DIM]);
        rechunked.source = SourceMeta {
            file_hash: "newhash".into(),
            file_mtime_ms: 999,
        };

        let delta = Delta {
            added: vec![],
            updated: vec![rechunked],
            removed: vec![],
            file_changes: FileChanges::default(),
        };
        store.apply_delta(&delta).unwrap();

        let snap = store.snapshot();
        let stored = &snap.chunks[&original.chunk_id];
        assert_eq!(
            stored.embedding, original.embedding,
            "prior embedding preserved byte-for-byte"
        );
        assert_eq!(stored.source.file_mtime_ms, 999, "source meta refreshed");
    }

    #[test]
    fn test_apply_delta_updated_missing_rejected() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let phantom = embedded("a.rs", 1, "never inserted", 0);
        let delta = Delta {
            added: vec![],
            updated: vec![phantom],
            removed: vec![],
            file_changes: FileChanges::default(),
        };
        assert!(matches!(
            store.apply_delta(&delta),
            Err(StoreError::Delta(DeltaError::UpdatedMissing(_)))
        ));
    }

    #[test]
    fn test_file_index_consistent_after_mutations() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let a = embedded("a.rs", 1, "a", 0);
        let b = embedded("b.rs", 1, "b", 1);
        store.upsert_chunks(&[a.clone(), b.clone()]).unwrap();

        let delta = Delta {
            added: vec![],
            updated: vec![],
            removed: vec![b.chunk_id.clone()],
            file_changes: FileChanges::default(),
        };
        store.apply_delta(&delta).unwrap();

        let snap = store.snapshot();
        assert!(snap.chunk_ids_for_file("b.rs").is_none());
        for (path, ids) in snap.file_index() {
            for id in ids {
                assert_eq!(&snap.chunks[id].file_path, path);
            }
        }
    }

    #[test]
    fn test_calculate_file_delta_classification() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let mut stored = embedded("kept.rs", 1, "kept", 0);
        stored.source = SourceMeta {
            file_hash: "hash-kept".into(),
            file_mtime_ms: 100,
        };
        let mut changed = embedded("changed.rs", 1, "changed", 1);
        changed.source = SourceMeta {
            file_hash: "hash-old".into(),
            file_mtime_ms: 100,
        };
        let mut doomed = embedded("doomed.rs", 1, "doomed", 2);
        doomed.source = SourceMeta {
            file_hash: "hash-doomed".into(),
            file_mtime_ms: 100,
        };
        store
            .upsert_chunks(&[stored, changed, doomed])
            .unwrap();

        let current = vec![
            FileEntry {
                path: "kept.rs".into(),
                mtime_ms: 100,
                file_hash: "hash-kept".into(),
            },
            FileEntry {
                path: "changed.rs".into(),
                mtime_ms: 200,
                file_hash: "hash-new".into(),
            },
            FileEntry {
                path: "brand-new.rs".into(),
                mtime_ms: 300,
                file_hash: "hash-brand-new".into(),
            },
        ];

        let changes = store.calculate_file_delta(&current);
        assert_eq!(changes.added, vec!["brand-new.rs".to_string()]);
        assert_eq!(changes.modified, vec!["changed.rs".to_string()]);
        assert_eq!(changes.deleted, vec!["doomed.rs".to_string()]);
    }

    #[test]
    fn test_mtime_touch_without_content_change_is_not_modified() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let mut stored = embedded("touched.rs", 1, "same", 0);
        stored.source = SourceMeta {
            file_hash: "same-hash".into(),
            file_mtime_ms: 100,
        };
        store.upsert_chunks(&[stored]).unwrap();

        let current = vec![FileEntry {
            path: "touched.rs".into(),
            mtime_ms: 500,
            file_hash: "same-hash".into(),
        }];
        let changes = store.calculate_file_delta(&current);
        assert!(changes.modified.is_empty(), "hash unchanged → not modified");
    }

    #[test]
    fn test_initialize_absent_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        assert_eq!(store.initialize().unwrap(), LoadOutcome::Empty);
        assert!(store.is_empty());
    }

    #[test]
    fn test_initialize_prefers_newer_mirror() {
        let dir = TempDir::new().unwrap();
        let local_path = dir.path().join("snapshot.json");
        let mirror_path = dir.path().join("mirror").join("snapshot.json");

        // Older local with one chunk
        let settings = StoreSettings {
            snapshot_path: local_path.clone(),
            global_mirror: None,
        };
        let store = VectorStore::open(&settings, ModelInfo::default());
        store.upsert_chunks(&[embedded("a.rs", 1, "local", 0)]).unwrap();

        // Newer mirror with two chunks
        std::fs::create_dir_all(mirror_path.parent().unwrap()).unwrap();
        let mirror_settings = StoreSettings {
            snapshot_path: mirror_path.clone(),
            global_mirror: None,
        };
        let mirror_store = VectorStore::open(&mirror_settings, ModelInfo::default());
        mirror_store
            .upsert_chunks(&[
                embedded("a.rs", 1, "local", 0),
                embedded("b.rs", 1, "mirror", 1),
            ])
            .unwrap();
        // Ensure the mirror mtime is strictly newer
        filetime_touch(&mirror_path);

        let combined = StoreSettings {
            snapshot_path: local_path,
            global_mirror: Some(mirror_path),
        };
        let fresh = VectorStore::open(&combined, ModelInfo::default());
        let outcome = fresh.initialize().unwrap();
        assert_eq!(outcome, LoadOutcome::GlobalMirror);
        assert_eq!(fresh.snapshot().chunks.len(), 2);
    }

    fn filetime_touch(path: &std::path::Path) {
        // Bump mtime far into the future of the local file's stamp
        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(existing_variant(path))
            .unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        file.set_modified(later).unwrap();
    }

    fn existing_variant(path: &std::path::Path) -> std::path::PathBuf {
        snapshot::newest_variant(path).unwrap().0
    }

    #[test]
    fn test_snapshot_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let chunks = vec![embedded("a.rs", 1, "persisted", 0)];
        store.upsert_chunks(&chunks).unwrap();

        let reopened = test_store(&dir);
        assert_eq!(reopened.initialize().unwrap(), LoadOutcome::Local);
        assert_eq!(
            reopened.snapshot().chunks,
            store.snapshot().chunks,
            "load(save(s)) == s structurally"
        );
    }

    #[test]
    fn test_clear_index_wipes_memory_and_disk() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.upsert_chunks(&[embedded("a.rs", 1, "x", 0)]).unwrap();
        assert!(store.has_persisted_snapshot());

        store.clear_index().unwrap();
        assert!(store.is_empty());
        assert!(!store.has_persisted_snapshot());
    }
}
