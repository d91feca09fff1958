//! Indexing orchestrator.
//!
//! Stitches scanner → chunker → pool → store. Mode selection is the
//! load-bearing contract: `Incremental` against an existing snapshot
//! applies a minimal delta with embeddings preserved for unchanged
//! chunks; `Full` embeds everything and upserts; `Reindex` clears
//! first. Index corruption on load downgrades to an automatic full
//! rebuild.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use thiserror::Error;

use crate::chunk::CodeChunk;
use crate::chunker::Chunker;
use crate::pool::{EmbeddingPool, PoolError};
use crate::store::{compare_chunks, Delta, FileChanges, FileEntry, StoreError, VectorStore};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("scan failed: {0}")]
    Scan(String),
}

/// Requested indexing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    Full,
    Incremental,
    /// Clear the snapshot, then full
    Reindex,
}

impl std::str::FromStr for IndexMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(IndexMode::Full),
            "incremental" => Ok(IndexMode::Incremental),
            "reindex" => Ok(IndexMode::Reindex),
            other => Err(format!("unknown index mode '{other}'")),
        }
    }
}

/// What one `index()` run did
#[derive(Debug, Clone)]
pub struct IndexReport {
    pub mode: IndexMode,
    pub files_scanned: usize,
    pub files_changed: usize,
    pub chunks_added: usize,
    pub chunks_updated: usize,
    pub chunks_removed: usize,
    pub degraded_chunks: usize,
    pub duration_ms: u64,
}

/// Progress callback: phase label, done, total
pub type ProgressFn = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

pub struct Indexer {
    root: PathBuf,
    store: Arc<VectorStore>,
    pool: EmbeddingPool,
    chunker: Arc<dyn Chunker>,
    progress: Option<ProgressFn>,
}

/// A scanned file with its content in memory
struct ScannedFile {
    entry: FileEntry,
    content: String,
}

impl Indexer {
    pub fn new(
        root: &Path,
        store: Arc<VectorStore>,
        pool: EmbeddingPool,
        chunker: Arc<dyn Chunker>,
    ) -> Self {
        Indexer {
            root: root.to_path_buf(),
            store,
            pool,
            chunker,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run one indexing pass in the requested mode.
    pub async fn index(&self, mode: IndexMode) -> Result<IndexReport, IndexError> {
        let start = Instant::now();
        let mut mode = mode;

        // Load the snapshot; corruption forces a rebuild instead of failing
        match self.store.initialize() {
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "Snapshot failed load invariants, forcing full rebuild");
                self.store.clear_index()?;
                mode = IndexMode::Full;
            }
            Err(e) => return Err(e.into()),
        }

        if mode == IndexMode::Reindex {
            self.store.clear_index()?;
        }

        let files = self.scan()?;
        self.report_progress("scan", files.len() as u64, files.len() as u64);

        let incremental = mode == IndexMode::Incremental
            && !self.store.is_empty();

        let report = if incremental {
            self.index_incremental(&files, start).await?
        } else {
            self.index_full(mode, &files, start).await?
        };

        tracing::info!(
            mode = ?report.mode,
            files = report.files_scanned,
            added = report.chunks_added,
            updated = report.chunks_updated,
            removed = report.chunks_removed,
            degraded = report.degraded_chunks,
            duration_ms = report.duration_ms,
            "Index pass complete"
        );
        Ok(report)
    }

    /// Full path: chunk every file, embed every chunk, upsert.
    async fn index_full(
        &self,
        mode: IndexMode,
        files: &[PathBuf],
        start: Instant,
    ) -> Result<IndexReport, IndexError> {
        let scanned = self.read_files(files)?;
        let chunks = self.chunk_files(&scanned);
        let total = chunks.len();
        self.report_progress("chunk", total as u64, total as u64);

        let embedded = self.pool.embed_batch(chunks).await?;
        let degraded = embedded.iter().filter(|c| c.degraded).count();
        self.report_progress("embed", total as u64, total as u64);

        self.store.upsert_chunks(&embedded)?;
        Ok(IndexReport {
            mode,
            files_scanned: files.len(),
            files_changed: files.len(),
            chunks_added: total,
            chunks_updated: 0,
            chunks_removed: 0,
            degraded_chunks: degraded,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Incremental path: file delta, per-file chunk comparison, embed
    /// only genuinely new chunks, apply one delta.
    async fn index_incremental(
        &self,
        files: &[PathBuf],
        start: Instant,
    ) -> Result<IndexReport, IndexError> {
        let entries = self.stat_files(files)?;
        let changes = self.store.calculate_file_delta(&entries);
        if changes.is_empty() {
            tracing::info!("No file changes, index is current");
            return Ok(IndexReport {
                mode: IndexMode::Incremental,
                files_scanned: files.len(),
                files_changed: 0,
                chunks_added: 0,
                chunks_updated: 0,
                chunks_removed: 0,
                degraded_chunks: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
        tracing::info!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "File delta computed"
        );

        let changed_paths: Vec<PathBuf> = changes.changed_paths().map(PathBuf::from).collect();
        let scanned = self.read_files(&changed_paths)?;

        let mut to_add: Vec<CodeChunk> = Vec::new();
        let mut updated: Vec<CodeChunk> = Vec::new();
        let mut removed: Vec<String> = Vec::new();

        for file in &scanned {
            let new_chunks =
                self.chunker
                    .chunk_file(&file.entry.path, &file.content, file.entry.mtime_ms);
            let old_chunks = self.store.chunks_for_file(&file.entry.path);
            let cmp = compare_chunks(&old_chunks, &new_chunks);
            to_add.extend(cmp.to_add);
            updated.extend(cmp.to_keep);
            removed.extend(cmp.to_remove);
        }
        for path in &changes.deleted {
            removed.extend(
                self.store
                    .chunks_for_file(path)
                    .into_iter()
                    .map(|c| c.chunk_id),
            );
        }

        let added_count = to_add.len();
        self.report_progress("chunk", added_count as u64, added_count as u64);
        let embedded = self.pool.embed_batch(to_add).await?;
        let degraded = embedded.iter().filter(|c| c.degraded).count();
        self.report_progress("embed", added_count as u64, added_count as u64);

        let delta = Delta {
            added: embedded,
            updated: updated.clone(),
            removed: removed.clone(),
            file_changes: changes.clone(),
        };
        self.store.apply_delta(&delta)?;

        Ok(IndexReport {
            mode: IndexMode::Incremental,
            files_scanned: files.len(),
            files_changed: count_changed(&changes),
            chunks_added: added_count,
            chunks_updated: updated.len(),
            chunks_removed: removed.len(),
            degraded_chunks: degraded,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn scan(&self) -> Result<Vec<PathBuf>, IndexError> {
        crate::enumerate_files(&self.root, crate::INDEXED_EXTENSIONS, false)
            .map_err(|e| IndexError::Scan(e.to_string()))
    }

    /// Read + stat the given relative paths concurrently.
    fn read_files(&self, paths: &[PathBuf]) -> Result<Vec<ScannedFile>, IndexError> {
        let root = self.root.clone();
        let mut scanned: Vec<ScannedFile> = paths
            .par_iter()
            .filter_map(|rel| {
                let abs = root.join(rel);
                let content = match std::fs::read_to_string(&abs) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(path = %abs.display(), error = %e, "Skipping unreadable file");
                        return None;
                    }
                };
                Some(ScannedFile {
                    entry: file_entry(rel, &abs, &content),
                    content,
                })
            })
            .collect();
        scanned.sort_by(|a, b| a.entry.path.cmp(&b.entry.path));
        Ok(scanned)
    }

    fn stat_files(&self, paths: &[PathBuf]) -> Result<Vec<FileEntry>, IndexError> {
        Ok(self.read_files(paths)?.into_iter().map(|f| f.entry).collect())
    }

    /// Chunk scanned files in parallel, keeping file order stable.
    fn chunk_files(&self, scanned: &[ScannedFile]) -> Vec<CodeChunk> {
        scanned
            .par_iter()
            .map(|file| {
                self.chunker
                    .chunk_file(&file.entry.path, &file.content, file.entry.mtime_ms)
            })
            .flatten()
            .collect()
    }

    fn report_progress(&self, phase: &str, done: u64, total: u64) {
        if let Some(progress) = &self.progress {
            progress(phase, done, total);
        }
    }
}

fn count_changed(changes: &FileChanges) -> usize {
    changes.added.len() + changes.modified.len() + changes.deleted.len()
}

fn file_entry(rel: &Path, abs: &Path, content: &str) -> FileEntry {
    let mtime_ms = std::fs::metadata(abs)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    FileEntry {
        path: rel.to_string_lossy().replace('\\', "/"),
        mtime_ms,
        file_hash: blake3::hash(content.as_bytes()).to_hex().to_string(),
    }
}
