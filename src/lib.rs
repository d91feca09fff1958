//! # codectx - Code Context Intelligence
//!
//! Indexes a source repository into a semantic vector snapshot and
//! assembles token-budgeted code context for LLM consumption.
//!
//! ## Features
//!
//! - **Adaptive embedding pool**: child worker processes over ndjson
//!   stdio, sized against live memory/CPU pressure, with an adaptive
//!   batch controller and a shared content-hash cache
//! - **Delta-friendly vector store**: one JSON snapshot (optionally
//!   zstd-compressed), atomic rename persistence, incremental deltas
//!   that preserve embeddings for unchanged chunks
//! - **Guarded MMR selection**: token-budgeted context packages that
//!   always include the query's critical chunks when they fit
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use codectx::{
//!     BlockChunker, EmbeddingPool, Indexer, IndexMode, MmrSelector, ModelInfo,
//!     QueryEngine, QueryRequest, Settings, VectorStore,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let root = std::path::Path::new(".");
//! let settings = Settings::load(root)?;
//!
//! let store = Arc::new(VectorStore::open(&settings.store, ModelInfo::default()));
//! let pool = EmbeddingPool::new(settings.pool.clone(), settings.cache.clone()).await?;
//!
//! let indexer = Indexer::new(root, store.clone(), pool.clone(), Arc::new(BlockChunker::default()));
//! indexer.index(IndexMode::Incremental).await?;
//!
//! let engine = QueryEngine::new(pool, store, MmrSelector::new(settings.mmr.clone()));
//! let response = engine.answer(&QueryRequest::new("how is the snapshot persisted?")).await?;
//! println!("{} chunks, {} tokens", response.package.selected_chunks.len(), response.package.total_tokens);
//! # Ok(())
//! # }
//! ```
//!
// Public library API modules
pub mod chunk;
pub mod chunker;
pub mod config;
pub mod critical;
pub mod graph;
pub mod indexer;
pub mod math;
pub mod pool;
pub mod query;
pub mod runtime;
pub mod select;
pub mod store;

pub use chunk::{ChunkType, CodeChunk};
pub use chunker::{BlockChunker, Chunker};
pub use config::{ConfigError, DiversityMetric, MmrSettings, Settings};
pub use critical::{extract_critical_set, CriticalSet};
pub use indexer::{IndexError, IndexMode, IndexReport, Indexer};
pub use pool::{EmbeddingPool, PoolError, PoolStats};
pub use query::{QueryEngine, QueryError, QueryRequest, QueryResponse};
pub use runtime::{serve_worker, HashRuntime, WorkerRuntime};
pub use select::{ContextPackage, MmrSelector, SelectError};
pub use store::{
    Delta, FileChanges, FileEntry, LoadOutcome, ModelInfo, SearchFilter, StoreError, VectorStore,
};

use std::path::{Path, PathBuf};

/// Embedding dimension for the reference model.
/// Single source of truth — all modules import this constant.
pub const EMBEDDING_DIM: usize = 384;

/// Name of the per-project index directory (created on first index).
pub const INDEX_DIR: &str = ".codectx";

/// File extensions the indexer picks up by default
pub const INDEXED_EXTENSIONS: &[&str] = &[
    "rs", "go", "cpp", "c", "h", "ts", "tsx", "js", "jsx", "py", "java", "md",
];

/// Maximum file size to index (1MB)
const MAX_FILE_SIZE: u64 = 1_048_576;

/// Resolve the index directory for a project root.
pub fn index_dir(project_root: &Path) -> PathBuf {
    project_root.join(INDEX_DIR)
}

/// Enumerate files to index in a project directory.
///
/// Respects .gitignore, skips hidden files and large files (>1MB).
/// Returns relative paths from the project root.
pub fn enumerate_files(
    root: &Path,
    extensions: &[&str],
    no_ignore: bool,
) -> anyhow::Result<Vec<PathBuf>> {
    use anyhow::Context;
    use ignore::WalkBuilder;

    let root = dunce::canonicalize(root).context("Failed to canonicalize root")?;

    let walker = WalkBuilder::new(&root)
        .git_ignore(!no_ignore)
        .git_global(!no_ignore)
        .git_exclude(!no_ignore)
        .ignore(!no_ignore)
        .hidden(!no_ignore)
        .follow_links(false)
        .build();

    let files: Vec<PathBuf> = walker
        .filter_map(|e| {
            e.map_err(|err| {
                tracing::debug!(error = %err, "Failed to read directory entry during walk");
            })
            .ok()
        })
        .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .filter(|e| {
            e.metadata()
                .map(|m| m.len() <= MAX_FILE_SIZE)
                .unwrap_or(false)
        })
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.contains(&ext))
                .unwrap_or(false)
        })
        .filter_map(|e| {
            let path = match dunce::canonicalize(e.path()) {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(
                        path = %e.path().display(),
                        error = %err,
                        "Failed to canonicalize path, skipping"
                    );
                    return None;
                }
            };
            if path.starts_with(&root) {
                Some(path.strip_prefix(&root).unwrap_or(&path).to_path_buf())
            } else {
                tracing::warn!("Skipping path outside project: {}", e.path().display());
                None
            }
        })
        .collect();

    tracing::info!(file_count = files.len(), "File enumeration complete");

    Ok(files)
}
