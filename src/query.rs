//! Query pipeline: embed the question, search the store, honour the
//! critical set, select under the token budget.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::critical::extract_critical_set;
use crate::graph::SymbolGraph;
use crate::pool::{EmbeddingPool, PoolError};
use crate::select::{ContextPackage, MmrSelector, SelectError};
use crate::store::{SearchFilter, StoreError, VectorStore};

/// Default candidate pool handed to the selector
pub const DEFAULT_TOP_K: usize = 50;
/// One-hop graph expansion cap per seed chunk
const EXPANSION_CAP: usize = 5;
/// Score decay for graph-expanded candidates
const EXPANSION_DECAY: f32 = 0.8;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Select(#[from] SelectError),
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub top_k: usize,
    pub max_chunks: Option<usize>,
    /// Allow-list path globs applied at search time
    pub path_globs: Vec<String>,
    /// Pull in chunks one relation hop from the seeds before selection
    pub expand_related: bool,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        QueryRequest {
            query: query.into(),
            top_k: DEFAULT_TOP_K,
            max_chunks: None,
            path_globs: Vec::new(),
            expand_related: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub package: ContextPackage,
    /// Advisory extractor confidence, for telemetry
    pub critical_confidence: f32,
    pub search_hits: usize,
}

/// Read-side engine over one store + pool.
pub struct QueryEngine {
    pool: EmbeddingPool,
    store: Arc<VectorStore>,
    selector: MmrSelector,
}

impl QueryEngine {
    pub fn new(pool: EmbeddingPool, store: Arc<VectorStore>, selector: MmrSelector) -> Self {
        QueryEngine {
            pool,
            store,
            selector,
        }
    }

    pub async fn answer(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let query_vector = self.pool.embed_one(&request.query).await?;
        let filter = SearchFilter {
            path_globs: request.path_globs.clone(),
        };
        let hits = self.store.search(&query_vector, request.top_k, &filter)?;
        let search_hits = hits.len();

        let mut candidates: Vec<crate::chunk::CodeChunk> = hits
            .into_iter()
            .map(|hit| {
                let mut chunk = hit.chunk;
                chunk.relevance_score = Some(hit.similarity.clamp(0.0, 1.0));
                chunk
            })
            .collect();

        if request.expand_related {
            self.expand_candidates(&mut candidates);
        }

        let package = self
            .selector
            .select(&request.query, &candidates, request.max_chunks)?;
        let critical_confidence = extract_critical_set(&request.query).confidence;

        tracing::info!(
            hits = search_hits,
            candidates = candidates.len(),
            selected = package.selected_chunks.len(),
            tokens = package.total_tokens,
            "Query answered"
        );
        Ok(QueryResponse {
            package,
            critical_confidence,
            search_hits,
        })
    }

    /// One hop along the symbol graph from the current seeds, with
    /// decayed scores, deduplicated against what search already found.
    fn expand_candidates(&self, candidates: &mut Vec<crate::chunk::CodeChunk>) {
        let snapshot = self.store.snapshot();
        let graph = SymbolGraph::build(snapshot.chunks.values());
        if graph.is_empty() {
            return;
        }

        let seen: std::collections::HashSet<String> =
            candidates.iter().map(|c| c.chunk_id.clone()).collect();
        let mut expansions = Vec::new();
        for seed in candidates.iter() {
            let seed_score = seed.relevance_score.unwrap_or(0.5);
            for id in graph.neighbors(seed, EXPANSION_CAP) {
                if seen.contains(&id) || expansions.iter().any(|(eid, _)| *eid == id) {
                    continue;
                }
                expansions.push((id, seed_score * EXPANSION_DECAY));
            }
        }
        for (id, score) in expansions {
            if let Some(chunk) = snapshot.chunks.get(&id) {
                let mut chunk = chunk.clone();
                chunk.relevance_score = Some(score);
                candidates.push(chunk);
            }
        }
    }
}
