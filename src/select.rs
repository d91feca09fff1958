//! Guarded MMR context selection.
//!
//! Takes scored candidate chunks, a query, and a token budget; returns
//! a context package that always fits the budget, includes every
//! critical chunk that can fit inside the reserved fraction, and fills
//! the remainder by maximal marginal relevance. Validation failures
//! happen before any selection work; after that the selector never
//! fails, it returns fewer chunks.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use crate::chunk::{CodeChunk, MAX_CHUNK_CONTENT_LEN};
use crate::config::{DiversityMetric, MmrSettings};
use crate::critical::{extract_critical_set, CriticalSet};
use crate::math::{full_cosine_similarity, word_jaccard};

/// Input caps checked before selection starts
const MAX_CANDIDATES: usize = 10_000;
const MAX_QUERY_LEN: usize = 10_000;
/// Candidates sampled for the content-size check
const VALIDATION_SAMPLE: usize = 100;
/// Emergency reduction fills up to this fraction of the absolute budget
const EMERGENCY_FRACTION: f64 = 0.8;

#[derive(Error, Debug)]
pub enum SelectError {
    #[error("too many candidates: {count} (max {MAX_CANDIDATES})")]
    TooManyCandidates { count: usize },
    #[error("query too long: {len} chars (max {MAX_QUERY_LEN})")]
    QueryTooLong { len: usize },
    #[error("candidate {chunk_id} exceeds the content cap ({len} chars)")]
    ChunkTooLarge { chunk_id: String, len: usize },
}

/// Selector output
#[derive(Debug, Clone, Serialize)]
pub struct ContextPackage {
    pub selected_chunks: Vec<CodeChunk>,
    pub total_tokens: usize,
    /// |critical included| / max(1, |critical candidates|)
    pub critical_set_coverage: f32,
    /// 1 − mean pairwise similarity over the selection
    pub diversity_score: f32,
    /// total_tokens / max_token_budget; pinned to 1.0 under emergency
    /// reduction
    pub budget_utilization: f32,
    pub selection_time_ms: u64,
}

/// Conservative per-chunk token estimator with a per-id cache.
///
/// `⌈len/3.5⌉ + 0.1·lines + 10·fenced_blocks + 2·function_boundaries + 20`
/// — fenced blocks are paired ``` delimiters, function boundaries are
/// lines opening with a function keyword. Deliberately high; the budget
/// cushion absorbs the remaining underestimates.
pub struct TokenEstimator {
    cache: Mutex<HashMap<String, usize>>,
}

impl TokenEstimator {
    pub fn new() -> Self {
        TokenEstimator {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn estimate(&self, chunk: &CodeChunk) -> usize {
        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&chunk.chunk_id)
        {
            return *cached;
        }
        let tokens = estimate_tokens(&chunk.content);
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(chunk.chunk_id.clone(), tokens);
        tokens
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn estimate_tokens(content: &str) -> usize {
    let chars = content.chars().count() as f64;
    let lines = content.lines().count() as f64;
    let fences = content.matches("```").count() / 2;
    let boundaries = content
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            t.starts_with("fn ")
                || t.starts_with("pub fn ")
                || t.starts_with("def ")
                || t.starts_with("func ")
                || t.starts_with("function ")
        })
        .count();

    ((chars / 3.5).ceil() + 0.1 * lines + 10.0 * fences as f64 + 2.0 * boundaries as f64 + 20.0)
        .ceil() as usize
}

/// Guarded MMR selector
pub struct MmrSelector {
    config: MmrSettings,
    estimator: TokenEstimator,
}

impl MmrSelector {
    pub fn new(config: MmrSettings) -> Self {
        MmrSelector {
            config,
            estimator: TokenEstimator::new(),
        }
    }

    /// Assemble a context package for `query` from scored candidates.
    pub fn select(
        &self,
        query: &str,
        candidates: &[CodeChunk],
        max_chunks: Option<usize>,
    ) -> Result<ContextPackage, SelectError> {
        self.validate(query, candidates)?;
        let start = Instant::now();

        let critical_set = extract_critical_set(query);
        let (mut critical, non_critical) = partition_critical(candidates, &critical_set);
        critical.sort_by(|a, b| {
            score_of(b)
                .partial_cmp(&score_of(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let budget = self.config.max_token_budget;
        let effective_budget =
            ((1.0 - self.config.token_cushion_percent as f64) * budget as f64).floor() as usize;
        let critical_tokens: usize = critical.iter().map(|c| self.estimator.estimate(c)).sum();

        if !critical.is_empty() && critical_tokens >= effective_budget {
            return Ok(self.emergency_reduction(critical, start));
        }

        // Normal path: all critical chunks fit inside the reserved floor
        let mut selected: Vec<CodeChunk> = critical.clone();
        let mut total_tokens = critical_tokens;
        let mut available = effective_budget - critical_tokens;

        let mut remaining: Vec<&CodeChunk> = non_critical.iter().copied().collect();
        remaining.sort_by(|a, b| {
            score_of(b)
                .partial_cmp(&score_of(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let lambda = self.config.lambda_relevance;
        while !remaining.is_empty() {
            if let Some(cap) = max_chunks {
                if selected.len() >= cap {
                    break;
                }
            }

            let mut best: Option<(usize, f32, usize)> = None; // (idx, mmr, cost)
            for (idx, candidate) in remaining.iter().enumerate() {
                let cost = self.estimator.estimate(candidate);
                if cost > available {
                    continue;
                }
                let diversity = if selected.is_empty() {
                    1.0
                } else {
                    let min_sim = selected
                        .iter()
                        .map(|s| self.similarity(candidate, s))
                        .fold(f32::INFINITY, f32::min);
                    1.0 - min_sim.clamp(0.0, 1.0)
                };
                let mmr = lambda * score_of(candidate) + (1.0 - lambda) * diversity;
                let better = match best {
                    None => true,
                    Some((_, best_mmr, _)) => mmr > best_mmr,
                };
                if better {
                    best = Some((idx, mmr, cost));
                }
            }

            match best {
                Some((idx, _, cost)) => {
                    let picked = remaining.remove(idx);
                    selected.push(picked.clone());
                    total_tokens += cost;
                    available -= cost;
                }
                None => break, // nothing fits
            }
        }

        // |critical included| / max(1, |critical|); 0.0 when the query
        // matched no candidates at all
        let critical_count = critical.len();
        let critical_included = critical
            .iter()
            .filter(|c| selected.iter().any(|s| s.chunk_id == c.chunk_id))
            .count();
        let coverage = critical_included as f32 / critical_count.max(1) as f32;
        let diversity_score = self.mean_pairwise_diversity(&selected);

        Ok(ContextPackage {
            total_tokens,
            critical_set_coverage: coverage,
            diversity_score,
            budget_utilization: total_tokens as f32 / budget as f32,
            selection_time_ms: start.elapsed().as_millis() as u64,
            selected_chunks: selected,
        })
    }

    /// The critical set alone overflows the working budget: keep the
    /// highest-scoring prefix that fits in 80% of the absolute budget.
    fn emergency_reduction(&self, critical: Vec<CodeChunk>, start: Instant) -> ContextPackage {
        let cap = (self.config.max_token_budget as f64 * EMERGENCY_FRACTION) as usize;
        let total_critical = critical.len();

        let mut selected = Vec::new();
        let mut total_tokens = 0usize;
        for chunk in critical {
            let cost = self.estimator.estimate(&chunk);
            if total_tokens + cost > cap {
                break;
            }
            total_tokens += cost;
            selected.push(chunk);
        }

        tracing::warn!(
            kept = selected.len(),
            dropped = total_critical - selected.len(),
            tokens = total_tokens,
            "Critical set exceeded budget, emergency reduction applied"
        );

        ContextPackage {
            critical_set_coverage: selected.len() as f32 / total_critical.max(1) as f32,
            diversity_score: 0.0,
            budget_utilization: 1.0,
            total_tokens,
            selection_time_ms: start.elapsed().as_millis() as u64,
            selected_chunks: selected,
        }
    }

    fn validate(&self, query: &str, candidates: &[CodeChunk]) -> Result<(), SelectError> {
        if candidates.len() > MAX_CANDIDATES {
            return Err(SelectError::TooManyCandidates {
                count: candidates.len(),
            });
        }
        let query_len = query.chars().count();
        if query_len > MAX_QUERY_LEN {
            return Err(SelectError::QueryTooLong { len: query_len });
        }
        for chunk in candidates.iter().take(VALIDATION_SAMPLE) {
            let len = chunk.content.chars().count();
            if len > MAX_CHUNK_CONTENT_LEN {
                return Err(SelectError::ChunkTooLarge {
                    chunk_id: chunk.chunk_id.clone(),
                    len,
                });
            }
        }
        Ok(())
    }

    /// Similarity under the configured metric.
    fn similarity(&self, a: &CodeChunk, b: &CodeChunk) -> f32 {
        match self.config.diversity_metric {
            DiversityMetric::Cosine => cosine_of(a, b),
            DiversityMetric::Jaccard => jaccard_of(a, b),
            DiversityMetric::Semantic => 0.7 * cosine_of(a, b) + 0.3 * jaccard_of(a, b),
        }
    }

    /// 1 − mean pairwise similarity; 1.0 for singleton selections,
    /// 0.0 for empty ones.
    fn mean_pairwise_diversity(&self, selected: &[CodeChunk]) -> f32 {
        if selected.is_empty() {
            return 0.0;
        }
        if selected.len() == 1 {
            return 1.0;
        }
        let mut total = 0.0f32;
        let mut pairs = 0usize;
        for i in 0..selected.len() {
            for j in (i + 1)..selected.len() {
                total += self.similarity(&selected[i], &selected[j]);
                pairs += 1;
            }
        }
        (1.0 - total / pairs as f32).clamp(0.0, 1.0)
    }
}

fn cosine_of(a: &CodeChunk, b: &CodeChunk) -> f32 {
    match (&a.embedding, &b.embedding) {
        (Some(va), Some(vb)) => full_cosine_similarity(va, vb).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

fn jaccard_of(a: &CodeChunk, b: &CodeChunk) -> f32 {
    if a.file_path.eq_ignore_ascii_case(&b.file_path) {
        0.8
    } else if a.chunk_type == b.chunk_type {
        0.6
    } else {
        word_jaccard(&a.content, &b.content)
    }
}

fn score_of(chunk: &CodeChunk) -> f32 {
    chunk
        .relevance_score
        .or(chunk.similarity_score)
        .unwrap_or(0.0)
}

/// Partition candidates into critical and non-critical by the matching
/// rules: case-insensitive substring containment, both directions, with
/// a minimum-length gate of 3 characters (shorter hints match exactly).
fn partition_critical<'a>(
    candidates: &'a [CodeChunk],
    critical_set: &CriticalSet,
) -> (Vec<CodeChunk>, Vec<&'a CodeChunk>) {
    if critical_set.is_empty() {
        return (Vec::new(), candidates.iter().collect());
    }
    let mut critical = Vec::new();
    let mut rest = Vec::new();
    for chunk in candidates {
        if is_critical(chunk, critical_set) {
            critical.push(chunk.clone());
        } else {
            rest.push(chunk);
        }
    }
    (critical, rest)
}

fn is_critical(chunk: &CodeChunk, set: &CriticalSet) -> bool {
    if set
        .file_paths
        .iter()
        .any(|path| touches(&chunk.file_path, path))
    {
        return true;
    }
    let names = chunk
        .function_name
        .iter()
        .chain(chunk.symbol_name.iter());
    for name in names {
        if set
            .function_names
            .iter()
            .chain(set.symbol_names.iter())
            .any(|hint| touches(name, hint))
        {
            return true;
        }
    }
    false
}

/// Two-way case-insensitive substring containment. Below 3 characters
/// only exact (case-insensitive) equality matches, which keeps short
/// names from matching half the corpus.
fn touches(a: &str, b: &str) -> bool {
    let la = a.to_lowercase();
    let lb = b.to_lowercase();
    if la.is_empty() || lb.is_empty() {
        return false;
    }
    if la.len() < 3 || lb.len() < 3 {
        return la == lb;
    }
    la.contains(&lb) || lb.contains(&la)
}
