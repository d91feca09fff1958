//! Guarded MMR selector integration tests

mod common;

use codectx::chunk::{ChunkType, CodeChunk};
use codectx::config::{DiversityMetric, MmrSettings};
use codectx::{MmrSelector, SelectError, EMBEDDING_DIM};

/// A chunk of roughly `tokens` estimated tokens (content-length driven)
fn sized_chunk(file: &str, start: u32, tokens: usize, score: f32) -> CodeChunk {
    // estimator ≈ ⌈chars/3.5⌉ + 20; aim slightly under the target
    let chars = ((tokens.saturating_sub(25)) as f64 * 3.5) as usize;
    let word = format!("{}_{} ", file.replace(['/', '.'], "_"), start);
    let mut content = String::with_capacity(chars + word.len());
    while content.len() < chars {
        content.push_str(&word);
    }
    let mut chunk = CodeChunk::new(file, start, start + 20, ChunkType::Block, content);
    chunk.relevance_score = Some(score);
    chunk
}

fn one_hot_chunk(file: &str, axis: usize, score: f32) -> CodeChunk {
    let mut chunk = CodeChunk::new(file, 1, 10, ChunkType::Block, format!("content {axis}"));
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[axis] = 1.0;
    chunk.embedding = Some(v);
    chunk.relevance_score = Some(score);
    chunk
}

#[test]
fn test_critical_chunks_always_included_when_they_fit() {
    // S4: 50 candidates, 3 match the named file, ~1000 tokens each,
    // budget 10_000
    let settings = MmrSettings {
        max_token_budget: 10_000,
        ..Default::default()
    };
    let selector = MmrSelector::new(settings);

    let mut candidates = Vec::new();
    for i in 0..3 {
        candidates.push(sized_chunk(
            "payments/checkout.rs",
            i * 30 + 1,
            1000,
            0.3, // deliberately low-scored: criticality must carry them
        ));
    }
    for i in 0..47 {
        candidates.push(sized_chunk(
            &format!("other/module{i}.rs"),
            1,
            1000,
            0.9 - i as f32 * 0.01,
        ));
    }

    let package = selector
        .select(
            "explain the flow in payments/checkout.rs end to end",
            &candidates,
            None,
        )
        .unwrap();

    let critical_selected = package
        .selected_chunks
        .iter()
        .filter(|c| c.file_path == "payments/checkout.rs")
        .count();
    assert_eq!(critical_selected, 3, "all three critical chunks included");
    assert!(
        package.total_tokens <= 8_000,
        "stayed within the cushioned budget, got {}",
        package.total_tokens
    );
    assert_eq!(package.critical_set_coverage, 1.0);
}

#[test]
fn test_emergency_reduction_when_critical_overflows() {
    // S5: critical tokens ≈ 1.2 × budget
    let settings = MmrSettings {
        max_token_budget: 10_000,
        ..Default::default()
    };
    let selector = MmrSelector::new(settings);

    let candidates: Vec<CodeChunk> = (0..12)
        .map(|i| {
            sized_chunk(
                "core/engine.rs",
                i * 40 + 1,
                1000,
                1.0 - i as f32 * 0.05, // strictly decreasing scores
            )
        })
        .collect();

    let package = selector
        .select("walk through core/engine.rs carefully", &candidates, None)
        .unwrap();

    assert!(
        package.total_tokens <= 8_000,
        "emergency cap is 0.8·budget, got {}",
        package.total_tokens
    );
    assert_eq!(package.diversity_score, 0.0);
    assert_eq!(package.budget_utilization, 1.0);
    assert!(package.critical_set_coverage < 1.0);
    assert!(!package.selected_chunks.is_empty());

    // The kept prefix is the highest-scoring one
    let kept_scores: Vec<f32> = package
        .selected_chunks
        .iter()
        .map(|c| c.relevance_score.unwrap())
        .collect();
    let mut sorted = kept_scores.clone();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
    assert_eq!(kept_scores, sorted, "prefix ordered by descending score");
    let floor = kept_scores.last().copied().unwrap();
    let dropped_max = candidates
        .iter()
        .filter(|c| {
            !package
                .selected_chunks
                .iter()
                .any(|s| s.chunk_id == c.chunk_id)
        })
        .map(|c| c.relevance_score.unwrap())
        .fold(f32::NEG_INFINITY, f32::max);
    assert!(
        floor >= dropped_max,
        "every kept chunk outscores every dropped one"
    );
}

#[test]
fn test_budget_invariant_non_emergency() {
    // Invariant 6: selected tokens ≤ (1 − cushion)·budget when the
    // critical set fits
    let settings = MmrSettings {
        max_token_budget: 5_000,
        token_cushion_percent: 0.2,
        ..Default::default()
    };
    let selector = MmrSelector::new(settings);

    let candidates: Vec<CodeChunk> = (0..30)
        .map(|i| sized_chunk(&format!("mod{i}.rs"), 1, 400, 0.8 - i as f32 * 0.02))
        .collect();

    let package = selector
        .select("a question naming nothing specific", &candidates, None)
        .unwrap();
    assert!(package.total_tokens <= 4_000);
    assert!(!package.selected_chunks.is_empty());
}

#[test]
fn test_pure_diversity_picks_least_similar_second() {
    // Invariant 7: λ = 0 and identical relevance → the second pick
    // minimises similarity to the first
    let settings = MmrSettings {
        lambda_relevance: 0.0,
        diversity_metric: DiversityMetric::Cosine,
        ..Default::default()
    };
    let selector = MmrSelector::new(settings);

    let seed = one_hot_chunk("seed.rs", 0, 0.5);
    let twin = one_hot_chunk("twin.rs", 0, 0.5); // cosine 1.0 to seed
    let distant = one_hot_chunk("distant.rs", 7, 0.5); // cosine 0.0 to seed

    let package = selector
        .select(
            "plain question with no named artifacts",
            &[seed.clone(), twin.clone(), distant.clone()],
            Some(2),
        )
        .unwrap();

    assert_eq!(package.selected_chunks.len(), 2);
    assert_eq!(package.selected_chunks[0].chunk_id, seed.chunk_id);
    assert_eq!(
        package.selected_chunks[1].chunk_id, distant.chunk_id,
        "orthogonal chunk beats the duplicate"
    );
}

#[test]
fn test_validation_happens_before_selection() {
    let selector = MmrSelector::new(MmrSettings::default());
    let mut oversized = CodeChunk::new("big.rs", 1, 2, ChunkType::Block, "x");
    oversized.content = "y".repeat(60_000);
    oversized.relevance_score = Some(0.9);

    let result = selector.select("query", &[oversized], None);
    assert!(matches!(result, Err(SelectError::ChunkTooLarge { .. })));
}

#[test]
fn test_degrades_to_fewer_chunks_when_nothing_fits() {
    // Budget too small for any candidate: empty but valid package
    let settings = MmrSettings {
        max_token_budget: 100,
        ..Default::default()
    };
    let selector = MmrSelector::new(settings);
    let candidates = vec![sized_chunk("a.rs", 1, 500, 0.9), sized_chunk("b.rs", 1, 500, 0.8)];

    let package = selector
        .select("plain question with nothing named", &candidates, None)
        .unwrap();
    assert!(package.selected_chunks.is_empty());
    assert_eq!(package.total_tokens, 0);
}

#[test]
fn test_function_name_hint_marks_critical() {
    let settings = MmrSettings {
        max_token_budget: 10_000,
        ..Default::default()
    };
    let selector = MmrSelector::new(settings);

    let mut target = sized_chunk("somewhere/deep.rs", 1, 300, 0.1);
    target.function_name = Some("apply_delta".to_string());
    let mut rest: Vec<CodeChunk> = (0..10)
        .map(|i| sized_chunk(&format!("noise{i}.rs"), 1, 300, 0.9))
        .collect();
    rest.insert(0, target.clone());

    let package = selector
        .select("why does calling apply_delta() fail twice", &rest, None)
        .unwrap();
    assert!(
        package
            .selected_chunks
            .iter()
            .any(|c| c.chunk_id == target.chunk_id),
        "function-name critical chunk selected despite low score"
    );
}
