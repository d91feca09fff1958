//! Chunk data model with content-addressed identity

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::EMBEDDING_DIM;

/// Maximum chunk content size in characters.
/// Chunkers must split anything larger; the store rejects violations.
pub const MAX_CHUNK_CONTENT_LEN: usize = 50_000;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("start_line {start} > end_line {end} in {file}")]
    LineOrder { file: String, start: u32, end: u32 },
    #[error("chunk content exceeds {MAX_CHUNK_CONTENT_LEN} chars ({len}) in {file}")]
    ContentTooLarge { file: String, len: usize },
    #[error("embedding has {got} dimensions, expected {expected}")]
    BadDimension { got: usize, expected: usize },
    #[error("embedding contains non-finite component at index {index}")]
    NonFinite { index: usize },
}

/// Kind of code element a chunk covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Function,
    Class,
    Block,
    Section,
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChunkType::Function => "function",
            ChunkType::Class => "class",
            ChunkType::Block => "block",
            ChunkType::Section => "section",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ChunkType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(ChunkType::Function),
            "class" => Ok(ChunkType::Class),
            "block" => Ok(ChunkType::Block),
            "section" => Ok(ChunkType::Section),
            other => Err(format!("unknown chunk type '{other}'")),
        }
    }
}

/// Language tag attached by the chunker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageMetadata {
    pub language: String,
}

/// Import/export identifiers observed in the chunk, in source order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationships {
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub exports: Vec<String>,
}

/// Whole-file identity recorded at chunking time.
///
/// `calculate_file_delta` classifies files as added/modified/deleted by
/// comparing the current file against these recorded values, so every
/// chunk of the same file carries the same pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMeta {
    /// blake3 hex of the full file content
    pub file_hash: String,
    /// File mtime in Unix milliseconds
    pub file_mtime_ms: i64,
}

/// Content-addressable unit of code context.
///
/// `chunk_id` is a pure function of `(file_path, start_line, end_line,
/// content)` — two chunks with the same id are byte-identical. The
/// embedding slot is empty until the pool fills it, exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChunk {
    pub chunk_id: String,
    /// Path relative to the project root, forward slashes
    pub file_path: String,
    /// 1-indexed, inclusive
    pub start_line: u32,
    pub end_line: u32,
    pub chunk_type: ChunkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub language_metadata: LanguageMetadata,
    #[serde(default)]
    pub relationships: Relationships,
    /// Dense vector, present after embedding. Exactly `EMBEDDING_DIM`
    /// finite components when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
    /// Unix ms of the last successful embedding (0 = never embedded)
    #[serde(default)]
    pub indexed_at: i64,
    /// Zero-vector placeholder after exhausted retries; excluded from search
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub source: SourceMeta,
}

impl CodeChunk {
    /// Construct a chunk without an embedding, deriving its id.
    pub fn new(
        file_path: impl Into<String>,
        start_line: u32,
        end_line: u32,
        chunk_type: ChunkType,
        content: impl Into<String>,
    ) -> Self {
        let file_path = file_path.into();
        let content = content.into();
        let chunk_id = compute_chunk_id(&file_path, start_line, end_line, &content);
        CodeChunk {
            chunk_id,
            file_path,
            start_line,
            end_line,
            chunk_type,
            symbol_name: None,
            function_name: None,
            content,
            language_metadata: LanguageMetadata::default(),
            relationships: Relationships::default(),
            embedding: None,
            relevance_score: None,
            similarity_score: None,
            indexed_at: 0,
            degraded: false,
            source: SourceMeta::default(),
        }
    }

    /// Check the structural invariants: line order, content cap, and
    /// embedding dimension/finiteness when an embedding is present.
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.start_line > self.end_line {
            return Err(ChunkError::LineOrder {
                file: self.file_path.clone(),
                start: self.start_line,
                end: self.end_line,
            });
        }
        if self.content.chars().count() > MAX_CHUNK_CONTENT_LEN {
            return Err(ChunkError::ContentTooLarge {
                file: self.file_path.clone(),
                len: self.content.chars().count(),
            });
        }
        if let Some(emb) = &self.embedding {
            validate_embedding(emb)?;
        }
        Ok(())
    }

    /// True when the chunk can participate in similarity search:
    /// an embedding of the right shape that is neither degraded nor zero.
    pub fn has_searchable_embedding(&self) -> bool {
        if self.degraded {
            return false;
        }
        match &self.embedding {
            Some(emb) => {
                emb.len() == EMBEDDING_DIM
                    && emb.iter().all(|v| v.is_finite())
                    && emb.iter().any(|v| *v != 0.0)
            }
            None => false,
        }
    }
}

/// Derive the content-addressed chunk id.
///
/// blake3 over the four identity components with `\x1f` separators so
/// `("a", 1, 12, ...)` and `("a1", 1, 2, ...)` cannot collide by
/// concatenation.
pub fn compute_chunk_id(file_path: &str, start_line: u32, end_line: u32, content: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(file_path.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(start_line.to_le_bytes().as_slice());
    hasher.update(b"\x1f");
    hasher.update(end_line.to_le_bytes().as_slice());
    hasher.update(b"\x1f");
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Validate an embedding slot: exact dimension, all components finite.
pub fn validate_embedding(emb: &[f32]) -> Result<(), ChunkError> {
    if emb.len() != EMBEDDING_DIM {
        return Err(ChunkError::BadDimension {
            got: emb.len(),
            expected: EMBEDDING_DIM,
        });
    }
    if let Some(index) = emb.iter().position(|v| !v.is_finite()) {
        return Err(ChunkError::NonFinite { index });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_depends_only_on_identity_components() {
        let a = compute_chunk_id("src/lib.rs", 1, 10, "fn main() {}");
        let b = compute_chunk_id("src/lib.rs", 1, 10, "fn main() {}");
        assert_eq!(a, b);

        assert_ne!(a, compute_chunk_id("src/main.rs", 1, 10, "fn main() {}"));
        assert_ne!(a, compute_chunk_id("src/lib.rs", 2, 10, "fn main() {}"));
        assert_ne!(a, compute_chunk_id("src/lib.rs", 1, 11, "fn main() {}"));
        assert_ne!(a, compute_chunk_id("src/lib.rs", 1, 10, "fn main() { }"));
    }

    #[test]
    fn test_chunk_id_ignores_non_identity_fields() {
        let mut chunk = CodeChunk::new("src/lib.rs", 1, 3, ChunkType::Function, "fn f() {}");
        let id = chunk.chunk_id.clone();
        chunk.symbol_name = Some("f".into());
        chunk.embedding = Some(vec![0.1; EMBEDDING_DIM]);
        chunk.indexed_at = 12345;
        // Identity is fixed at construction; metadata changes don't touch it
        assert_eq!(chunk.chunk_id, id);
    }

    #[test]
    fn test_chunk_id_separator_prevents_concat_collisions() {
        let a = compute_chunk_id("ab", 1, 2, "xy");
        let b = compute_chunk_id("a", 1, 2, "bxy");
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_line_order() {
        let mut chunk = CodeChunk::new("a.rs", 5, 10, ChunkType::Block, "x");
        assert!(chunk.validate().is_ok());
        chunk.start_line = 11;
        assert!(matches!(
            chunk.validate(),
            Err(ChunkError::LineOrder { .. })
        ));
    }

    #[test]
    fn test_validate_embedding_dimension() {
        let mut chunk = CodeChunk::new("a.rs", 1, 1, ChunkType::Block, "x");
        chunk.embedding = Some(vec![0.5; EMBEDDING_DIM]);
        assert!(chunk.validate().is_ok());

        chunk.embedding = Some(vec![0.5; EMBEDDING_DIM - 1]);
        assert!(matches!(
            chunk.validate(),
            Err(ChunkError::BadDimension { .. })
        ));
    }

    #[test]
    fn test_validate_embedding_finiteness() {
        let mut emb = vec![0.5; EMBEDDING_DIM];
        emb[7] = f32::NAN;
        assert!(matches!(
            validate_embedding(&emb),
            Err(ChunkError::NonFinite { index: 7 })
        ));
    }

    #[test]
    fn test_searchable_excludes_degraded_and_zero() {
        let mut chunk = CodeChunk::new("a.rs", 1, 1, ChunkType::Block, "x");
        assert!(!chunk.has_searchable_embedding(), "no embedding yet");

        chunk.embedding = Some(vec![0.0; EMBEDDING_DIM]);
        assert!(!chunk.has_searchable_embedding(), "zero vector");

        chunk.embedding = Some(vec![0.1; EMBEDDING_DIM]);
        assert!(chunk.has_searchable_embedding());

        chunk.degraded = true;
        assert!(!chunk.has_searchable_embedding(), "degraded flag wins");
    }

    #[test]
    fn test_chunk_type_round_trip() {
        for t in [
            ChunkType::Function,
            ChunkType::Class,
            ChunkType::Block,
            ChunkType::Section,
        ] {
            let s = t.to_string();
            assert_eq!(s.parse::<ChunkType>().unwrap(), t);
        }
        assert!("module".parse::<ChunkType>().is_err());
    }

    #[test]
    fn test_serde_round_trip_preserves_fields() {
        let mut chunk = CodeChunk::new("src/a.rs", 3, 9, ChunkType::Function, "fn go() {}");
        chunk.function_name = Some("go".into());
        chunk.language_metadata.language = "rust".into();
        chunk.relationships.imports = vec!["std::fs".into()];
        chunk.embedding = Some(vec![0.25; EMBEDDING_DIM]);
        chunk.indexed_at = 1_700_000_000_000;
        chunk.source = SourceMeta {
            file_hash: "abc".into(),
            file_mtime_ms: 42,
        };

        let json = serde_json::to_string(&chunk).unwrap();
        let back: CodeChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
    }
}
