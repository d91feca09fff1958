//! Chunk boundary detection seam.
//!
//! Language-aware AST chunking is an external collaborator; this module
//! defines the trait the indexer consumes plus a plain-text fallback
//! that splits on blank-line block boundaries. The fallback keeps the
//! binary and the test suite self-contained without pulling a parser
//! stack into the crate.

use std::sync::LazyLock;

use regex::Regex;

use crate::chunk::{ChunkType, CodeChunk, SourceMeta, MAX_CHUNK_CONTENT_LEN};

/// Produces chunk records for one file.
///
/// Implementations receive the full file content and return chunks whose
/// ids are content-addressed and whose `source` meta carries the
/// file-level hash/mtime used by incremental delta computation.
pub trait Chunker: Send + Sync {
    fn chunk_file(&self, file_path: &str, content: &str, mtime_ms: i64) -> Vec<CodeChunk>;
}

/// Blank-line block chunker.
///
/// Splits a file into blank-line-delimited blocks, merges small blocks
/// up to `max_lines`, and tags each chunk by a cheap signature scan.
/// Deliberately language-naive.
pub struct BlockChunker {
    max_lines: usize,
}

/// Default merge ceiling per chunk, in lines
const DEFAULT_MAX_LINES: usize = 120;

static FUNCTION_SIG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?:pub(?:\([a-z]+\))?\s+)?(?:async\s+)?(?:fn|def|func|function)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("valid regex")
});
static CLASS_SIG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?:pub\s+)?(?:export\s+)?(?:class|struct|enum|trait|interface)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("valid regex")
});
static SECTION_SIG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+\S").expect("valid regex"));
static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^\s*(?:use\s+([A-Za-z_][A-Za-z0-9_:]*)|import\s+\{?\s*([A-Za-z_][A-Za-z0-9_,\s]*?)\s*\}?\s+from|import\s+([A-Za-z_][A-Za-z0-9_.]*)|from\s+([A-Za-z_][A-Za-z0-9_.]*)\s+import|#include\s+[<"]([A-Za-z0-9_./]+)[>"])"#,
    )
    .expect("valid regex")
});
static EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?:pub(?:\([a-z]+\))?\s+(?:fn|struct|enum|trait|const|static|type)\s+([A-Za-z_][A-Za-z0-9_]*)|export\s+(?:default\s+)?(?:function|class|const|let|var)?\s*([A-Za-z_][A-Za-z0-9_]*))",
    )
    .expect("valid regex")
});

impl Default for BlockChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl BlockChunker {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
        }
    }
}

impl Chunker for BlockChunker {
    fn chunk_file(&self, file_path: &str, content: &str, mtime_ms: i64) -> Vec<CodeChunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }
        let file_hash = blake3::hash(content.as_bytes()).to_hex().to_string();
        let source = SourceMeta {
            file_hash,
            file_mtime_ms: mtime_ms,
        };
        let language = language_for_path(file_path);

        let lines: Vec<&str> = content.lines().collect();
        let mut chunks = Vec::new();
        let mut block_start = 0usize; // 0-indexed line of current block

        let mut i = 0usize;
        while i <= lines.len() {
            let at_boundary = i == lines.len()
                || (lines[i].trim().is_empty() && i - block_start >= 1)
                    && block_big_enough(&lines[block_start..i]);
            let over_cap = i < lines.len() && i - block_start >= self.max_lines;

            if (at_boundary || over_cap) && i > block_start {
                let body: Vec<&str> = lines[block_start..i].to_vec();
                if body.iter().any(|l| !l.trim().is_empty()) {
                    chunks.push(self.make_chunk(
                        file_path,
                        block_start,
                        &body,
                        &source,
                        &language,
                    ));
                }
                // Skip the blank separator line itself
                block_start = if at_boundary && i < lines.len() { i + 1 } else { i };
            }
            i += 1;
        }

        chunks
    }
}

/// A block is mergeable-small below this many lines
const MIN_BLOCK_LINES: usize = 5;

fn block_big_enough(body: &[&str]) -> bool {
    body.iter().filter(|l| !l.trim().is_empty()).count() >= MIN_BLOCK_LINES
}

impl BlockChunker {
    fn make_chunk(
        &self,
        file_path: &str,
        start_idx: usize,
        body: &[&str],
        source: &SourceMeta,
        language: &str,
    ) -> CodeChunk {
        let mut text = body.join("\n");
        if text.chars().count() > MAX_CHUNK_CONTENT_LEN {
            text = text.chars().take(MAX_CHUNK_CONTENT_LEN).collect();
        }

        let function_name = FUNCTION_SIG_RE
            .captures(&text)
            .map(|c| c[1].to_string());
        let symbol_name = CLASS_SIG_RE.captures(&text).map(|c| c[1].to_string());
        let chunk_type = if function_name.is_some() {
            ChunkType::Function
        } else if symbol_name.is_some() {
            ChunkType::Class
        } else if body
            .first()
            .map(|l| SECTION_SIG_RE.is_match(l))
            .unwrap_or(false)
        {
            ChunkType::Section
        } else {
            ChunkType::Block
        };

        let start_line = start_idx as u32 + 1;
        let end_line = (start_idx + body.len()) as u32;
        let mut chunk = CodeChunk::new(file_path, start_line, end_line, chunk_type, text);
        chunk.function_name = function_name;
        chunk.symbol_name = symbol_name;
        chunk.language_metadata.language = language.to_string();
        chunk.relationships.imports = extract_imports(&chunk.content);
        chunk.relationships.exports = extract_exports(&chunk.content);
        chunk.source = source.clone();
        chunk
    }
}

fn extract_imports(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    for cap in IMPORT_RE.captures_iter(content) {
        let ident = cap
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().trim().to_string());
        if let Some(ident) = ident {
            if !ident.is_empty() && !out.contains(&ident) {
                out.push(ident);
            }
        }
    }
    out
}

fn extract_exports(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    for cap in EXPORT_RE.captures_iter(content) {
        let ident = cap
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().to_string());
        if let Some(ident) = ident {
            if !ident.is_empty() && !out.contains(&ident) {
                out.push(ident);
            }
        }
    }
    out
}

/// Map a file extension to a language tag
pub fn language_for_path(path: &str) -> String {
    let ext = path.rsplit('.').next().unwrap_or("");
    let lang = match ext {
        "rs" => "rust",
        "go" => "go",
        "py" => "python",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "md" => "markdown",
        other => other,
    };
    lang.to_string()
}
