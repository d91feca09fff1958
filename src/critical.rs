//! Critical-set extraction from query text.
//!
//! Pure function from a task description to the file/function/symbol
//! hints the selector must honour. The confidence score is advisory
//! telemetry for the caller; the selector never branches on it.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Hints extracted from a query, with an advisory confidence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriticalSet {
    pub file_paths: Vec<String>,
    pub function_names: Vec<String>,
    pub symbol_names: Vec<String>,
    /// 0..1, telemetry only
    pub confidence: f32,
}

impl CriticalSet {
    pub fn is_empty(&self) -> bool {
        self.file_paths.is_empty() && self.function_names.is_empty() && self.symbol_names.is_empty()
    }

    /// Total number of extracted mentions across all categories
    pub fn total_mentions(&self) -> usize {
        self.file_paths.len() + self.function_names.len() + self.symbol_names.len()
    }
}

/// Source extensions recognised as file-path mentions
const SOURCE_EXTENSIONS: &[&str] = &[
    ".rs", ".go", ".cpp", ".c", ".h", ".ts", ".tsx", ".js", ".jsx", ".py", ".java",
];

/// Words that look like identifiers but never name a function
const STOPWORDS: &[&str] = &["and", "or", "not", "the", "for", "with", "from"];

static PATH_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_./\\-]+\.[A-Za-z]{1,4}").expect("valid regex"));
static PATH_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:file|path|in)\s+([A-Za-z0-9_./\\-]{2,})").expect("valid regex")
});
static FUNCTION_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:function|method|call(?:ing)?)\s+([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});
static CALL_SITE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("valid regex"));
static SYMBOL_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:class|interface|type|component)\s+([A-Z][A-Za-z0-9_]*)")
        .expect("valid regex")
});
static PASCAL_IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][a-z0-9]+(?:[A-Z][A-Za-z0-9]*)+)\b").expect("valid regex"));
static IDENT_SHAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// Extract the critical set from a query task description.
pub fn extract_critical_set(query: &str) -> CriticalSet {
    let file_paths = extract_file_paths(query);
    let function_names = extract_function_names(query);
    let symbol_names = extract_symbol_names(query, &function_names);

    let total = file_paths.len() + function_names.len() + symbol_names.len();
    let confidence = if total == 0 {
        0.1
    } else {
        let mut c = 0.3 + 0.15 * total as f32;
        if !file_paths.is_empty() {
            c += 0.2;
        }
        if !function_names.is_empty() {
            c += 0.1;
        }
        c.min(0.95)
    };

    let set = CriticalSet {
        file_paths,
        function_names,
        symbol_names,
        confidence,
    };
    tracing::debug!(
        files = set.file_paths.len(),
        functions = set.function_names.len(),
        symbols = set.symbol_names.len(),
        confidence = set.confidence,
        "Extracted critical set"
    );
    set
}

fn extract_file_paths(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for m in PATH_TOKEN_RE.find_iter(query) {
        let token = m.as_str();
        if has_source_extension(token) && accept_path(token) && seen.insert(token.to_lowercase()) {
            out.push(token.to_string());
        }
    }
    for cap in PATH_HINT_RE.captures_iter(query) {
        let token = &cap[1];
        // "in <word>" matches prose too; only keep tokens that look like paths
        if (has_source_extension(token) || token.contains('/'))
            && accept_path(token)
            && seen.insert(token.to_lowercase())
        {
            out.push(token.to_string());
        }
    }
    out
}

fn has_source_extension(token: &str) -> bool {
    let lower = token.to_lowercase();
    SOURCE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn accept_path(token: &str) -> bool {
    token.len() >= 4 && !token.contains("node_modules")
}

fn extract_function_names(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for cap in FUNCTION_HINT_RE.captures_iter(query) {
        push_ident(&cap[1], &mut seen, &mut out);
    }
    for cap in CALL_SITE_RE.captures_iter(query) {
        push_ident(&cap[1], &mut seen, &mut out);
    }
    out
}

fn push_ident(ident: &str, seen: &mut HashSet<String>, out: &mut Vec<String>) {
    if ident.len() < 2 {
        return;
    }
    let lower = ident.to_lowercase();
    if STOPWORDS.contains(&lower.as_str()) {
        return;
    }
    if !IDENT_SHAPE_RE.is_match(ident) {
        return;
    }
    if seen.insert(lower) {
        out.push(ident.to_string());
    }
}

fn extract_symbol_names(query: &str, function_names: &[String]) -> Vec<String> {
    let functions: HashSet<String> = function_names.iter().map(|f| f.to_lowercase()).collect();
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for cap in SYMBOL_HINT_RE.captures_iter(query) {
        push_symbol(&cap[1], &functions, &mut seen, &mut out);
    }
    for cap in PASCAL_IDENT_RE.captures_iter(query) {
        push_symbol(&cap[1], &functions, &mut seen, &mut out);
    }
    out
}

fn push_symbol(
    ident: &str,
    functions: &HashSet<String>,
    seen: &mut HashSet<String>,
    out: &mut Vec<String>,
) {
    if ident.len() <= 2 {
        return;
    }
    let lower = ident.to_lowercase();
    if STOPWORDS.contains(&lower.as_str()) || functions.contains(&lower) {
        return;
    }
    if !IDENT_SHAPE_RE.is_match(ident) {
        return;
    }
    if seen.insert(lower) {
        out.push(ident.to_string());
    }
}
