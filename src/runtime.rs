//! Worker-side embedding runtime.
//!
//! The pool treats model invocation as an external collaborator behind
//! [`WorkerRuntime`]: one RPC, embed a batch of strings. The built-in
//! [`HashRuntime`] is a deterministic token-hash projection — enough to
//! run the full pipeline and the test suite without a model download.
//! `serve_worker` is the blocking stdio loop behind `codectx worker`.

use std::io::{BufRead, Write};
use std::time::Instant;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::math::normalize_l2;
use crate::pool::protocol::{self, EmbedStats, PoolMessage, WorkerMessage};
use crate::EMBEDDING_DIM;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("embedding failed: {0}")]
    Embed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability set a worker process exposes to the serve loop.
pub trait WorkerRuntime {
    fn dimension(&self) -> usize;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RuntimeError>;
}

/// Deterministic bag-of-tokens hash projection.
///
/// Each lowercased identifier token is hashed to a dimension index and
/// accumulated with term frequency, then the vector is L2-normalised.
/// Identical content always produces identical vectors, and texts
/// sharing vocabulary land near each other — the properties the
/// pipeline and tests rely on.
pub struct HashRuntime {
    dimension: usize,
}

impl HashRuntime {
    pub fn new() -> Self {
        HashRuntime {
            dimension: EMBEDDING_DIM,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let mut token = String::new();
        for c in text.chars() {
            if c.is_alphanumeric() || c == '_' {
                token.extend(c.to_lowercase());
            } else if !token.is_empty() {
                self.bump(&mut vector, &token);
                token.clear();
            }
        }
        if !token.is_empty() {
            self.bump(&mut vector, &token);
        }
        normalize_l2(vector)
    }

    fn bump(&self, vector: &mut [f32], token: &str) {
        let digest = Sha256::digest(token.as_bytes());
        let index =
            u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % vector.len();
        // Second slot reduces single-index collisions between tokens
        let index2 =
            u32::from_le_bytes([digest[4], digest[5], digest[6], digest[7]]) as usize % vector.len();
        vector[index] += 1.0;
        vector[index2] += 0.5;
    }
}

impl Default for HashRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRuntime for HashRuntime {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RuntimeError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Emit a progress frame every this many texts
const PROGRESS_EVERY: usize = 100;

/// Blocking ndjson serve loop: read pool messages from stdin, write
/// replies to stdout. Returns when stdin closes or after an abort that
/// arrives outside a batch.
pub fn serve_worker(runtime: &dyn WorkerRuntime) -> Result<(), RuntimeError> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message = match protocol::decode_pool_line(&line) {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Worker received malformed frame");
                continue;
            }
        };

        match message {
            PoolMessage::Init => {
                write_frame(
                    &mut out,
                    &WorkerMessage::InitComplete {
                        success: true,
                        error: None,
                    },
                )?;
            }
            PoolMessage::EmbedBatch {
                batch_id, texts, ..
            }
            | PoolMessage::EmbedBatchShared {
                batch_id, texts, ..
            } => {
                // Shared-memory transport is not supported here; both
                // variants answer over stdout
                serve_embed(&mut out, runtime, batch_id, &texts)?;
            }
            PoolMessage::Abort => {
                write_frame(&mut out, &WorkerMessage::AbortAck)?;
            }
            PoolMessage::QueryMemory { request_id } => {
                write_frame(
                    &mut out,
                    &WorkerMessage::MemoryResponse {
                        request_id,
                        rss_bytes: own_rss_bytes().unwrap_or(0),
                    },
                )?;
            }
        }
    }
    Ok(())
}

fn serve_embed(
    out: &mut impl Write,
    runtime: &dyn WorkerRuntime,
    batch_id: u64,
    texts: &[String],
) -> Result<(), RuntimeError> {
    let start = Instant::now();
    let total = texts.len();

    let mut embeddings = Vec::with_capacity(total);
    for (done, text) in texts.iter().enumerate() {
        match runtime.embed(std::slice::from_ref(text)) {
            Ok(mut vectors) => embeddings.push(vectors.remove(0)),
            Err(e) => {
                write_frame(
                    out,
                    &WorkerMessage::EmbedComplete {
                        batch_id,
                        success: false,
                        embeddings: Vec::new(),
                        stats: None,
                        error: Some(e.to_string()),
                    },
                )?;
                return Ok(());
            }
        }
        if (done + 1) % PROGRESS_EVERY == 0 && done + 1 < total {
            write_frame(
                out,
                &WorkerMessage::Progress {
                    batch_id,
                    processed: done + 1,
                    total,
                },
            )?;
        }
    }

    write_frame(
        out,
        &WorkerMessage::EmbedComplete {
            batch_id,
            success: true,
            embeddings,
            stats: Some(EmbedStats {
                duration_ms: start.elapsed().as_millis() as u64,
                peak_rss_bytes: own_rss_bytes().unwrap_or(0),
            }),
            error: None,
        },
    )?;
    Ok(())
}

fn write_frame(out: &mut impl Write, message: &WorkerMessage) -> Result<(), RuntimeError> {
    let line = protocol::encode(message).map_err(|e| RuntimeError::Embed(e.to_string()))?;
    out.write_all(line.as_bytes())?;
    out.flush()?;
    Ok(())
}

/// Own RSS via /proc on Linux; `None` elsewhere or on failure.
fn own_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::full_cosine_similarity;

    #[test]
    fn test_hash_runtime_deterministic() {
        let runtime = HashRuntime::new();
        let a = runtime.embed(&["fn parse_config(path)".to_string()]).unwrap();
        let b = runtime.embed(&["fn parse_config(path)".to_string()]).unwrap();
        assert_eq!(a, b, "byte-identical for identical content");
    }

    #[test]
    fn test_hash_runtime_dimension_and_norm() {
        let runtime = HashRuntime::new();
        let v = &runtime.embed(&["some tokens here".to_string()]).unwrap()[0];
        assert_eq!(v.len(), EMBEDDING_DIM);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "L2-normalised, got {norm}");
    }

    #[test]
    fn test_hash_runtime_similarity_orders_sensibly() {
        let runtime = HashRuntime::new();
        let base = &runtime
            .embed(&["fn read_config(path: &Path) -> Config".to_string()])
            .unwrap()[0];
        let near = &runtime
            .embed(&["fn write_config(path: &Path) -> Config".to_string()])
            .unwrap()[0];
        let far = &runtime
            .embed(&["SELECT count(*) FROM orders WHERE total > 10".to_string()])
            .unwrap()[0];

        let sim_near = full_cosine_similarity(base, near);
        let sim_far = full_cosine_similarity(base, far);
        assert!(
            sim_near > sim_far,
            "shared vocabulary should score higher ({sim_near} vs {sim_far})"
        );
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let runtime = HashRuntime::new();
        let v = &runtime.embed(&["".to_string()]).unwrap()[0];
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
