//! Worker IPC protocol: newline-delimited UTF-8 JSON over stdin/stdout.
//!
//! Messages are a sealed set of variants tagged by `type`. Unknown
//! variants from a worker are ignored with a warning rather than
//! killing the connection; a malformed line is a transient error the
//! caller may count against the worker.

use serde::{Deserialize, Serialize};

/// Per-batch timing the worker reports on completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedStats {
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub peak_rss_bytes: u64,
}

/// Pool → worker messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolMessage {
    Init,
    EmbedBatch {
        batch_id: u64,
        texts: Vec<String>,
        timeout_warning_ms: u64,
    },
    /// Shared-memory transport variant: the worker writes results into a
    /// pre-allocated buffer instead of the stdout frame. Carried for
    /// protocol compatibility; the stdio pool never sends it.
    EmbedBatchShared {
        batch_id: u64,
        texts: Vec<String>,
        timeout_warning_ms: u64,
        buffer_key: String,
    },
    Abort,
    QueryMemory {
        request_id: u64,
    },
}

/// Worker → pool messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    InitComplete {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Progress {
        batch_id: u64,
        processed: usize,
        total: usize,
    },
    TimeoutWarning {
        batch_id: u64,
    },
    EmbedComplete {
        batch_id: u64,
        success: bool,
        #[serde(default)]
        embeddings: Vec<Vec<f32>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<EmbedStats>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SharedMemory {
        batch_id: u64,
        buffer_key: String,
    },
    MemoryResponse {
        request_id: u64,
        rss_bytes: u64,
    },
    AbortAck,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_id: Option<u64>,
        message: String,
    },
}

/// Encode one message as a single ndjson line (trailing newline included).
pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one worker line. `Ok(None)` means the line carried an unknown
/// `type` — logged and skipped per protocol. `Err` means the line was
/// not valid JSON or missed required fields of a known type.
pub fn decode_worker_line(line: &str) -> Result<Option<WorkerMessage>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    match serde_json::from_value::<WorkerMessage>(value.clone()) {
        Ok(msg) => Ok(Some(msg)),
        Err(e) => {
            // Known-type parse failures propagate; unknown tags are skipped
            let tag = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
            if is_known_worker_type(tag) {
                Err(e)
            } else {
                tracing::warn!(message_type = tag, "Ignoring unknown worker message type");
                Ok(None)
            }
        }
    }
}

/// Decode one pool line on the worker side, same unknown-type policy.
pub fn decode_pool_line(line: &str) -> Result<Option<PoolMessage>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    match serde_json::from_value::<PoolMessage>(value.clone()) {
        Ok(msg) => Ok(Some(msg)),
        Err(e) => {
            let tag = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
            if is_known_pool_type(tag) {
                Err(e)
            } else {
                tracing::warn!(message_type = tag, "Ignoring unknown pool message type");
                Ok(None)
            }
        }
    }
}

fn is_known_worker_type(tag: &str) -> bool {
    matches!(
        tag,
        "init_complete"
            | "progress"
            | "timeout_warning"
            | "embed_complete"
            | "shared_memory"
            | "memory_response"
            | "abort_ack"
            | "error"
    )
}

fn is_known_pool_type(tag: &str) -> bool {
    matches!(
        tag,
        "init" | "embed_batch" | "embed_batch_shared" | "abort" | "query_memory"
    )
}
