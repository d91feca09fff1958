//! One embedding worker: a child process speaking the ndjson protocol.
//!
//! Lifecycle: `Spawning → Initializing → Ready ⇄ Busy → {Crashed,
//! ShuttingDown} → Terminated`. The pool dispatches at most one batch
//! to a worker at a time, so the RPC here is sequential: write a frame,
//! drain replies until completion or deadline.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use super::protocol::{self, PoolMessage, WorkerMessage};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker spawn failed: {0}")]
    Spawn(std::io::Error),
    #[error("worker init failed: {0}")]
    InitFailed(String),
    #[error("worker init timed out after {0:?}")]
    InitTimeout(Duration),
    #[error("worker exited mid-batch")]
    Crashed,
    #[error("batch {batch_id} timed out after {deadline:?}")]
    BatchTimeout { batch_id: u64, deadline: Duration },
    #[error("worker reported batch failure: {0}")]
    BatchFailed(String),
    #[error("worker returned {got} embeddings for {expected} texts")]
    CountMismatch { got: usize, expected: usize },
    #[error("worker IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Initializing,
    Ready,
    Busy,
    Crashed,
    ShuttingDown,
    Terminated,
}

/// Worker init handshake deadline
pub const INIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Abort-to-SIGTERM delay during shutdown
const TERM_AFTER_ABORT: Duration = Duration::from_secs(1);
/// Grace window for ack/exit after SIGTERM
const EXIT_GRACE: Duration = Duration::from_secs(5);
/// Further wait before SIGKILL
const KILL_AFTER: Duration = Duration::from_secs(3);

pub struct Worker {
    pub id: u32,
    child: Child,
    stdin: ChildStdin,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    state: WorkerState,
}

impl Worker {
    /// Spawn a worker process and complete the init handshake.
    pub async fn spawn(id: u32, argv: &[String]) -> Result<Worker, WorkerError> {
        let (program, args) = resolve_command(argv)?;
        tracing::debug!(worker = id, program = %program.display(), "Spawning worker");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");

        // Reader task: decode stdout lines into the message channel.
        // Channel closure doubles as the crash signal.
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_id = id;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match protocol::decode_worker_line(&line) {
                        Ok(Some(msg)) => {
                            if tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(worker = reader_id, error = %e, "Dropping malformed worker frame");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(worker = reader_id, error = %e, "Worker stdout closed: {e}");
                        break;
                    }
                }
            }
        });

        let mut worker = Worker {
            id,
            child,
            stdin,
            rx,
            state: WorkerState::Initializing,
        };
        worker.handshake().await?;
        worker.state = WorkerState::Ready;
        tracing::info!(worker = id, "Worker ready");
        Ok(worker)
    }

    async fn handshake(&mut self) -> Result<(), WorkerError> {
        self.send(&PoolMessage::Init).await?;
        let reply = timeout(INIT_TIMEOUT, self.rx.recv())
            .await
            .map_err(|_| WorkerError::InitTimeout(INIT_TIMEOUT))?;
        match reply {
            Some(WorkerMessage::InitComplete { success: true, .. }) => Ok(()),
            Some(WorkerMessage::InitComplete { success: false, error }) => Err(
                WorkerError::InitFailed(error.unwrap_or_else(|| "worker declined init".into())),
            ),
            Some(other) => Err(WorkerError::InitFailed(format!(
                "unexpected init reply: {other:?}"
            ))),
            None => Err(WorkerError::Crashed),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run one embed-batch RPC. Enforces the hard deadline; logs the
    /// worker's progress and timeout-warning frames along the way.
    /// Returns the vectors plus the worker's self-reported stats.
    pub async fn embed_batch(
        &mut self,
        batch_id: u64,
        texts: &[String],
        deadline: Duration,
        warn_at: Duration,
    ) -> Result<(Vec<Vec<f32>>, Option<super::protocol::EmbedStats>), WorkerError> {
        self.state = WorkerState::Busy;
        let result = self
            .embed_batch_inner(batch_id, texts, deadline, warn_at)
            .await;
        self.state = match &result {
            Ok(_) => WorkerState::Ready,
            Err(_) => WorkerState::Crashed,
        };
        result
    }

    async fn embed_batch_inner(
        &mut self,
        batch_id: u64,
        texts: &[String],
        deadline: Duration,
        warn_at: Duration,
    ) -> Result<(Vec<Vec<f32>>, Option<super::protocol::EmbedStats>), WorkerError> {
        let message = PoolMessage::EmbedBatch {
            batch_id,
            texts: texts.to_vec(),
            timeout_warning_ms: warn_at.as_millis() as u64,
        };
        self.send(&message).await?;

        let start = Instant::now();
        let mut warned = false;
        loop {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(WorkerError::BatchTimeout { batch_id, deadline });
            }
            // Surface our own warning even if the worker never sends one
            if !warned && start.elapsed() >= warn_at {
                warned = true;
                tracing::warn!(
                    worker = self.id,
                    batch_id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Batch nearing hard timeout"
                );
            }
            let wait = remaining.min(warn_at.saturating_sub(start.elapsed()).max(Duration::from_millis(50)));
            let msg = match timeout(wait, self.rx.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(WorkerError::Crashed),
                Err(_) => continue, // inner wait elapsed, loop re-checks deadline
            };
            match msg {
                WorkerMessage::Progress {
                    batch_id: id,
                    processed,
                    total,
                } if id == batch_id => {
                    tracing::trace!(worker = self.id, batch_id, processed, total, "Batch progress");
                }
                WorkerMessage::TimeoutWarning { batch_id: id } if id == batch_id => {
                    tracing::warn!(worker = self.id, batch_id, "Worker reported timeout warning");
                }
                WorkerMessage::EmbedComplete {
                    batch_id: id,
                    success,
                    embeddings,
                    stats,
                    error,
                } if id == batch_id => {
                    if let Some(stats) = &stats {
                        tracing::debug!(
                            worker = self.id,
                            batch_id,
                            duration_ms = stats.duration_ms,
                            "Batch complete"
                        );
                    }
                    if !success {
                        return Err(WorkerError::BatchFailed(
                            error.unwrap_or_else(|| "unspecified worker error".into()),
                        ));
                    }
                    if embeddings.len() != texts.len() {
                        return Err(WorkerError::CountMismatch {
                            got: embeddings.len(),
                            expected: texts.len(),
                        });
                    }
                    return Ok((embeddings, stats));
                }
                WorkerMessage::Error { batch_id: id, message } if id == Some(batch_id) || id.is_none() => {
                    return Err(WorkerError::BatchFailed(message));
                }
                other => {
                    tracing::debug!(worker = self.id, ?other, "Ignoring out-of-band worker message");
                }
            }
        }
    }

    /// Graceful shutdown ladder: abort frame, SIGTERM after 1 s, wait up
    /// to 5 s for ack/exit, SIGKILL 3 s later. Consumes the worker.
    pub async fn shutdown(mut self) {
        self.state = WorkerState::ShuttingDown;
        let _ = self.send(&PoolMessage::Abort).await;

        tokio::time::sleep(TERM_AFTER_ABORT).await;
        self.signal_term();

        let acked = timeout(EXIT_GRACE, async {
            loop {
                match self.rx.recv().await {
                    Some(WorkerMessage::AbortAck) | None => break,
                    Some(_) => continue,
                }
            }
        })
        .await
        .is_ok();

        let exited = timeout(
            if acked { Duration::from_millis(200) } else { KILL_AFTER },
            self.child.wait(),
        )
        .await
        .is_ok();
        if !exited {
            tracing::warn!(worker = self.id, "Worker ignored SIGTERM, killing");
            let _ = self.child.kill().await;
        }
        self.state = WorkerState::Terminated;
        tracing::debug!(worker = self.id, "Worker terminated");
    }

    fn signal_term(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: plain signal send to our own child's pid
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    async fn send(&mut self, message: &PoolMessage) -> Result<(), WorkerError> {
        let line = protocol::encode(message)
            .map_err(|e| WorkerError::Io(std::io::Error::other(e)))?;
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

/// Resolve the worker argv: configured command, or this binary's
/// `worker` subcommand when none is configured.
fn resolve_command(argv: &[String]) -> Result<(std::path::PathBuf, Vec<String>), WorkerError> {
    if let Some((head, tail)) = argv.split_first() {
        return Ok((std::path::PathBuf::from(head), tail.to_vec()));
    }
    let exe = std::env::current_exe().map_err(WorkerError::Spawn)?;
    Ok((exe, vec!["worker".to_string()]))
}
