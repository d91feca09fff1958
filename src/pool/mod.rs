//! Adaptive embedding process pool.
//!
//! Owns a set of child worker processes, a shared embedding cache, an
//! adaptive batch-size controller, and a resource governor that gates
//! growth. Chunks go in without embeddings and come out in the same
//! order with embeddings filled; per-chunk failures degrade to zero
//! vectors rather than failing the batch, and the pool only errors when
//! no progress is possible at all.

pub mod batch;
pub mod cache;
pub mod protocol;
pub mod resources;
pub mod worker;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use lru::LruCache;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::chunk::{validate_embedding, CodeChunk};
use crate::config::{CacheSettings, PoolSettings};
use batch::BatchController;
use cache::{CacheStats, EmbeddingCache};
use resources::{num_cores, ResourceGovernor, ResourceProbe, SystemProbe};
use worker::{Worker, WorkerError};

/// Growth decision interval while processing
const SCALE_INTERVAL: Duration = Duration::from_secs(15);
/// Fraction of the hard timeout at which the warning fires
const WARN_FRACTION: f64 = 0.70;
/// Spawn attempts before declaring a replacement impossible
const SPAWN_ATTEMPTS: u32 = 3;
/// Retry attempts per recovery sub-batch before zero-filling
const RECOVERY_ATTEMPTS: u32 = 2;
/// Query-embedding LRU capacity
const QUERY_CACHE_SIZE: usize = 100;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool is shut down")]
    ShutDown,
    #[error("all workers dead and respawn failed: {0}")]
    NoWorkers(String),
    #[error("query cannot be empty")]
    EmptyQuery,
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
}

impl PoolError {
    /// Fatal pool failures map to exit code 4.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PoolError::NoWorkers(_))
    }
}

/// Pool counters for the CLI and telemetry
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub live_workers: usize,
    pub max_workers: usize,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub degraded_chunks: u64,
    pub current_batch_size: usize,
    pub optimal_batch_size: Option<usize>,
    pub cache: CacheStats,
}

/// Builder for non-default pools (tests inject probes and intervals).
pub struct PoolBuilder {
    settings: PoolSettings,
    cache_settings: CacheSettings,
    probe: Box<dyn ResourceProbe>,
    scale_interval: Duration,
}

impl PoolBuilder {
    pub fn probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn scale_interval(mut self, interval: Duration) -> Self {
        self.scale_interval = interval;
        self
    }

    pub async fn build(self) -> Result<EmbeddingPool, PoolError> {
        EmbeddingPool::start(
            self.settings,
            self.cache_settings,
            self.probe,
            self.scale_interval,
        )
        .await
    }
}

/// Shared mutable pool state
struct PoolInner {
    settings: PoolSettings,
    cache: EmbeddingCache,
    controller: StdMutex<BatchController>,
    governor: Mutex<ResourceGovernor>,
    /// Idle workers ready for checkout
    idle_tx: mpsc::UnboundedSender<Worker>,
    idle_rx: Mutex<mpsc::UnboundedReceiver<Worker>>,
    /// Live workers: idle + checked out
    live_workers: AtomicUsize,
    max_workers: usize,
    next_worker_id: AtomicU32,
    next_batch_id: AtomicU64,
    /// Batches currently in flight (scaling only acts while processing)
    active_batches: AtomicUsize,
    /// System memory at startup, for worker-fraction estimates
    total_memory: u64,
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    degraded_chunks: AtomicU64,
    shutdown: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to the embedding pool. Cheap to clone.
#[derive(Clone)]
pub struct EmbeddingPool {
    inner: Arc<PoolInner>,
    query_cache: Arc<StdMutex<LruCache<String, Vec<f32>>>>,
}

impl EmbeddingPool {
    /// Spawn a pool with default probe and scaling interval.
    pub async fn new(
        settings: PoolSettings,
        cache_settings: CacheSettings,
    ) -> Result<Self, PoolError> {
        Self::builder(settings, cache_settings).build().await
    }

    pub fn builder(settings: PoolSettings, cache_settings: CacheSettings) -> PoolBuilder {
        PoolBuilder {
            settings,
            cache_settings,
            probe: Box::new(SystemProbe::new()),
            scale_interval: SCALE_INTERVAL,
        }
    }

    async fn start(
        settings: PoolSettings,
        cache_settings: CacheSettings,
        probe: Box<dyn ResourceProbe>,
        scale_interval: Duration,
    ) -> Result<Self, PoolError> {
        let cores = num_cores();
        let max_workers = ((cores as f64 * settings.max_fraction).floor() as usize).max(1);
        let initial = ((max_workers as f64 * settings.start_fraction).floor() as usize).max(1);

        let governor = ResourceGovernor::new(
            settings.memory_stop,
            settings.memory_resume,
            settings.cpu_stop,
            settings.cpu_resume,
        );
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let total_memory = probe.total_memory_bytes().max(1);

        let inner = Arc::new(PoolInner {
            controller: StdMutex::new(BatchController::new(&settings)),
            cache: EmbeddingCache::new(cache_settings),
            governor: Mutex::new(governor),
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            live_workers: AtomicUsize::new(0),
            max_workers,
            next_worker_id: AtomicU32::new(0),
            next_batch_id: AtomicU64::new(0),
            active_batches: AtomicUsize::new(0),
            total_memory,
            batches_completed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            degraded_chunks: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            settings,
        });

        let pool = EmbeddingPool {
            inner,
            query_cache: Arc::new(StdMutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("nonzero"),
            ))),
        };

        tracing::info!(
            cores,
            max_workers,
            initial_workers = initial,
            "Starting embedding pool"
        );
        for _ in 0..initial {
            // A pool that never got a single worker up is dead on arrival
            if let Err(e) = pool.spawn_worker().await {
                if pool.live_workers() == 0 {
                    return Err(PoolError::NoWorkers(e.to_string()));
                }
                tracing::warn!(error = %e, "Initial worker spawn failed, continuing short");
            }
        }
        pool.spawn_scaler(probe, scale_interval);
        Ok(pool)
    }

    /// Embed a sequence of chunks, preserving input order and identity.
    ///
    /// Cache hits are satisfied without worker traffic; misses are
    /// dispatched in adaptive batches. After the retry ladder is
    /// exhausted a chunk comes back with a zero vector and the
    /// `degraded` flag set.
    pub async fn embed_batch(
        &self,
        mut chunks: Vec<CodeChunk>,
    ) -> Result<Vec<CodeChunk>, PoolError> {
        self.ensure_accepting()?;
        if chunks.is_empty() {
            return Ok(chunks);
        }

        self.inner.active_batches.fetch_add(1, Ordering::SeqCst);
        let result = self.embed_batch_inner(&mut chunks).await;
        self.inner.active_batches.fetch_sub(1, Ordering::SeqCst);
        result.map(|()| chunks)
    }

    async fn embed_batch_inner(&self, chunks: &mut [CodeChunk]) -> Result<(), PoolError> {
        // Cache pass: collect misses by original index
        let mut miss_indices: Vec<usize> = Vec::new();
        for (i, chunk) in chunks.iter_mut().enumerate() {
            let key = cache::content_key(&chunk.content);
            match self.inner.cache.get(&key) {
                Some(embedding) => {
                    chunk.embedding = Some(embedding);
                    chunk.degraded = false;
                    chunk.indexed_at = chrono::Utc::now().timestamp_millis();
                }
                None => miss_indices.push(i),
            }
        }
        if miss_indices.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            total = chunks.len(),
            cache_hits = chunks.len() - miss_indices.len(),
            misses = miss_indices.len(),
            "Embedding batch"
        );

        // Dispatch misses in controller-sized sub-batches
        let mut cursor = 0usize;
        while cursor < miss_indices.len() {
            self.ensure_accepting()?;
            let size = self.current_batch_size().max(1);
            let slice: Vec<usize> =
                miss_indices[cursor..(cursor + size).min(miss_indices.len())].to_vec();
            cursor += slice.len();

            let texts: Vec<String> = slice.iter().map(|&i| chunks[i].content.clone()).collect();
            let vectors = self.dispatch_with_recovery(&texts).await?;

            let now = chrono::Utc::now().timestamp_millis();
            for (&chunk_idx, vector) in slice.iter().zip(vectors) {
                let chunk = &mut chunks[chunk_idx];
                match vector {
                    Some(embedding) => {
                        self.inner
                            .cache
                            .insert(cache::content_key(&chunk.content), embedding.clone());
                        chunk.embedding = Some(embedding);
                        chunk.degraded = false;
                        chunk.indexed_at = now;
                    }
                    None => {
                        chunk.embedding = Some(vec![0.0; crate::EMBEDDING_DIM]);
                        chunk.degraded = true;
                        self.inner.degraded_chunks.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            chunk_id = %chunk.chunk_id,
                            file = %chunk.file_path,
                            "Chunk degraded to zero vector after retries"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Embed one query text (LRU-cached).
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, PoolError> {
        self.ensure_accepting()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(PoolError::EmptyQuery);
        }
        if let Some(hit) = self
            .query_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(text)
            .cloned()
        {
            return Ok(hit);
        }

        let vectors = self.dispatch_with_recovery(&[text.to_string()]).await?;
        let embedding = vectors
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| PoolError::NoWorkers("query embedding degraded".into()))?;

        self.query_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// One batch through a worker, with the failure-recovery ladder.
    /// Returns one slot per text; `None` marks a chunk that exhausted
    /// its retries.
    async fn dispatch_with_recovery(
        &self,
        texts: &[String],
    ) -> Result<Vec<Option<Vec<f32>>>, PoolError> {
        match self.dispatch_once(texts).await {
            Ok(vectors) => return Ok(vectors.into_iter().map(Some).collect()),
            Err(e) => {
                tracing::warn!(error = %e, size = texts.len(), "Batch failed, entering recovery");
                self.lock_controller(|c| c.record_failure());
                self.inner.batches_failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Recovery: split into sub-batches of the recovery size and retry
        // each on a (restarted) worker
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut start = 0usize;
        while start < texts.len() {
            self.ensure_accepting()?;
            let size = self.lock_controller(|c| c.recovery_size()).max(1);
            let end = (start + size).min(texts.len());
            let sub = &texts[start..end];

            let mut recovered = None;
            for attempt in 1..=RECOVERY_ATTEMPTS {
                match self.dispatch_once(sub).await {
                    Ok(vectors) => {
                        recovered = Some(vectors);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, size = sub.len(), "Recovery sub-batch failed");
                        self.lock_controller(|c| c.record_failure());
                        self.inner.batches_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            match recovered {
                Some(vectors) => {
                    for (slot, vector) in results[start..end].iter_mut().zip(vectors) {
                        *slot = Some(vector);
                    }
                }
                None => {
                    tracing::error!(
                        from = start,
                        to = end,
                        "Recovery exhausted, chunks will be degraded"
                    );
                }
            }
            start = end;
        }
        Ok(results)
    }

    /// Check out a worker, run exactly one embed-batch RPC, return or
    /// replace the worker.
    async fn dispatch_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PoolError> {
        let mut worker = self.checkout_worker().await?;
        debug_assert_eq!(worker.state(), worker::WorkerState::Ready);
        let batch_id = self.inner.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Duration::from_millis(self.inner.settings.batch_timeout_ms);
        let warn_at = deadline.mul_f64(WARN_FRACTION);

        let started = std::time::Instant::now();
        match worker.embed_batch(batch_id, texts, deadline, warn_at).await {
            Ok((vectors, stats)) => {
                // Validate every vector before letting it near the cache
                for vector in &vectors {
                    if let Err(e) = validate_embedding(vector) {
                        self.replace_worker(worker).await;
                        return Err(PoolError::Worker(WorkerError::BatchFailed(format!(
                            "invalid embedding from worker: {e}"
                        ))));
                    }
                }
                let duration_ms = started.elapsed().as_millis() as u64;
                let memory_delta = stats
                    .as_ref()
                    .map(|s| s.peak_rss_bytes as i64)
                    .unwrap_or(0);
                self.lock_controller(|c| c.record_success(texts.len(), duration_ms, memory_delta));
                self.inner.batches_completed.fetch_add(1, Ordering::Relaxed);
                // Worker-reported RSS sharpens the growth prediction
                if let Some(peak) = stats.map(|s| s.peak_rss_bytes).filter(|p| *p > 0) {
                    let fraction = peak as f64 / self.inner.total_memory as f64;
                    self.inner.governor.lock().await.set_worker_fraction(fraction);
                }
                let _ = self.inner.idle_tx.send(worker);
                Ok(vectors)
            }
            Err(e) => {
                // The worker is suspect after any failure: replace it and
                // reject its pending work
                self.replace_worker(worker).await;
                Err(PoolError::Worker(e))
            }
        }
    }

    /// Wait for an idle worker; back-pressures callers while all are busy.
    async fn checkout_worker(&self) -> Result<Worker, PoolError> {
        let mut rx = self.inner.idle_rx.lock().await;
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(worker) => Ok(worker),
                None => Err(PoolError::ShutDown),
            },
            _ = self.inner.cancel.cancelled() => Err(PoolError::ShutDown),
        }
    }

    /// Discard a failed worker and spawn one replacement with backoff.
    async fn replace_worker(&self, failed: Worker) {
        self.inner.live_workers.fetch_sub(1, Ordering::SeqCst);
        let id = failed.id;
        drop(failed); // kill_on_drop reaps the process
        tracing::warn!(worker = id, "Worker discarded, spawning replacement");

        for attempt in 1..=SPAWN_ATTEMPTS {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match self.spawn_worker().await {
                Ok(()) => return,
                Err(e) => {
                    let jitter_ms = rand::rng().random_range(50..250) * attempt as u64;
                    tracing::warn!(error = %e, attempt, "Worker respawn failed, backing off");
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                }
            }
        }
        tracing::error!("Worker replacement failed after {SPAWN_ATTEMPTS} attempts");
    }

    async fn spawn_worker(&self) -> Result<(), PoolError> {
        let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::spawn(id, &self.inner.settings.worker_command).await?;
        self.inner.live_workers.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.idle_tx.send(worker);
        Ok(())
    }

    /// Periodic scaling task: sample resources, update the governor and
    /// batch controller, grow by one worker when every gate passes.
    fn spawn_scaler(&self, mut probe: Box<dyn ResourceProbe>, interval: Duration) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = pool.inner.cancel.cancelled() => break,
                }

                let sample = probe.sample();
                let mut governor = pool.inner.governor.lock().await;
                if let Some(sample) = sample {
                    governor.observe(sample);
                } else {
                    tracing::debug!("Resource sample unavailable, keeping previous state");
                }

                if governor.memory_constrained() {
                    pool.lock_controller(|c| c.on_memory_constrained());
                }

                // Grow only while there is work in flight
                let processing = pool.inner.active_batches.load(Ordering::SeqCst) > 0;
                let live = pool.inner.live_workers.load(Ordering::SeqCst);
                if processing && live < pool.inner.max_workers && governor.can_grow() {
                    drop(governor);
                    match pool.spawn_worker().await {
                        Ok(()) => tracing::info!(workers = live + 1, "Pool grew by one worker"),
                        Err(e) => tracing::warn!(error = %e, "Pool growth spawn failed"),
                    }
                }
            }
        });
    }

    /// Stop accepting work, abort workers, escalate per the shutdown
    /// ladder. Idempotent.
    pub async fn shutdown(&self, reason: &str) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(reason, "Pool shutting down");
        self.inner.cancel.cancel();

        // Drain whatever is idle; checked-out workers die via kill_on_drop
        // when their batch call observes the cancel
        let mut rx = self.inner.idle_rx.lock().await;
        let mut set = JoinSet::new();
        while let Ok(worker) = rx.try_recv() {
            self.inner.live_workers.fetch_sub(1, Ordering::SeqCst);
            set.spawn(worker.shutdown());
        }
        drop(rx);
        while set.join_next().await.is_some() {}
        tracing::info!("Pool shutdown complete");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    pub fn live_workers(&self) -> usize {
        self.inner.live_workers.load(Ordering::SeqCst)
    }

    pub fn current_batch_size(&self) -> usize {
        self.lock_controller(|c| c.current_size())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock_controller(|c| c.consecutive_failures())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_workers: self.live_workers(),
            max_workers: self.inner.max_workers,
            batches_completed: self.inner.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.inner.batches_failed.load(Ordering::Relaxed),
            degraded_chunks: self.inner.degraded_chunks.load(Ordering::Relaxed),
            current_batch_size: self.current_batch_size(),
            optimal_batch_size: self.lock_controller(|c| c.optimal_size()),
            cache: self.inner.cache.stats(),
        }
    }

    fn ensure_accepting(&self) -> Result<(), PoolError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            Err(PoolError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn lock_controller<T>(&self, f: impl FnOnce(&mut BatchController) -> T) -> T {
        let mut guard = self
            .inner
            .controller
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}
