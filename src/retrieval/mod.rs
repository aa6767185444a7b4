//! The retrieval engine: cache → intent → dense+sparse → fusion →
//! stability → MMR → exploration → rerank → log.
//!
//! All shared mutable state (query cache, latency EMA, MMR entropy,
//! rerank statistics) is scoped to an engine instance so multiple
//! workspaces coexist in one process.

pub mod cache;
pub mod explore;
pub mod fusion;
pub mod mmr;
pub mod pool;
pub mod rerank;
pub mod stability;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{anyhow, Context as _, Result};
use serde::Serialize;

use crate::intent::{self, Intent};
use crate::store::{self, ScoredChunk};
use crate::db;

use cache::QueryCache;
use mmr::MmrState;
use pool::WorkerPool;
use rerank::{BatchAnomaly, RerankClient, RerankOutcome, RerankerModel, RollingStats};

const LATENCY_ALPHA: f64 = 0.2;
const LATENCY_SEED_MS: f64 = 100.0;
/// Above this EMA the candidate pool shrinks to `limit × 3`.
const DEGRADED_LATENCY_MS: f64 = 1500.0;
/// Above this EMA non-summary queries skip dense search entirely.
const CRITICAL_LATENCY_MS: f64 = 4000.0;

pub const DEFAULT_LIMIT: usize = 5;

/// One retrieval result as handed to callers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievedChunk {
    pub id: i64,
    pub text: String,
    pub source_file: String,
    pub doc_id: String,
    pub page_num: i64,
    pub chunk_idx: i64,
    pub heading_path: String,
    pub heading_level: i64,
    pub chunk_type: String,
    pub sentence_count: i64,
    pub list_type: Option<String>,
    pub list_length: i64,
    /// Final fused (or reranked) score.
    pub score: f64,
    /// 1-indexed rank in the dense list; 0 = absent.
    pub semantic_rank: i64,
    /// 1-indexed rank in the keyword list; 0 = absent.
    pub keyword_rank: i64,
    /// 1-indexed pre-rerank position; 0 = not reranked.
    pub rerank_rank: i64,
    pub trust_score: f64,
    pub is_exploration: bool,
    pub stability: f64,
}

impl RetrievedChunk {
    pub(crate) fn from_scored(hit: &ScoredChunk) -> Self {
        let c = &hit.chunk;
        Self {
            id: c.id,
            text: c.text.clone(),
            source_file: c.source_file.clone(),
            doc_id: c.doc_id.clone(),
            page_num: c.page_num,
            chunk_idx: c.chunk_idx,
            heading_path: c.heading_path.clone(),
            heading_level: c.heading_level,
            chunk_type: c.chunk_type.clone(),
            sentence_count: c.sentence_count,
            list_type: c.list_type.clone(),
            list_length: c.list_length,
            score: hit.score,
            trust_score: hit.trust_score,
            ..Self::default()
        }
    }
}

/// Labeled pipeline stages for progressive consumers; one-shot callers
/// take the returned final list and ignore the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Keyword,
    Hybrid,
    Reranked,
}

impl QueryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStage::Keyword => "keyword",
            QueryStage::Hybrid => "hybrid",
            QueryStage::Reranked => "reranked",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    /// Query embedding produced by the caller; the core never embeds.
    pub embedding: Vec<f32>,
    pub limit: usize,
    pub rerank: bool,
    /// Caller-measured embedding latency, carried into the log row.
    pub embedding_ms: u64,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            query: query.into(),
            embedding,
            limit: DEFAULT_LIMIT,
            rerank: true,
            embedding_ms: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub cache_capacity: usize,
    pub semantic_cache_threshold: f64,
    pub experimental_mmr: bool,
    pub exploration: bool,
    pub pool_size: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_capacity: cache::DEFAULT_CAPACITY,
            semantic_cache_threshold: cache::DEFAULT_SEMANTIC_THRESHOLD,
            experimental_mmr: true,
            exploration: true,
            pool_size: None,
        }
    }
}

/// Counters for quality degradations that would otherwise be silent.
#[derive(Default)]
pub struct EngineMetrics {
    cache_hits: AtomicU64,
    dense_bypasses: AtomicU64,
    sparse_degraded: AtomicU64,
    rerank_failures: AtomicU64,
    anomalies: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub dense_bypasses: u64,
    pub sparse_degraded: u64,
    pub rerank_failures: u64,
    pub anomalies: u64,
}

impl EngineMetrics {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            dense_bypasses: self.dense_bypasses.load(Ordering::Relaxed),
            sparse_degraded: self.sparse_degraded.load(Ordering::Relaxed),
            rerank_failures: self.rerank_failures.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
        }
    }
}

pub struct RetrievalEngine {
    db_path: PathBuf,
    conn: rusqlite::Connection,
    options: EngineOptions,
    cache: QueryCache,
    pool: WorkerPool,
    latency_ema: AtomicU64,
    mmr: Mutex<MmrState>,
    reranker: Option<Arc<Mutex<RerankClient>>>,
    metrics: EngineMetrics,
}

impl RetrievalEngine {
    /// Opens (and migrates) the workspace and builds the engine.
    /// Failure to open is fatal; there is no degraded mode without a
    /// store.
    pub fn open(
        db_path: &Path,
        options: EngineOptions,
        reranker_model: Option<RerankerModel>,
    ) -> Result<Self> {
        let conn = db::open(db_path)?;
        db::migrate(&conn)?;

        let pool = match options.pool_size {
            Some(size) => WorkerPool::new(size)?,
            None => WorkerPool::with_default_size()?,
        };

        let reranker = match reranker_model {
            Some(model) => {
                let client = match load_persisted_stats(&conn, &model)? {
                    Some((mean, std)) => RerankClient::with_persisted_stats(model, mean, std),
                    None => RerankClient::new(model),
                };
                Some(Arc::new(Mutex::new(client)))
            }
            None => None,
        };

        let cache = QueryCache::new(options.cache_capacity, options.semantic_cache_threshold);

        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn,
            options,
            cache,
            pool,
            latency_ema: AtomicU64::new(LATENCY_SEED_MS.to_bits()),
            mmr: Mutex::new(MmrState::new()),
            reranker,
            metrics: EngineMetrics::default(),
        })
    }

    /// Closes the current workspace and re-opens against another file.
    /// Cached results belong to the old workspace and are dropped;
    /// rerank statistics reload from the new workspace's metadata.
    pub fn switch_workspace(&mut self, db_path: &Path) -> Result<()> {
        let conn = db::open(db_path)?;
        db::migrate(&conn)?;
        self.conn = conn;
        self.db_path = db_path.to_path_buf();
        self.cache.clear();

        if let Some(reranker) = &self.reranker {
            let mut client = reranker.lock().unwrap_or_else(PoisonError::into_inner);
            let stats = match load_persisted_stats(&self.conn, client.model())? {
                Some((mean, std)) => RollingStats::from_persisted(mean, std),
                None => RollingStats::new(),
            };
            client.set_stats(stats);
        }
        Ok(())
    }

    pub fn workspace_path(&self) -> &Path {
        &self.db_path
    }

    pub fn connection(&self) -> &rusqlite::Connection {
        &self.conn
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn latency_ema_ms(&self) -> f64 {
        f64::from_bits(self.latency_ema.load(Ordering::Relaxed))
    }

    /// Overrides the rolling latency estimate; used by operators (and
    /// tests) to force the degradation paths.
    pub fn seed_latency_ema(&self, ms: f64) {
        self.latency_ema.store(ms.to_bits(), Ordering::Relaxed);
    }

    fn observe_latency(&self, sample_ms: f64) {
        let next = (1.0 - LATENCY_ALPHA) * self.latency_ema_ms() + LATENCY_ALPHA * sample_ms;
        self.latency_ema.store(next.to_bits(), Ordering::Relaxed);
    }

    /// One-shot query; see [`Self::query_staged`].
    pub fn query(&self, req: &QueryRequest) -> Result<Vec<RetrievedChunk>> {
        self.query_staged(req, |_, _| {})
    }

    /// Runs the full pipeline, invoking `on_stage` as each labeled
    /// stage completes. The returned list is the final stage.
    pub fn query_staged<F>(&self, req: &QueryRequest, mut on_stage: F) -> Result<Vec<RetrievedChunk>>
    where
        F: FnMut(QueryStage, &[RetrievedChunk]),
    {
        let total_started = Instant::now();
        let canonical = cache::canonicalize(&req.query);

        if let Some((hit, cached)) = self.cache.lookup(&canonical, &req.embedding) {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(query = req.query.as_str(), layer = ?hit, "query cache hit");
            return Ok(cached);
        }

        let intent = intent::detect(&req.query);
        let limit = req.limit.max(1);
        let ema = self.latency_ema_ms();

        let mut retrieval_limit = limit * fusion::retrieval_multiplier(intent);
        if ema > DEGRADED_LATENCY_MS {
            retrieval_limit = limit * 3;
        }
        let bypass_dense = ema > CRITICAL_LATENCY_MS && intent != Intent::Summary;

        let search_started = Instant::now();

        let sparse_rx = {
            let path = self.db_path.clone();
            let query = req.query.clone();
            self.pool.run(move || {
                pool::with_worker_conn(&path, |conn| {
                    store::keyword_search(conn, &query, retrieval_limit)
                })
            })
        };

        let dense_rx = if bypass_dense {
            self.metrics.dense_bypasses.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(ema_ms = ema, "critical latency: dense search bypassed");
            None
        } else {
            let path = self.db_path.clone();
            let embedding = req.embedding.clone();
            Some(self.pool.run(move || {
                pool::with_worker_conn(&path, |conn| {
                    store::dense_search(conn, &embedding, retrieval_limit)
                })
            }))
        };

        let sparse = match sparse_rx.recv() {
            Ok(Ok(hits)) => hits,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "sparse search degraded to empty");
                self.metrics.sparse_degraded.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
            Err(_) => {
                tracing::warn!("sparse search worker dropped");
                self.metrics.sparse_degraded.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };

        let keyword_preview: Vec<RetrievedChunk> = sparse
            .iter()
            .enumerate()
            .map(|(i, hit)| {
                let mut entry = RetrievedChunk::from_scored(hit);
                entry.keyword_rank = i as i64 + 1;
                entry
            })
            .collect();
        on_stage(QueryStage::Keyword, &keyword_preview);

        // Dimension mismatches and storage failures from the dense
        // side surface to the caller; there is no useful degradation.
        let dense = match dense_rx {
            Some(rx) => rx
                .recv()
                .map_err(|_| anyhow!("dense search worker dropped"))??,
            None => Vec::new(),
        };
        let search_ms = search_started.elapsed().as_millis() as i64;

        let fusion_started = Instant::now();
        let stability = stability::stability_score(&self.conn, &req.query)?;

        let mut mmr_penalty = 0.0;
        let mut probe_inserted = false;

        let mut results = if bypass_dense {
            let mut sparse_only = keyword_preview;
            sparse_only.truncate(limit);
            for result in &mut sparse_only {
                result.stability = stability;
            }
            sparse_only
        } else {
            let mut fused = fusion::fuse(&dense, &sparse, intent);
            stability::apply_bias(&mut fused, stability, intent);

            let mut selected = if self.options.experimental_mmr && fused.len() > 1 {
                let (selected, penalty) = {
                    let mut state = self.mmr.lock().unwrap_or_else(PoisonError::into_inner);
                    mmr::diversify(&mut state, &fused, &req.query, intent, limit)
                };
                mmr_penalty = penalty;
                selected
            } else {
                fused.truncate(limit);
                fused
            };

            if explore::eligible(self.options.exploration, stability, intent, &selected) {
                if let Some((dense_rank, probe)) = explore::select_probe(&dense, limit, &selected) {
                    explore::insert_probe(&mut selected, probe, dense_rank, limit);
                    probe_inserted = true;
                }
            }
            selected
        };
        let fusion_ms = fusion_started.elapsed().as_millis() as i64;
        on_stage(QueryStage::Hybrid, &results);

        if results.is_empty() {
            // Nothing to rank, cache, or log.
            self.observe_latency(total_started.elapsed().as_millis() as f64);
            return Ok(results);
        }

        let mut rerank_ms = 0i64;
        if req.rerank {
            if let Some(reranker) = &self.reranker {
                let rerank_started = Instant::now();
                self.rerank_in_place(reranker, &req.query, &mut results);
                rerank_ms = rerank_started.elapsed().as_millis() as i64;
                on_stage(QueryStage::Reranked, &results);
            }
        }

        if results.is_empty() {
            // Every scored candidate was rejected as an outlier.
            self.observe_latency(total_started.elapsed().as_millis() as f64);
            return Ok(results);
        }

        let top = &results[0];
        let entry = store::LogEntry {
            query: req.query.clone(),
            semantic_rank: top.semantic_rank,
            keyword_rank: top.keyword_rank,
            final_rank: 1,
            latency_embedding: req.embedding_ms as i64,
            latency_search: search_ms,
            latency_fusion: fusion_ms,
            latency_rerank: rerank_ms,
            top_score: top.score,
            mmr_penalty,
            is_exploration: probe_inserted,
            rank_delta: (top.semantic_rank - 1).max(0),
            stability,
        };
        store::append_log(&self.conn, &entry)?;

        self.cache.insert(&canonical, &req.embedding, &results);
        self.observe_latency(total_started.elapsed().as_millis() as f64);
        Ok(results)
    }

    /// Dispatches the batch to the scoring backend on the pool and
    /// folds the outcome back in. Backend failure leaves `results`
    /// untouched.
    fn rerank_in_place(
        &self,
        reranker: &Arc<Mutex<RerankClient>>,
        query: &str,
        results: &mut Vec<RetrievedChunk>,
    ) {
        let (mean_key, std_key) = {
            let client = reranker.lock().unwrap_or_else(PoisonError::into_inner);
            (client.model().mean_key(), client.model().std_key())
        };

        let texts: Vec<String> = results
            .iter()
            .take(rerank::RERANK_BATCH_LIMIT)
            .map(|r| r.text.clone())
            .collect();

        let rx = {
            let client = Arc::clone(reranker);
            let query = query.to_string();
            self.pool.run(move || {
                client
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .score_batch(&query, &texts)
            })
        };

        match rx.recv() {
            Ok(Ok(outcome)) => {
                if outcome.anomaly != BatchAnomaly::None {
                    self.metrics.anomalies.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(anomaly = ?outcome.anomaly, "rerank calibration anomaly");
                }
                apply_rerank(results, &outcome);

                if let Err(err) = self.persist_rerank_stats(&mean_key, &std_key, &outcome) {
                    tracing::warn!(error = %err, "failed to persist rerank statistics");
                }
            }
            Ok(Err(err)) => {
                self.metrics.rerank_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "rerank failed; keeping fused order");
            }
            Err(_) => {
                self.metrics.rerank_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("rerank worker dropped; keeping fused order");
            }
        }
    }

    fn persist_rerank_stats(
        &self,
        mean_key: &str,
        std_key: &str,
        outcome: &RerankOutcome,
    ) -> Result<()> {
        store::set_metadata(&self.conn, mean_key, &outcome.mean.to_string())?;
        store::set_metadata(&self.conn, std_key, &outcome.std.to_string())?;
        Ok(())
    }

    /// Feedback entry point; exploration clicks are quarantined from
    /// the boost signal inside the store.
    pub fn record_interaction(
        &self,
        entry_id: i64,
        query: &str,
        is_exploration: bool,
    ) -> Result<()> {
        store::record_interaction(&self.conn, entry_id, query, is_exploration)
    }
}

fn load_persisted_stats(
    conn: &rusqlite::Connection,
    model: &RerankerModel,
) -> Result<Option<(f64, f64)>> {
    let mean = store::get_metadata(conn, &model.mean_key())
        .context("read persisted rerank mean")?
        .and_then(|v| v.parse::<f64>().ok());
    let std = store::get_metadata(conn, &model.std_key())
        .context("read persisted rerank std")?
        .and_then(|v| v.parse::<f64>().ok());
    Ok(mean.zip(std))
}

/// Reorders the scored head by calibrated score. Outlier-rejected
/// candidates disappear; the unscored tail keeps its fused order.
fn apply_rerank(results: &mut Vec<RetrievedChunk>, outcome: &RerankOutcome) {
    let head_len = outcome.normalized.len().min(results.len());
    let tail = results.split_off(head_len);
    let head = std::mem::take(results);

    let mut scored: Vec<RetrievedChunk> = Vec::with_capacity(head_len);
    for (i, (mut result, normalized)) in
        head.into_iter().zip(outcome.normalized.iter()).enumerate()
    {
        if let Some(score) = normalized {
            result.rerank_rank = i as i64 + 1;
            result.score = *score;
            scored.push(result);
        }
    }
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));

    results.extend(scored);
    results.extend(tail);
}
