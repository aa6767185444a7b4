//! Persistent workspace store: chunk rows, the FTS5 inverted index,
//! workspace metadata, interaction boosts, and the retrieval log.
//!
//! All helpers take a borrowed [`rusqlite::Connection`]; the retrieval
//! engine owns the primary (writer) handle and worker threads open
//! their own read handles against the same file.

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::vector;

pub const META_EMBEDDING_DIMENSION: &str = "embedding_dimension";

/// Seconds over which the recency factor decays to its 0.5 floor.
const RECENCY_WINDOW_SECS: f64 = 30.0 * 86_400.0;

/// Placeholder score for keyword-only hits; only meaningful to fusion.
pub const KEYWORD_PLACEHOLDER_SCORE: f64 = 0.5;

/// Raised when a vector's dimension disagrees with the workspace's
/// registered `embedding_dimension`. Callers present this as a
/// misconfiguration, not a bug.
#[derive(Debug)]
pub struct DimensionMismatch {
    pub expected: usize,
    pub got: usize,
}

impl std::fmt::Display for DimensionMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "embedding dimension mismatch: workspace requires {}, got {}",
            self.expected, self.got
        )
    }
}

impl std::error::Error for DimensionMismatch {}

/// A chunk as produced by the ingestion collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChunk {
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub source_file: String,
    #[serde(default)]
    pub doc_id: String,
    #[serde(default)]
    pub page_num: i64,
    #[serde(default)]
    pub chunk_idx: i64,
    #[serde(default)]
    pub model_sig: String,
    #[serde(default)]
    pub heading_path: String,
    #[serde(default)]
    pub heading_level: i64,
    #[serde(default = "default_chunk_type")]
    pub chunk_type: String,
    #[serde(default)]
    pub sentence_count: i64,
    #[serde(default)]
    pub list_type: Option<String>,
    #[serde(default)]
    pub list_length: i64,
}

fn default_chunk_type() -> String {
    "text".to_string()
}

/// A stored chunk row with its structural metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub source_file: String,
    pub text: String,
    pub doc_id: String,
    pub page_num: i64,
    pub chunk_idx: i64,
    pub model_sig: String,
    pub model_dim: i64,
    pub heading_path: String,
    pub heading_level: i64,
    pub chunk_type: String,
    pub sentence_count: i64,
    pub list_type: Option<String>,
    pub list_length: i64,
    pub created_at: i64,
    pub boost_factor: f64,
}

/// A chunk plus the scores a search stage attached to it.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: ChunkRecord,
    /// Cosine similarity for dense hits; 0.5 placeholder for keyword hits.
    pub score: f64,
    /// `boost_factor × recency`; populated by dense search only.
    pub trust_score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LogEntry {
    pub query: String,
    pub semantic_rank: i64,
    pub keyword_rank: i64,
    pub final_rank: i64,
    pub latency_embedding: i64,
    pub latency_search: i64,
    pub latency_fusion: i64,
    pub latency_rerank: i64,
    pub top_score: f64,
    pub mmr_penalty: f64,
    pub is_exploration: bool,
    pub rank_delta: i64,
    pub stability: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRow {
    pub id: i64,
    pub query: String,
    pub final_rank: i64,
    pub top_score: f64,
    pub mmr_penalty: f64,
    pub is_exploration: bool,
    pub rank_delta: Option<i64>,
    pub stability: Option<f64>,
    pub created_at: i64,
}

pub fn registered_dimension(conn: &Connection) -> Result<Option<usize>> {
    let value = get_metadata(conn, META_EMBEDDING_DIMENSION)?;
    Ok(value.and_then(|v| v.parse::<usize>().ok()))
}

/// Inserts a chunk row and its FTS row atomically.
///
/// A dimension disagreement with the registered workspace dimension is
/// the guardrail error and fails hard. Any other failure is
/// storage-recoverable: it logs and returns `Ok(false)` so a bulk
/// ingest keeps going.
pub fn insert_chunk(conn: &mut Connection, chunk: &NewChunk) -> Result<bool> {
    match registered_dimension(conn)? {
        Some(dim) if dim != chunk.embedding.len() => {
            return Err(DimensionMismatch {
                expected: dim,
                got: chunk.embedding.len(),
            }
            .into());
        }
        Some(_) => {}
        None => {
            set_metadata(
                conn,
                META_EMBEDDING_DIMENSION,
                &chunk.embedding.len().to_string(),
            )?;
        }
    }

    match insert_chunk_tx(conn, chunk) {
        Ok(()) => Ok(true),
        Err(err) => {
            tracing::warn!(
                source_file = chunk.source_file.as_str(),
                chunk_idx = chunk.chunk_idx,
                error = %err,
                "chunk insert failed"
            );
            Ok(false)
        }
    }
}

fn insert_chunk_tx(conn: &mut Connection, chunk: &NewChunk) -> Result<()> {
    let tx = conn.transaction().context("begin insert transaction")?;

    tx.execute(
        r#"
INSERT INTO embeddings(
  source_file, text_chunk, vector_blob, doc_id, page_num, chunk_idx,
  model_sig, model_dim, heading_path, heading_level, chunk_type,
  sentence_count, list_type, list_length, created_at, boost_factor
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 1.0)
"#,
        rusqlite::params![
            chunk.source_file,
            chunk.text,
            vector::vector_to_blob(&chunk.embedding),
            chunk.doc_id,
            chunk.page_num,
            chunk.chunk_idx,
            chunk.model_sig,
            chunk.embedding.len() as i64,
            chunk.heading_path,
            chunk.heading_level,
            chunk.chunk_type,
            chunk.sentence_count,
            chunk.list_type,
            chunk.list_length,
            db::now_unix(),
        ],
    )
    .context("insert embeddings row")?;

    let row_id = tx.last_insert_rowid();

    // Index heading words alongside the chunk text so structural
    // context influences keyword matches without polluting the stored
    // chunk text.
    let indexed_text = format!(
        "[CONTEXT: {}] {}",
        normalize_heading_tokens(&chunk.heading_path),
        chunk.text
    );
    tx.execute(
        "INSERT INTO embeddings_fts(rowid, text_chunk) VALUES (?1, ?2)",
        rusqlite::params![row_id, indexed_text],
    )
    .context("insert embeddings_fts row")?;

    tx.commit().context("commit insert transaction")?;
    Ok(())
}

fn normalize_heading_tokens(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect()
}

const CHUNK_COLUMNS: &str = "id, source_file, text_chunk, doc_id, page_num, chunk_idx, \
     model_sig, model_dim, heading_path, heading_level, chunk_type, \
     sentence_count, list_type, list_length, created_at, boost_factor";

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: row.get(0)?,
        source_file: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        text: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        doc_id: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        page_num: row.get::<_, Option<i64>>(4)?.unwrap_or_default(),
        chunk_idx: row.get::<_, Option<i64>>(5)?.unwrap_or_default(),
        model_sig: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        model_dim: row.get::<_, Option<i64>>(7)?.unwrap_or_default(),
        heading_path: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        heading_level: row.get::<_, Option<i64>>(9)?.unwrap_or_default(),
        chunk_type: row
            .get::<_, Option<String>>(10)?
            .unwrap_or_else(|| "text".to_string()),
        sentence_count: row.get::<_, Option<i64>>(11)?.unwrap_or_default(),
        list_type: row.get(12)?,
        list_length: row.get::<_, Option<i64>>(13)?.unwrap_or_default(),
        created_at: row.get::<_, Option<i64>>(14)?.unwrap_or_default(),
        boost_factor: row.get::<_, Option<f64>>(15)?.unwrap_or(1.0),
    })
}

pub fn get_chunk(conn: &Connection, id: i64) -> Result<Option<ChunkRecord>> {
    let sql = format!("SELECT {CHUNK_COLUMNS} FROM embeddings WHERE id=?1 LIMIT 1");
    let chunk = conn
        .query_row(&sql, [id], chunk_from_row)
        .optional()
        .context("read chunk by id")?;
    Ok(chunk)
}

/// Text of the chunk at `chunk_idx + offset` within the same document.
pub fn neighbor_text(
    conn: &Connection,
    doc_id: &str,
    chunk_idx: i64,
    offset: i64,
) -> Result<Option<String>> {
    let text: Option<String> = conn
        .query_row(
            "SELECT text_chunk FROM embeddings WHERE doc_id=?1 AND chunk_idx=?2 LIMIT 1",
            rusqlite::params![doc_id, chunk_idx + offset],
            |row| row.get(0),
        )
        .optional()
        .context("read neighbor chunk")?;
    Ok(text)
}

/// Brute-force dense search: full scan, cosine similarity, top-K.
///
/// Every returned candidate carries a trust score of `boost_factor ×
/// recency`, where recency decays linearly to a floor of 0.5 over 30
/// days. Refuses to run when the query dimension disagrees with the
/// registered workspace dimension.
pub fn dense_search(conn: &Connection, query_vec: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
    match registered_dimension(conn)? {
        Some(dim) if dim != query_vec.len() => {
            return Err(DimensionMismatch {
                expected: dim,
                got: query_vec.len(),
            }
            .into());
        }
        Some(_) => {}
        None => return Ok(Vec::new()),
    }

    let now = db::now_unix();
    let sql = format!("SELECT {CHUNK_COLUMNS}, vector_blob FROM embeddings");
    let mut stmt = conn.prepare(&sql).context("prepare dense scan")?;

    let rows = stmt
        .query_map([], |row| {
            let chunk = chunk_from_row(row)?;
            let blob: Vec<u8> = row.get(16)?;
            Ok((chunk, blob))
        })
        .context("run dense scan")?;

    let mut candidates = Vec::new();
    for row in rows {
        let (chunk, blob) = row.context("read dense scan row")?;
        let embedding = vector::blob_to_vector(&blob);
        let score = vector::cosine_similarity(query_vec, &embedding);
        let trust_score = chunk.boost_factor * recency_factor(now, chunk.created_at);
        candidates.push(ScoredChunk {
            chunk,
            score,
            trust_score,
        });
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(k);
    Ok(candidates)
}

fn recency_factor(now: i64, created_at: i64) -> f64 {
    let age_secs = (now - created_at).max(0) as f64;
    (1.0 - age_secs / RECENCY_WINDOW_SECS).max(0.5)
}

/// Keyword search through the FTS5 index.
///
/// The query string is handed to FTS5 verbatim; syntax errors from
/// user-typed operators degrade to an empty result set rather than an
/// error at the API boundary.
pub fn keyword_search(conn: &Connection, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {CHUNK_COLUMNS} FROM embeddings \
         WHERE id IN (SELECT rowid FROM embeddings_fts WHERE embeddings_fts MATCH ?1) \
         LIMIT ?2"
    );

    let mut stmt = match conn.prepare(&sql) {
        Ok(stmt) => stmt,
        Err(err) => {
            tracing::warn!(error = %err, "keyword search prepare failed");
            return Ok(Vec::new());
        }
    };

    let rows = match stmt.query_map(rusqlite::params![query, limit as i64], chunk_from_row) {
        Ok(rows) => rows,
        Err(err) => {
            // Malformed FTS syntax from user input lands here.
            tracing::warn!(error = %err, "keyword search query failed");
            return Ok(Vec::new());
        }
    };

    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(chunk) => out.push(ScoredChunk {
                chunk,
                score: KEYWORD_PLACEHOLDER_SCORE,
                trust_score: 0.0,
            }),
            Err(err) => {
                tracing::warn!(error = %err, "keyword search row failed");
                return Ok(Vec::new());
            }
        }
    }
    Ok(out)
}

pub fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM workspace_metadata WHERE key=?1 LIMIT 1",
            [key],
            |row| row.get(0),
        )
        .optional()
        .context("read workspace_metadata")?;
    Ok(value)
}

pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO workspace_metadata(key, value) VALUES(?1, ?2)
ON CONFLICT(key) DO UPDATE SET value=excluded.value
"#,
        rusqlite::params![key, value],
    )
    .context("upsert workspace_metadata")?;
    Ok(())
}

pub fn boost_entry(conn: &Connection, id: i64, delta: f64) -> Result<()> {
    conn.execute(
        "UPDATE embeddings SET boost_factor = boost_factor + ?1 WHERE id=?2",
        rusqlite::params![delta, id],
    )
    .context("bump boost_factor")?;
    Ok(())
}

pub fn append_log(conn: &Connection, entry: &LogEntry) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO retrieval_logs(
  query, semantic_rank, keyword_rank, final_rank,
  latency_embedding, latency_search, latency_fusion, latency_rerank,
  top_score, mmr_penalty, is_exploration, rank_delta, stability, created_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
"#,
        rusqlite::params![
            entry.query,
            entry.semantic_rank,
            entry.keyword_rank,
            entry.final_rank,
            entry.latency_embedding,
            entry.latency_search,
            entry.latency_fusion,
            entry.latency_rerank,
            entry.top_score,
            entry.mmr_penalty,
            entry.is_exploration as i64,
            entry.rank_delta,
            entry.stability,
            db::now_unix(),
        ],
    )
    .context("append retrieval log")?;
    Ok(())
}

/// `rank_delta` values for the most recent non-exploration logs of the
/// exact query, newest first. NULLs from pre-v6 rows survive as `None`.
pub fn recent_rank_deltas(
    conn: &Connection,
    query: &str,
    limit: usize,
) -> Result<Vec<Option<i64>>> {
    let mut stmt = conn
        .prepare(
            r#"
SELECT rank_delta FROM retrieval_logs
WHERE query=?1 AND (is_exploration IS NULL OR is_exploration=0)
ORDER BY id DESC
LIMIT ?2
"#,
        )
        .context("prepare rank_delta history")?;

    let rows = stmt
        .query_map(rusqlite::params![query, limit as i64], |row| row.get(0))
        .context("query rank_delta history")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read rank_delta row")?);
    }
    Ok(out)
}

pub fn recent_logs(conn: &Connection, limit: usize) -> Result<Vec<LogRow>> {
    let mut stmt = conn
        .prepare(
            r#"
SELECT id, query, final_rank, top_score, mmr_penalty, is_exploration,
       rank_delta, stability, created_at
FROM retrieval_logs
ORDER BY id DESC
LIMIT ?1
"#,
        )
        .context("prepare recent logs")?;

    let rows = stmt
        .query_map([limit as i64], |row| {
            Ok(LogRow {
                id: row.get(0)?,
                query: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                final_rank: row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
                top_score: row.get::<_, Option<f64>>(3)?.unwrap_or_default(),
                mmr_penalty: row.get::<_, Option<f64>>(4)?.unwrap_or_default(),
                is_exploration: row.get::<_, Option<i64>>(5)?.unwrap_or_default() != 0,
                rank_delta: row.get(6)?,
                stability: row.get(7)?,
                created_at: row.get::<_, Option<i64>>(8)?.unwrap_or_default(),
            })
        })
        .context("query recent logs")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read log row")?);
    }
    Ok(out)
}

pub fn log_count(conn: &Connection) -> Result<usize> {
    let n: i64 = conn
        .query_row("SELECT COUNT(*) FROM retrieval_logs", [], |row| row.get(0))
        .context("count retrieval logs")?;
    Ok(n as usize)
}

pub fn count(conn: &Connection) -> Result<usize> {
    let n: i64 = conn
        .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
        .context("count chunks")?;
    Ok(n as usize)
}

/// Workspace clear: removes chunk rows and the FTS index. Retrieval
/// logs and metadata survive.
pub fn clear(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM embeddings", [])
        .context("delete embeddings")?;
    conn.execute(
        "INSERT INTO embeddings_fts(embeddings_fts) VALUES('delete-all')",
        [],
    )
    .context("clear embeddings_fts")?;
    Ok(())
}

/// Feedback entry point: appends an interaction row and, iff the click
/// was not on an exploration probe, bumps the chunk's boost factor.
pub fn record_interaction(
    conn: &Connection,
    entry_id: i64,
    query: &str,
    is_exploration: bool,
) -> Result<()> {
    let entry = LogEntry {
        query: query.to_string(),
        final_rank: 1,
        is_exploration,
        stability: 1.0,
        ..LogEntry::default()
    };
    append_log(conn, &entry)?;

    if !is_exploration {
        boost_entry(conn, entry_id, 0.1)?;
    }
    Ok(())
}
