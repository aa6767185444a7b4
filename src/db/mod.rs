use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result};
use rusqlite::Connection;

const LATEST_SCHEMA_VERSION: i64 = 6;

pub fn open(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
    }

    let conn = Connection::open(db_path).with_context(|| format!("open {}", db_path.display()))?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")
        .context("set PRAGMA temp_store=MEMORY")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("set PRAGMA foreign_keys=ON")?;
    Ok(())
}

/// Applies every migration above the stored `user_version`, in order.
/// Migrations are additive only, so replaying against a half-migrated
/// workspace is safe.
pub fn migrate(conn: &Connection) -> Result<()> {
    let current = schema_version(conn)?;

    if current < 1 {
        migrate_v1(conn)?;
        set_schema_version(conn, 1)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
        set_schema_version(conn, 2)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
        set_schema_version(conn, 3)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
        set_schema_version(conn, 4)?;
    }
    if current < 5 {
        migrate_v5(conn)?;
        set_schema_version(conn, 5)?;
    }
    if current < 6 {
        migrate_v6(conn)?;
        set_schema_version(conn, 6)?;
    }

    let after = schema_version(conn)?;
    if after != LATEST_SCHEMA_VERSION {
        tracing::warn!(version = after, "unexpected schema version after migration");
    }
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<i64> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.pragma_update(None, "user_version", version)
        .with_context(|| format!("set PRAGMA user_version={version}"))?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS embeddings(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_file TEXT,
  text_chunk TEXT,
  vector_blob BLOB
);
"#,
    )
    .context("migrate v1")?;
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
ALTER TABLE embeddings ADD COLUMN doc_id TEXT;
ALTER TABLE embeddings ADD COLUMN page_num INTEGER;
ALTER TABLE embeddings ADD COLUMN model_sig TEXT;
ALTER TABLE embeddings ADD COLUMN created_at INTEGER;
"#,
    )
    .context("migrate v2")?;
    Ok(())
}

fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
ALTER TABLE embeddings ADD COLUMN chunk_idx INTEGER;
ALTER TABLE embeddings ADD COLUMN model_dim INTEGER;

CREATE VIRTUAL TABLE IF NOT EXISTS embeddings_fts USING fts5(
  text_chunk,
  content='embeddings',
  content_rowid='id'
);

CREATE TABLE IF NOT EXISTS retrieval_logs(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  query TEXT,
  semantic_rank INTEGER,
  keyword_rank INTEGER,
  final_rank INTEGER,
  latency_embedding INTEGER,
  latency_search INTEGER,
  latency_fusion INTEGER,
  latency_rerank INTEGER,
  top_score REAL,
  created_at INTEGER
);
"#,
    )
    .context("migrate v3")?;
    Ok(())
}

fn migrate_v4(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
ALTER TABLE embeddings ADD COLUMN heading_path TEXT;
ALTER TABLE embeddings ADD COLUMN heading_level INTEGER DEFAULT 0;
ALTER TABLE embeddings ADD COLUMN chunk_type TEXT DEFAULT 'text';
"#,
    )
    .context("migrate v4")?;
    Ok(())
}

fn migrate_v5(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
ALTER TABLE embeddings ADD COLUMN sentence_count INTEGER DEFAULT 0;
ALTER TABLE embeddings ADD COLUMN list_type TEXT;
ALTER TABLE embeddings ADD COLUMN list_length INTEGER DEFAULT 0;
"#,
    )
    .context("migrate v5")?;
    Ok(())
}

fn migrate_v6(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
ALTER TABLE embeddings ADD COLUMN boost_factor REAL DEFAULT 1.0;

CREATE TABLE IF NOT EXISTS workspace_metadata(
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

ALTER TABLE retrieval_logs ADD COLUMN mmr_penalty REAL;
ALTER TABLE retrieval_logs ADD COLUMN is_exploration INTEGER DEFAULT 0;
ALTER TABLE retrieval_logs ADD COLUMN rank_delta INTEGER;
ALTER TABLE retrieval_logs ADD COLUMN stability REAL;
"#,
    )
    .context("migrate v6")?;
    Ok(())
}

pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs() as i64
}

pub fn check_fts5_available() -> Result<()> {
    let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
    conn.execute_batch(
        r#"
CREATE VIRTUAL TABLE t USING fts5(content);
INSERT INTO t(content) VALUES('hello');
SELECT rowid FROM t WHERE t MATCH 'hello';
"#,
    )
    .context("FTS5 check failed")?;
    Ok(())
}
