use std::fs;
use std::path::Path;

use predicates::prelude::*;
use tempfile::TempDir;

fn write_fixture(dir: &Path) -> std::path::PathBuf {
    let jsonl = dir.join("chunks.jsonl");
    let lines = [
        serde_json::json!({
            "text": "Definition: a cache is what we call a small fast memory.",
            "embedding": [0.9, 0.3, 0.0],
            "source_file": "book.pdf",
            "doc_id": "doc-a",
            "page_num": 12,
            "chunk_idx": 0,
            "model_sig": "test-embedder",
            "heading_path": "Chapter 3 > 3.2 Caches",
            "heading_level": 2,
            "chunk_type": "definition",
            "sentence_count": 1
        }),
        serde_json::json!({
            "text": "This cache is what the allocator consults first.",
            "embedding": [0.95, 0.1, 0.0],
            "source_file": "book.pdf",
            "doc_id": "doc-a",
            "page_num": 12,
            "chunk_idx": 1,
            "heading_path": "Chapter 3 > 3.2 Caches",
            "heading_level": 2,
            "chunk_type": "text",
            "sentence_count": 1
        }),
        serde_json::json!({
            "text": "Later chapters revisit what a cache is in practice.",
            "embedding": [0.5, 0.5, 0.0],
            "source_file": "book.pdf",
            "doc_id": "doc-a",
            "page_num": 40,
            "chunk_idx": 2,
            "heading_path": "Chapter 9 > 9.1 Review",
            "heading_level": 2,
            "chunk_type": "text",
            "sentence_count": 1
        }),
    ];
    let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
    fs::write(&jsonl, body).expect("write fixture");
    jsonl
}

fn write_query_vector(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("query.json");
    fs::write(&path, "[1.0, 0.0, 0.0]").expect("write vector");
    path
}

#[test]
fn init_creates_db_and_config() {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("ws.sqlite");

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized:"))
        .stdout(predicate::str::contains("schema v6"));

    assert!(db.is_file());
    assert!(dir.path().join("folio.toml").is_file());
}

#[test]
fn ingest_query_roundtrip() {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("ws.sqlite");
    let jsonl = write_fixture(dir.path());
    let vector = write_query_vector(dir.path());

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "ingest"])
        .arg(&jsonl)
        .assert()
        .success()
        .stdout(predicate::str::contains("ingested=3"));

    let output = assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "query", "what is cache"])
        .arg("--vector-file")
        .arg(&vector)
        .args(["--limit", "3", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let results: Vec<serde_json::Value> =
        serde_json::from_slice(&output).expect("parse JSON results");
    assert!(!results.is_empty());
    assert_eq!(results[0]["chunk_type"], "definition");
    assert!(results[0]["score"].as_f64().expect("score") > 0.0);
}

#[test]
fn ingest_skips_noise_and_malformed_lines() {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("ws.sqlite");
    let jsonl = dir.path().join("chunks.jsonl");
    fs::write(
        &jsonl,
        concat!(
            "{\"text\": \"A real chunk about indexing.\", \"embedding\": [1.0, 0.0]}\n",
            "{\"text\": \"ab\", \"embedding\": [0.5, 0.5]}\n",
            "not json at all\n",
        ),
    )
    .expect("write fixture");

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "ingest"])
        .arg(&jsonl)
        .assert()
        .success()
        .stdout(predicate::str::contains("ingested=1"))
        .stdout(predicate::str::contains("skipped=1"))
        .stdout(predicate::str::contains("failed=1"));
}

#[test]
fn feedback_boosts_only_non_exploration_clicks() {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("ws.sqlite");
    let jsonl = write_fixture(dir.path());

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "ingest"])
        .arg(&jsonl)
        .assert()
        .success();

    let boost_of = |db: &Path| -> f64 {
        let output = assert_cmd::cargo::cargo_bin_cmd!("folio")
            .args(["--db", db.to_str().expect("utf8"), "get", "1", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let chunk: serde_json::Value = serde_json::from_slice(&output).expect("parse chunk");
        chunk["boost_factor"].as_f64().expect("boost_factor")
    };

    assert!((boost_of(&db) - 1.0).abs() < 1e-9);

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8")])
        .args(["feedback", "1", "what is cache", "--exploration"])
        .assert()
        .success();
    assert!((boost_of(&db) - 1.0).abs() < 1e-9, "exploration click is quarantined");

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8")])
        .args(["feedback", "1", "what is cache"])
        .assert()
        .success();
    assert!((boost_of(&db) - 1.1).abs() < 1e-9);
}

#[test]
fn stats_and_logs_report_workspace_state() {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("ws.sqlite");
    let jsonl = write_fixture(dir.path());
    let vector = write_query_vector(dir.path());

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "ingest"])
        .arg(&jsonl)
        .assert()
        .success();

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "query", "what is cache"])
        .arg("--vector-file")
        .arg(&vector)
        .assert()
        .success();

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("chunks=3"))
        .stdout(predicate::str::contains("dimension=3"))
        .stdout(predicate::str::contains("logs=1"));

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "logs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("what is cache"));
}

#[test]
fn clear_requires_confirmation() {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("ws.sqlite");
    let jsonl = write_fixture(dir.path());

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "ingest"])
        .arg(&jsonl)
        .assert()
        .success();

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "clear"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "clear", "--yes"])
        .assert()
        .success();

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("chunks=0"));
}

#[test]
fn query_with_mismatched_vector_reports_misconfiguration() {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("ws.sqlite");
    let jsonl = write_fixture(dir.path());

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "ingest"])
        .arg(&jsonl)
        .assert()
        .success();

    let vector = dir.path().join("bad.json");
    fs::write(&vector, "[1.0, 0.0]").expect("write vector");

    assert_cmd::cargo::cargo_bin_cmd!("folio")
        .args(["--db", db.to_str().expect("utf8"), "query", "anything"])
        .arg("--vector-file")
        .arg(&vector)
        .assert()
        .failure()
        .stderr(predicate::str::contains("dimension mismatch"));
}
