mod cli;

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use folio::{config, db, store};
use folio::{NewChunk, QueryRequest, RetrievalEngine, RetrievedChunk};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    init_tracing(cli.verbose);

    let db_path = cli.db.unwrap_or_else(|| PathBuf::from("folio.sqlite"));
    let config_path = cli
        .config
        .unwrap_or_else(|| db_path.with_file_name("folio.toml"));

    match cli.command {
        cli::Command::Init => run_init(&db_path, &config_path),
        cli::Command::Ingest(args) => run_ingest(&db_path, args),
        cli::Command::Query(args) => run_query(&db_path, &config_path, args),
        cli::Command::Get(args) => run_get(&db_path, args),
        cli::Command::Feedback(args) => run_feedback(&db_path, args),
        cli::Command::Stats(args) => run_stats(&db_path, args),
        cli::Command::Logs(args) => run_logs(&db_path, args),
        cli::Command::Clear(args) => run_clear(&db_path, args),
    }
}

fn run_init(db_path: &std::path::Path, config_path: &std::path::Path) -> Result<()> {
    db::check_fts5_available()?;
    config::ensure_config(config_path)?;
    let conn = db::open(db_path)?;
    db::migrate(&conn)?;
    println!(
        "Initialized: {} (schema v{})",
        db_path.display(),
        db::schema_version(&conn)?
    );
    Ok(())
}

fn run_ingest(db_path: &std::path::Path, args: cli::IngestArgs) -> Result<()> {
    let started = Instant::now();
    let mut conn = db::open(db_path)?;
    db::migrate(&conn)?;

    if args.full {
        store::clear(&conn)?;
    }

    let body = fs::read_to_string(&args.file)
        .with_context(|| format!("read {}", args.file.display()))?;
    let lines: Vec<&str> = body.lines().filter(|l| !l.trim().is_empty()).collect();

    let pb = ProgressBar::new(lines.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .context("progress template")?,
    );

    let mut ingested = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for line in lines {
        pb.inc(1);
        let chunk: NewChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed chunk line");
                failed += 1;
                continue;
            }
        };

        // Extremely short chunks are parsing noise, not content.
        if chunk.text.trim().len() <= 3 {
            skipped += 1;
            continue;
        }

        if store::insert_chunk(&mut conn, &chunk)? {
            ingested += 1;
        } else {
            failed += 1;
        }
    }
    pb.finish_and_clear();

    println!(
        "ingested={ingested} skipped={skipped} failed={failed} total={} duration_ms={}",
        store::count(&conn)?,
        started.elapsed().as_millis()
    );
    Ok(())
}

fn run_query(
    db_path: &std::path::Path,
    config_path: &std::path::Path,
    args: cli::QueryArgs,
) -> Result<()> {
    let cfg = config::load_or_default(config_path)?;

    let embed_started = Instant::now();
    let vector_body = fs::read_to_string(&args.vector_file)
        .with_context(|| format!("read {}", args.vector_file.display()))?;
    let embedding: Vec<f32> =
        serde_json::from_str(&vector_body).context("parse query embedding JSON array")?;
    let embedding_ms = embed_started.elapsed().as_millis() as u64;

    let reranker = if args.rerank {
        let model = cfg.reranker_model();
        if model.is_none() {
            return Err(anyhow!(
                "--rerank requires [rerank] enabled=true and a known engine in the config"
            ));
        }
        model
    } else {
        None
    };

    let engine = RetrievalEngine::open(db_path, cfg.engine_options(), reranker)?;

    let mut req = QueryRequest::new(args.query.clone(), embedding);
    req.limit = args.limit.unwrap_or(cfg.engine.limit);
    req.rerank = args.rerank;
    req.embedding_ms = embedding_ms;

    let results = if args.stages {
        engine.query_staged(&req, |stage, partial| {
            eprintln!("-- stage {} ({} results)", stage.as_str(), partial.len());
        })?
    } else {
        engine.query(&req)?
    };

    print_results(&results, args.output.json)
}

fn run_get(db_path: &std::path::Path, args: cli::GetArgs) -> Result<()> {
    let conn = db::open(db_path)?;
    db::migrate(&conn)?;

    let chunk = store::get_chunk(&conn, args.id)?
        .ok_or_else(|| anyhow!("no chunk with id {}", args.id))?;

    if args.output.json {
        println!("{}", serde_json::to_string_pretty(&chunk)?);
        return Ok(());
    }

    if args.context {
        if let Some(prev) = store::neighbor_text(&conn, &chunk.doc_id, chunk.chunk_idx, -1)? {
            println!("[prev] {prev}");
            println!("{}", "-".repeat(50));
        }
    }
    println!(
        "#{} {} p.{} — {} • {}",
        chunk.id,
        chunk.source_file,
        chunk.page_num,
        chunk.heading_path,
        chunk.chunk_type.to_uppercase()
    );
    println!("{}", chunk.text);
    if args.context {
        if let Some(next) = store::neighbor_text(&conn, &chunk.doc_id, chunk.chunk_idx, 1)? {
            println!("{}", "-".repeat(50));
            println!("[next] {next}");
        }
    }
    Ok(())
}

fn run_feedback(db_path: &std::path::Path, args: cli::FeedbackArgs) -> Result<()> {
    let conn = db::open(db_path)?;
    db::migrate(&conn)?;
    store::record_interaction(&conn, args.entry_id, &args.query, args.exploration)?;
    println!(
        "recorded interaction entry={} exploration={}",
        args.entry_id, args.exploration
    );
    Ok(())
}

fn run_stats(db_path: &std::path::Path, args: cli::StatsArgs) -> Result<()> {
    let conn = db::open(db_path)?;
    db::migrate(&conn)?;

    let chunks = store::count(&conn)?;
    let logs = store::log_count(&conn)?;
    let dimension = store::registered_dimension(&conn)?;
    let schema = db::schema_version(&conn)?;

    if args.output.json {
        let stats = serde_json::json!({
            "chunks": chunks,
            "logs": logs,
            "embedding_dimension": dimension,
            "schema_version": schema,
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "chunks={chunks} logs={logs} dimension={} schema_version={schema}",
            dimension.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn run_logs(db_path: &std::path::Path, args: cli::LogsArgs) -> Result<()> {
    let conn = db::open(db_path)?;
    db::migrate(&conn)?;
    let rows = store::recent_logs(&conn, args.limit)?;

    if args.output.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for row in rows {
        println!(
            "#{} {:?} final_rank={} top_score={:.4} mmr_penalty={:.3} exploration={} stability={}",
            row.id,
            row.query,
            row.final_rank,
            row.top_score,
            row.mmr_penalty,
            row.is_exploration,
            row.stability
                .map(|s| format!("{s:.2}"))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

fn run_clear(db_path: &std::path::Path, args: cli::ClearArgs) -> Result<()> {
    if !args.yes {
        return Err(anyhow!("refusing to clear without --yes"));
    }
    let conn = db::open(db_path)?;
    db::migrate(&conn)?;
    store::clear(&conn)?;
    println!("cleared: {}", db_path.display());
    Ok(())
}

fn print_results(results: &[RetrievedChunk], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("no results");
        return Ok(());
    }

    for (i, r) in results.iter().enumerate() {
        let mut tags = r.chunk_type.to_uppercase();
        if r.is_exploration {
            tags.push_str(" • EXPLORATION");
        }
        if r.rerank_rank > 0 {
            tags.push_str(" • RERANKED");
        }
        println!(
            "{}. [{:.4}] {} p.{} — {} • {}",
            i + 1,
            r.score,
            r.source_file,
            r.page_num,
            r.heading_path,
            tags
        );
        println!("   {}", snippet(&r.text));
    }
    Ok(())
}

fn snippet(text: &str) -> String {
    let mut s = String::new();
    for line in text.lines() {
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        if !s.is_empty() {
            s.push(' ');
        }
        s.push_str(t);
        if s.len() > 200 {
            truncate_to_char_boundary(&mut s, 200);
            s.push('…');
            break;
        }
    }
    s
}

fn truncate_to_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut idx = max_bytes.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    s.truncate(idx);
}

fn init_tracing(verbosity: u8) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Layer};

    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(fmt).init();
}
