use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "folio",
    version,
    about = "Local document-grounded hybrid search (dense + FTS5 + RRF)"
)]
pub struct Cli {
    /// Workspace database path (defaults to `folio.sqlite`)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Config file path (defaults to `folio.toml` next to the database)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create (or migrate) the workspace database and config
    Init,
    /// Bulk-insert chunks from a JSONL file (one chunk object per line)
    Ingest(IngestArgs),
    /// Run the retrieval pipeline with a caller-provided query embedding
    Query(QueryArgs),
    /// Print one chunk, optionally with its neighbors
    Get(GetArgs),
    /// Record a click on a result (exploration clicks never boost)
    Feedback(FeedbackArgs),
    /// Workspace counts and registered dimension
    Stats(StatsArgs),
    /// Recent retrieval-log rows
    Logs(LogsArgs),
    /// Delete all indexed chunks from the workspace
    Clear(ClearArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct OutputArgs {
    /// Output JSON (machine-readable)
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// JSONL file with `text`, `embedding`, and structural metadata
    pub file: PathBuf,

    /// Clear the workspace before ingesting
    #[arg(long)]
    pub full: bool,
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    pub query: String,

    /// JSON file holding the query embedding (array of floats)
    #[arg(long = "vector-file", value_name = "FILE")]
    pub vector_file: PathBuf,

    /// Max number of results to return
    #[arg(long)]
    pub limit: Option<usize>,

    /// Enable the cross-encoder rerank stage (needs [rerank] config)
    #[arg(long)]
    pub rerank: bool,

    /// Print each pipeline stage as it completes
    #[arg(long)]
    pub stages: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct GetArgs {
    pub id: i64,

    /// Also print the previous/next chunk of the same document
    #[arg(long)]
    pub context: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct FeedbackArgs {
    pub entry_id: i64,
    pub query: String,

    /// Mark the click as an exploration-probe interaction
    #[arg(long)]
    pub exploration: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatsArgs {
    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LogsArgs {
    /// Max number of rows to print
    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ClearArgs {
    /// Confirm the deletion
    #[arg(long)]
    pub yes: bool,
}
