use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

use engram_core::config::EngramConfig;

mod commands;

/// Exit code contract: 0 success (including silent hook no-ops),
/// 1 usage or fatal error, 2 transient — skip and retry later.
pub const EXIT_OK: u8 = 0;
pub const EXIT_FATAL: u8 = 1;
pub const EXIT_TRANSIENT: u8 = 2;

#[derive(Parser)]
#[command(name = "engram", version, about = "Persistent memory consolidation engine")]
struct Cli {
    /// Path to engram.toml (default: ~/.engram/engram.toml, ENGRAM_CONFIG)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consolidation pipeline over transcripts
    #[command(subcommand)]
    Pipeline(PipelineCmd),
    /// Query and mutate the fact store
    #[command(subcommand)]
    Memory(MemoryCmd),
    /// Learned instincts
    #[command(subcommand)]
    Instinct(InstinctCmd),
    /// Host hook entry points (read their event from stdin)
    #[command(subcommand)]
    Hook(HookCmd),
}

#[derive(Subcommand)]
pub enum PipelineCmd {
    /// Process a single transcript file
    Run {
        source: PathBuf,
        /// Worker mode: longer deadlines, releases the extraction lock on exit
        #[arg(long)]
        background: bool,
    },
    /// Process every .jsonl file in a directory, sorted
    Backfill {
        dir: PathBuf,
        #[arg(long)]
        background: bool,
    },
    /// Convert a host's native session exports, then ingest them
    IngestHost {
        /// Currently supported: gemini
        host: String,
        /// Directory holding the host's session files
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Embed active facts that still lack vectors
    EmbedMissing,
}

#[derive(Subcommand)]
pub enum MemoryCmd {
    /// One-line overview of the active set
    Summary,
    /// Search the store (hybrid retrieval when --semantic is given)
    Search {
        /// Key prefix, e.g. `user.`
        #[arg(long)]
        prefix: Option<String>,
        /// Comma-separated exact keys
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,
        /// Full-text (BM25) query
        #[arg(long)]
        query: Option<String>,
        /// Semantic query — embedded, then fused with BM25
        #[arg(long)]
        semantic: Option<String>,
        /// Single exact key (shorthand for --keys)
        #[arg(long)]
        key: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
        /// Exclude inferred.* facts
        #[arg(long)]
        source_verified: bool,
        /// Require the key to contain this substring
        #[arg(long)]
        subject: Option<String>,
        /// Require facts newer than this many days
        #[arg(long)]
        max_age_days: Option<i64>,
        /// Type tag from the configured mapping (fact, pref, entity, …, all)
        #[arg(long = "type")]
        type_tag: Option<String>,
    },
    /// Store a fact directly (upsert + embed)
    Store { key: String, value: String },
    /// Close the active row for a key (history is kept)
    Forget { key: String },
    /// Render the session-start context injection block
    Context,
    /// Regenerate digest.json
    Digest,
    /// Regenerate the daily log (default: today)
    Daily {
        /// YYYY-MM-DD
        #[arg(long)]
        date: Option<chrono::NaiveDate>,
    },
    /// Regenerate a weekly snapshot (default: current ISO week)
    Weekly {
        /// ISO week, e.g. 2026-W05
        #[arg(long)]
        week: Option<String>,
    },
    /// Regenerate the rolling topic files
    Topics,
    /// Run store recovery and rebuild the FTS index offline
    Reindex,
}

#[derive(Subcommand)]
pub enum InstinctCmd {
    /// List stored instincts
    List {
        /// Filter by domain (error, tool, workflow)
        #[arg(long)]
        domain: Option<String>,
    },
    /// Show one instinct in full
    Show { key: String },
    /// Derive instincts from stored cases and patterns
    Extract {
        #[arg(long)]
        min_confidence: Option<f64>,
        /// Write the derived instincts back into the store
        #[arg(long)]
        store: bool,
        /// Mine the tool-use observation log into cases/patterns first
        #[arg(long)]
        from_observations: bool,
    },
    /// Close an instinct's active row
    Delete { key: String },
    /// Counts over cases, patterns, and instincts
    Stats,
}

#[derive(Subcommand)]
pub enum HookCmd {
    /// After-model hook: trigger background extraction at the token threshold
    TokenMonitor {
        /// Where the host keeps its session transcripts
        #[arg(long)]
        sessions_dir: Option<PathBuf>,
    },
    /// Session-end / pre-compress hook
    SessionEnd {
        #[arg(long)]
        sessions_dir: Option<PathBuf>,
    },
    /// Observe-tool-use hook: append to the observation log
    Observe,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
    /// Markdown block suitable for hook context injection
    Hook,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engram=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // help/version are not usage errors
            let code = if e.use_stderr() { EXIT_FATAL } else { EXIT_OK };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let config_path = cli.config.clone();
    let config = EngramConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        EngramConfig::default()
    });

    let result = match cli.command {
        Command::Pipeline(cmd) => commands::pipeline::run(cmd, config).await,
        Command::Memory(cmd) => commands::memory::run(cmd, config).await,
        Command::Instinct(cmd) => commands::instinct::run(cmd, config),
        Command::Hook(cmd) => commands::hook::run(cmd, config, config_path),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
