//! # Archive Index CLI (`aix`)
//!
//! ## Usage
//!
//! ```bash
//! aix --config ./config/aix.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `aix init` | Create the SQLite database and run schema migrations |
//! | `aix ingest <path> --source <s>` | Ingest one archive file |
//! | `aix sync` | Ingest every changed archive under the archive root |
//! | `aix search "<query>"` | Search indexed records |
//! | `aix get <id>` | Show one record |
//! | `aix stats` | Summarize what is indexed |
//! | `aix check` | Verify the search index matches the content table |
//!
//! Logs go to stderr. `RUST_LOG` overrides the level chosen by `-v`/`--quiet`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use archive_index::{config, get, ingest, migrate, search, stats};

/// Full-text search over collector archives.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "aix",
    about = "Archive Index: full-text search over JSONL collector archives",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/aix.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent. Migrates older schemas in place.
    Init,

    /// Ingest a single archive file.
    Ingest {
        /// Path to a JSONL archive.
        path: PathBuf,

        /// Source that produced it: slack, calendar, drive, roster.
        #[arg(long)]
        source: String,

        /// Records per transaction (defaults to ingest.batch_size).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Re-ingest even if the file is unchanged.
        #[arg(long)]
        force: bool,
    },

    /// Ingest all archives under the archive root.
    ///
    /// Expects `<root>/<source>/...` and skips archives whose checksum
    /// matches the last ingestion.
    Sync {
        /// Archive root (defaults to ingest.archive_root).
        #[arg(long)]
        root: Option<PathBuf>,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Ignore checksums and re-ingest everything.
        #[arg(long)]
        full: bool,
    },

    /// Search indexed records.
    Search {
        /// Query text, e.g. "budget review last week in slack".
        query: String,

        /// Only records from this source.
        #[arg(long)]
        source: Option<String>,

        /// Only records on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only records on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show one record by id.
    Get { id: i64 },

    /// Show index statistics.
    Stats,

    /// Check that the search index matches the content table.
    Check,
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("archive_index={},aix={}", default, default)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            path,
            source,
            batch_size,
            force,
        } => {
            ingest::run_ingest(&cfg, &path, &source, batch_size, force).await?;
        }
        Commands::Sync {
            root,
            batch_size,
            full,
        } => {
            ingest::run_sync(&cfg, root, batch_size, full).await?;
        }
        Commands::Search {
            query,
            source,
            since,
            until,
            limit,
            json,
        } => {
            search::run_search(&cfg, &query, source, since, until, limit, json).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Check => {
            stats::run_check(&cfg).await?;
        }
    }

    Ok(())
}
