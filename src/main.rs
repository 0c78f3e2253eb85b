//! # ReportMiner CLI (`reportminer`)
//!
//! Commands for database initialization, document upload and processing,
//! status inspection, and question answering.
//!
//! ## Usage
//!
//! ```bash
//! reportminer --config ./config/reportminer.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `reportminer init` | Create the SQLite database and schema |
//! | `reportminer ingest <file>` | Upload one report and process it |
//! | `reportminer ingest-dir <dir>` | Upload and process every report in a directory |
//! | `reportminer status <id>` | Show a document's status and processing log |
//! | `reportminer reprocess <id>` | Reset a processed document and run it again |
//! | `reportminer reprocess --status <s> [--type <t>] [--limit <n>] [--dry-run]` | Requeue and run every matching document |
//! | `reportminer ask "<question>"` | Answer a question from the indexed reports |
//! | `reportminer tools` | List the built-in analysis tools |
//! | `reportminer stats` | Show corpus statistics |
//!
//! Logs go to stderr; set `RUST_LOG` (default `reportminer=info`) to adjust.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use reportminer::ingest::ReprocessFilter;
use reportminer::models::{DocumentStatus, FileType};
use reportminer::{commands, config, migrate, stats};

/// ReportMiner: report ingestion, semantic retrieval and tool-augmented
/// question answering.
#[derive(Parser)]
#[command(
    name = "reportminer",
    about = "ReportMiner: report ingestion, semantic retrieval and tool-augmented question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/reportminer.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Upload a single report and process it.
    Ingest {
        /// Path to the file.
        file: PathBuf,

        /// Override type detection (pdf, docx, xlsx, csv, txt).
        #[arg(long = "type")]
        file_type: Option<FileType>,
    },

    /// Upload every matching report under a directory and process them
    /// concurrently (`ingest.concurrency`).
    IngestDir {
        /// Directory to scan.
        dir: PathBuf,
    },

    /// Show a document's status and processing log.
    Status {
        /// Document UUID.
        id: String,
    },

    /// Process a document again. Give an id, or select documents with
    /// `--status` (and optionally `--type`); `--status pending` dispatches
    /// documents that were registered but never processed.
    Reprocess {
        /// Document UUID.
        #[arg(required_unless_present = "status", conflicts_with = "status")]
        id: Option<String>,

        /// Select documents with this status.
        #[arg(long)]
        status: Option<DocumentStatus>,

        /// Only documents of this type (pdf, docx, xlsx, csv, txt).
        #[arg(long = "type", requires = "status")]
        file_type: Option<FileType>,

        /// Maximum number of documents to select.
        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// List the selected documents without changing anything.
        #[arg(long, requires = "status")]
        dry_run: bool,
    },

    /// Answer a question from the indexed reports.
    Ask {
        /// The question.
        question: String,

        /// Allow the agent to call analysis tools.
        #[arg(long)]
        tools: bool,

        /// Number of passages to retrieve (defaults to `retrieval.top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Session identifier echoed in the response.
        #[arg(long)]
        session: Option<String>,
    },

    /// List the built-in analysis tools.
    Tools,

    /// Show corpus statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("reportminer=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Tools = cli.command {
        return commands::run_tools().await;
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, file_type } => {
            commands::run_ingest(&cfg, &file, file_type).await?;
        }
        Commands::IngestDir { dir } => {
            commands::run_ingest_dir(&cfg, &dir).await?;
        }
        Commands::Status { id } => {
            commands::run_status(&cfg, &id).await?;
        }
        Commands::Reprocess {
            id,
            status,
            file_type,
            limit,
            dry_run,
        } => match (id, status) {
            (Some(id), _) => commands::run_reprocess(&cfg, &id).await?,
            (None, Some(status)) => {
                let filter = ReprocessFilter {
                    status,
                    file_type,
                    limit,
                };
                commands::run_reprocess_batch(&cfg, &filter, dry_run).await?;
            }
            (None, None) => anyhow::bail!("give a document id or --status"),
        },
        Commands::Ask {
            question,
            tools,
            top_k,
            session,
        } => {
            commands::run_ask(&cfg, &question, tools, top_k, session).await?;
        }
        Commands::Tools => {}
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
