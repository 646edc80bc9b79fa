//! # Crawl Harness CLI (`crawl`)
//!
//! The `crawl` binary drives crawl sessions and queries what they produced.
//!
//! ## Usage
//!
//! ```bash
//! crawl --config ./config/crawl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crawl init` | Create the SQLite database and seed categorization rules |
//! | `crawl start <seed>...` | Run a crawl session until the frontier drains |
//! | `crawl status <id>` | Show one session's status and counters |
//! | `crawl sessions` | List recent sessions |
//! | `crawl bits` | Query learning bits by category, type, importance |
//! | `crawl page <url>` | Show a stored page |
//! | `crawl frontier` | Show frontier entries and status counts |
//! | `crawl related <hash>` | Show relationships of a learning bit |
//!
//! Ctrl-C during `crawl start` stops the session: no new URLs are taken,
//! in-flight fetches finish, and counters are flushed.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crawl_harness::config::{self, Config};
use crawl_harness::crawler::Crawler;
use crawl_harness::models::{BitFilters, ContentType, FrontierStatus};
use crawl_harness::{logging, query};

/// Crawl Harness CLI: polite, resumable crawling into deduplicated,
/// categorized learning bits.
///
/// All commands accept `--config`, a TOML file. See
/// `config/crawl.example.toml` for every option.
#[derive(Parser)]
#[command(
    name = "crawl",
    about = "Crawl Harness: crawl documentation sites into categorized learning bits",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/crawl.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and built-in categorization rules.
    ///
    /// Idempotent: running it again keeps existing data.
    Init,

    /// Start a crawl session and run it to completion.
    Start {
        /// Seed URLs (depth 0).
        #[arg(required = true)]
        seeds: Vec<String>,

        /// Session name.
        #[arg(long, default_value = "crawl")]
        name: String,
    },

    /// Show a session's status and counters.
    Status {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// List recent sessions.
    Sessions {
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Query learning bits, most important first.
    Bits {
        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        subcategory: Option<String>,

        /// concept, example, definition, procedure, warning or tip.
        #[arg(long)]
        content_type: Option<ContentType>,

        #[arg(long)]
        min_importance: Option<f64>,

        #[arg(long, default_value = "20")]
        limit: i64,

        #[arg(long)]
        json: bool,
    },

    /// Show a stored page by URL.
    Page {
        url: String,

        #[arg(long)]
        json: bool,
    },

    /// Show frontier entries.
    Frontier {
        /// pending, in_progress, completed, failed or skipped.
        #[arg(long)]
        status: Option<FrontierStatus>,

        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Show the relationships of a learning bit.
    Related {
        /// Content hash of the bit.
        hash: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let crawler = Crawler::open(cfg).await?;
            crawler.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Start { seeds, name } => {
            run_start(cfg, &name, &seeds).await?;
        }
        Commands::Status { id, json } => {
            let crawler = Crawler::open(cfg).await?;
            query::run_status(&crawler, &id, json).await?;
        }
        Commands::Sessions { limit } => {
            let crawler = Crawler::open(cfg).await?;
            query::run_sessions(&crawler, limit).await?;
        }
        Commands::Bits {
            category,
            subcategory,
            content_type,
            min_importance,
            limit,
            json,
        } => {
            let crawler = Crawler::open(cfg).await?;
            let filters = BitFilters {
                category,
                subcategory,
                content_type,
                min_importance,
                limit: Some(limit),
            };
            query::run_bits(&crawler, &filters, json).await?;
        }
        Commands::Page { url, json } => {
            let crawler = Crawler::open(cfg).await?;
            query::run_page(&crawler, &url, json).await?;
        }
        Commands::Frontier { status, limit } => {
            let crawler = Crawler::open(cfg).await?;
            query::run_frontier(&crawler, status, limit).await?;
        }
        Commands::Related { hash } => {
            let crawler = Crawler::open(cfg).await?;
            query::run_related(&crawler, &hash).await?;
        }
    }

    Ok(())
}

async fn run_start(cfg: Config, name: &str, seeds: &[String]) -> Result<()> {
    let crawler = Crawler::open(cfg).await?;
    let run = crawler.start_session(name, seeds).await?;
    let id = run.id.clone();
    eprintln!("session {} started", id);

    let mut wait = Box::pin(run.wait());
    let session = tokio::select! {
        finished = &mut wait => finished?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("stopping session {} (waiting for in-flight fetches)", id);
            crawler.stop_session(&id).await?;
            wait.await?
        }
    };

    query::print_session(&session);
    crawler.close().await;
    Ok(())
}
