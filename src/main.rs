//! # Knowledge Harness CLI (`kh`)
//!
//! Tenant-scoped ingestion and retrieval from the command line.
//!
//! ## Usage
//!
//! ```bash
//! kh --config ./config/kh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kh init` | Create the SQLite database and run schema migrations |
//! | `kh scan <tenant> <root>` | Show what an ingestion run would do |
//! | `kh ingest <tenant> <root>` | Ingest every new, changed or unfinished file |
//! | `kh ingest-file <tenant> <path>` | Ingest a single file |
//! | `kh cleanup <tenant> <status_id>` | Reset a document's failed sections |
//! | `kh report <tenant>` | List failed and stale sections |
//! | `kh status <tenant>` | List ingestion status rows |
//! | `kh get <tenant> <document_id>` | Print a document's chunks |
//! | `kh search <tenant> "<query>"` | Query the knowledge store |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); command output goes to
//! stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use knowledge_harness::config::{self, Config};
use knowledge_harness::db;
use knowledge_harness::ingest::{CancellationFlag, Pipeline};
use knowledge_harness::migrate;
use knowledge_harness::models::TenantId;
use knowledge_harness::search::{RetrievalEngine, SearchMode};
use knowledge_harness::store::KnowledgeStore;

#[derive(Parser)]
#[command(
    name = "kh",
    about = "Knowledge Harness: tenant-isolated incremental ingestion and hybrid retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/kh.toml`. Database, provider, chunking and
    /// retrieval settings are read from this file.
    #[arg(long, global = true, default_value = "./config/kh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Classify every candidate file under a root without ingesting.
    Scan { tenant: String, root: PathBuf },

    /// Ingest all new, changed, failed or interrupted files under a root.
    ///
    /// Unchanged, completed files are skipped. A failing section is
    /// recorded and its siblings carry on; Ctrl-C stops between sections.
    Ingest { tenant: String, root: PathBuf },

    /// Ingest one file.
    IngestFile {
        tenant: String,
        path: PathBuf,
        /// Root the document path is keyed relative to.
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },

    /// Reset a document's failed sections so the next run retries them.
    Cleanup { tenant: String, status_id: String },

    /// List failed sections and sections stuck in `processing`.
    Report { tenant: String },

    /// List ingestion status rows.
    Status { tenant: String },

    /// Print a document's chunks in citation order.
    Get { tenant: String, document_id: String },

    /// Query the knowledge store.
    Search {
        tenant: String,
        query: String,
        #[arg(long, value_enum, default_value = "hybrid")]
        mode: SearchMode,
        #[arg(long)]
        limit: Option<usize>,
        /// Lexical share of the hybrid score, in [0, 1].
        #[arg(long)]
        text_weight: Option<f64>,
    },
}

async fn open_store(cfg: &Config) -> Result<KnowledgeStore> {
    let pool = db::connect(cfg).await?;
    Ok(KnowledgeStore::new(pool))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let store = open_store(&cfg).await?;
    let cancel = CancellationFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current section");
                cancel.cancel();
            }
        });
    }
    let pipeline = Pipeline::from_config(&cfg, store.clone())?.with_cancellation(cancel);

    match cli.command {
        Commands::Init => {}
        Commands::Scan { tenant, root } => {
            let tenant = TenantId::parse(&tenant)?;
            let plan = pipeline.scan_and_classify(&tenant, &root).await?;
            if plan.is_empty() {
                println!("No candidate files.");
            }
            for (path, action) in plan {
                println!("{:<22} {}", action.to_string(), path);
            }
        }
        Commands::Ingest { tenant, root } => {
            let tenant = TenantId::parse(&tenant)?;
            let summary = pipeline.ingest_tree(&tenant, &root).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.aborted {
                anyhow::bail!("ingestion aborted");
            }
        }
        Commands::IngestFile { tenant, path, root } => {
            let tenant = TenantId::parse(&tenant)?;
            let status = pipeline
                .ingest_document(&tenant, &root, &path)
                .await
                .with_context(|| format!("ingesting {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Cleanup { tenant, status_id } => {
            let tenant = TenantId::parse(&tenant)?;
            let reset = pipeline.cleanup_failed_sections(&tenant, &status_id).await?;
            println!("Reset {} failed section(s).", reset);
        }
        Commands::Report { tenant } => {
            let tenant = TenantId::parse(&tenant)?;
            let report = pipeline.recovery_report(&tenant).await?;
            if report.is_empty() {
                println!("No failed sections.");
            }
            for s in &report {
                println!(
                    "[{}] {} §{} ({}){}",
                    s.category.as_deref().unwrap_or("-"),
                    s.document_path,
                    s.position,
                    s.status,
                    if s.stale { " stale" } else { "" }
                );
                if let Some(err) = &s.error_message {
                    println!("    error: {}", err);
                }
                println!("    preview: \"{}\"", s.preview.replace('\n', " ").trim());
                println!("    status id: {}", s.ingestion_status_id);
            }
        }
        Commands::Status { tenant } => {
            let tenant = TenantId::parse(&tenant)?;
            for s in pipeline.list_statuses(&tenant).await? {
                println!(
                    "{:<10} chunks={:<5} episodes={:<4} {}  ({})",
                    s.status.to_string(),
                    s.chunks_created,
                    s.episodes_created,
                    s.path,
                    s.id
                );
                if let Some(err) = &s.error_message {
                    println!("           {}", err);
                }
            }
        }
        Commands::Get {
            tenant,
            document_id,
        } => {
            let tenant = TenantId::parse(&tenant)?;
            let document = store.get_document(&tenant, &document_id).await?;
            println!("--- {} [{}] ---", document.title, document.category);
            println!("source: {}", document.source_path);
            println!(
                "words: {}  pages: {}  ordinal: {}",
                document.word_count, document.page_count, document.ordinal
            );
            for chunk in pipeline.get_chunks(&tenant, &document_id).await? {
                println!();
                println!(
                    "§{}.{} (p. {})",
                    chunk.section_position, chunk.chunk_index, chunk.page_estimate
                );
                println!("{}", chunk.text);
            }
        }
        Commands::Search {
            tenant,
            query,
            mode,
            limit,
            text_weight,
        } => {
            let tenant = TenantId::parse(&tenant)?;
            let engine = RetrievalEngine::new(
                store,
                Arc::clone(pipeline.embedder()),
                Arc::clone(pipeline.graph()),
                cfg.retrieval.clone(),
                cfg.graph.max_facts,
            );
            let result = engine
                .query(&tenant, &query, None, mode, limit, text_weight)
                .await?;

            for channel in &result.degraded {
                println!("(degraded: {} channel unavailable)", channel);
            }
            if result.hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in result.hits.iter().enumerate() {
                let c = &hit.chunk.citation;
                println!(
                    "{}. [{:.3}] {} / {} §{} p.{}",
                    i + 1,
                    hit.score,
                    c.category,
                    c.document_title,
                    hit.chunk.section_position,
                    hit.chunk.page_estimate
                );
                println!("    source: {}", c.document_source);
                println!(
                    "    excerpt: \"{}\"",
                    hit.chunk.text.chars().take(240).collect::<String>().replace('\n', " ").trim()
                );
                println!("    document: {}", hit.chunk.document_id);
                println!();
            }
            if !result.facts.is_empty() {
                println!("Facts:");
                for fact in &result.facts {
                    println!("  - {}", fact.fact);
                }
            }
        }
    }

    Ok(())
}
