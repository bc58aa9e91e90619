use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aisoc_cag::{
    CagEngine, EngineConfig, ExtractiveBackend, Fingerprint, GenerationBackend,
    OpenAiCompatBackend, OpenAiCompatConfig, QueryOutcome, QueryResult,
};

mod input;

#[derive(Parser)]
#[command(name = "aisoc-cag")]
#[command(about = "Cache-augmented Q&A over SIEM security events", long_about = None)]
struct Cli {
    /// Cache directory (defaults to CAG_CACHE_DIR, then ~/.cache/aisoc-cag)
    #[arg(short, long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Generation backend
    #[arg(short, long, value_enum, default_value = "extractive", global = true)]
    backend: BackendKind,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    /// Offline, answers by quoting cached events
    Extractive,
    /// OpenAI-compatible server (LM Studio by default)
    Openai,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (or reuse) the knowledge cache for an event file
    Build {
        /// Events as JSON array, search response or JSON Lines ("-" for stdin)
        #[arg(short, long)]
        records: PathBuf,

        /// Snapshot label, e.g. "last-24h"
        #[arg(short, long, default_value = "default")]
        snapshot: String,

        /// Rebuild even if an entry exists
        #[arg(short, long)]
        force: bool,
    },

    /// Ask a question against a cache entry
    Query {
        /// Entry fingerprint (a unique prefix is enough)
        fingerprint: String,

        /// The question
        question: String,

        /// Generation budget
        #[arg(short, long)]
        max_tokens: Option<usize>,
    },

    /// Build or reuse the cache for an event file, then ask
    Ask {
        #[arg(short, long)]
        records: PathBuf,

        question: String,

        #[arg(short, long, default_value = "default")]
        snapshot: String,

        #[arg(short, long)]
        max_tokens: Option<usize>,
    },

    /// Rank events against a question without building a cache
    Rank {
        #[arg(short, long)]
        records: PathBuf,

        /// Omit to rank by severity
        question: Option<String>,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List cache entries
    List,

    /// Invalidate a cache entry
    Invalidate {
        fingerprint: String,
    },

    /// Show cache statistics
    Stats,

    /// Remove every cache entry
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "aisoc_cag=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let engine = create_engine(&cli).await?;

    match cli.command {
        Commands::Build {
            ref records,
            ref snapshot,
            force,
        } => {
            let events = input::load_events(records)?;
            let meta = engine.build_or_get_cache(snapshot, &events, force).await?;

            if cli.json {
                print_json(&meta)?;
            } else {
                println!("Cache ready: {}", meta.fingerprint);
                println!("  Snapshot: {}", meta.snapshot_id);
                println!("  Backend:  {}", meta.backend);
                println!(
                    "  Events:   {} cached, {} over budget, {} read",
                    meta.record_count,
                    meta.dropped_count,
                    events.len()
                );
                println!("  Expires:  {}", meta.expires_at.format("%Y-%m-%d %H:%M:%S"));
            }
        }

        Commands::Query {
            ref fingerprint,
            ref question,
            max_tokens,
        } => {
            let fingerprint = resolve(&engine, fingerprint).await?;
            let outcome = engine.query(&fingerprint, question, max_tokens).await?;
            print_outcome(&outcome, cli.json)?;
        }

        Commands::Ask {
            ref records,
            ref question,
            ref snapshot,
            max_tokens,
        } => {
            let events = input::load_events(records)?;
            let meta = engine.build_or_get_cache(snapshot, &events, false).await?;
            let outcome = engine
                .query(&meta.fingerprint, question, max_tokens)
                .await?;
            print_outcome(&outcome, cli.json)?;
        }

        Commands::Rank {
            ref records,
            ref question,
            limit,
        } => {
            let events = input::load_events(records)?;
            let ranked = engine.rank(&events, question.as_deref(), limit);

            if cli.json {
                print_json(&ranked)?;
            } else if ranked.is_empty() {
                println!("No valid events in {:?}", records);
            } else {
                for (i, item) in ranked.iter().enumerate() {
                    println!("{:>3}. [score {:>3}] {}", i + 1, item.score, item.unit.text());
                }
            }
        }

        Commands::List => {
            let entries = engine.list_entries().await;

            if cli.json {
                print_json(&entries)?;
            } else if entries.is_empty() {
                println!("No cache entries. Run 'aisoc-cag build --records <file>' to create one.");
            } else {
                println!("Cache entries:");
                println!("{}", "=".repeat(70));
                for meta in entries {
                    println!(
                        "{}  {:<12} {:>4} events  max L{:<2}  {}  expires {}",
                        meta.fingerprint.short(),
                        meta.snapshot_id,
                        meta.record_count,
                        meta.max_severity,
                        meta.backend,
                        meta.expires_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }

        Commands::Invalidate { ref fingerprint } => {
            let fingerprint = resolve(&engine, fingerprint).await?;
            if engine.invalidate(&fingerprint).await? {
                println!("Invalidated {}", fingerprint);
            } else {
                println!("No entry {}", fingerprint);
            }
        }

        Commands::Clear => {
            let removed = engine.clear().await?;
            println!("Removed {} cache entries", removed);
        }

        Commands::Stats => {
            let stats = engine.stats().await;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!("{}", stats);
            }
        }
    }

    Ok(())
}

async fn create_engine(cli: &Cli) -> Result<CagEngine> {
    let mut config = EngineConfig::from_env()?;

    if let Some(dir) = &cli.cache_dir {
        config.cache.persist_dir = Some(dir.clone());
    } else if config.cache.persist_dir.is_none() {
        config.cache.persist_dir = dirs::cache_dir().map(|dir| dir.join("aisoc-cag"));
    }

    let backend: Arc<dyn GenerationBackend> = match cli.backend {
        BackendKind::Extractive => Arc::new(ExtractiveBackend::new()),
        BackendKind::Openai => Arc::new(OpenAiCompatBackend::new(OpenAiCompatConfig::from_env()?)?),
    };

    CagEngine::open(config, backend)
        .await
        .context("Failed to open the knowledge cache")
}

/// Full fingerprint for a unique prefix of a listed entry
async fn resolve(engine: &CagEngine, prefix: &str) -> Result<Fingerprint> {
    let wanted = Fingerprint::new(prefix);
    let matches: Vec<Fingerprint> = engine
        .list_entries()
        .await
        .into_iter()
        .map(|meta| meta.fingerprint)
        .filter(|fp| fp.as_str().starts_with(wanted.as_str()))
        .collect();

    match matches.len() {
        1 => Ok(matches.into_iter().next().unwrap_or(wanted)),
        0 => Ok(wanted),
        n => anyhow::bail!("Fingerprint prefix {:?} is ambiguous ({} entries)", prefix, n),
    }
}

fn print_outcome(outcome: &QueryOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(outcome);
    }

    match outcome {
        QueryOutcome::Ready(result) => print_result(result),
        QueryOutcome::NotReady {
            fingerprint,
            rebuilding,
        } => {
            println!("Cache {} is not ready.", fingerprint.short());
            if *rebuilding {
                println!("A rebuild has started; try again shortly.");
            } else {
                println!("Run 'aisoc-cag build --records <file>' to rebuild it.");
            }
        }
    }
    Ok(())
}

fn print_result(result: &QueryResult) {
    println!("{}", result.answer_text);
    println!();
    println!(
        "[{} | {}ms | {} tokens{}]",
        result.used_entry_fingerprint.short(),
        result.latency_ms,
        result.generated_tokens,
        result
            .truncated
            .map(|t| format!(" | truncated: {:?}", t))
            .unwrap_or_default()
    );
    if !result.findings.is_empty() {
        println!("Related events:");
        for finding in &result.findings {
            let indicators: Vec<&str> = finding.indicators.iter().map(|i| i.as_str()).collect();
            println!(
                "  - {} ({} L{}){}",
                finding.source_id,
                finding.priority,
                finding.severity_level,
                if indicators.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", indicators.join(", "))
                }
            );
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
