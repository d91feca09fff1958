//! CLI implementation for codectx

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use codectx::indexer::ProgressFn;
use codectx::{
    BlockChunker, EmbeddingPool, HashRuntime, IndexMode, Indexer, MmrSelector, ModelInfo,
    QueryEngine, QueryRequest, Settings, VectorStore,
};

// Exit codes (see also the operator docs): 0 success, 2 fatal config
// error, 3 unrecoverable index corruption, 4 unrecoverable pool failure.
#[repr(i32)]
#[derive(Clone, Copy)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    ConfigError = 2,
    IndexCorrupt = 3,
    PoolDead = 4,
    Interrupted = 130,
}

#[derive(Parser)]
#[command(name = "codectx")]
#[command(about = "Repository indexing and token-budgeted code context assembly")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Suppress progress output
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the repository into the vector snapshot
    Index {
        /// full | incremental | reindex
        #[arg(long, default_value = "incremental")]
        mode: String,
    },
    /// Assemble a context package for a question
    Query {
        /// The question or task description
        query: String,
        /// Candidate pool size handed to the selector
        #[arg(short = 'n', long, default_value = "50")]
        top_k: usize,
        /// Cap on selected chunks
        #[arg(long)]
        max_chunks: Option<usize>,
        /// Restrict search to paths matching these globs
        #[arg(short = 'p', long)]
        path: Vec<String>,
        /// Expand candidates one hop along the symbol graph
        #[arg(long)]
        related: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Show only file:line headers, no code
        #[arg(long)]
        no_content: bool,
    },
    /// Show index and pool statistics
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Wipe the snapshot (memory, disk, and mirror)
    Clear,
    /// Run as an embedding worker on stdin/stdout (spawned by the pool)
    #[command(hide = true)]
    Worker,
}

/// Entry point called from main after logging setup.
pub fn run_with(cli: Cli) -> i32 {
    // The worker subcommand is a plain blocking loop; everything else
    // runs on a tokio runtime
    if matches!(cli.command, Commands::Worker) {
        return match codectx::serve_worker(&HashRuntime::new()) {
            Ok(()) => ExitCode::Success as i32,
            Err(e) => {
                eprintln!("worker error: {e}");
                ExitCode::GeneralError as i32
            }
        };
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} {e}", "error:".red());
            return ExitCode::GeneralError as i32;
        }
    };
    runtime.block_on(run_async(cli))
}

async fn run_async(cli: Cli) -> i32 {
    let root = cli
        .root
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    let settings = match Settings::load(&root) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{} {e}", "config error:".red());
            return ExitCode::ConfigError as i32;
        }
    };

    let result = match cli.command {
        Commands::Index { ref mode } => run_index(&cli, &root, &settings, mode).await,
        Commands::Query {
            ref query,
            top_k,
            max_chunks,
            ref path,
            related,
            json,
            no_content,
        } => {
            run_query(
                &root, &settings, query, top_k, max_chunks, path, related, json, no_content,
            )
            .await
        }
        Commands::Stats { json } => run_stats(&root, &settings, json).await,
        Commands::Clear => run_clear(&root, &settings),
        Commands::Worker => unreachable!("handled before runtime startup"),
    };

    match result {
        Ok(code) => code as i32,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            classify_error(&e) as i32
        }
    }
}

/// Map error chains onto the documented exit codes.
fn classify_error(error: &anyhow::Error) -> ExitCode {
    for cause in error.chain() {
        if let Some(store_err) = cause.downcast_ref::<codectx::StoreError>() {
            if store_err.is_fatal() {
                return ExitCode::IndexCorrupt;
            }
        }
        if let Some(pool_err) = cause.downcast_ref::<codectx::PoolError>() {
            if pool_err.is_fatal() {
                return ExitCode::PoolDead;
            }
        }
        if cause.downcast_ref::<codectx::ConfigError>().is_some() {
            return ExitCode::ConfigError;
        }
        if let Some(index_err) = cause.downcast_ref::<codectx::IndexError>() {
            match index_err {
                codectx::IndexError::Store(e) if e.is_fatal() => return ExitCode::IndexCorrupt,
                codectx::IndexError::Pool(e) if e.is_fatal() => return ExitCode::PoolDead,
                _ => {}
            }
        }
    }
    ExitCode::GeneralError
}

async fn run_index(
    cli: &Cli,
    root: &std::path::Path,
    settings: &Settings,
    mode: &str,
) -> Result<ExitCode> {
    let mode: IndexMode = mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("invalid --mode")?;

    let store = Arc::new(VectorStore::open(&settings.store, ModelInfo::default()));
    let pool = EmbeddingPool::new(settings.pool.clone(), settings.cache.clone()).await?;

    let mut indexer = Indexer::new(root, store, pool.clone(), Arc::new(BlockChunker::default()));
    if !cli.quiet {
        indexer = indexer.with_progress(progress_bar());
    }

    let outcome = tokio::select! {
        outcome = indexer.index(mode) => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted. Shutting down workers...");
            pool.shutdown("interrupted").await;
            return Ok(ExitCode::Interrupted);
        }
    };
    pool.shutdown("index complete").await;
    let report = outcome?;

    println!(
        "{} {} files scanned, {} added / {} updated / {} removed chunks in {}ms",
        "indexed:".green(),
        report.files_scanned,
        report.chunks_added,
        report.chunks_updated,
        report.chunks_removed,
        report.duration_ms
    );
    if report.degraded_chunks > 0 {
        println!(
            "{} {} chunks degraded to zero vectors",
            "warning:".yellow(),
            report.degraded_chunks
        );
    }
    Ok(ExitCode::Success)
}

#[allow(clippy::too_many_arguments)]
async fn run_query(
    root: &std::path::Path,
    settings: &Settings,
    query: &str,
    top_k: usize,
    max_chunks: Option<usize>,
    path_globs: &[String],
    related: bool,
    json: bool,
    no_content: bool,
) -> Result<ExitCode> {
    let store = Arc::new(VectorStore::open(&settings.store, ModelInfo::default()));
    if let Err(e) = store.initialize() {
        if e.is_fatal() {
            anyhow::bail!(e);
        }
    }
    if store.is_empty() {
        eprintln!(
            "{} no index found under {} — run `codectx index` first",
            "error:".red(),
            root.display()
        );
        return Ok(ExitCode::GeneralError);
    }

    let pool = EmbeddingPool::new(settings.pool.clone(), settings.cache.clone()).await?;
    let engine = QueryEngine::new(
        pool.clone(),
        store,
        MmrSelector::new(settings.mmr.clone()),
    );

    let mut request = QueryRequest::new(query);
    request.top_k = top_k;
    request.max_chunks = max_chunks;
    request.path_globs = path_globs.to_vec();
    request.expand_related = related;

    let response = engine.answer(&request).await;
    pool.shutdown("query complete").await;
    let response = response?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(ExitCode::Success);
    }

    let package = &response.package;
    for chunk in &package.selected_chunks {
        println!(
            "{} {}:{}-{}",
            "▸".cyan(),
            chunk.file_path.bold(),
            chunk.start_line,
            chunk.end_line
        );
        if !no_content {
            println!("{}", chunk.content);
            println!();
        }
    }
    println!(
        "{} {} chunks, ~{} tokens ({:.0}% of budget), diversity {:.2}, critical coverage {:.0}%",
        "context:".green(),
        package.selected_chunks.len(),
        package.total_tokens,
        package.budget_utilization * 100.0,
        package.diversity_score,
        package.critical_set_coverage * 100.0
    );
    Ok(ExitCode::Success)
}

async fn run_stats(root: &std::path::Path, settings: &Settings, json: bool) -> Result<ExitCode> {
    let store = Arc::new(VectorStore::open(&settings.store, ModelInfo::default()));
    match store.initialize() {
        Ok(_) => {}
        Err(e) if e.is_fatal() => anyhow::bail!(e),
        Err(e) => return Err(e.into()),
    }
    let stats = store.stats();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "root": root.display().to_string(),
                "chunks": stats.total_chunks,
                "files": stats.total_files,
                "degraded": stats.degraded_chunks,
                "model": stats.model.name,
                "dimension": stats.model.dimension,
                "created_at": stats.created_at,
            })
        );
    } else {
        println!("{}", "index".bold());
        println!("  chunks:    {}", stats.total_chunks);
        println!("  files:     {}", stats.total_files);
        println!("  degraded:  {}", stats.degraded_chunks);
        println!("  model:     {} ({}d)", stats.model.name, stats.model.dimension);
    }
    Ok(ExitCode::Success)
}

fn run_clear(root: &std::path::Path, settings: &Settings) -> Result<ExitCode> {
    let store = VectorStore::open(&settings.store, ModelInfo::default());
    store.clear_index()?;
    println!("{} index cleared for {}", "done:".green(), root.display());
    Ok(ExitCode::Success)
}

fn progress_bar() -> ProgressFn {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{msg:>8} [{bar:30}] {pos}/{len}")
            .expect("valid template")
            .progress_chars("=> "),
    );
    Arc::new(move |phase: &str, done: u64, total: u64| {
        bar.set_message(phase.to_string());
        bar.set_length(total.max(1));
        bar.set_position(done);
        if phase == "embed" && done >= total {
            bar.finish_and_clear();
        }
    })
}
