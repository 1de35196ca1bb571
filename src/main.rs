//! # RAG Harness CLI (`rag`)
//!
//! Ask questions against a semantic index, inspect retrieval results, and
//! check that the configured model and index backends are reachable.
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag ask "<question>"` | Retrieve, rerank, and answer |
//! | `rag search "<query>"` | Run the retrieval stage only |
//! | `rag health` | Probe index, judge, and chat backends |
//!
//! ## Logging
//!
//! Logs go to stderr. The filter is read from `RAG_LOG` (default `info`);
//! `--verbose` forces `debug` and `--log-json` switches to JSON lines.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rag_harness::config::{self, Config};
use rag_harness::models::Candidate;
use rag_harness::pipeline::Pipeline;
use rag_harness::trace::ExecutionTrace;

const DEFAULT_CONFIG_PATH: &str = "./config/rag.toml";

/// RAG Harness CLI: retrieval, reranking, and answer generation over a
/// semantic index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rag",
    about = "Answer questions from a semantic index with local or hosted models",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/rag.toml`; built-in defaults are used when
    /// that file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of `RAG_LOG`.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question.
    ///
    /// Prints the answer followed by the URLs of the documents it was
    /// generated from.
    Ask {
        /// The question.
        question: String,

        /// Print the per-stage execution trace after the answer.
        #[arg(long)]
        trace: bool,

        /// Print the full execution trace as JSON instead of the answer.
        #[arg(long)]
        json: bool,

        /// Time budget in seconds for retrieval and reranking.
        #[arg(long)]
        budget_secs: Option<f64>,
    },

    /// Run retrieval only and print the ranked candidates.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Check liveness of the index, judge, and chat backends.
    Health,
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("RAG_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            config::load_config(Path::new(DEFAULT_CONFIG_PATH))
        }
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let cfg = resolve_config(cli.config.as_deref())?;
    let pipeline = Pipeline::from_config(&cfg)
        .await
        .context("Failed to build pipeline")?;

    match cli.command {
        Commands::Ask {
            question,
            trace,
            json,
            budget_secs,
        } => run_ask(&pipeline, &question, trace, json, budget_secs).await?,
        Commands::Search { query, limit } => {
            let limit = limit.unwrap_or(cfg.retrieval.top_k);
            run_search(&pipeline, &query, limit).await?;
        }
        Commands::Health => run_health(&pipeline).await?,
    }

    Ok(())
}

async fn run_ask(
    pipeline: &Pipeline,
    question: &str,
    show_trace: bool,
    json: bool,
    budget_secs: Option<f64>,
) -> Result<()> {
    let budget = match budget_secs {
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid --budget-secs value: {}", secs))?,
        ),
        None => None,
    };

    let execution = pipeline.execute(question, budget).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution.trace)?);
        execution.answer?;
        return Ok(());
    }

    match &execution.answer {
        Ok(answer) => {
            println!("{}", answer);
            let urls = execution
                .trace
                .generation
                .as_ref()
                .map(|g| g.source_urls.as_slice())
                .unwrap_or_default();
            if !urls.is_empty() {
                println!();
                println!("Sources:");
                for url in urls {
                    println!("  - {}", url);
                }
            }
        }
        // Reported by the `?` below, after the trace.
        Err(_) => {}
    }

    if show_trace {
        println!();
        print_trace(&execution.trace);
    }

    execution.answer?;
    Ok(())
}

async fn run_search(pipeline: &Pipeline, query: &str, limit: usize) -> Result<()> {
    let result = pipeline.retrieve(query, limit).await?;

    if result.candidates.is_empty() {
        println!("No results.");
        return Ok(());
    }

    if result.rewritten {
        println!("searched with rewritten query:");
        println!("    \"{}\"", result.search_query.replace('\n', " ").trim());
        println!();
    }

    for (i, candidate) in result.candidates.iter().enumerate() {
        print_candidate(i, candidate);
        let doc = candidate.document();
        if !doc.url.is_empty() {
            println!("    url: {}", doc.url);
        }
        println!("    id: {}", doc.id);
        println!();
    }
    Ok(())
}

async fn run_health(pipeline: &Pipeline) -> Result<()> {
    let report = pipeline.health().await;
    let status = |ok: bool| if ok { "OK" } else { "UNREACHABLE" };

    println!("{:<12} {}", "BACKEND", "STATUS");
    println!("{:<12} {}", "index", status(report.index));
    match report.judge {
        Some(ok) => println!("{:<12} {}", "judge", status(ok)),
        None => println!("{:<12} {}", "judge", "DISABLED"),
    }
    println!("{:<12} {}", "chat", status(report.chat));

    if !report.is_serving() {
        anyhow::bail!("required backend unreachable");
    }
    Ok(())
}

fn print_candidate(i: usize, candidate: &Candidate) {
    let rerank = candidate
        .rerank_score()
        .map(|s| format!(", rerank {:.2}", s))
        .unwrap_or_default();
    println!(
        "{}. [{:.2}] {} (distance {:.3}{})",
        i + 1,
        candidate.final_score(),
        candidate.document().title,
        candidate.vector_score(),
        rerank
    );
}

fn print_trace(trace: &ExecutionTrace) {
    println!("--- Trace ---");
    println!("query:        {}", trace.query);
    println!("state:        {:?}", trace.state);

    if let Some(r) = &trace.retrieval {
        println!(
            "retrieval:    {:.2}s, {} candidates{}",
            r.metrics.duration_seconds,
            r.candidates.len(),
            if r.rewritten { " (rewritten query)" } else { "" }
        );
    }
    if let Some(r) = &trace.rerank {
        if r.skipped {
            println!("rerank:       skipped (judge unavailable)");
        } else {
            println!(
                "rerank:       {:.2}s, scored {}, failed {}, {} tokens",
                r.metrics.duration_seconds,
                r.scored,
                r.failed,
                r.tokens_consumed.unwrap_or_default()
            );
        }
        for (i, candidate) in r.candidates.iter().enumerate() {
            print!("    ");
            print_candidate(i, candidate);
        }
    }
    if let Some(g) = &trace.generation {
        println!(
            "generation:   {:.2}s, {} ({} in / {} out tokens)",
            g.metrics.duration_seconds, g.model_used, g.input_tokens, g.output_tokens
        );
        if let Some(load) = g.load_duration_seconds {
            println!("    model load: {:.2}s", load);
        }
    }
    if let (Some(duration), Some(tokens)) = (trace.total_duration, trace.total_tokens) {
        println!("total:        {:.2}s, {} tokens", duration, tokens);
    }
    if let Some(f) = &trace.failure {
        println!("failed in:    {} ({})", f.stage, f.message);
    }
}
