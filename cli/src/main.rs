//! # rlm
//!
//! Command-line entry point: answers one question over one file.

mod provider;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use rlm_engine::ConfigLoader;
use rlm_engine::ContextSource;
use rlm_engine::LedgerWriter;
use rlm_engine::LoadedContext;
use rlm_engine::RlmError;
use rlm_engine::RlmSession;
use rlm_engine::SessionResult;
use rlm_engine::TomlConfigLoader;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::provider::OpenAiChatProvider;

const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_FAILURE: i32 = 1;

/// Recursive language model sessions
#[derive(Parser, Debug)]
#[command(name = "rlm", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer a question about a file
    Query(QueryArgs),
}

#[derive(Parser, Debug)]
struct QueryArgs {
    /// The question to answer
    prompt: String,

    /// File the question is about
    #[arg(short, long)]
    file: PathBuf,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hard cost cap in USD, overriding the configuration
    #[arg(short, long)]
    budget: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok(), cli.verbose);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match cli.command {
        Commands::Query(args) => query(args).await?,
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// `RUST_LOG` when it parses, otherwise `debug` or `info` by verbosity.
fn log_filter(rust_log: Option<String>, verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

async fn query(args: QueryArgs) -> Result<i32> {
    let loader = TomlConfigLoader {
        path: args.config,
        budget_override_usd: args.budget,
    };
    let config = match loader.load() {
        Ok(loaded) => loaded.config,
        Err(err) => {
            error!("{err}");
            return Ok(EXIT_CONFIG_ERROR);
        }
    };

    let context = LoadedContext::load(ContextSource::File(args.file), &config.token_estimate)
        .await
        .context("failed to load the context file")?;
    debug!(
        chars = context.size.chars,
        lines = context.size.lines,
        tokens_estimate = context.size.tokens_estimate,
        "context loaded"
    );

    let provider = OpenAiChatProvider::new(&config.gateway, config.token_estimate)?;
    let ledger = LedgerWriter::spawn(&config.trace).await?;
    let session = match RlmSession::new(config, Arc::new(provider), ledger.clone()) {
        Ok(session) => session,
        Err(err @ RlmError::ConfigValidation { .. }) => {
            error!("{err}");
            return Ok(EXIT_CONFIG_ERROR);
        }
        Err(err) => return Err(err.into()),
    };

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            cancel.cancel();
        }
    });

    let outcome = session.run(&args.prompt, &context.content).await;
    let summary = ledger.close().await?;
    debug!(
        entries = summary.entries_written,
        trace_events = summary.trace_events_written,
        "ledger closed"
    );

    match outcome {
        Ok(result) => {
            report(&result);
            Ok(result.status.exit_code())
        }
        Err(err @ RlmError::ConfigValidation { .. }) => {
            error!("{err}");
            Ok(EXIT_CONFIG_ERROR)
        }
        Err(err) => {
            error!(correlation_id = err.correlation_id().unwrap_or("-"), "{err}");
            Ok(EXIT_FAILURE)
        }
    }
}

fn report(result: &SessionResult) {
    if let Some(answer) = &result.answer {
        println!("{answer}");
    } else {
        if let Some(error) = &result.error {
            eprintln!("error: {error}");
        }
        if let Some(partial) = &result.partial {
            eprintln!("last reply:\n{partial}");
        }
    }
    info!(
        correlation_id = %result.correlation_id,
        status = %result.status,
        turns = result.turns,
        spent_usd = result.budget.spent_usd,
        tokens_used = result.budget.tokens_used,
        calls = result.cost.total.api_calls,
        "session finished"
    );
}
