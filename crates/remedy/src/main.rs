//! Remedy - playbook execution engine.
//!
//! Main entry point: `remedy serve` runs a host, `remedy agent` runs a
//! remote agent that pulls work from one.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;

mod commands;

use commands::{agent, serve};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Remedy - playbook execution engine
#[derive(Parser)]
#[command(name = "remedy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file (overrides default discovery)
    #[arg(long, global = true, env = "REMEDY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the host: API, webhooks, scheduler and event consumer
    Serve(serve::ServeArgs),

    /// Run a remote agent that executes actions delegated by a host
    Agent(agent::AgentArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = commands::load(cli.config.as_deref())?;
    let _guard = init_tracing(&loaded.config.logging(), cli.verbose);

    for warning in &loaded.warnings {
        tracing::warn!("{warning}");
    }
    for source in loaded.loaded_from() {
        tracing::info!(path = %source.display(), "Loaded config");
    }

    let ctx = commands::Context {
        config: loaded.config,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Serve(args) => serve::run(args, ctx).await,
        Commands::Agent(args) => agent::run(args, ctx).await,
    }
}

/// Console (human-readable) plus, when a log directory is configured, a
/// daily-rotated JSON file.
fn init_tracing(logging: &remedy_config::LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let default = if verbose {
        "remedy=debug,remedy_engine=debug,remedy_server=debug,remedy_store=debug,remedy_client=debug,remedy_config=debug,info".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default));

    let (file_layer, guard) = match &logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "remedy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new(
                    "remedy=debug,remedy_engine=debug,remedy_server=debug,remedy_store=debug,remedy_client=debug,info",
                ));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::try_parse_from([
            "remedy", "serve", "--bind", "0.0.0.0:9000", "--workers", "3", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.bind.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(args.workers, Some(3));
    }

    #[test]
    fn test_parse_agent() {
        let cli = Cli::try_parse_from([
            "remedy", "agent", "--name", "a1", "--upstream", "http://host:8080",
        ])
        .unwrap();
        let Commands::Agent(args) = cli.command else {
            panic!("expected agent");
        };
        assert_eq!(args.name.as_deref(), Some("a1"));
        assert_eq!(args.upstream.as_deref(), Some("http://host:8080"));
    }
}
