//! Agent command: runs a remote agent.
//!
//! The agent keeps its own store and engine, pulls actions the host placed
//! on it, executes them locally and pushes the results back.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use remedy_client::RemedyClient;
use remedy_config::{AgentConfig, RemedyConfig, StoreConfig};
use remedy_engine::Engine;

use super::{Context, join, shutdown_signal};

/// Arguments for the agent command.
///
/// Flags override the `[agent]` config table.
#[derive(Args, Debug, Default)]
pub struct AgentArgs {
    /// Name the host knows this agent by
    #[arg(long, env = "REMEDY_AGENT_NAME")]
    pub name: Option<String>,

    /// Base URL of the upstream host
    #[arg(long, env = "REMEDY_UPSTREAM")]
    pub upstream: Option<String>,

    /// Bearer token for the upstream host
    #[arg(long, env = "REMEDY_UPSTREAM_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// SQLite database path for the agent's local store
    #[arg(long, env = "REMEDY_DB")]
    pub db: Option<PathBuf>,
}

impl AgentArgs {
    /// Apply flags on top of the loaded configuration and check that agent
    /// mode is fully specified.
    pub fn apply(&self, config: &mut RemedyConfig) -> Result<AgentConfig> {
        let agent = config.agent.get_or_insert_with(AgentConfig::default);
        if let Some(name) = &self.name {
            agent.name = name.clone();
        }
        if let Some(upstream) = &self.upstream {
            agent.upstream = upstream.clone();
        }
        if let Some(token) = &self.token {
            agent.token = Some(token.clone());
        }
        let agent = agent.clone();
        if let Some(db) = &self.db {
            config.store.get_or_insert_with(StoreConfig::default).path = Some(db.clone());
        }

        if agent.name.trim().is_empty() {
            bail!("agent name is required (--name or [agent] name)");
        }
        if agent.upstream.trim().is_empty() {
            bail!("upstream URL is required (--upstream or [agent] upstream)");
        }
        Ok(agent)
    }
}

/// Run the agent command.
pub async fn run(args: AgentArgs, ctx: Context) -> Result<()> {
    let mut config = ctx.config;
    let agent = args.apply(&mut config)?;

    let mut builder = RemedyClient::builder().base_url(&agent.upstream);
    if let Some(token) = &agent.token {
        builder = builder.auth_token(token);
    }
    let client = builder.build().context("building upstream client")?;
    if ctx.verbose {
        match client.health().check().await {
            Ok(health) => info!(upstream = %agent.upstream, version = %health.version, "Upstream reachable"),
            Err(e) => tracing::warn!(upstream = %agent.upstream, error = %e, "Upstream health check failed"),
        }
    }

    let engine = Engine::open(config).context("opening engine")?;
    let worker = engine
        .agent_worker(Arc::new(client.upstream()))
        .context("agent mode is not configured")?;

    let shutdown = CancellationToken::new();
    let mut tasks = engine.start(shutdown.clone()).context("starting engine")?;
    tasks.push(tokio::spawn(worker.run(shutdown.clone())));
    info!(agent = %agent.name, upstream = %agent.upstream, "Remedy agent started");

    shutdown_signal().await;
    shutdown.cancel();
    join(tasks).await;
    info!("Remedy agent stopped");
    Ok(())
}
