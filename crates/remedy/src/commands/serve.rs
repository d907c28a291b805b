//! Serve command: runs a host.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use remedy_config::{EngineConfig, PlaybooksConfig, RemedyConfig, ServerConfig, StoreConfig};
use remedy_engine::Engine;
use remedy_server::Server;

use super::{Context, join, shutdown_signal};

/// Arguments for the serve command.
///
/// Flags override config file values.
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to, host:port
    #[arg(short, long, env = "REMEDY_BIND")]
    pub bind: Option<String>,

    /// Bearer token required on API routes
    #[arg(long, env = "REMEDY_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// SQLite database path
    #[arg(long, env = "REMEDY_DB")]
    pub db: Option<PathBuf>,

    /// Worker-pool size
    #[arg(short, long, env = "REMEDY_WORKERS")]
    pub workers: Option<usize>,

    /// Directory of playbook definitions to load and watch
    #[arg(long, env = "REMEDY_PLAYBOOKS")]
    pub playbooks: Option<PathBuf>,

    /// Artifact blob store URL, e.g. file:///var/lib/remedy/artifacts
    #[arg(long, env = "REMEDY_ARTIFACTS")]
    pub artifacts: Option<String>,
}

impl ServeArgs {
    /// Apply flags on top of the loaded configuration.
    pub fn apply(&self, config: &mut RemedyConfig) {
        if let Some(bind) = &self.bind {
            config.server.get_or_insert_with(ServerConfig::default).bind = bind.clone();
        }
        if let Some(token) = &self.token {
            config.server.get_or_insert_with(ServerConfig::default).api_token =
                Some(token.clone());
        }
        if let Some(db) = &self.db {
            config.store.get_or_insert_with(StoreConfig::default).path = Some(db.clone());
        }
        if let Some(workers) = self.workers {
            config.engine.get_or_insert_with(EngineConfig::default).workers = workers.max(1);
        }
        if let Some(dir) = &self.playbooks {
            config.playbooks.get_or_insert_with(PlaybooksConfig::default).dir = Some(dir.clone());
        }
        if let Some(url) = &self.artifacts {
            config
                .artifacts
                .get_or_insert_with(Default::default)
                .connection = Some(url.clone());
        }
    }
}

/// Run the serve command.
pub async fn run(args: ServeArgs, ctx: Context) -> Result<()> {
    let mut config = ctx.config;
    args.apply(&mut config);
    // A host never pulls from an upstream.
    config.agent = None;

    let server_config =
        remedy_server::ServerConfig::from_remedy(&config).context("server configuration")?;
    if server_config.auth_token.is_none() {
        tracing::warn!("No API token configured, API routes are unauthenticated");
    }

    let engine = Engine::open(config).context("opening engine")?;
    let shutdown = CancellationToken::new();
    let tasks = engine.start(shutdown.clone()).context("starting engine")?;

    let server = Server::new(engine, server_config);
    info!(addr = %server.bind_address(), "Remedy host starting");
    let mut serving = tokio::spawn(server.run(shutdown.clone()));

    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut serving => Some(result),
    };
    shutdown.cancel();
    let served = match finished {
        Some(result) => result,
        None => serving.await,
    };
    join(tasks).await;
    served.context("server task")??;
    info!("Remedy host stopped");
    Ok(())
}
