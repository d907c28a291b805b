//! CLI command handlers.

pub mod agent;
pub mod serve;

use std::path::Path;

use anyhow::{Context as _, Result};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use remedy_config::discovery::ConfigSource;
use remedy_config::{LoadedConfig, RemedyConfig};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Loaded configuration; command flags are applied on top.
    pub config: RemedyConfig,
    pub verbose: bool,
}

/// Load an explicit config file, or run layered discovery.
pub fn load(path: Option<&Path>) -> Result<LoadedConfig> {
    let Some(path) = path else {
        return remedy_config::load_config(None).context("loading configuration");
    };
    let config = remedy_config::load_config_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let source = ConfigSource {
        path: path.to_path_buf(),
        loaded: true,
    };
    Ok(LoadedConfig {
        config,
        sources: vec![source],
        warnings: Vec::new(),
    })
}

/// Resolve on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
}

/// Wait for background loops after shutdown was signalled.
pub async fn join(tasks: Vec<JoinHandle<()>>) {
    for result in join_all(tasks).await {
        if let Err(e) = result {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
}
