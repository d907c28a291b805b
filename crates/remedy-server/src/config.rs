//! Server configuration.

use std::net::SocketAddr;

use remedy_config::RemedyConfig;

use crate::error::{Result, ServerError};

/// Default request body limit, artifact uploads included.
const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_address: SocketAddr,
    /// Bearer token required on API routes. `None` disables the check.
    pub auth_token: Option<String>,
    /// Largest accepted request body in bytes.
    pub max_body_size: usize,
}

impl ServerConfig {
    pub fn new(auth_token: Option<String>) -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            auth_token,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Server settings from the `[server]` table.
    pub fn from_remedy(config: &RemedyConfig) -> Result<Self> {
        let server = config.server();
        let bind_address = server.bind.parse().map_err(|e| {
            ServerError::Config(format!("invalid bind address '{}': {e}", server.bind))
        })?;
        Ok(Self {
            bind_address,
            ..Self::new(server.api_token.filter(|t| !t.is_empty()))
        })
    }

    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(None)
    }
}
