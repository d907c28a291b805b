//! Configuration system for the Remedy playbook engine.
//!
//! Provides TOML-based configuration with:
//! - Config file layering (XDG user config + project-local overrides)
//! - Engine tuning (worker pool, polling, per-kind action timeouts)
//! - Named connections used by sql, notification, gitops and pod actions
//! - Agent mode settings (upstream host, push cadence)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, xdg_config_dir,
    xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
