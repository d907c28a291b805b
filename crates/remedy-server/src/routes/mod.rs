//! HTTP routes.

pub mod health;
pub mod runs;
pub mod upstream;
pub mod webhook;

pub use health::{HealthResponse, health_routes};
pub use runs::{
    approve_handler, cancel_run_handler, get_run_handler, list_artifacts_handler,
    reject_handler, submit_run_handler,
};
pub use upstream::{PullQuery, pull_handler, push_handler, upload_artifact_handler};
pub use webhook::webhook_handler;
