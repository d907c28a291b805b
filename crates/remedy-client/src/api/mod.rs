//! API endpoint implementations.

mod health;
mod runs;
mod upstream;

pub use health::{HealthApi, HealthResponse};
pub use runs::RunsApi;
pub use upstream::{Upstream, UpstreamApi};
