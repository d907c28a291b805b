//! HTTP client for the Remedy API.
//!
//! Operators use it to submit, approve and inspect runs. Agents use its
//! [`Upstream`] implementation to pull actions placed on them, push finished
//! results, and upload artifact content to their host.
//!
//! # Example
//!
//! ```no_run
//! use remedy_client::{RemedyClient, Result, Upstream};
//!
//! # async fn example() -> Result<()> {
//! let client = RemedyClient::builder()
//!     .base_url("http://host:8080")
//!     .auth_token("secret")
//!     .build()?;
//!
//! if let Some(work) = client.upstream().pull("a1").await? {
//!     println!("run {} action {}", work.run.id, work.action.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod error;

pub use api::{HealthApi, HealthResponse, RunsApi, Upstream, UpstreamApi};
pub use client::{ClientBuilder, RemedyClient, USER_HEADER};
pub use error::{Error, Result};

/// Alias used by crates that hold several error types in scope.
pub type ClientError = Error;
