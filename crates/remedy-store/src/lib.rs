//! SQLite persistence for Remedy.
//!
//! One [`Store`] owns a single connection in WAL mode. State transitions that
//! must be won by exactly one claimant (runs, events, agent actions) run in
//! `BEGIN IMMEDIATE` transactions with a compare-and-set on `status`.

pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::Store;
