//! Balance aggregation and reporting pipeline for a double-entry ledger.
//!
//! Journal movements are folded into per-account daily balances
//! ([`generator`]), rolled up into hierarchical trial balances
//! ([`aggregator`]) and frozen at month end ([`period_close`]). Batch runs
//! over date ranges go through [`batch`] and [`jobs`]; reads go through
//! [`reports`].

pub mod aggregator;
pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod generator;
pub mod jobs;
pub mod period_close;
pub mod pipeline;
pub mod reports;

pub use error::{ErrorKind, PipelineError};
pub use pipeline::Pipeline;
