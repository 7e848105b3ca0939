//! Live statistics over the Wikimedia recent-changes stream.
//!
//! Three independent pipelines read `wikimedia.recentchange` and publish:
//! running bot / non-bot edit counts, per-website edit counts over one-minute
//! windows, and total edit volume over ten-second windows.
//!
//! ## Error logging
//!
//! Log errors with `{e:#}` or `error = ?e` so the cause chain stays visible,
//! and build `anyhow` errors with `.context()` rather than formatting the
//! source into a new message.

pub mod config;
pub mod error;
pub mod extract;
pub mod metrics_consts;
pub mod output;
pub mod pipelines;
pub mod server;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod window;
pub mod worker;

pub use pipelines::{Aggregator, Outcome, PipelineKind, SourceRecord};
