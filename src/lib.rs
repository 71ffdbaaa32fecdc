// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod bootstrap;
pub mod categorize;
pub mod classify;
pub mod cli;
pub mod config;
pub mod fetch_state;
pub mod fingerprint;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod pacer;
pub mod pipeline;
pub mod store;
pub mod taxonomy;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::PipelineConfig;
pub use crate::pipeline::{Pipeline, RunSummary};
pub use crate::store::{MemoryStore, NewsStore, SqliteStore};
pub use crate::taxonomy::Category;
