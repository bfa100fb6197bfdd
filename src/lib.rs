// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod analyze;
pub mod api;
pub mod config;
pub mod convert;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod market;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::PipelineConfig;
pub use crate::model::{AnalysisResult, Disclosure, MarketSnapshot, ProcessedDisclosure, Sentiment};
pub use crate::pipeline::{Pipeline, PipelineRun, RunOptions};
pub use crate::scheduler::{Scheduler, Trigger};
