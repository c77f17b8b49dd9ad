//! Crash-isolated focal point worker.
//!
//! This crate provides:
//! - The worker process loop that hosts the vision pipeline
//! - The supervising harness (timeouts, liveness probe, restarts)
//! - The caller-facing service with image source and cache seams
//! - Tracing setup shared by the binaries

pub mod config;
pub mod error;
pub mod harness;
pub mod logging;
pub mod retry;
pub mod service;
pub mod worker;

pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult};
pub use harness::{HarnessState, HarnessStats, WorkerHarness, WorkerHealth};
pub use logging::{init_tracing, RequestLogger};
pub use service::{
    CachedDetections, DetectionCache, FocalOutcome, FocalPointService, FocalSource, ImageAnalyzer,
    ImageSource, InMemoryDetectionCache, SourceImage,
};
pub use worker::WorkerExit;
