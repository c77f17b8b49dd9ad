//! Focal-point vision pipeline.
//!
//! This crate provides:
//! - Image decoding with EXIF orientation correction
//! - Per-request pixel-buffer tracking with leak detection
//! - Face detection (neural SSD with a cascade fallback)
//! - Visual-interest detection for images without faces
//! - Dominant color analysis
//! - The pure focal point resolver
//! - A debug overlay renderer

pub mod color;
pub mod config;
pub mod debug;
pub mod error;
pub mod face;
pub mod interest;
pub mod normalize;
pub mod pipeline;
pub mod resolver;
pub mod resources;

pub use color::ColorAnalyzer;
pub use config::{
    ColorConfig, FaceDetectorConfig, InterestConfig, ResolverConfig, SelectionThresholds,
    VisionConfig,
};
pub use error::{VisionError, VisionResult};
pub use face::{FaceBackend, FaceDetector};
pub use interest::{InterestAnalysis, InterestDetector};
pub use normalize::{normalize, NormalizedImage};
pub use pipeline::{Analysis, VisionPipeline};
pub use resolver::{resolve, FocalPointResolver};
pub use resources::{RequestScope, ResourceStats, ResourceTracker, Tracked, TrackedBuffer};
