//! Shared data models for the focal-point pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Pixel-space rectangles
//! - Face, interest and color detections
//! - The resolved focal point
//! - The harness <-> worker message protocol

pub mod detection;
pub mod focal;
pub mod processing;
pub mod protocol;
pub mod rect;

// Re-export common types
pub use detection::{
    ColorSample, FaceCandidate, FaceSource, InterestCandidate, InterestMethod, RawDetections,
};
pub use focal::{FocalPoint, FocalPointType};
pub use processing::{ErrorKind, ProcessingConfig, ProcessingError, ProcessingResult, StageTimings};
pub use protocol::{decode_line, encode_line, HarnessMessage, RequestId, WorkerMessage};
pub use rect::Rect;
