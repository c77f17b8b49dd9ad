//! Per-request configuration snapshot and result payload.

use serde::{Deserialize, Serialize};

use crate::detection::{ColorSample, FaceCandidate, InterestCandidate, RawDetections};

/// Options the caller sends with each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingConfig {
    pub face_detection_enabled: bool,
    /// Render a debug overlay into the result
    pub debug_mode: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            face_detection_enabled: true,
            debug_mode: false,
        }
    }
}

/// Wall-clock time spent in each pipeline stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub normalize_ms: u64,
    pub faces_ms: u64,
    pub interest_ms: u64,
    pub colors_ms: u64,
}

/// Everything the worker detected for one image.
///
/// Deliberately carries no focal point: the caller resolves it from these
/// arrays so cached detections can be re-resolved later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub faces: Vec<FaceCandidate>,
    pub interest_candidates: Vec<InterestCandidate>,
    pub color_samples: Vec<ColorSample>,
    /// Orientation-corrected image width
    pub image_width: u32,
    /// Orientation-corrected image height
    pub image_height: u32,
    #[serde(default)]
    pub timings: StageTimings,
    /// Base64-encoded JPEG overlay (debug mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_image: Option<String>,
}

impl ProcessingResult {
    /// Copy out the cacheable detection arrays.
    pub fn raw_detections(&self) -> RawDetections {
        RawDetections {
            faces: self.faces.clone(),
            interest_candidates: self.interest_candidates.clone(),
            color_samples: self.color_samples.clone(),
        }
    }
}

/// Failure classes that cross the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Image bytes could not be decoded; never retry
    Decode,
    /// A model failed to load; the worker must be restarted
    DetectorInit,
    /// Any other per-request failure; safe to retry
    Transient,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Error payload attached to a failed `PROCESSING_RESULT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProcessingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
