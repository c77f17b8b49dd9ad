//! Error types for vision operations.

use focal_models::ErrorKind;
use thiserror::Error;

/// Result type for vision operations.
pub type VisionResult<T> = Result<T, VisionError>;

/// Errors that can occur while analyzing an image.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Image decode failed: {0}")]
    Decode(String),

    #[error("Detector initialization failed: {0}")]
    DetectorInit(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VisionError {
    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Create a detector initialization error.
    pub fn detector_init(message: impl Into<String>) -> Self {
        Self::DetectorInit(message.into())
    }

    /// Create a transient processing error.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    /// Create a model not found error.
    pub fn model_not_found(path: impl Into<String>) -> Self {
        Self::ModelNotFound(path.into())
    }

    /// Failure class reported across the process boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VisionError::Decode(_) => ErrorKind::Decode,
            VisionError::DetectorInit(_) | VisionError::ModelNotFound(_) => ErrorKind::DetectorInit,
            VisionError::Processing(_) | VisionError::Io(_) => ErrorKind::Transient,
        }
    }

    /// Check if retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<image::ImageError> for VisionError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(e) => VisionError::Io(e),
            other => VisionError::Decode(other.to_string()),
        }
    }
}
