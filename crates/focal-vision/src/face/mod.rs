//! Face Detector: ordered chain of a neural SSD detector and a cascade
//! fallback, followed by a minimum-size filter.

mod cascade;
mod ssd;

pub use cascade::{score_to_confidence, CascadeFaceDetector};
pub use ssd::{
    decode_detection_out, decode_with_priors, generate_priors, non_maximum_suppression, Prior,
    SsdFaceDetector,
};

use focal_models::FaceCandidate;
use image::{DynamicImage, GenericImageView};
use tracing::{debug, info, warn};

use crate::config::FaceDetectorConfig;
use crate::error::VisionResult;
use crate::resources::RequestScope;

/// One detector in the chain.
pub trait FaceBackend {
    fn name(&self) -> &'static str;

    /// Faces in pixel coordinates of `image`, before size filtering.
    fn detect(&self, image: &DynamicImage, scope: &RequestScope<'_>) -> VisionResult<Vec<FaceCandidate>>;
}

impl FaceBackend for SsdFaceDetector {
    fn name(&self) -> &'static str {
        "neural"
    }

    fn detect(&self, image: &DynamicImage, scope: &RequestScope<'_>) -> VisionResult<Vec<FaceCandidate>> {
        SsdFaceDetector::detect(self, image, scope)
    }
}

impl FaceBackend for CascadeFaceDetector {
    fn name(&self) -> &'static str {
        "cascade"
    }

    fn detect(&self, image: &DynamicImage, scope: &RequestScope<'_>) -> VisionResult<Vec<FaceCandidate>> {
        CascadeFaceDetector::detect(self, image, scope)
    }
}

/// Runs backends in order and accepts the first result that still has
/// faces after the minimum-size filter.
pub struct FaceDetector {
    chain: Vec<Box<dyn FaceBackend>>,
    min_face_fraction: f64,
}

impl FaceDetector {
    /// Build the chain from configured model paths.
    ///
    /// A backend without a configured path is skipped. A configured model
    /// that fails to load is an initialization error.
    pub fn from_config(config: &FaceDetectorConfig) -> VisionResult<Self> {
        let mut chain: Vec<Box<dyn FaceBackend>> = Vec::new();

        if let Some(path) = &config.model_path {
            chain.push(Box::new(SsdFaceDetector::new(path, config.clone())?));
        }
        if let Some(path) = &config.cascade_model_path {
            chain.push(Box::new(CascadeFaceDetector::new(path, config.clone())?));
        }

        if chain.is_empty() {
            warn!("No face models configured; face detection disabled");
        } else {
            info!(
                backends = ?chain.iter().map(|b| b.name()).collect::<Vec<_>>(),
                "Face detector chain ready"
            );
        }

        Ok(Self::with_chain(chain, config.min_face_fraction))
    }

    pub fn with_chain(chain: Vec<Box<dyn FaceBackend>>, min_face_fraction: f64) -> Self {
        Self {
            chain,
            min_face_fraction,
        }
    }

    /// True when at least one backend is loaded.
    pub fn is_available(&self) -> bool {
        !self.chain.is_empty()
    }

    pub fn backends(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.chain.iter().map(|b| b.name())
    }

    /// Detect faces. An empty result is not an error.
    ///
    /// A backend that fails is logged and the next one is tried; the error
    /// is returned only when every backend failed.
    pub fn detect(&self, image: &DynamicImage, scope: &RequestScope<'_>) -> VisionResult<Vec<FaceCandidate>> {
        let (width, height) = image.dimensions();
        let mut last_error = None;
        let mut any_succeeded = false;

        for backend in &self.chain {
            match backend.detect(image, scope) {
                Ok(faces) => {
                    any_succeeded = true;
                    let found = faces.len();
                    let kept = filter_small_faces(faces, width, height, self.min_face_fraction);
                    if !kept.is_empty() {
                        debug!(backend = backend.name(), found, kept = kept.len(), "Faces detected");
                        return Ok(kept);
                    }
                    debug!(backend = backend.name(), found, "No usable faces; trying next backend");
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "Face backend failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !any_succeeded => Err(e),
            _ => Ok(Vec::new()),
        }
    }
}

/// Drop faces narrower or shorter than `min_fraction` of the image.
pub fn filter_small_faces(
    faces: Vec<FaceCandidate>,
    image_width: u32,
    image_height: u32,
    min_fraction: f64,
) -> Vec<FaceCandidate> {
    let min_w = image_width as f64 * min_fraction;
    let min_h = image_height as f64 * min_fraction;
    faces
        .into_iter()
        .filter(|f| f.width >= min_w && f.height >= min_h)
        .collect()
}
