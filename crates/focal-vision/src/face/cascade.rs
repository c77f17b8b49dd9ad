//! Cascade face detector backed by the `rustface` crate (SeetaFace funnel
//! cascade). Weaker than the SSD model; used only when it finds nothing.

use std::io::Cursor;
use std::path::Path;

use focal_models::{FaceCandidate, FaceSource, Rect};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tracing::{debug, info};

use crate::config::FaceDetectorConfig;
use crate::error::{VisionError, VisionResult};
use crate::resources::RequestScope;

/// Raw cascade scores are unbounded; this sets where the mapped
/// confidence reaches ~63%.
const SCORE_SCALE: f64 = 5.0;

pub struct CascadeFaceDetector {
    model: rustface::Model,
    config: FaceDetectorConfig,
}

impl CascadeFaceDetector {
    /// Load a SeetaFace model file.
    pub fn new(path: &Path, config: FaceDetectorConfig) -> VisionResult<Self> {
        if !path.exists() {
            return Err(VisionError::model_not_found(path.display().to_string()));
        }

        let bytes = std::fs::read(path)
            .map_err(|e| VisionError::detector_init(format!("Failed to read cascade model: {}", e)))?;
        let model = rustface::read_model(Cursor::new(bytes))
            .map_err(|e| VisionError::detector_init(format!("Failed to parse cascade model: {}", e)))?;

        info!(
            model_path = %path.display(),
            min_face_size = config.cascade_min_face_size,
            "Cascade face detector initialized"
        );

        Ok(Self { model, config })
    }

    /// Detect faces on a grayscale copy, downscaled to the configured
    /// bound first. Boxes are returned in the input image's pixel space.
    pub fn detect(
        &self,
        image: &DynamicImage,
        scope: &RequestScope<'_>,
    ) -> VisionResult<Vec<FaceCandidate>> {
        let (width, height) = image.dimensions();
        let max_dim = width.max(height);
        let bound = self.config.cascade_max_dimension.max(1);

        let (gray, scale) = if max_dim > bound {
            let scale = bound as f64 / max_dim as f64;
            let w = ((width as f64 * scale).round() as u32).max(1);
            let h = ((height as f64 * scale).round() as u32).max(1);
            let small = scope.track("cascade_resized", image.resize_exact(w, h, FilterType::Triangle));
            (scope.track("cascade_gray", small.to_luma8()), scale)
        } else {
            (scope.track("cascade_gray", image.to_luma8()), 1.0)
        };

        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.config.cascade_min_face_size);
        detector.set_score_thresh(self.config.cascade_score_threshold);
        detector.set_pyramid_scale_factor(self.config.cascade_pyramid_scale);
        detector.set_slide_window_step(self.config.cascade_window_step, self.config.cascade_window_step);

        let faces = detector.detect(&rustface::ImageData::new(gray.as_raw(), gray.width(), gray.height()));

        let candidates: Vec<FaceCandidate> = faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                let rect = Rect::new(
                    bbox.x() as f64,
                    bbox.y() as f64,
                    bbox.width() as f64,
                    bbox.height() as f64,
                )
                .scale(1.0 / scale)
                .clip_to(width as f64, height as f64);
                FaceCandidate::new(rect, score_to_confidence(face.score()), FaceSource::Cascade)
            })
            .filter(|f| !f.rect().is_empty())
            .collect();

        debug!(count = candidates.len(), scale, "Cascade face detection completed");
        Ok(candidates)
    }
}

/// Map a raw cascade score into (0, 1).
pub fn score_to_confidence(score: f64) -> f64 {
    if score <= 0.0 {
        return 0.0;
    }
    1.0 - (-score / SCORE_SCALE).exp()
}
