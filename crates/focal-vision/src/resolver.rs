//! Focal Point Resolver.
//!
//! Pure decision from raw detections to one focal rectangle, in priority
//! order: faces, then the best interest candidate, then a center crop.
//! Deterministic so a caller can recompute it from cached detections.

use focal_models::{FaceCandidate, FocalPoint, FocalPointType, InterestCandidate, Rect};

use crate::config::ResolverConfig;
use crate::interest::select_best;

/// Method tag for a single detected face.
pub const METHOD_SINGLE_FACE: &str = "single-face";
/// Method tag for the union of several faces.
pub const METHOD_MULTI_FACE: &str = "multi-face-bounds";
/// Fallback reason used when nothing was detected.
pub const REASON_NO_DETECTIONS: &str = "no-detections";

#[derive(Debug, Clone, Copy, Default)]
pub struct FocalPointResolver {
    config: ResolverConfig,
}

impl FocalPointResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Resolve the focal point for an image of `width` × `height` pixels.
    ///
    /// `fallback_reason` becomes the method tag when the center crop is used.
    pub fn resolve(
        &self,
        faces: &[FaceCandidate],
        interest: &[InterestCandidate],
        width: f64,
        height: f64,
        fallback_reason: &str,
    ) -> FocalPoint {
        let focal = if let Some(fp) = self.from_faces(faces) {
            fp
        } else if let Some(best) = select_best(interest, &self.config.interest) {
            FocalPoint::new(
                best.rect(),
                FocalPointType::Interest,
                best.method.as_str(),
                Some(best.confidence),
            )
        } else {
            FocalPoint::center_fallback(width, height, fallback_reason)
        };

        clamp_to_image(focal, width, height)
    }

    fn from_faces(&self, faces: &[FaceCandidate]) -> Option<FocalPoint> {
        let confidence = faces.iter().map(|f| f.confidence).fold(None, |acc: Option<f64>, c| {
            Some(acc.map_or(c, |a| a.max(c)))
        })?;

        if let [face] = faces {
            return Some(FocalPoint::new(
                face.rect(),
                FocalPointType::Face,
                METHOD_SINGLE_FACE,
                Some(confidence),
            ));
        }

        let rects: Vec<Rect> = faces.iter().map(FaceCandidate::rect).collect();
        let bounds = Rect::union(&rects)?;
        let padded = if self.config.multi_face_padding > 0.0 {
            bounds.pad(bounds.width.max(bounds.height) * self.config.multi_face_padding)
        } else {
            bounds
        };

        Some(FocalPoint::new(
            padded,
            FocalPointType::Face,
            METHOD_MULTI_FACE,
            Some(confidence),
        ))
    }
}

fn clamp_to_image(focal: FocalPoint, width: f64, height: f64) -> FocalPoint {
    let rect = focal.rect().clip_to(width.max(0.0), height.max(0.0));
    FocalPoint {
        x: rect.x,
        y: rect.y,
        width: rect.width,
        height: rect.height,
        ..focal
    }
}

/// Resolve with default thresholds and no multi-face padding.
pub fn resolve(
    faces: &[FaceCandidate],
    interest: &[InterestCandidate],
    width: f64,
    height: f64,
    fallback_reason: &str,
) -> FocalPoint {
    FocalPointResolver::default().resolve(faces, interest, width, height, fallback_reason)
}
