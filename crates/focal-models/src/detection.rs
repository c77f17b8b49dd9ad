//! Raw detections produced by the vision pipeline.
//!
//! These are the arrays a caller may cache per photo; the focal point is
//! always recomputed from them rather than stored.

use serde::{Deserialize, Serialize};

use crate::rect::Rect;

/// Which face detector produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaceSource {
    /// Neural SSD detector (primary)
    Neural,
    /// Sliding-window cascade detector (recall booster)
    Cascade,
}

/// A detected face in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceCandidate {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Detection confidence (0.0-1.0)
    pub confidence: f64,
    pub source: FaceSource,
}

impl FaceCandidate {
    pub fn new(rect: Rect, confidence: f64, source: FaceSource) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            confidence: confidence.clamp(0.0, 1.0),
            source,
        }
    }

    #[inline]
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

/// Signal extractor that produced an interest candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterestMethod {
    /// Clusters of salient corner points
    FeatureCluster,
    /// Multi-scale contrast/brightness/edge window scoring
    SlidingWindow,
    /// Bright or dark high-variance regions
    Gradient,
}

impl InterestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterestMethod::FeatureCluster => "feature-cluster",
            InterestMethod::SlidingWindow => "sliding-window",
            InterestMethod::Gradient => "gradient",
        }
    }
}

impl std::fmt::Display for InterestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A visually interesting region found when no faces are present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestCandidate {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Raw, method-specific strength (unbounded)
    pub score: f64,
    /// Heuristic confidence in [0.2, 1.0]
    pub confidence: f64,
    pub method: InterestMethod,
    /// Number of clustered feature points (feature-cluster only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_count: Option<u32>,
}

impl InterestCandidate {
    /// Create a candidate with a neutral confidence; confidence is assigned
    /// after deduplication.
    pub fn new(rect: Rect, score: f64, method: InterestMethod) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            score,
            confidence: 0.0,
            method,
            feature_count: None,
        }
    }

    pub fn with_feature_count(mut self, count: u32) -> Self {
        self.feature_count = Some(count);
        self
    }

    #[inline]
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    /// Ranking key used for final selection.
    #[inline]
    pub fn weighted_score(&self) -> f64 {
        self.score * self.confidence
    }
}

/// One dominant color of an image, used for UI accents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorSample {
    pub rgb: [u8; 3],
    /// Hue in degrees [0, 360), saturation and value in [0, 1]
    pub hsv: [f64; 3],
    /// Share of sampled pixels in this cluster (0-100)
    pub percentage: f64,
    pub unified_score: f64,
}

impl ColorSample {
    /// CSS-style hex string, e.g. `#ff8800`.
    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.rgb[0], self.rgb[1], self.rgb[2])
    }
}

/// The raw detection arrays for one photo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDetections {
    pub faces: Vec<FaceCandidate>,
    pub interest_candidates: Vec<InterestCandidate>,
    pub color_samples: Vec<ColorSample>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_method_wire_names() {
        let json = serde_json::to_string(&InterestMethod::FeatureCluster).unwrap();
        assert_eq!(json, "\"feature-cluster\"");

        let parsed: InterestMethod = serde_json::from_str("\"sliding-window\"").unwrap();
        assert_eq!(parsed, InterestMethod::SlidingWindow);
        assert_eq!(InterestMethod::Gradient.to_string(), "gradient");
    }

    #[test]
    fn test_face_confidence_is_clamped() {
        let face = FaceCandidate::new(Rect::new(0.0, 0.0, 10.0, 10.0), 1.7, FaceSource::Neural);
        assert_eq!(face.confidence, 1.0);
    }

    #[test]
    fn test_color_hex() {
        let sample = ColorSample {
            rgb: [255, 136, 0],
            hsv: [32.0, 1.0, 1.0],
            percentage: 50.0,
            unified_score: 0.5,
        };
        assert_eq!(sample.hex(), "#ff8800");
    }
}
