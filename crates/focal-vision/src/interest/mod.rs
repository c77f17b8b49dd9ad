//! Interest Detector: visual-interest regions for images without faces.
//!
//! Three extractors run over a downscaled grayscale working copy:
//! - feature clusters (FAST corners grouped by proximity)
//! - multi-scale sliding windows (contrast, brightness, edge density)
//! - gradient regions (bright/dark textured windows)
//!
//! Their candidates are restricted to the safe zone, deduplicated, given a
//! heuristic confidence, and ranked by `score * confidence`.

pub mod features;
pub mod stats;
pub mod windows;

use focal_models::{InterestCandidate, InterestMethod, Rect};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use tracing::debug;

use crate::config::{InterestConfig, SelectionThresholds};
use crate::resources::RequestScope;
use stats::WindowStats;

/// Extractors in the order they run.
const EXTRACTORS: [InterestMethod; 3] = [
    InterestMethod::FeatureCluster,
    InterestMethod::SlidingWindow,
    InterestMethod::Gradient,
];

// === Confidence heuristics ===
const BASE_CONFIDENCE: f64 = 0.4;
const THIRDS_BONUS: f64 = 0.25;
/// Normalized distance from a thirds intersection where the bonus reaches zero.
const THIRDS_FALLOFF: f64 = 0.2;
const AREA_BONUS: f64 = 0.2;
const PREFERRED_AREA: (f64, f64) = (0.08, 0.35);
const DENSE_CLUSTER_BONUS: f64 = 0.15;
const DENSE_CLUSTER_FEATURES: u32 = 5;
const GRADIENT_BONUS: f64 = 0.1;
const WINDOW_BONUS: f64 = 0.05;
const MIN_CONFIDENCE: f64 = 0.2;

/// Ranked candidates plus the selected one, in source-image pixels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterestAnalysis {
    /// All surviving candidates, best `score * confidence` first
    pub candidates: Vec<InterestCandidate>,
    /// Best candidate passing the selection thresholds
    pub best: Option<InterestCandidate>,
}

pub struct InterestDetector {
    config: InterestConfig,
}

impl InterestDetector {
    pub fn new(config: InterestConfig) -> Self {
        Self { config }
    }

    /// Find interest regions in `image`.
    pub fn detect(&self, image: &DynamicImage, scope: &RequestScope<'_>) -> InterestAnalysis {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return InterestAnalysis::default();
        }

        let max_dim = width.max(height);
        let bound = self.config.max_working_dimension.max(1);
        let scale = if max_dim > bound {
            bound as f64 / max_dim as f64
        } else {
            1.0
        };

        let gray = if scale < 1.0 {
            let w = ((width as f64 * scale).round() as u32).max(1);
            let h = ((height as f64 * scale).round() as u32).max(1);
            let small = scope.track("interest_resized", image.resize_exact(w, h, FilterType::Triangle));
            scope.track("interest_gray", small.to_luma8())
        } else {
            scope.track("interest_gray", image.to_luma8())
        };

        let mut analysis = self.analyze_gray(&gray, scope);
        let to_source = 1.0 / scale;
        for c in analysis.candidates.iter_mut().chain(analysis.best.iter_mut()) {
            *c = rescale(c, to_source, width as f64, height as f64);
        }
        analysis
    }

    /// Run the extractors on a working-resolution grayscale image.
    pub fn analyze_gray(&self, gray: &GrayImage, scope: &RequestScope<'_>) -> InterestAnalysis {
        let (w, h) = (gray.width() as f64, gray.height() as f64);
        let stats = WindowStats::new(gray, self.config.edge_magnitude, scope);

        let mut raw = Vec::new();
        for method in EXTRACTORS {
            let found = self.run_extractor(method, gray, &stats);
            debug!(method = %method, count = found.len(), "Interest extractor finished");
            raw.extend(found);
        }

        let zoned = restrict_to_safe_zone(raw, w, h, self.config.safe_zone_margin);
        let mut candidates = deduplicate(zoned, self.config.dedup_iou);
        for c in &mut candidates {
            c.confidence = confidence(c, w, h);
        }
        candidates.sort_by(|a, b| b.weighted_score().total_cmp(&a.weighted_score()));

        let best = select_best(&candidates, &self.config.selection);
        InterestAnalysis { candidates, best }
    }

    fn run_extractor(
        &self,
        method: InterestMethod,
        gray: &GrayImage,
        stats: &WindowStats<'_>,
    ) -> Vec<InterestCandidate> {
        match method {
            InterestMethod::FeatureCluster => features::extract(gray, &self.config),
            InterestMethod::SlidingWindow => windows::sliding_windows(stats, &self.config),
            InterestMethod::Gradient => windows::gradient_regions(stats, &self.config),
        }
    }
}

fn rescale(c: &InterestCandidate, factor: f64, width: f64, height: f64) -> InterestCandidate {
    let rect = c.rect().scale(factor).clip_to(width, height);
    InterestCandidate {
        x: rect.x,
        y: rect.y,
        width: rect.width,
        height: rect.height,
        ..*c
    }
}

/// Inset region excluding `margin` of each dimension along every edge.
pub fn safe_zone(width: f64, height: f64, margin: f64) -> Rect {
    let mx = width * margin;
    let my = height * margin;
    Rect::new(mx, my, (width - 2.0 * mx).max(0.0), (height - 2.0 * my).max(0.0))
}

/// Clip candidates to the safe zone. Candidates keeping less than half of
/// their area are dropped.
pub fn restrict_to_safe_zone(
    candidates: Vec<InterestCandidate>,
    width: f64,
    height: f64,
    margin: f64,
) -> Vec<InterestCandidate> {
    let zone = safe_zone(width, height, margin);
    candidates
        .into_iter()
        .filter_map(|c| {
            let rect = c.rect();
            let inside = rect.intersection(&zone)?;
            if inside.area() < rect.area() * 0.5 {
                return None;
            }
            Some(InterestCandidate {
                x: inside.x,
                y: inside.y,
                width: inside.width,
                height: inside.height,
                ..c
            })
        })
        .collect()
}

/// Keep the highest-scoring candidate of every group overlapping above
/// `iou_threshold`. Applying it twice gives the same set.
pub fn deduplicate(mut candidates: Vec<InterestCandidate>, iou_threshold: f64) -> Vec<InterestCandidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<InterestCandidate> = Vec::with_capacity(candidates.len());
    for c in candidates {
        let rect = c.rect();
        if kept.iter().all(|k| k.rect().iou(&rect) <= iou_threshold) {
            kept.push(c);
        }
    }
    kept
}

/// Heuristic confidence in [0.2, 1.0].
pub fn confidence(candidate: &InterestCandidate, width: f64, height: f64) -> f64 {
    if width <= 0.0 || height <= 0.0 {
        return MIN_CONFIDENCE;
    }

    let mut conf = BASE_CONFIDENCE;

    // Rule of thirds
    let (cx, cy) = (candidate.rect().cx() / width, candidate.rect().cy() / height);
    let nearest = [1.0 / 3.0, 2.0 / 3.0]
        .iter()
        .flat_map(|&tx| [1.0 / 3.0, 2.0 / 3.0].map(move |ty| (tx, ty)))
        .map(|(tx, ty)| ((cx - tx).powi(2) + (cy - ty).powi(2)).sqrt())
        .fold(f64::INFINITY, f64::min);
    conf += THIRDS_BONUS * (1.0 - (nearest / THIRDS_FALLOFF).min(1.0));

    // Preferred area
    let ratio = candidate.rect().area() / (width * height);
    if (PREFERRED_AREA.0..=PREFERRED_AREA.1).contains(&ratio) {
        conf += AREA_BONUS;
    } else if ratio < PREFERRED_AREA.0 {
        conf += AREA_BONUS * ratio / PREFERRED_AREA.0;
    }

    conf += match candidate.method {
        InterestMethod::FeatureCluster
            if candidate.feature_count.unwrap_or(0) >= DENSE_CLUSTER_FEATURES =>
        {
            DENSE_CLUSTER_BONUS
        }
        InterestMethod::FeatureCluster => 0.0,
        InterestMethod::Gradient => GRADIENT_BONUS,
        InterestMethod::SlidingWindow => WINDOW_BONUS,
    };

    conf.clamp(MIN_CONFIDENCE, 1.0)
}

/// Candidate with the highest `score * confidence` among those meeting
/// both thresholds.
pub fn select_best(candidates: &[InterestCandidate], thresholds: &SelectionThresholds) -> Option<InterestCandidate> {
    candidates
        .iter()
        .filter(|c| c.confidence >= thresholds.min_confidence && c.score >= thresholds.min_score)
        .max_by(|a, b| a.weighted_score().total_cmp(&b.weighted_score()))
        .copied()
}
