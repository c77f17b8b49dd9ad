//! Window-scanning extractors: multi-scale sliding windows and
//! bright/dark gradient regions.

use focal_models::{InterestCandidate, InterestMethod, Rect};

use super::stats::{Window, WindowStats};
use crate::config::InterestConfig;

/// Contrast saturates at this intensity standard deviation.
const CONTRAST_FULL_STD: f64 = 64.0;
/// Edge score saturates at this edge density.
const EDGE_FULL_DENSITY: f64 = 0.25;

const CONTRAST_WEIGHT: f64 = 0.45;
const BRIGHTNESS_WEIGHT: f64 = 0.2;
const EDGE_WEIGHT: f64 = 0.35;

/// Score one sliding window in [0, 100].
pub fn window_score(window: &Window, preferred_brightness: f64) -> f64 {
    let contrast = (window.std_dev / CONTRAST_FULL_STD).min(1.0) * 100.0;
    let brightness_distance = (window.mean / 255.0 - preferred_brightness).abs();
    let brightness = (1.0 - brightness_distance / preferred_brightness).max(0.0) * 100.0;
    let edges = (window.edge_density / EDGE_FULL_DENSITY).min(1.0) * 100.0;

    CONTRAST_WEIGHT * contrast + BRIGHTNESS_WEIGHT * brightness + EDGE_WEIGHT * edges
}

/// Score one gradient window; zero when it matches no pattern.
pub fn gradient_score(window: &Window) -> f64 {
    let (mean, std) = (window.mean, window.std_dev);
    if mean > 170.0 && std > 40.0 {
        // Bright highlight with texture
        std * 1.5 + (mean - 170.0) * 0.5
    } else if mean < 85.0 && std > 40.0 {
        // Dark region with texture
        std * 1.3 + (85.0 - mean) * 0.3
    } else if std > 50.0 {
        std * 1.2
    } else {
        0.0
    }
}

fn positions(extent: u32, size: u32, step: u32) -> impl Iterator<Item = u32> {
    let last = extent.saturating_sub(size);
    (0..=last).step_by(step.max(1) as usize)
}

fn top_n(mut candidates: Vec<InterestCandidate>, n: usize) -> Vec<InterestCandidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(n);
    candidates
}

/// Scan square windows at each configured scale.
pub fn sliding_windows(stats: &WindowStats<'_>, config: &InterestConfig) -> Vec<InterestCandidate> {
    let (width, height) = (stats.width(), stats.height());
    let max_dim = width.max(height) as f64;
    let min_dim = width.min(height);
    let mut out = Vec::new();

    for &fraction in &config.window_fractions {
        let size = ((max_dim * fraction).round() as u32).max(8);
        if size > min_dim {
            continue;
        }
        let step = ((size as f64 * (1.0 - config.window_overlap)).round() as u32).max(1);

        let mut scale_candidates = Vec::new();
        for y in positions(height, size, step) {
            for x in positions(width, size, step) {
                let window = stats.window(x, y, size, size);
                let score = window_score(&window, config.preferred_brightness);
                if score >= config.window_score_threshold {
                    let rect = Rect::new(x as f64, y as f64, size as f64, size as f64);
                    scale_candidates.push(InterestCandidate::new(rect, score, InterestMethod::SlidingWindow));
                }
            }
        }

        out.extend(top_n(scale_candidates, config.max_windows_per_scale));
    }

    out
}

/// Scan fixed-size windows for bright or dark textured regions.
pub fn gradient_regions(stats: &WindowStats<'_>, config: &InterestConfig) -> Vec<InterestCandidate> {
    let (width, height) = (stats.width(), stats.height());
    let min_dim = width.min(height);
    let size = ((min_dim as f64 * config.gradient_window_fraction).round() as u32).max(16);
    if size > min_dim {
        return Vec::new();
    }
    let step = (size / 2).max(1);

    let mut candidates = Vec::new();
    for y in positions(height, size, step) {
        for x in positions(width, size, step) {
            let score = gradient_score(&stats.window(x, y, size, size));
            if score >= config.gradient_score_threshold {
                let rect = Rect::new(x as f64, y as f64, size as f64, size as f64);
                candidates.push(InterestCandidate::new(rect, score, InterestMethod::Gradient));
            }
        }
    }

    top_n(candidates, config.max_gradient_regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceTracker;
    use image::{GrayImage, Luma};

    fn window(mean: f64, std_dev: f64, edge_density: f64) -> Window {
        Window {
            mean,
            std_dev,
            edge_density,
        }
    }

    #[test]
    fn test_window_score_bounds() {
        let flat = window_score(&window(140.0, 0.0, 0.0), 0.55);
        assert!(flat <= 20.0 + 1e-9);

        let busy = window_score(&window(0.55 * 255.0, 80.0, 0.5), 0.55);
        assert!((busy - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_gradient_patterns() {
        assert!(gradient_score(&window(200.0, 45.0, 0.0)) > 60.0);
        assert!(gradient_score(&window(40.0, 45.0, 0.0)) > 60.0);
        assert_eq!(gradient_score(&window(120.0, 45.0, 0.0)), 0.0);
        assert!((gradient_score(&window(120.0, 60.0, 0.0)) - 72.0).abs() < 1e-9);
    }

    #[test]
    fn test_uniform_image_has_no_windows() {
        let gray = GrayImage::from_pixel(200, 150, Luma([140]));
        let tracker = ResourceTracker::new();
        let scope = tracker.scope("t");
        let stats = WindowStats::new(&gray, 120, &scope);
        let config = InterestConfig::default();

        assert!(sliding_windows(&stats, &config).is_empty());
        assert!(gradient_regions(&stats, &config).is_empty());
    }

    #[test]
    fn test_textured_patch_is_found() {
        let gray = GrayImage::from_fn(400, 300, |x, y| {
            let inside = (200..280).contains(&x) && (100..180).contains(&y);
            if inside && ((x / 8 + y / 8) % 2 == 0) {
                Luma([250])
            } else if inside {
                Luma([10])
            } else {
                Luma([140])
            }
        });
        let tracker = ResourceTracker::new();
        let scope = tracker.scope("t");
        let stats = WindowStats::new(&gray, 120, &scope);
        let config = InterestConfig::default();
        let patch = Rect::new(200.0, 100.0, 80.0, 80.0);

        let windows = sliding_windows(&stats, &config);
        assert!(!windows.is_empty());
        assert!(windows.iter().all(|c| c.rect().intersection(&patch).is_some()));
        assert!(windows.len() <= config.max_windows_per_scale * config.window_fractions.len());

        let regions = gradient_regions(&stats, &config);
        assert!(!regions.is_empty());
        assert!(regions.iter().all(|c| c.method == InterestMethod::Gradient));
    }
}
