//! Color Analyzer: dominant colors via k-means over sampled pixels.
//!
//! Ranking deliberately favours vivid accent colors over frequent dull
//! ones; the output drives UI theming only.

use focal_models::ColorSample;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::ColorConfig;
use crate::resources::RequestScope;

/// Value (brightness) the brightness curve peaks at.
const PEAK_BRIGHTNESS: f64 = 0.6;

pub struct ColorAnalyzer {
    config: ColorConfig,
}

impl ColorAnalyzer {
    pub fn new(config: ColorConfig) -> Self {
        Self { config }
    }

    /// Dominant colors, most important first.
    pub fn analyze(&self, image: &DynamicImage, scope: &RequestScope<'_>) -> Vec<ColorSample> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let bound = self.config.max_dimension.max(1);
        let rgb = if width.max(height) > bound {
            let small = scope.track("color_resized", image.resize(bound, bound, FilterType::Triangle));
            scope.track("color_rgb", small.to_rgb8())
        } else {
            scope.track("color_rgb", image.to_rgb8())
        };

        let pixels: Vec<[f64; 3]> = rgb
            .pixels()
            .map(|p| [p[0] as f64, p[1] as f64, p[2] as f64])
            .collect();
        let pixels = scope.track("color_pixels", pixels);
        let samples = scope.track("color_samples", sample_pixels(&pixels, self.config.max_samples));
        drop(pixels);

        let clusters = kmeans(&samples, &self.config);
        let colors = self.score_clusters(&clusters, samples.len());
        debug!(
            samples = samples.len(),
            clusters = clusters.len(),
            colors = colors.len(),
            "Color analysis completed"
        );
        colors
    }

    fn score_clusters(&self, clusters: &[Cluster], total: usize) -> Vec<ColorSample> {
        if total == 0 {
            return Vec::new();
        }

        let mut colors: Vec<ColorSample> = clusters
            .iter()
            .filter(|c| c.count > 0)
            .map(|c| {
                let rgb = [
                    c.center[0].round().clamp(0.0, 255.0) as u8,
                    c.center[1].round().clamp(0.0, 255.0) as u8,
                    c.center[2].round().clamp(0.0, 255.0) as u8,
                ];
                let hsv = rgb_to_hsv(rgb);
                let percentage = c.count as f64 / total as f64 * 100.0;
                ColorSample {
                    rgb,
                    hsv,
                    percentage,
                    unified_score: self.unified_score(percentage / 100.0, hsv[1], hsv[2]),
                }
            })
            .filter(|s| s.percentage >= self.config.min_percentage)
            .collect();

        colors.sort_by(|a, b| b.unified_score.total_cmp(&a.unified_score));
        colors.truncate(self.config.max_colors);
        colors
    }

    /// Weighted frequency, saturation and brightness, boosted for vivid
    /// colors in proportion to their frequency.
    pub fn unified_score(&self, frequency: f64, saturation: f64, value: f64) -> f64 {
        let base = frequency * self.config.weight_frequency
            + saturation * self.config.weight_saturation
            + brightness_curve(value) * self.config.weight_brightness;

        let boost = if saturation > 0.8 {
            0.5
        } else if saturation > 0.6 {
            0.25
        } else {
            0.0
        };
        base * (1.0 + boost * (0.5 + 0.5 * frequency))
    }
}

/// Peaks at 1.0 for value 0.6 and falls linearly to 0 at 0.0 and 1.2.
pub fn brightness_curve(value: f64) -> f64 {
    (1.0 - (value - PEAK_BRIGHTNESS).abs() / PEAK_BRIGHTNESS).max(0.0)
}

/// Evenly strided subset of at most `max_samples` pixels.
pub fn sample_pixels(pixels: &[[f64; 3]], max_samples: usize) -> Vec<[f64; 3]> {
    if pixels.len() <= max_samples || max_samples == 0 {
        return pixels.to_vec();
    }
    let stride = pixels.len().div_ceil(max_samples);
    pixels.iter().step_by(stride).copied().collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub center: [f64; 3],
    pub count: usize,
}

fn distance_sq(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)
}

fn nearest(point: &[f64; 3], centers: &[[f64; 3]]) -> usize {
    centers
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| distance_sq(point, a).total_cmp(&distance_sq(point, b)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// k-means with k-means++ seeding from a fixed seed.
///
/// Seeding stops early once every sample sits on a center, so an image
/// with fewer distinct colors than `k` yields fewer clusters.
pub fn kmeans(samples: &[[f64; 3]], config: &ColorConfig) -> Vec<Cluster> {
    if samples.is_empty() || config.clusters == 0 {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut centers = vec![samples[rng.random_range(0..samples.len())]];

    while centers.len() < config.clusters {
        let weights: Vec<f64> = samples
            .iter()
            .map(|s| centers.iter().map(|c| distance_sq(s, c)).fold(f64::INFINITY, f64::min))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            break;
        }

        let mut target = rng.random::<f64>() * total;
        let mut chosen = samples.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if target < *w {
                chosen = i;
                break;
            }
            target -= w;
        }
        centers.push(samples[chosen]);
    }

    let mut assignment = vec![0usize; samples.len()];
    for iteration in 0..config.max_iterations.max(1) {
        for (i, s) in samples.iter().enumerate() {
            assignment[i] = nearest(s, &centers);
        }

        let mut sums = vec![[0.0f64; 3]; centers.len()];
        let mut counts = vec![0usize; centers.len()];
        for (s, &k) in samples.iter().zip(&assignment) {
            sums[k][0] += s[0];
            sums[k][1] += s[1];
            sums[k][2] += s[2];
            counts[k] += 1;
        }

        let mut max_shift: f64 = 0.0;
        for (k, center) in centers.iter_mut().enumerate() {
            if counts[k] == 0 {
                continue;
            }
            let n = counts[k] as f64;
            let updated = [sums[k][0] / n, sums[k][1] / n, sums[k][2] / n];
            max_shift = max_shift.max(distance_sq(center, &updated).sqrt());
            *center = updated;
        }

        if max_shift < config.epsilon {
            debug!(iteration, "k-means converged");
            break;
        }
    }

    // Final assignment against the converged centers
    let mut counts = vec![0usize; centers.len()];
    for s in samples {
        counts[nearest(s, &centers)] += 1;
    }

    centers
        .into_iter()
        .zip(counts)
        .map(|(center, count)| Cluster { center, count })
        .collect()
}

/// Hue in degrees [0, 360), saturation and value in [0, 1].
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [f64; 3] {
    let r = rgb[0] as f64 / 255.0;
    let g = rgb[1] as f64 / 255.0;
    let b = rgb[2] as f64 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    let saturation = if max == 0.0 { 0.0 } else { delta / max };
    [hue, saturation, max]
}
