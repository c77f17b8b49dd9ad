//! Feature-cluster extractor: FAST corners grouped by proximity.

use focal_models::{InterestCandidate, InterestMethod, Rect};
use image::GrayImage;
use imageproc::corners::corners_fast9;

use crate::config::InterestConfig;

/// A kept corner in working-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeaturePoint {
    pub x: f64,
    pub y: f64,
    pub score: f64,
}

/// Strongest FAST-9 corners, at least `min_feature_distance` apart.
pub fn find_features(gray: &GrayImage, config: &InterestConfig) -> Vec<FeaturePoint> {
    let mut corners = corners_fast9(gray, config.fast_threshold);
    corners.sort_by(|a, b| b.score.total_cmp(&a.score));

    let min_dist_sq = config.min_feature_distance * config.min_feature_distance;
    let mut kept: Vec<FeaturePoint> = Vec::with_capacity(config.max_features);

    for corner in corners {
        if kept.len() >= config.max_features {
            break;
        }
        let point = FeaturePoint {
            x: corner.x as f64,
            y: corner.y as f64,
            score: corner.score as f64,
        };
        let crowded = kept.iter().any(|k| {
            let (dx, dy) = (k.x - point.x, k.y - point.y);
            dx * dx + dy * dy < min_dist_sq
        });
        if !crowded {
            kept.push(point);
        }
    }

    kept
}

/// Greedy seed clustering: the strongest unassigned point claims every
/// unassigned point within `radius`.
pub fn cluster_points(points: &[FeaturePoint], radius: f64) -> Vec<Vec<FeaturePoint>> {
    let radius_sq = radius * radius;
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| points[b].score.total_cmp(&points[a].score));

    let mut assigned = vec![false; points.len()];
    let mut clusters = Vec::new();

    for &seed in &order {
        if assigned[seed] {
            continue;
        }
        let s = points[seed];
        let members: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&i| {
                let (dx, dy) = (points[i].x - s.x, points[i].y - s.y);
                !assigned[i] && dx * dx + dy * dy <= radius_sq
            })
            .collect();

        for &i in &members {
            assigned[i] = true;
        }
        clusters.push(members.into_iter().map(|i| points[i]).collect());
    }

    clusters
}

/// Padding ratio for a cluster of `count` points: dense clusters get less.
pub fn adaptive_padding(count: usize, config: &InterestConfig) -> f64 {
    if count >= 10 {
        config.dense_padding
    } else if count >= 5 {
        (config.dense_padding + config.sparse_padding) / 2.0
    } else {
        config.sparse_padding
    }
}

/// Turn one cluster into a box: padded extent, area clamped to the
/// configured share of the image, optionally squared, kept inside the image.
pub fn cluster_box(cluster: &[FeaturePoint], width: f64, height: f64, config: &InterestConfig) -> Option<Rect> {
    let rects: Vec<Rect> = cluster.iter().map(|p| Rect::new(p.x, p.y, 0.0, 0.0)).collect();
    let extent = Rect::union(&rects)?;

    let padding = adaptive_padding(cluster.len(), config);
    let mut w = extent.width * (1.0 + 2.0 * padding);
    let mut h = extent.height * (1.0 + 2.0 * padding);

    let image_area = width * height;
    let min_area = image_area * config.min_cluster_area;
    let max_area = image_area * config.max_cluster_area;

    if config.prefer_square {
        let side = w.max(h);
        w = side;
        h = side;
    }

    // Degenerate (colinear) clusters grow along the flat axis first
    if w <= f64::EPSILON || h <= f64::EPSILON {
        let side = w.max(h).max(min_area.sqrt());
        w = side;
        h = side;
    }

    let area = w * h;
    if area < min_area || area > max_area {
        let target = area.clamp(min_area, max_area);
        let factor = (target / area).sqrt();
        w *= factor;
        h *= factor;
    }

    let bounds = Rect::new(0.0, 0.0, width, height);
    Some(Rect::centered(extent.cx(), extent.cy(), w, h).shift_into(&bounds))
}

/// Run the extractor over the working image.
pub fn extract(gray: &GrayImage, config: &InterestConfig) -> Vec<InterestCandidate> {
    let (width, height) = (gray.width() as f64, gray.height() as f64);
    let points = find_features(gray, config);

    cluster_points(&points, config.cluster_radius)
        .into_iter()
        .filter(|c| c.len() >= config.min_cluster_points)
        .filter_map(|cluster| {
            let rect = cluster_box(&cluster, width, height, config)?;
            let n = cluster.len();
            let avg_strength = cluster.iter().map(|p| p.score).sum::<f64>() / n as f64;
            let score = n as f64 * 8.0 + avg_strength * 0.5;
            Some(
                InterestCandidate::new(rect, score, InterestMethod::FeatureCluster)
                    .with_feature_count(n as u32),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn point(x: f64, y: f64, score: f64) -> FeaturePoint {
        FeaturePoint { x, y, score }
    }

    #[test]
    fn test_cluster_points_by_radius() {
        let points = vec![
            point(10.0, 10.0, 50.0),
            point(30.0, 20.0, 40.0),
            point(50.0, 10.0, 30.0),
            point(400.0, 400.0, 60.0),
        ];

        let clusters = cluster_points(&points, 120.0);
        assert_eq!(clusters.len(), 2);
        // Strongest point seeds first
        assert_eq!(clusters[0].len(), 1);
        assert_eq!(clusters[1].len(), 3);
    }

    #[test]
    fn test_adaptive_padding() {
        let config = InterestConfig::default();
        assert!(adaptive_padding(3, &config) > adaptive_padding(6, &config));
        assert!(adaptive_padding(6, &config) > adaptive_padding(12, &config));
    }

    #[test]
    fn test_cluster_box_area_is_clamped() {
        let config = InterestConfig::default();
        let cluster = vec![point(100.0, 100.0, 1.0), point(104.0, 102.0, 1.0), point(102.0, 106.0, 1.0)];

        let rect = cluster_box(&cluster, 1000.0, 1000.0, &config).unwrap();
        let ratio = rect.area() / 1_000_000.0;
        assert!((ratio - 0.08).abs() < 1e-6, "ratio {ratio}");
        assert!((rect.width - rect.height).abs() < 1e-9);
        assert!(rect.is_within(1000.0, 1000.0));

        let wide = vec![point(0.0, 0.0, 1.0), point(900.0, 900.0, 1.0), point(450.0, 450.0, 1.0)];
        let rect = cluster_box(&wide, 1000.0, 1000.0, &config).unwrap();
        assert!((rect.area() / 1_000_000.0 - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_extract_finds_checkerboard() {
        let gray = GrayImage::from_fn(300, 300, |x, y| {
            let inside = (100..180).contains(&x) && (100..180).contains(&y);
            if inside && ((x / 10 + y / 10) % 2 == 0) {
                Luma([240])
            } else if inside {
                Luma([20])
            } else {
                Luma([128])
            }
        });

        let candidates = extract(&gray, &InterestConfig::default());
        assert!(!candidates.is_empty());
        let best = candidates
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .unwrap();
        assert!(best.feature_count.unwrap() >= 3);
        assert!(best.rect().intersection(&Rect::new(100.0, 100.0, 80.0, 80.0)).is_some());
    }
}
