//! Configuration for the vision pipeline.
//!
//! Every threshold used by the detectors lives here so it can be tuned
//! without touching the algorithms. `from_env` overrides the values most
//! often changed in deployment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for all analysis stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub face: FaceDetectorConfig,
    pub interest: InterestConfig,
    pub color: ColorConfig,
    pub resolver: ResolverConfig,
}

impl VisionConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.face.model_path = env_path("FOCAL_FACE_MODEL");
        config.face.cascade_model_path = env_path("FOCAL_CASCADE_MODEL");
        config.face.confidence_threshold =
            env_parse("FOCAL_FACE_CONFIDENCE").unwrap_or(config.face.confidence_threshold);
        config.face.nms_threshold =
            env_parse("FOCAL_FACE_NMS").unwrap_or(config.face.nms_threshold);

        config.interest.max_working_dimension = env_parse("FOCAL_INTEREST_MAX_DIMENSION")
            .unwrap_or(config.interest.max_working_dimension);
        config.interest.selection.min_confidence = env_parse("FOCAL_INTEREST_MIN_CONFIDENCE")
            .unwrap_or(config.interest.selection.min_confidence);
        config.interest.selection.min_score =
            env_parse("FOCAL_INTEREST_MIN_SCORE").unwrap_or(config.interest.selection.min_score);
        config.resolver.interest = config.interest.selection;

        config.color.clusters = env_parse("FOCAL_COLOR_CLUSTERS").unwrap_or(config.color.clusters);
        config.color.max_colors =
            env_parse("FOCAL_COLOR_MAX_COLORS").unwrap_or(config.color.max_colors);

        config
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Face detection settings (neural SSD + cascade fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceDetectorConfig {
    // === Neural detector ===
    /// Path to the SSD face model in ONNX format (default: none, stage disabled)
    pub model_path: Option<PathBuf>,

    /// Square network input resolution (default: 300)
    pub input_size: u32,

    /// Per-channel mean subtracted from BGR input (default: 104, 177, 123)
    pub mean_bgr: [f32; 3],

    /// Minimum softmax confidence for a box (default: 0.6)
    pub confidence_threshold: f32,

    /// IoU above which overlapping boxes are merged (default: 0.5)
    pub nms_threshold: f32,

    // === Cascade detector ===
    /// Path to the SeetaFace cascade model (default: none, stage disabled)
    pub cascade_model_path: Option<PathBuf>,

    /// Smallest face the cascade searches for, in pixels (default: 30)
    pub cascade_min_face_size: u32,

    /// Raw cascade score threshold (default: 2.0)
    pub cascade_score_threshold: f64,

    /// Image pyramid scale factor (default: 0.8)
    pub cascade_pyramid_scale: f32,

    /// Sliding window step in pixels (default: 4)
    pub cascade_window_step: u32,

    /// Cascade runs on a copy downscaled to this max dimension (default: 1024)
    pub cascade_max_dimension: u32,

    // === Post-filter ===
    /// Minimum face width/height as a fraction of the image dimension (default: 0.05)
    pub min_face_fraction: f64,
}

impl Default for FaceDetectorConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            input_size: 300,
            mean_bgr: [104.0, 177.0, 123.0],
            confidence_threshold: 0.6,
            nms_threshold: 0.5,

            cascade_model_path: None,
            cascade_min_face_size: 30,
            cascade_score_threshold: 2.0,
            cascade_pyramid_scale: 0.8,
            cascade_window_step: 4,
            cascade_max_dimension: 1024,

            min_face_fraction: 0.05,
        }
    }
}

/// Thresholds an interest candidate must meet to be selected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionThresholds {
    /// Minimum heuristic confidence (default: 0.65)
    pub min_confidence: f64,
    /// Minimum raw score (default: 30.0)
    pub min_score: f64,
}

impl Default for SelectionThresholds {
    fn default() -> Self {
        Self {
            min_confidence: 0.65,
            min_score: 30.0,
        }
    }
}

/// Interest-region detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterestConfig {
    // === Working copy ===
    /// Extractors run on a copy downscaled to this max dimension (default: 640)
    pub max_working_dimension: u32,

    /// Margin excluded around every edge, as a fraction of the dimension (default: 0.08)
    pub safe_zone_margin: f64,

    /// Candidates overlapping above this IoU are duplicates (default: 0.4)
    pub dedup_iou: f64,

    pub selection: SelectionThresholds,

    // === Feature clusters ===
    /// FAST corner intensity threshold (default: 20)
    pub fast_threshold: u8,

    /// Maximum number of feature points kept (default: 150)
    pub max_features: usize,

    /// Minimum distance between kept feature points in pixels (default: 8.0)
    pub min_feature_distance: f64,

    /// Radius used to group points into a cluster, in pixels (default: 120.0)
    pub cluster_radius: f64,

    /// Minimum points for a cluster to become a candidate (default: 3)
    pub min_cluster_points: usize,

    /// Padding ratio for sparse clusters (default: 0.35)
    pub sparse_padding: f64,

    /// Padding ratio for dense clusters (default: 0.15)
    pub dense_padding: f64,

    /// Cluster box area bounds as fractions of image area (default: 0.08 - 0.25)
    pub min_cluster_area: f64,
    pub max_cluster_area: f64,

    /// Reshape cluster boxes to squares (default: true)
    pub prefer_square: bool,

    // === Sliding windows ===
    /// Window sizes as fractions of the largest dimension (default: 0.10, 0.15, 0.20)
    pub window_fractions: Vec<f64>,

    /// Overlap between neighbouring windows (default: 0.4)
    pub window_overlap: f64,

    /// Minimum window score (default: 55.0)
    pub window_score_threshold: f64,

    /// Preferred mean brightness in [0, 1] (default: 0.55)
    pub preferred_brightness: f64,

    /// Sobel magnitude counted as an edge (default: 120)
    pub edge_magnitude: u16,

    /// Best windows kept per scale (default: 6)
    pub max_windows_per_scale: usize,

    // === Gradient regions ===
    /// Window size as a fraction of the smallest dimension (default: 0.15)
    pub gradient_window_fraction: f64,

    /// Minimum gradient region score (default: 60.0)
    pub gradient_score_threshold: f64,

    /// Best gradient regions kept (default: 6)
    pub max_gradient_regions: usize,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            max_working_dimension: 640,
            safe_zone_margin: 0.08,
            dedup_iou: 0.4,
            selection: SelectionThresholds::default(),

            fast_threshold: 20,
            max_features: 150,
            min_feature_distance: 8.0,
            cluster_radius: 120.0,
            min_cluster_points: 3,
            sparse_padding: 0.35,
            dense_padding: 0.15,
            min_cluster_area: 0.08,
            max_cluster_area: 0.25,
            prefer_square: true,

            window_fractions: vec![0.10, 0.15, 0.20],
            window_overlap: 0.4,
            window_score_threshold: 55.0,
            preferred_brightness: 0.55,
            edge_magnitude: 120,
            max_windows_per_scale: 6,

            gradient_window_fraction: 0.15,
            gradient_score_threshold: 60.0,
            max_gradient_regions: 6,
        }
    }
}

/// Dominant color analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    /// Images larger than this are downscaled first (default: 800)
    pub max_dimension: u32,

    /// Maximum pixels fed to k-means (default: 10000)
    pub max_samples: usize,

    /// Number of k-means clusters (default: 5)
    pub clusters: usize,

    /// Iteration cap (default: 20)
    pub max_iterations: usize,

    /// Stop when no center moves further than this, in RGB units (default: 1.0)
    pub epsilon: f64,

    /// Clusters below this share of samples are dropped, in percent (default: 1.0)
    pub min_percentage: f64,

    /// Maximum colors returned (default: 5)
    pub max_colors: usize,

    // === Unified score weights ===
    pub weight_frequency: f64,
    pub weight_saturation: f64,
    pub weight_brightness: f64,

    /// Seed for k-means++ initialisation; fixed so results are reproducible
    pub seed: u64,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            max_dimension: 800,
            max_samples: 10_000,
            clusters: 5,
            max_iterations: 20,
            epsilon: 1.0,
            min_percentage: 1.0,
            max_colors: 5,
            weight_frequency: 0.4,
            weight_saturation: 0.35,
            weight_brightness: 0.25,
            seed: 0x5eed_c010,
        }
    }
}

/// Focal point decision settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub interest: SelectionThresholds,

    /// Padding around multi-face bounds as a fraction of the box size (default: 0.0)
    pub multi_face_padding: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            interest: SelectionThresholds::default(),
            multi_face_padding: 0.0,
        }
    }
}
