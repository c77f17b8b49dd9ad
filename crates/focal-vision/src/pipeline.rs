//! Sequential analysis pipeline run by the worker for each request:
//! normalize -> faces -> interest (only without faces) -> colors -> resolve.
//!
//! Only normalization failures abort a request. Detector stages that fail
//! are logged and contribute an empty array.

use std::time::Instant;

use focal_models::{FocalPoint, ProcessingConfig, ProcessingResult, StageTimings};
use tracing::{debug, info, warn};

use crate::color::ColorAnalyzer;
use crate::config::VisionConfig;
use crate::debug::render_overlay;
use crate::error::VisionResult;
use crate::face::FaceDetector;
use crate::interest::InterestDetector;
use crate::normalize::normalize;
use crate::resolver::{FocalPointResolver, REASON_NO_DETECTIONS};
use crate::resources::ResourceTracker;

/// Output of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    /// Raw detections sent back to the caller
    pub result: ProcessingResult,
    /// Focal point resolved from `result` inside the worker
    pub focal_point: FocalPoint,
}

pub struct VisionPipeline {
    faces: FaceDetector,
    interest: InterestDetector,
    colors: ColorAnalyzer,
    resolver: FocalPointResolver,
}

impl VisionPipeline {
    /// Load every configured detector.
    pub fn from_config(config: &VisionConfig) -> VisionResult<Self> {
        let faces = FaceDetector::from_config(&config.face)?;
        Ok(Self::with_face_detector(config, faces))
    }

    /// Build around an already constructed face detector.
    pub fn with_face_detector(config: &VisionConfig, faces: FaceDetector) -> Self {
        Self {
            faces,
            interest: InterestDetector::new(config.interest.clone()),
            colors: ColorAnalyzer::new(config.color.clone()),
            resolver: FocalPointResolver::new(config.resolver),
        }
    }

    /// True when a face model is loaded.
    pub fn has_processors(&self) -> bool {
        self.faces.is_available()
    }

    pub fn face_backends(&self) -> Vec<&'static str> {
        self.faces.backends().collect()
    }

    /// Analyze one encoded image. Every pixel buffer is registered in a
    /// scope on `tracker` and released before this returns.
    pub fn process(
        &self,
        bytes: &[u8],
        options: &ProcessingConfig,
        tracker: &ResourceTracker,
        request: &str,
    ) -> VisionResult<Analysis> {
        let scope = tracker.scope(request);
        let mut timings = StageTimings::default();

        let started = Instant::now();
        let normalized = normalize(bytes, &scope)?;
        timings.normalize_ms = record_stage("normalize", started);

        let image = normalized.image();
        let (width, height) = (normalized.width(), normalized.height());

        let started = Instant::now();
        let faces = if options.face_detection_enabled && self.faces.is_available() {
            self.faces.detect(image, &scope).unwrap_or_else(|e| {
                warn!(request, stage = "faces", error = %e, "Face detection failed; continuing without faces");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        timings.faces_ms = record_stage("faces", started);

        let started = Instant::now();
        let interest = if faces.is_empty() {
            self.interest.detect(image, &scope).candidates
        } else {
            Vec::new()
        };
        timings.interest_ms = record_stage("interest", started);

        let started = Instant::now();
        let colors = self.colors.analyze(image, &scope);
        timings.colors_ms = record_stage("colors", started);

        let focal_point = self.resolver.resolve(
            &faces,
            &interest,
            width as f64,
            height as f64,
            REASON_NO_DETECTIONS,
        );

        let debug_image = if options.debug_mode {
            render_overlay(image, &faces, &interest, &focal_point, &scope)
                .map_err(|e| warn!(request, stage = "debug", error = %e, "Debug overlay failed"))
                .ok()
        } else {
            None
        };

        info!(
            request,
            width,
            height,
            faces = faces.len(),
            interest = interest.len(),
            colors = colors.len(),
            focal = %focal_point.kind,
            method = %focal_point.method,
            "Image analyzed"
        );

        drop(normalized);
        debug!(request, live = scope.live(), "Request buffers outstanding before scope end");

        Ok(Analysis {
            result: ProcessingResult {
                faces,
                interest_candidates: interest,
                color_samples: colors,
                image_width: width,
                image_height: height,
                timings,
                debug_image,
            },
            focal_point,
        })
    }
}

fn record_stage(stage: &'static str, started: Instant) -> u64 {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    metrics::histogram!("focal_pipeline_stage_ms", "stage" => stage).record(elapsed_ms as f64);
    debug!(stage, elapsed_ms, "Stage finished");
    elapsed_ms
}
