//! Neural face detection using the ResNet-10 SSD face model in ONNX form.
//!
//! Two export layouts are supported:
//! - `detection_out` `[1, 1, N, 7]`: already decoded rows of
//!   `image_id, label, confidence, x1, y1, x2, y2` (normalized)
//! - raw `mbox_loc` / `mbox_conf` heads, decoded here against Caffe-style
//!   prior boxes

use std::path::Path;
use std::sync::Mutex;

use focal_models::{FaceCandidate, FaceSource, Rect};
use image::{DynamicImage, GenericImageView};
use ndarray::ArrayView2;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use tracing::{debug, info};

use crate::config::FaceDetectorConfig;
use crate::error::{VisionError, VisionResult};
use crate::resources::{RequestScope, Tracked};

/// Box-coordinate variances used when the priors were trained.
const CENTER_VARIANCE: f32 = 0.1;
const SIZE_VARIANCE: f32 = 0.2;

/// Resolution the prior-box table was designed for.
const PRIOR_IMAGE_SIZE: f32 = 300.0;

/// One PriorBox layer: feature map size, min/max box size, extra aspect
/// ratios (each also flipped), and step in input pixels.
struct PriorLayer {
    feature_map: usize,
    min_size: f32,
    max_size: f32,
    aspect_ratios: &'static [f32],
    step: f32,
}

const PRIOR_LAYERS: [PriorLayer; 6] = [
    PriorLayer { feature_map: 38, min_size: 30.0, max_size: 60.0, aspect_ratios: &[2.0], step: 8.0 },
    PriorLayer { feature_map: 19, min_size: 60.0, max_size: 111.0, aspect_ratios: &[2.0, 3.0], step: 16.0 },
    PriorLayer { feature_map: 10, min_size: 111.0, max_size: 162.0, aspect_ratios: &[2.0, 3.0], step: 32.0 },
    PriorLayer { feature_map: 5, min_size: 162.0, max_size: 213.0, aspect_ratios: &[2.0, 3.0], step: 64.0 },
    PriorLayer { feature_map: 3, min_size: 213.0, max_size: 264.0, aspect_ratios: &[2.0], step: 100.0 },
    PriorLayer { feature_map: 1, min_size: 264.0, max_size: 315.0, aspect_ratios: &[2.0], step: 300.0 },
];

/// Prior box in normalized center form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prior {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

/// Generate the prior boxes in the order the model emits predictions:
/// layer by layer, row-major over the feature map, then per box shape.
pub fn generate_priors() -> Vec<Prior> {
    let mut priors = Vec::with_capacity(8732);

    for layer in &PRIOR_LAYERS {
        for row in 0..layer.feature_map {
            for col in 0..layer.feature_map {
                let cx = (col as f32 + 0.5) * layer.step / PRIOR_IMAGE_SIZE;
                let cy = (row as f32 + 0.5) * layer.step / PRIOR_IMAGE_SIZE;

                let min = layer.min_size / PRIOR_IMAGE_SIZE;
                priors.push(Prior { cx, cy, w: min, h: min });

                let big = (layer.min_size * layer.max_size).sqrt() / PRIOR_IMAGE_SIZE;
                priors.push(Prior { cx, cy, w: big, h: big });

                for &ar in layer.aspect_ratios {
                    let r = ar.sqrt();
                    priors.push(Prior { cx, cy, w: min * r, h: min / r });
                    priors.push(Prior { cx, cy, w: min / r, h: min * r });
                }
            }
        }
    }

    priors
}

/// Which outputs the loaded model exposes.
#[derive(Debug, Clone, PartialEq)]
enum OutputLayout {
    DetectionOut(String),
    Priors { loc: String, conf: String },
}

impl OutputLayout {
    fn from_names(names: &[String]) -> VisionResult<Self> {
        if let Some(name) = names.iter().find(|n| n.contains("detection_out")) {
            return Ok(Self::DetectionOut(name.clone()));
        }

        let loc = names.iter().find(|n| n.contains("loc"));
        let conf = names.iter().find(|n| n.contains("conf"));
        match (loc, conf) {
            (Some(loc), Some(conf)) => Ok(Self::Priors {
                loc: loc.clone(),
                conf: conf.clone(),
            }),
            _ if names.len() == 1 => Ok(Self::DetectionOut(names[0].clone())),
            _ => Err(VisionError::detector_init(format!(
                "Unrecognized SSD outputs: {:?}",
                names
            ))),
        }
    }
}

enum RawOutput {
    DetectionOut(Vec<f32>),
    Priors { loc: Vec<f32>, conf: Vec<f32> },
}

/// Neural face detector (primary path).
pub struct SsdFaceDetector {
    session: Mutex<Session>,
    layout: OutputLayout,
    priors: Vec<Prior>,
    config: FaceDetectorConfig,
}

impl SsdFaceDetector {
    /// Load the model at `path`.
    ///
    /// Returns `ModelNotFound` if the file doesn't exist and `DetectorInit`
    /// if ONNX Runtime rejects it.
    pub fn new(path: &Path, config: FaceDetectorConfig) -> VisionResult<Self> {
        if !path.exists() {
            return Err(VisionError::model_not_found(path.display().to_string()));
        }

        let session = create_session(path)?;
        let names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let layout = OutputLayout::from_names(&names)?;

        info!(
            model_path = %path.display(),
            input_size = config.input_size,
            layout = ?layout,
            "SSD face detector initialized"
        );

        Ok(Self {
            session: Mutex::new(session),
            layout,
            priors: generate_priors(),
            config,
        })
    }

    /// Detect faces, returning pixel-space candidates after NMS.
    pub fn detect(
        &self,
        image: &DynamicImage,
        scope: &RequestScope<'_>,
    ) -> VisionResult<Vec<FaceCandidate>> {
        let (width, height) = image.dimensions();
        let blob = blob_from_image(image, self.config.input_size, self.config.mean_bgr, scope);
        let raw = self.run_inference(to_tensor(&blob, self.config.input_size)?)?;
        drop(blob);

        let threshold = self.config.confidence_threshold;
        let normalized = match raw {
            RawOutput::DetectionOut(rows) => decode_detection_out(&rows, threshold),
            RawOutput::Priors { loc, conf } => {
                decode_with_priors(&loc, &conf, &self.priors, threshold)?
            }
        };

        let candidates = normalized
            .into_iter()
            .map(|(rect, confidence)| {
                let pixel = Rect::new(
                    rect.x * width as f64,
                    rect.y * height as f64,
                    rect.width * width as f64,
                    rect.height * height as f64,
                )
                .clip_to(width as f64, height as f64);
                FaceCandidate::new(pixel, confidence as f64, FaceSource::Neural)
            })
            .filter(|f| !f.rect().is_empty())
            .collect();

        let faces = non_maximum_suppression(candidates, self.config.nms_threshold as f64);
        debug!(count = faces.len(), "SSD face detection completed");
        Ok(faces)
    }

    fn run_inference(&self, input: Value) -> VisionResult<RawOutput> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| VisionError::processing("Session lock poisoned"))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| VisionError::processing(format!("ONNX inference failed: {}", e)))?;

        let extract = |name: &str| -> VisionResult<Vec<f32>> {
            let output = outputs
                .get(name)
                .ok_or_else(|| VisionError::processing(format!("Missing {} tensor", name)))?;
            let tensor = output
                .try_extract_tensor::<f32>()
                .map_err(|e| VisionError::processing(format!("Failed to extract tensor: {}", e)))?;
            Ok(tensor.1.to_vec())
        };

        match &self.layout {
            OutputLayout::DetectionOut(name) => Ok(RawOutput::DetectionOut(extract(name)?)),
            OutputLayout::Priors { loc, conf } => Ok(RawOutput::Priors {
                loc: extract(loc)?,
                conf: extract(conf)?,
            }),
        }
    }
}

/// Resize to the network input, subtract the BGR mean, lay out as NCHW.
/// The blob stays registered with `scope` until inference is done with it.
pub fn blob_from_image<'s>(
    img: &DynamicImage,
    size: u32,
    mean: [f32; 3],
    scope: &'s RequestScope<'_>,
) -> Tracked<'s, Vec<f32>> {
    let resized = scope.track(
        "ssd_input",
        img.resize_exact(size, size, image::imageops::FilterType::Triangle)
            .to_rgb8(),
    );

    let side = size as usize;
    let plane = side * side;
    let mut blob = scope.track("ssd_blob", vec![0.0f32; 3 * plane]);

    // BGR channel order
    for (c, rgb_index) in [2usize, 1, 0].into_iter().enumerate() {
        for (i, pixel) in resized.pixels().enumerate() {
            blob[c * plane + i] = pixel[rgb_index] as f32 - mean[c];
        }
    }
    blob
}

/// Copy a preprocessed blob into an owned `[1, 3, size, size]` tensor.
fn to_tensor(blob: &[f32], size: u32) -> VisionResult<Value> {
    let side = size as usize;
    let shape = vec![1usize, 3, side, side];
    Tensor::from_array((shape, blob.to_vec().into_boxed_slice()))
        .map(Value::from)
        .map_err(|e| VisionError::processing(format!("Failed to create tensor: {}", e)))
}

/// Decode `[1, 1, N, 7]` rows into normalized boxes above `threshold`.
pub fn decode_detection_out(rows: &[f32], threshold: f32) -> Vec<(Rect, f32)> {
    rows.chunks_exact(7)
        .filter(|row| row[2] >= threshold)
        .map(|row| {
            let x1 = row[3].clamp(0.0, 1.0) as f64;
            let y1 = row[4].clamp(0.0, 1.0) as f64;
            let x2 = row[5].clamp(0.0, 1.0) as f64;
            let y2 = row[6].clamp(0.0, 1.0) as f64;
            (Rect::from_corners(x1, y1, x2, y2), row[2])
        })
        .collect()
}

/// Decode raw location offsets and class scores against the prior boxes.
///
/// `conf` holds `(background, face)` pairs, either already softmaxed or as
/// logits.
pub fn decode_with_priors(
    loc: &[f32],
    conf: &[f32],
    priors: &[Prior],
    threshold: f32,
) -> VisionResult<Vec<(Rect, f32)>> {
    let shape_err = |e: ndarray::ShapeError| {
        VisionError::processing(format!(
            "Unexpected SSD head sizes: loc {}, conf {}, priors {}: {}",
            loc.len(),
            conf.len(),
            priors.len(),
            e
        ))
    };
    let loc = ArrayView2::from_shape((priors.len(), 4), loc).map_err(shape_err)?;
    let conf = ArrayView2::from_shape((priors.len(), 2), conf).map_err(shape_err)?;

    let already_softmaxed = conf
        .rows()
        .into_iter()
        .all(|p| p[0] >= 0.0 && p[1] >= 0.0 && (p[0] + p[1] - 1.0).abs() < 1e-3);

    let mut boxes = Vec::new();
    for (i, prior) in priors.iter().enumerate() {
        let (bg, face) = (conf[[i, 0]], conf[[i, 1]]);
        let score = if already_softmaxed {
            face
        } else {
            let max = bg.max(face);
            let e_bg = (bg - max).exp();
            let e_face = (face - max).exp();
            e_face / (e_bg + e_face)
        };
        if score < threshold {
            continue;
        }

        let d = loc.row(i);
        let cx = prior.cx + d[0] * CENTER_VARIANCE * prior.w;
        let cy = prior.cy + d[1] * CENTER_VARIANCE * prior.h;
        let w = prior.w * (d[2] * SIZE_VARIANCE).exp();
        let h = prior.h * (d[3] * SIZE_VARIANCE).exp();

        let x1 = (cx - w / 2.0).clamp(0.0, 1.0) as f64;
        let y1 = (cy - h / 2.0).clamp(0.0, 1.0) as f64;
        let x2 = (cx + w / 2.0).clamp(0.0, 1.0) as f64;
        let y2 = (cy + h / 2.0).clamp(0.0, 1.0) as f64;
        boxes.push((Rect::from_corners(x1, y1, x2, y2), score));
    }

    Ok(boxes)
}

/// Greedy non-maximum suppression: keep the most confident box of every
/// group overlapping above `iou_threshold`.
pub fn non_maximum_suppression(
    mut detections: Vec<FaceCandidate>,
    iou_threshold: f64,
) -> Vec<FaceCandidate> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceCandidate> = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i]);

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && detections[i].rect().iou(&detections[j].rect()) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

fn create_session(model_path: &Path) -> VisionResult<Session> {
    let model_bytes = std::fs::read(model_path)
        .map_err(|e| VisionError::detector_init(format!("Failed to read model file: {}", e)))?;

    Session::builder()
        .map_err(|e| VisionError::detector_init(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| VisionError::detector_init(format!("Failed to set optimization level: {}", e)))?
        .commit_from_memory(&model_bytes)
        .map_err(|e| VisionError::detector_init(format!("Failed to load ONNX model: {}", e)))
}
