//! Caller-facing focal point service.
//!
//! Wraps the harness with the collaborators a photo library provides: an
//! image source, a detection cache, and the resolver used to recompute a
//! focal point from cached detections. Every call yields a focal point;
//! failures degrade to a center fallback tagged with the failure reason.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use focal_models::{FocalPoint, ProcessingConfig, ProcessingResult, RawDetections};
use focal_vision::FocalPointResolver;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::harness::WorkerHarness;
use crate::retry::{retry_async, RetryPolicy};

/// Fallback reason when the pipeline itself found nothing.
const REASON_NO_DETECTIONS: &str = "no-detections";

/// Encoded image handed over by an [`ImageSource`].
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub bytes: Vec<u8>,
    pub filename: String,
}

/// Supplies encoded image bytes for a photo id.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn load(&self, photo_id: &str) -> HarnessResult<SourceImage>;
}

/// Runs the analysis pipeline; implemented by [`WorkerHarness`].
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        image_bytes: Vec<u8>,
        filename: &str,
        options: ProcessingConfig,
    ) -> HarnessResult<ProcessingResult>;
}

#[async_trait]
impl ImageAnalyzer for WorkerHarness {
    async fn analyze(
        &self,
        image_bytes: Vec<u8>,
        filename: &str,
        options: ProcessingConfig,
    ) -> HarnessResult<ProcessingResult> {
        self.process_image(image_bytes, filename, options).await
    }
}

/// Raw detections plus the dimensions they were measured in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedDetections {
    pub detections: RawDetections,
    pub image_width: u32,
    pub image_height: u32,
}

impl From<&ProcessingResult> for CachedDetections {
    fn from(result: &ProcessingResult) -> Self {
        Self {
            detections: result.raw_detections(),
            image_width: result.image_width,
            image_height: result.image_height,
        }
    }
}

/// Stores raw detections so focal points can be recomputed without the worker.
#[async_trait]
pub trait DetectionCache: Send + Sync {
    async fn get(&self, photo_id: &str) -> Option<CachedDetections>;
    async fn put(&self, photo_id: &str, entry: CachedDetections);
}

/// Unbounded process-local cache.
#[derive(Debug, Default)]
pub struct InMemoryDetectionCache {
    entries: RwLock<HashMap<String, CachedDetections>>,
}

impl InMemoryDetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DetectionCache for InMemoryDetectionCache {
    async fn get(&self, photo_id: &str) -> Option<CachedDetections> {
        self.entries.read().await.get(photo_id).cloned()
    }

    async fn put(&self, photo_id: &str, entry: CachedDetections) {
        self.entries.write().await.insert(photo_id.to_string(), entry);
    }
}

/// Where a focal point came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocalSource {
    /// Recomputed from cached detections
    Cache,
    /// Fresh worker analysis
    Worker,
    /// Center fallback after a failure
    Fallback,
}

#[derive(Debug, Clone)]
pub struct FocalOutcome {
    pub focal_point: FocalPoint,
    pub source: FocalSource,
    /// Worker result, when one was produced by this call
    pub result: Option<ProcessingResult>,
    /// Failure that forced the fallback
    pub error: Option<String>,
}

pub struct FocalPointService {
    analyzer: Arc<dyn ImageAnalyzer>,
    source: Arc<dyn ImageSource>,
    cache: Arc<dyn DetectionCache>,
    resolver: FocalPointResolver,
    options: ProcessingConfig,
    retry: RetryPolicy,
}

impl FocalPointService {
    pub fn new(
        analyzer: Arc<dyn ImageAnalyzer>,
        source: Arc<dyn ImageSource>,
        cache: Arc<dyn DetectionCache>,
    ) -> Self {
        Self {
            analyzer,
            source,
            cache,
            resolver: FocalPointResolver::default(),
            options: ProcessingConfig::default(),
            retry: RetryPolicy::new("process_image"),
        }
    }

    pub fn with_resolver(mut self, resolver: FocalPointResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_options(mut self, options: ProcessingConfig) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolve the focal point for `photo_id`. Never fails.
    pub async fn focal_point(&self, photo_id: &str) -> FocalOutcome {
        if let Some(cached) = self.cache.get(photo_id).await {
            debug!(photo_id, "Detection cache hit");
            return FocalOutcome {
                focal_point: self.resolve_cached(&cached),
                source: FocalSource::Cache,
                result: None,
                error: None,
            };
        }

        let image = match self.source.load(photo_id).await {
            Ok(image) => image,
            Err(e) => {
                warn!(photo_id, error = %e, "Image source failed");
                return fallback(1.0, 1.0, &e);
            }
        };

        let analyzed = retry_async(&self.retry, HarnessError::is_retryable, || {
            self.analyzer
                .analyze(image.bytes.clone(), &image.filename, self.options)
        })
        .await;

        match analyzed {
            Ok(result) => {
                let entry = CachedDetections::from(&result);
                let focal_point = self.resolve_cached(&entry);
                self.cache.put(photo_id, entry).await;
                info!(
                    photo_id,
                    focal = %focal_point.kind,
                    method = %focal_point.method,
                    "Focal point resolved"
                );
                FocalOutcome {
                    focal_point,
                    source: FocalSource::Worker,
                    result: Some(result),
                    error: None,
                }
            }
            Err(e) => {
                warn!(photo_id, error = %e, "Analysis failed, using center fallback");
                let (width, height) = header_dimensions(&image.bytes).unwrap_or((1, 1));
                fallback(width as f64, height as f64, &e)
            }
        }
    }

    fn resolve_cached(&self, cached: &CachedDetections) -> FocalPoint {
        self.resolver.resolve(
            &cached.detections.faces,
            &cached.detections.interest_candidates,
            cached.image_width as f64,
            cached.image_height as f64,
            REASON_NO_DETECTIONS,
        )
    }
}

fn fallback(width: f64, height: f64, error: &HarnessError) -> FocalOutcome {
    FocalOutcome {
        focal_point: FocalPoint::center_fallback(width, height, error.reason()),
        source: FocalSource::Fallback,
        result: None,
        error: Some(error.to_string()),
    }
}

/// Image dimensions from the header alone, without decoding pixels.
pub fn header_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use focal_models::{ErrorKind, FaceCandidate, FaceSource, FocalPointType, Rect};
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct StaticSource(Vec<u8>);

    #[async_trait]
    impl ImageSource for StaticSource {
        async fn load(&self, photo_id: &str) -> HarnessResult<SourceImage> {
            if photo_id == "missing" {
                return Err(HarnessError::source("no such photo"));
            }
            Ok(SourceImage {
                bytes: self.0.clone(),
                filename: format!("{photo_id}.png"),
            })
        }
    }

    /// Replays scripted results and counts calls.
    struct ScriptedAnalyzer {
        calls: AtomicU32,
        script: Mutex<Vec<HarnessResult<ProcessingResult>>>,
    }

    impl ScriptedAnalyzer {
        fn new(mut script: Vec<HarnessResult<ProcessingResult>>) -> Self {
            script.reverse();
            Self {
                calls: AtomicU32::new(0),
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl ImageAnalyzer for ScriptedAnalyzer {
        async fn analyze(
            &self,
            _image_bytes: Vec<u8>,
            _filename: &str,
            _options: ProcessingConfig,
        ) -> HarnessResult<ProcessingResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(HarnessError::WorkerUnavailable))
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn face_result() -> ProcessingResult {
        ProcessingResult {
            faces: vec![FaceCandidate::new(
                Rect::new(100.0, 80.0, 60.0, 60.0),
                0.93,
                FaceSource::Neural,
            )],
            interest_candidates: Vec::new(),
            color_samples: Vec::new(),
            image_width: 640,
            image_height: 480,
            timings: Default::default(),
            debug_image: None,
        }
    }

    fn service(analyzer: Arc<ScriptedAnalyzer>, cache: Arc<InMemoryDetectionCache>) -> FocalPointService {
        FocalPointService::new(analyzer, Arc::new(StaticSource(png(400, 200))), cache)
            .with_retry(RetryPolicy::new("test").with_base_delay(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_worker_result_is_cached_and_reused() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![Ok(face_result())]));
        let cache = Arc::new(InMemoryDetectionCache::new());
        let service = service(analyzer.clone(), cache.clone());

        let first = service.focal_point("p1").await;
        assert_eq!(first.source, FocalSource::Worker);
        assert_eq!(first.focal_point.kind, FocalPointType::Face);
        assert_eq!(first.focal_point.rect(), Rect::new(100.0, 80.0, 60.0, 60.0));
        assert_eq!(cache.len().await, 1);

        let second = service.focal_point("p1").await;
        assert_eq!(second.source, FocalSource::Cache);
        assert_eq!(second.focal_point, first.focal_point);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_worker_falls_back_without_retry() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![Err(HarnessError::WorkerUnavailable)]));
        let cache = Arc::new(InMemoryDetectionCache::new());
        let outcome = service(analyzer.clone(), cache.clone()).focal_point("p2").await;

        assert_eq!(outcome.source, FocalSource::Fallback);
        assert_eq!(outcome.focal_point.method, "worker-unavailable");
        // Header dimensions of the 400x200 source
        assert_eq!(outcome.focal_point.rect(), Rect::new(100.0, 50.0, 200.0, 100.0));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_timeout_is_retried_once() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![
            Err(HarnessError::Timeout {
                request_id: 1,
                after: Duration::from_millis(5),
            }),
            Ok(face_result()),
        ]));
        let outcome = service(analyzer.clone(), Arc::new(InMemoryDetectionCache::new()))
            .focal_point("p3")
            .await;

        assert_eq!(outcome.source, FocalSource::Worker);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_decode_error_is_not_retried() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![Err(HarnessError::Worker {
            kind: ErrorKind::Decode,
            message: "truncated".to_string(),
        })]));
        let outcome = service(analyzer.clone(), Arc::new(InMemoryDetectionCache::new()))
            .focal_point("p4")
            .await;

        assert!(outcome.focal_point.is_fallback());
        assert_eq!(outcome.focal_point.method, "decode-error");
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_source_failure_still_yields_focal_point() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(Vec::new()));
        let outcome = service(analyzer.clone(), Arc::new(InMemoryDetectionCache::new()))
            .focal_point("missing")
            .await;

        assert_eq!(outcome.focal_point.method, "source-error");
        assert_eq!(outcome.focal_point.rect(), Rect::new(0.25, 0.25, 0.5, 0.5));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_header_dimensions() {
        assert_eq!(header_dimensions(&png(31, 17)), Some((31, 17)));
        assert_eq!(header_dimensions(b"nope"), None);
    }
}
