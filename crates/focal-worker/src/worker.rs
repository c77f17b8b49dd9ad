//! Worker process side of the protocol.
//!
//! A synchronous loop over stdin: one request at a time, replies on
//! stdout, logs on stderr. A panic while handling any message is reported
//! as `WORKER_CRASH` and ends the process so the harness can relaunch it.

use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::Instant;

use focal_models::{
    decode_line, encode_line, HarnessMessage, ProcessingConfig, ProcessingError, RequestId,
    WorkerMessage,
};
use focal_vision::{ResourceTracker, VisionConfig, VisionPipeline};
use tracing::{debug, error, info, warn};

use crate::logging::RequestLogger;

/// Location of the most recent panic, filled in by the hook.
static LAST_PANIC_LOCATION: Mutex<Option<String>> = Mutex::new(None);

/// How the loop ended; maps to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// `SHUTDOWN` received or stdin closed
    Clean,
    /// Detectors failed to load; `WORKER_ERROR` was sent
    InitFailed,
    /// A request panicked; `WORKER_CRASH` was sent
    Crashed,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Clean => 0,
            WorkerExit::InitFailed => 2,
            WorkerExit::Crashed => 1,
        }
    }
}

/// Record panic locations for crash reports.
pub fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
        error!(location = location.as_deref().unwrap_or("unknown"), "Worker panicked: {}", info);
        if let Ok(mut slot) = LAST_PANIC_LOCATION.lock() {
            *slot = location;
        }
    }));
}

/// Load the pipeline from `config`, then serve requests until shutdown.
pub fn run<R: BufRead, W: Write>(input: R, output: W, config: &VisionConfig) -> WorkerExit {
    let mut replies = Replies { output };

    let pipeline = match VisionPipeline::from_config(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "Failed to initialize detectors");
            replies.send(&WorkerMessage::WorkerError {
                error: e.to_string(),
            });
            return WorkerExit::InitFailed;
        }
    };

    serve(input, replies.output, &pipeline)
}

/// Serve requests with an already loaded pipeline.
pub fn serve<R: BufRead, W: Write>(
    input: R,
    output: W,
    pipeline: &VisionPipeline,
) -> WorkerExit {
    let mut worker = Worker {
        pipeline,
        tracker: ResourceTracker::new(),
        started_at: Instant::now(),
        requests_processed: 0,
        current_request: None,
        replies: Replies { output },
    };
    worker.run(input)
}

struct Replies<W> {
    output: W,
}

impl<W: Write> Replies<W> {
    fn send(&mut self, message: &WorkerMessage) {
        let written = encode_line(message)
            .map_err(std::io::Error::from)
            .and_then(|line| {
                writeln!(self.output, "{}", line)?;
                self.output.flush()
            });
        if let Err(e) = written {
            error!(error = %e, "Failed to write reply");
        }
    }
}

struct Worker<'p, W> {
    pipeline: &'p VisionPipeline,
    tracker: ResourceTracker,
    started_at: Instant,
    requests_processed: u64,
    /// Request being handled, reported if handling it panics
    current_request: Option<RequestId>,
    replies: Replies<W>,
}

enum Step {
    Continue,
    Shutdown,
}

impl<W: Write> Worker<'_, W> {
    fn run<R: BufRead>(&mut self, input: R) -> WorkerExit {
        self.replies.send(&WorkerMessage::WorkerReady {
            pid: std::process::id(),
            has_processors: self.pipeline.has_processors(),
        });
        info!(
            face_backends = ?self.pipeline.face_backends(),
            "Worker ready"
        );

        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to read request; stopping");
                    break;
                }
            };

            match panic::catch_unwind(AssertUnwindSafe(|| self.handle_line(&line))) {
                Ok(Step::Continue) => {}
                Ok(Step::Shutdown) => {
                    info!("Shutdown requested");
                    break;
                }
                Err(payload) => {
                    self.report_crash(payload.as_ref());
                    return WorkerExit::Crashed;
                }
            }
        }

        self.release_all();
        WorkerExit::Clean
    }

    fn handle_line(&mut self, line: &str) -> Step {
        if line.trim().is_empty() {
            return Step::Continue;
        }

        let message: HarnessMessage = match decode_line(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed request");
                return Step::Continue;
            }
        };

        match message {
            HarnessMessage::ProcessImage {
                request_id,
                image_bytes,
                filename,
                config,
            } => {
                self.current_request = Some(request_id);
                self.process(request_id, &image_bytes, &filename, &config);
            }
            HarnessMessage::HealthCheck { request_id } => {
                self.current_request = Some(request_id);
                self.health(request_id);
            }
            HarnessMessage::Shutdown => return Step::Shutdown,
        }
        self.current_request = None;
        Step::Continue
    }

    fn process(
        &mut self,
        request_id: RequestId,
        image_bytes: &[u8],
        filename: &str,
        options: &ProcessingConfig,
    ) {
        let logger = RequestLogger::new(request_id, filename);
        let _span = logger.create_span().entered();
        let started = Instant::now();

        let outcome = self
            .pipeline
            .process(image_bytes, options, &self.tracker, &request_id.to_string());
        let processing_time_ms = started.elapsed().as_millis() as u64;
        self.requests_processed += 1;

        let reply = match outcome {
            Ok(analysis) => {
                debug!(
                    request_id,
                    focal = %analysis.focal_point.kind,
                    method = %analysis.focal_point.method,
                    "Resolved focal point"
                );
                WorkerMessage::ProcessingResult {
                    request_id,
                    result: Some(analysis.result),
                    error: None,
                    processing_time_ms,
                }
            }
            Err(e) => {
                logger.log_warning(&e.to_string());
                WorkerMessage::ProcessingResult {
                    request_id,
                    result: None,
                    error: Some(ProcessingError::new(e.kind(), e.to_string())),
                    processing_time_ms,
                }
            }
        };

        logger.log_completion(processing_time_ms, "reply sent");
        self.replies.send(&reply);
    }

    /// Tell the harness why the process is about to end.
    fn report_crash(&mut self, payload: &(dyn std::any::Any + Send)) {
        let error = panic_message(payload);
        let location = LAST_PANIC_LOCATION
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        let request_id = self.current_request.take();
        error!(
            request_id = request_id.unwrap_or_default(),
            location = location.as_deref().unwrap_or("unknown"),
            "Request panicked: {}",
            error
        );

        self.replies.send(&WorkerMessage::WorkerCrash {
            error,
            location,
            request_id,
            live_resources: self.tracker.live(),
        });
        self.release_all();
    }

    fn health(&mut self, request_id: RequestId) {
        let stats = self.tracker.stats();
        self.replies.send(&WorkerMessage::HealthCheckResult {
            request_id,
            initialized: true,
            has_processors: self.pipeline.has_processors(),
            uptime: self.started_at.elapsed().as_millis() as u64,
            requests_processed: self.requests_processed,
            live_resources: stats.live,
            total_resources: stats.total,
        });
    }

    fn release_all(&self) {
        let released = self.tracker.force_cleanup();
        if released > 0 {
            warn!(released, "Released buffers still tracked at exit");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use focal_models::ErrorKind;
    use focal_models::FaceCandidate;
    use focal_vision::{FaceBackend, FaceDetector, RequestScope, VisionResult};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn input(messages: &[HarnessMessage]) -> Cursor<Vec<u8>> {
        let mut buf = String::new();
        for m in messages {
            buf.push_str(&encode_line(m).unwrap());
            buf.push('\n');
        }
        Cursor::new(buf.into_bytes())
    }

    fn replies(output: &[u8]) -> Vec<WorkerMessage> {
        std::str::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| decode_line(l).unwrap())
            .collect()
    }

    fn pipeline() -> VisionPipeline {
        VisionPipeline::with_face_detector(&VisionConfig::default(), FaceDetector::with_chain(Vec::new(), 0.05))
    }

    #[test]
    fn test_ready_health_and_shutdown() {
        let pipeline = pipeline();
        let mut output = Vec::new();
        let exit = serve(
            input(&[
                HarnessMessage::HealthCheck { request_id: 1 },
                HarnessMessage::Shutdown,
                HarnessMessage::HealthCheck { request_id: 2 },
            ]),
            &mut output,
            &pipeline,
        );

        assert_eq!(exit, WorkerExit::Clean);
        let messages = replies(&output);
        assert_eq!(messages.len(), 2);
        assert!(matches!(
            messages[0],
            WorkerMessage::WorkerReady { has_processors: false, .. }
        ));
        match &messages[1] {
            WorkerMessage::HealthCheckResult {
                request_id,
                initialized,
                requests_processed,
                live_resources,
                ..
            } => {
                assert_eq!(*request_id, 1);
                assert!(*initialized);
                assert_eq!(*requests_processed, 0);
                assert_eq!(*live_resources, 0);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_process_image_and_decode_error() {
        let pipeline = pipeline();
        let mut output = Vec::new();
        serve(
            input(&[
                HarnessMessage::ProcessImage {
                    request_id: 5,
                    image_bytes: png(120, 80),
                    filename: "gradient.png".to_string(),
                    config: ProcessingConfig::default(),
                },
                HarnessMessage::ProcessImage {
                    request_id: 6,
                    image_bytes: b"definitely not an image".to_vec(),
                    filename: "notes.txt".to_string(),
                    config: ProcessingConfig::default(),
                },
                HarnessMessage::HealthCheck { request_id: 7 },
            ]),
            &mut output,
            &pipeline,
        );

        let messages = replies(&output);
        assert_eq!(messages.len(), 4);

        match &messages[1] {
            WorkerMessage::ProcessingResult {
                request_id: 5,
                result: Some(result),
                error: None,
                ..
            } => {
                assert_eq!((result.image_width, result.image_height), (120, 80));
                assert!(!result.color_samples.is_empty());
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        match &messages[2] {
            WorkerMessage::ProcessingResult {
                request_id: 6,
                result: None,
                error: Some(error),
                ..
            } => assert_eq!(error.kind, ErrorKind::Decode),
            other => panic!("unexpected reply: {other:?}"),
        }

        match &messages[3] {
            WorkerMessage::HealthCheckResult {
                requests_processed,
                live_resources,
                total_resources,
                ..
            } => {
                assert_eq!(*requests_processed, 2);
                assert_eq!(*live_resources, 0);
                assert!(*total_resources > 0);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let pipeline = pipeline();
        let mut output = Vec::new();
        let input = Cursor::new(b"{not json}\n\n{\"type\":\"HEALTH_CHECK\",\"requestId\":3}\n".to_vec());
        serve(input, &mut output, &pipeline);

        let messages = replies(&output);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].request_id(), Some(3));
    }

    #[test]
    fn test_missing_model_reports_worker_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VisionConfig::default();
        config.face.model_path = Some(dir.path().join("missing.onnx"));

        let mut output = Vec::new();
        let exit = run(input(&[HarnessMessage::Shutdown]), &mut output, &config);

        assert_eq!(exit, WorkerExit::InitFailed);
        assert_eq!(exit.code(), 2);
        let messages = replies(&output);
        assert!(matches!(messages.as_slice(), [WorkerMessage::WorkerError { .. }]));
    }

    struct Exploding;

    impl FaceBackend for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn detect(&self, _: &DynamicImage, scope: &RequestScope<'_>) -> VisionResult<Vec<FaceCandidate>> {
            let _scratch = scope.track("scratch", vec![0u8; 64]);
            panic!("native detector fault");
        }
    }

    /// Output that panics on the given flush (1-based).
    struct FailingFlush {
        bytes: Vec<u8>,
        flushes: usize,
        panic_on: usize,
    }

    impl Write for FailingFlush {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.bytes.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            if self.flushes == self.panic_on {
                panic!("stdout wedged");
            }
            Ok(())
        }
    }

    #[test]
    fn test_pipeline_panic_reports_crash() {
        let chain: Vec<Box<dyn FaceBackend>> = vec![Box::new(Exploding)];
        let pipeline = VisionPipeline::with_face_detector(&VisionConfig::default(), FaceDetector::with_chain(chain, 0.05));
        let mut output = Vec::new();
        let exit = serve(
            input(&[
                HarnessMessage::ProcessImage {
                    request_id: 9,
                    image_bytes: png(64, 64),
                    filename: "boom.png".to_string(),
                    config: ProcessingConfig::default(),
                },
                HarnessMessage::HealthCheck { request_id: 10 },
            ]),
            &mut output,
            &pipeline,
        );

        assert_eq!(exit, WorkerExit::Crashed);
        assert_eq!(exit.code(), 1);
        let messages = replies(&output);
        assert_eq!(messages.len(), 2);
        match &messages[1] {
            WorkerMessage::WorkerCrash {
                error, request_id, ..
            } => {
                assert!(error.contains("native detector fault"));
                assert_eq!(*request_id, Some(9));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_panic_while_replying_reports_crash() {
        let pipeline = pipeline();
        let mut output = FailingFlush {
            bytes: Vec::new(),
            flushes: 0,
            panic_on: 2,
        };
        let exit = serve(
            input(&[
                HarnessMessage::HealthCheck { request_id: 4 },
                HarnessMessage::HealthCheck { request_id: 5 },
            ]),
            &mut output,
            &pipeline,
        );

        assert_eq!(exit, WorkerExit::Crashed);
        let messages = replies(&output.bytes);
        // Ready, the health reply written before the failed flush, the crash report
        assert_eq!(messages.len(), 3);
        match &messages[2] {
            WorkerMessage::WorkerCrash {
                error, request_id, ..
            } => {
                assert!(error.contains("stdout wedged"));
                assert_eq!(*request_id, Some(4));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
