//! Harness integration tests.
//!
//! Uses the real `focal-worker` binary for protocol round trips and small
//! `/bin/sh` scripts to fake misbehaving workers.

use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, Instant};

use focal_models::{ErrorKind, ProcessingConfig};
use focal_worker::{HarnessConfig, HarnessError, HarnessState, WorkerHarness};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tokio_test::{assert_err, assert_ok};

const READY: &str = r#"echo '{"type":"WORKER_READY","pid":1,"hasProcessors":false}'"#;

/// Answers every request with a health report for its id.
const SERVE: &str = r##"
while read -r line; do
  case "$line" in
    *SHUTDOWN*) exit 0 ;;
  esac
  sleep "${REPLY_DELAY:-0}"
  id=$(printf '%s\n' "$line" | sed -n 's/.*"requestId":\([0-9]*\).*/\1/p')
  echo "{\"type\":\"HEALTH_CHECK_RESULT\",\"requestId\":$id,\"initialized\":true,\"hasProcessors\":false,\"uptime\":5,\"requestsProcessed\":0,\"liveResources\":0,\"totalResources\":0}"
done
exit 0
"##;

fn real_worker() -> HarnessConfig {
    HarnessConfig::new(env!("CARGO_BIN_EXE_focal-worker"))
        .with_env("FOCAL_FACE_MODEL", "")
        .with_env("FOCAL_CASCADE_MODEL", "")
}

fn fake_worker(script: &str) -> HarnessConfig {
    HarnessConfig::new("/bin/sh")
        .with_args(["-c", script])
        .with_startup_timeout(Duration::from_secs(5))
        .with_probe_interval(Duration::from_secs(60))
        .with_restart_backoff(Duration::from_millis(50))
        .with_shutdown_grace(Duration::from_millis(500))
}

/// Script whose first launch runs `first_run`; later launches serve normally.
fn first_run_then_serve(first_run: &str) -> String {
    format!(
        "echo run >> \"$COUNTER\"\n{READY}\nif [ $(wc -l < \"$COUNTER\") -gt 1 ]; then\n{SERVE}\nfi\n{first_run}\n"
    )
}

fn launches(counter: &Path) -> usize {
    std::fs::read_to_string(counter)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn textured_png() -> Vec<u8> {
    let image = RgbImage::from_fn(320, 240, |x, y| {
        if (100..180).contains(&x) && (60..140).contains(&y) {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgb([250, 230, 40])
            } else {
                Rgb([20, 20, 30])
            }
        } else {
            Rgb([120, 150, 170])
        }
    });
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut bytes, ImageFormat::Png)
        .unwrap();
    bytes.into_inner()
}

#[tokio::test]
async fn test_real_worker_round_trip() {
    let harness = assert_ok!(WorkerHarness::start(real_worker()).await);
    assert_eq!(harness.state(), HarnessState::Ready);

    let health = assert_ok!(harness.health_check().await);
    assert!(health.initialized);
    assert!(!health.has_processors);
    assert_eq!(health.live_resources, 0);

    let result = assert_ok!(
        harness
            .process_image(textured_png(), "patch.png", ProcessingConfig::default())
            .await
    );
    assert_eq!((result.image_width, result.image_height), (320, 240));
    assert!(result.faces.is_empty());
    assert!(!result.color_samples.is_empty());

    let focal = focal_vision::resolve(
        &result.faces,
        &result.interest_candidates,
        320.0,
        240.0,
        "no-detections",
    );
    assert!(focal.rect().is_within(320.0, 240.0));

    // Buffers of the finished request were all released
    let health = assert_ok!(harness.health_check().await);
    assert_eq!(health.requests_processed, 1);
    assert_eq!(health.live_resources, 0);
    assert!(health.total_resources > 0);

    assert_ok!(harness.shutdown().await);
    assert_eq!(harness.state(), HarnessState::Stopped);
}

#[tokio::test]
async fn test_real_worker_decode_error_keeps_worker() {
    let harness = assert_ok!(WorkerHarness::start(real_worker()).await);

    let err = assert_err!(
        harness
            .process_image(b"GIF89a garbage".to_vec(), "broken.gif", ProcessingConfig::default())
            .await
    );
    assert!(matches!(err, HarnessError::Worker { kind: ErrorKind::Decode, .. }));
    assert!(!err.is_retryable());

    assert!(harness.is_ready());
    assert_eq!(harness.stats().restarts, 0);

    harness.shutdown().await.unwrap();
    let err = assert_err!(harness.health_check().await);
    assert!(matches!(err, HarnessError::WorkerUnavailable));
}

#[tokio::test]
async fn test_debug_mode_returns_overlay() {
    let harness = assert_ok!(WorkerHarness::start(real_worker()).await);
    let options = ProcessingConfig {
        face_detection_enabled: false,
        debug_mode: true,
    };

    let result = assert_ok!(harness.process_image(textured_png(), "patch.png", options).await);
    assert!(result.debug_image.is_some_and(|jpeg| !jpeg.is_empty()));
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_error_fails_startup() {
    let script = r#"echo '{"type":"WORKER_ERROR","error":"model file missing"}'; exit 2"#;
    let err = assert_err!(WorkerHarness::start(fake_worker(script)).await);

    match err {
        HarnessError::WorkerStartup(message) => assert!(message.contains("model file missing")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_silent_worker_times_out_at_startup() {
    let config = fake_worker("sleep 5").with_startup_timeout(Duration::from_millis(200));
    let started = Instant::now();

    let err = assert_err!(WorkerHarness::start(config).await);
    assert!(matches!(err, HarnessError::WorkerStartup(_)));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_two_missed_probes_restart_once() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");

    // The shell exits but a background child keeps stdout open, so only
    // the liveness probe can notice the loss.
    let script = first_run_then_serve("( sleep 5 & )\nexit 0");
    let config = fake_worker(&script).with_env("COUNTER", counter.to_string_lossy());
    let harness = assert_ok!(WorkerHarness::start(config).await);

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.probe() {
        assert!(Instant::now() < deadline, "first worker never exited");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Second miss against the same worker
    assert!(!harness.probe());

    assert!(harness.wait_until_ready(Duration::from_secs(5)).await);
    let stats = harness.stats();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.generation, 2);
    assert_eq!(launches(&counter), 2);

    assert!(harness.probe());
    assert_ok!(harness.health_check().await);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_in_flight_request_fails_on_crash() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");

    let script = first_run_then_serve(
        r#"read -r line
echo '{"type":"WORKER_CRASH","error":"decoder fault","location":"decode.c:42","requestId":1,"liveResources":3}'
exit 1"#,
    );
    let config = fake_worker(&script).with_env("COUNTER", counter.to_string_lossy());
    let harness = assert_ok!(WorkerHarness::start(config).await);

    let err = assert_err!(
        harness
            .process_image(textured_png(), "crash.png", ProcessingConfig::default())
            .await
    );
    match &err {
        HarnessError::WorkerCrashed(message) => assert!(message.contains("decoder fault")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_retryable());

    assert!(harness.wait_until_ready(Duration::from_secs(5)).await);
    let stats = harness.stats();
    assert_eq!(stats.crashes, 1);
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.pending, 0);

    assert_ok!(harness.health_check().await);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_discards_late_response() {
    let script = format!("{READY}\n{SERVE}");
    let config = fake_worker(&script)
        .with_env("REPLY_DELAY", "0.3")
        .with_request_timeout(Duration::from_millis(100));
    let harness = assert_ok!(WorkerHarness::start(config).await);

    let err = assert_err!(harness.health_check().await);
    assert!(matches!(err, HarnessError::Timeout { .. }));
    assert!(err.is_retryable());

    // The worker is slow, not dead: no restart
    assert!(harness.is_ready());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let stats = harness.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.late_responses, 1);
    assert_eq!(stats.restarts, 0);
    assert_eq!(stats.pending, 0);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queued_request_gets_its_own_deadline() {
    let script = format!("{READY}\n{SERVE}");
    let config = fake_worker(&script)
        .with_env("REPLY_DELAY", "0.4")
        .with_request_timeout(Duration::from_millis(700));
    let harness = assert_ok!(WorkerHarness::start(config).await);

    // The second request waits ~0.4s for the worker, then needs ~0.4s more
    let (first, second) = tokio::join!(harness.health_check(), harness.health_check());
    assert_ok!(first);
    assert_ok!(second);
    assert_eq!(harness.stats().timeouts, 0);

    harness.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_queued_behind_timeout_is_dispatched() {
    let script = format!("{READY}\n{SERVE}");
    let config = fake_worker(&script)
        .with_env("REPLY_DELAY", "0.5")
        .with_request_timeout(Duration::from_millis(200));
    let harness = assert_ok!(WorkerHarness::start(config).await);

    let (first, second) = tokio::join!(harness.health_check(), harness.health_check());
    // Both reach the worker; neither sees it as unavailable
    assert!(matches!(assert_err!(first), HarnessError::Timeout { .. }));
    assert!(matches!(assert_err!(second), HarnessError::Timeout { .. }));

    let stats = harness.stats();
    assert_eq!(stats.timeouts, 2);
    assert_eq!(stats.pending, 0);
    assert!(harness.is_ready());

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_kills_worker_ignoring_shutdown() {
    let script = format!("{READY}\nwhile read -r line; do :; done");
    let grace = Duration::from_millis(300);
    let config = fake_worker(&script).with_shutdown_grace(grace);
    let harness = assert_ok!(WorkerHarness::start(config).await);
    let pid = harness.stats().worker_pid.expect("worker pid");

    let started = Instant::now();
    assert_ok!(harness.shutdown().await);
    let elapsed = started.elapsed();

    assert!(elapsed >= grace, "killed before the grace period: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3));
    assert!(!Path::new(&format!("/proc/{pid}")).exists());
    assert_eq!(harness.state(), HarnessState::Stopped);
    assert_eq!(harness.stats().worker_pid, None);
}

#[tokio::test]
async fn test_restart_gives_up_after_repeated_start_failures() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");

    // First launch serves briefly and exits; every relaunch fails to initialize
    let script = format!(
        "echo run >> \"$COUNTER\"\nif [ $(wc -l < \"$COUNTER\") -gt 1 ]; then\n  echo '{{\"type\":\"WORKER_ERROR\",\"error\":\"model file missing\"}}'\n  exit 2\nfi\n{READY}\nsleep 0.2\nexit 0\n"
    );
    let config = fake_worker(&script)
        .with_env("COUNTER", counter.to_string_lossy())
        .with_max_start_failures(2);
    let harness = assert_ok!(WorkerHarness::start(config).await);

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.state() != HarnessState::Stopped {
        assert!(Instant::now() < deadline, "harness never gave up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(launches(&counter), 3);
    let stats = harness.stats();
    assert_eq!(stats.restarts, 0);
    assert_eq!(stats.generation, 3);

    assert!(!harness.wait_until_ready(Duration::from_millis(100)).await);
    let err = assert_err!(harness.health_check().await);
    assert!(matches!(err, HarnessError::WorkerUnavailable));
    assert_ok!(harness.shutdown().await);
}
