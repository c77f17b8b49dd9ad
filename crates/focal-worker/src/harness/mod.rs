//! Isolation harness: supervises one worker process.
//!
//! Requests are dispatched one at a time over the worker's stdin with a
//! monotonically increasing id and answered over its stdout. The harness
//! never runs detection itself, so a crash in native image code can only
//! take down the child. Lost workers are relaunched after a fixed backoff;
//! requests in flight at that moment fail with `WorkerCrashed`.

mod process;
mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use focal_models::{
    decode_line, HarnessMessage, ProcessingConfig, ProcessingResult, RequestId, WorkerMessage,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::logging::RequestLogger;
use crate::retry::FailureTracker;

use process::{relay_stderr, spawn_worker, write_message, WorkerProcess};
pub use state::{HarnessState, HarnessStats, WorkerHealth};

/// Consecutive failures logged before further ones are suppressed.
const MAX_LOGGED_FAILURES: u32 = 3;

/// Shortest probe period accepted from configuration.
const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(10);

type Reply = oneshot::Sender<HarnessResult<WorkerMessage>>;

/// Handle to a supervised worker. Cheap to clone.
#[derive(Clone)]
pub struct WorkerHarness {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    config: HarnessConfig,
    started_at: Instant,
    next_request_id: AtomicU64,
    /// One request in flight at a time
    dispatch: Semaphore,
    state_tx: watch::Sender<HarnessState>,
    shared: Mutex<Shared>,
    counters: Counters,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    generation: u64,
    worker: Option<WorkerProcess>,
    pending: HashMap<RequestId, Reply>,
    last_error: Option<String>,
    has_processors: bool,
    start_failures: FailureTracker,
    probe_misses: FailureTracker,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    restarts: AtomicU64,
    timeouts: AtomicU64,
    late_responses: AtomicU64,
    crashes: AtomicU64,
}

impl std::fmt::Debug for WorkerHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHarness")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl WorkerHarness {
    /// Launch the worker and wait for `WORKER_READY`.
    pub async fn start(config: HarnessConfig) -> HarnessResult<Self> {
        let (state_tx, _) = watch::channel(HarnessState::Starting);
        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            config,
            started_at: Instant::now(),
            next_request_id: AtomicU64::new(1),
            dispatch: Semaphore::new(1),
            state_tx,
            shared: Mutex::new(Shared {
                generation: 0,
                worker: None,
                pending: HashMap::new(),
                last_error: None,
                has_processors: false,
                start_failures: FailureTracker::new(MAX_LOGGED_FAILURES),
                probe_misses: FailureTracker::new(MAX_LOGGED_FAILURES),
            }),
            counters: Counters::default(),
            probe_task: Mutex::new(None),
        });

        inner.launch().await?;

        let harness = Self { inner };
        harness.spawn_probe_loop();
        Ok(harness)
    }

    pub fn state(&self) -> HarnessState {
        self.inner.state()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state().accepts_requests()
    }

    /// Wait until a worker is attached. Returns `false` on timeout or
    /// once the harness has stopped.
    pub async fn wait_until_ready(&self, limit: Duration) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        let waited = tokio::time::timeout(
            limit,
            wait_for_state(&mut rx, |s| s.accepts_requests() || s == HarnessState::Stopped),
        )
        .await;
        matches!(waited, Ok(state) if state.accepts_requests())
    }

    /// Analyze one image in the worker.
    pub async fn process_image(
        &self,
        image_bytes: Vec<u8>,
        filename: &str,
        config: ProcessingConfig,
    ) -> HarnessResult<ProcessingResult> {
        let started = Instant::now();
        let request_id = self.inner.next_request_id();
        let logger = RequestLogger::new(request_id, filename);
        logger.log_start(image_bytes.len());

        let message = HarnessMessage::ProcessImage {
            request_id,
            image_bytes,
            filename: filename.to_string(),
            config,
        };

        let outcome = match self.inner.request(request_id, message).await {
            Ok(WorkerMessage::ProcessingResult {
                result: Some(result),
                processing_time_ms,
                ..
            }) => {
                logger.log_stage("normalize", result.timings.normalize_ms);
                logger.log_stage("faces", result.timings.faces_ms);
                logger.log_stage("interest", result.timings.interest_ms);
                logger.log_stage("colors", result.timings.colors_ms);
                debug!(request_id, processing_time_ms, "Worker processing time");
                Ok(result)
            }
            Ok(WorkerMessage::ProcessingResult {
                error: Some(error), ..
            }) => Err(HarnessError::from(error)),
            Ok(WorkerMessage::ProcessingResult { .. }) => Err(HarnessError::protocol(
                "PROCESSING_RESULT carried neither result nor error",
            )),
            Ok(_) => Err(HarnessError::protocol(
                "unexpected reply to PROCESS_IMAGE",
            )),
            Err(e) => Err(e),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(result) => logger.log_completion(
                elapsed_ms,
                &format!(
                    "{} faces, {} interest candidates, {} colors",
                    result.faces.len(),
                    result.interest_candidates.len(),
                    result.color_samples.len()
                ),
            ),
            Err(e) if e.is_retryable() => logger.log_warning(&e.to_string()),
            Err(e) => logger.log_error(&e.to_string()),
        }
        metrics::counter!("focal_harness_requests_total", "outcome" => outcome_label(&outcome))
            .increment(1);

        outcome
    }

    /// Round-trip a `HEALTH_CHECK`.
    pub async fn health_check(&self) -> HarnessResult<WorkerHealth> {
        let request_id = self.inner.next_request_id();
        match self
            .inner
            .request(request_id, HarnessMessage::HealthCheck { request_id })
            .await?
        {
            WorkerMessage::HealthCheckResult {
                initialized,
                has_processors,
                uptime,
                requests_processed,
                live_resources,
                total_resources,
                ..
            } => Ok(WorkerHealth {
                initialized,
                has_processors,
                uptime: Duration::from_millis(uptime),
                requests_processed,
                live_resources,
                total_resources,
            }),
            _ => Err(HarnessError::protocol("unexpected reply to HEALTH_CHECK")),
        }
    }

    /// Check that the worker process still exists. A dead worker is marked
    /// lost and a restart is scheduled; repeated misses against the same
    /// worker schedule nothing further.
    pub fn probe(&self) -> bool {
        self.inner.probe()
    }

    pub fn stats(&self) -> HarnessStats {
        let inner = &self.inner;
        let shared = inner.shared();
        HarnessStats {
            harness_id: inner.id,
            state: inner.state(),
            generation: shared.generation,
            worker_pid: shared.worker.as_ref().and_then(|w| w.pid),
            has_processors: shared.has_processors,
            requests: inner.counters.requests.load(Ordering::Relaxed),
            restarts: inner.counters.restarts.load(Ordering::Relaxed),
            timeouts: inner.counters.timeouts.load(Ordering::Relaxed),
            late_responses: inner.counters.late_responses.load(Ordering::Relaxed),
            crashes: inner.counters.crashes.load(Ordering::Relaxed),
            pending: shared.pending.len(),
            uptime: inner.started_at.elapsed(),
        }
    }

    /// Ask the worker to exit, then kill it once the grace period lapses.
    pub async fn shutdown(&self) -> HarnessResult<()> {
        let inner = &self.inner;
        if let Some(task) = lock(&inner.probe_task).take() {
            task.abort();
        }

        let worker = {
            let mut shared = inner.shared();
            inner.set_state(HarnessState::Stopped);
            for (_, reply) in shared.pending.drain() {
                let _ = reply.send(Err(HarnessError::WorkerUnavailable));
            }
            shared.worker.take()
        };

        let Some(mut worker) = worker else {
            return Ok(());
        };

        if let Err(e) = write_message(&worker.stdin, &HarnessMessage::Shutdown).await {
            debug!(harness = %inner.id, error = %e, "Could not deliver SHUTDOWN");
        }

        match tokio::time::timeout(inner.config.shutdown_grace, worker.child.wait()).await {
            Ok(Ok(status)) => {
                info!(harness = %inner.id, ?status, "Worker exited");
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!(
                    harness = %inner.id,
                    grace = ?inner.config.shutdown_grace,
                    "Worker ignored SHUTDOWN, killing it"
                );
                worker.child.kill().await?;
            }
        }
        Ok(())
    }

    fn spawn_probe_loop(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.probe_interval.max(MIN_PROBE_INTERVAL);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.state() == HarnessState::Stopped {
                    break;
                }
                inner.probe();
            }
        });
        *lock(&self.inner.probe_task) = Some(task);
    }
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    fn state(&self) -> HarnessState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: HarnessState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(harness = %self.id, from = %previous, to = %state, "Harness state changed");
        }
    }

    fn next_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Launch a new worker generation and wait for it to report ready.
    async fn launch(self: &Arc<Self>) -> HarnessResult<()> {
        let (generation, pid) = {
            let mut shared = self.shared();
            if self.state() == HarnessState::Stopped {
                return Err(HarnessError::WorkerUnavailable);
            }

            shared.generation += 1;
            shared.last_error = None;
            let generation = shared.generation;

            let (process, stdout, stderr) = match spawn_worker(&self.config, generation) {
                Ok(spawned) => spawned,
                Err(e) => {
                    self.set_state(HarnessState::Crashed);
                    return Err(e);
                }
            };
            let pid = process.pid;
            shared.worker = Some(process);
            self.set_state(HarnessState::Starting);

            tokio::spawn(read_worker_output(Arc::downgrade(self), generation, stdout));
            relay_stderr(stderr, self.id, generation, pid);
            (generation, pid)
        };

        info!(
            harness = %self.id,
            generation,
            pid = pid.unwrap_or_default(),
            program = %self.config.program.display(),
            "Worker launched"
        );

        let mut rx = self.state_tx.subscribe();
        let settled = tokio::time::timeout(
            self.config.startup_timeout,
            wait_for_state(&mut rx, |s| s != HarnessState::Starting),
        )
        .await;

        if let Ok(state) = settled {
            if state.accepts_requests() {
                return Ok(());
            }
        }

        let reason = {
            let mut shared = self.shared();
            if shared.generation == generation {
                if let Some(mut worker) = shared.worker.take() {
                    worker.kill();
                }
            }
            if self.state() != HarnessState::Stopped {
                self.set_state(HarnessState::Crashed);
            }
            shared.last_error.take().unwrap_or_else(|| {
                format!(
                    "no WORKER_READY within {:?}",
                    self.config.startup_timeout
                )
            })
        };

        error!(harness = %self.id, generation, reason = %reason, "Worker failed to start");
        Err(HarnessError::worker_startup(reason))
    }

    /// Send one request and wait for its reply or the request timeout.
    ///
    /// The deadline starts once the request owns the worker; time spent
    /// queued behind another request does not count against it.
    async fn request(
        self: &Arc<Self>,
        request_id: RequestId,
        message: HarnessMessage,
    ) -> HarnessResult<WorkerMessage> {
        if !self.state().accepts_requests() {
            return Err(HarnessError::WorkerUnavailable);
        }

        let _permit = self
            .dispatch
            .acquire()
            .await
            .map_err(|_| HarnessError::WorkerUnavailable)?;

        let (tx, rx) = oneshot::channel();
        let stdin = {
            let mut shared = self.shared();
            if self.state() != HarnessState::Ready {
                return Err(HarnessError::WorkerUnavailable);
            }
            let stdin = match shared.worker.as_ref() {
                Some(worker) => Arc::clone(&worker.stdin),
                None => return Err(HarnessError::WorkerUnavailable),
            };
            shared.pending.insert(request_id, tx);
            self.set_state(HarnessState::Busy(request_id));
            stdin
        };
        // Declared after the permit so it drops first
        let _in_flight = InFlight {
            inner: self,
            request_id,
        };
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let deadline = self.config.request_timeout;
        let exchange = async {
            write_message(&stdin, &message).await.map_err(|e| {
                HarnessError::worker_crashed(format!("failed to send request {}: {}", request_id, e))
            })?;
            rx.await.unwrap_or_else(|_| {
                Err(HarnessError::worker_crashed("worker dropped the request"))
            })
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(reply) => reply,
            Err(_) => {
                self.shared().pending.remove(&request_id);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("focal_harness_timeouts_total").increment(1);
                warn!(harness = %self.id, request_id, after = ?deadline, "Request timed out");

                // Only a failed probe justifies replacing a slow worker
                if !self.probe() {
                    warn!(harness = %self.id, request_id, "Timed-out worker is gone");
                }
                Err(HarnessError::Timeout {
                    request_id,
                    after: deadline,
                })
            }
        }
    }

    fn finish_request(&self, request_id: RequestId) {
        let _shared = self.shared();
        if self.state() == HarnessState::Busy(request_id) {
            self.set_state(HarnessState::Ready);
        }
    }

    fn probe(self: &Arc<Self>) -> bool {
        let generation = {
            let mut shared = self.shared();
            if !self.state().accepts_requests() {
                return false;
            }
            let alive = shared.worker.as_mut().is_some_and(WorkerProcess::is_alive);
            if alive {
                shared.probe_misses.record_success();
                return true;
            }
            if shared.probe_misses.record_failure() {
                warn!(harness = %self.id, generation = shared.generation, "Liveness probe failed");
            }
            shared.generation
        };

        self.worker_lost(generation, "liveness probe failed: worker process is gone".to_string());
        false
    }

    fn handle_line(self: &Arc<Self>, generation: u64, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let message: WorkerMessage = match decode_line(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(harness = %self.id, generation, error = %e, "Ignoring malformed worker message");
                return;
            }
        };

        match message {
            WorkerMessage::WorkerReady { pid, has_processors } => {
                let mut shared = self.shared();
                if shared.generation != generation {
                    return;
                }
                shared.has_processors = has_processors;
                shared.start_failures.record_success();
                if self.state() == HarnessState::Starting {
                    self.set_state(HarnessState::Ready);
                }
                info!(harness = %self.id, generation, pid, has_processors, "Worker ready");
            }
            WorkerMessage::WorkerError { error } => {
                error!(harness = %self.id, generation, error = %error, "Worker failed to initialize");
                self.worker_lost(generation, format!("initialization failed: {}", error));
            }
            WorkerMessage::WorkerCrash {
                error,
                location,
                request_id,
                live_resources,
            } => {
                self.counters.crashes.fetch_add(1, Ordering::Relaxed);
                error!(
                    harness = %self.id,
                    generation,
                    error = %error,
                    location = location.as_deref().unwrap_or("unknown"),
                    request_id = request_id.unwrap_or_default(),
                    live_resources,
                    "Worker crashed"
                );
                let reason = match location {
                    Some(location) => format!("{} at {}", error, location),
                    None => error,
                };
                self.worker_lost(generation, reason);
            }
            reply => {
                let Some(request_id) = reply.request_id() else {
                    return;
                };
                let waiter = self.shared().pending.remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(reply));
                    }
                    None => {
                        self.counters.late_responses.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("focal_harness_late_responses_total").increment(1);
                        debug!(harness = %self.id, request_id, "Discarding late response");
                    }
                }
            }
        }
    }

    /// The worker of `generation` is gone. Fails everything in flight and,
    /// unless a launch is waiting on it, schedules exactly one restart.
    fn worker_lost(self: &Arc<Self>, generation: u64, reason: String) {
        let state = {
            let mut shared = self.shared();
            let state = self.state();
            if shared.generation != generation
                || matches!(
                    state,
                    HarnessState::Crashed | HarnessState::Restarting | HarnessState::Stopped
                )
            {
                return;
            }

            for (_, reply) in shared.pending.drain() {
                let _ = reply.send(Err(HarnessError::worker_crashed(reason.clone())));
            }
            if let Some(mut worker) = shared.worker.take() {
                worker.kill();
            }
            shared.last_error = Some(reason.clone());
            self.set_state(HarnessState::Crashed);
            state
        };

        if state == HarnessState::Starting {
            return;
        }

        warn!(harness = %self.id, generation, reason = %reason, "Worker lost, scheduling restart");
        tokio::spawn(Arc::clone(self).restart_loop());
    }

    async fn restart_loop(self: Arc<Self>) {
        loop {
            {
                let _shared = self.shared();
                if self.state() == HarnessState::Stopped {
                    return;
                }
                self.set_state(HarnessState::Restarting);
            }

            tokio::time::sleep(self.config.restart_backoff).await;

            match self.launch().await {
                Ok(()) => {
                    self.counters.restarts.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("focal_harness_restarts_total").increment(1);
                    info!(harness = %self.id, "Worker restarted");
                    return;
                }
                Err(e) => {
                    if self.state() == HarnessState::Stopped {
                        return;
                    }
                    let failures = {
                        let mut shared = self.shared();
                        if shared.start_failures.record_failure() {
                            warn!(harness = %self.id, error = %e, "Worker restart failed");
                        }
                        shared.start_failures.failure_count()
                    };
                    if failures >= self.config.max_consecutive_start_failures {
                        error!(
                            harness = %self.id,
                            failures,
                            "Giving up on the worker after repeated start failures"
                        );
                        self.set_state(HarnessState::Stopped);
                        return;
                    }
                }
            }
        }
    }
}

/// Bookkeeping of one dispatched request. Dropping it forgets the pending
/// reply and hands the worker back, on every exit path including
/// cancellation of the caller.
struct InFlight<'a> {
    inner: &'a Inner,
    request_id: RequestId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.inner.shared().pending.remove(&self.request_id);
        self.inner.finish_request(self.request_id);
    }
}

async fn read_worker_output(weak: Weak<Inner>, generation: u64, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = lines.next_line().await;
        let Some(inner) = weak.upgrade() else { return };
        match next {
            Ok(Some(line)) => inner.handle_line(generation, &line),
            Ok(None) => {
                inner.worker_lost(generation, "worker exited".to_string());
                return;
            }
            Err(e) => {
                inner.worker_lost(generation, format!("failed to read worker output: {}", e));
                return;
            }
        }
    }
}

/// Wait until `done` accepts the current state.
async fn wait_for_state(
    rx: &mut watch::Receiver<HarnessState>,
    done: impl Fn(HarnessState) -> bool,
) -> HarnessState {
    loop {
        let current = *rx.borrow_and_update();
        if done(current) || rx.changed().await.is_err() {
            return current;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn outcome_label(outcome: &HarnessResult<ProcessingResult>) -> &'static str {
    match outcome {
        Ok(_) => "ok",
        Err(e) => e.reason(),
    }
}
