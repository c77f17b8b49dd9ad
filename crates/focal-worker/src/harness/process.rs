//! Worker child process plumbing: launch, protocol writes, stderr relay.

use std::process::Stdio;
use std::sync::Arc;

use focal_models::{encode_line, HarnessMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};

/// A launched worker owned by the supervisor.
#[derive(Debug)]
pub(crate) struct WorkerProcess {
    pub generation: u64,
    pub pid: Option<u32>,
    pub child: Child,
    pub stdin: Arc<Mutex<ChildStdin>>,
}

impl WorkerProcess {
    /// True while the OS process has not exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Signal the process to die without waiting for it.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(generation = self.generation, error = %e, "Worker already gone");
        }
    }
}

/// Launch a worker with piped stdio. The child is killed if its handle
/// is dropped.
pub(crate) fn spawn_worker(
    config: &HarnessConfig,
    generation: u64,
) -> HarnessResult<(WorkerProcess, ChildStdout, ChildStderr)> {
    let mut child = Command::new(&config.program)
        .args(&config.args)
        .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            HarnessError::worker_startup(format!(
                "Failed to launch {}: {}",
                config.program.display(),
                e
            ))
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| HarnessError::worker_startup("worker stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| HarnessError::worker_startup("worker stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| HarnessError::worker_startup("worker stderr not captured"))?;

    let process = WorkerProcess {
        generation,
        pid: child.id(),
        child,
        stdin: Arc::new(Mutex::new(stdin)),
    };
    Ok((process, stdout, stderr))
}

/// Write one newline-terminated protocol message.
pub(crate) async fn write_message(
    stdin: &Mutex<ChildStdin>,
    message: &HarnessMessage,
) -> HarnessResult<()> {
    let mut line = encode_line(message)?;
    line.push('\n');

    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

/// Re-emit the worker's log lines through our own subscriber.
pub(crate) fn relay_stderr(
    stderr: ChildStderr,
    harness_id: Uuid,
    generation: u64,
    pid: Option<u32>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            debug!(
                target: "focal_worker::child",
                harness = %harness_id,
                generation,
                pid = pid.unwrap_or_default(),
                "{}", line
            );
        }
    })
}
