//! Harness configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Name of the worker executable installed next to the caller's binaries.
pub const WORKER_BINARY: &str = "focal-worker";

/// How the harness launches and supervises its worker process.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Worker executable
    pub program: PathBuf,
    /// Arguments passed to the worker
    pub args: Vec<String>,
    /// Extra environment for the worker (inherits the caller's otherwise)
    pub env: Vec<(String, String)>,
    /// Deadline for one request, measured from dispatch
    pub request_timeout: Duration,
    /// Deadline for `WORKER_READY` after launch
    pub startup_timeout: Duration,
    /// Interval between liveness probes
    pub probe_interval: Duration,
    /// Fixed delay before relaunching a crashed worker
    pub restart_backoff: Duration,
    /// Give up restarting after this many launches in a row fail
    pub max_consecutive_start_failures: u32,
    /// Time allowed for a clean exit after `SHUTDOWN`
    pub shutdown_grace: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::new(default_worker_program())
    }
}

impl HarnessConfig {
    /// Defaults for the given worker executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            request_timeout: Duration::from_secs(20),
            startup_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_secs(10),
            restart_backoff: Duration::from_secs(2),
            max_consecutive_start_failures: 5,
            shutdown_grace: Duration::from_secs(3),
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::new(
            std::env::var("FOCAL_WORKER_BIN")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_worker_program),
        );

        config.args = std::env::var("FOCAL_WORKER_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        config.request_timeout = env_millis("FOCAL_REQUEST_TIMEOUT_MS").unwrap_or(config.request_timeout);
        config.startup_timeout = env_millis("FOCAL_STARTUP_TIMEOUT_MS").unwrap_or(config.startup_timeout);
        config.probe_interval = env_millis("FOCAL_PROBE_INTERVAL_MS").unwrap_or(config.probe_interval);
        config.restart_backoff = env_millis("FOCAL_RESTART_BACKOFF_MS").unwrap_or(config.restart_backoff);
        config.shutdown_grace = env_millis("FOCAL_SHUTDOWN_GRACE_MS").unwrap_or(config.shutdown_grace);
        config.max_consecutive_start_failures = std::env::var("FOCAL_MAX_START_FAILURES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(config.max_consecutive_start_failures);

        config
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_start_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_start_failures = failures.max(1);
        self
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(Duration::from_millis)
}

/// `focal-worker` next to the running executable, else whatever is on `PATH`.
fn default_worker_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(WORKER_BINARY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::new("/usr/local/bin/focal-worker");
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert_eq!(config.startup_timeout, Duration::from_secs(10));
        assert_eq!(config.probe_interval, Duration::from_secs(10));
        assert_eq!(config.restart_backoff, Duration::from_secs(2));
        assert_eq!(config.max_consecutive_start_failures, 5);
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
        assert!(config.args.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = HarnessConfig::new("/bin/sh")
            .with_args(["-c", "exit 0"])
            .with_env("FOCAL_FACE_MODEL", "")
            .with_request_timeout(Duration::from_millis(250));

        assert_eq!(config.args, vec!["-c".to_string(), "exit 0".to_string()]);
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }
}
