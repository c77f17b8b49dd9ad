//! Supervisor state and statistics.

use std::fmt;
use std::time::Duration;

use focal_models::RequestId;
use uuid::Uuid;

/// Lifecycle of the supervised worker:
/// `Starting -> Ready -> Busy(id) -> Ready | Crashed -> Restarting -> Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    /// Launched, waiting for `WORKER_READY`
    Starting,
    Ready,
    /// One request is in flight
    Busy(RequestId),
    /// Worker lost; a restart is pending or the launch failed
    Crashed,
    /// Waiting out the backoff before relaunching
    Restarting,
    /// Shut down, or gave up restarting
    Stopped,
}

impl HarnessState {
    /// True while a live worker is attached.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, HarnessState::Ready | HarnessState::Busy(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HarnessState::Starting => "starting",
            HarnessState::Ready => "ready",
            HarnessState::Busy(_) => "busy",
            HarnessState::Crashed => "crashed",
            HarnessState::Restarting => "restarting",
            HarnessState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HarnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessState::Busy(id) => write!(f, "busy({})", id),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Snapshot of supervisor counters.
#[derive(Debug, Clone)]
pub struct HarnessStats {
    pub harness_id: Uuid,
    pub state: HarnessState,
    /// Number of worker launches so far
    pub generation: u64,
    pub worker_pid: Option<u32>,
    pub has_processors: bool,
    /// Requests dispatched to a worker
    pub requests: u64,
    /// Successful relaunches after a crash
    pub restarts: u64,
    pub timeouts: u64,
    /// Replies that arrived after their request timed out
    pub late_responses: u64,
    /// `WORKER_CRASH` reports received
    pub crashes: u64,
    /// Requests awaiting a reply
    pub pending: usize,
    pub uptime: Duration,
}

/// Worker status from a `HEALTH_CHECK` round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHealth {
    pub initialized: bool,
    pub has_processors: bool,
    pub uptime: Duration,
    pub requests_processed: u64,
    pub live_resources: usize,
    pub total_resources: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(HarnessState::Busy(9).to_string(), "busy(9)");
        assert_eq!(HarnessState::Restarting.to_string(), "restarting");
        assert!(HarnessState::Busy(1).accepts_requests());
        assert!(!HarnessState::Starting.accepts_requests());
        assert!(!HarnessState::Crashed.accepts_requests());
    }
}
