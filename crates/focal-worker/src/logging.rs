//! Tracing setup and request-scoped logging.
//!
//! Every binary in this crate logs to stderr: the worker's stdout is the
//! protocol channel, and the CLI prints its JSON result on stdout.

use std::io::IsTerminal;

use focal_models::RequestId;
use tracing::{error, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `LOG_FORMAT=json` selects JSON output;
/// `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(std::io::stderr().is_terminal())
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

/// Consistent lifecycle logging for one image request.
#[derive(Debug, Clone)]
pub struct RequestLogger {
    request_id: RequestId,
    filename: String,
}

impl RequestLogger {
    pub fn new(request_id: RequestId, filename: &str) -> Self {
        Self {
            request_id,
            filename: filename.to_string(),
        }
    }

    pub fn log_start(&self, bytes: usize) {
        info!(
            request_id = self.request_id,
            filename = %self.filename,
            bytes,
            "Request started"
        );
    }

    /// Log one pipeline stage.
    pub fn log_stage(&self, stage: &str, elapsed_ms: u64) {
        info!(
            request_id = self.request_id,
            filename = %self.filename,
            stage,
            elapsed_ms,
            "Stage finished"
        );
    }

    pub fn log_completion(&self, elapsed_ms: u64, summary: &str) {
        info!(
            request_id = self.request_id,
            filename = %self.filename,
            elapsed_ms,
            "Request completed: {}", summary
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            request_id = self.request_id,
            filename = %self.filename,
            "Request warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            request_id = self.request_id,
            filename = %self.filename,
            "Request failed: {}", message
        );
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Span carrying the request fields.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "request",
            request_id = self.request_id,
            filename = %self.filename
        )
    }
}
