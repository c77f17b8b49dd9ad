//! Harness <-> worker message protocol.
//!
//! Messages travel as newline-delimited JSON over the worker's stdin/stdout.
//! Every request carries a `requestId`; the worker echoes it back so the
//! harness can match replies and drop late ones.

use serde::{Deserialize, Serialize};

use crate::processing::{ProcessingConfig, ProcessingError, ProcessingResult};

/// Monotonically increasing request identifier assigned by the harness.
pub type RequestId = u64;

/// Messages sent from the harness to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarnessMessage {
    /// Analyze one encoded image
    #[serde(rename_all = "camelCase")]
    ProcessImage {
        request_id: RequestId,
        #[serde(with = "base64_bytes")]
        image_bytes: Vec<u8>,
        filename: String,
        config: ProcessingConfig,
    },

    /// Ask the worker to report its status
    #[serde(rename_all = "camelCase")]
    HealthCheck { request_id: RequestId },

    /// Exit cleanly; no reply expected
    Shutdown,
}

/// Messages sent from the worker to the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Detectors are loaded and the worker accepts requests
    #[serde(rename_all = "camelCase")]
    WorkerReady { pid: u32, has_processors: bool },

    /// Initialization failed; the worker exits after sending this
    WorkerError { error: String },

    /// Unrecoverable fault; the worker exits after sending this
    #[serde(rename_all = "camelCase")]
    WorkerCrash {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        live_resources: usize,
    },

    /// Reply to `PROCESS_IMAGE`
    #[serde(rename_all = "camelCase")]
    ProcessingResult {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<ProcessingResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ProcessingError>,
        processing_time_ms: u64,
    },

    /// Reply to `HEALTH_CHECK`
    #[serde(rename_all = "camelCase")]
    HealthCheckResult {
        request_id: RequestId,
        initialized: bool,
        has_processors: bool,
        /// Milliseconds since the worker started
        uptime: u64,
        requests_processed: u64,
        live_resources: usize,
        total_resources: u64,
    },
}

impl WorkerMessage {
    /// Request id this message answers, if it is a reply.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            WorkerMessage::ProcessingResult { request_id, .. }
            | WorkerMessage::HealthCheckResult { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

/// Serialize a message as a single protocol line (without the newline).
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

/// Parse one protocol line.
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim())
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::ErrorKind;

    #[test]
    fn test_process_image_wire_shape() {
        let msg = HarnessMessage::ProcessImage {
            request_id: 7,
            image_bytes: vec![0xff, 0xd8, 0xff],
            filename: "beach.jpg".to_string(),
            config: ProcessingConfig::default(),
        };

        let value: serde_json::Value = serde_json::from_str(&encode_line(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], "PROCESS_IMAGE");
        assert_eq!(value["requestId"], 7);
        assert_eq!(value["imageBytes"], "/9j/");
        assert_eq!(value["config"]["faceDetectionEnabled"], true);
        assert_eq!(value["config"]["debugMode"], false);

        let back: HarnessMessage = decode_line(&encode_line(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_shutdown_is_bare_tag() {
        assert_eq!(
            encode_line(&HarnessMessage::Shutdown).unwrap(),
            r#"{"type":"SHUTDOWN"}"#
        );
    }

    #[test]
    fn test_error_result_parses() {
        let line = r#"{"type":"PROCESSING_RESULT","requestId":3,
            "error":{"kind":"decode","message":"bad header"},"processingTimeMs":4}"#;
        let msg: WorkerMessage = decode_line(line).unwrap();

        assert_eq!(msg.request_id(), Some(3));
        match msg {
            WorkerMessage::ProcessingResult { result, error, .. } => {
                assert!(result.is_none());
                assert_eq!(error.unwrap().kind, ErrorKind::Decode);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_ready_has_no_request_id() {
        let msg: WorkerMessage =
            decode_line(r#"{"type":"WORKER_READY","pid":42,"hasProcessors":false}"#).unwrap();
        assert_eq!(msg.request_id(), None);
    }
}
