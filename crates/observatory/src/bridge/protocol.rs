//! Message types shared by the socket, the channel pair and the engine pipe.
//!
//! Two layers:
//! - **Request / Response**: the unit exchanged across every boundary. A response
//!   answers the request carrying the same [`Timestamp`]; there is no other id.
//! - **Control envelopes**: wrap requests/responses on the engine process pipe
//!   and add the handshake and shutdown messages.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status text of the fire-and-forget acknowledgement.
pub const PROCESSING_MESSAGE: &str = "request being processed";

/// Status text of the synthetic response sent when a synced wait expires.
pub const TIMED_OUT_MESSAGE: &str = "timed out";

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Correlation key of a request.
///
/// Only equality matters. Values stamped by the hub are microseconds since the
/// Unix epoch, bumped when needed so they strictly increase within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Stamp a request received without a timestamp.
    pub fn now_unique() -> Self {
        let now = u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or_default();
        let prev = LAST_STAMP
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        Self(now.max(prev + 1))
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A command for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: Timestamp,
    /// `true`: the caller blocks for the real result. `false`: fire-and-forget.
    #[serde(default)]
    pub synced: bool,
}

impl Request {
    pub fn new(command: impl Into<String>, payload: Value, timestamp: Timestamp) -> Self {
        Self {
            command: command.into(),
            payload,
            timestamp,
            synced: false,
        }
    }

    pub fn synced(mut self, synced: bool) -> Self {
        self.synced = synced;
        self
    }
}

/// Request as read off the external socket, before validation.
///
/// Callers may leave the timestamp out; the hub stamps one on receipt.
#[derive(Debug, Clone, Deserialize)]
pub struct WireRequest {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub synced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("request has an empty command")]
    EmptyCommand,
}

impl WireRequest {
    pub fn parse(bytes: &[u8]) -> Result<Request, RequestError> {
        let wire: WireRequest =
            serde_json::from_slice(bytes).map_err(|e| RequestError::Malformed(e.to_string()))?;
        wire.into_request()
    }

    pub fn into_request(self) -> Result<Request, RequestError> {
        let command = self.command.trim();
        if command.is_empty() {
            return Err(RequestError::EmptyCommand);
        }
        Ok(Request {
            command: command.to_string(),
            payload: self.payload,
            timestamp: self.timestamp.unwrap_or_else(Timestamp::now_unique),
            synced: self.synced,
        })
    }
}

/// Reply to a request, matched to it by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub payload: Value,
    pub message: String,
    pub timestamp: Timestamp,
}

impl Response {
    pub fn new(payload: Value, message: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            payload,
            message: message.into(),
            timestamp,
        }
    }

    /// Immediate reply to a fire-and-forget request.
    pub fn acknowledge(request: &Request) -> Self {
        Self::new(request.payload.clone(), PROCESSING_MESSAGE, request.timestamp)
    }

    /// Synthetic reply when the engine did not answer a synced request in time.
    pub fn timed_out(request: &Request) -> Self {
        Self::new(request.payload.clone(), TIMED_OUT_MESSAGE, request.timestamp)
    }

    /// Error record for a request the engine could not serve.
    pub fn error(request: &Request, kind: &str, message: impl Into<String>) -> Self {
        Self::new(
            serde_json::json!({ "error": kind, "command": request.command }),
            message,
            request.timestamp,
        )
    }

    pub fn answers(&self, request: &Request) -> bool {
        self.timestamp == request.timestamp
    }

    pub fn is_timed_out(&self) -> bool {
        self.message == TIMED_OUT_MESSAGE
    }
}

/// Messages from the hub side to the engine process (child stdin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Deliver { request: Request },
    Shutdown,
}

/// Messages from the engine process to the hub side (child stdout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Sent once the registry is built. Lists the registered command names.
    Ready { commands: Vec<String> },

    Reply { response: Response },

    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ping() -> Request {
        Request::new("ping", json!("x"), Timestamp::new(100)).synced(true)
    }

    #[test]
    fn request_serializes() {
        insta::assert_json_snapshot!(ping(), @r#"
        {
          "command": "ping",
          "payload": "x",
          "timestamp": 100,
          "synced": true
        }
        "#);
    }

    #[test]
    fn response_serializes() {
        let resp = Response::new(json!("pong"), "ok", Timestamp::new(100));
        insta::assert_json_snapshot!(resp, @r#"
        {
          "payload": "pong",
          "message": "ok",
          "timestamp": 100
        }
        "#);
    }

    #[test]
    fn control_deliver_serializes() {
        let req = ControlRequest::Deliver { request: ping() };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "deliver",
          "request": {
            "command": "ping",
            "payload": "x",
            "timestamp": 100,
            "synced": true
          }
        }
        "#);
    }

    #[test]
    fn control_shutdown_serializes() {
        insta::assert_json_snapshot!(ControlRequest::Shutdown, @r#"
        {
          "type": "shutdown"
        }
        "#);
    }

    #[test]
    fn control_ready_serializes() {
        let resp = ControlResponse::Ready {
            commands: vec!["capture_photo".to_string(), "ping".to_string()],
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "type": "ready",
          "commands": [
            "capture_photo",
            "ping"
          ]
        }
        "#);
    }

    #[test]
    fn acknowledge_echoes_payload_and_timestamp() {
        let req = ping().synced(false);
        let ack = Response::acknowledge(&req);
        assert_eq!(ack.payload, json!("x"));
        assert_eq!(ack.message, PROCESSING_MESSAGE);
        assert!(ack.answers(&req));
    }

    #[test]
    fn timed_out_echoes_payload_and_timestamp() {
        let req = ping();
        let resp = Response::timed_out(&req);
        assert_eq!(resp.payload, json!("x"));
        assert!(resp.is_timed_out());
        assert!(resp.answers(&req));
    }

    #[test]
    fn error_response_names_kind_and_command() {
        let resp = Response::error(&ping(), "unknown_command", "unknown command: ping");
        assert_eq!(resp.payload, json!({"error": "unknown_command", "command": "ping"}));
        assert_eq!(resp.timestamp, Timestamp::new(100));
    }

    #[test]
    fn wire_request_defaults() {
        let req = WireRequest::parse(br#"{"command": "ping", "timestamp": 7}"#).unwrap();
        assert_eq!(req.payload, Value::Null);
        assert!(!req.synced);
        assert_eq!(req.timestamp, Timestamp::new(7));
    }

    #[test]
    fn wire_request_without_timestamp_is_stamped() {
        let a = WireRequest::parse(br#"{"command": "ping"}"#).unwrap();
        let b = WireRequest::parse(br#"{"command": "ping"}"#).unwrap();
        assert!(b.timestamp > a.timestamp);
    }

    #[test]
    fn wire_request_rejects_bad_shapes() {
        assert!(matches!(
            WireRequest::parse(br#"{"payload": 1}"#),
            Err(RequestError::Malformed(_))
        ));
        assert!(matches!(
            WireRequest::parse(br#"{"command": 12, "timestamp": 1}"#),
            Err(RequestError::Malformed(_))
        ));
        assert!(matches!(
            WireRequest::parse(b"not json"),
            Err(RequestError::Malformed(_))
        ));
        assert_eq!(
            WireRequest::parse(br#"{"command": "  "}"#).unwrap_err(),
            RequestError::EmptyCommand
        );
    }

    #[test]
    fn stamped_timestamps_strictly_increase() {
        let stamps: Vec<Timestamp> = (0..1000).map(|_| Timestamp::now_unique()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }
}
