//! Wire envelopes for broker traffic.
//!
//! One newline-delimited JSON `Request` per line, answered by one `Reply`
//! line. Backends managed by the broker speak the same envelope, which is
//! what makes the liveness probe a plain round trip.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message category carried by every request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// A data request addressed by a service URL.
    Data,
    /// A management/introspection request aimed at the server itself.
    ServerStatus,
}

/// Result code carried by every reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Success,
    BadMessage,
    NoServiceAvailable,
    ServiceDenied,
    ServerError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub msg_id: String,
    pub category: Category,
    /// Service address, present on data requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Command name, present on server-status requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub msg_id: String,
    pub result: ResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Resolved address with the canonical port, echoed on data replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Remote process id, carried on `is_alive` replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Request {
    pub fn data(url: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            category: Category::Data,
            url: Some(url.to_string()),
            command: None,
        }
    }

    pub fn server_status(command: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            category: Category::ServerStatus,
            url: None,
            command: Some(command.to_string()),
        }
    }
}

impl Reply {
    pub fn success(msg_id: &str) -> Self {
        Self::with_result(msg_id, ResultCode::Success)
    }

    pub fn with_result(msg_id: &str, result: ResultCode) -> Self {
        Self {
            msg_id: msg_id.to_string(),
            result,
            error: None,
            url: None,
            pid: None,
            payload: None,
        }
    }

    pub fn error(msg_id: &str, result: ResultCode, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_result(msg_id, result)
        }
    }

    pub fn with_url(mut self, url: String) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_request_serializes_without_command() {
        let req = Request::data("mdvp://localhost/radar/mosaic");
        let raw = serde_json::to_string(&req).unwrap();
        assert!(raw.contains("\"category\":\"data\""));
        assert!(!raw.contains("command"));
    }

    #[test]
    fn unknown_category_is_rejected() {
        let raw = r#"{"msg_id":"x","category":"telemetry"}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }

    #[test]
    fn reply_round_trip_preserves_pid_and_result() {
        let reply = Reply::success("abc").with_pid(4242);
        let raw = serde_json::to_string(&reply).unwrap();
        let back: Reply = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.result, ResultCode::Success);
        assert_eq!(back.pid, Some(4242));
        assert!(back.error.is_none());
    }
}
