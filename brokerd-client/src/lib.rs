//! Client library for the brokerd data-server broker.
//!
//! Every call is one fresh connection carrying one newline-delimited JSON
//! request and one reply; connections are not reused. The same envelope is
//! spoken by the broker and by the backends it manages, so this client can
//! probe either.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:5435";
const DEFAULT_COMM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not connect to {0}: {1}")]
    Connect(String, String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("connection closed without a reply")]
    Disconnected,
    #[error("invalid reply: {0}")]
    InvalidReply(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Data,
    ServerStatus,
}

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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub msg_id: String,
    pub result: ResultCode,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Client handle for one broker (or backend) address.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    addr: String,
    comm_timeout: Duration,
}

impl BrokerClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            comm_timeout: DEFAULT_COMM_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, comm_timeout: Duration) -> Self {
        self.comm_timeout = comm_timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Ask the broker to activate the backend behind `url`. On success the
    /// reply's `url` carries the canonical port to connect to.
    pub async fn request(&self, url: &str) -> Result<Reply, ClientError> {
        self.round_trip(Request {
            msg_id: Uuid::new_v4().to_string(),
            category: Category::Data,
            url: Some(url.to_string()),
            command: None,
        })
        .await
    }

    /// Send a management command (`num_servers`, `failure_info`, ...).
    pub async fn server_status(&self, command: &str) -> Result<Reply, ClientError> {
        self.round_trip(Request {
            msg_id: Uuid::new_v4().to_string(),
            category: Category::ServerStatus,
            url: None,
            command: Some(command.to_string()),
        })
        .await
    }

    /// One liveness round trip. Returns the remote pid when alive, `None`
    /// when the process answered but refused, an error when unreachable.
    pub async fn is_alive(&self) -> Result<Option<u32>, ClientError> {
        let reply = self.server_status("is_alive").await?;
        if reply.result == ResultCode::Success {
            Ok(reply.pid)
        } else {
            Ok(None)
        }
    }

    /// Send one raw line, read one reply line. A fresh connection per call.
    async fn round_trip(&self, request: Request) -> Result<Reply, ClientError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|err| ClientError::Connect(self.addr.clone(), err.to_string()))?;
        let (reader, mut writer) = stream.into_split();

        let line = serde_json::to_string(&request)
            .map_err(|err| ClientError::InvalidReply(err.to_string()))?
            + "\n";
        writer.write_all(line.as_bytes()).await?;
        debug!(addr = %self.addr, msg_id = %request.msg_id, "Request sent");

        let mut buf_reader = BufReader::new(reader);
        let mut reply_line = String::new();
        let n = timeout(self.comm_timeout, buf_reader.read_line(&mut reply_line))
            .await
            .map_err(|_| ClientError::Timeout)??;
        if n == 0 {
            return Err(ClientError::Disconnected);
        }

        serde_json::from_str(reply_line.trim())
            .map_err(|err| ClientError::InvalidReply(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shapes_match_the_wire_format() {
        let raw = r#"{"msg_id":"m1","result":"no_service_available","error":"nope","url":"mdvp://localhost:5440/x"}"#;
        let reply: Reply = serde_json::from_str(raw).unwrap();
        assert_eq!(reply.result, ResultCode::NoServiceAvailable);
        assert_eq!(reply.pid, None);
        assert_eq!(reply.url.as_deref(), Some("mdvp://localhost:5440/x"));
    }

    #[tokio::test]
    async fn connect_failure_is_reported_as_connect_error() {
        // Bind-and-drop to find a dead port.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = BrokerClient::new(format!("127.0.0.1:{}", port))
            .with_timeout(Duration::from_millis(500));
        match client.is_alive().await {
            Err(ClientError::Connect(..)) => {}
            other => panic!("expected connect error, got {:?}", other),
        }
    }
}
