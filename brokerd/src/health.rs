//! Backend liveness probing.
//!
//! A probe is one fresh, fully closed round trip: connect to the candidate
//! port, send an `is_alive` request, read the reply under the probe timeout
//! and extract the remote pid. Nothing is cached between probes.

use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::config::Timeouts;
use crate::message::{Reply, Request, ResultCode};

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckResult {
    pub alive: bool,
    pub remote_pid: Option<u32>,
}

impl HealthCheckResult {
    fn dead() -> Self {
        Self {
            alive: false,
            remote_pid: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    timeouts: Timeouts,
    poll_interval: Duration,
}

impl HealthChecker {
    pub fn new(timeouts: Timeouts, poll_interval: Duration) -> Self {
        Self {
            timeouts,
            poll_interval,
        }
    }

    /// One liveness round trip against `localhost:port`. Connect failure,
    /// write failure, a reply that does not arrive within the probe timeout,
    /// and an unparseable reply all count as not-alive.
    pub async fn probe(&self, executable: &str, port: u16) -> HealthCheckResult {
        let connect = TcpStream::connect(("127.0.0.1", port));
        let stream = match timeout(self.timeouts.comm, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(executable, port, "probe connect failed: {}", err);
                return HealthCheckResult::dead();
            }
            Err(_) => {
                debug!(executable, port, "probe connect timed out");
                return HealthCheckResult::dead();
            }
        };

        let (reader, mut writer) = stream.into_split();
        let request = Request::server_status("is_alive");
        let line = match serde_json::to_string(&request) {
            Ok(line) => line + "\n",
            Err(err) => {
                debug!(executable, port, "probe encode failed: {}", err);
                return HealthCheckResult::dead();
            }
        };

        if let Err(err) = writer.write_all(line.as_bytes()).await {
            debug!(executable, port, "probe write failed: {}", err);
            return HealthCheckResult::dead();
        }

        let mut buf_reader = BufReader::new(reader);
        let mut reply_line = String::new();
        match timeout(self.timeouts.ping, buf_reader.read_line(&mut reply_line)).await {
            Ok(Ok(n)) if n > 0 => {}
            Ok(_) => {
                debug!(executable, port, "probe connection closed without reply");
                return HealthCheckResult::dead();
            }
            Err(_) => {
                debug!(executable, port, "probe reply timed out");
                return HealthCheckResult::dead();
            }
        }

        match serde_json::from_str::<Reply>(reply_line.trim()) {
            Ok(reply) if reply.result == ResultCode::Success => HealthCheckResult {
                alive: true,
                remote_pid: reply.pid,
            },
            Ok(reply) => {
                debug!(executable, port, result = ?reply.result, "probe refused");
                HealthCheckResult::dead()
            }
            Err(err) => {
                debug!(executable, port, "probe reply unparseable: {}", err);
                HealthCheckResult::dead()
            }
        }
    }

    /// Poll `probe` until it succeeds or `bound_secs` of wall-clock time
    /// elapse. Returns as soon as a probe succeeds.
    pub async fn wait_until_alive(&self, executable: &str, port: u16, bound_secs: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(bound_secs);
        loop {
            if self.probe(executable, port).await.alive {
                return true;
            }
            if Instant::now() >= deadline {
                debug!(executable, port, bound_secs, "gave up waiting for backend");
                return false;
            }
            sleep(self.poll_interval).await;
        }
    }
}
