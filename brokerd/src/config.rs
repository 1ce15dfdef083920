//! Broker configuration: a TOML file for the service table and wait bounds,
//! plus two millisecond-scale timeout overrides read once from the
//! environment at startup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_BIND: &str = "127.0.0.1:5435";
pub const DEFAULT_PING_TIMEOUT_MSECS: u64 = 10_000;
pub const DEFAULT_COMM_TIMEOUT_MSECS: u64 = 30_000;

const PING_TIMEOUT_ENV: &str = "BROKERD_PING_TIMEOUT_MSECS";
const COMM_TIMEOUT_ENV: &str = "BROKERD_COMM_TIMEOUT_MSECS";

/// One backend kind the broker knows how to launch.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    /// Executable name or path handed to the spawn call.
    pub executable: String,
    /// Canonical port for this backend kind, authoritative over any port a
    /// client embeds in its address.
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Quiescence bound passed to spawned backends via `-qmax`.
    #[serde(default = "default_qmax_secs")]
    pub qmax_secs: u64,
    /// How long a launching caller waits for its own spawn to come up.
    #[serde(default = "default_launch_wait_secs")]
    pub launch_wait_secs: u64,
    /// How long a caller waits on a launch already in progress elsewhere.
    #[serde(default = "default_pending_wait_secs")]
    pub pending_wait_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Protocol name -> backend entry.
    #[serde(default)]
    pub services: HashMap<String, ServiceEntry>,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_max_clients() -> usize {
    1024
}
fn default_qmax_secs() -> u64 {
    3600
}
fn default_launch_wait_secs() -> u64 {
    5
}
fn default_pending_wait_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    200
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_clients: default_max_clients(),
            qmax_secs: default_qmax_secs(),
            launch_wait_secs: default_launch_wait_secs(),
            pending_wait_secs: default_pending_wait_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            services: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: BrokerConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Probe-reply and general communication timeouts. Two distinct knobs with
/// independent environment overrides.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub ping: Duration,
    pub comm: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ping: Duration::from_millis(DEFAULT_PING_TIMEOUT_MSECS),
            comm: Duration::from_millis(DEFAULT_COMM_TIMEOUT_MSECS),
        }
    }
}

impl Timeouts {
    /// Read the environment overrides. Called once at process start; absent
    /// or unparseable values fall back to the built-in defaults.
    pub fn from_env() -> Self {
        Self {
            ping: env_msecs(PING_TIMEOUT_ENV, DEFAULT_PING_TIMEOUT_MSECS),
            comm: env_msecs(COMM_TIMEOUT_ENV, DEFAULT_COMM_TIMEOUT_MSECS),
        }
    }
}

fn env_msecs(var: &str, default_ms: u64) -> Duration {
    let msecs = match std::env::var(var) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(value) => value,
            Err(err) => {
                warn!("Invalid {} value '{}': {}", var, raw, err);
                default_ms
            }
        },
        Err(_) => default_ms,
    };
    Duration::from_millis(msecs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let config: BrokerConfig = toml::from_str(
            r#"
            [services.mdvp]
            executable = "mdv-server"
            port = 5440
            "#,
        )
        .unwrap();

        assert_eq!(config.bind, DEFAULT_BIND);
        assert_eq!(config.launch_wait_secs, 5);
        assert_eq!(config.pending_wait_secs, 10);
        assert_eq!(config.poll_interval_ms, 200);

        let entry = config.services.get("mdvp").unwrap();
        assert_eq!(entry.port, 5440);
        assert!(!entry.secure);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = BrokerConfig::load(Path::new("/nonexistent/brokerd.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn load_parses_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            bind = "127.0.0.1:6000"
            max_clients = 16
            qmax_secs = 120

            [services.spdbp]
            executable = "/opt/servers/spdb-server"
            port = 5441
            secure = true
            "#
        )
        .unwrap();

        let config = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(config.bind, "127.0.0.1:6000");
        assert_eq!(config.max_clients, 16);
        assert!(config.services.get("spdbp").unwrap().secure);
    }

    #[test]
    fn env_msecs_falls_back_on_garbage() {
        std::env::set_var("BROKERD_TEST_TIMEOUT", "not-a-number");
        assert_eq!(
            env_msecs("BROKERD_TEST_TIMEOUT", 1234),
            Duration::from_millis(1234)
        );
        std::env::remove_var("BROKERD_TEST_TIMEOUT");
    }
}
