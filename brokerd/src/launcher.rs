//! On-demand backend launching.
//!
//! A launch is three steps: best-effort termination of any stale process
//! believed to hold the target port, argv construction, and a detached
//! spawn. The call returns as soon as the child exists; readiness is the
//! caller's problem, established separately through the health checker.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::lookup::ResolvedService;

#[derive(Debug, Clone)]
pub struct Launcher {
    qmax_secs: u64,
}

impl Launcher {
    pub fn new(qmax_secs: u64) -> Self {
        Self { qmax_secs }
    }

    /// Spawn the backend for `service`. Returns the child pid. The child
    /// handle is not retained; the reaper collects its exit status later.
    ///
    /// Blocking (proc-table scan plus spawn); callers on the runtime should
    /// wrap this in `spawn_blocking`.
    pub fn launch(&self, service: &ResolvedService) -> Result<u32, BrokerError> {
        // Orphans from a previous broker crash may still hold the port.
        // Failure to find or kill anything here is not an error.
        kill_stale(&service.executable, service.port);

        let args = self.build_args(service);
        info!(
            executable = %service.executable,
            port = service.port,
            args = ?args,
            "Launching backend"
        );

        // All non-stdio descriptors of this process are close-on-exec, so
        // the listener and client sockets do not leak into the child. The
        // child gets null stdio; its diagnostics go through its own logging.
        let child = Command::new(&service.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| BrokerError::Launch(service.executable.clone(), err.to_string()))?;

        let pid = child.id();
        debug!(executable = %service.executable, pid, "Backend spawned");
        // Dropping the handle leaves the exit status for the reaper.
        drop(child);
        Ok(pid)
    }

    fn build_args(&self, service: &ResolvedService) -> Vec<String> {
        let mut args = vec![
            "-port".to_string(),
            service.port.to_string(),
            "-instance".to_string(),
            "manager".to_string(),
            "-qmax".to_string(),
            self.qmax_secs.to_string(),
        ];
        if service.debug {
            args.push("-debug".to_string());
        }
        if service.secure {
            args.push("-secure".to_string());
        }
        if service.read_only {
            args.push("-readOnly".to_string());
        }
        args
    }
}

/// Scan the process table for a leftover instance of `executable` launched
/// against `port` and ask it to terminate. Best-effort on every step.
fn kill_stale(executable: &str, port: u16) {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let target_name = Path::new(executable)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| executable.to_string());
    let port_str = port.to_string();
    let own_pid = std::process::id();

    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let argv: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).to_string())
            .collect();

        if !matches_backend(&argv, &target_name, &port_str) {
            continue;
        }

        warn!(pid, executable = %target_name, port, "Terminating stale backend");
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, "stale kill failed (ignored): {}", err);
        }
    }
}

fn matches_backend(argv: &[String], target_name: &str, port_str: &str) -> bool {
    let Some(argv0) = argv.first() else {
        return false;
    };
    let argv0_name = Path::new(argv0)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| argv0.clone());
    if argv0_name != target_name {
        return false;
    }

    argv.windows(2)
        .any(|pair| pair[0] == "-port" && pair[1] == port_str)
}
