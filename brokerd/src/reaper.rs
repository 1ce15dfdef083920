//! Child reaping.
//!
//! Backends are spawned detached, so their exit statuses accumulate until
//! someone collects them. `reap_all` drains every terminated or stopped
//! child without blocking and records abnormal endings for the
//! `failure_info` admin command. It never spawns replacements; respawn
//! happens lazily the next time a request finds the backend not alive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, warn};

const MAX_FAILURE_RECORDS: usize = 64;

/// How a reaped child went wrong.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    BadExit,
    BadSignal,
    BadStop,
}

/// One abnormal child ending. The broker does not retain child handles, so
/// records are keyed by pid only.
#[derive(Debug, Clone, Serialize)]
pub struct ChildFailure {
    pub pid: i32,
    pub class: ExitClass,
    /// Exit status for `BadExit`, signal number otherwise.
    pub code: i32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct Reaper {
    failures: Arc<Mutex<VecDeque<ChildFailure>>>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every terminated or stopped child, non-blocking. Returns the
    /// number of children reaped.
    pub fn reap_all(&self) -> usize {
        let mut reaped = 0;
        loop {
            match waitpid(
                Pid::from_raw(-1),
                Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED),
            ) {
                Ok(WaitStatus::Exited(pid, 0)) => {
                    reaped += 1;
                    debug!(pid = pid.as_raw(), "Child exited cleanly");
                }
                Ok(WaitStatus::Exited(pid, code)) => {
                    reaped += 1;
                    warn!(pid = pid.as_raw(), code, "Child had bad exit status");
                    self.record(pid, ExitClass::BadExit, code);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    reaped += 1;
                    warn!(pid = pid.as_raw(), signal = %signal, "Child killed by signal");
                    self.record(pid, ExitClass::BadSignal, signal as i32);
                }
                Ok(WaitStatus::Stopped(pid, signal)) => {
                    reaped += 1;
                    warn!(pid = pid.as_raw(), signal = %signal, "Child stopped by signal");
                    self.record(pid, ExitClass::BadStop, signal as i32);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(other) => {
                    debug!(status = ?other, "Ignoring child state change");
                }
                // ECHILD: no children left to wait for.
                Err(Errno::ECHILD) => break,
                Err(err) => {
                    debug!("waitpid failed: {}", err);
                    break;
                }
            }
        }
        reaped
    }

    fn record(&self, pid: Pid, class: ExitClass, code: i32) {
        let mut failures = self.failures.lock().unwrap();
        failures.push_front(ChildFailure {
            pid: pid.as_raw(),
            class,
            code,
            at: Utc::now(),
        });
        failures.truncate(MAX_FAILURE_RECORDS);
    }

    /// Recorded abnormal endings, newest first.
    pub fn recent_failures(&self) -> Vec<ChildFailure> {
        self.failures.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    // waitpid(-1) collects any child of the test process, so tests that
    // spawn children must not run interleaved with each other.
    static CHILD_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn reap_all_never_blocks() {
        let _serial = CHILD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let reaper = Reaper::new();
        let started = Instant::now();
        reaper.reap_all();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn nonzero_exit_is_recorded_as_bad_exit() {
        let _serial = CHILD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let child = Command::new("sh")
            .args(["-c", "exit 3"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn sh");
        let pid = child.id() as i32;
        drop(child);

        // Give the child a moment to exit, then drain.
        let reaper = Reaper::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            reaper.reap_all();
            let hit = reaper
                .recent_failures()
                .iter()
                .any(|f| f.pid == pid && f.class == ExitClass::BadExit && f.code == 3);
            if hit {
                break;
            }
            assert!(Instant::now() < deadline, "bad exit never recorded");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn clean_exit_is_not_recorded() {
        let _serial = CHILD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let child = Command::new("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn true");
        let pid = child.id() as i32;
        drop(child);

        let reaper = Reaper::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        // Drain until the child is gone, then confirm nothing was recorded
        // for it.
        loop {
            reaper.reap_all();
            let gone = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG))
                .err()
                .map(|e| e == Errno::ECHILD)
                .unwrap_or(false);
            if gone {
                break;
            }
            assert!(Instant::now() < deadline, "child never reaped");
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!reaper.recent_failures().iter().any(|f| f.pid == pid));
    }
}
