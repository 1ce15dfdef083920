//! Request routing: the activation orchestrator.
//!
//! One `activate` call per data request. Resolve the address, probe the
//! canonical port, and if the backend is down either become the launcher
//! (first caller to claim the executable) or wait on the launch already in
//! progress. The pending entry is dropped on every exit path.

use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::health::HealthChecker;
use crate::launcher::Launcher;
use crate::lookup::{Lookup, ServiceAddress};
use crate::pending::PendingRegistry;

/// What one activation episode produced. The resolved address is reported
/// back to the client whenever resolution got far enough, success or not.
#[derive(Debug)]
pub struct ActivationReport {
    pub address: Option<ServiceAddress>,
    pub result: Result<(), BrokerError>,
}

pub struct Router {
    lookup: Lookup,
    health: HealthChecker,
    launcher: Launcher,
    pending: PendingRegistry,
    launch_wait_secs: u64,
    pending_wait_secs: u64,
}

impl Router {
    pub fn new(
        config: &BrokerConfig,
        health: HealthChecker,
        pending: PendingRegistry,
    ) -> Self {
        Self {
            lookup: Lookup::new(&config.services),
            health,
            launcher: Launcher::new(config.qmax_secs),
            pending,
            launch_wait_secs: config.launch_wait_secs,
            pending_wait_secs: config.pending_wait_secs,
        }
    }

    /// Bring the backend for `raw` up if needed and report the resolved
    /// address. Never takes the broker down; every failure is typed and
    /// local to this request.
    pub async fn activate(&self, raw: &str) -> ActivationReport {
        let mut address = match ServiceAddress::parse(raw) {
            Ok(address) => address,
            Err(err) => {
                return ActivationReport {
                    address: None,
                    result: Err(err),
                }
            }
        };

        let service = match self.lookup.resolve(&address) {
            Ok(service) => service,
            Err(err) => {
                // Unknown protocol: no registry mutation, no spawn.
                return ActivationReport {
                    address: Some(address),
                    result: Err(err),
                };
            }
        };

        // The resolved port is canonical, whatever the client supplied.
        if address.port != Some(service.port) {
            if let Some(supplied) = address.port {
                info!(
                    protocol = %address.protocol,
                    supplied,
                    canonical = service.port,
                    "Overriding client-supplied port"
                );
            }
            address.set_port(service.port);
        }

        debug!(
            url = %address,
            executable = %service.executable,
            port = service.port,
            "Resolved data request"
        );

        let probe = self.health.probe(&service.executable, service.port).await;
        if probe.alive {
            debug!(url = %address, pid = ?probe.remote_pid, "Backend already alive");
            return ActivationReport {
                address: Some(address),
                result: Ok(()),
            };
        }

        let result = match self.pending.claim(&service.executable) {
            Some(_guard) => {
                // This caller owns the launch; the guard releases the
                // pending entry however this block exits.
                let launcher = self.launcher.clone();
                let spawn_target = service.clone();
                let launched = tokio::task::spawn_blocking(move || launcher.launch(&spawn_target))
                    .await
                    .unwrap_or_else(|join_err| {
                        Err(BrokerError::Launch(
                            service.executable.clone(),
                            join_err.to_string(),
                        ))
                    });

                match launched {
                    Ok(pid) => {
                        debug!(executable = %service.executable, pid, "Waiting for launched backend");
                        if self
                            .health
                            .wait_until_alive(&service.executable, service.port, self.launch_wait_secs)
                            .await
                        {
                            Ok(())
                        } else {
                            // The child is left to fend for itself; a later
                            // probe may find it alive, or the reaper will
                            // collect it.
                            warn!(
                                executable = %service.executable,
                                port = service.port,
                                "Launched backend never became reachable"
                            );
                            Err(BrokerError::ReadinessTimeout(
                                service.executable.clone(),
                                self.launch_wait_secs,
                            ))
                        }
                    }
                    Err(err) => {
                        warn!(executable = %service.executable, "Launch failed: {}", err);
                        Err(err)
                    }
                }
            }
            None => {
                // Another caller is already activating this executable.
                // Wait for its spawn to come up; never launch a second one.
                debug!(
                    executable = %service.executable,
                    "Activation already in progress, waiting"
                );
                if self
                    .health
                    .wait_until_alive(&service.executable, service.port, self.pending_wait_secs)
                    .await
                {
                    Ok(())
                } else {
                    Err(BrokerError::ReadinessTimeout(
                        service.executable.clone(),
                        self.pending_wait_secs,
                    ))
                }
            }
        };

        ActivationReport {
            address: Some(address),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceEntry, Timeouts};
    use crate::message::ResultCode;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn test_router(executable: &str, port: u16, pending: PendingRegistry) -> Router {
        let mut config = BrokerConfig::default();
        config.qmax_secs = 60;
        config.launch_wait_secs = 1;
        config.pending_wait_secs = 1;
        config.services.insert(
            "mdvp".to_string(),
            ServiceEntry {
                executable: executable.to_string(),
                port,
                debug: false,
                secure: false,
                read_only: false,
            },
        );

        let timeouts = Timeouts {
            ping: Duration::from_millis(500),
            comm: Duration::from_millis(500),
        };
        let health = HealthChecker::new(timeouts, Duration::from_millis(50));
        Router::new(&config, health, pending)
    }

    async fn mock_backend_on(listener: TcpListener, pid: u32) {
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: crate::message::Request =
                            match serde_json::from_str(&line) {
                                Ok(request) => request,
                                Err(_) => break,
                            };
                        let reply =
                            crate::message::Reply::success(&request.msg_id).with_pid(pid);
                        let out = serde_json::to_string(&reply).unwrap() + "\n";
                        if writer.write_all(out.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn alive_backend_short_circuits_with_corrected_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        mock_backend_on(listener, 41).await;

        let pending = PendingRegistry::new();
        let router = test_router("mdv-server", port, pending.clone());

        // Client supplied a wrong port; the reply must carry the canonical
        // one.
        let report = router.activate("mdvp://localhost:9999/mosaic").await;
        assert!(report.result.is_ok());
        let address = report.address.unwrap();
        assert_eq!(address.port, Some(port));
        assert_eq!(address.path, "/mosaic");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unknown_protocol_is_refused_without_side_effects() {
        let pending = PendingRegistry::new();
        let router = test_router("mdv-server", free_port().await, pending.clone());

        let report = router.activate("bogus://localhost/x").await;
        let err = report.result.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::NoServiceAvailable);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn malformed_address_is_a_protocol_error() {
        let pending = PendingRegistry::new();
        let router = test_router("mdv-server", free_port().await, pending);

        let report = router.activate("not an address").await;
        assert!(report.address.is_none());
        let err = report.result.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::BadMessage);
    }

    #[tokio::test]
    async fn launch_failure_is_denied_and_registry_is_clean() {
        let pending = PendingRegistry::new();
        let router = test_router(
            "/nonexistent/mdv-server",
            free_port().await,
            pending.clone(),
        );

        let report = router.activate("mdvp://localhost/mosaic").await;
        let err = report.result.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ServiceDenied);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn pending_entry_routes_caller_to_the_wait_branch() {
        let pending = PendingRegistry::new();
        // The executable does not exist: if this caller wrongly took the
        // launch branch it would come back ServiceDenied, not ServerError.
        let router = test_router(
            "/nonexistent/mdv-server",
            free_port().await,
            pending.clone(),
        );

        let _guard = pending.claim("/nonexistent/mdv-server").unwrap();
        let report = router.activate("mdvp://localhost/mosaic").await;
        let err = report.result.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ServerError);

        // The waiter must not have disturbed the launcher's entry.
        assert!(pending.contains("/nonexistent/mdv-server"));
    }

    #[tokio::test]
    async fn waiter_succeeds_once_pending_launch_comes_up() {
        let port = free_port().await;
        let pending = PendingRegistry::new();
        let router = test_router("mdv-server", port, pending.clone());

        let guard = pending.claim("mdv-server").unwrap();

        // Simulate the other caller's spawn warming up.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            mock_backend_on(listener, 42).await;
        });

        let report = router.activate("mdvp://localhost/mosaic").await;
        assert!(report.result.is_ok());

        drop(guard);
        assert!(pending.is_empty());
    }
}
