//! The broker's host loop: accept, dispatch, count clients, reap.
//!
//! One task per accepted connection; each connection may carry any number
//! of newline-delimited requests. Data requests go to the router, status
//! requests to the admin handler with a fallback to the framework commands
//! every server answers (`is_alive`, `num_clients`). The reaper runs after
//! each handled request and on the idle tick.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::admin::AdminHandler;
use crate::message::{Category, Reply, Request, ResultCode};
use crate::reaper::Reaper;
use crate::router::Router;

pub struct Broker {
    router: Router,
    admin: AdminHandler,
    reaper: Reaper,
    max_clients: usize,
    num_clients: Mutex<usize>,
    last_action: Mutex<Instant>,
}

impl Broker {
    pub fn new(router: Router, admin: AdminHandler, reaper: Reaper, max_clients: usize) -> Self {
        Self {
            router,
            admin,
            reaper,
            max_clients,
            num_clients: Mutex::new(0),
            last_action: Mutex::new(Instant::now()),
        }
    }

    /// Accept clients until the listener fails. Activation failures never
    /// end this loop; they are reported to the client that hit them.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "Accepted client");
            let broker = self.clone();
            tokio::spawn(async move {
                if let Err(err) = broker.handle_connection(stream).await {
                    error!(%peer, "Connection error: {}", err);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();

        if !self.try_admit() {
            warn!(max_clients = self.max_clients, "Too many clients, denying");
            let denial = Reply::error(
                "",
                ResultCode::ServiceDenied,
                format!("too many clients being handled (max {})", self.max_clients),
            );
            let line = serde_json::to_string(&denial)? + "\n";
            let _ = writer.write_all(line.as_bytes()).await;
            return Ok(());
        }

        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();
        let result = loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break Ok(()),
                Ok(_) => {
                    let raw = line.trim();
                    if raw.is_empty() {
                        continue;
                    }

                    let reply = match serde_json::from_str::<Request>(raw) {
                        Ok(request) => self.handle_request(request).await,
                        Err(err) => Reply::error(
                            "",
                            ResultCode::BadMessage,
                            format!("could not decode request: {}", err),
                        ),
                    };

                    let out = match serde_json::to_string(&reply) {
                        Ok(out) => out + "\n",
                        Err(err) => break Err(err.into()),
                    };
                    if let Err(err) = writer.write_all(out.as_bytes()).await {
                        break Err(err.into());
                    }

                    self.touch();
                    // Post-request tick.
                    self.reaper.reap_all();
                }
                Err(err) => break Err(err.into()),
            }
        };

        self.retire();
        result
    }

    async fn handle_request(&self, request: Request) -> Reply {
        match request.category {
            Category::Data => self.handle_data_request(&request).await,
            Category::ServerStatus => self
                .admin
                .handle(&request)
                .unwrap_or_else(|| self.handle_framework_command(&request)),
        }
    }

    async fn handle_data_request(&self, request: &Request) -> Reply {
        let Some(url) = request.url.as_deref() else {
            return Reply::error(
                &request.msg_id,
                ResultCode::BadMessage,
                "data request without a url",
            );
        };

        let report = self.router.activate(url).await;
        let mut reply = match report.result {
            Ok(()) => Reply::success(&request.msg_id),
            Err(err) => {
                info!(url, "Activation failed: {}", err);
                Reply::error(&request.msg_id, err.result_code(), err.to_string())
            }
        };
        if let Some(address) = report.address {
            reply = reply.with_url(address.to_string());
        }
        reply
    }

    /// Commands every server built on this loop answers, whatever its
    /// subclass-level handler recognizes.
    fn handle_framework_command(&self, request: &Request) -> Reply {
        match request.command.as_deref() {
            Some("is_alive") => Reply::success(&request.msg_id).with_pid(std::process::id()),
            Some("num_clients") => {
                let num_clients = *self.num_clients.lock().unwrap();
                Reply::success(&request.msg_id)
                    .with_payload(serde_json::json!({ "num_clients": num_clients }))
            }
            Some(other) => Reply::error(
                &request.msg_id,
                ResultCode::BadMessage,
                format!("unknown server command '{}'", other),
            ),
            None => Reply::error(
                &request.msg_id,
                ResultCode::BadMessage,
                "server-status request without a command",
            ),
        }
    }

    /// Idle-timeout tick. Backends self-terminate after their quiescence
    /// period; the broker itself runs indefinitely, so this only reaps and
    /// reports how long things have been quiet.
    pub fn idle_tick(&self) {
        let quiescent = self.last_action.lock().unwrap().elapsed();
        debug!(quiescent_secs = quiescent.as_secs(), "Idle tick");
        self.reaper.reap_all();
    }

    fn try_admit(&self) -> bool {
        let mut num_clients = self.num_clients.lock().unwrap();
        if *num_clients >= self.max_clients {
            return false;
        }
        *num_clients += 1;
        true
    }

    fn retire(&self) {
        self.touch();
        let mut num_clients = self.num_clients.lock().unwrap();
        *num_clients = num_clients.saturating_sub(1);
    }

    fn touch(&self) {
        *self.last_action.lock().unwrap() = Instant::now();
    }
}
