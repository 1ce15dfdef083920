//! Minimal reference backend.
//!
//! Speaks the broker wire envelope on the port it is told to serve, answers
//! liveness probes with its pid, and exits cleanly after its quiescence
//! period passes without a client. The integration tests use it as the
//! executable the broker launches; the argument style is exactly what the
//! broker passes on the command line.

use std::io;
use std::process::exit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use brokerd_client::{Category, Reply, Request, ResultCode};

#[derive(Debug)]
struct Args {
    port: u16,
    instance: String,
    qmax_secs: u64,
    debug: bool,
    secure: bool,
    read_only: bool,
}

/// Parse `-port N -instance NAME -qmax S [-debug] [-secure] [-readOnly]`.
fn parse_args() -> Result<Args> {
    let mut args = Args {
        port: 0,
        instance: String::new(),
        qmax_secs: 0,
        debug: false,
        secure: false,
        read_only: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "-port" => {
                let value = iter.next().unwrap_or_default();
                args.port = value.parse()?;
            }
            "-instance" => {
                args.instance = iter.next().unwrap_or_default();
            }
            "-qmax" => {
                let value = iter.next().unwrap_or_default();
                args.qmax_secs = value.parse()?;
            }
            "-debug" => args.debug = true,
            "-secure" => args.secure = true,
            "-readOnly" => args.read_only = true,
            other => bail!("unknown argument '{}'", other),
        }
    }

    if args.port == 0 {
        bail!("-port is required");
    }
    Ok(args)
}

struct Activity {
    clients: AtomicUsize,
    last_action: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            clients: AtomicUsize::new(0),
            last_action: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_action.lock().unwrap() = Instant::now();
    }

    fn quiescent_for(&self) -> Duration {
        self.last_action.lock().unwrap().elapsed()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    let filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    info!(
        port = args.port,
        instance = %args.instance,
        qmax_secs = args.qmax_secs,
        secure = args.secure,
        read_only = args.read_only,
        "stub backend listening"
    );

    let activity = Arc::new(Activity::new());

    // Self-terminate after qmax seconds without a client. The broker will
    // launch a fresh instance the next time a request needs one.
    if args.qmax_secs > 0 {
        let activity = activity.clone();
        let qmax = Duration::from_secs(args.qmax_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if activity.clients.load(Ordering::SeqCst) == 0
                    && activity.quiescent_for() >= qmax
                {
                    info!(qmax_secs = qmax.as_secs(), "Quiescent too long, exiting");
                    exit(0);
                }
            }
        });
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "client connected");
        let activity = activity.clone();
        tokio::spawn(async move {
            activity.clients.fetch_add(1, Ordering::SeqCst);
            activity.touch();
            if let Err(err) = serve_client(stream).await {
                warn!(%peer, "client error: {}", err);
            }
            activity.touch();
            activity.clients.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

async fn serve_client(stream: TcpStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if buf_reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }

        let (reply, shutdown) = match serde_json::from_str::<Request>(raw) {
            Ok(request) => handle_request(&request),
            Err(err) => (
                Reply {
                    msg_id: String::new(),
                    result: ResultCode::BadMessage,
                    error: Some(format!("could not decode request: {}", err)),
                    url: None,
                    pid: None,
                    payload: None,
                },
                false,
            ),
        };

        let out = serde_json::to_string(&reply)? + "\n";
        writer.write_all(out.as_bytes()).await?;

        if shutdown {
            info!("Shutdown requested, exiting");
            exit(0);
        }
    }
}

fn handle_request(request: &Request) -> (Reply, bool) {
    let mut reply = Reply {
        msg_id: request.msg_id.clone(),
        result: ResultCode::Success,
        error: None,
        url: None,
        pid: None,
        payload: None,
    };

    match request.category {
        Category::ServerStatus => match request.command.as_deref() {
            Some("is_alive") => {
                reply.pid = Some(std::process::id());
                (reply, false)
            }
            // Backends honor remote shutdown; only the broker refuses it.
            Some("shutdown") => (reply, true),
            other => {
                reply.result = ResultCode::BadMessage;
                reply.error = Some(format!("unknown server command {:?}", other));
                (reply, false)
            }
        },
        Category::Data => {
            // A real backend would serve the addressed data here.
            reply.url = request.url.clone();
            (reply, false)
        }
    }
}
