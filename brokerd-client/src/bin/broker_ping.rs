//! One-shot liveness probe for a broker or backend port.
//!
//! Exit code 0 when the target answers the probe, 1 when it does not.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use brokerd_client::{BrokerClient, DEFAULT_BROKER_ADDR};

#[derive(Parser, Debug)]
#[command(name = "broker-ping", version)]
#[command(about = "Probe a broker or backend for liveness")]
struct Cli {
    /// Target address (host:port)
    #[arg(default_value = DEFAULT_BROKER_ADDR)]
    addr: String,

    /// Reply timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let client =
        BrokerClient::new(&cli.addr).with_timeout(Duration::from_millis(cli.timeout_ms));

    match client.is_alive().await {
        Ok(Some(pid)) => {
            println!("{} is alive, pid {}", cli.addr, pid);
            ExitCode::SUCCESS
        }
        Ok(None) => {
            eprintln!("{} answered but refused the probe", cli.addr);
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("{} is not reachable: {}", cli.addr, err);
            ExitCode::FAILURE
        }
    }
}
