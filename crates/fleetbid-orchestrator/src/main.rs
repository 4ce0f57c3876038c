//! fleetbid binary.
//!
//! ```bash
//! # Run the orchestrator with the default config lookup
//! RUST_LOG=info fleetbid serve --listen 0.0.0.0:8080
//!
//! # Register a device and announce an image task
//! fleetbid demo-client --addr 127.0.0.1:8080 --image cat.jpg
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fleetbid_orchestrator::client::{run_demo_client, DemoClientOptions};
use fleetbid_orchestrator::{DeviceServer, Orchestrator, OrchestratorConfig, StatusServer};

#[derive(Parser)]
#[command(
    name = "fleetbid",
    version = env!("CARGO_PKG_VERSION"),
    about = "Task bidding orchestrator for edge device fleets"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator.
    Serve {
        /// Config file (default: <config_dir>/fleetbid/orchestrator.toml).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Device listener address, overriding the config file.
        #[arg(short, long)]
        listen: Option<String>,

        /// Bid collection window in milliseconds, overriding the config file.
        #[arg(long)]
        deadline_ms: Option<u64>,

        /// Status API address, overriding the config file.
        #[arg(long)]
        status_addr: Option<String>,
    },

    /// Connect as a device, announce one task and print what comes back.
    DemoClient {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,

        #[arg(long, default_value = "demo-device")]
        device_id: String,

        /// Capabilities to register with (comma separated).
        #[arg(long, value_delimiter = ',', default_value = "classify")]
        capabilities: Vec<String>,

        /// Capability the announced task requires.
        #[arg(long)]
        capability: Option<String>,

        /// Image file to send as the task payload.
        #[arg(long)]
        image: Option<PathBuf>,

        #[arg(long)]
        npu: bool,

        #[arg(long, default_value_t = 0.3)]
        cpu_load: f64,

        #[arg(long, default_value_t = 85.0)]
        battery: f64,

        /// Bid on incoming bid requests.
        #[arg(long)]
        bid: bool,

        /// Seconds of silence before giving up.
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            deadline_ms,
            status_addr,
        } => {
            let mut config = OrchestratorConfig::load(config.as_deref())?;
            config.apply_overrides(listen, deadline_ms);
            if let Some(addr) = status_addr {
                config.status.bind_addr = addr;
            }
            config.validate()?;
            init_tracing(&config.logging.filter);
            serve(config).await
        }
        Command::DemoClient {
            addr,
            device_id,
            capabilities,
            capability,
            image,
            npu,
            cpu_load,
            battery,
            bid,
            timeout_secs,
        } => {
            init_tracing("info");
            let options = DemoClientOptions {
                addr,
                device_id,
                capabilities,
                has_npu: npu,
                cpu_load,
                battery,
                capability,
                image,
                answer_bids: bid,
                idle_timeout: Duration::from_secs(timeout_secs),
            };
            for message in run_demo_client(&options).await? {
                println!("{}", serde_json::to_string(&message)?);
            }
            Ok(())
        }
    }
}

/// `RUST_LOG` wins when set; otherwise `default_filter`.
fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();
}

async fn serve(config: OrchestratorConfig) -> Result<()> {
    let orchestrator = Orchestrator::new(&config);
    let server = DeviceServer::bind(&config.server, orchestrator.clone()).await?;

    tracing::info!(
        deadline_ms = config.bidding.deadline_ms,
        default_capability = %config.bidding.default_capability,
        history_len = config.ledger.history_len,
        "orchestrator starting"
    );

    let status = if config.status.enabled() {
        let status = StatusServer::bind(&config.status.bind_addr, orchestrator.clone()).await?;
        Some(tokio::spawn(status.run()))
    } else {
        None
    };

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("ctrl-c received, shutting down"),
    }

    if let Some(status) = status {
        status.abort();
    }
    Ok(())
}
