use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleet_control::{
    status_channel, CacheSweeper, CommandOrchestrator, CommandTransport, Config, InMemoryTransport,
    RegionShardAssigner, SubscriptionTransport, TcpTransport,
};

/// fleetctl - send commands to IoT devices through regional endpoints
#[derive(Parser)]
#[command(name = "fleetctl", version, about)]
struct Cli {
    /// TOML file overlaid on the built-in defaults
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Address of a regional endpoint (e.g. 127.0.0.1:7400)
    #[arg(long, env = "FLEET_ENDPOINT")]
    endpoint: Option<String>,

    /// Use the in-process simulated cloud even when an endpoint is set
    #[arg(long)]
    simulate: bool,

    /// Simulated outage: fail this many sends before accepting
    #[arg(long, default_value = "0")]
    fail_sends: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the single JSON command in FILE
    Exec { file: PathBuf },
    /// Execute the JSON array of commands in FILE
    Batch { file: PathBuf },
    /// Show where a device's commands are routed
    Shard { device_id: String, region: String },
    /// Ask the device's shard endpoint for its current status
    Query { device_id: String, region: String },
    /// Subscribe to a device and print its last known status
    Status {
        device_id: String,
        /// How long to wait for status to arrive
        #[arg(long, default_value = "1000")]
        wait_ms: u64,
        /// Status older than this is reported stale
        #[arg(long, default_value = "300")]
        max_age_secs: u64,
    },
}

/// A running control plane and its background tasks
struct Plane {
    orchestrator: CommandOrchestrator,
    _pump: JoinHandle<()>,
    _sweeper: JoinHandle<()>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout stays machine readable
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match &cli.command {
        Command::Shard { device_id, region } => {
            let assigner = RegionShardAssigner::new(Arc::new(config.region_table()?));
            let shard = assigner.assign(device_id, region)?;
            print_json(&json!({
                "device_id": device_id,
                "shard_key": shard.shard_key(),
                "assignment": shard,
            }))
        }
        Command::Exec { file } => {
            let plane = start(&cli, &config)?;
            let raw = read_input(file)?;
            let result = plane.orchestrator.execute_command(&raw).await?;

            settle().await;
            let manager = plane.orchestrator.subscriptions();
            print_json(&json!({
                "result": result,
                "last_status": manager.get_last_status(&result.device_id),
                "subscriptions": manager.stats(),
            }))
        }
        Command::Batch { file } => {
            let plane = start(&cli, &config)?;
            let raw = read_input(file)?;
            let items: Vec<serde_json::Value> =
                serde_json::from_str(&raw).context("batch file must hold a JSON array")?;
            let raws: Vec<String> = items.iter().map(|item| item.to_string()).collect();

            let batch = plane.orchestrator.execute_batch(&raws).await;

            settle().await;
            print_json(&json!({
                "batch": batch,
                "subscriptions": plane.orchestrator.subscriptions().stats(),
            }))
        }
        Command::Query { device_id, region } => {
            let plane = start(&cli, &config)?;
            let event = plane.orchestrator.query_status(device_id, region).await?;
            print_json(&json!({
                "device_id": device_id,
                "status": event.status,
                "received_at_ms": event.received_at_ms,
            }))
        }
        Command::Status {
            device_id,
            wait_ms,
            max_age_secs,
        } => {
            let plane = start(&cli, &config)?;
            let manager = plane.orchestrator.subscriptions();
            let state = manager.ensure_subscribed(device_id).await?;
            info!(device_id = %device_id, "Subscription {}, waiting {} ms", state, wait_ms);

            tokio::time::sleep(Duration::from_millis(*wait_ms)).await;

            let reading = manager.last_status_within(device_id, Duration::from_secs(*max_age_secs));
            print_json(&json!({
                "device_id": device_id,
                "subscription": manager.state(device_id),
                "last_status": reading.as_ref().map(|r| &r.event),
                "age_ms": reading.as_ref().map(|r| r.age_ms),
                "stale": reading.as_ref().map(|r| r.stale),
            }))
        }
    }
}

/// Wire transports, orchestrator and background tasks
fn start(cli: &Cli, config: &Config) -> Result<Plane> {
    let (sink, pump) = status_channel(config.subscription.channel_capacity);

    let (commands, subscriptions) =
        match cli.endpoint.as_ref().filter(|_| !cli.simulate) {
            Some(address) => {
                info!("Using endpoint {}", address);
                let transport = Arc::new(TcpTransport::new(address.clone(), sink));
                (transport.clone() as Arc<dyn CommandTransport>, transport as Arc<dyn SubscriptionTransport>)
            }
            None => {
                info!("Using simulated cloud");
                let transport = InMemoryTransport::new().with_sink(sink);
                transport.fail_next_sends(cli.fail_sends);
                let transport = Arc::new(transport);
                (transport.clone() as Arc<dyn CommandTransport>, transport as Arc<dyn SubscriptionTransport>)
            }
        };

    let orchestrator = CommandOrchestrator::from_config(config, commands, subscriptions)?;
    let manager = orchestrator.subscriptions().clone();

    Ok(Plane {
        _pump: pump.start(manager.clone()),
        _sweeper: CacheSweeper::from_config(manager, &config.subscription).spawn(),
        orchestrator,
    })
}

fn read_input(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Give in-flight status pushes a moment to land in the cache
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
