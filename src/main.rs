//! failover-probe - inspect and exercise failover transport URIs

use broker_failover::config::{ClientConfig, FailoverConfig};
use broker_failover::observability::{init_default_logging, init_from_section};
use broker_failover::testing::MockNetwork;
use broker_failover::transport::uri::CompositeUri;
use broker_failover::transport::{narrow, Transport, TransportRegistry};
use broker_failover::FailoverTransport;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

/// Inspect failover URIs and run them against in-process brokers
#[derive(Parser)]
#[command(name = "failover-probe")]
#[command(about = "Inspect and exercise failover transport URIs")]
#[command(version)]
struct Cli {
    /// Client configuration; its `[logging]` section sets up logging
    #[arg(short, long, global = true, value_name = "FILE", env = "FAILOVER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the parsed URI and resolved configuration as JSON
    Inspect {
        /// Failover URI, e.g. failover:(mock://a:1,mock://b:2)?randomize=false
        uri: String,
    },
    /// Validate the TOML client configuration given with --config
    Check,
    /// Run a failover transport against the mock network
    Run {
        /// Failover URI; without one the configuration's [failover] section is used
        uri: Option<String>,
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.config.as_deref().map(ClientConfig::load_from_file).transpose() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };
    match &config {
        Some(config) => init_from_section(&config.logging),
        None => init_default_logging(),
    }

    let result = match cli.command {
        Commands::Inspect { uri } => inspect(&uri),
        Commands::Check => check(cli.config.as_deref(), config.as_ref()),
        Commands::Run { uri, seconds } => run(uri, config, seconds).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn inspect(uri: &str) -> Result<(), Box<dyn std::error::Error>> {
    let composite = CompositeUri::parse(uri)?;
    let config = FailoverConfig::from_uri_options(composite.components.clone(), &composite.options)?;

    let report = serde_json::json!({
        "uri": composite,
        "config": config,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn check(
    path: Option<&Path>,
    config: Option<&ClientConfig>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (Some(path), Some(config)) = (path, config) else {
        return Err("no configuration given (--config or FAILOVER_CONFIG)".into());
    };
    info!(
        "Configuration {} is valid: {} broker URI(s)",
        path.display(),
        config.failover.uris.len()
    );
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn run(
    uri: Option<String>,
    config: Option<ClientConfig>,
    seconds: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = TransportRegistry::with_mock_network(MockNetwork::global());
    let transport: Arc<dyn Transport> = match (uri, config) {
        (Some(uri), _) => registry.create(&uri).await?,
        (None, Some(config)) => FailoverTransport::new(config.failover, registry.clone())?,
        (None, None) => return Err("a failover URI or --config is required".into()),
    };
    let failover = narrow::<FailoverTransport>(&transport)
        .ok_or("URI does not name a failover transport")?;

    let mut states = failover.subscribe_state();
    transport.start().await?;
    info!(
        "Failover transport started over {:?}",
        failover.config().uris
    );

    let deadline = async {
        match seconds {
            Some(seconds) => sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                info!(
                    "State {} (connected to {})",
                    state,
                    failover.connected_uri().unwrap_or_else(|| "-".to_string())
                );
            }
            _ = &mut deadline => {
                info!("Run time elapsed");
                break;
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    transport.close().await?;
    let metrics = failover.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
