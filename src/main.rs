//! Turngate operator - Gateway API control plane for TURN relays

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use turngate::client::{KubeGatewayClient, KubeStatusClient};
use turngate::config::ControllerConfig;
use turngate::crd::{Dataplane, GatewayConfig};
use turngate::distribution::{self, ConfigDistributor, DistributionState};
use turngate::pipeline::Pipeline;
use turngate::store::Store;
use turngate::watch::spawn_watchers;
use turngate::{DEFAULT_CONTROLLER_NAME, DEFAULT_DATAPLANE};

/// Turngate - renders Gateway API resources into TURN relay configuration
#[derive(Parser, Debug)]
#[command(name = "turngate", version, about, long_about = None)]
struct Cli {
    /// Print the GatewayConfig and Dataplane CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// GatewayClass controllerName handled by this instance
    #[arg(long, env = "TURNGATE_CONTROLLER_NAME", default_value = DEFAULT_CONTROLLER_NAME)]
    controller_name: String,

    /// Expand backends into their ready endpoint addresses
    #[arg(
        long,
        env = "TURNGATE_ENDPOINT_DISCOVERY",
        default_value_t = true,
        action = ArgAction::Set
    )]
    endpoint_discovery: bool,

    /// Add the backend Service cluster IP to rendered clusters
    #[arg(
        long,
        env = "TURNGATE_RELAY_TO_CLUSTER_IP",
        default_value_t = true,
        action = ArgAction::Set
    )]
    relay_to_cluster_ip: bool,

    /// Dataplane used when a GatewayConfig names none
    #[arg(long, env = "TURNGATE_DEFAULT_DATAPLANE", default_value = DEFAULT_DATAPLANE)]
    default_dataplane: String,

    /// Listen address of the config distribution server
    #[arg(long, env = "TURNGATE_DISTRIBUTION_ADDR")]
    distribution_addr: Option<SocketAddr>,

    /// Bearer token relays must present to the distribution server
    #[arg(long, env = "TURNGATE_DISTRIBUTION_TOKEN", hide_env_values = true)]
    distribution_token: Option<String>,

    /// Attempts for a status write that keeps hitting conflicts
    #[arg(long, env = "TURNGATE_STATUS_RETRY_ATTEMPTS", default_value_t = 5)]
    status_retry_attempts: u32,

    /// Seconds before failed status writes are retried
    #[arg(long, env = "TURNGATE_STATUS_RETRY_SECS", default_value_t = 5)]
    status_retry_secs: u64,

    /// Versions buffered per every-version subscriber
    #[arg(long, env = "TURNGATE_SUBSCRIBER_BUFFER", default_value_t = 16)]
    subscriber_buffer: usize,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        let defaults = ControllerConfig::default();
        ControllerConfig {
            controller_name: self.controller_name.clone(),
            endpoint_discovery: self.endpoint_discovery,
            relay_to_cluster_ip: self.relay_to_cluster_ip,
            default_dataplane: self.default_dataplane.clone(),
            status_retry_attempts: self.status_retry_attempts,
            status_retry_interval: Duration::from_secs(self.status_retry_secs),
            subscriber_buffer: self.subscriber_buffer,
            distribution_addr: self.distribution_addr.unwrap_or(defaults.distribution_addr),
            distribution_token: self.distribution_token.clone(),
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let gateway_config = serde_yaml::to_string(&GatewayConfig::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let dataplane = serde_yaml::to_string(&Dataplane::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{gateway_config}---\n{dataplane}");
        return Ok(());
    }

    let config = cli.controller_config();
    config.validate()?;
    run_controller(config).await
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    info!(controller = %config.controller_name, "Starting turngate");

    let token = CancellationToken::new();
    let store = Arc::new(Store::new());
    let distributor = ConfigDistributor::new(config.subscriber_buffer);

    let pipeline = Pipeline::spawn(
        &config,
        store.clone(),
        Arc::new(KubeGatewayClient::new(client.clone())),
        Arc::new(KubeStatusClient::new(client.clone())),
        distributor.clone(),
        token.clone(),
    )?;
    let watchers = spawn_watchers(client, store, token.clone());

    let state = DistributionState::new(distributor, config.distribution_token.clone());
    let mut server = tokio::spawn(distribution::serve(
        config.distribution_addr,
        state,
        token.clone(),
    ));

    let server_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received shutdown signal");
            None
        }
        result = &mut server => Some(result),
    };

    token.cancel();
    pipeline.shutdown().await;
    for watcher in watchers {
        if let Err(e) = watcher.await {
            warn!(error = %e, "Watcher task panicked");
        }
    }

    let server_result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    server_result
        .map_err(|e| anyhow::anyhow!("Distribution server task failed: {}", e))?
        .map_err(|e| anyhow::anyhow!("Distribution server failed: {}", e))?;

    info!("Turngate stopped");
    Ok(())
}
