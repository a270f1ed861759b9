use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use natsync_azure::{AzureFirewallStore, EnvToken};
use natsync_core::OWNED_COLLECTION;
use natsync_kubewatch::KubeServices;
use natsync_reconcile::{Reconciler, SupervisorConfig};
use natsync_store::{FirewallAddress, FirewallStore, MemoryStore};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Environment variable holding the management API bearer token.
const TOKEN_VAR: &str = "NATSYNC_AZURE_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "natsyncd", version, about = "Mirror LoadBalancer services onto a firewall DNAT collection")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct RemoteArgs {
    /// Subscription the firewall lives in
    #[arg(long, env = "NATSYNC_SUBSCRIPTION_ID")]
    subscription: Option<String>,

    /// Resource group of the firewall
    #[arg(long, env = "NATSYNC_RESOURCE_GROUP")]
    resource_group: Option<String>,

    /// Name of the firewall resource
    #[arg(long, env = "NATSYNC_FIREWALL_NAME")]
    firewall: Option<String>,
}

impl RemoteArgs {
    /// Startup-fatal when any addressing value is missing.
    fn address(&self) -> Result<FirewallAddress> {
        match (&self.subscription, &self.resource_group, &self.firewall) {
            (Some(subscription), Some(resource_group), Some(firewall)) => Ok(FirewallAddress {
                subscription: subscription.clone(),
                resource_group: resource_group.clone(),
                firewall: firewall.clone(),
            }),
            _ => bail!(
                "missing remote addressing: --subscription, --resource-group and --firewall \
                 (or NATSYNC_SUBSCRIPTION_ID / NATSYNC_RESOURCE_GROUP / NATSYNC_FIREWALL_NAME) are required"
            ),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch LoadBalancer services and reconcile the owned DNAT collection
    Run {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Seconds to wait before resubscribing after a stream failure
        #[arg(long, default_value_t = 5)]
        backoff_secs: u64,

        /// Force a full resubscribe (and relist) this often, in seconds
        #[arg(long)]
        resync_secs: Option<u64>,

        /// Bound on a single remote read or write, in seconds
        #[arg(long, default_value_t = 30)]
        remote_timeout_secs: u64,

        /// Reconcile against an in-memory firewall instead of the remote one
        #[arg(long, action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Fetch the firewall and print the owned DNAT collection
    Show {
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("NATSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NATSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid NATSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { remote, backoff_secs, resync_secs, remote_timeout_secs, dry_run } => {
            let config = SupervisorConfig {
                backoff: Duration::from_secs(backoff_secs),
                resync: resync_secs.map(Duration::from_secs),
            };
            let timeout = Duration::from_secs(remote_timeout_secs);
            if dry_run {
                info!("dry-run: reconciling against an in-memory firewall");
                run_controller(MemoryStore::new(), config, timeout).await
            } else {
                let address = remote.address()?;
                info!(firewall = %address, "reconciling against remote firewall");
                let store = AzureFirewallStore::new(address, EnvToken::new(TOKEN_VAR));
                run_controller(store, config, timeout).await
            }
        }
        Commands::Show { remote } => {
            let address = remote.address()?;
            let store = AzureFirewallStore::new(address, EnvToken::new(TOKEN_VAR));
            let state = store.read().await?;
            let owned = state
                .properties
                .nat_rule_collections
                .iter()
                .find(|c| c.name == OWNED_COLLECTION);
            match cli.output {
                Output::Json => match owned {
                    Some(c) => println!("{}", serde_json::to_string_pretty(c)?),
                    None => println!("null"),
                },
                Output::Human => match owned {
                    Some(c) => {
                        println!("collection: {} (priority {:?})", c.name, c.priority);
                        println!("{:<28} {:<6} {:<22} {}", "NAME", "PROTO", "DESTINATION", "TARGET");
                        for rule in &c.rules {
                            let get = |k: &str| rule.get(k).and_then(|v| v.as_str()).unwrap_or("-").to_string();
                            let port = |k: &str| rule.get(k).and_then(|v| v.as_u64()).map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
                            println!(
                                "{:<28} {:<6} {:<22} {}",
                                get("name"),
                                get("protocol"),
                                format!("{}:{}", get("destinationAddress"), port("destinationPort")),
                                format!("{}:{}", get("translatedAddress"), port("translatedPort")),
                            );
                        }
                    }
                    None => println!("owned collection {} not present", OWNED_COLLECTION),
                },
            }
            Ok(())
        }
    }
}

async fn run_controller<S: FirewallStore + 'static>(
    store: S,
    config: SupervisorConfig,
    remote_timeout: Duration,
) -> Result<()> {
    let reconciler = Reconciler::new(store).with_remote_timeout(remote_timeout);
    let source = KubeServices::try_default().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    natsync_reconcile::run(&source, &reconciler, config, shutdown_rx).await
}
