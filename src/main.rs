use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tokenhive::clock::{Clock, SystemClock};
use tokenhive::config::TokenhiveConfig;
use tokenhive::http::{admit, rate_limit_key};
use tokenhive::mesh::{Cluster, ClusterRouter, NodeClient, NodeServer, Replicator};
use tokenhive::ratelimit::{BucketRouter, EvictionCoordinator, RateLimiterService};
use tokenhive::store::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "tokenhive", version, about = "Distributed token-bucket rate limiter")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a node: request endpoint, bucket store, eviction and, if
    /// configured, cluster routing and gossip replication
    Serve {
        /// Path to the configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Send requests through a limiter and print each HTTP verdict
    Admit {
        /// Path to the configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Request endpoint of a running node; without it a local limiter is used
        #[arg(long)]
        node: Option<SocketAddr>,

        /// Client address used to derive the rate limit key
        #[arg(long, default_value = "127.0.0.1")]
        client: String,

        /// Protected operation name
        #[arg(long)]
        operation: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 6)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve { config } => serve(load_config(config)?).await,
        Command::Admit {
            config,
            node,
            client,
            operation,
            count,
        } => match node {
            Some(addr) => admit_remote(addr, &client, &operation, count).await,
            None => admit_local(load_config(config)?, &client, &operation, count).await,
        },
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<TokenhiveConfig> {
    let config = match path {
        Some(path) => TokenhiveConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TokenhiveConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn serve(config: TokenhiveConfig) -> anyhow::Result<()> {
    info!("Starting Tokenhive node");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(node_id = %config.node.node_id, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut store = MemoryStore::new(&config.store, clock.clone());
    if config.cluster.is_some() {
        store = store.with_change_tracking();
    }
    let store = Arc::new(store);
    config.store.log_summary();

    let cluster = match &config.cluster {
        Some(settings) => Some(Arc::new(
            Cluster::start(settings.to_cluster_config(&config.node)).await?,
        )),
        None => {
            info!("No cluster configured, running as a single node");
            None
        }
    };
    let router = cluster
        .as_ref()
        .map(|cluster| Arc::new(ClusterRouter::new(cluster.clone())) as Arc<dyn BucketRouter>);

    let service = RateLimiterService::from_config(&config, store.clone(), clock.clone(), router)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind(config.node.listen_addr)
        .await
        .with_context(|| format!("binding request endpoint {}", config.node.listen_addr))?;
    let server = Arc::new(NodeServer::new(service.clone(), cluster.clone()));
    let server_task = server.spawn(listener, shutdown_rx.clone());

    let coordinator = Arc::new(EvictionCoordinator::new(
        store.clone(),
        clock,
        &config.store,
        service.rules().longest_time_to_full(),
        config.rate_limiting.eviction_jitter(),
    ));
    let eviction_task = coordinator.spawn(
        config.rate_limiting.eviction_interval(),
        shutdown_rx.clone(),
    );

    let mut replication = None;
    if let (Some(settings), Some(cluster)) = (&config.cluster, cluster) {
        let replicator = Arc::new(Replicator::new(cluster.clone(), store.clone(), &config.store));
        let task = replicator.spawn(settings.sync_interval(), shutdown_rx.clone());
        replication = Some((cluster, task));
    }

    info!("Tokenhive node ready");
    shutdown_signal().await?;

    let _ = shutdown_tx.send(true);
    if let Err(err) = eviction_task.await {
        warn!(error = %err, "Eviction task ended abnormally");
    }
    if let Err(err) = server_task.await {
        warn!(error = %err, "Request endpoint ended abnormally");
    }
    drop(service);

    if let Some((cluster, task)) = replication {
        if let Err(err) = task.await {
            warn!(error = %err, "Replication task ended abnormally");
        }
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster still in use, skipping graceful leave"),
        }
    }

    info!("Tokenhive node stopped");
    Ok(())
}

async fn admit_local(
    config: TokenhiveConfig,
    client: &str,
    operation: &str,
    count: u32,
) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(&config.store, clock.clone()));
    let service = RateLimiterService::from_config(&config, store, clock, None)?;
    let facade = service.facade(operation);
    let key = rate_limit_key(client, operation);

    for _ in 0..count {
        let reply = admit(&facade, &key).await;
        println!("{}", serde_json::to_string(&reply)?);
    }
    Ok(())
}

async fn admit_remote(
    addr: SocketAddr,
    client: &str,
    operation: &str,
    count: u32,
) -> anyhow::Result<()> {
    let node = NodeClient::new(addr);
    for _ in 0..count {
        let reply = node
            .admit(client, operation)
            .await
            .with_context(|| format!("asking {} for admission", addr))?;
        println!("{}", serde_json::to_string(&reply)?);
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}
