//! CLI binary to exercise the node overlay against a synthetic population.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use clap::Parser;
use satnet_overlay::{
    CheckInRequest, FindStorageNodesRequest, OverlayConfig, OverlayError, OverlayService,
    PlacementRuleSet,
};
use satnet_overlay_db::{
    DisqualificationReason, NodeCapacity, NodeId, NodeOperator, NodeVersion,
};
use satnet_overlay_db_memory::MemoryNodeStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid command line
    #[error("invalid arguments: {0}")]
    Args(String),

    /// Config file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON
    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    /// Overlay error
    #[error(transparent)]
    Overlay(#[from] OverlayError),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON overlay config file; flags below override it
    #[arg(long, env = "SATNET_OVERLAY_CONFIG")]
    config: Option<PathBuf>,

    /// Share of each selection drawn from new nodes
    #[arg(long, env = "SATNET_NEW_NODE_FRACTION")]
    new_node_fraction: Option<f64>,

    /// Minimum node software version
    #[arg(long, env = "SATNET_MINIMUM_VERSION")]
    minimum_version: Option<String>,

    /// Allow several selected nodes per network
    #[arg(long, env = "SATNET_ALLOW_SAME_NETWORK")]
    allow_same_network: bool,

    /// Maximum snapshot age in seconds
    #[arg(long, env = "SATNET_CACHE_STALENESS_SECS")]
    staleness_secs: Option<u64>,

    /// Background refresh interval in seconds
    #[arg(long, env = "SATNET_CACHE_REFRESH_SECS")]
    refresh_interval_secs: Option<u64>,

    /// Serve every selection from the store
    #[arg(long, env = "SATNET_DISABLE_CACHE")]
    disable_cache: bool,

    /// Nodes to seed
    #[arg(long, default_value_t = 500, env = "SATNET_NODES")]
    nodes: usize,

    /// Nodes sharing each network
    #[arg(long, default_value_t = 2, env = "SATNET_NODES_PER_NETWORK")]
    nodes_per_network: usize,

    /// Share of seeded nodes that are vetted
    #[arg(long, default_value_t = 0.8, env = "SATNET_VETTED_FRACTION")]
    vetted_fraction: f64,

    /// Seeded nodes that last checked in outside the online window
    #[arg(long, default_value_t = 20, env = "SATNET_OFFLINE_NODES")]
    offline: usize,

    /// Seeded nodes suspended for unknown audits
    #[arg(long, default_value_t = 10, env = "SATNET_SUSPENDED_NODES")]
    suspended: usize,

    /// Seeded nodes that are disqualified
    #[arg(long, default_value_t = 10, env = "SATNET_DISQUALIFIED_NODES")]
    disqualified: usize,

    /// Selection rounds to run
    #[arg(long, default_value_t = 10, env = "SATNET_ROUNDS")]
    rounds: usize,

    /// Nodes requested per round
    #[arg(long, default_value_t = 80, env = "SATNET_COUNT")]
    count: usize,

    /// Pause between rounds in milliseconds
    #[arg(long, default_value_t = 250, env = "SATNET_ROUND_INTERVAL_MS")]
    round_interval_ms: u64,
}

fn load_config(args: &Args) -> Result<OverlayConfig, Error> {
    let mut config = match &args.config {
        Some(path) => {
            info!("loading overlay config from {}", path.display());
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        }
        None => OverlayConfig::default(),
    };

    if let Some(fraction) = args.new_node_fraction {
        config.node.new_node_fraction = fraction;
    }
    if let Some(version) = &args.minimum_version {
        config.node.minimum_version.clone_from(version);
    }
    if args.allow_same_network {
        config.node.distinct_ip = false;
    }
    if let Some(secs) = args.staleness_secs {
        config.selection_cache.staleness = Duration::from_secs(secs);
    }
    if let Some(secs) = args.refresh_interval_secs {
        config.selection_cache.refresh_interval = Duration::from_secs(secs);
    }
    if args.disable_cache {
        config.selection_cache.disabled = true;
    }

    config.validate()?;
    Ok(config)
}

fn address(index: usize, per_network: usize) -> String {
    let network = index / per_network;
    let host = index % per_network + 1;
    format!(
        "10.{}.{}.{host}:28967",
        (network / 256) % 256,
        network % 256
    )
}

/// Checks in `args.nodes` nodes: a vetted share, then new ones, with the
/// offline, suspended and disqualified tails taken from the end.
async fn seed(
    service: &OverlayService<MemoryNodeStore>,
    args: &Args,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    if args.nodes_per_network == 0 {
        return Err(Error::Args("nodes per network must be positive".to_string()));
    }
    if args.offline + args.suspended + args.disqualified > args.nodes {
        return Err(Error::Args(
            "offline, suspended and disqualified nodes exceed the population".to_string(),
        ));
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let vetted = (args.nodes as f64 * args.vetted_fraction.clamp(0.0, 1.0)) as usize;
    let disqualified_from = args.nodes - args.disqualified;
    let suspended_from = disqualified_from - args.suspended;
    let offline_from = suspended_from - args.offline;
    let offline_window = service.config().node.online_window;
    let now = Utc::now();

    for index in 0..args.nodes {
        let id = NodeId::from_bytes(rand::random());
        let observed_at = if (offline_from..suspended_from).contains(&index) {
            TimeDelta::from_std(offline_window * 2)
                .ok()
                .and_then(|window| now.checked_sub_signed(window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        } else {
            now
        };

        let request = CheckInRequest {
            operator: Some(NodeOperator {
                wallet: format!("0x{index:040x}"),
                email: format!("operator{index}@example.test"),
            }),
            capacity: Some(NodeCapacity {
                free_disk: 2_000_000_000,
            }),
            version: Some(NodeVersion::new("v1.0.0")),
            ..CheckInRequest::new(id, address(index, args.nodes_per_network), true)
        };
        service.check_in(request, observed_at, shutdown).await?;

        if index < vetted {
            service.vet_node(id, shutdown).await?;
        }
        if (suspended_from..disqualified_from).contains(&index) {
            service.suspend_node_unknown_audit(id, now, shutdown).await?;
        }
        if index >= disqualified_from {
            service
                .disqualify_node(id, now, DisqualificationReason::AuditFailure, shutdown)
                .await?;
        }
    }

    info!(
        "seeded {} nodes ({} vetted, {} offline, {} suspended, {} disqualified)",
        args.nodes, vetted, args.offline, args.suspended, args.disqualified
    );
    Ok(())
}

async fn run_rounds(
    service: &OverlayService<MemoryNodeStore>,
    args: &Args,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    let request = FindStorageNodesRequest::with_count(args.count);

    for round in 1..=args.rounds {
        let started = Instant::now();
        match service
            .find_storage_nodes_for_upload(&request, shutdown)
            .await
        {
            Ok(selected) => {
                let networks: HashSet<&str> =
                    selected.iter().map(|n| n.last_net.as_str()).collect();
                info!(
                    "round {}: selected {} nodes on {} networks in {:?}",
                    round,
                    selected.len(),
                    networks.len(),
                    started.elapsed()
                );
            }
            Err(OverlayError::Cancelled) => break,
            Err(e @ OverlayError::NotEnoughNodes { .. }) => warn!("round {}: {}", round, e),
            Err(e) => return Err(e.into()),
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(args.round_interval_ms)) => {}
            () = shutdown.cancelled() => break,
        }
    }

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => warn!("signal handler failed, using ctrl-c: {}", e),
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("Received interrupt signal");
}

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let shutdown_token = CancellationToken::new();

    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down");
        signal_shutdown_token.cancel();
    });

    let store = Arc::new(MemoryNodeStore::new());
    let service = OverlayService::new(store, config, Arc::new(PlacementRuleSet::new()))?;

    match seed(&service, &args, &shutdown_token).await {
        Err(Error::Overlay(OverlayError::Cancelled)) => return Ok(()),
        result => result?,
    }
    service.start().await?;

    let result = run_rounds(&service, &args, &shutdown_token).await;
    service.shutdown().await?;
    result
}
