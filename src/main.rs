use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chain::{DisabledSnapshotProcessor, MemoryBlockStore, ReputationTable};
use clap::Parser;
use containers::{Block, BlockDifficulty, BlockHeader};
use metrics::Metrics;
use metrics::server::serve_metrics;
use networking::sync::{PeerManager, SyncConfig, SyncEvent, SyncService};
use networking::types::{OutboundRequestSource, OutboundSyncRequest};
use tokio::{sync::mpsc, task};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
struct Args {
    /// Sync configuration (YAML). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "127.0.0.1")]
    metrics_address: IpAddr,

    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,

    #[arg(long)]
    disable_metrics: bool,

    #[arg(long, default_value_t = 1)]
    genesis_difficulty: u64,

    /// Hex-encoded extra data of the genesis header.
    #[arg(long)]
    genesis_extra_data: Option<String>,
}

fn genesis_block(args: &Args) -> Result<Block> {
    let mut header = BlockHeader::genesis(BlockDifficulty::from(args.genesis_difficulty));
    if let Some(extra) = &args.genesis_extra_data {
        header.extra_data = hex::decode(extra.trim_start_matches("0x"))
            .context("invalid genesis extra data")?;
    }
    Ok(Block::empty(header))
}

/// Drains outbound requests while no transport is attached.
async fn drain_requests(mut requests: impl OutboundRequestSource) {
    while let Some(request) = requests.recv().await {
        debug!(%request, "No transport attached, dropping sync request");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SyncConfig::load_from_file(path)?,
        None => SyncConfig::default(),
    };
    let genesis = genesis_block(&args)?;
    info!(genesis = %genesis.hash(), "Loaded genesis");

    let store = Arc::new(MemoryBlockStore::new(genesis));
    let reputation = Arc::new(ReputationTable::new());
    let peer_manager = PeerManager::new(&config, reputation);

    let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel::<OutboundSyncRequest>();
    let (event_sender, event_receiver) = mpsc::unbounded_channel::<SyncEvent>();

    let mut service = SyncService::new(
        config,
        peer_manager,
        store,
        Arc::new(DisabledSnapshotProcessor),
        outbound_sender,
    );

    if !args.disable_metrics {
        let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
        service = service.with_metrics(metrics.clone());
        let addr = SocketAddr::new(args.metrics_address, args.metrics_port);
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        task::spawn(async move {
            if let Err(err) = serve_metrics(addr, metrics, shutdown).await {
                warn!(%err, "Metrics exporter exited");
            }
        });
    }

    let transport_handle = task::spawn(drain_requests(outbound_receiver));
    let sync_handle = task::spawn(service.run(event_receiver));

    tokio::select! {
        _ = sync_handle => info!("Sync service finished"),
        _ = transport_handle => info!("Transport finished"),
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
    }

    // The sync loop runs until the last event sender is gone.
    drop(event_sender);

    Ok(())
}
