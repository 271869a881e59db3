// Cache Coordinator daemon - routing and failover for the shard fleet

use cache_coordinator::{CacheCoordinator, Config};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;
    let shards = config.shard_count();
    let virtual_nodes = config.cluster.virtual_nodes;

    // Build the coordinator and start background health monitoring
    let coordinator = CacheCoordinator::new(config)?;
    coordinator.start().await;

    println!("🚀 Cache coordinator running");
    println!("  shards:        {}", shards);
    println!("  virtual nodes: {} per shard", virtual_nodes);
    info!("Coordinator ready, waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    coordinator.shutdown().await;

    Ok(())
}
