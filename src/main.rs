// VantageDB - Distributed Semantic Document Search Cluster
//
// Main entry point for a VantageDB node. The binary loads the node
// configuration, assembles the placement and coordination subsystems,
// bootstraps into (or creates) a cluster, and runs until a shutdown
// signal arrives.

use anyhow::Result;
use tracing::{error, info};
use vantagedb::VantageDb;
use vantagedb_core::config::VantageConfig;

/// Node lifecycle: configure logging, load config, assemble subsystems,
/// start, wait for ctrl-c, shut down cleanly.
#[tokio::main]
async fn main() -> Result<()> {
    // Structured logging with environment-based filtering
    // (RUST_LOG=debug,vantagedb=trace)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vantagedb=info".parse()?),
        )
        .json()
        .init();

    info!("starting VantageDB node");

    let config = VantageConfig::load().await?;
    let db = match VantageDb::new(config) {
        Ok(db) => db,
        Err(e) => {
            error!("failed to assemble VantageDB: {}", e);
            return Err(e);
        }
    };

    if let Err(e) = db.enable_persistence() {
        error!("failed to open snapshot store: {}", e);
        return Err(e);
    }

    let status = db.start().await?;
    info!(
        "node {} running: mode {}, fault tolerance {}",
        status.node_id, status.operation_mode, status.capabilities.fault_tolerance_level
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    db.stop().await?;
    info!("VantageDB node stopped cleanly");
    Ok(())
}
