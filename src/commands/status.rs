//! Print a pool's stats as JSON.
//!
//! Starts a pool from the config, reports its state and shuts it down again.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use warden::{ContainerPool, PoolConfig};

/// Entry point: start a pool, print its stats, shut down
pub async fn run(config_path: &Path) -> Result<()> {
    let config = PoolConfig::load(config_path)?;
    let pool = ContainerPool::connect(&config)
        .await
        .context("Failed to start container pool")?;

    let stats = pool.stats();
    let rendered = serde_json::to_string_pretty(&stats);

    if let Err(e) = pool.shutdown(Duration::from_secs(5)).await {
        warn!(error = %e, "pool shutdown incomplete, run `warden cleanup`");
    }

    println!("{}", rendered?);
    Ok(())
}
