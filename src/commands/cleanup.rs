//! Remove containers left behind by a previous run.
//!
//! Every pool container carries the `warden.pool=<name>` label; anything
//! still labelled when no pool is running is an orphan.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;

use warden::{remove_orphans, DockerRuntime, PoolConfig};

/// Format the cleanup results as a displayable string
pub fn format_results(pool: &str, removed: &[String]) -> String {
    let mut out = String::new();
    if removed.is_empty() {
        writeln!(
            &mut out,
            "\n{} No containers found for pool {}.",
            "ℹ".blue(),
            pool.cyan()
        )
        .unwrap();
    } else {
        writeln!(
            &mut out,
            "\n{} Removed containers of pool {}:",
            "✓".green(),
            pool.cyan()
        )
        .unwrap();
        for id in removed {
            writeln!(&mut out, "  {} {}", "✗".red(), id.dimmed()).unwrap();
        }
    }
    out
}

/// Entry point: runs cleanup against the local Docker daemon
pub async fn run(config_path: &Path) -> Result<()> {
    let config = PoolConfig::load(config_path)?;
    let settings = config.resolve()?;
    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;

    let removed = remove_orphans(&runtime, &settings.name)
        .await
        .context("Failed to list pool containers")?;

    print!("{}", format_results(&settings.name, &removed));
    Ok(())
}
