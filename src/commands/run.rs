//! Run a single task through a short-lived pool.

use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use warden::{ContainerPool, PoolConfig, Task, TaskResult};

/// Arguments of `warden run`.
pub struct RunArgs {
    pub prompt: String,
    pub session: String,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub grace: Duration,
    pub json: bool,
}

/// Parse a `KEY=VALUE` pair.
pub fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Build the task submitted for `args`.
pub fn build_task(args: &RunArgs, cancel: CancellationToken) -> Task {
    let id = format!("cli-{}", Uuid::new_v4().simple());
    let mut task = Task::new(id, args.prompt.clone())
        .with_session(args.session.clone())
        .with_cancellation(cancel);
    for (key, value) in &args.env {
        task = task.with_env(key.clone(), value.clone());
    }
    if let Some(timeout) = args.timeout {
        task = task.with_timeout(timeout);
    }
    task
}

/// Map a task exit code onto a process exit code.
pub fn exit_code(result: &TaskResult) -> i32 {
    i32::try_from(result.exit_code).unwrap_or(1)
}

/// Render a task result for the terminal.
pub fn format_result(result: &TaskResult) -> String {
    let mut out = String::new();
    if !result.stdout.is_empty() {
        write!(&mut out, "{}", result.stdout).unwrap();
        if !result.stdout.ends_with('\n') {
            out.push('\n');
        }
    }
    if !result.stderr.is_empty() {
        writeln!(&mut out, "{}", result.stderr.trim_end().dimmed()).unwrap();
    }

    let status = if result.succeeded() {
        format!("{} exit 0", "✓".green())
    } else {
        format!("{} exit {}", "✗".red(), result.exit_code)
    };
    writeln!(
        &mut out,
        "\n{} in {:.1}s ({})",
        status,
        result.duration.as_secs_f64(),
        result.container_id.dimmed()
    )
    .unwrap();
    out
}

/// Entry point: start a pool, submit, print, shut down. Returns the exit code.
pub async fn run(config_path: &Path, args: RunArgs) -> Result<i32> {
    let config = PoolConfig::load(config_path)?;
    let pool = ContainerPool::connect(&config)
        .await
        .context("Failed to start container pool")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling task");
            on_interrupt.cancel();
        }
    });

    let outcome = pool.submit(build_task(&args, cancel)).await;

    if let Err(e) = pool.shutdown(args.grace).await {
        warn!(error = %e, "pool shutdown incomplete, run `warden cleanup`");
    }

    let result = outcome.context("Task failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", format_result(&result));
    }
    Ok(exit_code(&result))
}
