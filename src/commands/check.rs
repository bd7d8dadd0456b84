//! Validate `warden.toml` and show what the pool would run with.

use std::fmt::Write;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use warden::config::{format_duration, PoolConfig, PoolSettings};

/// Render resolved settings as a human-readable summary.
pub fn format_settings(source: &Path, exists: bool, settings: &PoolSettings) -> String {
    let mut out = String::new();
    let origin = if exists {
        source.display().to_string()
    } else {
        format!("{} (not found, using defaults)", source.display())
    };

    writeln!(&mut out, "\n{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(&mut out, "{}", "   Warden Pool Configuration".yellow().bold()).unwrap();
    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(&mut out, "  Source:       {}", origin.dimmed()).unwrap();
    writeln!(&mut out, "  Pool:         {}", settings.name.cyan()).unwrap();
    writeln!(
        &mut out,
        "  Image:        {} (pull: {})",
        settings.image.cyan(),
        settings.pull_policy
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Environments: {} x {} tasks",
        settings.pool_size.to_string().cyan(),
        settings.max_pending.to_string().cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Command:      {}",
        shell_words::join(&settings.agent_command).cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Resources:    {} MiB, {} cpus, {} pids",
        settings.memory_bytes / (1024 * 1024),
        settings.cpus,
        settings.pids_limit
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Security:     cap_drop={} read_only={} opts={}",
        settings.cap_drop.join(","),
        settings.read_only_rootfs,
        settings.security_opt.join(",")
    )
    .unwrap();
    writeln!(&mut out, "  Network:      {}", settings.network).unwrap();
    writeln!(
        &mut out,
        "  Admission:    {}/min, breaker {} failures / {}",
        settings.rate_limit_per_minute,
        settings.failure_threshold,
        format_duration(settings.open_duration)
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Timeouts:     task {}, health every {}",
        format_duration(settings.task_timeout),
        format_duration(settings.health_interval)
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Caches:       inspect {}, secrets {}",
        format_duration(settings.inspect_ttl),
        format_duration(settings.secret_ttl)
    )
    .unwrap();
    if let Some(key) = &settings.api_key_env {
        writeln!(&mut out, "  API key:      ${}", key.cyan()).unwrap();
    }
    for bind in &settings.binds {
        writeln!(&mut out, "  Mount:        {}", bind.dimmed()).unwrap();
    }
    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(&mut out, "{} Configuration is valid.", "✓".green()).unwrap();
    out
}

/// Entry point: load, resolve and print.
pub fn run(config_path: &Path) -> Result<()> {
    let config = PoolConfig::load(config_path)?;
    let settings = config
        .resolve()
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

    print!(
        "{}",
        format_settings(config_path, config_path.exists(), &settings)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_format_settings_shows_defaults() {
        let settings = PoolConfig::default().resolve().unwrap();
        let output = format_settings(&PathBuf::from("warden.toml"), false, &settings);

        assert!(output.contains("using defaults"));
        assert!(output.contains("warden-agent:latest"));
        assert!(output.contains("512 MiB"));
        assert!(output.contains("60/min"));
        assert!(output.contains("task 10m"));
        assert!(output.contains("Configuration is valid"));
    }

    #[test]
    fn test_format_settings_lists_mounts_and_api_key() {
        let config: PoolConfig = toml::from_str(
            r#"
api_key_env = "ANTHROPIC_API_KEY"

[mounts.prompts]
host = "/srv/prompts"
container = "/prompts"
"#,
        )
        .unwrap();
        let settings = config.resolve().unwrap();
        let output = format_settings(&PathBuf::from("warden.toml"), true, &settings);

        assert!(!output.contains("using defaults"));
        assert!(output.contains("ANTHROPIC_API_KEY"));
        assert!(output.contains("/srv/prompts:/prompts:ro"));
    }
}
