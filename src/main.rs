use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "warden")]
#[command(
    author,
    version,
    about = "Warden - sandboxed container pool for subagent tasks"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Pool configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "WARDEN_CONFIG",
        default_value = warden::config::CONFIG_FILE
    )]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the resolved settings
    Check,

    /// Start a pool, run one task and shut the pool down
    Run {
        /// Prompt handed to the agent
        prompt: String,

        /// Session used to scope secret lookups
        #[arg(short, long, default_value = "cli")]
        session: String,

        /// Extra task environment (KEY=VALUE, `$NAME` values are secrets)
        #[arg(short, long = "env", value_parser = commands::run::parse_env_pair)]
        env: Vec<(String, String)>,

        /// Task deadline (e.g. "90s", "5m")
        #[arg(short, long, value_parser = warden::config::parse_duration)]
        timeout: Option<Duration>,

        /// Grace period for running tasks at shutdown
        #[arg(long, default_value = "10s", value_parser = warden::config::parse_duration)]
        grace: Duration,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start a pool and print its state as JSON
    Status,

    /// Remove containers left behind by a previous run
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for command output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("warden=debug")
        } else {
            EnvFilter::new("warden=info")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    match cli.command {
        Commands::Check => {
            commands::check::run(&cli.config)?;
        }
        Commands::Run {
            prompt,
            session,
            env,
            timeout,
            grace,
            json,
        } => {
            let args = commands::run::RunArgs {
                prompt,
                session,
                env,
                timeout,
                grace,
                json,
            };
            let code = commands::run::run(&cli.config, args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status => {
            commands::status::run(&cli.config).await?;
        }
        Commands::Cleanup => {
            commands::cleanup::run(&cli.config).await?;
        }
    }

    Ok(())
}
