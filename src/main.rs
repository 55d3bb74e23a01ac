use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxyrank::config::Config;

mod commands;

#[derive(Parser)]
#[command(
    name = "proxyrank",
    version,
    about = "Keep proxy server groups deduplicated and ranked by measured latency",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); defaults to the configured format
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// TOML configuration file; environment variables are used otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List groups with their enabled flag and server counts
    Groups,

    /// Create a group
    AddGroup {
        /// Display name
        #[arg(short, long)]
        name: String,

        /// Subscription URL
        #[arg(short, long)]
        url: Option<String>,

        /// Create the group disabled
        #[arg(long, default_value = "false")]
        disabled: bool,
    },

    /// List servers in stored order with their latency
    List {
        /// Only show servers of this group
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Update, deduplicate, probe and rank one group
    Run {
        /// Group id
        #[arg(short, long)]
        group: String,
    },

    /// Update, deduplicate, probe and rank every enabled group
    RunAll,

    /// Select a server manually
    Select {
        /// Server id
        server_id: String,
    },

    /// Enable exactly the given groups
    Enable {
        /// Group ids
        group_ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    // Initialize tracing/logging
    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    tracing::info!(
        database = %config.storage.sqlite_path.display(),
        max_concurrency = config.prober.max_concurrency,
        "proxyrank starting"
    );

    let repo = commands::open_repository(&config)?;

    match cli.command {
        Commands::Groups => {
            commands::list_groups(repo.as_ref()).await?;
        }

        Commands::AddGroup {
            name,
            url,
            disabled,
        } => {
            tracing::info!(name = %name, url = ?url, disabled = %disabled, "Starting add-group command");
            commands::add_group(repo.as_ref(), name, url, disabled).await?;
        }

        Commands::List { group } => {
            commands::list_servers(repo.as_ref(), group).await?;
        }

        Commands::Run { group } => {
            tracing::info!(group = %group, "Starting run command");
            let controller = commands::build_controller(&config, repo)?;
            commands::run(controller, commands::RunTarget::Group(group)).await?;
        }

        Commands::RunAll => {
            tracing::info!("Starting run-all command");
            let controller = commands::build_controller(&config, repo)?;
            commands::run(controller, commands::RunTarget::AllEnabled).await?;
        }

        Commands::Select { server_id } => {
            let controller = commands::build_controller(&config, repo)?;
            commands::select_server(&controller, server_id).await?;
        }

        Commands::Enable { group_ids } => {
            tracing::info!(groups = ?group_ids, "Starting enable command");
            let controller = commands::build_controller(&config, repo)?;
            commands::enable_groups(&controller, group_ids).await?;
        }
    }

    tracing::info!("proxyrank completed successfully");
    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("proxyrank=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("proxyrank={level},warn"))?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
