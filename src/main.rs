use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use lore::config::LoreConfig;
use lore::{cli, server};

#[derive(Parser)]
#[command(name = "lore", version, about = "Self-curating knowledge MCP server")]
struct Cli {
    /// Config file (defaults to ~/.lore/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server with background consolidation
    Serve {
        /// Override the configured transport (stdio or http)
        #[arg(long)]
        transport: Option<String>,
    },
    /// Run one consolidation pass and exit
    Consolidate,
    /// Retrieve knowledge relevant to a query
    Activate {
        query: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, allow_hyphen_values = true)]
        threshold: Option<f64>,
    },
    /// Show knowledge store statistics
    Stats,
    /// Delete all knowledge and rewind the cursor
    Reset {
        /// Skip the interactive confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LoreConfig::load_from(path)?,
        None => LoreConfig::load()?,
    };
    if let Command::Serve {
        transport: Some(transport),
    } = &cli.command
    {
        config.server.transport = transport.clone();
    }

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(2);
    }

    match cli.command {
        Command::Serve { .. } => server::serve(config).await?,
        Command::Consolidate => cli::consolidate(config).await?,
        Command::Activate {
            query,
            limit,
            threshold,
        } => cli::activate(config, &query, limit, threshold).await?,
        Command::Stats => cli::stats(&config)?,
        Command::Reset { yes } => cli::reset(&config, yes)?,
    }

    Ok(())
}
