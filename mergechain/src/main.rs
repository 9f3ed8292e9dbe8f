use anyhow::Result;
use clap::{Parser, Subcommand};

use mergechain::consensus::Network;
use mergechain::{commands, config, telemetry};

#[derive(Parser)]
#[command(name = "mergechain")]
#[command(about = "A merge-mined proof-of-work full node", long_about = None)]
struct Cli {
    /// Network preset used by `init` and for the default config path
    #[arg(long, global = true, value_enum, default_value_t = Network::Testnet)]
    network: Network,

    /// Path to config file (default: ~/.mergechain/{network}/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a node config
    Init {
        /// Address receiving mining rewards (random if omitted)
        #[arg(long)]
        payout: Option<String>,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Open the ledger and run the node, optionally mining
    Run {
        /// Enable mining
        #[arg(long)]
        mine: bool,
    },

    /// Show chain status
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init_tracing(cli.verbose)?;

    let config_path = match cli.config {
        Some(path) => std::path::PathBuf::from(path),
        None => config::config_path(cli.network)?,
    };

    match cli.command {
        Commands::Init { payout, force } => commands::init::run(&config_path, cli.network, payout, force),
        Commands::Run { mine } => commands::run::run(&config_path, mine),
        Commands::Status => commands::status::run(&config_path),
    }
}
