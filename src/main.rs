//! XRPL token monitor and trust-line copy-trader
//!
//! # WARNING
//! - The follower submits transactions signed with a real seed. Only fund
//!   the controlled account with amounts you can afford to lose.
//! - Mirroring trust lines on a memecoin stream means most tracked tokens
//!   go to zero. Test mode exists for a reason.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use xrpl_copytrader::cli::commands;
use xrpl_copytrader::config::{Config, LoggingConfig};
use xrpl_copytrader::controller::RunMode;

/// XRPL token monitor and copy-trader
#[derive(Parser)]
#[command(name = "xrpl-copytrader")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the local config overlay
    #[arg(short, long, default_value = "config.local.yaml")]
    config: String,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: market monitor, analytics and follower
    Start {
        /// Test mode: simulate submissions, never write to the ledger
        #[arg(short, long)]
        test: bool,
    },

    /// Market monitoring and analytics only (no follower)
    Market,

    /// Follower only: mirror the target wallet's trust lines
    Follow {
        /// Test mode: simulate submissions, never write to the ledger
        #[arg(short, long)]
        test: bool,
    },

    /// Run one wallet-scoring pass and print the alpha wallets
    Score,

    /// Generate a fresh follower wallet (seed + address)
    GenerateWallet,

    /// Show the effective configuration (secrets masked)
    Config,
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&LoggingConfig::peek(&cli.config), cli.debug);

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let result: Result<()> = match cli.command {
        Commands::Start { test } => {
            commands::start(&config, RunMode::Full, cli.debug, test).await
        }
        Commands::Market => {
            commands::start(&config, RunMode::MarketOnly, cli.debug, false).await
        }
        Commands::Follow { test } => {
            commands::start(&config, RunMode::FollowerOnly, cli.debug, test).await
        }
        Commands::Score => commands::score(&config).await,
        Commands::GenerateWallet => commands::generate_wallet(),
        Commands::Config => commands::show_config(&config),
    };

    std::process::exit(commands::exit_code_for(&result));
}

fn init_tracing(logging: &LoggingConfig, debug: bool) {
    let default_level = if debug { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let file = logging
        .filename
        .as_deref()
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        })
        .map(Mutex::new);

    match (file, logging.format.as_str()) {
        (Some(file), "json") => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stdout.and(file))
            .json()
            .init(),
        (Some(file), _) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stdout.and(file))
            .init(),
        (None, "json") => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        (None, _) => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
