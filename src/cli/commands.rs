//! CLI command implementations

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::analytics::wallet_scorer::WalletScorer;
use crate::config::Config;
use crate::controller::{Controller, RunMode, StatsHandle};
use crate::ledger::rpc::{LedgerRpc, WsRpcClient};
use crate::store::{MemoryStore, Store};
use crate::wallet::Wallet;

/// Run the pipeline until interrupted
pub async fn start(config: &Config, mode: RunMode, debug: bool, test_mode: bool) -> Result<()> {
    if test_mode {
        info!("Running in test mode: no transactions will be submitted");
    }
    config.validate()?;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let rpc: Arc<dyn LedgerRpc> = Arc::new(WsRpcClient::new(
        config.network.websocket_url.clone(),
        Duration::from_secs(config.network.request_timeout_seconds),
    ));
    let stats = StatsHandle::new(debug, test_mode);

    let mut controller = Controller::new(config.clone(), store, rpc, stats, test_mode);
    controller.start(mode).await?;

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down gracefully...");
    controller.stop().await;
    Ok(())
}

/// One-shot wallet scoring pass
pub async fn score(config: &Config) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let scorer = WalletScorer::new(&config.analytics, store);
    let alpha = scorer.run_cycle().await?;

    if alpha.is_empty() {
        println!("No alpha wallets found");
    } else {
        println!("Top performing wallets:");
        for (rank, (wallet, score)) in alpha.iter().enumerate() {
            println!("  #{}: {} (score: {:.2})", rank + 1, wallet, score);
        }
    }
    Ok(())
}

/// Generate a fresh follower wallet
pub fn generate_wallet() -> Result<()> {
    let (seed, wallet) = Wallet::generate()?;
    println!("Classic address: {}", wallet.classic_address());
    println!("Seed:            {}", seed);
    println!();
    println!("Store the seed under wallets.follower_seed in config.local.yaml.");
    println!("Anyone with the seed controls the account; keep it out of version control.");
    Ok(())
}

/// Print the effective configuration with secrets masked
pub fn show_config(config: &Config) -> Result<()> {
    println!("network:");
    println!("  websocket_url: {}", config.network.websocket_url);
    println!("  max_reconnect_attempts: {}", config.network.max_reconnect_attempts);
    println!("  reconnect_delay_seconds: {}", config.network.reconnect_delay_seconds);
    println!("wallets:");
    println!("  target_wallet: {}", mask_or_unset(&config.wallets.target_wallet, false));
    println!("  follower_seed: {}", mask_or_unset(&config.wallets.follower_seed, true));
    println!("trading:");
    println!("  min_trust_line_amount: {}", config.trading.min_trust_line_amount);
    println!("  max_trust_line_amount: {}", config.trading.max_trust_line_amount);
    println!("  initial_purchase_amount: {}", config.trading.initial_purchase_amount);
    println!("  auto_purchase_on_trust: {}", config.trading.auto_purchase_on_trust);
    println!("monitoring:");
    println!("  min_trade_volume: {}", config.monitoring.min_trade_volume);
    println!("  min_trust_lines: {}", config.monitoring.min_trust_lines);
    println!("  save_interval_minutes: {}", config.monitoring.save_interval_minutes);
    println!("  data_file: {}", config.monitoring.data_file);
    println!("web:");
    println!("  enabled: {}", config.web.enabled);
    println!("  bind: {}", config.web.bind);
    Ok(())
}

fn mask_or_unset(value: &str, secret: bool) -> String {
    if value.is_empty() {
        "(unset)".to_string()
    } else if secret {
        format!("{}{}", &value[..value.len().min(4)], "****")
    } else {
        value.to_string()
    }
}

/// Report a command failure and pick the exit code
pub fn exit_code_for(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("Command failed: {:#}", e);
            1
        }
    }
}
