//! Component lifecycle supervision
//!
//! The controller owns every long-lived task and the observability stats
//! value. `start()` wires the streaming monitor into the tracker consumer,
//! launches the follower and the background analyzers, and `stop()` cancels
//! everything in reverse order with a bounded grace period.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analytics::price_monitor::PriceMonitor;
use crate::analytics::token_analyzer::TokenAnalyzer;
use crate::analytics::wallet_scorer::WalletScorer;
use crate::config::Config;
use crate::error::Result;
use crate::follower::Follower;
use crate::ledger::rpc::LedgerRpc;
use crate::monitor::{MonitorConfig, StreamingMonitor, Subscription};
use crate::parser::TxParser;
use crate::store::Store;
use crate::tracker::TokenTracker;
use crate::wallet::Wallet;

/// Grace period for tasks to exit after cancellation
const STOP_GRACE: Duration = Duration::from_secs(10);
/// Frame channel capacity; transport-level buffering absorbs bursts beyond it
const FRAME_CHANNEL_CAPACITY: usize = 1024;

/// The observability status document
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub trust_lines_today: u64,
    pub transactions_today: u64,
    pub last_transaction_summary: Option<String>,
    pub debug_mode: bool,
    pub test_mode: bool,
}

impl MonitorStats {
    fn new(debug_mode: bool, test_mode: bool) -> Self {
        Self {
            running: false,
            started_at: None,
            last_error: None,
            trust_lines_today: 0,
            transactions_today: 0,
            last_transaction_summary: None,
            debug_mode,
            test_mode,
        }
    }
}

/// Shared handle to the controller-owned stats. Writers go through the
/// narrow methods below; every mutation is broadcast to live subscribers.
#[derive(Clone)]
pub struct StatsHandle {
    inner: Arc<RwLock<MonitorStats>>,
    updates: broadcast::Sender<MonitorStats>,
}

impl StatsHandle {
    pub fn new(debug_mode: bool, test_mode: bool) -> Self {
        let (updates, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(RwLock::new(MonitorStats::new(debug_mode, test_mode))),
            updates,
        }
    }

    pub fn snapshot(&self) -> MonitorStats {
        self.inner.read().expect("stats lock poisoned").clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorStats> {
        self.updates.subscribe()
    }

    fn mutate(&self, apply: impl FnOnce(&mut MonitorStats)) {
        let updated = {
            let mut stats = self.inner.write().expect("stats lock poisoned");
            apply(&mut stats);
            stats.clone()
        };
        // No subscribers is fine
        let _ = self.updates.send(updated);
    }

    pub fn set_running(&self, running: bool) {
        self.mutate(|stats| {
            stats.running = running;
            if running {
                stats.started_at = Some(Utc::now());
                stats.last_error = None;
            }
        });
    }

    pub fn record_transaction(&self) {
        self.mutate(|stats| stats.transactions_today += 1);
    }

    pub fn record_trust_line(&self, summary: String) {
        self.mutate(|stats| {
            stats.trust_lines_today += 1;
            stats.last_transaction_summary = Some(summary);
        });
    }

    pub fn record_error(&self, error: &str) {
        self.mutate(|stats| stats.last_error = Some(error.to_string()));
    }
}

/// Which parts of the pipeline to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Market monitoring, analytics and the follower
    Full,
    /// Market monitoring and analytics only
    MarketOnly,
    /// Follower only
    FollowerOnly,
}

pub struct Controller {
    config: Config,
    store: Arc<dyn Store>,
    rpc: Arc<dyn LedgerRpc>,
    stats: StatsHandle,
    test_mode: bool,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Controller {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        rpc: Arc<dyn LedgerRpc>,
        stats: StatsHandle,
        test_mode: bool,
    ) -> Self {
        Self {
            config,
            store,
            rpc,
            stats,
            test_mode,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Launch the configured tasks
    pub async fn start(&mut self, mode: RunMode) -> Result<()> {
        info!("Starting controller ({:?})", mode);
        self.stats.set_running(true);

        if mode != RunMode::FollowerOnly {
            self.spawn_market_pipeline();
            self.spawn_analytics();
        }
        if mode != RunMode::MarketOnly {
            self.spawn_follower()?;
        }
        if self.config.web.enabled {
            let bind = self.config.web.bind.clone();
            let stats = self.stats.clone();
            let cancel = self.cancel.child_token();
            self.spawn("status-server", async move {
                if let Err(e) = crate::web::serve(bind, stats, cancel).await {
                    error!("Status server failed: {}", e);
                }
            });
        }
        Ok(())
    }

    fn spawn_market_pipeline(&mut self) {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let monitor = StreamingMonitor::new(
            MonitorConfig::from_network(&self.config.network),
            Subscription::AllTransactions,
            frame_tx,
            self.cancel.child_token(),
        );
        let stats = self.stats.clone();
        self.spawn("market-monitor", async move {
            if let Err(e) = monitor.run().await {
                stats.record_error(&e.to_string());
            }
        });

        let mut tracker = TokenTracker::new(&self.config.monitoring, self.store.clone());
        tracker.restore_snapshot();
        let parser = TxParser::new(self.config.monitoring.min_trade_volume);
        let stats = self.stats.clone();
        let cancel = self.cancel.child_token();
        self.spawn("token-tracker", async move {
            tracker.run(frame_rx, parser, stats, cancel).await;
        });
    }

    fn spawn_analytics(&mut self) {
        let analyzer = TokenAnalyzer::new(
            &self.config.analytics,
            self.store.clone(),
            self.rpc.clone(),
        );
        let cancel = self.cancel.child_token();
        self.spawn("token-analyzer", async move { analyzer.run(cancel).await });

        let price_monitor = PriceMonitor::new(
            &self.config.analytics,
            self.store.clone(),
            self.rpc.clone(),
        );
        let cancel = self.cancel.child_token();
        self.spawn("price-monitor", async move { price_monitor.run(cancel).await });

        let scorer = WalletScorer::new(&self.config.analytics, self.store.clone());
        let cancel = self.cancel.child_token();
        self.spawn("wallet-scorer", async move { scorer.run(cancel).await });
    }

    fn spawn_follower(&mut self) -> Result<()> {
        let wallet = Arc::new(Wallet::from_seed(&self.config.wallets.follower_seed)?);
        info!(
            "Follower wallet: {} (target {})",
            wallet.classic_address(),
            self.config.wallets.target_wallet
        );

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let monitor = StreamingMonitor::new(
            MonitorConfig::from_network(&self.config.network),
            Subscription::Account(self.config.wallets.target_wallet.clone()),
            frame_tx,
            self.cancel.child_token(),
        );
        let stats = self.stats.clone();
        self.spawn("follower-monitor", async move {
            if let Err(e) = monitor.run().await {
                stats.record_error(&e.to_string());
            }
        });

        let follower = Follower::new(
            self.config.wallets.target_wallet.clone(),
            wallet,
            self.config.trading.clone(),
            self.rpc.clone(),
            self.stats.clone(),
            self.test_mode,
        );
        let cancel = self.cancel.child_token();
        self.spawn("follower", async move { follower.run(frame_rx, cancel).await });
        Ok(())
    }

    fn spawn(&mut self, name: &'static str, task: impl std::future::Future<Output = ()> + Send + 'static) {
        debug!("Spawning {}", name);
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Cancel everything and wait, newest task first. Tasks still running
    /// after the grace period are aborted.
    pub async fn stop(&mut self) {
        info!("Stopping controller");
        self.cancel.cancel();

        while let Some((name, mut handle)) = self.tasks.pop() {
            match tokio::time::timeout(STOP_GRACE, &mut handle).await {
                Ok(_) => debug!("{} stopped", name),
                Err(_) => {
                    warn!("{} did not stop within {:?}, aborting", name, STOP_GRACE);
                    handle.abort();
                }
            }
        }

        self.stats.set_running(false);
        info!("Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let stats = StatsHandle::new(false, true);
        stats.set_running(true);
        stats.record_transaction();
        stats.record_transaction();
        stats.record_trust_line("TrustSet TST:rIss limit 1000".to_string());
        stats.record_error("tecNO_LINE");

        let snapshot = stats.snapshot();
        assert!(snapshot.running);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.test_mode);
        assert_eq!(snapshot.transactions_today, 2);
        assert_eq!(snapshot.trust_lines_today, 1);
        assert_eq!(
            snapshot.last_transaction_summary.as_deref(),
            Some("TrustSet TST:rIss limit 1000")
        );
        assert_eq!(snapshot.last_error.as_deref(), Some("tecNO_LINE"));
    }

    #[tokio::test]
    async fn test_stats_mutations_broadcast() {
        let stats = StatsHandle::new(false, false);
        let mut updates = stats.subscribe();

        stats.record_transaction();
        let update = updates.recv().await.unwrap();
        assert_eq!(update.transactions_today, 1);
    }

    #[test]
    fn test_starting_clears_last_error() {
        let stats = StatsHandle::new(false, false);
        stats.record_error("boom");
        stats.set_running(true);
        assert_eq!(stats.snapshot().last_error, None);
    }
}
