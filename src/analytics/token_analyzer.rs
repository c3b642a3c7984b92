//! Token age analysis
//!
//! Periodic worker over tokens that are pending or stale. Determines the
//! first-sighting age from the discovery transaction's ledger timestamp,
//! rules out tokens past the age window (terminal), and inspects the
//! issuer's recent transactions for creation time, creator, freeze state and
//! holder count. When the order book has liquidity, a price sample is taken
//! along the way.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analytics::rate_limit::RateLimiter;
use crate::analytics::{fetch_best_price, record_price_observation};
use crate::config::AnalyticsConfig;
use crate::error::Error;
use crate::ledger::rpc::LedgerRpc;
use crate::store::{PendingToken, Store, TokenStatePatch, TokenStatus};

/// Tokens older than their last update by this much get re-analyzed
const REFRESH_AFTER_HOURS: i64 = 24;

pub struct TokenAnalyzer {
    store: Arc<dyn Store>,
    rpc: Arc<dyn LedgerRpc>,
    limiter: RateLimiter,
    analysis_interval: Duration,
    batch_size: usize,
    max_token_age: ChronoDuration,
}

impl TokenAnalyzer {
    pub fn new(config: &AnalyticsConfig, store: Arc<dyn Store>, rpc: Arc<dyn LedgerRpc>) -> Self {
        Self {
            store,
            rpc,
            limiter: RateLimiter::default(),
            analysis_interval: Duration::from_secs(config.analysis_interval_seconds),
            batch_size: config.batch_size.max(1),
            max_token_age: ChronoDuration::hours(config.max_token_age_hours),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Starting token analyzer");
        loop {
            self.run_cycle().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.analysis_interval) => {}
            }
        }
        info!("Token analyzer stopped");
    }

    /// One analysis pass over everything due
    pub async fn run_cycle(&self) {
        let cutoff = Utc::now() - ChronoDuration::hours(REFRESH_AFTER_HOURS);
        let tokens = match self.store.get_unanalyzed_tokens(cutoff).await {
            Ok(tokens) => tokens,
            Err(e) => {
                error!("Failed to fetch unanalyzed tokens: {}", e);
                return;
            }
        };
        if tokens.is_empty() {
            debug!("No tokens due for analysis");
            return;
        }
        info!("Analyzing {} tokens", tokens.len());

        for batch in tokens.chunks(self.batch_size) {
            futures::future::join_all(batch.iter().map(|pending| self.analyze_token(pending)))
                .await;
        }
    }

    async fn analyze_token(&self, pending: &PendingToken) {
        let token = &pending.token;
        let Some(first_seen_tx) = pending.first_seen_tx.as_deref() else {
            warn!("No discovery transaction for {}, cannot determine age", token);
            return;
        };

        let Some(age) = self.token_age(first_seen_tx).await else {
            debug!("Could not determine age for {}", token);
            return;
        };
        debug!(
            "Token {} is {}h old (limit {}h)",
            token,
            age.num_hours(),
            self.max_token_age.num_hours()
        );

        if age > self.max_token_age {
            info!("Token {} exceeded the age window, marking too old", token);
            if let Err(e) = self.store.mark_token(token, TokenStatus::TooOld).await {
                error!("Failed to mark {} too old: {}", token, e);
            }
            return;
        }

        self.limiter.acquire().await;
        let transactions = match self.rpc.account_tx(&token.issuer, 20).await {
            Ok(transactions) => {
                self.limiter.on_success();
                transactions
            }
            Err(Error::RateLimited) => {
                warn!("Rate limited while fetching issuer history for {}", token);
                self.limiter.on_throttle();
                return;
            }
            Err(e) => {
                error!("Failed to fetch issuer history for {}: {}", token, e);
                return;
            }
        };

        let mut patch = TokenStatePatch::default();
        let mut holders = 0u64;
        for tx in &transactions {
            if let Some(close_time) = tx.close_time() {
                let earlier = patch
                    .creation_date
                    .map_or(true, |known| close_time < known);
                if earlier {
                    patch.creation_date = Some(close_time);
                    patch.creator = tx.account.clone();
                }
            }
            if tx.transaction_type.as_deref() == Some("TrustSet") {
                holders += 1;
            }
            if tx.has_global_freeze() {
                patch.is_frozen = Some(true);
            }
        }
        patch.unique_holders = Some(holders);

        if let Err(e) = self.store.upsert_token_state(token, patch).await {
            error!("Failed to store analysis for {}: {}", token, e);
            return;
        }
        if let Err(e) = self.store.mark_token(token, TokenStatus::Active).await {
            error!("Failed to activate {}: {}", token, e);
            return;
        }
        debug!("Analysis completed for {}: {} holders", token, holders);

        self.sample_price(token).await;
    }

    /// Age derived from the discovery transaction's ledger timestamp
    async fn token_age(&self, tx_hash: &str) -> Option<ChronoDuration> {
        self.limiter.acquire().await;
        match self.rpc.tx(tx_hash).await {
            Ok(lookup) => {
                self.limiter.on_success();
                lookup.close_time().map(|closed| Utc::now() - closed)
            }
            Err(Error::RateLimited) => {
                warn!("Rate limited while fetching {}", tx_hash);
                self.limiter.on_throttle();
                None
            }
            Err(e) => {
                debug!("Failed to fetch {}: {}", tx_hash, e);
                None
            }
        }
    }

    async fn sample_price(&self, token: &crate::parser::TokenId) {
        self.limiter.acquire().await;
        match fetch_best_price(self.rpc.as_ref(), token).await {
            Ok(Some(price)) => {
                self.limiter.on_success();
                if let Err(e) = record_price_observation(&self.store, token, price, Utc::now()).await
                {
                    error!("Failed to record price for {}: {}", token, e);
                }
            }
            Ok(None) => {
                self.limiter.on_success();
                debug!("No order book for {}", token);
            }
            Err(Error::RateLimited) => {
                self.limiter.on_throttle();
            }
            Err(e) => debug!("Price lookup failed for {}: {}", token, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::{
        AccountInfo, BookOffer, LedgerTxSummary, SubmitResult, TxLookup, FLAG_GLOBAL_FREEZE,
        LEDGER_EPOCH_OFFSET,
    };
    use crate::parser::TokenId;
    use crate::store::MemoryStore;
    use crate::error::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    struct FakeRpc {
        tx_date: Option<i64>,
        issuer_txs: Vec<LedgerTxSummary>,
    }

    #[async_trait]
    impl LedgerRpc for FakeRpc {
        async fn tx(&self, _: &str) -> Result<TxLookup> {
            Ok(TxLookup {
                date: self.tx_date,
                validated: true,
                ..Default::default()
            })
        }
        async fn account_tx(&self, _: &str, _: u32) -> Result<Vec<LedgerTxSummary>> {
            Ok(self.issuer_txs.clone())
        }
        async fn book_offers(&self, _: Value, _: Value) -> Result<Vec<BookOffer>> {
            Ok(vec![])
        }
        async fn account_info(&self, _: &str) -> Result<AccountInfo> {
            Ok(AccountInfo { sequence: 1 })
        }
        async fn submit(&self, _: &str) -> Result<SubmitResult> {
            Ok(SubmitResult {
                engine_result: "tesSUCCESS".to_string(),
                accepted: true,
            })
        }
    }

    fn ledger_seconds_ago(hours: i64) -> i64 {
        (Utc::now() - ChronoDuration::hours(hours)).timestamp() - LEDGER_EPOCH_OFFSET
    }

    fn token() -> TokenId {
        TokenId::new("TST", "rIssuer")
    }

    async fn seed_pending(store: &Arc<MemoryStore>) {
        store.mark_token(&token(), TokenStatus::Pending).await.unwrap();
        store
            .upsert_token_state(
                &token(),
                TokenStatePatch {
                    first_seen_tx: Some("h_first".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_old_token_marked_too_old() {
        // Discovered 24h ago with a 12h window
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        seed_pending(&store).await;

        let rpc = Arc::new(FakeRpc {
            tx_date: Some(ledger_seconds_ago(24)),
            issuer_txs: vec![],
        });
        let analyzer = TokenAnalyzer::new(
            &AnalyticsConfig::default(),
            store.clone() as Arc<dyn Store>,
            rpc,
        );
        analyzer.run_cycle().await;

        let state = store.get_token_state(&token()).await.unwrap().unwrap();
        assert_eq!(state.status, TokenStatus::TooOld);
    }

    #[tokio::test]
    async fn test_young_token_activated_with_issuer_details() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        seed_pending(&store).await;

        let creation = ledger_seconds_ago(3);
        let rpc = Arc::new(FakeRpc {
            tx_date: Some(ledger_seconds_ago(2)),
            issuer_txs: vec![
                LedgerTxSummary {
                    transaction_type: Some("AccountSet".to_string()),
                    account: Some("rCreator".to_string()),
                    flags: Some(FLAG_GLOBAL_FREEZE),
                    date: Some(creation),
                    hash: Some("h0".to_string()),
                },
                LedgerTxSummary {
                    transaction_type: Some("TrustSet".to_string()),
                    account: Some("rHolder1".to_string()),
                    flags: None,
                    date: Some(creation + 60),
                    hash: Some("h1".to_string()),
                },
                LedgerTxSummary {
                    transaction_type: Some("TrustSet".to_string()),
                    account: Some("rHolder2".to_string()),
                    flags: None,
                    date: Some(creation + 120),
                    hash: Some("h2".to_string()),
                },
            ],
        });
        let analyzer = TokenAnalyzer::new(
            &AnalyticsConfig::default(),
            store.clone() as Arc<dyn Store>,
            rpc,
        );
        analyzer.run_cycle().await;

        let state = store.get_token_state(&token()).await.unwrap().unwrap();
        assert_eq!(state.status, TokenStatus::Active);
        assert_eq!(state.creator.as_deref(), Some("rCreator"));
        assert_eq!(state.unique_holders, 2);
        assert!(state.is_frozen);
        assert!(state.creation_date.is_some());
    }

    #[tokio::test]
    async fn test_too_old_never_reactivated() {
        // A later cycle that finds a young-looking date must not resurrect it
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        seed_pending(&store).await;
        store.mark_token(&token(), TokenStatus::TooOld).await.unwrap();

        let rpc = Arc::new(FakeRpc {
            tx_date: Some(ledger_seconds_ago(1)),
            issuer_txs: vec![],
        });
        let analyzer = TokenAnalyzer::new(
            &AnalyticsConfig::default(),
            store.clone() as Arc<dyn Store>,
            rpc,
        );
        analyzer.run_cycle().await;

        let state = store.get_token_state(&token()).await.unwrap().unwrap();
        assert_eq!(state.status, TokenStatus::TooOld);
    }

    #[tokio::test]
    async fn test_unknown_age_skips_analysis() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        seed_pending(&store).await;

        let rpc = Arc::new(FakeRpc {
            tx_date: None,
            issuer_txs: vec![],
        });
        let analyzer = TokenAnalyzer::new(
            &AnalyticsConfig::default(),
            store.clone() as Arc<dyn Store>,
            rpc,
        );
        analyzer.run_cycle().await;

        let state = store.get_token_state(&token()).await.unwrap().unwrap();
        assert_eq!(state.status, TokenStatus::Pending);
    }
}
