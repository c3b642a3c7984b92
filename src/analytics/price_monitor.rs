//! Order-book price polling
//!
//! Iterates the active tokens on a fixed interval, reading the best
//! native->token offer. Every successful sample becomes a price point and
//! the new current price; the max price never falls below the current price,
//! while the hysteresis threshold decides which moves are reported as new
//! highs. A per-token wait throttles the request rate.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::analytics::{fetch_best_price, record_price_observation};
use crate::config::AnalyticsConfig;
use crate::ledger::rpc::LedgerRpc;
use crate::store::Store;

pub struct PriceMonitor {
    store: Arc<dyn Store>,
    rpc: Arc<dyn LedgerRpc>,
    poll_interval: Duration,
    wait_between_queries: Duration,
    /// Fractional move over the previous max that counts as a new high
    min_price_change: Decimal,
}

impl PriceMonitor {
    pub fn new(config: &AnalyticsConfig, store: Arc<dyn Store>, rpc: Arc<dyn LedgerRpc>) -> Self {
        Self {
            store,
            rpc,
            poll_interval: Duration::from_secs(config.price_check_interval_minutes * 60),
            wait_between_queries: Duration::from_secs(config.wait_between_queries_seconds),
            min_price_change: config.min_price_change,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Starting price monitor");
        loop {
            self.run_cycle(&cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.poll_interval) => {}
            }
        }
        info!("Price monitor stopped");
    }

    /// One polling pass over the active tokens
    pub async fn run_cycle(&self, cancel: &CancellationToken) {
        let tokens = match self.store.get_active_tokens(None, None).await {
            Ok(tokens) => tokens,
            Err(e) => {
                error!("Failed to list active tokens: {}", e);
                return;
            }
        };
        if tokens.is_empty() {
            return;
        }
        info!("Checking prices for {} tokens", tokens.len());

        for token in tokens {
            if cancel.is_cancelled() {
                return;
            }

            match fetch_best_price(self.rpc.as_ref(), &token).await {
                Ok(Some(price)) => {
                    debug!("{}: current price {}", token, price);
                    match record_price_observation(&self.store, &token, price, Utc::now()).await {
                        Ok(previous_max) => self.report_move(&token, price, previous_max),
                        Err(e) => error!("Failed to record price for {}: {}", token, e),
                    }
                }
                Ok(None) => debug!("No offers for {}", token),
                Err(e) => error!("Price check failed for {}: {}", token, e),
            }

            // Spacing between per-token queries keeps us under rate limits
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(self.wait_between_queries) => {}
            }
        }
    }

    fn report_move(&self, token: &crate::parser::TokenId, price: Decimal, previous_max: Option<Decimal>) {
        match previous_max {
            None => info!("First price for {}: {}", token, price),
            Some(previous) => {
                let threshold = previous * (Decimal::ONE + self.min_price_change);
                if price > threshold {
                    info!("New max price for {}: {} (prev {})", token, price, previous);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::ledger::types::{
        AccountInfo, Amount, BookOffer, IssuedCurrency, LedgerTxSummary, SubmitResult, TxLookup,
    };
    use crate::parser::TokenId;
    use crate::store::{MemoryStore, TokenStatus};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    struct ScriptedBook {
        prices: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl LedgerRpc for ScriptedBook {
        async fn tx(&self, _: &str) -> Result<TxLookup> {
            Ok(TxLookup::default())
        }
        async fn account_tx(&self, _: &str, _: u32) -> Result<Vec<LedgerTxSummary>> {
            Ok(vec![])
        }
        async fn book_offers(&self, _: Value, _: Value) -> Result<Vec<BookOffer>> {
            let mut prices = self.prices.lock().unwrap();
            if prices.is_empty() {
                return Ok(vec![]);
            }
            let (drops, tokens) = prices.remove(0);
            Ok(vec![BookOffer {
                taker_gets: Amount::Drops(drops),
                taker_pays: Amount::Issued(IssuedCurrency {
                    currency: "TST".to_string(),
                    issuer: Some("rIssuer".to_string()),
                    value: tokens,
                }),
            }])
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

    fn token() -> TokenId {
        TokenId::new("TST", "rIssuer")
    }

    async fn active_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.mark_token(&token(), TokenStatus::Active).await.unwrap();
        store
    }

    fn monitor(store: Arc<MemoryStore>, prices: Vec<(&str, &str)>) -> PriceMonitor {
        let rpc = Arc::new(ScriptedBook {
            prices: Mutex::new(
                prices
                    .into_iter()
                    .map(|(drops, tokens)| (drops.to_string(), tokens.to_string()))
                    .collect(),
            ),
        });
        let config = AnalyticsConfig {
            wait_between_queries_seconds: 0,
            ..AnalyticsConfig::default()
        };
        PriceMonitor::new(&config, store as Arc<dyn Store>, rpc)
    }

    #[tokio::test]
    async fn test_sample_sets_current_and_max() {
        let store = active_store().await;
        // 100 native for 1000 tokens: 0.1 per token
        let monitor = monitor(store.clone(), vec![("100000000", "1000")]);
        monitor.run_cycle(&CancellationToken::new()).await;

        let state = store.get_token_state(&token()).await.unwrap().unwrap();
        assert_eq!(state.current_price, Some("0.1".parse().unwrap()));
        assert_eq!(state.max_price, Some("0.1".parse().unwrap()));
        assert_eq!(
            store.get_price_history(&token(), None, None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_max_never_below_current() {
        // Moves inside the hysteresis band still keep max >= current
        let store = active_store().await;
        let monitor = monitor(
            store.clone(),
            vec![("100000000", "1000"), ("103000000", "1000")],
        );
        let cancel = CancellationToken::new();
        monitor.run_cycle(&cancel).await;
        monitor.run_cycle(&cancel).await;

        let state = store.get_token_state(&token()).await.unwrap().unwrap();
        let current = state.current_price.unwrap();
        let max = state.max_price.unwrap();
        assert_eq!(current, "0.103".parse().unwrap());
        assert!(max >= current, "max {} must cover current {}", max, current);
    }

    #[tokio::test]
    async fn test_price_drop_keeps_max() {
        let store = active_store().await;
        let monitor = monitor(
            store.clone(),
            vec![("100000000", "1000"), ("50000000", "1000")],
        );
        let cancel = CancellationToken::new();
        monitor.run_cycle(&cancel).await;
        monitor.run_cycle(&cancel).await;

        let state = store.get_token_state(&token()).await.unwrap().unwrap();
        assert_eq!(state.current_price, Some("0.05".parse().unwrap()));
        assert_eq!(state.max_price, Some("0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_empty_book_changes_nothing() {
        let store = active_store().await;
        let monitor = monitor(store.clone(), vec![]);
        monitor.run_cycle(&CancellationToken::new()).await;

        let state = store.get_token_state(&token()).await.unwrap().unwrap();
        assert_eq!(state.current_price, None);
        assert_eq!(state.max_price, None);
    }
}
